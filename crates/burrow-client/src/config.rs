//! Tunnel client configuration.
//!
//! User-supplied options are normalized once, at the boundary, into a
//! canonical [`TunnelConfig`]. Nothing downstream re-validates.

use std::path::PathBuf;

use url::Url;

use crate::error::ConfigError;

/// Default public relay when no override is given.
pub const DEFAULT_RELAY_ORIGIN: &str = "https://localtunnel.me";

/// Certificate material for a TLS downstream leg. Certificate and key are
/// jointly required; the CA bundle is optional.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: Option<PathBuf>,
}

/// TLS options for the downstream leg.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Accept any certificate the local service presents.
    pub skip_certificate_validation: bool,
    /// Client certificate material presented to the local service.
    pub cert: Option<CertPaths>,
}

/// User-supplied, partial configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Local origin to expose, e.g. `http://localhost:3000`.
    pub local_url: String,
    /// Relay origin override. Defaults to the public relay.
    pub relay_origin: Option<String>,
    /// Requested subdomain. `None` means "assign randomly".
    pub subdomain: Option<String>,
    /// TLS options; only valid when the local origin is https.
    pub tls: Option<TlsOptions>,
}

impl ClientOptions {
    /// Options for a plain-http local origin with all defaults.
    pub fn new(local_url: impl Into<String>) -> Self {
        Self {
            local_url: local_url.into(),
            relay_origin: None,
            subdomain: None,
            tls: None,
        }
    }
}

/// Canonical, fully-populated configuration. Immutable after resolution.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub local_host: String,
    pub local_port: u16,
    /// TLS settings for the downstream leg; `Some` iff the origin is https.
    pub tls: Option<TlsOptions>,
    pub relay_origin: Url,
    /// `None` requests a randomly assigned subdomain.
    pub subdomain: Option<String>,
}

impl TunnelConfig {
    /// Normalize user options into a canonical configuration.
    ///
    /// Rejects local origin URLs that carry a non-root path, a query
    /// string, or a fragment: the tunnel addresses an origin, not a
    /// resource.
    pub fn resolve(options: ClientOptions) -> Result<Self, ConfigError> {
        let local = Url::parse(&options.local_url)
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        let https = match local.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        if !matches!(local.path(), "" | "/") || local.query().is_some() || local.fragment().is_some()
        {
            return Err(ConfigError::NonRootOrigin);
        }
        let local_host = local
            .host_str()
            .ok_or(ConfigError::MissingHost)?
            .to_string();
        let local_port = local
            .port()
            .unwrap_or(if https { 443 } else { 80 });

        let tls = match (https, options.tls) {
            (false, Some(_)) => return Err(ConfigError::TlsForPlainOrigin),
            (false, None) => None,
            (true, tls) => Some(tls.unwrap_or_default()),
        };

        let relay_origin = Url::parse(
            options
                .relay_origin
                .as_deref()
                .unwrap_or(DEFAULT_RELAY_ORIGIN),
        )
        .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            local_host,
            local_port,
            tls,
            relay_origin,
            subdomain: options.subdomain,
        })
    }

    /// Whether the downstream leg uses TLS.
    pub const fn https(&self) -> bool {
        self.tls.is_some()
    }

    /// Scheme-implied default port for the local origin.
    const fn default_port(&self) -> u16 {
        if self.https() { 443 } else { 80 }
    }

    /// Full local origin, always carrying the port.
    pub fn local_address(&self) -> String {
        let scheme = if self.https() { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.local_host, self.local_port)
    }

    /// Value written into rewritten `Host:` headers. The port is omitted
    /// when it is the scheme-implied default.
    pub fn host_header_value(&self) -> String {
        if self.local_port == self.default_port() {
            self.local_host.clone()
        } else {
            format!("{}:{}", self.local_host, self.local_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_origin_with_port_resolves() {
        let config = TunnelConfig::resolve(ClientOptions::new("http://localhost:3000")).unwrap();
        assert_eq!(config.local_host, "localhost");
        assert_eq!(config.local_port, 3000);
        assert!(!config.https());
        assert_eq!(config.relay_origin.as_str(), "https://localtunnel.me/");
        assert!(config.subdomain.is_none());
    }

    #[test]
    fn port_defaults_from_scheme() {
        let plain = TunnelConfig::resolve(ClientOptions::new("http://localhost")).unwrap();
        assert_eq!(plain.local_port, 80);

        let mut options = ClientOptions::new("https://localhost");
        options.tls = Some(TlsOptions::default());
        let tls = TunnelConfig::resolve(options).unwrap();
        assert_eq!(tls.local_port, 443);
        assert!(tls.https());
    }

    #[test]
    fn root_path_is_accepted() {
        assert!(TunnelConfig::resolve(ClientOptions::new("http://localhost:3000/")).is_ok());
    }

    #[test]
    fn non_root_path_is_rejected() {
        let err =
            TunnelConfig::resolve(ClientOptions::new("http://localhost:3000/api")).unwrap_err();
        assert_eq!(err, ConfigError::NonRootOrigin);
    }

    #[test]
    fn query_is_rejected() {
        let err =
            TunnelConfig::resolve(ClientOptions::new("http://localhost:3000?x=1")).unwrap_err();
        assert_eq!(err, ConfigError::NonRootOrigin);
    }

    #[test]
    fn fragment_is_rejected() {
        let err =
            TunnelConfig::resolve(ClientOptions::new("http://localhost:3000#frag")).unwrap_err();
        assert_eq!(err, ConfigError::NonRootOrigin);
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = TunnelConfig::resolve(ClientOptions::new("ftp://localhost")).unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedScheme("ftp".into()));
    }

    #[test]
    fn tls_options_require_https_origin() {
        let mut options = ClientOptions::new("http://localhost:3000");
        options.tls = Some(TlsOptions::default());
        let err = TunnelConfig::resolve(options).unwrap_err();
        assert_eq!(err, ConfigError::TlsForPlainOrigin);
    }

    #[test]
    fn https_origin_without_tls_options_gets_defaults() {
        let config = TunnelConfig::resolve(ClientOptions::new("https://localhost:8443")).unwrap();
        let tls = config.tls.as_ref().unwrap();
        assert!(!tls.skip_certificate_validation);
        assert!(tls.cert.is_none());
    }

    #[test]
    fn host_header_omits_default_port() {
        let config = TunnelConfig::resolve(ClientOptions::new("http://localhost:80")).unwrap();
        assert_eq!(config.host_header_value(), "localhost");

        let config = TunnelConfig::resolve(ClientOptions::new("http://localhost:3000")).unwrap();
        assert_eq!(config.host_header_value(), "localhost:3000");

        let config = TunnelConfig::resolve(ClientOptions::new("https://localhost:443")).unwrap();
        assert_eq!(config.host_header_value(), "localhost");
    }

    #[test]
    fn local_address_always_carries_the_port() {
        let config = TunnelConfig::resolve(ClientOptions::new("http://localhost")).unwrap();
        assert_eq!(config.local_address(), "http://localhost:80");
    }
}
