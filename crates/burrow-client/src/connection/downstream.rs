//! Downstream connection factory: this client to the local service.
//!
//! Plain TCP, or TLS when the local origin is https. Certificate material
//! is loaded from disk at connect time. Connection-refused rejects fast;
//! it is the signal that feeds the fallback decision.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
};
use tracing::debug;

use crate::config::{TlsOptions, TunnelConfig};
use crate::error::{TunnelError, TunnelLeg};

/// A connected downstream socket, plain or TLS.
#[derive(Debug)]
pub enum DownstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DownstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DownstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open one downstream socket against the configured local origin.
pub async fn connect(config: &TunnelConfig) -> Result<DownstreamStream, TunnelError> {
    debug!(address = %config.local_address(), "establishing downstream connection");

    let target = (config.local_host.as_str(), config.local_port);
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| TunnelError::from_io(TunnelLeg::Downstream, &e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| TunnelError::from_io(TunnelLeg::Downstream, &e))?;

    let Some(tls) = &config.tls else {
        debug!(address = %config.local_address(), "downstream connection up");
        return Ok(DownstreamStream::Plain(stream));
    };

    let tls_config = build_tls_config(tls).map_err(|e| TunnelError {
        leg: TunnelLeg::Downstream,
        severity: crate::error::Severity::Unknown,
        reason: "ETLS".into(),
        detail: if cfg!(debug_assertions) { Some(e) } else { None },
    })?;
    let server_name = resolve_server_name(&config.local_host)
        .map_err(|e| TunnelError::from_io(TunnelLeg::Downstream, &e))?;

    let connector = TlsConnector::from(tls_config);
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TunnelError::from_io(TunnelLeg::Downstream, &e))?;

    debug!(address = %config.local_address(), "downstream TLS connection up");
    Ok(DownstreamStream::Tls(Box::new(tls_stream)))
}

/// Build the rustls client config from the configured TLS material.
fn build_tls_config(tls: &TlsOptions) -> Result<Arc<ClientConfig>, String> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(paths) = &tls.cert
        && let Some(ca_path) = &paths.ca
    {
        let ca_pem = std::fs::read(ca_path)
            .map_err(|e| format!("read CA bundle {}: {e}", ca_path.display()))?;
        for cert in CertificateDer::pem_slice_iter(&ca_pem) {
            let cert = cert.map_err(|e| format!("parse CA certificate: {e:?}"))?;
            root_store
                .add(cert)
                .map_err(|e| format!("add CA certificate: {e}"))?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let mut config = if let Some(paths) = &tls.cert {
        let cert_pem = std::fs::read(&paths.cert)
            .map_err(|e| format!("read certificate {}: {e}", paths.cert.display()))?;
        let certs: Result<Vec<_>, _> = CertificateDer::pem_slice_iter(&cert_pem).collect();
        let certs = certs.map_err(|e| format!("parse certificate: {e:?}"))?;
        let key_pem = std::fs::read(&paths.key)
            .map_err(|e| format!("read key {}: {e}", paths.key.display()))?;
        let key = PrivateKeyDer::from_pem_slice(&key_pem)
            .map_err(|e| format!("parse private key: {e:?}"))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| format!("client certificate rejected: {e}"))?
    } else {
        builder.with_no_client_auth()
    };

    if tls.skip_certificate_validation {
        debug!("allowing invalid downstream certificates");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(Arc::new(config))
}

fn resolve_server_name(host: &str) -> io::Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Verifier accepting any certificate, for `skip_certificate_validation`.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
