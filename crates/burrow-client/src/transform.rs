//! Streaming `Host:` header rewrite.
//!
//! Applied to the upstream-to-downstream direction of a tunnel unit so the
//! local service sees a request matching its own virtual host. Bytes are
//! buffered until a complete header block (`\r\n\r\n`) is observed, which
//! keeps the rewrite correct when the relay delivers headers fragmented
//! across chunk boundaries. Only the first header block of a connection is
//! rewritten; everything after it passes through untouched.

/// Buffering cap. If no header terminator shows up within this many bytes
/// the stream is treated as non-HTTP and flushed unmodified.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Method and path observed on a pipe, for the request observability event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
}

enum State {
    Buffering(Vec<u8>),
    Passthrough,
}

/// Stateful per-connection rewriter.
pub struct HostRewrite {
    host_value: String,
    state: State,
}

impl HostRewrite {
    /// `host_value` is the configured host, with the port already omitted
    /// when it is the scheme-implied default.
    pub fn new(host_value: impl Into<String>) -> Self {
        Self {
            host_value: host_value.into(),
            state: State::Buffering(Vec::new()),
        }
    }

    /// Feed one upstream chunk. Returns the bytes to forward downstream
    /// (possibly empty while headers are still incomplete) and any request
    /// line observed in this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<u8>, Option<RequestLine>) {
        match &mut self.state {
            State::Buffering(buffer) => {
                buffer.extend_from_slice(chunk);

                if let Some(end) = find_header_end(buffer) {
                    let buffer = std::mem::take(buffer);
                    self.state = State::Passthrough;

                    let (block, rest) = buffer.split_at(end);
                    let request = parse_request_line(block);
                    let mut out = rewrite_host_line(block, &self.host_value);
                    out.extend_from_slice(rest);
                    (out, request)
                } else if buffer.len() > MAX_HEADER_BYTES {
                    // Not HTTP as far as we can tell; stop interfering.
                    let buffer = std::mem::take(buffer);
                    self.state = State::Passthrough;
                    (buffer, None)
                } else {
                    (Vec::new(), None)
                }
            }
            State::Passthrough => (chunk.to_vec(), parse_request_line(chunk)),
        }
    }
}

/// Index one past the `\r\n\r\n` terminator, if present.
fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Rewrite exactly the first line beginning (case-insensitively) with
/// `Host:`. All other bytes are copied through unchanged.
fn rewrite_host_line(block: &[u8], host_value: &str) -> Vec<u8> {
    let mut line_start = 0;
    for (i, w) in block.windows(2).enumerate() {
        if w != b"\r\n" {
            continue;
        }
        let line = &block[line_start..i];
        if line_start > 0 && line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
            let mut out = Vec::with_capacity(block.len());
            out.extend_from_slice(&block[..line_start]);
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(host_value.as_bytes());
            out.extend_from_slice(&block[i..]);
            return out;
        }
        line_start = i + 2;
    }
    block.to_vec()
}

/// Best-effort request-line parse: `METHOD SP path SP HTTP/x`.
pub fn parse_request_line(bytes: &[u8]) -> Option<RequestLine> {
    let line_end = bytes
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(bytes.len());
    let line = std::str::from_utf8(&bytes[..line_end]).ok()?;

    let mut parts = line.split(' ');
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;

    if method.is_empty()
        || !method.bytes().all(|b| b.is_ascii_uppercase())
        || !version.starts_with("HTTP/")
    {
        return None;
    }
    Some(RequestLine {
        method: method.to_string(),
        path: path.to_string(),
    })
}
