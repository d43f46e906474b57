//! HTTP `CONNECT` proxy tunneling.
//!
//! When an association must traverse a web proxy,
//! the transport first issues a plain-text HTTP/1.1 `CONNECT` request
//! for the target host and port,
//! optionally carrying Basic proxy credentials,
//! and only proceeds with the DICOM (or TLS) byte stream
//! after the proxy answers with a `2xx` status line.
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use base64::Engine as _;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not send the CONNECT request to the proxy
    SendRequest {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not read the proxy's response
    ReceiveResponse {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the proxy closed the connection before answering
    ClosedByProxy { backtrace: Backtrace },

    #[snafu(display("malformed proxy status line `{}`", line))]
    MalformedStatusLine { line: String, backtrace: Backtrace },

    #[snafu(display("proxy refused the tunnel: {}", status))]
    Refused { status: String, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for tunneling an association through an HTTP proxy.
///
/// # Example
///
/// ```
/// # use dicom_net::transport::ProxyOptions;
/// let proxy = ProxyOptions::new("proxy.intra.hospital.org:8080")
///     .basic_auth("modality", "s3cret");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    address: String,
    credentials: Option<(String, String)>,
}

impl ProxyOptions {
    /// Define a proxy by its `host:port` address.
    pub fn new(address: impl Into<String>) -> Self {
        ProxyOptions {
            address: address.into(),
            credentials: None,
        }
    }

    /// Attach Basic credentials to the `CONNECT` request.
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// The `host:port` address of the proxy itself.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Perform the `CONNECT` handshake on a freshly opened stream to the proxy,
/// requesting a tunnel to `target` (a `host:port` pair).
///
/// On success, the stream is ready to carry the upper layer protocol.
pub(crate) fn tunnel(socket: &mut TcpStream, target: &str, options: &ProxyOptions) -> Result<()> {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some((user, password)) = &options.credentials {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, password).as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    socket
        .write_all(request.as_bytes())
        .context(SendRequestSnafu)?;
    socket.flush().context(SendRequestSnafu)?;

    // a buffered reader is safe here:
    // the proxy will not send tunneled bytes before we do
    let mut reader = BufReader::new(socket);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .context(ReceiveResponseSnafu)?;
    ensure!(!status_line.is_empty(), ClosedByProxySnafu);

    let status = parse_status_line(&status_line)?;
    ensure!(
        (200..300).contains(&status),
        RefusedSnafu {
            status: status_line.trim().to_string(),
        }
    );

    // drain the remaining response headers up to the empty line
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).context(ReceiveResponseSnafu)?;
        ensure!(n > 0, ClosedByProxySnafu);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(())
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    ensure!(
        version.starts_with("HTTP/1.") && code.len() == 3,
        MalformedStatusLineSnafu {
            line: line.trim().to_string(),
        }
    );
    code.parse().ok().with_context(|| MalformedStatusLineSnafu {
        line: line.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn parses_status_lines() {
        assert_eq!(parse_status_line("HTTP/1.1 200 Connection established\r\n").ok(), Some(200));
        assert_eq!(parse_status_line("HTTP/1.0 407 Proxy Authentication Required\r\n").ok(), Some(407));
        assert!(parse_status_line("SSH-2.0-OpenSSH\r\n").is_err());
    }

    /// Exercise the handshake against a minimal in-process proxy.
    #[test]
    fn tunnel_handshake_with_credentials() {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" {
                    break;
                }
                request.push(line.trim().to_string());
            }
            let mut stream = stream;
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .unwrap();
            request
        });

        let mut socket = TcpStream::connect(addr).unwrap();
        let options = ProxyOptions::new(addr.to_string()).basic_auth("user", "pass");
        tunnel(&mut socket, "pacs.example.com:104", &options).unwrap();

        let request = server.join().unwrap();
        assert_eq!(request[0], "CONNECT pacs.example.com:104 HTTP/1.1");
        assert!(request.contains(&"Host: pacs.example.com:104".to_string()));
        // dXNlcjpwYXNz = base64("user:pass")
        assert!(request.contains(&"Proxy-Authorization: Basic dXNlcjpwYXNz".to_string()));
    }

    #[test]
    fn tunnel_refused_by_proxy() {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").unwrap();
        });

        let mut socket = TcpStream::connect(addr).unwrap();
        let options = ProxyOptions::new(addr.to_string());
        let err = tunnel(&mut socket, "pacs.example.com:104", &options).unwrap_err();
        assert!(matches!(err, Error::Refused { .. }));
        server.join().unwrap();
    }
}
