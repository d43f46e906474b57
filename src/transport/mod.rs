//! Transport layer for DICOM upper layer sessions.
//!
//! This module opens and wraps the byte stream an association runs on:
//! plain TCP, TLS over TCP (Cargo feature `tls`),
//! or either of them tunneled through an HTTP `CONNECT` proxy.
//! It also carries the socket-level timeout configuration
//! applied at each phase of the session.
pub mod proxy;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub use proxy::ProxyOptions;

/// Socket-level timeouts for one association.
///
/// Each wait state of the session state machine is bound to one of these:
/// `connect_timeout` while the transport is being opened,
/// `response_timeout` while waiting for the association response,
/// `read_timeout` while waiting for PDU traffic once established,
/// `write_timeout` for every outbound PDU,
/// and `release_timeout` while waiting for the release reply.
/// Expiry of any of them forces an A-ABORT.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// timeout for establishing the TCP connection
    pub connect_timeout: Option<Duration>,
    /// timeout for the A-ASSOCIATE response after sending the request
    pub response_timeout: Option<Duration>,
    /// timeout for reading a PDU from the peer while established
    pub read_timeout: Option<Duration>,
    /// timeout for writing a PDU to the peer
    pub write_timeout: Option<Duration>,
    /// timeout for the A-RELEASE-RP reply after requesting a release
    pub release_timeout: Option<Duration>,
}

/// Interface of the byte streams an association can run on.
///
/// Implementations expose the socket-level controls the state machine
/// needs regardless of stream flavor:
/// adjusting the read timeout between session phases
/// and shutting the transport down on abort.
pub trait TransportStream: Read + Write + Send + 'static {
    /// Adjust the read timeout of the underlying socket.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Adjust the write timeout of the underlying socket.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Shut down both directions of the underlying socket.
    fn shutdown(&self) -> std::io::Result<()>;
}

impl TransportStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// A handle for controlling a split transport
/// independently of its reader and writer halves.
#[derive(Debug)]
pub struct TransportControl {
    sock: TcpStream,
}

impl TransportControl {
    /// Adjust the read timeout of the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    /// Shut down both directions of the underlying socket,
    /// unblocking any reader.
    pub fn shutdown(&self) -> std::io::Result<()> {
        self.sock.shutdown(Shutdown::Both)
    }
}

/// A transport stream which can hand out
/// independently owned reader and writer halves,
/// so that one thread can block on inbound PDUs
/// while others write.
pub trait SplitTransport: TransportStream {
    type ReadHalf: Read + Send + 'static;
    type WriteHalf: Write + Send + 'static;

    /// Obtain a reader half, a writer half,
    /// and a control handle over the underlying socket.
    fn try_split(&self) -> std::io::Result<(Self::ReadHalf, Self::WriteHalf, TransportControl)>;
}

impl SplitTransport for TcpStream {
    type ReadHalf = TcpStream;
    type WriteHalf = TcpStream;

    fn try_split(&self) -> std::io::Result<(Self::ReadHalf, Self::WriteHalf, TransportControl)> {
        Ok((
            self.try_clone()?,
            self.try_clone()?,
            TransportControl {
                sock: self.try_clone()?,
            },
        ))
    }
}

/// Open a TCP connection to the first address `addr` resolves to,
/// honoring the connect timeout,
/// and apply the configured read and write timeouts.
pub(crate) fn connect_tcp<A: ToSocketAddrs>(
    addr: A,
    options: &TransportOptions,
) -> std::io::Result<TcpStream> {
    let socket = match options.connect_timeout {
        Some(timeout) => {
            let mut last_err = None;
            let mut socket = None;
            for addr in addr.to_socket_addrs()? {
                match TcpStream::connect_timeout(&addr, timeout) {
                    Ok(s) => {
                        socket = Some(s);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match socket {
                Some(s) => s,
                None => {
                    return Err(last_err.unwrap_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "could not resolve any socket address",
                        )
                    }))
                }
            }
        }
        None => TcpStream::connect(addr)?,
    };
    socket.set_read_timeout(options.read_timeout)?;
    socket.set_write_timeout(options.write_timeout)?;
    Ok(socket)
}

#[cfg(feature = "tls")]
mod tls {
    use super::{SplitTransport, TransportControl, TransportStream};
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    /// A synchronous TLS stream from the acceptor's perspective.
    pub type ServerTlsStream = rustls::StreamOwned<rustls::ServerConnection, TcpStream>;
    /// A shareable synchronous TLS stream from the requestor's perspective.
    pub type ClientTlsStream = SharedTlsStream<rustls::ClientConnection>;

    impl TransportStream for ServerTlsStream {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            self.sock.set_read_timeout(timeout)
        }

        fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            self.sock.set_write_timeout(timeout)
        }

        fn shutdown(&self) -> std::io::Result<()> {
            self.sock.shutdown(Shutdown::Both)
        }
    }

    /// A synchronous TLS stream behind a shareable lock.
    ///
    /// TLS record processing is not full duplex,
    /// so all handles to one stream share it behind a lock,
    /// while socket-level controls go through an independent
    /// handle to the underlying socket.
    /// Readers must run with a bounded socket read timeout
    /// (the DIMSE exchange layer enforces one)
    /// so that writers are not starved while no data arrives.
    pub struct SharedTlsStream<C> {
        inner: Arc<Mutex<rustls::StreamOwned<C, TcpStream>>>,
        sock: TcpStream,
    }

    impl<C> std::fmt::Debug for SharedTlsStream<C> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SharedTlsStream")
                .field("sock", &self.sock)
                .finish()
        }
    }

    impl<C> SharedTlsStream<C> {
        /// Wrap a TLS stream for shared use.
        pub fn new(stream: rustls::StreamOwned<C, TcpStream>) -> std::io::Result<Self> {
            let sock = stream.sock.try_clone()?;
            Ok(SharedTlsStream {
                inner: Arc::new(Mutex::new(stream)),
                sock,
            })
        }

        fn lock(&self) -> std::io::Result<MutexGuard<'_, rustls::StreamOwned<C, TcpStream>>> {
            self.inner.lock().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::Other, "TLS stream lock poisoned")
            })
        }

        fn try_clone(&self) -> std::io::Result<Self> {
            Ok(SharedTlsStream {
                inner: Arc::clone(&self.inner),
                sock: self.sock.try_clone()?,
            })
        }
    }

    impl<C> Read for SharedTlsStream<C>
    where
        rustls::StreamOwned<C, TcpStream>: Read,
    {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.lock()?.read(buf)
        }
    }

    impl<C> Write for SharedTlsStream<C>
    where
        rustls::StreamOwned<C, TcpStream>: Write,
    {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.lock()?.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.lock()?.flush()
        }
    }

    impl<C> TransportStream for SharedTlsStream<C>
    where
        C: Send + 'static,
        rustls::StreamOwned<C, TcpStream>: Read + Write,
    {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            self.sock.set_read_timeout(timeout)
        }

        fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            self.sock.set_write_timeout(timeout)
        }

        fn shutdown(&self) -> std::io::Result<()> {
            self.sock.shutdown(Shutdown::Both)
        }
    }

    impl<C> SplitTransport for SharedTlsStream<C>
    where
        C: Send + 'static,
        rustls::StreamOwned<C, TcpStream>: Read + Write,
    {
        type ReadHalf = SharedTlsStream<C>;
        type WriteHalf = SharedTlsStream<C>;

        fn try_split(&self) -> std::io::Result<(Self::ReadHalf, Self::WriteHalf, TransportControl)> {
            Ok((
                self.try_clone()?,
                self.try_clone()?,
                TransportControl {
                    sock: self.sock.try_clone()?,
                },
            ))
        }
    }
}

#[cfg(feature = "tls")]
pub use tls::{ClientTlsStream, ServerTlsStream, SharedTlsStream};
