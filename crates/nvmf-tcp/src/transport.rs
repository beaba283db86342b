//! Byte-stream transports
//!
//! A [`Dialer`] opens a [`TransportConnection`] to the controller named in the
//! configuration. TCP is the only transport; the seam exists so the
//! connection logic can run over any reliable ordered stream.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use tracing::{debug, trace, warn};

use crate::config::{ConnectionConfig, TransportType};
use crate::error::{NvmeTcpError, NvmeTcpResult};

/// An established, reliable, ordered byte stream to a controller
pub trait TransportConnection: Send {
    /// Write all of `buf`
    fn send(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Fill all of `buf`; `UnexpectedEof` if the peer closes first
    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Close both directions
    fn shutdown(&mut self) -> io::Result<()>;

    /// Remote address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Opens transport connections
pub trait Dialer: Send {
    /// Transport this dialer speaks
    fn transport_type(&self) -> TransportType;

    /// Connect to the controller named by `config`
    fn dial(&self, config: &ConnectionConfig) -> NvmeTcpResult<Box<dyn TransportConnection>>;
}

/// Dialer for plain TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl TcpDialer {
    fn connect_one(addr: &SocketAddr, config: &ConnectionConfig) -> io::Result<TcpStream> {
        let stream = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(config.nodelay)?;
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        Ok(stream)
    }
}

impl Dialer for TcpDialer {
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn dial(&self, config: &ConnectionConfig) -> NvmeTcpResult<Box<dyn TransportConnection>> {
        let target = config.target();
        let addrs: Vec<SocketAddr> = target.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(NvmeTcpError::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", target),
            )));
        }

        let mut last_err = None;
        for addr in &addrs {
            match Self::connect_one(addr, config) {
                Ok(stream) => {
                    debug!("Connected to NVMe/TCP controller at {}", addr);
                    return Ok(Box::new(TcpConnection::new(stream)));
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(NvmeTcpError::Transport(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no address connected")
        })))
    }
}

/// TCP stream to a controller
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpConnection {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }
}

impl TransportConnection for TcpConnection {
    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        trace!("send {} bytes", buf.len());
        self.stream.write_all(buf)?;
        self.stream.flush()
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)?;
        trace!("received {} bytes", buf.len());
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_tcp_dial_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let config = ConnectionConfig::new("127.0.0.1", port)
            .with_io_timeout(Some(Duration::from_secs(5)));
        let mut conn = TcpDialer.dial(&config).unwrap();
        assert_eq!(conn.peer_addr().map(|a| a.port()), Some(port));

        conn.send(b"nvme").unwrap();
        let mut echo = [0u8; 4];
        conn.recv_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"nvme");

        server.join().unwrap();
        let mut more = [0u8; 1];
        let err = conn.recv_exact(&mut more).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        conn.shutdown().unwrap();
    }

    #[test]
    fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ConnectionConfig::new("127.0.0.1", port);
        assert!(matches!(
            TcpDialer.dial(&config),
            Err(NvmeTcpError::Transport(_))
        ));
        assert_eq!(TcpDialer.transport_type(), TransportType::Tcp);
    }
}
