//! The persistent, reconnecting carbon socket.
//!
//! [`CarbonLink`] owns at most one open connection and the time it was
//! dialed. A connection is reused until it is older than the reconnect
//! interval, then closed and redialed; a failed dial leaves the link
//! disconnected so the next write dials again. Callers serialize access
//! through a mutex, which makes the link the single writer to carbon.

use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::CarbonTransport;
use crate::error::WriteError;

/// An open connection to carbon.
#[derive(Debug)]
pub enum CarbonConnection {
    /// A TCP stream.
    Tcp(TcpStream),
    /// A connected UDP socket; every `write` is one datagram.
    Udp(UdpSocket),
}

impl CarbonConnection {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.local_addr(),
            Self::Udp(socket) => socket.local_addr(),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr(),
            Self::Udp(socket) => socket.peer_addr(),
        }
    }
}

impl fmt::Display for CarbonConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => write!(f, "{local}->{peer}"),
            _ => f.write_str("<disconnected>"),
        }
    }
}

impl Write for CarbonConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Udp(socket) => socket.send(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Udp(_) => Ok(()),
        }
    }
}

/// Connection state for one carbon endpoint.
#[derive(Debug)]
pub struct CarbonLink {
    address: String,
    transport: CarbonTransport,
    dial_timeout: Duration,
    reconnect_interval: Duration,
    connection: Option<CarbonConnection>,
    last_reconnect: Option<Instant>,
}

impl CarbonLink {
    /// Creates a disconnected link. Nothing is dialed until
    /// [`connect`](Self::connect).
    pub fn new(
        address: impl Into<String>,
        transport: CarbonTransport,
        dial_timeout: Duration,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            transport,
            dial_timeout,
            reconnect_interval,
            connection: None,
            last_reconnect: None,
        }
    }

    /// The configured `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns true if a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Returns true if [`connect`](Self::connect) at `now` would dial.
    pub fn should_reconnect(&self, now: Instant) -> bool {
        self.connection.is_none()
            || self
                .last_reconnect
                .is_none_or(|last| now.saturating_duration_since(last) >= self.reconnect_interval)
    }

    /// Returns the open connection, dialing first if there is none or the
    /// current one has outlived the reconnect interval.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Resolve`] or [`WriteError::Connect`] if dialing
    /// fails. The link is left disconnected.
    pub fn connect(&mut self) -> Result<&mut CarbonConnection, WriteError> {
        let now = Instant::now();
        let expired = self.should_reconnect(now);

        let connection = match self.connection.take() {
            Some(connection) if !expired => connection,
            stale => {
                if let Some(stale) = stale {
                    debug!(connection = %stale, last = ?self.last_reconnect, "reinitializing the connection to carbon");
                }
                debug!(
                    transport = self.transport.as_str(),
                    address = %self.address,
                    timeout = ?self.dial_timeout,
                    "connecting to carbon"
                );
                let connection = self.dial()?;
                self.last_reconnect = Some(now);
                connection
            }
        };
        Ok(self.connection.insert(connection))
    }

    /// Closes the current connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(connection = %connection, "closing carbon connection");
        }
    }

    fn dial(&self) -> Result<CarbonConnection, WriteError> {
        let addrs: Vec<SocketAddr> = self
            .address
            .to_socket_addrs()
            .map_err(|source| WriteError::Connect {
                address: self.address.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(WriteError::Resolve {
                address: self.address.clone(),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            let attempt = match self.transport {
                CarbonTransport::Tcp => {
                    TcpStream::connect_timeout(&addr, self.dial_timeout).map(CarbonConnection::Tcp)
                }
                CarbonTransport::Udp => dial_udp(addr).map(CarbonConnection::Udp),
            };
            match attempt {
                Ok(connection) => return Ok(connection),
                Err(e) => last_error = Some(e),
            }
        }

        Err(WriteError::Connect {
            address: self.address.clone(),
            source: last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
        })
    }
}

fn dial_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let unspecified = if addr.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    socket.connect(addr)?;
    Ok(socket)
}
