//! Listening socket setup shared by both server models.

use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::ConfigError;

/// Where to listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ListenTarget {
    /// Bare TCP port on all interfaces.
    Port(u16),
    /// Explicit socket address.
    Addr(SocketAddr),
}

impl ListenTarget {
    pub fn socket_addr(&self) -> SocketAddr {
        match *self {
            ListenTarget::Port(port) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            ListenTarget::Addr(addr) => addr,
        }
    }
}

impl FromStr for ListenTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(port) = s.parse::<u16>() {
            return Ok(ListenTarget::Port(port));
        }
        s.parse::<SocketAddr>()
            .map(ListenTarget::Addr)
            .map_err(|_| ConfigError::ListenTarget(s.to_string()))
    }
}

impl TryFrom<String> for ListenTarget {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Listener and per-connection limits common to both server models.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub target: ListenTarget,
    /// Pending-accept queue length passed to `listen(2)`.
    pub backlog: i32,
    /// Largest inbound payload accepted before the connection is dropped.
    pub max_frame_len: u32,
    /// Live connections (reactor slots or threads) allowed at once.
    pub max_connections: usize,
    /// Size of the per-read scratch buffer.
    pub read_buffer_size: usize,
    /// Readiness events collected per poll (reactor only).
    pub event_capacity: usize,
}

pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_BACKLOG: i32 = 1024;
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            target: ListenTarget::Port(DEFAULT_PORT),
            backlog: DEFAULT_BACKLOG,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ListenerConfig {
    pub fn new(target: ListenTarget) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }
}

/// Create a bound, listening TCP socket with `SO_REUSEADDR`.
pub fn bind(config: &ListenerConfig, nonblocking: bool) -> io::Result<std::net::TcpListener> {
    let addr = config.target.socket_addr();
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    Ok(socket.into())
}

/// Source of accepted connections.
pub(crate) trait Accept {
    type Stream;

    fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;
}

impl Accept for std::net::TcpListener {
    type Stream = std::net::TcpStream;

    fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        std::net::TcpListener::accept(self)
    }
}

impl Accept for mio::net::TcpListener {
    type Stream = mio::net::TcpStream;

    fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        mio::net::TcpListener::accept(self)
    }
}

/// Accept errors caused by a single pending connection rather than the
/// listener or the process; the next `accept` can be tried immediately.
pub(crate) fn is_per_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::PermissionDenied
    )
}
