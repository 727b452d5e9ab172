//! Server runtimes for the milter transport.
//!
//! Two scheduling models drive the same connection state machine:
//! - `reactor`: one thread multiplexing every socket with mio
//!   (epoll on Linux, kqueue on macOS)
//! - `threaded`: one blocking OS thread per connection
//!
//! Both share common abstractions:
//! - `Connection`: framing, dispatch and output buffering for one socket
//! - `listener`: socket setup and accept-error handling

mod connection;
mod listener;
mod reactor;
mod threaded;

pub use connection::{ConnState, Connection, ReadStatus};
pub use listener::{
    ListenTarget, ListenerConfig, DEFAULT_BACKLOG, DEFAULT_EVENT_CAPACITY,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE,
};
pub use reactor::ReactorServer;
pub use threaded::ThreadedServer;

use serde::Deserialize;
use std::io;
use std::net::SocketAddr;

use crate::dispatcher::DispatcherFactory;

/// Scheduling model, chosen at server construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single thread, cooperative multiplexing over all connections.
    #[default]
    Reactor,
    /// One OS thread per connection with blocking I/O.
    Threaded,
}

/// A server running under either scheduling model.
pub enum Server<F, C>
where
    F: DispatcherFactory<C>,
{
    Reactor(ReactorServer<F, C>),
    Threaded(ThreadedServer<F, C>),
}

impl<F, C> Server<F, C>
where
    F: DispatcherFactory<C> + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Bind a listener for the selected runtime.
    pub fn bind(
        runtime: RuntimeType,
        config: ListenerConfig,
        factory: F,
        context: C,
    ) -> io::Result<Self> {
        Ok(match runtime {
            RuntimeType::Reactor => Server::Reactor(ReactorServer::bind(config, factory, context)?),
            RuntimeType::Threaded => {
                Server::Threaded(ThreadedServer::bind(config, factory, context)?)
            }
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Reactor(server) => server.local_addr(),
            Server::Threaded(server) => server.local_addr(),
        }
    }

    /// Serve forever on the current thread.
    pub fn serve(self) -> io::Result<()> {
        match self {
            Server::Reactor(server) => server.serve(),
            Server::Threaded(server) => server.serve(),
        }
    }
}
