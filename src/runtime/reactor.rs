//! Single-threaded reactor server.
//!
//! Readiness-based model: one thread owns a mio `Poll` over the listener
//! and every connection socket, and performs non-blocking reads and writes
//! as sockets become ready. Connections are only touched from this thread,
//! so the registry needs no locking.
//!
//! A connection with unflushed output is not read until the output drains.
//! Each readiness turn reads at most `READ_BUDGET` times per connection; a
//! connection that still has input is revisited on the next loop iteration.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherFactory, Session};
use crate::error::ConnectionError;
use crate::runtime::connection::{
    panic_message, report_closed, Connection, ConnectionRegistry, ReadStatus,
};
use crate::runtime::listener::{self, is_per_connection_error, Accept, ListenerConfig};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Reads performed for one connection before yielding to the others.
const READ_BUDGET: usize = 16;

/// Per-connection state for the reactor.
struct ReactorConnection<D> {
    stream: TcpStream,
    conn: Connection<D>,
    interest: Interest,
}

/// What a connection needs after being driven.
enum Step {
    /// Wait for readiness with the given interest.
    Wait(Interest),
    /// Read budget exhausted with input possibly still queued.
    Yield,
    /// Connection is done and should be removed.
    Finished,
}

impl<D: Dispatcher> ReactorConnection<D> {
    /// Flush pending output, then read and dispatch until the socket would
    /// block, the budget runs out, or output backs up.
    fn drive(&mut self, scratch: &mut [u8]) -> Result<Step, ConnectionError> {
        if !self.conn.flush_to(&mut self.stream)? {
            return Ok(Step::Wait(Interest::WRITABLE));
        }
        if self.conn.is_closing() {
            return Ok(Step::Finished);
        }

        for _ in 0..READ_BUDGET {
            match self.conn.read_from(&mut self.stream, scratch)? {
                ReadStatus::Eof => return Ok(Step::Finished),
                ReadStatus::WouldBlock => return Ok(Step::Wait(Interest::READABLE)),
                ReadStatus::Data(_) => {
                    if !self.conn.flush_to(&mut self.stream)? {
                        return Ok(Step::Wait(Interest::WRITABLE));
                    }
                    if self.conn.is_closing() {
                        return Ok(Step::Finished);
                    }
                }
            }
        }
        Ok(Step::Yield)
    }
}

/// Connection-side state of the reactor, split from the listener so the
/// accept path can borrow both.
struct Reactor<F, C>
where
    F: DispatcherFactory<C>,
{
    poll: Poll,
    connections: ConnectionRegistry<ReactorConnection<F::Dispatcher>>,
    factory: F,
    context: Arc<C>,
    max_frame_len: u32,
    scratch: Vec<u8>,
    /// Connections that yielded with input possibly pending.
    deferred: Vec<usize>,
}

/// Single-threaded server multiplexing every connection over one `Poll`.
pub struct ReactorServer<F, C>
where
    F: DispatcherFactory<C>,
{
    listener: TcpListener,
    local_addr: SocketAddr,
    event_capacity: usize,
    reactor: Reactor<F, C>,
}

impl<F, C> ReactorServer<F, C>
where
    F: DispatcherFactory<C>,
{
    /// Bind the listening socket and register it with a new `Poll`.
    pub fn bind(config: ListenerConfig, factory: F, context: C) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener::bind(&config, true)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            event_capacity: config.event_capacity.max(1),
            reactor: Reactor {
                poll,
                connections: ConnectionRegistry::new(config.max_connections),
                factory,
                context: Arc::new(context),
                max_frame_len: config.max_frame_len,
                scratch: vec![0u8; config.read_buffer_size.max(1)],
                deferred: Vec::new(),
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop. Returns only if polling itself fails.
    pub fn serve(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);
        info!(addr = %self.local_addr, "Reactor server listening");

        loop {
            let timeout = if self.reactor.deferred.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };

            if let Err(e) = self.reactor.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let deferred = std::mem::take(&mut self.reactor.deferred);
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.reactor.accept_pending(&self.listener),
                    Token(key) => self.reactor.connection_ready(key),
                }
            }
            for key in deferred {
                self.reactor.connection_ready(key);
            }
        }
    }
}

impl<F, C> Reactor<F, C>
where
    F: DispatcherFactory<C>,
{
    /// Accept until the listener would block.
    fn accept_pending<A>(&mut self, acceptor: &A)
    where
        A: Accept<Stream = TcpStream>,
    {
        loop {
            match acceptor.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_per_connection_error(&e) => {
                    error!(error = %e, "Accept failed");
                }
                Err(e) => {
                    // Retried on the next listener readiness
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let Some(key) = self.connections.next_key() else {
            warn!(peer = %peer, "Connection limit reached, rejecting connection");
            return;
        };

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(key), Interest::READABLE)
        {
            error!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        let session = Session::new(key, peer, Arc::clone(&self.context));
        let factory = &self.factory;
        let dispatcher = match panic::catch_unwind(AssertUnwindSafe(|| factory.create(session))) {
            Ok(dispatcher) => dispatcher,
            Err(cause) => {
                error!(
                    peer = %peer,
                    error = %panic_message(cause.as_ref()),
                    "Dispatcher creation panicked, dropping connection"
                );
                let _ = self.poll.registry().deregister(&mut stream);
                return;
            }
        };
        self.connections.insert(ReactorConnection {
            stream,
            conn: Connection::new(key, peer, dispatcher, self.max_frame_len),
            interest: Interest::READABLE,
        });

        debug!(
            conn = key,
            peer = %peer,
            active = self.connections.len(),
            "Accepted connection"
        );
    }

    fn connection_ready(&mut self, key: usize) {
        let Some(entry) = self.connections.get_mut(key) else {
            return;
        };

        let step = match entry.drive(&mut self.scratch) {
            Ok(step) => step,
            Err(e) => return self.close(key, Err(e)),
        };

        match step {
            Step::Wait(interest) => {
                if interest != entry.interest {
                    if let Err(e) =
                        self.poll
                            .registry()
                            .reregister(&mut entry.stream, Token(key), interest)
                    {
                        return self.close(key, Err(e.into()));
                    }
                    entry.interest = interest;
                }
            }
            Step::Yield => {
                if !self.deferred.contains(&key) {
                    self.deferred.push(key);
                }
            }
            Step::Finished => self.close(key, Ok(())),
        }
    }

    fn close(&mut self, key: usize, result: Result<(), ConnectionError>) {
        if let Some(mut entry) = self.connections.remove(key) {
            let _ = self.poll.registry().deregister(&mut entry.stream);
            report_closed(key, entry.conn.peer(), result);
        }
        self.deferred.retain(|&k| k != key);
    }
}
