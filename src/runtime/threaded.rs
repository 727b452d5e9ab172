//! Thread-per-connection server.
//!
//! The listener thread only accepts. Each accepted socket gets its own
//! named thread running the blocking read/dispatch/write cycle until the
//! connection closes. The factory and shared context are the only state
//! visible to more than one thread, and both are read-only.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherFactory, Session};
use crate::error::ConnectionError;
use crate::runtime::connection::{report_closed, Connection, ReadStatus};
use crate::runtime::listener::{self, is_per_connection_error, Accept, ListenerConfig};

/// Pause after an accept error that is not tied to one connection
/// (e.g. descriptor exhaustion), so the loop does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Thread-per-connection server using blocking sockets.
pub struct ThreadedServer<F, C> {
    listener: TcpListener,
    local_addr: SocketAddr,
    spawner: Spawner<F, C>,
}

/// Starts connection threads. Split from the listener so the accept path
/// can borrow both.
struct Spawner<F, C> {
    factory: Arc<F>,
    context: Arc<C>,
    max_frame_len: u32,
    read_buffer_size: usize,
    max_connections: usize,
    /// Live connection threads, decremented by each thread on exit.
    live: Arc<AtomicUsize>,
    next_id: usize,
}

impl<F, C> ThreadedServer<F, C>
where
    F: DispatcherFactory<C> + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Bind the listening socket.
    pub fn bind(config: ListenerConfig, factory: F, context: C) -> io::Result<Self> {
        let listener = listener::bind(&config, false)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            spawner: Spawner {
                factory: Arc::new(factory),
                context: Arc::new(context),
                max_frame_len: config.max_frame_len,
                read_buffer_size: config.read_buffer_size.max(1),
                max_connections: config.max_connections,
                live: Arc::new(AtomicUsize::new(0)),
                next_id: 0,
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, one thread each.
    pub fn serve(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "Threaded server listening");
        loop {
            // Connection threads run detached
            drop(self.spawner.accept_once(&self.listener));
        }
    }
}

impl<F, C> Spawner<F, C>
where
    F: DispatcherFactory<C> + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Accept one connection and start its thread.
    ///
    /// Accept failures are logged and swallowed; the caller keeps looping.
    fn accept_once<A>(&mut self, acceptor: &A) -> Option<JoinHandle<()>>
    where
        A: Accept<Stream = TcpStream>,
    {
        match acceptor.accept() {
            Ok((stream, peer)) => self.spawn(stream, peer),
            Err(e) => {
                error!(error = %e, "Accept failed");
                if !is_per_connection_error(&e) {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                None
            }
        }
    }

    fn spawn(&mut self, stream: TcpStream, peer: SocketAddr) -> Option<JoinHandle<()>> {
        let Some(guard) = LiveGuard::acquire(&self.live, self.max_connections) else {
            warn!(peer = %peer, "Connection limit reached, rejecting connection");
            return None;
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let factory = Arc::clone(&self.factory);
        let context = Arc::clone(&self.context);
        let max_frame_len = self.max_frame_len;
        let read_buffer_size = self.read_buffer_size;

        let spawned = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || {
                let _guard = guard;
                let session = Session::new(id, peer, context);
                let dispatcher = factory.create(session);
                let mut conn = Connection::new(id, peer, dispatcher, max_frame_len);
                let mut scratch = vec![0u8; read_buffer_size];
                let result = run_blocking(&mut conn, stream, &mut scratch);
                report_closed(id, peer, result);
            });

        match spawned {
            Ok(handle) => {
                debug!(conn = id, peer = %peer, "Accepted connection");
                Some(handle)
            }
            Err(e) => {
                error!(conn = id, peer = %peer, error = %e, "Failed to spawn connection thread");
                None
            }
        }
    }
}

/// Drive one connection to completion on the current thread.
fn run_blocking<D: Dispatcher>(
    conn: &mut Connection<D>,
    mut stream: TcpStream,
    scratch: &mut [u8],
) -> Result<(), ConnectionError> {
    stream.set_nonblocking(false)?;
    loop {
        match conn.read_from(&mut stream, scratch)? {
            ReadStatus::Eof => return Ok(()),
            ReadStatus::WouldBlock | ReadStatus::Data(_) => {}
        }
        conn.flush_to(&mut stream)?;
        if conn.is_closing() {
            return Ok(());
        }
    }
}

/// Counts a live connection thread for as long as it is held.
struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    fn acquire(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < max).then_some(n + 1)
        })
        .ok()?;
        Some(Self {
            live: Arc::clone(live),
        })
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
