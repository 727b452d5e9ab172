//! The seam between the transport and the milter protocol handler.
//!
//! The transport knows nothing about milter commands. For each accepted
//! connection it asks a [`DispatcherFactory`] for a fresh [`Dispatcher`],
//! hands it every decoded payload in arrival order, and writes back whatever
//! the returned [`Outcome`] asks for.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::error::DispatchError;

/// What the transport should do after a payload has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write nothing and keep reading.
    NoResponse,
    /// Write one response frame.
    Respond(Bytes),
    /// Write each response as its own frame, in order.
    RespondMany(Vec<Bytes>),
    /// End the session. Nothing further is read or dispatched.
    Close(String),
}

impl Outcome {
    /// Convenience constructor for a single response.
    pub fn respond(payload: impl Into<Bytes>) -> Self {
        Outcome::Respond(payload.into())
    }

    /// Convenience constructor for a close signal.
    pub fn close(reason: impl Into<String>) -> Self {
        Outcome::Close(reason.into())
    }
}

/// Per-connection protocol handler.
///
/// A dispatcher is owned by exactly one connection for its whole lifetime
/// and is never called concurrently.
pub trait Dispatcher {
    fn dispatch(&mut self, payload: Bytes) -> Result<Outcome, DispatchError>;
}

impl<F> Dispatcher for F
where
    F: FnMut(Bytes) -> Result<Outcome, DispatchError>,
{
    fn dispatch(&mut self, payload: Bytes) -> Result<Outcome, DispatchError> {
        self(payload)
    }
}

/// Produces one dispatcher per accepted connection.
///
/// In the thread-per-connection model the factory is shared by reference
/// across connection threads, so it must not rely on interior mutation.
pub trait DispatcherFactory<C: ?Sized> {
    type Dispatcher: Dispatcher;

    fn create(&self, session: Session<C>) -> Self::Dispatcher;
}

impl<C, D, F> DispatcherFactory<C> for F
where
    C: ?Sized,
    D: Dispatcher,
    F: Fn(Session<C>) -> D,
{
    type Dispatcher = D;

    fn create(&self, session: Session<C>) -> D {
        self(session)
    }
}

/// Identity and shared context handed to a new dispatcher.
pub struct Session<C: ?Sized> {
    id: usize,
    peer: SocketAddr,
    context: Arc<C>,
}

impl<C: ?Sized> Session<C> {
    pub(crate) fn new(id: usize, peer: SocketAddr, context: Arc<C>) -> Self {
        Self { id, peer, context }
    }

    /// Connection identifier, unique among live connections of a server.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Remote address of the connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Shared read-only context supplied at server construction.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Owned handle to the shared context.
    pub fn shared_context(&self) -> Arc<C> {
        Arc::clone(&self.context)
    }

    /// Report a handler-internal error that does not end the session.
    pub fn report_error(&self, error: &dyn fmt::Display) {
        warn!(conn = self.id, peer = %self.peer, error = %error, "Dispatcher reported error");
    }
}

impl<C: ?Sized> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_factory() {
        let factory = |session: Session<String>| {
            let greeting = session.shared_context();
            move |payload: Bytes| -> Result<Outcome, DispatchError> {
                let mut out = greeting.as_bytes().to_vec();
                out.extend_from_slice(&payload);
                Ok(Outcome::respond(out))
            }
        };

        let session = Session::new(7, "127.0.0.1:25".parse().unwrap(), Arc::new("hi ".to_string()));
        assert_eq!(session.id(), 7);
        assert_eq!(session.context(), "hi ");

        let mut dispatcher = factory.create(session);
        let outcome = dispatcher.dispatch(Bytes::from_static(b"there")).unwrap();
        assert_eq!(outcome, Outcome::Respond(Bytes::from_static(b"hi there")));
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(Outcome::respond(&b"R"[..]), Outcome::Respond(Bytes::from_static(b"R")));
        assert_eq!(Outcome::close("quit"), Outcome::Close("quit".to_string()));
    }
}
