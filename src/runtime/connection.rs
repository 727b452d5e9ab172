//! Connection state machine shared by both server models.
//!
//! A [`Connection`] owns the decoder state, the dispatcher and the pending
//! output for one socket, and drives `Reading -> Dispatching -> Writing`
//! without knowing how the socket is scheduled. The reactor and the
//! threaded server only move bytes in with [`Connection::read_from`] and
//! out with [`Connection::flush_to`].

use bytes::{Buf, Bytes, BytesMut};
use slab::Slab;
use std::any::Any;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, trace};

use crate::codec::{encode_frame, FrameDecoder};
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::ConnectionError;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No output pending; waiting for the next frame.
    Reading,
    /// Encoded responses waiting to be written.
    Writing,
    /// Close signal received. Pending output is flushed, then the socket
    /// is dropped.
    Closing,
}

/// Result of a single read from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes were read and every completed frame dispatched.
    Data(usize),
    /// Nothing available on a non-blocking socket.
    WouldBlock,
    /// Peer closed the socket on a frame boundary.
    Eof,
}

/// A single client connection.
pub struct Connection<D> {
    id: usize,
    peer: SocketAddr,
    decoder: FrameDecoder,
    dispatcher: D,
    /// Encoded frames not yet written to the socket.
    outbound: BytesMut,
    close_reason: Option<String>,
}

impl<D: Dispatcher> Connection<D> {
    /// Create a new connection in the reading state.
    pub fn new(id: usize, peer: SocketAddr, dispatcher: D, max_frame_len: u32) -> Self {
        Self {
            id,
            peer,
            decoder: FrameDecoder::new(max_frame_len),
            dispatcher,
            outbound: BytesMut::new(),
            close_reason: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        if self.close_reason.is_some() {
            ConnState::Closing
        } else if !self.outbound.is_empty() {
            ConnState::Writing
        } else {
            ConnState::Reading
        }
    }

    /// True once a close signal has been received.
    pub fn is_closing(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Encoded output waiting to be written.
    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    /// Feed bytes from the peer, dispatching every frame they complete.
    ///
    /// Frames are dispatched one at a time in arrival order. Once a
    /// dispatcher returns [`Outcome::Close`], the remaining input is
    /// discarded.
    pub fn receive(&mut self, mut data: &[u8]) -> Result<(), ConnectionError> {
        while !data.is_empty() && !self.is_closing() {
            let (frame, used) = self.decoder.decode(data)?;
            data = &data[used..];
            if let Some(frame) = frame {
                self.dispatch(frame)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, payload: Bytes) -> Result<(), ConnectionError> {
        trace!(conn = self.id, len = payload.len(), "<<< {:?}", payload);

        let dispatcher = &mut self.dispatcher;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(payload)))
            .map_err(|cause| ConnectionError::Panic(panic_message(cause.as_ref())))?
            .map_err(ConnectionError::Dispatch)?;

        match outcome {
            Outcome::NoResponse => {}
            Outcome::Respond(response) => self.queue(&response)?,
            Outcome::RespondMany(responses) => {
                for response in &responses {
                    self.queue(response)?;
                }
            }
            Outcome::Close(reason) => {
                info!(conn = self.id, peer = %self.peer, reason = %reason, "Closing connection");
                self.close_reason = Some(reason);
            }
        }
        Ok(())
    }

    fn queue(&mut self, response: &Bytes) -> Result<(), ConnectionError> {
        trace!(conn = self.id, len = response.len(), ">>> {:?}", response);
        encode_frame(response, &mut self.outbound)?;
        Ok(())
    }

    /// Perform one read from `reader` and process what arrived.
    ///
    /// `Interrupted` reads are retried. End of stream in the middle of a
    /// frame (including a partial length prefix) is an error.
    pub fn read_from<R: Read>(
        &mut self,
        reader: &mut R,
        scratch: &mut [u8],
    ) -> Result<ReadStatus, ConnectionError> {
        loop {
            return match reader.read(scratch) {
                Ok(0) => {
                    if self.decoder.is_idle() {
                        Ok(ReadStatus::Eof)
                    } else {
                        Err(ConnectionError::Truncated {
                            buffered: self.decoder.buffered(),
                        })
                    }
                }
                Ok(n) => {
                    self.receive(&scratch[..n])?;
                    Ok(ReadStatus::Data(n))
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStatus::WouldBlock),
                Err(e) => Err(e.into()),
            };
        }
    }

    /// Write pending output to `writer` until drained or it would block.
    ///
    /// Returns `true` when no output remains.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> Result<bool, ConnectionError> {
        while !self.outbound.is_empty() {
            match writer.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Log how a connection ended. Failures never propagate past this point.
pub fn report_closed(id: usize, peer: SocketAddr, result: Result<(), ConnectionError>) {
    match result {
        Ok(()) => debug!(conn = id, peer = %peer, "Connection closed"),
        Err(e) => error!(conn = id, peer = %peer, error = %e, "Connection failed, closing"),
    }
}

pub(crate) fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Key the next inserted connection will receive, or `None` at capacity.
    pub fn next_key(&self) -> Option<usize> {
        if self.is_full() {
            None
        } else {
            Some(self.connections.vacant_key())
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use std::io::Cursor;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_frame(payload, &mut out).unwrap();
        out.to_vec()
    }

    /// Dispatcher that records payloads and answers from a script.
    struct Scripted {
        seen: Vec<Bytes>,
        script: Vec<Outcome>,
    }

    impl Scripted {
        fn new(script: Vec<Outcome>) -> Self {
            Self { seen: Vec::new(), script }
        }
    }

    impl Dispatcher for Scripted {
        fn dispatch(&mut self, payload: Bytes) -> Result<Outcome, DispatchError> {
            self.seen.push(payload);
            if self.script.is_empty() {
                Ok(Outcome::NoResponse)
            } else {
                Ok(self.script.remove(0))
            }
        }
    }

    #[test]
    fn test_single_response() {
        let mut conn = Connection::new(1, peer(), Scripted::new(vec![Outcome::respond(&b"R"[..])]), u32::MAX);

        conn.receive(&frame(b"HELO1")).unwrap();

        assert_eq!(conn.dispatcher.seen, vec![Bytes::from_static(b"HELO1")]);
        assert_eq!(conn.pending_output(), b"\x00\x00\x00\x01R");
        assert_eq!(conn.state(), ConnState::Writing);
    }

    #[test]
    fn test_frames_dispatched_in_order() {
        let mut conn = Connection::new(1, peer(), Scripted::new(Vec::new()), u32::MAX);
        let mut bytes = frame(b"ABC");
        bytes.extend(frame(b""));

        for byte in &bytes {
            conn.receive(std::slice::from_ref(byte)).unwrap();
        }

        assert_eq!(conn.dispatcher.seen, vec![Bytes::from_static(b"ABC"), Bytes::new()]);
        assert!(conn.pending_output().is_empty());
        assert_eq!(conn.state(), ConnState::Reading);
    }

    #[test]
    fn test_many_responses_in_order() {
        let responses = vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b""),
            Bytes::from_static(b"three"),
        ];
        let mut conn = Connection::new(1, peer(), Scripted::new(vec![Outcome::RespondMany(responses)]), u32::MAX);

        conn.receive(&frame(b"x")).unwrap();

        let mut expected = frame(b"one");
        expected.extend(frame(b""));
        expected.extend(frame(b"three"));
        assert_eq!(conn.pending_output(), &expected[..]);
    }

    #[test]
    fn test_close_discards_later_frames() {
        let script = vec![Outcome::respond(&b"ok"[..]), Outcome::close("quit")];
        let mut conn = Connection::new(1, peer(), Scripted::new(script), u32::MAX);
        let mut bytes = frame(b"first");
        bytes.extend(frame(b"Q"));
        bytes.extend(frame(b"never"));

        conn.receive(&bytes).unwrap();

        assert_eq!(conn.dispatcher.seen.len(), 2);
        assert!(conn.is_closing());
        assert_eq!(conn.state(), ConnState::Closing);
        // Output queued before the close is still flushed
        assert_eq!(conn.pending_output(), &frame(b"ok")[..]);

        conn.receive(&frame(b"more")).unwrap();
        assert_eq!(conn.dispatcher.seen.len(), 2);
    }

    #[test]
    fn test_dispatch_error() {
        let dispatcher = |_payload: Bytes| -> Result<Outcome, DispatchError> { Err("bad command".into()) };
        let mut conn = Connection::new(1, peer(), dispatcher, u32::MAX);

        let err = conn.receive(&frame(b"x")).unwrap_err();
        assert!(matches!(err, ConnectionError::Dispatch(_)));
        assert!(err.to_string().contains("bad command"));
    }

    #[test]
    fn test_dispatch_panic_is_contained() {
        let dispatcher = |_payload: Bytes| -> Result<Outcome, DispatchError> { panic!("handler bug") };
        let mut conn = Connection::new(1, peer(), dispatcher, u32::MAX);

        match conn.receive(&frame(b"x")) {
            Err(ConnectionError::Panic(msg)) => assert_eq!(msg, "handler bug"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_frame_limit() {
        let mut conn = Connection::new(1, peer(), Scripted::new(Vec::new()), 8);
        let err = conn.receive(&frame(b"way too long")).unwrap_err();
        assert!(matches!(err, ConnectionError::Frame(_)));
        assert!(conn.dispatcher.seen.is_empty());
    }

    #[test]
    fn test_read_from_eof() {
        let mut conn = Connection::new(1, peer(), Scripted::new(Vec::new()), u32::MAX);
        let mut scratch = [0u8; 64];

        let mut reader = Cursor::new(frame(b"ABC"));
        assert_eq!(conn.read_from(&mut reader, &mut scratch).unwrap(), ReadStatus::Data(7));
        assert_eq!(conn.read_from(&mut reader, &mut scratch).unwrap(), ReadStatus::Eof);
    }

    #[test]
    fn test_read_from_truncated_header() {
        let mut conn = Connection::new(1, peer(), Scripted::new(Vec::new()), u32::MAX);
        let mut scratch = [0u8; 64];

        let mut reader = Cursor::new(vec![0u8, 0]);
        conn.read_from(&mut reader, &mut scratch).unwrap();
        match conn.read_from(&mut reader, &mut scratch) {
            Err(ConnectionError::Truncated { buffered }) => assert_eq!(buffered, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    /// Writer that accepts a few bytes per call, then blocks.
    struct Trickle {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3).min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_flush() {
        let mut conn = Connection::new(1, peer(), Scripted::new(vec![Outcome::respond(&b"hello"[..])]), u32::MAX);
        conn.receive(&frame(b"x")).unwrap();

        let mut writer = Trickle { written: Vec::new(), budget: 5 };
        assert!(!conn.flush_to(&mut writer).unwrap());
        assert_eq!(conn.pending_output().len(), 4);

        writer.budget = usize::MAX;
        assert!(conn.flush_to(&mut writer).unwrap());
        assert_eq!(writer.written, frame(b"hello"));
        assert_eq!(conn.state(), ConnState::Reading);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert("a").unwrap();
        assert_eq!(registry.next_key(), Some(1));
        let id2 = registry.insert("b").unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.next_key().is_none());
        assert!(registry.insert("c").is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(id2).copied(), Some("b"));

        registry.remove(id1);
        assert!(registry.get_mut(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.next_key(), Some(id1));
    }
}
