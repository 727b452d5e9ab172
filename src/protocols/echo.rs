//! Echo dispatcher for exercising the transport.
//!
//! Every payload is written back unchanged as a single response frame,
//! except a payload starting with the milter quit command (`Q`), which
//! ends the session. No mail-filter semantics are implemented.
//!
//! ```text
//! Request:  00 00 00 05 "HELO1"
//! Response: 00 00 00 05 "HELO1"
//!
//! Request:  00 00 00 01 "Q"
//! (connection closed)
//! ```

use bytes::Bytes;

use crate::dispatcher::{Dispatcher, DispatcherFactory, Outcome, Session};
use crate::error::DispatchError;

/// Milter `SMFIC_QUIT` command byte.
pub const QUIT: u8 = b'Q';

/// Creates one [`EchoDispatcher`] per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoFactory;

impl<C: ?Sized> DispatcherFactory<C> for EchoFactory {
    type Dispatcher = EchoDispatcher;

    fn create(&self, session: Session<C>) -> EchoDispatcher {
        EchoDispatcher {
            conn: session.id(),
            echoed: 0,
        }
    }
}

#[derive(Debug)]
pub struct EchoDispatcher {
    conn: usize,
    echoed: u64,
}

impl Dispatcher for EchoDispatcher {
    fn dispatch(&mut self, payload: Bytes) -> Result<Outcome, DispatchError> {
        if payload.first() == Some(&QUIT) {
            return Ok(Outcome::close(format!(
                "quit from connection {} after {} frames",
                self.conn, self.echoed
            )));
        }
        self.echoed += 1;
        Ok(Outcome::Respond(payload))
    }
}
