//! milter-transport: TCP transport for the sendmail milter protocol
//!
//! Accepts connections from a mail transfer agent, frames the
//! length-prefixed milter packets, hands each payload to a per-connection
//! [`Dispatcher`] and writes back its responses.
//!
//! Features:
//! - Length-prefixed framing tolerant of arbitrary read fragmentation
//! - Single-threaded reactor (mio) or thread-per-connection servers
//! - Per-connection failure isolation, including dispatcher panics
//! - Configurable frame size and connection limits
//! - Configuration via CLI arguments or TOML file

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use codec::{encode_frame, FrameDecoder, LENGTH_PREFIX_LEN};
pub use dispatcher::{Dispatcher, DispatcherFactory, Outcome, Session};
pub use error::{ConfigError, ConnectionError, DispatchError, FrameError};
pub use runtime::{
    ListenTarget, ListenerConfig, ReactorServer, RuntimeType, Server, ThreadedServer,
};
