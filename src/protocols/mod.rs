//! Dispatcher implementations bundled with the transport.
//!
//! Real mail filters supply their own [`crate::Dispatcher`]; these exist to
//! run and test the servers without one.
//!
//! - `echo`: echoes each payload, closes on the milter quit command

pub mod echo;
