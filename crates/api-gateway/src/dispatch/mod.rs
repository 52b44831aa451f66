//! Dispatcher and transcoder.

pub mod backend;
pub mod dispatcher;
pub mod transcode;

pub use backend::BackendTerminal;
pub use dispatcher::{Dispatcher, InboundCall};
pub use transcode::{decode_http, validate_canonical, HttpInput};
