//! Blocking TCP acceptor and a blocking `rustls` session wrapper.
//!
//! This crate is the de-asynced counterpart of the teacher's
//! `spark-transport-tcp`/`spark-transport-tls` pair: spec.md's
//! concurrency model is OS threads with per-socket timeouts rather than
//! an event loop (spec.md §5, §9), so every operation here blocks the
//! calling thread up to a caller-supplied deadline instead of yielding to
//! a runtime.

mod acceptor;
mod error;
mod handoff;
mod tls;

pub use acceptor::Acceptor;
pub use error::TransportError;
pub use handoff::ClientHandoff;
pub use tls::{load_server_config, TlsSession};
