//! Agent enrollment manager: dispatcher pool, durable writer, supervisor
//! lifecycle and the cluster/database RPC seams (spec.md C5–C7).
//!
//! `enrolld-core` owns the pure data/logic layer; this crate wraps it in
//! threads, sockets and a TLS context and is the only crate that knows
//! about the process lifecycle.

pub mod certgen;
pub mod cli;
pub mod cluster;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod key_request;
pub mod local_control;
pub mod logging;
pub mod pidfile;
pub mod privdrop;
pub mod queue;
pub mod state;
pub mod supervisor;
pub mod writer;

pub use cli::Cli;
pub use error::ServerError;
pub use supervisor::{Service, ServiceState, Supervisor};
