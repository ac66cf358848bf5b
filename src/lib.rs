//! Bridges a local FUSE mount to a remote filesystem provider reachable
//! over a WebSocket JSON-RPC transport.
//!
//! The core is the session and RPC machinery in [`session`], [`rpc`], and
//! [`timer`]: three event sources (inbound WebSocket frames, the pending
//! RPC timer wheel, and outbound sends) driven from a single per-session
//! task. [`filesystem`] and [`mount`] translate kernel filesystem
//! operations into RPC calls against whatever a provider registers via
//! [`protocol`].

pub mod auth;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod json;
pub mod message;
pub mod mount;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod session_manager;
pub mod timer;

pub use config::Config;
pub use error::{MountError, RpcError, Status};
pub use protocol::ServerProtocol;
pub use session::{Session, SessionHandle};
