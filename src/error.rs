//! Framework-internal status codes and error types.

use serde::{Deserialize, Serialize};

/// Status codes mirrored verbatim into the JSON-RPC `error.code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Status {
    Good = 0,
    Bad = 1,
    BadFormat = 2,
    BadAccessDenied = 3,
    BadTimeout = 4,
    BadNotImplemented = 5,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn message(self) -> &'static str {
        match self {
            Status::Good => "good",
            Status::Bad => "bad",
            Status::BadFormat => "bad format",
            Status::BadAccessDenied => "access denied",
            Status::BadTimeout => "timeout",
            Status::BadNotImplemented => "not implemented",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Error surfaced through a Proxy completion.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("remote returned error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("proxy disposed before a response arrived")]
    Disposed,
    #[error("malformed response: {0}")]
    BadResponse(String),
}

/// Errors a Mountpoint Factory can report back to `Session::add_filesystem`.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("mount point I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mount point rejected: {0}")]
    Rejected(String),
}
