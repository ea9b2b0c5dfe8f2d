// SPDX-License-Identifier: GPL-3.0-or-later

//! Error types surfaced by the facade.

use std::path::PathBuf;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the language server facade.
///
/// Transport failures are fatal to the session; protocol errors carry the
/// server's JSON-RPC error code and propagate unchanged except for the
/// internal-error-on-references case, which is wrapped with the originating
/// location to aid diagnosis.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was invoked before `start` completed.
    #[error("language server has not been started")]
    NotStarted,

    /// Malformed framing or I/O failure on the child process streams.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A structured JSON-RPC error returned by the server.
    #[error("language server error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code.
        code: i64,
        /// Server-provided error message.
        message: String,
    },

    /// LSP internal error (-32603) while servicing a references request.
    ///
    /// This often occurs when requesting references for a symbol that is
    /// not referenced in the expected way.
    #[error(
        "LSP internal error (-32603) when requesting references for {path}:{line}:{column}: {message}"
    )]
    ReferencesInternal {
        /// Relative path the request was issued for.
        path: String,
        /// Zero-based line of the request position.
        line: u32,
        /// Zero-based column of the request position.
        column: u32,
        /// Server-provided error message.
        message: String,
    },

    /// A blocking call on the sync facade exceeded its wall-clock budget.
    /// The underlying request is abandoned but not cancelled on the wire.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server did not advertise a capability the facade relies on.
    #[error("language server does not advertise the {0} capability")]
    MissingCapability(&'static str),

    /// A path passed to the facade does not exist in the repository.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// I/O failure while reading repository files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure on a payload we produced or received.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors that indicate the session itself is unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
