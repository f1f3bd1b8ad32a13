//! # Error
//!
//! Module dedicated to synchronization errors. It contains an
//! [`Error`] enum based on [`thiserror::Error`] and a type alias
//! [`Result`].

use std::{error, result};

use thiserror::Error;

use crate::{
    cache::RecordType,
    message::{Id, State},
};

/// The global `Result` alias of the library.
pub type Result<T> = result::Result<T, Error>;

/// The boxed error returned by transports.
///
/// The library does not know which error a transport can produce, so
/// it keeps it opaque and forwards it untouched to the caller.
pub type AnyBoxedError = Box<dyn error::Error + Send + Sync + 'static>;

/// The global `Error` enum of the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot call method {1}")]
    CallMethodError(#[source] AnyBoxedError, String),
    #[error("server returned error {kind} for method {method}: {}", description.as_deref().unwrap_or("no description"))]
    MethodError {
        method: String,
        kind: String,
        description: Option<String>,
    },
    #[error("cannot find response {1} for method {0}")]
    MissingResponseError(String, &'static str),
    #[error("unexpected response {1} for method {0}")]
    UnexpectedResponseError(String, String),
    #[error("cannot parse response {1}")]
    ParseResponseError(#[source] serde_json::Error, String),
    #[error("cannot serialize arguments of method {1}")]
    SerializeRequestError(#[source] serde_json::Error, String),
    #[error("response to {0} does not match cursor {1:?}")]
    CursorMismatchError(String, Option<String>),
    #[error("cannot advance {0} cursor from {1}: cursor is now at {2:?}")]
    StaleCursorError(RecordType, State, Option<State>),
    #[error("cannot apply cache patch")]
    ApplyCachePatchError(#[source] AnyBoxedError),
    #[error("cannot commit empty change set")]
    CommitEmptyError,
    #[error("cannot update message {0}: message not found in cache")]
    CommitUnknownMessageError(Id),
    #[error("cannot fetch empty list of ids")]
    FetchEmptyError,
    #[error("sync context has been closed")]
    ClosedError,
}

impl Error {
    /// Returns `true` if the error comes from the transport layer.
    ///
    /// Such errors leave the cache, the cursor and the update policy
    /// untouched: retrying is the caller's business.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::CallMethodError(..))
    }
}
