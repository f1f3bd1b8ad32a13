//! # Record status
//!
//! Every cached record holds exactly one [`RecordStatus`]. The status
//! only moves through [`RecordStatus::next`], a pure function of the
//! previous status and a [`StatusEvent`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The record status.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// The cache holds no data for the record.
    #[default]
    Empty,

    /// The record is usable for the tier it has been fetched for.
    Ready,

    /// Only some of the requested properties are known.
    Partial,

    /// The cached data is unreliable and must be fetched again on
    /// next access. Consumers may still read it in the meantime.
    Obsolete,

    /// The record has been created locally and is not yet confirmed
    /// by the server.
    New,
}

/// The event driving a status transition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StatusEvent {
    /// The full header tier has been received from the server.
    Fetched,

    /// Some properties have been received and merged.
    PartiallyFetched,

    /// The server reported the record as changed without sending
    /// its new content.
    Changed,

    /// The whole cache has been declared unreliable.
    MarkedObsolete,

    /// The record has been created on the client side.
    CreatedLocally,

    /// The server confirmed the local creation of the record.
    CommitConfirmed,
}

impl RecordStatus {
    /// Computes the status following the given event.
    pub fn next(self, event: StatusEvent) -> Self {
        use RecordStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (_, Fetched) => Ready,
            (_, CreatedLocally) => New,

            (Empty, PartiallyFetched) => Partial,
            (status, PartiallyFetched) => status,

            (Ready, Changed) => Obsolete,
            (status, Changed) => status,

            (Ready | Partial, MarkedObsolete) => Obsolete,
            (status, MarkedObsolete) => status,

            (New, CommitConfirmed) => Ready,
            (status, CommitConfirmed) => status,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::New)
    }

    /// Returns `true` if the record should be fetched on next
    /// access.
    pub fn needs_fetch(&self) -> bool {
        matches!(self, Self::Empty | Self::Partial | Self::Obsolete)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Ready => write!(f, "ready"),
            Self::Partial => write!(f, "partial"),
            Self::Obsolete => write!(f, "obsolete"),
            Self::New => write!(f, "new"),
        }
    }
}
