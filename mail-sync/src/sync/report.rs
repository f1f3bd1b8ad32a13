//! # Sync report
//!
//! Module dedicated to synchronization reporting. Every operation of
//! [`MessageSync`](super::MessageSync) returns a report describing
//! what has been applied to the cache.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    message::{Id, State},
    policy::UpdatePolicy,
    protocol::SetError,
    view::ViewKey,
};

/// The outcome of a full refresh.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UpdatesOutcome {
    /// All updates have been retrieved.
    #[default]
    Completed,

    /// The incremental path has been abandoned and the cache has
    /// been marked obsolete.
    Recovered,

    /// An update round was already in flight: the refresh has been
    /// merged into it.
    Coalesced,

    /// The sync context has been closed while a round was in flight.
    /// The response of the round has been dropped.
    Cancelled,

    /// No cursor is known yet: there is nothing to refresh from.
    NoCursor,
}

/// The report of one update round.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoundReport {
    /// The policy the round has been requested with.
    pub policy: UpdatePolicy,
    pub old_state: State,
    pub new_state: State,
    pub changed: usize,
    pub removed: usize,
    pub has_more_updates: bool,
}

/// The report of a full refresh.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdatesReport {
    pub outcome: UpdatesOutcome,
    pub rounds: Vec<RoundReport>,
    /// The cursor the cache has been recovered to, if any.
    pub recovered_state: Option<State>,
    /// The views that need to be recomputed.
    pub invalidated: BTreeSet<ViewKey>,
}

impl UpdatesReport {
    pub fn new(outcome: UpdatesOutcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }
}

/// The report of a fetch or of a targeted refresh.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchReport {
    /// Ids of the records received from the server.
    pub fetched: Vec<Id>,

    /// Ids unknown to the server, removed from the cache.
    pub not_found: Vec<Id>,

    /// Ids skipped because they were already being fetched.
    pub skipped: Vec<Id>,

    pub invalidated: BTreeSet<ViewKey>,
}

/// The report of a full or targeted refresh.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RefreshReport {
    Records(FetchReport),
    Updates(UpdatesReport),
}

/// The report of a commit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitReport {
    /// Server ids of the created messages, by creation id.
    pub created: BTreeMap<Id, Id>,
    pub updated: Vec<Id>,
    pub destroyed: Vec<Id>,

    pub not_created: BTreeMap<Id, SetError>,
    pub not_updated: BTreeMap<Id, SetError>,
    pub not_destroyed: BTreeMap<Id, SetError>,

    /// Whether the cursor could not be advanced, and a full refresh
    /// is needed to catch up with the server.
    pub refresh_needed: bool,

    pub invalidated: BTreeSet<ViewKey>,
}
