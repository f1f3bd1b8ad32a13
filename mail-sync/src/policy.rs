//! # Update policy
//!
//! The update policy decides how the next update round is requested:
//! whether full records come along with the changed ids, and how many
//! changes the server may report at once.
//!
//! While the server keeps reporting more updates, the policy climbs
//! the escalation ladder: the first escalation drops full records
//! (ids-only rounds are cheaper), the next ones only raise the batch
//! cap. When the ladder is exhausted, the caller must give up the
//! incremental path and recover the cache.

use std::fmt;

use crate::config::{SyncConfig, DEFAULT_MAX_CHANGES_LADDER};

/// The update policy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct UpdatePolicy {
    pub fetch_records: bool,
    pub max_changes: usize,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            fetch_records: true,
            max_changes: DEFAULT_MAX_CHANGES_LADDER[0],
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = if self.fetch_records { "with" } else { "without" };
        write!(f, "{} changes {records} records", self.max_changes)
    }
}

impl UpdatePolicy {
    /// Builds the initial policy from the given configuration.
    pub fn initial(config: &SyncConfig) -> Self {
        Self {
            fetch_records: config.fetch_records_first(),
            max_changes: config.max_changes_ladder()[0],
        }
    }

    /// Computes the next step of the ladder, or `None` if the ladder
    /// is exhausted.
    ///
    /// Escalated policies never fetch records.
    pub fn escalate(&self, ladder: &[usize]) -> Option<Self> {
        let max_changes = ladder
            .iter()
            .copied()
            .find(|step| *step > self.max_changes)?;

        Some(Self {
            fetch_records: false,
            max_changes,
        })
    }
}
