//! # Diff
//!
//! Module dedicated to the application of server batches to the
//! cache. A batch is first turned into a [`ChangeSet`], then into a
//! [`CachePatch`] applied as a single atomic step. The views
//! depending on the changed records are invalidated right after.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::{
    cache::{CacheHunk, CachePatch, RecordCache, RecordChange},
    message::{DetailRecord, Id, Message, PartialMessage},
    protocol::{MessageList, MessageUpdatesResponse, MessagesResponse},
    view::{ViewKey, Views},
    Result,
};

/// The set of changes received from the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    /// Full header records.
    pub records: Vec<Message>,

    /// Partial property sets.
    pub partials: Vec<PartialMessage>,

    /// Detail records.
    pub details: Vec<DetailRecord>,

    /// Ids of records reported as changed, without content.
    pub changed: Vec<Id>,

    /// Ids of records that no longer exist.
    pub removed: Vec<Id>,
}

impl ChangeSet {
    /// Builds a change set from a `messages` response.
    ///
    /// Ids the server could not find are removed from the cache.
    pub fn from_messages(res: MessagesResponse) -> Self {
        let mut set = Self::from(res.list);
        set.removed = res.not_found;
        set
    }

    /// Builds a change set from a `messageUpdates` response and the
    /// records that came along with it.
    ///
    /// Changed ids covered by a record are upserted, others are only
    /// invalidated.
    pub fn from_updates(updates: MessageUpdatesResponse, records: Option<MessagesResponse>) -> Self {
        let mut set = records.map(Self::from_messages).unwrap_or_default();

        let fetched: HashSet<&str> = set.records.iter().map(|msg| msg.id.as_str()).collect();
        let removed: HashSet<&str> = updates.removed.iter().map(String::as_str).collect();

        let changed = updates
            .changed
            .iter()
            .filter(|id| !fetched.contains(id.as_str()) && !removed.contains(id.as_str()))
            .cloned()
            .collect();

        set.changed = changed;
        set.removed.extend(updates.removed);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.partials.is_empty()
            && self.details.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
    }

    /// Ids of the records whose content has been received.
    pub fn fetched_ids(&self) -> Vec<Id> {
        let records = self.records.iter().map(|msg| msg.id.clone());
        let partials = self.partials.iter().map(|msg| msg.id.clone());
        let details = self.details.iter().map(|record| record.id.clone());
        records.chain(partials).chain(details).collect()
    }

    /// Turns the change set into a cache patch.
    ///
    /// Removals come last so that they win over any other change of
    /// the same record.
    pub fn into_patch(self) -> CachePatch {
        let mut patch = CachePatch::new();
        patch.extend(self.records.into_iter().map(CacheHunk::Upsert));
        patch.extend(self.partials.into_iter().map(CacheHunk::Merge));
        patch.extend(self.details.into_iter().map(CacheHunk::SetDetails));
        patch.extend(self.changed.into_iter().map(CacheHunk::Invalidate));
        patch.extend(self.removed.into_iter().map(CacheHunk::Remove));
        patch
    }
}

impl From<MessageList> for ChangeSet {
    fn from(list: MessageList) -> Self {
        match list {
            MessageList::Records(records) => Self {
                records,
                ..Default::default()
            },
            MessageList::Partials(partials) => Self {
                partials,
                ..Default::default()
            },
            MessageList::Details(details) => Self {
                details,
                ..Default::default()
            },
        }
    }
}

/// The result of the application of a patch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Applied {
    pub changes: Vec<RecordChange>,
    pub invalidated: BTreeSet<ViewKey>,
}

/// Applies the given patch to the cache, then invalidates the views
/// depending on the changed records.
pub async fn apply<C: RecordCache + ?Sized>(cache: &C, views: &Views, patch: CachePatch) -> Result<Applied> {
    if patch.is_empty() {
        return Ok(Applied::default());
    }

    let changes = cache.apply(patch).await?;
    let invalidated = views.invalidate(&changes).await;

    debug!(
        "applied {} record change(s), invalidated {} view(s)",
        changes.iter().filter(|change| !change.is_noop()).count(),
        invalidated.len()
    );

    Ok(Applied {
        changes,
        invalidated,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        cache::{MemoryCache, RecordType},
        status::RecordStatus,
    };

    use super::*;

    fn updates(changed: &[&str], removed: &[&str]) -> MessageUpdatesResponse {
        MessageUpdatesResponse {
            old_state: "s0".into(),
            new_state: "s1".into(),
            has_more_updates: false,
            changed: changed.iter().map(ToString::to_string).collect(),
            removed: removed.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn changed_ids_without_records_are_invalidated() {
        let records = MessagesResponse {
            state: Some("s1".into()),
            list: MessageList::Records(vec![Message::new("m1")]),
            not_found: vec![],
        };

        let set = ChangeSet::from_updates(updates(&["m1", "m2", "m3"], &["m3"]), Some(records));

        assert_eq!(set.fetched_ids(), vec!["m1"]);
        assert_eq!(set.changed, vec!["m2"]);
        assert_eq!(set.removed, vec!["m3"]);
        assert_eq!(
            set.into_patch(),
            vec![
                CacheHunk::Upsert(Message::new("m1")),
                CacheHunk::Invalidate("m2".into()),
                CacheHunk::Remove("m3".into()),
            ]
        );
    }

    #[tokio::test]
    async fn same_batch_twice_is_idempotent() {
        let cache = MemoryCache::new();
        let views = Views::new();
        cache
            .apply(vec![
                CacheHunk::Upsert(Message::new("m2")),
                CacheHunk::Upsert(Message::new("m3")),
            ])
            .await
            .unwrap();

        let set = ChangeSet::from_updates(updates(&["m1", "m2"], &["m3"]), None);
        let mut patch = set.into_patch();
        patch.push(CacheHunk::SetCursor(RecordType::Message, Some("s1".into())));

        apply(&cache, &views, patch.clone()).await.unwrap();
        let once = cache.entries().await;

        let applied = apply(&cache, &views, patch).await.unwrap();
        assert_eq!(cache.entries().await, once);
        assert!(applied.changes.iter().all(RecordChange::is_noop));

        assert_eq!(cache.get_status("m2").await, RecordStatus::Obsolete);
        assert_eq!(cache.get("m3").await, None);
        // changed records absent from the cache are not fetched
        assert_eq!(cache.get("m1").await, None);
    }
}
