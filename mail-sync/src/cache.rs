//! # Record cache
//!
//! Module dedicated to the local record cache. The cache is an
//! external collaborator: the library only consumes the narrow
//! [`RecordCache`] interface, and ships the [`MemoryCache`] as a
//! default implementation.
//!
//! Mutations never reach the cache one by one. They are gathered
//! into a [`CachePatch`] (a list of [`CacheHunk`]s) that the cache
//! applies as a single atomic step. The transition of a cached entry
//! for a given hunk is a pure function, see [`apply_record_hunk`], so
//! that custom caches behave the same as the memory one.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use async_trait::async_trait;
use futures::lock::Mutex;
use tracing::{debug, trace};

use crate::{
    mailbox::Mailbox,
    message::{DetailRecord, Id, Message, PartialMessage, Property, State},
    protocol::CreatedMessage,
    status::{RecordStatus, StatusEvent},
    sync::merge,
    Error, Result,
};

/// The record type, used to scope change cursors.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RecordType {
    Message,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => write!(f, "Message"),
        }
    }
}

/// The cache entry: a message and its status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheEntry {
    pub status: RecordStatus,
    pub message: Message,
}

impl CacheEntry {
    pub fn new(message: Message, status: RecordStatus) -> Self {
        Self { status, message }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// The cache hunk.
///
/// Represents one change to apply to the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheHunk {
    /// The given header record has been fetched: it replaces the
    /// header tier of the cached entry and keeps its detail tier.
    Upsert(Message),

    /// The detail tier of the given message has been fetched.
    SetDetails(DetailRecord),

    /// The given properties need to be overlaid on top of the
    /// cached entry.
    Merge(PartialMessage),

    /// The server reported the given message as changed without
    /// sending its content.
    Invalidate(Id),

    /// The given message needs to be considered unreliable.
    MarkObsolete(Id),

    /// The given message needs to be removed from the cache.
    Remove(Id),

    /// The given message has been created locally.
    Create(Message),

    /// The local message matching the given creation id has been
    /// confirmed by the server and needs to be rekeyed.
    Confirm(Id, CreatedMessage),

    /// The given entry needs to be put as is in the cache.
    Put(CacheEntry),

    /// The cursor of the given record type needs to be replaced.
    SetCursor(RecordType, Option<State>),

    /// The cursor of the given record type needs to move from the
    /// first state to the second one. The whole patch is rejected
    /// with [`Error::StaleCursorError`] if the cursor is not at the
    /// first state anymore.
    AdvanceCursor(RecordType, State, State),

    /// The given mailbox needs to be known by the cache.
    PutMailbox(Mailbox),
}

impl fmt::Display for CacheHunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert(msg) => write!(f, "Upserting message {}", msg.id),
            Self::SetDetails(record) => write!(f, "Setting details of message {}", record.id),
            Self::Merge(partial) => write!(f, "Merging properties into message {}", partial.id),
            Self::Invalidate(id) => write!(f, "Invalidating message {id}"),
            Self::MarkObsolete(id) => write!(f, "Marking message {id} as obsolete"),
            Self::Remove(id) => write!(f, "Removing message {id}"),
            Self::Create(msg) => write!(f, "Creating local message {}", msg.id),
            Self::Confirm(cid, created) => {
                write!(f, "Confirming local message {cid} as {}", created.id)
            }
            Self::Put(entry) => write!(f, "Putting message {} ({})", entry.id(), entry.status),
            Self::SetCursor(kind, Some(state)) => write!(f, "Setting {kind} cursor to {state}"),
            Self::SetCursor(kind, None) => write!(f, "Clearing {kind} cursor"),
            Self::AdvanceCursor(kind, from, to) => {
                write!(f, "Advancing {kind} cursor from {from} to {to}")
            }
            Self::PutMailbox(mailbox) => write!(f, "Putting mailbox {}", mailbox.id),
        }
    }
}

/// A cache patch is just a list of cache hunks, applied atomically.
pub type CachePatch = Vec<CacheHunk>;

/// The change of a cached record, produced by the application of a
/// hunk.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordChange {
    pub id: Id,
    pub before: Option<CacheEntry>,
    pub after: Option<CacheEntry>,
}

impl RecordChange {
    /// Lists the header properties that changed.
    ///
    /// An added or removed record changes all its properties.
    pub fn properties(&self) -> BTreeSet<Property> {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => before.message.diff_headers(&after.message),
            (None, None) => BTreeSet::new(),
            _ => crate::message::HEADER_PROPERTIES.iter().copied().collect(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }

    /// Lists the thread ids the record belonged to, before and after
    /// the change.
    pub fn thread_ids(&self) -> BTreeSet<Id> {
        [&self.before, &self.after]
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.message.thread_id.clone())
            .collect()
    }

    /// Lists the mailbox ids the record belonged to, before and
    /// after the change.
    pub fn mailbox_ids(&self) -> BTreeSet<Id> {
        [&self.before, &self.after]
            .into_iter()
            .flatten()
            .flat_map(|entry| entry.message.mailbox_ids.iter().cloned())
            .collect()
    }
}

/// Squashes the given record changes into one net change per record.
///
/// The net change of a record goes from its first `before` to its
/// last `after`, and takes the place of its first change.
pub fn squash_changes(changes: Vec<RecordChange>) -> Vec<RecordChange> {
    let mut positions: HashMap<Id, usize> = HashMap::new();
    let mut squashed: Vec<RecordChange> = Vec::with_capacity(changes.len());

    for change in changes {
        match positions.get(&change.id) {
            Some(&pos) => squashed[pos].after = change.after,
            None => {
                positions.insert(change.id.clone(), squashed.len());
                squashed.push(change);
            }
        }
    }

    squashed
}

/// Applies the given record hunk to the given entries.
///
/// Returns the list of record changes. Hunks that do not target
/// records (cursors and mailboxes) are ignored and produce no
/// change.
pub fn apply_record_hunk(entries: &mut BTreeMap<Id, CacheEntry>, hunk: CacheHunk) -> Vec<RecordChange> {
    trace!("{hunk}");

    let (id, after) = match hunk {
        CacheHunk::Upsert(mut msg) => {
            let id = msg.id.clone();
            let before = entries.get(&id);
            let status = before.map(|e| e.status).unwrap_or_default();
            if msg.details.is_none() {
                msg.details = before.and_then(|e| e.message.details.clone());
            }
            (id, Some(CacheEntry::new(msg, status.next(StatusEvent::Fetched))))
        }
        CacheHunk::SetDetails(record) => {
            let id = record.id.clone();
            let entry = match entries.get(&id).cloned() {
                Some(mut entry) => {
                    entry.message.details = Some(record.details);
                    entry
                }
                None => {
                    let mut msg = Message::new(&id);
                    msg.details = Some(record.details);
                    CacheEntry::new(msg, RecordStatus::Empty.next(StatusEvent::PartiallyFetched))
                }
            };
            (id, Some(entry))
        }
        CacheHunk::Merge(partial) => {
            let id = partial.id.clone();
            let entry = merge::merge(entries.get(&id).cloned(), &partial);
            (id, Some(entry))
        }
        CacheHunk::Invalidate(id) => {
            let after = entries.get(&id).cloned().map(|mut entry| {
                entry.status = entry.status.next(StatusEvent::Changed);
                entry
            });
            (id, after)
        }
        CacheHunk::MarkObsolete(id) => {
            let after = entries.get(&id).cloned().map(|mut entry| {
                entry.status = entry.status.next(StatusEvent::MarkedObsolete);
                entry
            });
            (id, after)
        }
        CacheHunk::Remove(id) => (id, None),
        CacheHunk::Create(msg) => {
            let id = msg.id.clone();
            let status = RecordStatus::Empty.next(StatusEvent::CreatedLocally);
            (id, Some(CacheEntry::new(msg, status)))
        }
        CacheHunk::Confirm(cid, created) => {
            let Some(mut entry) = entries.remove(&cid) else {
                debug!("cannot find local message {cid} to confirm, skipping it");
                return Vec::new();
            };

            let local = RecordChange {
                id: cid,
                before: Some(entry.clone()),
                after: None,
            };

            entry.message.id = created.id.clone();
            if let Some(thread_id) = created.thread_id {
                entry.message.thread_id = Some(thread_id);
            }
            if let Some(size) = created.size {
                entry.message.size = size;
            }
            if let Some(blob_id) = created.blob_id {
                entry
                    .message
                    .details
                    .get_or_insert_with(Default::default)
                    .blob_id = Some(blob_id);
            }
            entry.status = entry.status.next(StatusEvent::CommitConfirmed);

            let id = created.id;
            let before = entries.insert(id.clone(), entry.clone());
            let remote = RecordChange {
                id,
                before,
                after: Some(entry),
            };

            return vec![local, remote];
        }
        CacheHunk::Put(entry) => (entry.message.id.clone(), Some(entry)),
        CacheHunk::SetCursor(..) | CacheHunk::AdvanceCursor(..) | CacheHunk::PutMailbox(..) => {
            return Vec::new()
        }
    };

    let before = match &after {
        Some(entry) => entries.insert(id.clone(), entry.clone()),
        None => entries.remove(&id),
    };

    vec![RecordChange { id, before, after }]
}

/// The record cache trait.
///
/// Describes the narrow interface the synchronization consumes. All
/// mutations go through [`RecordCache::apply`], which must apply the
/// whole patch or nothing. A patch holding a
/// [`CacheHunk::AdvanceCursor`] whose starting state does not match
/// the cursor is rejected as a whole.
#[async_trait]
pub trait RecordCache: Send + Sync {
    /// Gets the cached entry matching the given id.
    async fn get(&self, id: &str) -> Option<CacheEntry>;

    /// Lists ids of all cached messages.
    async fn get_all(&self) -> Vec<Id>;

    /// Lists all cached entries.
    async fn entries(&self) -> Vec<CacheEntry>;

    /// Gets the change cursor of the given record type.
    async fn get_cursor(&self, kind: RecordType) -> Option<State>;

    /// Gets the mailbox matching the given id.
    async fn get_mailbox(&self, id: &str) -> Option<Mailbox>;

    /// Applies the given patch as a single atomic step, and returns
    /// one net change per touched record.
    async fn apply(&self, patch: CachePatch) -> Result<Vec<RecordChange>>;

    /// Gets the status of the message matching the given id.
    async fn get_status(&self, id: &str) -> RecordStatus {
        self.get(id)
            .await
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    async fn put(&self, message: Message, status: RecordStatus) -> Result<()> {
        self.apply(vec![CacheHunk::Put(CacheEntry::new(message, status))])
            .await?;
        Ok(())
    }

    async fn mark_obsolete(&self, ids: Vec<Id>) -> Result<()> {
        self.apply(ids.into_iter().map(CacheHunk::MarkObsolete).collect())
            .await?;
        Ok(())
    }

    async fn set_cursor(&self, kind: RecordType, state: Option<State>) -> Result<()> {
        self.apply(vec![CacheHunk::SetCursor(kind, state)]).await?;
        Ok(())
    }

    async fn put_mailbox(&self, mailbox: Mailbox) -> Result<()> {
        self.apply(vec![CacheHunk::PutMailbox(mailbox)]).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryCacheInner {
    entries: BTreeMap<Id, CacheEntry>,
    cursors: HashMap<RecordType, State>,
    mailboxes: HashMap<Id, Mailbox>,
}

/// The in-memory record cache.
#[derive(Default)]
pub struct MemoryCache(Mutex<MemoryCacheInner>);

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordCache for MemoryCache {
    async fn get(&self, id: &str) -> Option<CacheEntry> {
        self.0.lock().await.entries.get(id).cloned()
    }

    async fn get_all(&self) -> Vec<Id> {
        self.0.lock().await.entries.keys().cloned().collect()
    }

    async fn entries(&self) -> Vec<CacheEntry> {
        self.0.lock().await.entries.values().cloned().collect()
    }

    async fn get_cursor(&self, kind: RecordType) -> Option<State> {
        self.0.lock().await.cursors.get(&kind).cloned()
    }

    async fn get_mailbox(&self, id: &str) -> Option<Mailbox> {
        self.0.lock().await.mailboxes.get(id).cloned()
    }

    async fn apply(&self, patch: CachePatch) -> Result<Vec<RecordChange>> {
        debug!("applying cache patch of {} hunk(s)", patch.len());

        let mut inner = self.0.lock().await;

        // cursor moves are checked before anything is mutated
        let mut cursors = inner.cursors.clone();
        for hunk in &patch {
            match hunk {
                CacheHunk::SetCursor(kind, Some(state)) => {
                    cursors.insert(*kind, state.clone());
                }
                CacheHunk::SetCursor(kind, None) => {
                    cursors.remove(kind);
                }
                CacheHunk::AdvanceCursor(kind, from, to) => {
                    let cursor = cursors.get(kind);
                    if cursor != Some(from) {
                        debug!("{kind} cursor {cursor:?} is not at {from} anymore, rejecting patch");
                        return Err(Error::StaleCursorError(*kind, from.clone(), cursor.cloned()));
                    }
                    cursors.insert(*kind, to.clone());
                }
                _ => (),
            }
        }

        let mut changes = Vec::new();

        for hunk in patch {
            match hunk {
                CacheHunk::SetCursor(kind, Some(state)) => {
                    trace!("setting {kind} cursor to {state}");
                    inner.cursors.insert(kind, state);
                }
                CacheHunk::SetCursor(kind, None) => {
                    trace!("clearing {kind} cursor");
                    inner.cursors.remove(&kind);
                }
                CacheHunk::AdvanceCursor(kind, from, to) => {
                    trace!("advancing {kind} cursor from {from} to {to}");
                    inner.cursors.insert(kind, to);
                }
                CacheHunk::PutMailbox(mailbox) => {
                    inner.mailboxes.insert(mailbox.id.clone(), mailbox);
                }
                hunk => changes.extend(apply_record_hunk(&mut inner.entries, hunk)),
            }
        }

        Ok(squash_changes(changes))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        message::{Message, PartialMessage},
        protocol::CreatedMessage,
        status::RecordStatus,
    };

    use super::*;

    fn message(id: &str, thread: &str) -> Message {
        Message {
            thread_id: Some(thread.into()),
            subject: format!("subject {id}"),
            ..Message::new(id)
        }
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let cache = MemoryCache::new();
        let patch = vec![
            CacheHunk::Upsert(message("m1", "t1")),
            CacheHunk::Merge(PartialMessage::new("m1").with_unread(true)),
            CacheHunk::Remove("m2".into()),
            CacheHunk::SetCursor(RecordType::Message, Some("s1".into())),
        ];

        cache.apply(patch.clone()).await.unwrap();
        let once = cache.entries().await;

        let changes = cache.apply(patch).await.unwrap();
        let twice = cache.entries().await;

        assert_eq!(once, twice);
        assert!(changes.iter().all(|change| change.is_noop()));
        assert_eq!(cache.get_cursor(RecordType::Message).await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn changes_are_squashed_per_record() {
        let cache = MemoryCache::new();

        let changes = cache
            .apply(vec![
                CacheHunk::Upsert(message("m1", "t1")),
                CacheHunk::Upsert(message("m2", "t1")),
                CacheHunk::Merge(PartialMessage::new("m1").with_draft(true)),
                CacheHunk::Remove("m2".into()),
            ])
            .await
            .unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id, "m1");
        assert_eq!(changes[0].before, None);
        assert!(changes[0].after.as_ref().unwrap().message.is_draft);
        assert_eq!(changes[1].id, "m2");
        assert!(changes[1].is_noop());
    }

    #[tokio::test]
    async fn stale_cursor_rejects_whole_patch() {
        let cache = MemoryCache::new();
        cache
            .set_cursor(RecordType::Message, Some("s5".into()))
            .await
            .unwrap();

        let err = cache
            .apply(vec![
                CacheHunk::Upsert(message("m1", "t1")),
                CacheHunk::AdvanceCursor(RecordType::Message, "s0".into(), "s1".into()),
            ])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::StaleCursorError(RecordType::Message, from, Some(to)) if from == "s0" && to == "s5"
        ));
        assert_eq!(cache.get("m1").await, None);
        assert_eq!(cache.get_cursor(RecordType::Message).await.as_deref(), Some("s5"));

        cache
            .apply(vec![CacheHunk::AdvanceCursor(
                RecordType::Message,
                "s5".into(),
                "s6".into(),
            )])
            .await
            .unwrap();
        assert_eq!(cache.get_cursor(RecordType::Message).await.as_deref(), Some("s6"));
    }

    #[tokio::test]
    async fn upsert_keeps_details() {
        let cache = MemoryCache::new();
        let details = crate::message::MessageDetails {
            blob_id: Some("b1".into()),
            ..Default::default()
        };

        cache
            .apply(vec![
                CacheHunk::Upsert(message("m1", "t1")),
                CacheHunk::SetDetails(DetailRecord {
                    id: "m1".into(),
                    details: details.clone(),
                }),
                CacheHunk::Upsert(message("m1", "t2")),
            ])
            .await
            .unwrap();

        let entry = cache.get("m1").await.unwrap();
        assert_eq!(entry.status, RecordStatus::Ready);
        assert_eq!(entry.message.thread_id.as_deref(), Some("t2"));
        assert_eq!(entry.message.details, Some(details));
    }

    #[tokio::test]
    async fn details_without_headers_are_partial() {
        let cache = MemoryCache::new();

        cache
            .apply(vec![CacheHunk::SetDetails(DetailRecord {
                id: "m1".into(),
                ..Default::default()
            })])
            .await
            .unwrap();

        assert_eq!(cache.get_status("m1").await, RecordStatus::Partial);
        assert_eq!(cache.get_status("unknown").await, RecordStatus::Empty);
    }

    #[tokio::test]
    async fn confirm_rekeys_local_message() {
        let cache = MemoryCache::new();

        cache
            .apply(vec![CacheHunk::Create(message("k0", "t1"))])
            .await
            .unwrap();
        assert_eq!(cache.get_status("k0").await, RecordStatus::New);

        let changes = cache
            .apply(vec![CacheHunk::Confirm(
                "k0".into(),
                CreatedMessage {
                    id: "m9".into(),
                    thread_id: Some("t9".into()),
                    blob_id: Some("b9".into()),
                    size: Some(42),
                },
            )])
            .await
            .unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(cache.get("k0").await, None);

        let entry = cache.get("m9").await.unwrap();
        assert_eq!(entry.status, RecordStatus::Ready);
        assert_eq!(entry.message.thread_id.as_deref(), Some("t9"));
        assert_eq!(entry.message.size, 42);
        assert_eq!(
            entry.message.details_status(entry.status),
            RecordStatus::Ready
        );
    }

    #[tokio::test]
    async fn invalidate_ignores_unknown_records() {
        let cache = MemoryCache::new();

        let changes = cache
            .apply(vec![CacheHunk::Invalidate("m1".into())])
            .await
            .unwrap();

        assert!(changes.iter().all(|change| change.is_noop()));
        assert!(cache.get_all().await.is_empty());
    }
}
