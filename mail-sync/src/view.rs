//! # Views
//!
//! Module dedicated to the views derived from cached messages: the
//! rollup of a thread ([`ThreadRollup`]) and the listing of a mailbox
//! ([`MailboxListing`]).
//!
//! Views are never recomputed when a message changes. A change only
//! invalidates the views depending on the message, following the
//! edges of the dependency graph. The view is then recomputed on the
//! next read.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use chrono::{DateTime, FixedOffset};
use futures::lock::Mutex;
use tracing::{debug, trace};

use crate::{
    cache::{CacheEntry, RecordCache, RecordChange},
    message::{Id, Property, THREAD_PROPERTIES},
};

/// The key of a derived view.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ViewKey {
    Thread(Id),
    Mailbox(Id),
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(id) => write!(f, "thread {id}"),
            Self::Mailbox(id) => write!(f, "mailbox {id}"),
        }
    }
}

/// The rollup of the messages of a thread.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ThreadRollup {
    pub thread_id: Id,
    /// Messages of the thread, oldest first.
    pub message_ids: Vec<Id>,
    pub unread_count: usize,
    pub is_flagged: bool,
    pub has_attachment: bool,
    /// Distinct sender names, in order of first appearance.
    pub senders: Vec<String>,
    pub total_size: u64,
    pub last_date: Option<DateTime<FixedOffset>>,
}

impl ThreadRollup {
    fn compute(thread_id: &str, mut entries: Vec<CacheEntry>) -> Self {
        entries.sort_by(|a, b| {
            (a.message.date, &a.message.id).cmp(&(b.message.date, &b.message.id))
        });

        let mut rollup = Self {
            thread_id: thread_id.to_owned(),
            ..Default::default()
        };

        for entry in entries {
            let msg = entry.message;

            if msg.is_unread {
                rollup.unread_count += 1;
            }
            rollup.is_flagged |= msg.is_flagged;
            rollup.has_attachment |= msg.has_attachment;
            rollup.total_size += msg.size;

            let sender = msg.from_name();
            if !sender.is_empty() && !rollup.senders.contains(&sender) {
                rollup.senders.push(sender);
            }

            if msg.date > rollup.last_date {
                rollup.last_date = msg.date;
            }

            rollup.message_ids.push(msg.id);
        }

        rollup
    }
}

/// The listing of the messages of a mailbox.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MailboxListing {
    pub mailbox_id: Id,
    /// Messages of the mailbox, most recent first.
    pub message_ids: Vec<Id>,
    pub unread_count: usize,
}

impl MailboxListing {
    fn compute(mailbox_id: &str, mut entries: Vec<CacheEntry>) -> Self {
        entries.sort_by(|a, b| {
            (b.message.date, &b.message.id).cmp(&(a.message.date, &a.message.id))
        });

        Self {
            mailbox_id: mailbox_id.to_owned(),
            unread_count: entries.iter().filter(|e| e.message.is_unread).count(),
            message_ids: entries.into_iter().map(|e| e.message.id).collect(),
        }
    }
}

#[derive(Default)]
struct ViewsInner {
    /// Edges of the dependency graph, from message ids to the views
    /// computed out of them.
    edges: HashMap<Id, BTreeSet<ViewKey>>,
    threads: HashMap<Id, ThreadRollup>,
    listings: HashMap<Id, MailboxListing>,
}

impl ViewsInner {
    fn subscribe(&mut self, ids: &[Id], key: &ViewKey) {
        for id in ids {
            self.edges
                .entry(id.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    fn unsubscribe(&mut self, key: &ViewKey) {
        self.edges.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    /// Drops the computed view matching the given key, together with
    /// its edges. Returns `true` if the view was active.
    fn drop_view(&mut self, key: &ViewKey) -> bool {
        let active = match key {
            ViewKey::Thread(id) => self.threads.remove(id).is_some(),
            ViewKey::Mailbox(id) => self.listings.remove(id).is_some(),
        };
        if active {
            self.unsubscribe(key);
        }
        active
    }
}

/// The derived views and their dependency graph.
#[derive(Default)]
pub struct Views(Mutex<ViewsInner>);

impl Views {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidates views depending on the given record changes.
    ///
    /// Returns the keys of the views that were active and need to be
    /// recomputed.
    pub async fn invalidate(&self, changes: &[RecordChange]) -> BTreeSet<ViewKey> {
        let mut inner = self.0.lock().await;
        let mut keys = BTreeSet::new();

        for change in changes.iter().filter(|change| !change.is_noop()) {
            let props = change.properties();
            let membership = change.before.is_none() || change.after.is_none();

            let thread_stale = membership
                || props.contains(&Property::ThreadId)
                || THREAD_PROPERTIES.iter().any(|prop| props.contains(prop));
            let listing_stale = membership
                || props.contains(&Property::MailboxIds)
                || props.contains(&Property::Date)
                || props.contains(&Property::IsUnread);

            let edges = if change.after.is_none() {
                inner.edges.remove(&change.id)
            } else {
                inner.edges.get(&change.id).cloned()
            };
            let targets = edges
                .unwrap_or_default()
                .into_iter()
                .chain(change.thread_ids().into_iter().map(ViewKey::Thread))
                .chain(change.mailbox_ids().into_iter().map(ViewKey::Mailbox));

            for key in targets {
                let stale = match key {
                    ViewKey::Thread(_) => thread_stale,
                    ViewKey::Mailbox(_) => listing_stale,
                };

                if stale && inner.drop_view(&key) {
                    trace!("invalidating {key} because of message {}", change.id);
                    keys.insert(key);
                }
            }
        }

        keys
    }

    /// Invalidates every active mailbox listing.
    pub async fn invalidate_listings(&self) -> BTreeSet<ViewKey> {
        let mut inner = self.0.lock().await;
        let keys: BTreeSet<_> = inner.listings.drain().map(|(id, _)| ViewKey::Mailbox(id)).collect();
        for key in &keys {
            inner.unsubscribe(key);
        }
        debug!("invalidated {} mailbox listing(s)", keys.len());
        keys
    }

    /// Invalidates every active view.
    pub async fn invalidate_all(&self) -> BTreeSet<ViewKey> {
        let mut inner = self.0.lock().await;
        let mut keys: BTreeSet<_> = inner.threads.drain().map(|(id, _)| ViewKey::Thread(id)).collect();
        keys.extend(inner.listings.drain().map(|(id, _)| ViewKey::Mailbox(id)));
        inner.edges.clear();
        debug!("invalidated {} view(s)", keys.len());
        keys
    }

    /// Returns `true` if the view matching the given key is computed
    /// and up to date.
    pub async fn is_active(&self, key: &ViewKey) -> bool {
        let inner = self.0.lock().await;
        match key {
            ViewKey::Thread(id) => inner.threads.contains_key(id),
            ViewKey::Mailbox(id) => inner.listings.contains_key(id),
        }
    }

    /// Gets the rollup of the given thread, recomputing it if needed.
    pub async fn thread<C: RecordCache + ?Sized>(&self, cache: &C, thread_id: &str) -> ThreadRollup {
        let mut inner = self.0.lock().await;

        if let Some(rollup) = inner.threads.get(thread_id) {
            return rollup.clone();
        }

        debug!("recomputing rollup of thread {thread_id}");
        let entries = cache
            .entries()
            .await
            .into_iter()
            .filter(|entry| entry.message.thread_id.as_deref() == Some(thread_id))
            .collect();
        let rollup = ThreadRollup::compute(thread_id, entries);

        inner.subscribe(&rollup.message_ids, &ViewKey::Thread(thread_id.to_owned()));
        inner.threads.insert(thread_id.to_owned(), rollup.clone());
        rollup
    }

    /// Gets the listing of the given mailbox, recomputing it if
    /// needed.
    pub async fn mailbox<C: RecordCache + ?Sized>(&self, cache: &C, mailbox_id: &str) -> MailboxListing {
        let mut inner = self.0.lock().await;

        if let Some(listing) = inner.listings.get(mailbox_id) {
            return listing.clone();
        }

        debug!("recomputing listing of mailbox {mailbox_id}");
        let entries = cache
            .entries()
            .await
            .into_iter()
            .filter(|entry| entry.message.mailbox_ids.contains(mailbox_id))
            .collect();
        let listing = MailboxListing::compute(mailbox_id, entries);

        inner.subscribe(&listing.message_ids, &ViewKey::Mailbox(mailbox_id.to_owned()));
        inner.listings.insert(mailbox_id.to_owned(), listing.clone());
        listing
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        cache::{CacheHunk, MemoryCache},
        message::{Address, Message, PartialMessage},
    };

    use super::*;

    fn message(id: &str, thread: &str, mailbox: &str, date: &str) -> Message {
        Message {
            thread_id: Some(thread.into()),
            mailbox_ids: [mailbox.to_owned()].into(),
            from: Some(Address::new_nameless(format!("{id}@localhost"))),
            date: DateTime::parse_from_rfc3339(date).ok(),
            size: 10,
            ..Message::new(id)
        }
    }

    async fn cache() -> MemoryCache {
        let cache = MemoryCache::new();
        cache
            .apply(vec![
                CacheHunk::Upsert(message("m1", "t1", "inbox", "2015-06-01T10:00:00Z")),
                CacheHunk::Upsert(message("m2", "t1", "inbox", "2015-06-02T10:00:00Z")),
                CacheHunk::Upsert(message("m3", "t2", "sent", "2015-06-03T10:00:00Z")),
            ])
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn thread_rollup() {
        let cache = cache().await;
        let views = Views::new();

        let rollup = views.thread(&cache, "t1").await;
        assert_eq!(rollup.message_ids, vec!["m1", "m2"]);
        assert_eq!(rollup.senders, vec!["m1", "m2"]);
        assert_eq!(rollup.total_size, 20);
        assert_eq!(rollup.unread_count, 0);
        assert!(views.is_active(&ViewKey::Thread("t1".into())).await);
    }

    #[tokio::test]
    async fn flag_change_invalidates_thread_only() {
        let cache = cache().await;
        let views = Views::new();
        views.thread(&cache, "t1").await;
        views.thread(&cache, "t2").await;
        views.mailbox(&cache, "inbox").await;

        let changes = cache
            .apply(vec![CacheHunk::Merge(PartialMessage::new("m1").with_flagged(true))])
            .await
            .unwrap();
        let keys = views.invalidate(&changes).await;

        assert_eq!(keys, BTreeSet::from([ViewKey::Thread("t1".into())]));
        assert!(!views.is_active(&ViewKey::Thread("t1".into())).await);
        assert!(views.is_active(&ViewKey::Thread("t2".into())).await);
        assert!(views.is_active(&ViewKey::Mailbox("inbox".into())).await);

        let rollup = views.thread(&cache, "t1").await;
        assert!(rollup.is_flagged);
    }

    #[tokio::test]
    async fn move_invalidates_both_listings() {
        let cache = cache().await;
        let views = Views::new();
        views.mailbox(&cache, "inbox").await;
        views.mailbox(&cache, "sent").await;

        let changes = cache
            .apply(vec![CacheHunk::Merge(
                PartialMessage::new("m2").with_mailbox_ids(["sent"]),
            )])
            .await
            .unwrap();
        let keys = views.invalidate(&changes).await;

        assert!(keys.contains(&ViewKey::Mailbox("inbox".into())));
        assert!(keys.contains(&ViewKey::Mailbox("sent".into())));

        let sent = views.mailbox(&cache, "sent").await;
        assert_eq!(sent.message_ids, vec!["m3", "m2"]);
        let inbox = views.mailbox(&cache, "inbox").await;
        assert_eq!(inbox.message_ids, vec!["m1"]);
    }

    #[tokio::test]
    async fn removal_invalidates_dependents() {
        let cache = cache().await;
        let views = Views::new();
        views.thread(&cache, "t1").await;

        let changes = cache
            .apply(vec![CacheHunk::Remove("m2".into())])
            .await
            .unwrap();
        views.invalidate(&changes).await;

        let rollup = views.thread(&cache, "t1").await;
        assert_eq!(rollup.message_ids, vec!["m1"]);
    }

    #[tokio::test]
    async fn dropped_views_release_their_edges() {
        let cache = cache().await;
        let views = Views::new();
        views.thread(&cache, "t1").await;
        views.mailbox(&cache, "inbox").await;
        views.mailbox(&cache, "sent").await;

        let changes = cache
            .apply(vec![CacheHunk::Merge(PartialMessage::new("m1").with_draft(true))])
            .await
            .unwrap();
        views.invalidate(&changes).await;
        views.invalidate_listings().await;

        assert!(views.0.lock().await.edges.is_empty());

        views.thread(&cache, "t1").await;
        let edges = views.0.lock().await.edges.clone();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges["m1"], BTreeSet::from([ViewKey::Thread("t1".into())]));
    }

    #[tokio::test]
    async fn unrelated_changes_keep_views() {
        let cache = cache().await;
        let views = Views::new();
        views.thread(&cache, "t1").await;

        let changes = cache
            .apply(vec![CacheHunk::Merge(PartialMessage::new("m1").with_answered(true))])
            .await
            .unwrap();

        assert!(views.invalidate(&changes).await.is_empty());
        assert!(views.is_active(&ViewKey::Thread("t1".into())).await);
    }
}
