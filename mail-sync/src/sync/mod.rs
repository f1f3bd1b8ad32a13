//! # Synchronization
//!
//! Module dedicated to the synchronization of the message cache with
//! the server. The main structure of this module is [`MessageSync`].
//!
//! The cache is kept up to date in two ways. Records can be fetched
//! by id ([`MessageSync::fetch`], [`MessageSync::fetch_details`]), or
//! refreshed ([`MessageSync::refresh`]). A full refresh asks the
//! server for the changes since the cached cursor, in successive
//! rounds driven by the [`UpdatePolicy`]. When the server cannot
//! compute the changes anymore, or when the escalation ladder is
//! exhausted, the whole cache is marked obsolete and the cursor jumps
//! to the current server state.

pub mod commit;
pub mod diff;
pub mod merge;
pub mod report;

use std::{
    collections::BTreeSet,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::lock::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    cache::{CacheHunk, CachePatch, RecordCache, RecordType},
    config::SyncConfig,
    message::{Id, Property, State, MUTABLE_PROPERTIES},
    policy::UpdatePolicy,
    protocol::{
        GetMessageUpdates, GetMessages, ListKind, Request, UpdatesReply, GET_MESSAGES,
        GET_MESSAGE_UPDATES,
    },
    status::RecordStatus,
    transport::Transport,
    view::{MailboxListing, ThreadRollup, ViewKey, Views},
    Error, Result,
};

use self::{
    diff::ChangeSet,
    report::{FetchReport, RefreshReport, RoundReport, UpdatesOutcome, UpdatesReport},
};

#[doc(inline)]
pub use self::commit::MessageChanges;

/// The synchronization event handler.
pub type SyncEventHandler =
    dyn Fn(SyncEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync;

/// The synchronization event.
///
/// Emitted by [`MessageSync`] while it applies server responses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncEvent {
    FetchedMessages(usize),
    RemovedMessages(usize),
    AppliedUpdates(UpdatePolicy, usize, usize),
    EscalatedPolicy(UpdatePolicy),
    RecoveredCache(Option<State>),
    CoalescedRefresh,
    DroppedResponse(&'static str),
    InvalidatedViews(BTreeSet<ViewKey>),
    CommittedChanges(usize, usize, usize),
    RefreshNeeded(State),
}

impl SyncEvent {
    pub async fn emit(&self, handler: &Option<Arc<SyncEventHandler>>) {
        if let Some(handler) = handler.as_ref() {
            if let Err(err) = handler(self.clone()).await {
                debug!("error while emitting sync event: {err}");
                trace!("{err:?}");
            } else {
                trace!("emitted sync event {self:?}");
            }
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchedMessages(n) => write!(f, "Fetched {n} messages"),
            Self::RemovedMessages(n) => write!(f, "Removed {n} messages"),
            Self::AppliedUpdates(policy, changed, removed) => {
                write!(f, "Applied {changed} changed and {removed} removed messages ({policy})")
            }
            Self::EscalatedPolicy(policy) => write!(f, "Escalated update policy to {policy}"),
            Self::RecoveredCache(Some(state)) => write!(f, "Recovered message cache at {state}"),
            Self::RecoveredCache(None) => write!(f, "Recovered message cache without cursor"),
            Self::CoalescedRefresh => write!(f, "Coalesced refresh into the current round"),
            Self::DroppedResponse(method) => write!(f, "Dropped response to {method}"),
            Self::InvalidatedViews(keys) => write!(f, "Invalidated {} views", keys.len()),
            Self::CommittedChanges(created, updated, destroyed) => write!(
                f,
                "Committed {created} created, {updated} updated and {destroyed} destroyed messages"
            ),
            Self::RefreshNeeded(state) => write!(f, "Server state {state} requires a refresh"),
        }
    }
}

/// Marks the update round as in flight, and releases it on drop.
struct RoundGuard<'a>(&'a AtomicBool);

impl<'a> RoundGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The message synchronization controller.
///
/// Owns the update policy of the message record type, and applies
/// server responses to the given cache.
pub struct MessageSync<T: Transport, C: RecordCache> {
    transport: T,
    cache: Arc<C>,
    config: SyncConfig,
    views: Views,
    policy: Mutex<UpdatePolicy>,
    /// Ids of the messages currently being fetched.
    fetching: Mutex<BTreeSet<Id>>,
    round: AtomicBool,
    pending: AtomicBool,
    refresh_needed: AtomicBool,
    closed: AtomicBool,
    creation_ids: AtomicUsize,
    handler: Option<Arc<SyncEventHandler>>,
}

impl<T: Transport, C: RecordCache> MessageSync<T, C> {
    pub fn new(transport: T, cache: Arc<C>) -> Self {
        Self {
            transport,
            cache,
            config: SyncConfig::default(),
            views: Views::new(),
            policy: Mutex::new(UpdatePolicy::default()),
            fetching: Mutex::default(),
            round: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            refresh_needed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            creation_ids: AtomicUsize::new(0),
            handler: None,
        }
    }

    pub fn set_config(&mut self, config: SyncConfig) {
        self.policy = Mutex::new(UpdatePolicy::initial(&config));
        self.config = config;
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.set_config(config);
        self
    }

    pub fn set_some_handler<F: Future<Output = Result<()>> + Send + 'static>(
        &mut self,
        handler: Option<impl Fn(SyncEvent) -> F + Send + Sync + 'static>,
    ) {
        self.handler = match handler {
            Some(handler) => Some(Arc::new(move |evt| Box::pin(handler(evt)))),
            None => None,
        };
    }

    pub fn set_handler<F: Future<Output = Result<()>> + Send + 'static>(
        &mut self,
        handler: impl Fn(SyncEvent) -> F + Send + Sync + 'static,
    ) {
        self.set_some_handler(Some(handler));
    }

    pub fn with_some_handler<F: Future<Output = Result<()>> + Send + 'static>(
        mut self,
        handler: Option<impl Fn(SyncEvent) -> F + Send + Sync + 'static>,
    ) -> Self {
        self.set_some_handler(handler);
        self
    }

    pub fn with_handler<F: Future<Output = Result<()>> + Send + 'static>(
        mut self,
        handler: impl Fn(SyncEvent) -> F + Send + Sync + 'static,
    ) -> Self {
        self.set_handler(handler);
        self
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the policy the next update round will be requested
    /// with.
    pub async fn policy(&self) -> UpdatePolicy {
        *self.policy.lock().await
    }

    /// Returns `true` if the server reported a state the cache did
    /// not catch up with yet.
    pub fn is_refresh_needed(&self) -> bool {
        self.refresh_needed.load(Ordering::SeqCst)
    }

    /// Tears down the sync context.
    ///
    /// Responses of rounds still in flight are dropped on arrival,
    /// and new operations fail with [`Error::ClosedError`].
    pub fn close(&self) {
        info!("closing message sync context");
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ClosedError)
        } else {
            Ok(())
        }
    }

    async fn emit(&self, evt: SyncEvent) {
        evt.emit(&self.handler).await
    }

    async fn emit_invalidated(&self, keys: &BTreeSet<ViewKey>) {
        if !keys.is_empty() {
            self.emit(SyncEvent::InvalidatedViews(keys.clone())).await;
        }
    }

    /// Lists the given ids whose header tier needs to be fetched.
    pub async fn missing(&self, ids: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<Id> {
        let mut missing = Vec::new();
        for id in ids {
            let id = id.as_ref();
            if self.cache.get_status(id).await.needs_fetch() {
                missing.push(id.to_owned());
            }
        }
        missing
    }

    /// Returns `true` if the detail tier of the given message needs
    /// to be fetched.
    pub async fn needs_details(&self, id: &str) -> bool {
        match self.cache.get(id).await {
            Some(entry) => entry.message.details_status(entry.status) != RecordStatus::Ready,
            None => true,
        }
    }

    /// Fetches the header tier of the given messages.
    pub async fn fetch(&self, ids: impl IntoIterator<Item = impl ToString>) -> Result<FetchReport> {
        info!("fetching messages headers");
        let props = self.config.header_properties();
        self.fetch_tier(ids, props, ListKind::Records).await
    }

    /// Fetches the detail tier of the given messages.
    pub async fn fetch_details(&self, ids: impl IntoIterator<Item = impl ToString>) -> Result<FetchReport> {
        info!("fetching messages details");
        let props = self.config.detail_properties();
        self.fetch_tier(ids, props, ListKind::Details).await
    }

    async fn fetch_tier(
        &self,
        ids: impl IntoIterator<Item = impl ToString>,
        properties: Vec<Property>,
        kind: ListKind,
    ) -> Result<FetchReport> {
        self.ensure_open()?;

        let ids: Vec<Id> = ids.into_iter().map(|id| id.to_string()).collect();
        if ids.is_empty() {
            return Err(Error::FetchEmptyError);
        }

        let mut report = FetchReport::default();

        let ids = {
            let mut fetching = self.fetching.lock().await;
            let (skipped, ids): (Vec<_>, Vec<_>) =
                ids.into_iter().partition(|id| fetching.contains(id));
            fetching.extend(ids.iter().cloned());
            report.skipped = skipped;
            ids
        };

        if !report.skipped.is_empty() {
            debug!("skipping {} message(s) already being fetched", report.skipped.len());
        }

        if ids.is_empty() {
            return Ok(report);
        }

        let res = self.fetch_ids(&ids, properties, kind, &mut report).await;

        let mut fetching = self.fetching.lock().await;
        for id in &ids {
            fetching.remove(id);
        }

        res.map(|()| report)
    }

    async fn fetch_ids(
        &self,
        ids: &[Id],
        properties: Vec<Property>,
        kind: ListKind,
        report: &mut FetchReport,
    ) -> Result<()> {
        let req = Request::GetMessages(GetMessages {
            ids: ids.to_vec(),
            properties,
            kind,
        });
        let res = self.transport.send(&req).await?.decode_messages(kind)?;

        if self.is_closed() {
            debug!("sync context closed, dropping messages response");
            self.emit(SyncEvent::DroppedResponse(GET_MESSAGES)).await;
            return Err(Error::ClosedError);
        }

        let state = res.state.clone();
        let set = ChangeSet::from_messages(res);
        report.fetched = set.fetched_ids();
        report.not_found = set.removed.clone();

        let mut patch = set.into_patch();

        // records fetched by id do not bring updates: only a missing
        // cursor can be initialized from them
        if let Some(state) = state {
            match self.cache.get_cursor(RecordType::Message).await {
                None => {
                    debug!("initializing message cursor to {state}");
                    patch.push(CacheHunk::SetCursor(RecordType::Message, Some(state)));
                }
                Some(cursor) if cursor != state => {
                    debug!("server state {state} differs from cursor {cursor}");
                    self.refresh_needed.store(true, Ordering::SeqCst);
                    self.emit(SyncEvent::RefreshNeeded(state)).await;
                }
                Some(_) => (),
            }
        }

        let applied = diff::apply(self.cache.as_ref(), &self.views, patch).await?;
        report.invalidated = applied.invalidated;

        self.emit(SyncEvent::FetchedMessages(report.fetched.len())).await;
        if !report.not_found.is_empty() {
            self.emit(SyncEvent::RemovedMessages(report.not_found.len())).await;
        }
        self.emit_invalidated(&report.invalidated).await;

        Ok(())
    }

    /// Refreshes the given messages, or all of them when no id is
    /// given.
    pub async fn refresh(&self, ids: Option<Vec<Id>>) -> Result<RefreshReport> {
        match ids {
            Some(ids) => Ok(RefreshReport::Records(self.refresh_records(ids).await?)),
            None => Ok(RefreshReport::Updates(self.refresh_all().await?)),
        }
    }

    /// Refetches the mutable properties of the given messages.
    ///
    /// The received properties are merged into the cached messages.
    /// The cursor is left untouched.
    pub async fn refresh_records(&self, ids: impl IntoIterator<Item = impl ToString>) -> Result<FetchReport> {
        info!("refreshing messages mutable properties");
        self.ensure_open()?;

        let ids: Vec<Id> = ids.into_iter().map(|id| id.to_string()).collect();
        if ids.is_empty() {
            return Err(Error::FetchEmptyError);
        }

        let req = Request::GetMessages(GetMessages {
            ids,
            properties: MUTABLE_PROPERTIES.to_vec(),
            kind: ListKind::Partials,
        });
        let res = self
            .transport
            .send(&req)
            .await?
            .decode_messages(ListKind::Partials)?;

        if self.is_closed() {
            debug!("sync context closed, dropping messages response");
            self.emit(SyncEvent::DroppedResponse(GET_MESSAGES)).await;
            return Err(Error::ClosedError);
        }

        let set = ChangeSet::from_messages(res);
        let mut report = FetchReport {
            fetched: set.fetched_ids(),
            not_found: set.removed.clone(),
            ..Default::default()
        };

        let applied = diff::apply(self.cache.as_ref(), &self.views, set.into_patch()).await?;
        report.invalidated = applied.invalidated;
        self.emit_invalidated(&report.invalidated).await;

        Ok(report)
    }

    /// Brings the cache up to date with the server, starting from the
    /// cached cursor.
    ///
    /// At most one update round is in flight at a time: a refresh
    /// requested while a round is in flight is coalesced into it, and
    /// the in-flight refresh performs one more pass before returning.
    pub async fn refresh_all(&self) -> Result<UpdatesReport> {
        info!("refreshing all messages");
        self.ensure_open()?;

        let Some(mut guard) = RoundGuard::acquire(&self.round) else {
            debug!("update round already in flight, coalescing refresh");
            self.pending.store(true, Ordering::SeqCst);
            self.emit(SyncEvent::CoalescedRefresh).await;
            return Ok(UpdatesReport::new(UpdatesOutcome::Coalesced));
        };

        let mut report = UpdatesReport::default();

        report.outcome = loop {
            self.pending.store(false, Ordering::SeqCst);
            let outcome = self.run_rounds(&mut report).await?;

            if !matches!(outcome, UpdatesOutcome::Completed | UpdatesOutcome::Recovered) {
                break outcome;
            }

            if self.pending.load(Ordering::SeqCst) {
                debug!("performing coalesced refresh");
                continue;
            }

            drop(guard);

            // a refresh may have been coalesced right before the
            // release of the round
            let next = if self.pending.load(Ordering::SeqCst) {
                RoundGuard::acquire(&self.round)
            } else {
                None
            };

            match next {
                Some(next) => guard = next,
                None => break outcome,
            }
        };

        Ok(report)
    }

    async fn run_rounds(&self, report: &mut UpdatesReport) -> Result<UpdatesOutcome> {
        let ladder = self.config.max_changes_ladder();

        loop {
            if self.is_closed() {
                return Ok(UpdatesOutcome::Cancelled);
            }

            let Some(cursor) = self.cache.get_cursor(RecordType::Message).await else {
                debug!("no message cursor yet, nothing to refresh from");
                return Ok(UpdatesOutcome::NoCursor);
            };

            let policy = self.policy().await;
            debug!("requesting updates since {cursor} ({policy})");

            let req = Request::GetMessageUpdates(GetMessageUpdates {
                since_state: cursor.clone(),
                max_changes: policy.max_changes,
                fetch_records: policy.fetch_records,
                fetch_record_properties: policy
                    .fetch_records
                    .then(|| self.config.header_properties()),
            });

            let reply = self
                .transport
                .send(&req)
                .await?
                .decode_updates(policy.fetch_records)?;

            if self.is_closed() {
                debug!("sync context closed, dropping message updates response");
                self.emit(SyncEvent::DroppedResponse(GET_MESSAGE_UPDATES))
                    .await;
                return Ok(UpdatesOutcome::Cancelled);
            }

            let (updates, records) = match reply {
                UpdatesReply::Updates(updates, records) => (updates, records),
                UpdatesReply::CannotCalculateChanges(state) => {
                    warn!("cannot calculate changes since {cursor}, recovering cache");
                    self.recover(state, report).await?;
                    return Ok(UpdatesOutcome::Recovered);
                }
            };

            if updates.old_state != cursor {
                return Err(Error::CursorMismatchError(
                    GET_MESSAGE_UPDATES.to_owned(),
                    Some(cursor),
                ));
            }

            let round = RoundReport {
                policy,
                old_state: updates.old_state.clone(),
                new_state: updates.new_state.clone(),
                changed: updates.changed.len(),
                removed: updates.removed.len(),
                has_more_updates: updates.has_more_updates,
            };
            trace!("round: {round:#?}");

            let mut patch = ChangeSet::from_updates(updates, records).into_patch();
            patch.push(CacheHunk::AdvanceCursor(
                RecordType::Message,
                cursor,
                round.new_state.clone(),
            ));

            let applied = match diff::apply(self.cache.as_ref(), &self.views, patch).await {
                Ok(applied) => applied,
                Err(Error::StaleCursorError(_, from, to)) => {
                    // the cursor moved while the round was in flight
                    debug!("message cursor moved from {from} to {to:?}, reissuing round");
                    self.emit(SyncEvent::DroppedResponse(GET_MESSAGE_UPDATES))
                        .await;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mut invalidated = applied.invalidated;

            // ids-only rounds cannot tell where changed records moved
            if !policy.fetch_records {
                invalidated.extend(self.views.invalidate_listings().await);
            }

            self.emit(SyncEvent::AppliedUpdates(policy, round.changed, round.removed))
                .await;
            self.emit_invalidated(&invalidated).await;
            report.invalidated.extend(invalidated);

            let has_more_updates = round.has_more_updates;
            let new_state = round.new_state.clone();
            report.rounds.push(round);

            if !has_more_updates {
                *self.policy.lock().await = UpdatePolicy::initial(&self.config);
                self.refresh_needed.store(false, Ordering::SeqCst);
                return Ok(UpdatesOutcome::Completed);
            }

            match policy.escalate(&ladder) {
                Some(next) => {
                    debug!("more updates available, escalating policy to {next}");
                    *self.policy.lock().await = next;
                    self.emit(SyncEvent::EscalatedPolicy(next)).await;
                }
                None => {
                    warn!("escalation ladder exhausted, recovering cache");
                    self.recover(Some(new_state), report).await?;
                    return Ok(UpdatesOutcome::Recovered);
                }
            }
        }
    }

    /// Gives up the incremental path: marks every cached message as
    /// obsolete and moves the cursor to the given server state.
    async fn recover(&self, state: Option<State>, report: &mut UpdatesReport) -> Result<()> {
        info!("recovering message cache");

        let mut patch: CachePatch = self
            .cache
            .get_all()
            .await
            .into_iter()
            .map(CacheHunk::MarkObsolete)
            .collect();
        patch.push(CacheHunk::SetCursor(RecordType::Message, state.clone()));

        self.cache.apply(patch).await?;

        let invalidated = self.views.invalidate_all().await;
        *self.policy.lock().await = UpdatePolicy::initial(&self.config);
        self.refresh_needed.store(false, Ordering::SeqCst);

        self.emit(SyncEvent::RecoveredCache(state.clone())).await;
        self.emit_invalidated(&invalidated).await;

        report.recovered_state = state;
        report.invalidated.extend(invalidated);

        Ok(())
    }

    /// Gets the rollup of the given thread.
    pub async fn thread(&self, thread_id: &str) -> ThreadRollup {
        self.views.thread(self.cache.as_ref(), thread_id).await
    }

    /// Gets the rollup of the thread of the given message, if the
    /// message and its thread are known.
    pub async fn thread_of(&self, id: &str) -> Option<ThreadRollup> {
        let thread_id = self.cache.get(id).await?.message.thread_id?;
        Some(self.thread(&thread_id).await)
    }

    /// Gets the listing of the given mailbox.
    pub async fn mailbox_listing(&self, mailbox_id: &str) -> MailboxListing {
        self.views.mailbox(self.cache.as_ref(), mailbox_id).await
    }

    fn next_creation_id(&self) -> Id {
        format!("k{}", self.creation_ids.fetch_add(1, Ordering::SeqCst))
    }
}
