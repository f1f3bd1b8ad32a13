//! # Commit
//!
//! Module dedicated to the commit of local changes. Local changes are
//! gathered in [`MessageChanges`], applied optimistically to the
//! cache, then sent to the server. The server response reconciles
//! the cache: confirmed creations are rekeyed to their server id,
//! rejected changes are reverted.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::Ordering,
};

use tracing::{debug, info, warn};

use crate::{
    cache::{CacheEntry, CacheHunk, CachePatch, RecordCache, RecordType},
    message::{Id, Message, PartialMessage},
    protocol::{MessagesSetResponse, Request, SetMessages, SET_MESSAGES},
    transport::Transport,
    Error, Result,
};

use super::{diff, report::CommitReport, MessageSync, SyncEvent};

/// The local changes to commit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageChanges {
    pub create: Vec<Message>,
    pub update: BTreeMap<Id, PartialMessage>,
    pub destroy: BTreeSet<Id>,
}

impl MessageChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the given message to the creations. Its id is replaced by
    /// a creation id when committed.
    pub fn create(&mut self, message: Message) {
        self.create.push(message);
    }

    /// Adds the given properties to the updates of their message.
    pub fn update(&mut self, partial: PartialMessage) {
        match self.update.get_mut(&partial.id) {
            Some(update) => merge_partials(update, partial),
            None => {
                self.update.insert(partial.id.clone(), partial);
            }
        }
    }

    pub fn destroy(&mut self, id: impl ToString) {
        let id = id.to_string();
        self.update.remove(&id);
        self.destroy.insert(id);
    }

    pub fn with_create(mut self, message: Message) -> Self {
        self.create(message);
        self
    }

    pub fn with_update(mut self, partial: PartialMessage) -> Self {
        self.update(partial);
        self
    }

    pub fn with_destroy(mut self, id: impl ToString) -> Self {
        self.destroy(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.destroy.is_empty()
    }
}

fn merge_partials(into: &mut PartialMessage, from: PartialMessage) {
    macro_rules! take {
        ($($field:ident),*) => {
            $(if from.$field.is_some() {
                into.$field = from.$field;
            })*
        };
    }

    take!(
        thread_id,
        mailbox_ids,
        is_unread,
        is_flagged,
        is_answered,
        is_draft,
        has_attachment,
        subject,
        preview,
        size
    );
}

impl<T: Transport, C: RecordCache> MessageSync<T, C> {
    /// Commits the given local changes.
    ///
    /// Changes are applied to the cache before being sent. If the
    /// server cannot be reached or rejects the whole call, the cache
    /// is restored and the error is returned.
    pub async fn commit(&self, changes: MessageChanges) -> Result<CommitReport> {
        info!("committing local message changes");
        self.ensure_open()?;

        if changes.is_empty() {
            return Err(Error::CommitEmptyError);
        }

        let MessageChanges {
            create,
            update,
            destroy,
        } = changes;

        // snapshot of the records touched by updates and destructions
        let mut snapshot: BTreeMap<Id, Option<CacheEntry>> = BTreeMap::new();
        for id in update.keys() {
            match self.cache.get(id).await {
                Some(entry) => snapshot.insert(id.clone(), Some(entry)),
                None => return Err(Error::CommitUnknownMessageError(id.clone())),
            };
        }
        for id in &destroy {
            let entry = self.cache.get(id).await;
            snapshot.insert(id.clone(), entry);
        }

        let create: BTreeMap<Id, Message> = create
            .into_iter()
            .map(|mut msg| {
                msg.id = self.next_creation_id();
                (msg.id.clone(), msg)
            })
            .collect();

        let mut patch = CachePatch::new();
        patch.extend(create.values().cloned().map(CacheHunk::Create));
        patch.extend(update.values().cloned().map(CacheHunk::Merge));
        patch.extend(destroy.iter().cloned().map(CacheHunk::Remove));

        debug!("applying {} local change(s) optimistically", patch.len());
        let applied = diff::apply(self.cache.as_ref(), &self.views, patch).await?;
        self.emit_invalidated(&applied.invalidated).await;

        let req = Request::SetMessages(SetMessages {
            create: create.clone(),
            update,
            destroy: destroy.into_iter().collect(),
        });

        let res = match self.send_set(&req).await {
            Ok(res) => res,
            Err(err) => {
                warn!("cannot commit local changes, reverting them: {err}");
                self.revert(create.into_keys(), snapshot).await?;
                return Err(err);
            }
        };

        if self.is_closed() {
            debug!("sync context closed, dropping messages set response");
            self.emit(SyncEvent::DroppedResponse(SET_MESSAGES)).await;
            return Err(Error::ClosedError);
        }

        self.reconcile(res, snapshot).await
    }

    async fn send_set(&self, req: &Request) -> Result<MessagesSetResponse> {
        self.transport.send(req).await?.decode_set()
    }

    async fn revert(
        &self,
        created: impl IntoIterator<Item = Id>,
        snapshot: BTreeMap<Id, Option<CacheEntry>>,
    ) -> Result<()> {
        let mut patch: CachePatch = created.into_iter().map(CacheHunk::Remove).collect();
        patch.extend(snapshot.into_values().flatten().map(CacheHunk::Put));

        let applied = diff::apply(self.cache.as_ref(), &self.views, patch).await?;
        self.emit_invalidated(&applied.invalidated).await;

        Ok(())
    }

    async fn reconcile(
        &self,
        res: MessagesSetResponse,
        mut snapshot: BTreeMap<Id, Option<CacheEntry>>,
    ) -> Result<CommitReport> {
        let mut report = CommitReport {
            updated: res.updated,
            destroyed: res.destroyed,
            ..Default::default()
        };
        let mut patch = CachePatch::new();

        for (cid, created) in res.created {
            debug!("local message {cid} created as {}", created.id);
            report.created.insert(cid.clone(), created.id.clone());
            patch.push(CacheHunk::Confirm(cid, created));
        }

        for (cid, err) in res.not_created {
            warn!("server rejected creation of {cid}: {}", err.kind);
            patch.push(CacheHunk::Remove(cid.clone()));
            report.not_created.insert(cid, err);
        }

        for (id, err) in res.not_updated.into_iter().chain(res.not_destroyed.clone()) {
            warn!("server rejected change of message {id}: {}", err.kind);
            if let Some(Some(entry)) = snapshot.remove(&id) {
                patch.push(CacheHunk::Put(entry));
            }
            if res.not_destroyed.contains_key(&id) {
                report.not_destroyed.insert(id, err);
            } else {
                report.not_updated.insert(id, err);
            }
        }

        let advanced = match res.old_state {
            Some(old_state) => {
                let mut advancing = patch.clone();
                advancing.push(CacheHunk::AdvanceCursor(
                    RecordType::Message,
                    old_state,
                    res.new_state.clone(),
                ));
                match diff::apply(self.cache.as_ref(), &self.views, advancing).await {
                    Ok(applied) => Some(applied),
                    Err(Error::StaleCursorError(..)) => None,
                    Err(err) => return Err(err),
                }
            }
            None => None,
        };

        let applied = match advanced {
            Some(applied) => {
                debug!("advanced message cursor to {}", res.new_state);
                applied
            }
            None => {
                debug!("server state {} cannot be reached from cursor", res.new_state);
                self.refresh_needed.store(true, Ordering::SeqCst);
                report.refresh_needed = true;
                self.emit(SyncEvent::RefreshNeeded(res.new_state.clone()))
                    .await;
                diff::apply(self.cache.as_ref(), &self.views, patch).await?
            }
        };
        report.invalidated = applied.invalidated;

        self.emit(SyncEvent::CommittedChanges(
            report.created.len(),
            report.updated.len(),
            report.destroyed.len(),
        ))
        .await;
        self.emit_invalidated(&report.invalidated).await;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_of_same_message_are_merged() {
        let changes = MessageChanges::new()
            .with_update(PartialMessage::new("m1").with_unread(false))
            .with_update(PartialMessage::new("m1").with_flagged(true))
            .with_update(PartialMessage::new("m1").with_unread(true));

        assert_eq!(
            changes.update.get("m1"),
            Some(&PartialMessage::new("m1").with_unread(true).with_flagged(true))
        );
    }

    #[test]
    fn destroy_supersedes_update() {
        let changes = MessageChanges::new()
            .with_update(PartialMessage::new("m1").with_unread(false))
            .with_destroy("m1");

        assert!(changes.update.is_empty());
        assert!(changes.destroy.contains("m1"));
        assert!(!changes.is_empty());
    }
}
