//! # Partial merge
//!
//! Module dedicated to the merge of partial property sets into cached
//! messages. Only the properties carried by the [`PartialMessage`]
//! are overlaid: absent properties are left untouched, and the detail
//! tier of the cached message is never modified.

use std::collections::BTreeSet;

use tracing::trace;

use crate::{
    cache::CacheEntry,
    message::{Message, PartialMessage, Property},
    status::{RecordStatus, StatusEvent},
};

/// Overlays the properties carried by the partial message on top of
/// the given message.
///
/// Returns the list of properties whose value actually changed.
pub fn overlay(msg: &mut Message, partial: &PartialMessage) -> BTreeSet<Property> {
    let mut changed = BTreeSet::new();

    macro_rules! set {
        ($field:ident, $prop:expr) => {
            if let Some(value) = &partial.$field {
                if msg.$field != *value {
                    msg.$field = value.clone();
                    changed.insert($prop);
                }
            }
        };
    }

    set!(thread_id, Property::ThreadId);
    set!(mailbox_ids, Property::MailboxIds);
    set!(is_unread, Property::IsUnread);
    set!(is_flagged, Property::IsFlagged);
    set!(is_answered, Property::IsAnswered);
    set!(is_draft, Property::IsDraft);
    set!(has_attachment, Property::HasAttachment);
    set!(subject, Property::Subject);
    set!(preview, Property::Preview);
    set!(size, Property::Size);

    changed
}

/// Merges the partial message into the given cache entry.
///
/// A partial message for an unknown record creates a new entry that
/// only holds the given properties.
pub fn merge(entry: Option<CacheEntry>, partial: &PartialMessage) -> CacheEntry {
    let mut entry = entry.unwrap_or_else(|| {
        trace!("creating partial entry for unknown message {}", partial.id);
        CacheEntry::new(Message::new(&partial.id), RecordStatus::Empty)
    });

    let changed = overlay(&mut entry.message, partial);
    trace!("merged properties {changed:?} into message {}", partial.id);

    entry.status = entry.status.next(StatusEvent::PartiallyFetched);
    entry
}
