//! # Mailbox
//!
//! Messages reference mailboxes by id. Mailboxes themselves are
//! managed elsewhere: the cache only needs to know them in order to
//! answer role lookups like [`Message::is_in`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    cache::RecordCache,
    message::{Id, Message},
};

/// The mailbox role.
///
/// A role gives a specific purpose to a mailbox, whatever its name.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxRole {
    Inbox,
    Archive,
    Drafts,
    Outbox,
    Sent,
    Trash,
    Spam,
    Templates,
    #[serde(other)]
    Other,
}

impl fmt::Display for MailboxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox => write!(f, "inbox"),
            Self::Archive => write!(f, "archive"),
            Self::Drafts => write!(f, "drafts"),
            Self::Outbox => write!(f, "outbox"),
            Self::Sent => write!(f, "sent"),
            Self::Trash => write!(f, "trash"),
            Self::Spam => write!(f, "spam"),
            Self::Templates => write!(f, "templates"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// The mailbox record.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mailbox {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<Id>,
    #[serde(default)]
    pub role: Option<MailboxRole>,
}

impl Mailbox {
    pub fn new(id: impl ToString, name: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: MailboxRole) -> Self {
        self.role = Some(role);
        self
    }
}

impl Message {
    /// Returns `true` if one of the mailboxes of the message has the
    /// given role.
    ///
    /// Mailbox ids unknown to the cache are ignored: the reference is
    /// kept and resolves once the mailbox becomes available.
    pub async fn is_in<C: RecordCache + ?Sized>(&self, cache: &C, role: &MailboxRole) -> bool {
        for id in &self.mailbox_ids {
            if let Some(mailbox) = cache.get_mailbox(id).await {
                if mailbox.role.as_ref() == Some(role) {
                    return true;
                }
            }
        }
        false
    }

    pub async fn is_in_trash<C: RecordCache + ?Sized>(&self, cache: &C) -> bool {
        self.is_in(cache, &MailboxRole::Trash).await
    }
}
