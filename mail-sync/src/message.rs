//! # Message
//!
//! Module dedicated to the message record as it is cached on the
//! client side. The main structure is [`Message`], which holds the
//! header tier of a message and optionally its detail tier
//! ([`MessageDetails`]).
//!
//! The header tier and the detail tier are two disjoint sets of
//! properties, fetched separately: see [`HEADER_PROPERTIES`] and
//! [`DETAIL_PROPERTIES`]. A [`PartialMessage`] carries only some
//! properties of a message, and is merged on top of the cached
//! message without touching what it does not carry.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};

use crate::status::RecordStatus;

/// Alias for server-assigned record identifiers.
pub type Id = String;

/// Alias for the opaque change cursor returned by the server.
pub type State = String;

/// The message property.
///
/// Enumeration of all the properties the library knows how to ask
/// the server for. The serialized form is the name used on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Property {
    ThreadId,
    MailboxIds,
    IsUnread,
    IsFlagged,
    IsAnswered,
    IsDraft,
    HasAttachment,
    From,
    To,
    Subject,
    Date,
    Size,
    Preview,

    BlobId,
    InReplyToMessageId,
    #[serde(rename = "headers.List-Id")]
    ListIdHeader,
    #[serde(rename = "headers.List-Post")]
    ListPostHeader,
    Cc,
    Bcc,
    ReplyTo,
    Body,
    Attachments,
    AttachedMessages,
    AttachedInvites,
}

impl Property {
    /// Returns the name of the property as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadId => "threadId",
            Self::MailboxIds => "mailboxIds",
            Self::IsUnread => "isUnread",
            Self::IsFlagged => "isFlagged",
            Self::IsAnswered => "isAnswered",
            Self::IsDraft => "isDraft",
            Self::HasAttachment => "hasAttachment",
            Self::From => "from",
            Self::To => "to",
            Self::Subject => "subject",
            Self::Date => "date",
            Self::Size => "size",
            Self::Preview => "preview",
            Self::BlobId => "blobId",
            Self::InReplyToMessageId => "inReplyToMessageId",
            Self::ListIdHeader => "headers.List-Id",
            Self::ListPostHeader => "headers.List-Post",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
            Self::ReplyTo => "replyTo",
            Self::Body => "body",
            Self::Attachments => "attachments",
            Self::AttachedMessages => "attachedMessages",
            Self::AttachedInvites => "attachedInvites",
        }
    }

    /// Returns the tier the property belongs to.
    pub fn tier(&self) -> PropertyTier {
        if HEADER_PROPERTIES.contains(self) {
            PropertyTier::Header
        } else {
            PropertyTier::Detail
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The property tier.
///
/// Header and detail properties are fetched and cached
/// independently: a message can be ready for its headers while its
/// details are still empty.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PropertyTier {
    Header,
    Detail,
}

/// Properties fetched together as one unit when a message is first
/// requested.
pub const HEADER_PROPERTIES: &[Property] = &[
    Property::ThreadId,
    Property::MailboxIds,
    Property::IsUnread,
    Property::IsFlagged,
    Property::IsAnswered,
    Property::IsDraft,
    Property::HasAttachment,
    Property::From,
    Property::To,
    Property::Subject,
    Property::Date,
    Property::Size,
    Property::Preview,
];

/// Properties fetched lazily, on explicit request only.
pub const DETAIL_PROPERTIES: &[Property] = &[
    Property::BlobId,
    Property::InReplyToMessageId,
    Property::ListIdHeader,
    Property::ListPostHeader,
    Property::Cc,
    Property::Bcc,
    Property::ReplyTo,
    Property::Body,
    Property::Attachments,
    Property::AttachedMessages,
    Property::AttachedInvites,
];

/// The subset of header properties that can change after a message
/// has been delivered. Used by targeted refreshes.
pub const MUTABLE_PROPERTIES: &[Property] = &[
    Property::MailboxIds,
    Property::IsUnread,
    Property::IsFlagged,
    Property::IsAnswered,
    Property::IsDraft,
    Property::HasAttachment,
];

/// Properties whose change makes the thread of the message stale.
pub const THREAD_PROPERTIES: &[Property] = &[
    Property::MailboxIds,
    Property::IsUnread,
    Property::IsFlagged,
    Property::IsDraft,
    Property::HasAttachment,
];

/// The message address.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
}

impl Address {
    pub fn new(name: Option<impl ToString>, email: impl ToString) -> Self {
        Self {
            name: name.map(|name| name.to_string()),
            email: email.to_string(),
        }
    }

    pub fn new_nameless(email: impl ToString) -> Self {
        Self::new(Option::<String>::None, email)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

/// The message attachment, as described by the server.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub blob_id: Id,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_inline: bool,
}

/// The detail tier of a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetails {
    #[serde(default)]
    pub blob_id: Option<Id>,
    #[serde(default)]
    pub in_reply_to_message_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,
    #[serde(default)]
    pub reply_to: Option<Address>,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub attached_messages: BTreeMap<Id, serde_json::Value>,
    #[serde(default)]
    pub attached_invites: BTreeMap<Id, serde_json::Value>,
}

/// A detail record, as returned by a detail fetch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: Id,
    #[serde(flatten)]
    pub details: MessageDetails,
}

/// The message record.
///
/// Holds the header tier of the message. The detail tier lives in
/// [`Message::details`] and is only populated after an explicit
/// detail fetch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Id,
    #[serde(default)]
    pub thread_id: Option<Id>,
    #[serde(default)]
    pub mailbox_ids: BTreeSet<Id>,
    #[serde(default)]
    pub is_unread: bool,
    #[serde(default)]
    pub is_flagged: bool,
    #[serde(default)]
    pub is_answered: bool,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub has_attachment: bool,
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Vec<Address>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub preview: String,

    #[serde(skip)]
    pub details: Option<MessageDetails>,
}

impl Message {
    pub fn new(id: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Returns the sender name, or the local part of the sender
    /// address when the name is missing.
    pub fn from_name(&self) -> String {
        match &self.from {
            Some(Address {
                name: Some(name), ..
            }) if !name.is_empty() => name.clone(),
            Some(Address { email, .. }) => email.split('@').next().unwrap_or_default().to_owned(),
            None => String::new(),
        }
    }

    pub fn from_email(&self) -> String {
        self.from
            .as_ref()
            .map(|from| from.email.clone())
            .unwrap_or_default()
    }

    /// Returns the status of the detail tier, given the status of the
    /// record itself.
    ///
    /// Details are ready when the blob id is known, or when the
    /// message has been created locally (the client already knows
    /// everything about it).
    pub fn details_status(&self, status: RecordStatus) -> RecordStatus {
        let has_blob = self
            .details
            .as_ref()
            .and_then(|details| details.blob_id.as_ref())
            .is_some();

        if has_blob || status == RecordStatus::New {
            RecordStatus::Ready
        } else {
            RecordStatus::Empty
        }
    }

    /// Lists header properties that differ between the two messages.
    pub fn diff_headers(&self, other: &Message) -> BTreeSet<Property> {
        let mut diff = BTreeSet::new();

        if self.thread_id != other.thread_id {
            diff.insert(Property::ThreadId);
        }
        if self.mailbox_ids != other.mailbox_ids {
            diff.insert(Property::MailboxIds);
        }
        if self.is_unread != other.is_unread {
            diff.insert(Property::IsUnread);
        }
        if self.is_flagged != other.is_flagged {
            diff.insert(Property::IsFlagged);
        }
        if self.is_answered != other.is_answered {
            diff.insert(Property::IsAnswered);
        }
        if self.is_draft != other.is_draft {
            diff.insert(Property::IsDraft);
        }
        if self.has_attachment != other.has_attachment {
            diff.insert(Property::HasAttachment);
        }
        if self.from != other.from {
            diff.insert(Property::From);
        }
        if self.to != other.to {
            diff.insert(Property::To);
        }
        if self.subject != other.subject {
            diff.insert(Property::Subject);
        }
        if self.date != other.date {
            diff.insert(Property::Date);
        }
        if self.size != other.size {
            diff.insert(Property::Size);
        }
        if self.preview != other.preview {
            diff.insert(Property::Preview);
        }

        diff
    }
}

/// A message carrying only some of its header properties.
///
/// A field set to `None` means the property was absent from the
/// server response, which is different from a property explicitly
/// set to an empty value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialMessage {
    pub id: Id,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub thread_id: Option<Option<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox_ids: Option<BTreeSet<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_unread: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_flagged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_answered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_draft: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl PartialMessage {
    pub fn new(id: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_mailbox_ids(mut self, ids: impl IntoIterator<Item = impl ToString>) -> Self {
        self.mailbox_ids = Some(ids.into_iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn with_unread(mut self, unread: bool) -> Self {
        self.is_unread = Some(unread);
        self
    }

    pub fn with_flagged(mut self, flagged: bool) -> Self {
        self.is_flagged = Some(flagged);
        self
    }

    pub fn with_answered(mut self, answered: bool) -> Self {
        self.is_answered = Some(answered);
        self
    }

    pub fn with_draft(mut self, draft: bool) -> Self {
        self.is_draft = Some(draft);
        self
    }

    /// Lists the properties carried by this partial message.
    pub fn properties(&self) -> BTreeSet<Property> {
        let mut props = BTreeSet::new();

        if self.thread_id.is_some() {
            props.insert(Property::ThreadId);
        }
        if self.mailbox_ids.is_some() {
            props.insert(Property::MailboxIds);
        }
        if self.is_unread.is_some() {
            props.insert(Property::IsUnread);
        }
        if self.is_flagged.is_some() {
            props.insert(Property::IsFlagged);
        }
        if self.is_answered.is_some() {
            props.insert(Property::IsAnswered);
        }
        if self.is_draft.is_some() {
            props.insert(Property::IsDraft);
        }
        if self.has_attachment.is_some() {
            props.insert(Property::HasAttachment);
        }
        if self.subject.is_some() {
            props.insert(Property::Subject);
        }
        if self.preview.is_some() {
            props.insert(Property::Preview);
        }
        if self.size.is_some() {
            props.insert(Property::Size);
        }

        props
    }

    pub fn is_empty(&self) -> bool {
        self.properties().is_empty()
    }
}

// Distinguishes an explicit `null` from an absent field.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}
