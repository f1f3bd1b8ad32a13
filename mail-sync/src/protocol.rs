//! # Protocol
//!
//! Module dedicated to the JSON request/response protocol spoken
//! with the server. Method calls and their responses travel as
//! [`Invocation`]s: JSON triples `[name, arguments, tag]`.
//!
//! Requests are typed by [`Request`]. Responses are decoded into
//! typed structures; the shape of a `messages` response is never
//! guessed from its content, it is given by the [`ListKind`] of the
//! request that produced it.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{
    message::{DetailRecord, Id, Message, PartialMessage, Property, State},
    Error, Result,
};

pub const GET_MESSAGES: &str = "getMessages";
pub const GET_MESSAGE_UPDATES: &str = "getMessageUpdates";
pub const SET_MESSAGES: &str = "setMessages";

pub const MESSAGES: &str = "messages";
pub const MESSAGE_UPDATES: &str = "messageUpdates";
pub const MESSAGES_SET: &str = "messagesSet";
pub const ERROR: &str = "error";

/// Error type returned when the server cannot compute the changes
/// since the given cursor.
pub const CANNOT_CALCULATE_CHANGES: &str = "cannotCalculateChanges";

/// The method invocation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Invocation(pub String, pub Value, pub String);

impl Invocation {
    pub fn new(name: impl ToString, arguments: Value, tag: impl ToString) -> Self {
        Self(name.to_string(), arguments, tag.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn arguments(&self) -> &Value {
        &self.1
    }

    pub fn tag(&self) -> &str {
        &self.2
    }

    /// Parses the arguments of the invocation.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T> {
        let Self(name, args, _) = self;
        serde_json::from_value(args).map_err(|err| Error::ParseResponseError(err, name))
    }
}

/// The kind of list expected in a `messages` response.
///
/// Derived from the property tier the request asked for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ListKind {
    /// Full header records.
    #[default]
    Records,

    /// Maps of some properties keyed by id.
    Partials,

    /// Detail records.
    Details,
}

/// The `getMessages` arguments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessages {
    pub ids: Vec<Id>,
    pub properties: Vec<Property>,
    #[serde(skip)]
    pub kind: ListKind,
}

/// The `getMessageUpdates` arguments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessageUpdates {
    pub since_state: State,
    pub max_changes: usize,
    pub fetch_records: bool,
    pub fetch_record_properties: Option<Vec<Property>>,
}

/// The `setMessages` arguments.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMessages {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub create: BTreeMap<Id, Message>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub update: BTreeMap<Id, PartialMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destroy: Vec<Id>,
}

/// The client request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    GetMessages(GetMessages),
    GetMessageUpdates(GetMessageUpdates),
    SetMessages(SetMessages),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetMessages(_) => GET_MESSAGES,
            Self::GetMessageUpdates(_) => GET_MESSAGE_UPDATES,
            Self::SetMessages(_) => SET_MESSAGES,
        }
    }

    /// Serializes the arguments of the request.
    pub fn arguments(&self) -> Result<Value> {
        let args = match self {
            Self::GetMessages(args) => serde_json::to_value(args),
            Self::GetMessageUpdates(args) => serde_json::to_value(args),
            Self::SetMessages(args) => serde_json::to_value(args),
        };

        args.map_err(|err| Error::SerializeRequestError(err, self.method().to_owned()))
    }
}

/// The method error, as returned by the server.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub new_state: Option<State>,
}

impl MethodError {
    pub fn into_error(self, method: impl ToString) -> Error {
        Error::MethodError {
            method: method.to_string(),
            kind: self.kind,
            description: self.description,
        }
    }
}

/// The list carried by a `messages` response.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageList {
    Records(Vec<Message>),
    Partials(Vec<PartialMessage>),
    Details(Vec<DetailRecord>),
}

impl MessageList {
    pub fn len(&self) -> usize {
        match self {
            Self::Records(list) => list.len(),
            Self::Partials(list) => list.len(),
            Self::Details(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `messages` response.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagesResponse {
    pub state: Option<State>,
    pub list: MessageList,
    pub not_found: Vec<Id>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessagesResponse {
    #[serde(default)]
    state: Option<State>,
    list: Vec<Value>,
    #[serde(default)]
    not_found: Option<Vec<Id>>,
}

/// The `messageUpdates` response.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdatesResponse {
    pub old_state: State,
    pub new_state: State,
    #[serde(default)]
    pub has_more_updates: bool,
    #[serde(default)]
    pub changed: Vec<Id>,
    #[serde(default)]
    pub removed: Vec<Id>,
}

/// The server-assigned properties of a message created by a commit.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedMessage {
    pub id: Id,
    #[serde(default)]
    pub thread_id: Option<Id>,
    #[serde(default)]
    pub blob_id: Option<Id>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// The reason why a record could not be committed.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The `messagesSet` response.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesSetResponse {
    #[serde(default)]
    pub old_state: Option<State>,
    pub new_state: State,
    #[serde(default)]
    pub created: BTreeMap<Id, CreatedMessage>,
    #[serde(default)]
    pub updated: Vec<Id>,
    #[serde(default)]
    pub destroyed: Vec<Id>,
    #[serde(default)]
    pub not_created: BTreeMap<Id, SetError>,
    #[serde(default)]
    pub not_updated: BTreeMap<Id, SetError>,
    #[serde(default)]
    pub not_destroyed: BTreeMap<Id, SetError>,
}

/// The decoded reply to a `getMessageUpdates` request.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdatesReply {
    /// The server sent the changes, and the records when they were
    /// requested.
    Updates(MessageUpdatesResponse, Option<MessagesResponse>),

    /// The server cannot compute the changes since the requested
    /// cursor. Holds the current cursor when the server reports it.
    CannotCalculateChanges(Option<State>),
}

/// The list of invocations returned by the server for one request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Responses(Vec<Invocation>);

impl From<Vec<Invocation>> for Responses {
    fn from(invocations: Vec<Invocation>) -> Self {
        Self(invocations)
    }
}

impl Responses {
    /// Extracts the method error, if any.
    fn take_error(&mut self) -> Result<Option<MethodError>> {
        match self.0.iter().position(|inv| inv.name() == ERROR) {
            Some(pos) => Ok(Some(self.0.remove(pos).parse()?)),
            None => Ok(None),
        }
    }

    fn take(&mut self, name: &str) -> Option<Invocation> {
        let pos = self.0.iter().position(|inv| inv.name() == name)?;
        Some(self.0.remove(pos))
    }

    /// Fails if invocations were left unconsumed.
    fn finish(self, method: &str) -> Result<()> {
        match self.0.into_iter().next() {
            Some(inv) => Err(Error::UnexpectedResponseError(
                method.to_owned(),
                inv.name().to_owned(),
            )),
            None => Ok(()),
        }
    }

    fn decode_list(inv: Invocation, kind: ListKind) -> Result<MessagesResponse> {
        let name = inv.name().to_owned();
        let raw: RawMessagesResponse = inv.parse()?;

        fn parse<T: DeserializeOwned>(list: Vec<Value>, name: &str) -> Result<Vec<T>> {
            list.into_iter()
                .map(|item| {
                    serde_json::from_value(item)
                        .map_err(|err| Error::ParseResponseError(err, name.to_owned()))
                })
                .collect()
        }

        let list = match kind {
            ListKind::Records => MessageList::Records(parse(raw.list, &name)?),
            ListKind::Partials => MessageList::Partials(parse(raw.list, &name)?),
            ListKind::Details => MessageList::Details(parse(raw.list, &name)?),
        };

        Ok(MessagesResponse {
            state: raw.state,
            list,
            not_found: raw.not_found.unwrap_or_default(),
        })
    }

    /// Decodes the reply to a `getMessages` request.
    pub fn decode_messages(mut self, kind: ListKind) -> Result<MessagesResponse> {
        trace!("decoding messages response: {self:#?}");

        if let Some(err) = self.take_error()? {
            return Err(err.into_error(GET_MESSAGES));
        }

        let inv = self
            .take(MESSAGES)
            .ok_or(Error::MissingResponseError(GET_MESSAGES.to_owned(), MESSAGES))?;
        let res = Self::decode_list(inv, kind)?;
        self.finish(GET_MESSAGES)?;

        Ok(res)
    }

    /// Decodes the reply to a `getMessageUpdates` request.
    ///
    /// When records were requested, the server answers with a
    /// `messages` invocation right after the `messageUpdates` one.
    pub fn decode_updates(mut self, fetch_records: bool) -> Result<UpdatesReply> {
        trace!("decoding message updates response: {self:#?}");

        if let Some(err) = self.take_error()? {
            if err.kind == CANNOT_CALCULATE_CHANGES {
                return Ok(UpdatesReply::CannotCalculateChanges(err.new_state));
            }
            return Err(err.into_error(GET_MESSAGE_UPDATES));
        }

        let updates: MessageUpdatesResponse = self
            .take(MESSAGE_UPDATES)
            .ok_or(Error::MissingResponseError(
                GET_MESSAGE_UPDATES.to_owned(),
                MESSAGE_UPDATES,
            ))?
            .parse()?;

        let records = match self.take(MESSAGES) {
            Some(inv) if fetch_records => Some(Self::decode_list(inv, ListKind::Records)?),
            Some(inv) => {
                return Err(Error::UnexpectedResponseError(
                    GET_MESSAGE_UPDATES.to_owned(),
                    inv.name().to_owned(),
                ))
            }
            None => None,
        };

        self.finish(GET_MESSAGE_UPDATES)?;

        Ok(UpdatesReply::Updates(updates, records))
    }

    /// Decodes the reply to a `setMessages` request.
    pub fn decode_set(mut self) -> Result<MessagesSetResponse> {
        trace!("decoding messages set response: {self:#?}");

        if let Some(err) = self.take_error()? {
            return Err(err.into_error(SET_MESSAGES));
        }

        let res = self
            .take(MESSAGES_SET)
            .ok_or(Error::MissingResponseError(SET_MESSAGES.to_owned(), MESSAGES_SET))?
            .parse()?;
        self.finish(SET_MESSAGES)?;

        Ok(res)
    }
}
