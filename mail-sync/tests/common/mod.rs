#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use mail_sync::{
    cache::{CacheHunk, MemoryCache, RecordCache, RecordType},
    message::Message,
    protocol::Invocation,
    transport::Transport,
    AnyBoxedError, MessageSync, SyncEvent,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// A scripted reply of the transport.
pub enum Reply {
    Ok(Vec<Invocation>),
    Fail(&'static str),
    /// Waits for the given notification before replying.
    Gated(Arc<Notify>, Vec<Invocation>),
}

/// Transport replying with queued responses, and recording requests.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::default(),
        })
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, method: &str, args: Value) -> Result<Vec<Invocation>, AnyBoxedError> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_owned(), args));

        let reply = self.replies.lock().unwrap().pop_front();

        match reply {
            Some(Reply::Ok(invocations)) => Ok(invocations),
            Some(Reply::Fail(reason)) => {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, reason).into())
            }
            Some(Reply::Gated(gate, invocations)) => {
                gate.notified().await;
                Ok(invocations)
            }
            None => panic!("unexpected call to {method}"),
        }
    }
}

pub type TestSync = MessageSync<Arc<ScriptedTransport>, MemoryCache>;

pub fn sync(transport: &Arc<ScriptedTransport>, cache: &Arc<MemoryCache>) -> TestSync {
    MessageSync::new(transport.clone(), cache.clone())
}

/// Builds a sync collecting its events in the returned list.
pub fn sync_with_events(
    transport: &Arc<ScriptedTransport>,
    cache: &Arc<MemoryCache>,
) -> (TestSync, Arc<Mutex<Vec<SyncEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));

    let sync = sync(transport, cache).with_handler({
        let events = events.clone();
        move |evt| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push(evt);
                Ok(())
            }
        }
    });

    (sync, events)
}

/// Puts the given messages in the cache as ready records, and sets
/// the message cursor.
pub async fn seed(cache: &MemoryCache, messages: Vec<Message>, state: &str) {
    let mut patch: Vec<CacheHunk> = messages.into_iter().map(CacheHunk::Upsert).collect();
    patch.push(CacheHunk::SetCursor(RecordType::Message, Some(state.into())));
    cache.apply(patch).await.unwrap();
}

pub fn message(id: &str, thread: &str, mailbox: &str) -> Message {
    serde_json::from_value(record(id, thread, mailbox)).unwrap()
}

pub fn record(id: &str, thread: &str, mailbox: &str) -> Value {
    json!({
        "id": id,
        "threadId": thread,
        "mailboxIds": [mailbox],
        "isUnread": true,
        "isFlagged": false,
        "isAnswered": false,
        "isDraft": false,
        "hasAttachment": false,
        "from": { "name": "Alice", "email": "alice@localhost" },
        "to": [{ "email": "bob@localhost" }],
        "subject": format!("Subject of {id}"),
        "date": "2015-06-01T10:00:00Z",
        "size": 1024,
        "preview": "Hello",
    })
}

pub fn messages(state: &str, list: Vec<Value>) -> Invocation {
    Invocation::new("messages", json!({ "state": state, "list": list }), "0")
}

pub fn messages_not_found(state: &str, list: Vec<Value>, not_found: &[&str]) -> Invocation {
    Invocation::new(
        "messages",
        json!({ "state": state, "list": list, "notFound": not_found }),
        "0",
    )
}

pub fn updates(old: &str, new: &str, has_more: bool, changed: &[&str], removed: &[&str]) -> Invocation {
    Invocation::new(
        "messageUpdates",
        json!({
            "oldState": old,
            "newState": new,
            "hasMoreUpdates": has_more,
            "changed": changed,
            "removed": removed,
        }),
        "0",
    )
}

pub fn error(kind: &str, new_state: Option<&str>) -> Invocation {
    Invocation::new("error", json!({ "type": kind, "newState": new_state }), "0")
}

pub fn messages_set(args: Value) -> Invocation {
    Invocation::new("messagesSet", args, "0")
}
