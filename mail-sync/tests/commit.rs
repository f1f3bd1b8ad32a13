mod common;

use std::sync::Arc;

use mail_sync::{
    cache::{MemoryCache, RecordCache, RecordType},
    message::{Message, PartialMessage},
    status::RecordStatus,
    Error, MessageChanges,
};
use serde_json::json;
use tokio::sync::Notify;

use common::*;

async fn seeded() -> Arc<MemoryCache> {
    let cache = Arc::new(MemoryCache::new());
    seed(
        &cache,
        vec![message("m1", "t1", "inbox"), message("m2", "t1", "inbox")],
        "s0",
    )
    .await;
    cache
}

fn draft() -> Message {
    Message {
        is_draft: true,
        subject: "Draft".into(),
        mailbox_ids: ["drafts".to_owned()].into(),
        ..Message::new("ignored")
    }
}

#[test_log::test(tokio::test)]
async fn created_message_is_confirmed() {
    let cache = seeded().await;
    let transport = ScriptedTransport::new([Reply::Ok(vec![messages_set(json!({
        "oldState": "s0",
        "newState": "s1",
        "created": {
            "k0": { "id": "m9", "threadId": "t9", "blobId": "b9", "size": 42 },
        },
        "updated": ["m1"],
        "destroyed": ["m2"],
    }))])]);
    let sync = sync(&transport, &cache);

    let changes = MessageChanges::new()
        .with_create(draft())
        .with_update(PartialMessage::new("m1").with_flagged(true))
        .with_destroy("m2");

    let report = sync.commit(changes).await.unwrap();

    assert_eq!(report.created.get("k0").map(String::as_str), Some("m9"));
    assert_eq!(report.updated, vec!["m1"]);
    assert_eq!(report.destroyed, vec!["m2"]);
    assert!(!report.refresh_needed);

    let requests = transport.requests();
    assert_eq!(requests[0].0, "setMessages");
    assert_eq!(requests[0].1["create"]["k0"]["subject"], json!("Draft"));
    assert_eq!(requests[0].1["update"]["m1"], json!({ "id": "m1", "isFlagged": true }));
    assert_eq!(requests[0].1["destroy"], json!(["m2"]));

    assert_eq!(cache.get("k0").await, None);
    let m9 = cache.get("m9").await.unwrap();
    assert_eq!(m9.status, RecordStatus::Ready);
    assert_eq!(m9.message.thread_id.as_deref(), Some("t9"));
    assert!(m9.message.is_draft);

    assert!(cache.get("m1").await.unwrap().message.is_flagged);
    assert_eq!(cache.get("m2").await, None);
    assert_eq!(cache.get_cursor(RecordType::Message).await.as_deref(), Some("s1"));
}

#[test_log::test(tokio::test)]
async fn local_changes_are_applied_before_response() {
    let cache = seeded().await;
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::new([Reply::Gated(
        gate.clone(),
        vec![messages_set(json!({ "oldState": "s0", "newState": "s1", "updated": ["m1"] }))],
    )]);
    let sync = sync(&transport, &cache);

    let changes = MessageChanges::new().with_update(PartialMessage::new("m1").with_unread(false));

    let (report, ()) = tokio::join!(sync.commit(changes), async {
        tokio::task::yield_now().await;
        let m1 = cache.get("m1").await.unwrap();
        assert!(!m1.message.is_unread);
        gate.notify_one();
    });

    assert_eq!(report.unwrap().updated, vec!["m1"]);
    assert!(!cache.get("m1").await.unwrap().message.is_unread);
}

#[test_log::test(tokio::test)]
async fn rejected_changes_are_reverted() {
    let cache = seeded().await;
    let transport = ScriptedTransport::new([Reply::Ok(vec![messages_set(json!({
        "oldState": "s7",
        "newState": "s8",
        "notCreated": { "k0": { "type": "overQuota" } },
        "notUpdated": { "m1": { "type": "notFound", "description": "gone" } },
        "notDestroyed": { "m2": { "type": "forbidden" } },
    }))])]);
    let sync = sync(&transport, &cache);

    let changes = MessageChanges::new()
        .with_create(draft())
        .with_update(PartialMessage::new("m1").with_unread(false))
        .with_destroy("m2");

    let report = sync.commit(changes).await.unwrap();

    assert_eq!(report.not_created["k0"].kind, "overQuota");
    assert_eq!(report.not_updated["m1"].description.as_deref(), Some("gone"));
    assert_eq!(report.not_destroyed["m2"].kind, "forbidden");

    assert_eq!(cache.get("k0").await, None);
    assert!(cache.get("m1").await.unwrap().message.is_unread);
    assert_eq!(cache.get_status("m2").await, RecordStatus::Ready);

    // the response does not follow the cached cursor
    assert!(report.refresh_needed);
    assert!(sync.is_refresh_needed());
    assert_eq!(cache.get_cursor(RecordType::Message).await.as_deref(), Some("s0"));
}

#[test_log::test(tokio::test)]
async fn transport_failure_reverts_everything() {
    let cache = seeded().await;
    let transport = ScriptedTransport::new([Reply::Fail("broken pipe")]);
    let sync = sync(&transport, &cache);

    sync.thread("t1").await;

    let changes = MessageChanges::new()
        .with_create(Message {
            thread_id: Some("t1".into()),
            ..draft()
        })
        .with_update(PartialMessage::new("m1").with_unread(false))
        .with_destroy("m2");

    let err = sync.commit(changes).await.unwrap_err();
    assert!(err.is_transport());

    assert_eq!(cache.get_all().await, vec!["m1", "m2"]);
    assert!(cache.get("m1").await.unwrap().message.is_unread);
    assert_eq!(cache.get_cursor(RecordType::Message).await.as_deref(), Some("s0"));

    let thread = sync.thread("t1").await;
    assert_eq!(thread.message_ids, vec!["m1", "m2"]);
    assert_eq!(thread.unread_count, 2);
}

#[test_log::test(tokio::test)]
async fn invalid_commits_send_nothing() {
    let cache = seeded().await;
    let transport = ScriptedTransport::new([]);
    let sync = sync(&transport, &cache);

    let err = sync.commit(MessageChanges::new()).await.unwrap_err();
    assert!(matches!(err, Error::CommitEmptyError));

    let changes = MessageChanges::new().with_update(PartialMessage::new("m404").with_unread(false));
    let err = sync.commit(changes).await.unwrap_err();
    assert!(matches!(err, Error::CommitUnknownMessageError(id) if id == "m404"));

    assert!(transport.requests().is_empty());
}
