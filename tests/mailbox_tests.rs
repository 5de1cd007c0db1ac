use std::sync::Arc;
use std::time::Duration;

use agentmesh::bus::EventBus;
use agentmesh::mailbox::{Mailbox, Message, MessagePatch, ReadOptions, SendOptions};

fn mailbox(dir: &std::path::Path) -> Arc<Mailbox> {
    Mailbox::new(
        dir.join("messages.jsonl"),
        dir.join("state"),
        Arc::new(EventBus::new()),
    )
}

fn send(channel: &str, sender: &str, recipients: Option<Vec<&str>>, body: &str) -> SendOptions {
    SendOptions {
        channel: channel.to_string(),
        sender: sender.to_string(),
        recipients: recipients.map(|r| r.iter().map(|s| s.to_string()).collect()),
        body: body.to_string(),
        ttl_seconds: None,
        persistent: false,
        payload: None,
    }
}

fn read(channel: &str, reader: &str, unread_only: bool, mark_read: bool) -> ReadOptions {
    ReadOptions {
        channel: Some(channel.to_string()),
        reader: reader.to_string(),
        unread_only,
        include_read: false,
        mark_read,
        limit: None,
    }
}

#[tokio::test]
async fn broadcast_visibility_and_read_tracking() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());

    mailbox.send(send("general", "alice", Some(vec!["*"]), "hi")).await;

    // Unread for bob until he reads with markRead.
    let first = mailbox.read(read("general", "bob", true, false)).await;
    assert_eq!(first.len(), 1);
    let second = mailbox.read(read("general", "bob", true, false)).await;
    assert_eq!(second.len(), 1, "non-marking reads do not consume");

    let marked = mailbox.read(read("general", "bob", true, true)).await;
    assert_eq!(marked.len(), 1);
    let after = mailbox.read(read("general", "bob", true, false)).await;
    assert!(after.is_empty(), "marked messages drop out of unreadOnly reads");

    // Other readers still see it unread.
    let carol = mailbox.read(read("general", "carol", true, false)).await;
    assert_eq!(carol.len(), 1);
}

#[tokio::test]
async fn directed_messages_hide_from_third_parties() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());
    mailbox
        .send(send("general", "alice", Some(vec!["bob"]), "for bob"))
        .await;

    assert_eq!(mailbox.read(read("general", "bob", false, false)).await.len(), 1);
    // The sender always sees their own messages.
    assert_eq!(mailbox.read(read("general", "alice", false, false)).await.len(), 1);
    assert!(mailbox.read(read("general", "carol", false, false)).await.is_empty());
    // Admin reader sees everything.
    assert_eq!(mailbox.read(read("general", "*", false, false)).await.len(), 1);
}

#[tokio::test]
async fn ack_marks_without_reading() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());
    let id = mailbox.send(send("ops", "alice", None, "ping")).await;

    let acked = mailbox.ack(&[id.clone()], "bob").await;
    assert_eq!(acked, 1);
    // Re-acking is a no-op.
    assert_eq!(mailbox.ack(&[id], "bob").await, 0);
    assert!(mailbox.read(read("ops", "bob", true, false)).await.is_empty());
}

#[tokio::test]
async fn ttl_sweep_removes_only_expired_non_persistent() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());

    let mut ephemeral = send("ttl", "alice", None, "short lived");
    ephemeral.ttl_seconds = Some(1);
    mailbox.send(ephemeral).await;

    let mut durable = send("ttl", "alice", None, "kept");
    durable.ttl_seconds = Some(1);
    durable.persistent = true;
    mailbox.send(durable).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let removed = mailbox.sweep_expired().await;
    assert_eq!(removed, 1);

    let left = mailbox.peek_channel("ttl").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].body, "kept");
}

#[tokio::test]
async fn ttl_is_clamped_to_a_day() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());
    let mut opts = send("ttl", "alice", None, "clamped");
    opts.ttl_seconds = Some(999_999_999);
    let id = mailbox.send(opts).await;
    assert_eq!(mailbox.get_by_id(&id).await.unwrap().ttl_seconds, 86_400);
}

#[tokio::test]
async fn inbound_dedups_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());
    let id = mailbox.send(send("peers", "alice", None, "original")).await;
    let message = mailbox.get_by_id(&id).await.unwrap();

    // The same message relayed twice by a peer stores nothing new.
    assert!(!mailbox.receive_inbound(message.clone()).await);
    assert!(!mailbox.receive_inbound(message).await);
    assert_eq!(mailbox.peek_channel("peers").await.len(), 1);

    // A genuinely new id is stored.
    let foreign = Message {
        id: "peer-message-1".to_string(),
        channel: "peers".to_string(),
        sender: "remote".to_string(),
        recipients: vec!["*".to_string()],
        body: "from a peer".to_string(),
        created_at: chrono::Utc::now(),
        ttl_seconds: 3600,
        persistent: false,
        read_by: Vec::new(),
        payload: None,
    };
    assert!(mailbox.receive_inbound(foreign).await);
    assert_eq!(mailbox.peek_channel("peers").await.len(), 2);
}

#[tokio::test]
async fn log_survives_restart_with_read_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mailbox = mailbox(dir.path());
        let mut opts = send("durable", "alice", None, "one");
        opts.persistent = true;
        mailbox.send(opts).await;
        let mut opts = send("durable", "alice", None, "two");
        opts.persistent = true;
        mailbox.send(opts).await;
        // Mark "one" read so the appended update is the latest record.
        let unread = mailbox.read(read("durable", "bob", true, true)).await;
        assert_eq!(unread.len(), 2);
    }

    let reloaded = mailbox(dir.path());
    assert_eq!(reloaded.load().await, 2);
    // Read state came back with the log.
    assert!(reloaded.read(read("durable", "bob", true, false)).await.is_empty());
    assert_eq!(reloaded.read(read("durable", "carol", true, false)).await.len(), 2);
}

#[tokio::test]
async fn purge_and_update_and_stats() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = mailbox(dir.path());
    let id = mailbox.send(send("a", "alice", None, "first")).await;
    mailbox.send(send("a", "alice", None, "second")).await;
    mailbox.send(send("b", "bob", Some(vec!["alice"]), "third")).await;

    let updated = mailbox
        .update_message(
            &id,
            MessagePatch {
                body: Some("edited".to_string()),
                ..MessagePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.body, "edited");

    let stats = mailbox.stats().await;
    assert_eq!(stats.total_messages, 3);
    assert_eq!(stats.channels, 2);
    assert_eq!(stats.broadcast_messages, 2);

    assert_eq!(mailbox.purge_channel("a").await, 2);
    assert_eq!(mailbox.stats().await.total_messages, 1);
    assert_eq!(mailbox.purge_all().await, 1);

    let channels = mailbox.list_channels().await;
    assert!(channels.is_empty());
}
