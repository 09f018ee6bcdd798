//! Engine-level scenarios over the in-memory transport.
//!
//! The remote side of the transport plays the relay: it acks or fails
//! channels and injects CDC, presence and broadcast traffic, so every
//! path through the session runs deterministically (timers on a paused
//! clock where time matters).

use fleet_model::{EntityId, EntityRecord, TableName};
use fleet_sync::{
    ApplyOutcome, BackoffPolicy, CacheChange, ChannelName, ChannelSpec, ChannelStatus,
    DeliveryModes, MemoryPersistence, MemoryRemote, MemoryTransport, OptimisticOp, PresenceMeta,
    SessionEvent, SyncConfig, SyncError, SyncSession, WriteError,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> SyncConfig {
    SyncConfig::new("alice")
        .with_static_channels(vec![ChannelSpec::new(
            "presence:global",
            DeliveryModes::PRESENCE,
        )])
        .with_backoff(BackoffPolicy::flat(1_000))
}

fn membership(id: &str, room: &str) -> EntityRecord {
    EntityRecord::new(EntityId::new(id).unwrap())
        .with_field("user_id", "alice")
        .with_field("room_id", room)
}

fn message(id: &str, content: &str) -> EntityRecord {
    EntityRecord::new(EntityId::new(id).unwrap())
        .with_field("room_id", "r1")
        .with_field("content", content)
}

fn insert(table: &str, record: &EntityRecord) -> serde_json::Value {
    json!({"table": table, "eventType": "INSERT", "new": record.to_value()})
}

/// Alice, member of room `r1`, with every channel subscribed.
async fn started(
    config: SyncConfig,
    transport: (MemoryTransport, MemoryRemote),
    persistence: MemoryPersistence,
) -> (SyncSession<MemoryTransport>, MemoryRemote, Arc<MemoryPersistence>) {
    let (transport, remote) = transport;
    let persistence =
        Arc::new(persistence.with_table("room_members", vec![membership("mem1", "r1")]));
    let mut session = SyncSession::new(config, transport, persistence.clone()).unwrap();
    session.start().await;
    session.drain_ready().await;
    (session, remote, persistence)
}

async fn alice() -> (SyncSession<MemoryTransport>, MemoryRemote, Arc<MemoryPersistence>) {
    started(config(), MemoryTransport::new(), MemoryPersistence::new()).await
}

/// Drive the session until `found` accepts an event.
async fn next_until(
    session: &mut SyncSession<MemoryTransport>,
    mut found: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    for _ in 0..100 {
        let event = session.next_event().await.expect("event stream ended");
        let done = found(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("expected event never arrived, saw {seen:?}");
}

#[tokio::test]
async fn test_start_opens_room_channels_from_memberships() {
    let (session, remote, _) = alice().await;

    assert!(session.memberships().contains("r1"));
    for channel in ["presence:global", "memberships:alice", "room:r1"] {
        assert_eq!(session.channel_status(channel), Some(ChannelStatus::Subscribed));
        assert_eq!(remote.open_count(channel), 1);
    }
    assert!(session.collection("messages").is_some());
}

#[tokio::test]
async fn test_insert_event_lands_in_cache() {
    let (mut session, remote, _) = alice().await;
    let room = remote.handle_for("room:r1").unwrap();

    remote.change(room, insert("messages", &message("m1", "hi")));
    session.drain_ready().await;

    let messages = session.collection("messages").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages.get("m1").unwrap().get_str("content"), Some("hi"));
}

#[tokio::test]
async fn test_optimistic_insert_confirmed_without_duplicate() {
    let (mut session, remote, persistence) = alice().await;
    let inserts = Arc::new(AtomicUsize::new(0));
    let counter = inserts.clone();
    session.subscribe(move |change| {
        if matches!(change, CacheChange::Inserted { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let id = session
        .mutate("messages", OptimisticOp::Upsert(message("m2", "hello")))
        .await
        .unwrap();
    assert_eq!(id.as_str(), "m2");
    assert_eq!(session.pending_count(), 1);
    assert_eq!(persistence.records("messages").await.len(), 1);

    let room = remote.handle_for("room:r1").unwrap();
    remote.change(room, insert("messages", &message("m2", "hello")));
    let events = session.drain_ready().await;

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Applied {
            outcome: ApplyOutcome::Confirmed { overwritten: false, .. },
            ..
        }
    )));
    assert_eq!(session.collection("messages").unwrap().len(), 1);
    assert_eq!(session.pending_count(), 0);
    assert_eq!(inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_insert_ignored() {
    let (mut session, remote, _) = alice().await;
    let room = remote.handle_for("room:r1").unwrap();

    remote.change(room, insert("messages", &message("m1", "hi")));
    remote.change(room, insert("messages", &message("m1", "hi again")));
    let outcomes: Vec<ApplyOutcome> = session
        .drain_ready()
        .await
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Applied { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect();

    assert_eq!(
        outcomes,
        vec![ApplyOutcome::Inserted, ApplyOutcome::DuplicateIgnored]
    );
    let cached = session.record("messages", "m1").unwrap();
    assert_eq!(cached.get_str("content"), Some("hi"));
    assert_eq!(session.stats().sync.duplicates_ignored, 1);
}

#[tokio::test]
async fn test_new_membership_opens_only_the_new_room() {
    let (mut session, remote, _) = alice().await;
    let r1 = remote.handle_for("room:r1").unwrap();
    let own = remote.handle_for("memberships:alice").unwrap();

    remote.change(own, insert("room_members", &membership("mem2", "r2")));
    let events = session.drain_ready().await;

    let report = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::MembershipChanged(report) => Some(report.clone()),
            _ => None,
        })
        .expect("membership change reported");
    assert_eq!(report.opened, vec![ChannelName::from("room:r2")]);
    assert!(report.closed.is_empty());
    assert!(report.retained.contains(&ChannelName::from("room:r1")));

    assert_eq!(remote.open_count("room:r1"), 1);
    assert_eq!(remote.open_count("room:r2"), 1);
    assert_eq!(session.subscriptions().handle("room:r1"), Some(r1));
    assert_eq!(session.channel_status("room:r2"), Some(ChannelStatus::Subscribed));
}

#[tokio::test(start_paused = true)]
async fn test_failed_channel_resubscribes_once_after_delay() {
    let (mut session, remote, _) = alice().await;
    let (mutation, _request) = session
        .begin_mutation("messages", OptimisticOp::Upsert(message("m5", "draft")))
        .unwrap();

    let failed_at = Instant::now();
    remote.fail(remote.handle_for("room:r1").unwrap(), ChannelStatus::Error);
    let events = next_until(&mut session, |e| {
        matches!(e, SessionEvent::Recovered { .. })
    })
    .await;

    assert!(failed_at.elapsed() >= Duration::from_secs(1));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Reconnecting { attempt: 1, delay, .. } if *delay == Duration::from_secs(1)
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Recovered { attempts: 1, .. }
    )));
    assert_eq!(remote.open_count("room:r1"), 2);
    assert_eq!(session.channel_status("room:r1"), Some(ChannelStatus::Subscribed));
    assert!(!session.is_degraded());

    // The resync after recovery replays what is still pending.
    assert!(session.synchronizer().is_pending(mutation));
    assert_eq!(
        session.record("messages", "m5").unwrap().get_str("content"),
        Some("draft")
    );

    next_until(&mut session, |e| matches!(e, SessionEvent::Idle)).await;
    assert_eq!(remote.open_count("room:r1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let config = config().with_backoff(BackoffPolicy::flat(1_000).with_max_attempts(1));
    let (transport, remote) = MemoryTransport::manual();
    let (mut session, remote, _) =
        started(config, (transport, remote), MemoryPersistence::new()).await;
    for handle in remote.open_channels().keys() {
        remote.ack(*handle);
    }
    session.drain_ready().await;
    assert_eq!(session.channel_status("room:r1"), Some(ChannelStatus::Subscribed));

    remote.fail(remote.handle_for("room:r1").unwrap(), ChannelStatus::TimedOut);
    session.drain_ready().await;
    next_until(&mut session, |_| remote.open_count("room:r1") == 2).await;

    remote.fail(remote.handle_for("room:r1").unwrap(), ChannelStatus::Error);
    let events = session.drain_ready().await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::GaveUp { attempts: 1, .. }
    )));
    assert!(session.is_degraded());

    tokio::time::advance(Duration::from_secs(10)).await;
    next_until(&mut session, |e| matches!(e, SessionEvent::Idle)).await;
    assert_eq!(remote.open_count("room:r1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_closed_channel_never_reconnects() {
    let (mut session, remote, _) = alice().await;
    let r1 = remote.handle_for("room:r1").unwrap();
    let own = remote.handle_for("memberships:alice").unwrap();

    remote.change(
        own,
        json!({"table": "room_members", "eventType": "DELETE", "old": membership("mem1", "r1").to_value()}),
    );
    let events = session.drain_ready().await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::MembershipChanged(report) if report.closed == vec![ChannelName::from("room:r1")]
    )));
    assert_eq!(session.channel_status("room:r1"), None);

    // A late failure for the old opening is ignored.
    remote.fail(r1, ChannelStatus::Error);
    assert!(session.drain_ready().await.is_empty());

    tokio::time::advance(Duration::from_secs(5)).await;
    next_until(&mut session, |e| matches!(e, SessionEvent::Idle)).await;
    assert_eq!(remote.open_count("room:r1"), 1);
    assert!(!session.is_degraded());
}

#[tokio::test]
async fn test_malformed_payload_invalidates_its_table() {
    let (mut session, remote, _) = alice().await;
    let room = remote.handle_for("room:r1").unwrap();

    remote.change(room, json!({"table": "messages", "new": {"id": "m1"}}));
    let events = session.drain_ready().await;

    match &events[0] {
        SessionEvent::Invalidated { tables, .. } => {
            assert_eq!(tables, &vec![TableName::from("messages")]);
        }
        other => panic!("expected invalidation, got {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Resynced { table, .. } if table.as_str() == "messages"
    )));
    assert!(!session.collection("messages").unwrap().is_stale());
    assert!(session.record("messages", "m1").is_none());
}

#[tokio::test]
async fn test_malformed_payload_without_table_invalidates_channel_tables() {
    let (mut session, remote, _) = alice().await;
    let room = remote.handle_for("room:r1").unwrap();
    remote.change(room, json!("garbage"));

    let events = session.drain_ready().await;
    match &events[0] {
        SessionEvent::Invalidated { channel, tables, .. } => {
            assert_eq!(channel.as_str(), "room:r1");
            assert_eq!(
                tables,
                &vec![TableName::from("messages"), TableName::from("rooms")]
            );
        }
        other => panic!("expected invalidation, got {other:?}"),
    }
    assert_eq!(session.stats().normalizer.rejected, 1);
}

#[tokio::test]
async fn test_presence_sync_is_authoritative() {
    let (mut session, remote, _) = alice().await;
    let presence = remote.handle_for("presence:global").unwrap();

    remote.presence_diff(
        presence,
        vec![PresenceMeta::new("bob", 1), PresenceMeta::new("carol", 1)],
        Vec::new(),
    );
    session.drain_ready().await;
    assert!(session.is_online("carol"));

    // Carol's leave was lost; the next snapshot still takes her offline.
    remote.presence_sync(
        presence,
        vec![PresenceMeta::new("alice", 2), PresenceMeta::new("bob", 1)],
    );
    let events = session.drain_ready().await;

    match &events[..] {
        [SessionEvent::PresenceChanged(delta)] => {
            assert_eq!(delta.joined, vec!["alice".to_string()]);
            assert_eq!(delta.left, vec!["carol".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.is_online("bob"));
    assert!(!session.is_online("carol"));
    assert_eq!(session.online_users("presence:global"), vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_failed_write_rolls_back() {
    let persistence = MemoryPersistence::new().with_table("messages", vec![message("m1", "hi")]);
    let (mut session, _remote, persistence) =
        started(config(), MemoryTransport::new(), persistence).await;
    assert_eq!(session.record("messages", "m1").unwrap().get_str("content"), Some("hi"));

    persistence
        .set_failure(Some(WriteError::Unavailable("db down".into())))
        .await;

    let edit = session
        .mutate("messages", OptimisticOp::Upsert(message("m1", "edited")))
        .await;
    assert!(matches!(edit, Err(SyncError::Write(WriteError::Unavailable(_)))));
    assert_eq!(session.record("messages", "m1").unwrap().get_str("content"), Some("hi"));

    let create = session
        .mutate("messages", OptimisticOp::Upsert(message("m7", "new")))
        .await;
    assert!(create.is_err());
    assert!(session.record("messages", "m7").is_none());
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_server_id_replaces_client_id() {
    let (mut session, remote, _) = started(
        config(),
        MemoryTransport::new(),
        MemoryPersistence::new().with_server_ids(),
    )
    .await;

    let server_id = session
        .mutate("messages", OptimisticOp::Upsert(message("tmp-1", "hello")))
        .await
        .unwrap();
    assert_ne!(server_id.as_str(), "tmp-1");
    assert!(session.record("messages", "tmp-1").is_none());
    assert!(session.record("messages", server_id.as_str()).is_some());

    let room = remote.handle_for("room:r1").unwrap();
    let confirmed = message("tmp-1", "hello").rekeyed(server_id.clone());
    remote.change(room, insert("messages", &confirmed));
    let events = session.drain_ready().await;

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Applied { outcome: ApplyOutcome::Confirmed { .. }, .. }
    )));
    assert_eq!(session.collection("messages").unwrap().len(), 1);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_clears_itself() {
    let (mut session, remote, _) = alice().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    session.on_broadcast("room:r1", "typing", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let room = remote.handle_for("room:r1").unwrap();
    remote.broadcast(room, "typing", json!({"userId": "bob", "isTyping": true}));
    let events = session.drain_ready().await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Typing(change) if change.user_id == "bob" && change.is_typing
    )));
    assert_eq!(session.typing_users("room:r1"), vec!["bob"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let typed_at = Instant::now();
    next_until(&mut session, |e| matches!(e, SessionEvent::TypingExpired(_))).await;
    assert!(typed_at.elapsed() >= Duration::from_secs(3));
    assert!(session.typing_users("room:r1").is_empty());
}

#[tokio::test]
async fn test_typing_sent_only_on_subscribed_channel() {
    let (mut session, _remote, _) = alice().await;
    assert!(session.set_typing("room:r1", true));
    assert!(!session.set_typing("room:r9", true));
    assert_eq!(session.stats().broadcast.sent, 1);
    assert_eq!(session.stats().broadcast.dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_mutation_expires_but_keeps_value() {
    let (mut session, _remote, _) = alice().await;
    session
        .mutate("messages", OptimisticOp::Upsert(message("m3", "sent")))
        .await
        .unwrap();

    let events = next_until(&mut session, |e| {
        matches!(e, SessionEvent::PendingExpired(_))
    })
    .await;
    match events.last() {
        Some(SessionEvent::PendingExpired(entries)) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].id.as_str(), "m3");
            assert!(entries[0].write_confirmed);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.pending_count(), 0);
    assert!(session.record("messages", "m3").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_timers_fire_under_steady_traffic() {
    let config = config()
        .with_pending_timeout_ms(2_000)
        .with_resync_interval_ms(Some(4_000));
    let (mut session, remote, _) =
        started(config, MemoryTransport::new(), MemoryPersistence::new()).await;
    let room = remote.handle_for("room:r1").unwrap();

    session
        .mutate("messages", OptimisticOp::Upsert(message("draft", "unconfirmed")))
        .await
        .unwrap();
    remote.broadcast(room, "typing", json!({"userId": "bob", "isTyping": true}));
    session.drain_ready().await;
    assert_eq!(session.typing_users("room:r1"), vec!["bob"]);

    // A CDC insert is always waiting for the next 6 seconds.
    let mut seen = Vec::new();
    for i in 0..60 {
        let id = format!("m{i}");
        remote.change(room, insert("messages", &message(&id, "busy")));
        tokio::time::advance(Duration::from_millis(100)).await;
        seen.extend(
            next_until(&mut session, |e| {
                matches!(e, SessionEvent::Applied { id: applied, .. } if applied.as_str() == id)
            })
            .await,
        );
    }

    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::TypingExpired(change) if change.user_id == "bob"
    )));
    assert!(session.typing_users("room:r1").is_empty());

    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::PendingExpired(entries) if entries[0].id.as_str() == "draft"
    )));
    assert_eq!(session.pending_count(), 0);

    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Resynced { table, .. } if table.as_str() == "messages"
    )));
    assert!(session.record("messages", "draft").is_some());
}

#[tokio::test]
async fn test_clients_retry_shared_channels_at_different_times() {
    let retry_delays = |events: Vec<SessionEvent>| -> Vec<(ChannelName, Duration)> {
        let mut delays: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Reconnecting { channel, delay, .. } => Some((channel, delay)),
                _ => None,
            })
            .collect();
        delays.sort();
        delays
    };

    let mut clients = Vec::new();
    for _ in 0..2 {
        let config = config().with_backoff(BackoffPolicy::default());
        let (mut session, remote, _) =
            started(config, MemoryTransport::new(), MemoryPersistence::new()).await;
        for channel in ["presence:global", "memberships:alice", "room:r1"] {
            remote.fail(remote.handle_for(channel).unwrap(), ChannelStatus::Error);
        }
        clients.push(retry_delays(session.drain_ready().await));
    }

    assert_eq!(clients[0].len(), 3);
    assert_eq!(clients[1].len(), 3);
    for ((channel, delay), (other_channel, _)) in clients[0].iter().zip(&clients[1]) {
        assert_eq!(channel, other_channel);
        assert!(*delay >= Duration::from_millis(800) && *delay <= Duration::from_millis(1_200));
    }
    assert_ne!(clients[0], clients[1]);
}
