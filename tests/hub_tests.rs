use async_trait::async_trait;
use dashcast::{
    Admission, BroadcastReport, CloseStatus, Connection, Delivery, Envelope, Error, Frame, Hub,
    HubConfig, InboundEvent, OutboundMessage, Priority, Result, Role, Transport, UserId,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tokio::sync::Notify;
use tracing_test::traced_test;

/// A transport whose every operation fails
struct BrokenTransport {
    closes: AtomicUsize,
}

impl BrokenTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for BrokenTransport {
    async fn send(&self, _envelope: &Envelope) -> Result<()> {
        Err(Error::Transport("connection reset by peer".into()))
    }

    async fn probe(&self) -> Result<()> {
        Err(Error::Transport("connection reset by peer".into()))
    }

    async fn close(&self, _status: CloseStatus) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(Error::Transport("connection reset by peer".into()))
    }
}

/// A transport whose sends block until released and then fail, like a peer
/// whose socket is torn down mid-write
struct GatedTransport {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, _envelope: &Envelope) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Err(Error::TransportClosed)
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _status: CloseStatus) -> Result<()> {
        Ok(())
    }
}

fn new_hub() -> Hub {
    Hub::new(HubConfig::default()).expect("Failed to create hub")
}

async fn connect(hub: &Hub, user: &str, role: Role) -> (Arc<Connection>, Receiver<Frame>) {
    let (transport, rx) = hub.channel_transport();
    let connection = hub
        .admit(Admission::new(user, format!("User {}", user), role, Arc::new(transport)))
        .await
        .expect("Failed to admit connection");
    (connection, rx)
}

/// Envelopes received so far, skipping presence events and control frames
fn messages(rx: &mut Receiver<Frame>) -> Vec<Envelope> {
    let mut received = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Frame::Message(envelope) = frame {
            if envelope.kind != "user_joined" && envelope.kind != "user_left" {
                received.push(envelope);
            }
        }
    }
    received
}

fn kinds(rx: &mut Receiver<Frame>) -> Vec<String> {
    messages(rx).into_iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn test_distinct_connections_have_distinct_records() {
    let hub = new_hub();
    let (c1, _rx1) = connect(&hub, "u1", Role::Staff).await;
    let (c2, _rx2) = connect(&hub, "u2", Role::Staff).await;

    let got1 = hub.get(&c1.id()).expect("c1 should be registered");
    let got2 = hub.get(&c2.id()).expect("c2 should be registered");

    assert_ne!(got1.id(), got2.id());
    assert!(!Arc::ptr_eq(&got1, &got2));
    assert_eq!(got1.user_id().as_str(), "u1");
    assert_eq!(got2.user_id().as_str(), "u2");
}

#[tokio::test]
async fn test_last_connection_wins() {
    let hub = new_hub();
    let (first, _rx1) = connect(&hub, "u1", Role::Student).await;
    let (second, mut rx2) = connect(&hub, "u1", Role::Student).await;

    let current = hub.get_by_user(&"u1".into()).expect("user should be online");
    assert_eq!(current.id(), second.id());
    assert!(hub.get(&first.id()).is_none());

    let delivery = hub
        .send_to_user(&"u1".into(), &OutboundMessage::empty("notification"))
        .await;
    assert_eq!(delivery, Delivery::Sent);
    assert_eq!(kinds(&mut rx2), vec!["notification"]);
}

#[tokio::test]
async fn test_topic_broadcast_reaches_exact_subscribers() {
    let hub = new_hub();
    let (a, mut rx_a) = connect(&hub, "a", Role::Student).await;
    let (b, mut rx_b) = connect(&hub, "b", Role::Student).await;
    let (c, mut rx_c) = connect(&hub, "c", Role::Student).await;
    let (d, mut rx_d) = connect(&hub, "d", Role::Student).await;

    for connection in [&a, &b, &c, &d] {
        hub.subscribe(&connection.id(), "equipment").unwrap();
    }
    hub.subscribe(&a.id(), "activities").unwrap();
    hub.unsubscribe(&b.id(), "equipment");
    hub.disconnect(&c.id()).await;

    let report = hub
        .broadcast_to_topic("equipment", &OutboundMessage::empty("equipment_status"), None)
        .await;

    assert_eq!(report, BroadcastReport { sent: 2, failed: 0 });
    assert_eq!(kinds(&mut rx_a), vec!["equipment_status"]);
    assert!(kinds(&mut rx_b).is_empty());
    assert!(kinds(&mut rx_c).is_empty());
    assert_eq!(kinds(&mut rx_d), vec!["equipment_status"]);
}

#[tokio::test]
async fn test_topic_broadcast_honours_exclude() {
    let hub = new_hub();
    let (a, mut rx_a) = connect(&hub, "a", Role::Staff).await;
    let (b, mut rx_b) = connect(&hub, "b", Role::Staff).await;
    hub.subscribe(&a.id(), "activities").unwrap();
    hub.subscribe(&b.id(), "activities").unwrap();

    hub.broadcast_to_topic("activities", &OutboundMessage::empty("check_out"), Some(&a.id()))
        .await;

    assert!(kinds(&mut rx_a).is_empty());
    assert_eq!(kinds(&mut rx_b), vec!["check_out"]);
}

#[tokio::test]
#[traced_test]
async fn test_broadcast_all_isolates_failing_recipient() {
    let hub = new_hub();
    let mut receivers = Vec::new();
    for i in 0..4 {
        let (_connection, rx) = connect(&hub, &format!("ok-{}", i), Role::Student).await;
        receivers.push(rx);
    }
    let broken = BrokenTransport::new();
    let bad = hub
        .admit(Admission::new("bad", "Bad", Role::Student, broken.clone()))
        .await
        .unwrap();

    let report = hub
        .broadcast_all(&OutboundMessage::new("dashboard_metrics", json!({ "visitors": 12 })), None)
        .await;

    assert_eq!(report, BroadcastReport { sent: 4, failed: 1 });
    for rx in receivers.iter_mut() {
        assert_eq!(kinds(rx), vec!["dashboard_metrics"]);
    }
    assert!(hub.get(&bad.id()).is_none());
    assert_eq!(hub.snapshot().total_connections, 4);
    assert_eq!(hub.snapshot().connections_evicted, 1);
    assert_eq!(broken.closes.load(Ordering::SeqCst), 1);
    assert!(logs_contain("Delivery failed, evicting connection"));
}

#[tokio::test]
async fn test_offline_message_replayed_before_later_sends() {
    let hub = new_hub();
    let user = UserId::from("u2");

    hub.send_to_user(&user, &OutboundMessage::empty("dashboard_metrics"))
        .await;
    hub.send_to_user(&user, &OutboundMessage::new("notification", json!({ "n": 1 })))
        .await;
    hub.send_to_user(&user, &OutboundMessage::new("notification", json!({ "n": 2 })))
        .await;
    hub.send_to_user(&user, &OutboundMessage::empty("security_alert"))
        .await;

    let (_connection, mut rx) = connect(&hub, "u2", Role::Student).await;
    hub.send_to_user(&user, &OutboundMessage::empty("check_in"))
        .await;

    let received = messages(&mut rx);
    let order: Vec<_> = received
        .iter()
        .map(|e| (e.kind.as_str(), e.data.get("n").and_then(|n| n.as_i64())))
        .collect();
    assert_eq!(
        order,
        vec![
            ("security_alert", None),
            ("notification", Some(1)),
            ("notification", Some(2)),
            ("dashboard_metrics", None),
            ("check_in", None),
        ]
    );
    assert!(hub.pending_for(&user).is_empty());
}

#[tokio::test]
async fn test_replayed_message_keeps_queued_id() {
    let hub = new_hub();
    let user = UserId::from("u3");
    let queued_id = match hub
        .send_to_user(&user, &OutboundMessage::empty("notification"))
        .await
    {
        Delivery::Queued { message_id, .. } => message_id,
        other => panic!("expected the message to be queued, got {:?}", other),
    };

    let (_connection, mut rx) = connect(&hub, "u3", Role::Student).await;
    let replayed = messages(&mut rx);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, queued_id);
}

#[tokio::test]
async fn test_disconnect_enqueue_reconnect_drain() {
    let hub = new_hub();
    let (connection, _rx) = connect(&hub, "u1", Role::Staff).await;
    hub.disconnect(&connection.id()).await;

    let delivery = hub
        .send_to_user(&"u1".into(), &OutboundMessage::empty("overdue_alert"))
        .await;
    assert!(matches!(
        delivery,
        Delivery::Queued {
            priority: Priority::High,
            ..
        }
    ));
    assert_eq!(hub.pending_for(&"u1".into()).len(), 1);
    assert_eq!(hub.snapshot().queued_messages, 1);

    let (_connection, mut rx) = connect(&hub, "u1", Role::Staff).await;
    assert_eq!(kinds(&mut rx), vec!["overdue_alert"]);
    assert!(hub.pending_for(&"u1".into()).is_empty());
    assert_eq!(hub.snapshot().queued_messages, 0);
}

#[tokio::test]
async fn test_failed_replay_keeps_message_queued() {
    let hub = new_hub();
    let user = UserId::from("u4");
    hub.send_to_user(&user, &OutboundMessage::empty("notification"))
        .await;

    let result = hub
        .admit(Admission::new("u4", "U4", Role::Student, BrokenTransport::new()))
        .await;
    let connection = result.expect("admission itself succeeds");

    assert!(hub.get(&connection.id()).is_none());
    let pending = hub.pending_for(&user);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].delivery_attempts, 1);

    let (_connection, mut rx) = connect(&hub, "u4", Role::Student).await;
    assert_eq!(kinds(&mut rx), vec!["notification"]);
    assert!(hub.pending_for(&user).is_empty());
}

#[tokio::test]
async fn test_readmission_during_replay_moves_remainder_to_new_connection() {
    let hub = Arc::new(new_hub());
    let user = UserId::from("u1");
    hub.send_to_user(&user, &OutboundMessage::empty("notification"))
        .await;
    hub.send_to_user(&user, &OutboundMessage::empty("check_in"))
        .await;

    let gate = Arc::new(GatedTransport {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let first = {
        let hub = Arc::clone(&hub);
        let transport: Arc<dyn Transport> = gate.clone();
        tokio::spawn(async move {
            hub.admit(Admission::new("u1", "U1", Role::Student, transport))
                .await
        })
    };
    gate.entered.notified().await;

    // The replay to the first connection is in flight when the user reconnects
    let (second, mut rx) = connect(&hub, "u1", Role::Student).await;
    gate.release.notify_one();
    let stale = first
        .await
        .expect("admission task panicked")
        .expect("first admission succeeds");

    assert!(hub.get(&stale.id()).is_none());
    assert_eq!(hub.get_by_user(&user).map(|c| c.id()), Some(second.id()));
    assert_eq!(kinds(&mut rx), vec!["notification", "check_in"]);
    assert!(hub.pending_for(&user).is_empty());
    assert_eq!(hub.snapshot().queued_messages, 0);
}

#[tokio::test]
async fn test_expired_message_swept_without_delivery() {
    let hub = new_hub();
    let user = UserId::from("u5");
    hub.send_to_user(&user, &OutboundMessage::empty("check_in"))
        .await;
    hub.send_to_user(&user, &OutboundMessage::empty("emergency"))
        .await;

    let report = hub
        .reap_stale(Instant::now() + Duration::from_secs(90 * 60))
        .await;

    assert_eq!(report.expired_messages, 1);
    let pending = hub.pending_for(&user);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, Priority::Critical);
}

#[tokio::test]
async fn test_silent_peer_evicted_on_second_heartbeat() {
    let hub = new_hub();
    let (silent, _rx1) = connect(&hub, "silent", Role::Student).await;
    let (chatty, _rx2) = connect(&hub, "chatty", Role::Student).await;

    hub.heartbeat_tick().await;
    hub.handle_inbound(&chatty.id(), InboundEvent::Pong)
        .await
        .unwrap();
    assert!(hub.get(&silent.id()).is_some());

    let report = hub.heartbeat_tick().await;
    assert_eq!(report.unresponsive, 1);
    assert!(hub.get(&silent.id()).is_none());
    assert!(hub.get(&chatty.id()).is_some());
}

#[tokio::test]
async fn test_stale_peer_evicted_while_answering_heartbeats() {
    let hub = new_hub();
    let (connection, _rx) = connect(&hub, "idle", Role::Guest).await;

    for _ in 0..3 {
        hub.heartbeat_tick().await;
        hub.handle_inbound(&connection.id(), InboundEvent::Pong)
            .await
            .unwrap();
    }
    assert!(hub.get(&connection.id()).is_some());

    let report = hub
        .reap_stale(Instant::now() + Duration::from_secs(5 * 60 + 1))
        .await;
    assert_eq!(report.stale_evicted, 1);
    assert!(hub.get(&connection.id()).is_none());
}

#[tokio::test]
async fn test_shutdown_closes_everything_and_is_idempotent() {
    let hub = Arc::new(new_hub());
    hub.start();

    let (c1, mut rx1) = connect(&hub, "u1", Role::Admin).await;
    let (_c2, mut rx2) = connect(&hub, "u2", Role::Student).await;
    let broken = BrokenTransport::new();
    hub.admit(Admission::new("u3", "U3", Role::Guest, broken.clone()))
        .await
        .unwrap();
    hub.subscribe(&c1.id(), "activities").unwrap();
    hub.send_to_user(&"offline".into(), &OutboundMessage::empty("notification"))
        .await;

    hub.shutdown().await;

    let stats = hub.snapshot();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.total_subscriptions, 0);
    assert_eq!(stats.active_topics, 0);
    assert_eq!(stats.queued_messages, 0);
    assert_eq!(broken.closes.load(Ordering::SeqCst), 1);

    for rx in [&mut rx1, &mut rx2] {
        let mut last = None;
        while let Some(frame) = rx.recv().await {
            last = Some(frame);
        }
        assert_eq!(last, Some(Frame::Close(CloseStatus::ServerShutdown)));
    }

    hub.shutdown().await;
    assert_eq!(hub.snapshot().total_connections, 0);
    assert!(hub.is_shutting_down());
}

#[tokio::test]
async fn test_operations_after_shutdown_are_harmless() {
    let hub = new_hub();
    hub.shutdown().await;

    let report = hub
        .broadcast_all(&OutboundMessage::empty("dashboard_metrics"), None)
        .await;
    assert_eq!(report, BroadcastReport::default());
    assert_eq!(
        hub.send_to_user(&"u1".into(), &OutboundMessage::empty("notification"))
            .await,
        Delivery::Failed
    );
    assert_eq!(hub.snapshot().queued_messages, 0);
}

#[tokio::test]
async fn test_scenario_staff_receives_topic_check_in() {
    let hub = new_hub();
    let (u1, mut rx) = connect(&hub, "u1", Role::Staff).await;
    hub.subscribe(&u1.id(), "activities").unwrap();

    hub.broadcast_to_topic(
        "activities",
        &OutboundMessage::new("check_in", json!({ "studentId": "S-1001" })),
        None,
    )
    .await;

    let received = messages(&mut rx);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, "check_in");
    assert_eq!(received[0].data["studentId"], "S-1001");
}

#[tokio::test]
async fn test_scenario_offline_notification_queued_medium() {
    let hub = new_hub();
    let user = UserId::from("u2");

    let delivery = hub
        .send_to_user(&user, &OutboundMessage::empty("notification"))
        .await;
    assert!(matches!(
        delivery,
        Delivery::Queued {
            priority: Priority::Medium,
            ..
        }
    ));

    let (_connection, mut rx) = connect(&hub, "u2", Role::Student).await;
    assert_eq!(kinds(&mut rx), vec!["notification"]);
    assert!(hub.pending_for(&user).is_empty());
}
