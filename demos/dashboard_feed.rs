use dashcast::{
    Admission, Delivery, Frame, Hub, HubConfig, InboundEvent, OutboundMessage, Role, UserId,
};
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Print every frame a simulated browser receives until its transport closes
fn spawn_client(name: &'static str, mut rx: Receiver<Frame>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Message(envelope) => match envelope.to_json() {
                    Ok(json) => println!("[{}] {}", name, json),
                    Err(e) => error!(client = name, error = %e, "Failed to encode envelope"),
                },
                Frame::Ping => println!("[{}] <ping>", name),
                Frame::Close(status) => {
                    println!("[{}] closed: {} ({})", name, status.code(), status.reason());
                    break;
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> dashcast::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let heartbeat_secs = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(30);
    let config = HubConfig {
        heartbeat_interval: Duration::from_secs(heartbeat_secs),
        ..Default::default()
    };
    let hub = Arc::new(Hub::new(config)?);
    hub.start();

    let (transport, rx) = hub.channel_transport();
    let admin_client = spawn_client("admin", rx);
    hub.admit(Admission::new("admin-1", "Ada", Role::Admin, Arc::new(transport)))
        .await?;

    let (transport, rx) = hub.channel_transport();
    let staff_client = spawn_client("staff", rx);
    let staff = hub
        .admit(Admission::new("staff-1", "Sam", Role::Staff, Arc::new(transport)))
        .await?;
    hub.handle_inbound(&staff.id(), InboundEvent::Subscribe("equipment".into()))
        .await?;

    hub.broadcast_to_topic(
        "equipment",
        &OutboundMessage::new("equipment_status", json!({ "itemId": "cam-3", "status": "repair" })),
        None,
    )
    .await;
    hub.broadcast_to_role(
        Role::Admin,
        &OutboundMessage::new("dashboard_metrics", json!({ "activeUsers": 2 })),
        None,
    )
    .await;

    // Targeted messages for a student who has not connected yet
    let student = UserId::from("student-7");
    for (kind, data) in [
        ("notification", json!({ "text": "Your reservation starts in 10 minutes" })),
        ("overdue_alert", json!({ "itemId": "laptop-12" })),
    ] {
        if let Delivery::Queued { message_id, priority } =
            hub.send_to_user(&student, &OutboundMessage::new(kind, data)).await
        {
            info!(%message_id, %priority, kind, "Queued for offline user");
        }
    }

    let (transport, rx) = hub.channel_transport();
    let student_client = spawn_client("student", rx);
    hub.admit(Admission::new(student.clone(), "Stu", Role::Student, Arc::new(transport)))
        .await?;

    let stats = hub.snapshot();
    info!(
        connections = stats.total_connections,
        topics = stats.active_topics,
        sent = stats.messages_sent,
        queued = stats.messages_queued,
        "Hub snapshot"
    );

    hub.shutdown().await;
    for client in [admin_client, staff_client, student_client] {
        let _ = client.await;
    }
    Ok(())
}
