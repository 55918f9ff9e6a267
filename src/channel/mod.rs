//! Newline-delimited JSON message channel over loopback TCP.
//!
//! One server endpoint (the orchestrator) talks to many client endpoints
//! (workers) with typed request/response correlation, bounded queueing,
//! and a pluggable remote-fallback sink.

mod client;
mod message;
mod server;

pub use client::MessageClient;
pub use message::{
    EscalationPayload, MessageKind, ReviewApprovedPayload, ReviewRejectedPayload,
    ReviewRequestPayload, TaskAssignmentPayload, TaskCompletedPayload, TaskFailedPayload,
    WireMessage,
};
pub use server::MessageServer;

use async_trait::async_trait;

use crate::error::Result;

/// Observable channel lifecycle and traffic.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// An inbound message was parsed (server: from any worker; client:
    /// from the server).
    Message(WireMessage),
    WorkerConnected { worker_id: String },
    WorkerDisconnected { worker_id: String },
    Connected,
    Disconnected,
    ReconnectFailed,
    Error(String),
    /// A message could not be delivered locally and was handed to the
    /// remote path.
    RemoteMessage(WireMessage),
}

/// Fallback transport for workers that are not reachable over the local
/// socket. The core specifies only this seam; the transport behind it is
/// the host's business.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn send(&self, msg: WireMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::config::ChannelConfig;

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            enable_remote_fallback: false,
            ..ChannelConfig::default()
        }
    }

    async fn connected_pair() -> (MessageServer, MessageClient) {
        let server = MessageServer::bind(test_config()).await.unwrap();
        let client = MessageClient::connect(server.port(), test_config())
            .await
            .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_first_message_binds_worker() {
        let (server, client) = connected_pair().await;

        client.introduce("worker-1").await.unwrap();
        server
            .wait_for_worker("worker-1", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(server.connected_workers(), vec!["worker-1".to_string()]);
    }

    #[tokio::test]
    async fn test_send_to_unbound_worker_returns_false() {
        let server = MessageServer::bind(test_config()).await.unwrap();
        let delivered = server
            .send("ghost", WireMessage::heartbeat("orchestrator", "ghost"))
            .await
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_round_trip_server_to_client() {
        let (server, client) = connected_pair().await;
        let mut inbound = client.subscribe();

        client.introduce("worker-1").await.unwrap();
        server
            .wait_for_worker("worker-1", Duration::from_secs(1))
            .await
            .unwrap();

        let delivered = server
            .send("worker-1", WireMessage::heartbeat("orchestrator", "worker-1"))
            .await
            .unwrap();
        assert!(delivered);

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let ChannelEvent::Message(msg) = inbound.recv().await.unwrap() {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.kind, MessageKind::Heartbeat);
        assert_eq!(event.to, "worker-1");
    }

    #[tokio::test]
    async fn test_wait_for_message_sees_queued_and_future() {
        let (server, client) = connected_pair().await;

        client.introduce("worker-1").await.unwrap();
        // Queued before the wait.
        client
            .send(&WireMessage::heartbeat("worker-1", "orchestrator"))
            .await
            .unwrap();

        let queued = server
            .wait_for_message(
                |m| m.kind == MessageKind::Heartbeat && m.from == "worker-1",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(queued.from, "worker-1");

        // Future message resolves an already-registered wait.
        let wait = server.wait_for_message(
            |m| m.kind == MessageKind::Escalation,
            Duration::from_secs(1),
        );
        let send = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client
                .send(
                    &WireMessage::escalation(
                        "worker-1",
                        "orchestrator",
                        &EscalationPayload {
                            task_id: "t-1".into(),
                            reason: "stuck".into(),
                        },
                    )
                    .unwrap(),
                )
                .await
                .unwrap();
        };
        let (received, ()) = tokio::join!(wait, send);
        assert_eq!(received.unwrap().kind, MessageKind::Escalation);
    }

    #[tokio::test]
    async fn test_wait_for_message_times_out() {
        let server = MessageServer::bind(test_config()).await.unwrap();
        let err = server
            .wait_for_message(|_| true, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_correlated_response_resolves_waiter() {
        let (server, client) = connected_pair().await;
        client.introduce("worker-1").await.unwrap();

        let wait = server.wait_for_response("corr-42", Duration::from_secs(1));
        let send = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client
                .send(
                    &WireMessage::heartbeat("worker-1", "orchestrator")
                        .with_correlation("corr-42"),
                )
                .await
                .unwrap();
        };
        let (received, ()) = tokio::join!(wait, send);
        assert_eq!(received.unwrap().correlation_id.as_deref(), Some("corr-42"));
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let config = ChannelConfig {
            max_queue_size: 3,
            enable_remote_fallback: false,
            ..ChannelConfig::default()
        };
        let server = MessageServer::bind(config.clone()).await.unwrap();
        let client = MessageClient::connect(server.port(), config).await.unwrap();

        for i in 0..4 {
            let mut msg = WireMessage::heartbeat("worker-1", "orchestrator");
            msg.id = format!("m-{}", i);
            client.send(&msg).await.unwrap();
        }
        server
            .wait_for_worker("worker-1", Duration::from_secs(1))
            .await
            .unwrap();
        // Let the last write drain into the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // m-0 was dropped; the first match is m-1.
        let first = server
            .wait_for_message(|_| true, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.id, "m-1");
    }

    #[tokio::test]
    async fn test_remote_fallback_emits_event_and_uses_sink() {
        #[derive(Default)]
        struct RecordingSink {
            sent: Mutex<Vec<WireMessage>>,
        }

        #[async_trait]
        impl RemoteSink for RecordingSink {
            async fn send(&self, msg: WireMessage) -> Result<()> {
                self.sent.lock().push(msg);
                Ok(())
            }
        }

        let sink = Arc::new(RecordingSink::default());
        let config = ChannelConfig::default();
        let server = MessageServer::bind_with_sink(config, Some(sink.clone()))
            .await
            .unwrap();
        let mut events = server.subscribe();

        server.mark_remote("far-worker");
        let delivered = server
            .send("far-worker", WireMessage::heartbeat("orchestrator", "far-worker"))
            .await
            .unwrap();
        assert!(delivered);
        assert_eq!(sink.sent.lock().len(), 1);

        let event = events.try_recv().unwrap();
        assert!(matches!(event, ChannelEvent::RemoteMessage(_)));
    }

    #[tokio::test]
    async fn test_stop_rejects_sends() {
        let (server, _client) = connected_pair().await;
        server.stop();
        let err = server
            .send("anyone", WireMessage::heartbeat("orchestrator", "anyone"))
            .await
            .unwrap_err();
        assert!(err.is_disposed());
    }
}
