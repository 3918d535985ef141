//! Per-probe notifications for live subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::db::PingStatus;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A notification emitted by the probe engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeEvent {
    ProbeUpdate {
        endpoint_id: i64,
        address: String,
        status: PingStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    ProbeError {
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint_id: Option<i64>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProbeEvent {
    pub fn error(endpoint_id: Option<i64>, message: impl Into<String>) -> Self {
        ProbeEvent::ProbeError {
            endpoint_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("event channel closed")]
    Closed,
}

/// Best-effort delivery of probe events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ProbeEvent) -> Result<(), PublishError>;
}

/// Fans events out to every current subscriber until closed.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProbeEvent>,
    closed: CancellationToken,
}

impl BroadcastPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.tx.subscribe()
    }

    /// Stop accepting events. Subscribers watching [`Self::closed`] end
    /// their streams.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Fires once the publisher is closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: ProbeEvent) -> Result<(), PublishError> {
        if self.closed.is_cancelled() {
            return Err(PublishError::Closed);
        }
        // No subscribers is not a failure
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_json_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let update = ProbeEvent::ProbeUpdate {
            endpoint_id: 3,
            address: "10.0.0.3".into(),
            status: PingStatus::Timeout,
            latency_ms: None,
            timestamp: ts,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "probe_update");
        assert_eq!(json["status"], "timeout");
        assert!(json.get("latency_ms").is_none());

        let json = serde_json::to_value(ProbeEvent::error(None, "resolve failed")).unwrap();
        assert_eq!(json["type"], "probe_error");
        assert_eq!(json["message"], "resolve failed");
        assert!(json.get("endpoint_id").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let publisher = BroadcastPublisher::new();
        tokio_test::assert_ok!(publisher.publish(ProbeEvent::error(Some(1), "lost")).await);

        let mut rx = publisher.subscribe();
        publisher.publish(ProbeEvent::error(Some(2), "boom")).await.unwrap();
        match rx.recv().await.unwrap() {
            ProbeEvent::ProbeError { endpoint_id, .. } => assert_eq!(endpoint_id, Some(2)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_publisher_rejects_events() {
        let publisher = BroadcastPublisher::new();
        let closed = publisher.closed();
        let mut rx = publisher.subscribe();
        assert!(!closed.is_cancelled());

        publisher.close();
        assert!(closed.is_cancelled());
        let err = publisher.publish(ProbeEvent::error(Some(1), "late")).await.unwrap_err();
        assert!(matches!(err, PublishError::Closed));
        assert!(rx.try_recv().is_err());
    }
}
