//! Real-time fan-out of state changes to connected observers
//!
//! Built on a tokio broadcast channel: publishing never waits for observers,
//! an observer that falls behind loses the oldest pushes, and there is no
//! replay for observers that connect later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 256;

/// One notification delivered to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Push {
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Push {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Greeting sent to every observer as soon as it connects
    pub fn connected() -> Self {
        Self::new("connected", serde_json::Value::Null)
    }
}

/// Publisher handle, cheap to clone
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Push>,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<Push> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fire-and-forget delivery to every connected observer.
    ///
    /// Returns how many observers the push was queued for; zero observers is not an error.
    pub fn publish(&self, kind: &str, payload: serde_json::Value) -> usize {
        match self.tx.send(Push::new(kind, payload)) {
            Ok(observers) => {
                tracing::debug!(kind, observers, "published");
                observers
            }
            Err(_) => {
                tracing::trace!(kind, "no observers connected");
                0
            }
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_without_observers_is_noop() {
        let publisher = Publisher::default();
        assert_eq!(publisher.observer_count(), 0);
        assert_eq!(publisher.publish("worker-start", json!({"workerId": "w-1"})), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_observer() {
        let publisher = Publisher::default();
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        assert_eq!(publisher.publish("worker-stop", json!({"workerId": "w-1"})), 2);

        let push_a = a.recv().await.unwrap();
        let push_b = b.recv().await.unwrap();
        assert_eq!(push_a.kind, "worker-stop");
        assert_eq!(push_a, push_b);
        assert_eq!(push_a.payload["workerId"], "w-1");
    }

    #[tokio::test]
    async fn test_dropped_observer_does_not_affect_others() {
        let publisher = Publisher::default();
        let dropped = publisher.subscribe();
        let mut alive = publisher.subscribe();
        drop(dropped);

        assert_eq!(publisher.publish("session-stop", json!({})), 1);
        assert_eq!(alive.recv().await.unwrap().kind, "session-stop");
    }

    #[tokio::test]
    async fn test_no_replay_for_late_observers() {
        let publisher = Publisher::default();
        let _early = publisher.subscribe();
        publisher.publish("worker-start", json!({}));

        let mut late = publisher.subscribe();
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_slow_observer_lags_instead_of_blocking() {
        let publisher = Publisher::new(2);
        let mut slow = publisher.subscribe();
        for i in 0..5 {
            publisher.publish("tick", json!({ "i": i }));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(slow.recv().await.unwrap().payload["i"], 3);
    }

    #[test]
    fn test_push_serialization() {
        let push = Push::new("worker-start", json!({"workerId": "w-1"}));
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["kind"], "worker-start");
        assert_eq!(json["payload"]["workerId"], "w-1");
        assert!(json["timestamp"].is_string());

        let connected = serde_json::to_value(Push::connected()).unwrap();
        assert_eq!(connected["kind"], "connected");
        assert!(connected.get("payload").is_none());
    }
}
