// src/core/events.rs

//! The Lifecycle Event Emitter (§2 external interface #10): a fire-and-forget audit
//! stream. The core publishes to it; nothing downstream of this module is in scope.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 4096;

/// One audited membership lifecycle fact. `location` is the member that produced it,
/// matching how a rename (§6 item) updates "event location".
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub location: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    MemberJoined,
    MemberRenamed,
    MemberUpdated,
    MemberDeleted,
    MemberEvacuated,
    MemberRestored,
    RoleRebalanced,
}

/// The external collaborator this core fires events at. Never awaited for a result
/// beyond "did the channel accept it" — publication failures are logged, not
/// propagated (§7: "Background tasks never propagate errors outward").
#[async_trait]
pub trait LifecycleEventEmitter: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// A broadcast-channel-backed emitter for tests and for wiring a local subscriber
/// (e.g. a debug log sink) without a real external audit system configured.
pub struct BroadcastLifecycleEventEmitter {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for BroadcastLifecycleEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastLifecycleEventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl LifecycleEventEmitter for BroadcastLifecycleEventEmitter {
    fn emit(&self, event: LifecycleEvent) {
        // No active subscribers is the common case outside tests; dropping the event
        // is correct, per the fire-and-forget contract.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let emitter = BroadcastLifecycleEventEmitter::new();
        emitter.emit(LifecycleEvent {
            kind: LifecycleEventKind::MemberJoined,
            location: "n1".to_string(),
            detail: serde_json::json!({}),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let emitter = BroadcastLifecycleEventEmitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(LifecycleEvent {
            kind: LifecycleEventKind::MemberDeleted,
            location: "n2".to_string(),
            detail: serde_json::json!({"force": true}),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.location, "n2");
    }
}
