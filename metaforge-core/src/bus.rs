use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Cross-engine messages. The approval engine never calls back into the
/// lifecycle manager directly; completion is a message consumed by a worker,
/// which keeps the approval → transition loop explicit and non-re-entrant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PlatformMessage {
    ApprovalCompleted {
        approval_id: Uuid,
        tenant_id: Uuid,
        realm_id: String,
        entity_name: String,
        entity_id: Uuid,
        transition_id: Uuid,
        operation_code: String,
    },
    ApprovalRejected {
        approval_id: Uuid,
        tenant_id: Uuid,
        entity_name: String,
        entity_id: Uuid,
    },
}

/// Best-effort in-process bus. Publish never fails the caller: if the
/// receiver is gone the message is dropped with a warning.
#[derive(Clone)]
pub struct PlatformBus {
    tx: mpsc::UnboundedSender<PlatformMessage>,
}

impl PlatformBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PlatformMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, msg: PlatformMessage) {
        if self.tx.send(msg).is_err() {
            tracing::warn!("platform bus receiver dropped; message discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_receiver() {
        let (bus, mut rx) = PlatformBus::channel();
        bus.publish(PlatformMessage::ApprovalRejected {
            approval_id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            entity_name: "Invoice".to_string(),
            entity_id: Uuid::now_v7(),
        });
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, PlatformMessage::ApprovalRejected { .. }));
    }

    #[tokio::test]
    async fn publish_after_receiver_drop_does_not_panic() {
        let (bus, rx) = PlatformBus::channel();
        drop(rx);
        bus.publish(PlatformMessage::ApprovalRejected {
            approval_id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            entity_name: "Invoice".to_string(),
            entity_id: Uuid::now_v7(),
        });
    }
}
