use crate::wire::ConnId;
use hub_core::protocol::{Envelope, MessageKind};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("connection {0} closed before the reply arrived")]
    Disconnected(ConnId),
    #[error("hub shut down before the reply arrived")]
    Cancelled,
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
    #[error("a request with uuid {0} is already pending")]
    Duplicate(Uuid),
}

struct PendingEntry {
    owner: Option<ConnId>,
    kind: MessageKind,
    reply: oneshot::Sender<Result<Envelope, PendingError>>,
}

/// Outstanding requests keyed by uuid. Replies may arrive in any order.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<Uuid, PendingEntry>>,
}

pub struct Waiter {
    uuid: Uuid,
    rx: oneshot::Receiver<Result<Envelope, PendingError>>,
}

impl Waiter {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub async fn wait(self) -> Result<Envelope, PendingError> {
        self.rx.await.unwrap_or(Err(PendingError::Cancelled))
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<Envelope, PendingError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(PendingError::TimedOut(timeout)),
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// `owner` is the connection the reply is expected from; its loss fails
    /// the waiter.
    pub async fn register(
        &self,
        uuid: Uuid,
        owner: Option<ConnId>,
        kind: MessageKind,
    ) -> Result<Waiter, PendingError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&uuid) {
            return Err(PendingError::Duplicate(uuid));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            uuid,
            PendingEntry {
                owner,
                kind,
                reply: tx,
            },
        );
        Ok(Waiter { uuid, rx })
    }

    /// Hands `reply` to the waiter registered under `uuid`. Unmatched replies
    /// return false and are left to normal routing.
    pub async fn fulfill(&self, uuid: Uuid, reply: Envelope) -> bool {
        let Some(entry) = self.entries.lock().await.remove(&uuid) else {
            debug!(event = "hub_pending_unmatched", uuid = %uuid, kind = %reply.kind());
            return false;
        };
        debug!(event = "hub_pending_fulfilled", uuid = %uuid, kind = %entry.kind);
        let _ = entry.reply.send(Ok(reply));
        true
    }

    pub async fn fail_owner(&self, conn_id: ConnId) -> usize {
        let failed = {
            let mut entries = self.entries.lock().await;
            let uuids = entries
                .iter()
                .filter(|(_, entry)| entry.owner == Some(conn_id))
                .map(|(uuid, _)| *uuid)
                .collect::<Vec<_>>();
            uuids
                .into_iter()
                .filter_map(|uuid| entries.remove(&uuid))
                .collect::<Vec<_>>()
        };
        let count = failed.len();
        for entry in failed {
            let _ = entry.reply.send(Err(PendingError::Disconnected(conn_id)));
        }
        count
    }

    pub async fn fail_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.entries.lock().await);
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.reply.send(Err(PendingError::Cancelled));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::protocol::{id, BarrierPayload, Message, SpawnPayload};
    use std::sync::Arc;

    fn spawn_reply(referrer: Uuid, spawn_id: i32) -> Envelope {
        Envelope::new(
            id::MASTER_HUB,
            Message::Spawn(SpawnPayload {
                hub_id: id::MASTER_HUB,
                module_name: "reader".to_string(),
                spawn_id,
            }),
        )
        .with_referrer(referrer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replies_reach_their_own_waiter_in_any_order() {
        let pending = Arc::new(PendingRequests::new());
        let uuid_a = Uuid::new_v4();
        let uuid_b = Uuid::new_v4();
        let waiter_a = pending
            .register(uuid_a, Some(1), MessageKind::Spawn)
            .await
            .expect("register a");
        let waiter_b = pending
            .register(uuid_b, Some(1), MessageKind::Spawn)
            .await
            .expect("register b");

        let task_a = tokio::spawn(waiter_a.wait());
        let task_b = tokio::spawn(waiter_b.wait());

        assert!(pending.fulfill(uuid_b, spawn_reply(uuid_b, 2)).await);
        assert!(pending.fulfill(uuid_a, spawn_reply(uuid_a, 1)).await);

        let reply_a = task_a.await.expect("join a").expect("reply a");
        let reply_b = task_b.await.expect("join b").expect("reply b");
        assert_eq!(reply_a.referrer, Some(uuid_a));
        assert_eq!(reply_b.referrer, Some(uuid_b));
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn unmatched_reply_is_not_consumed() {
        let pending = PendingRequests::new();
        let stray = Uuid::new_v4();
        assert!(!pending.fulfill(stray, spawn_reply(stray, 1)).await);
    }

    #[tokio::test]
    async fn owner_disconnect_releases_only_its_waiters() {
        let pending = PendingRequests::new();
        let lost = pending
            .register(Uuid::new_v4(), Some(7), MessageKind::Barrier)
            .await
            .expect("register");
        let kept_uuid = Uuid::new_v4();
        let kept = pending
            .register(kept_uuid, Some(8), MessageKind::Barrier)
            .await
            .expect("register");

        assert_eq!(pending.fail_owner(7).await, 1);
        assert_eq!(lost.wait().await, Err(PendingError::Disconnected(7)));
        assert_eq!(pending.len().await, 1);

        let reached = Envelope::new(
            id::MASTER_HUB,
            Message::BarrierReached(BarrierPayload { uuid: kept_uuid }),
        );
        assert!(pending.fulfill(kept_uuid, reached.clone()).await);
        assert_eq!(kept.wait().await, Ok(reached));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let pending = PendingRequests::new();
        let waiter = pending
            .register(Uuid::new_v4(), None, MessageKind::Spawn)
            .await
            .expect("register");
        assert_eq!(pending.fail_all().await, 1);
        assert_eq!(waiter.wait().await, Err(PendingError::Cancelled));
    }

    #[tokio::test]
    async fn duplicate_uuid_is_refused() {
        let pending = PendingRequests::new();
        let uuid = Uuid::new_v4();
        let _waiter = pending
            .register(uuid, None, MessageKind::Spawn)
            .await
            .expect("register");
        assert!(matches!(
            pending.register(uuid, None, MessageKind::Spawn).await,
            Err(PendingError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn wait_timeout_reports_elapsed_wait() {
        let pending = PendingRequests::new();
        let waiter = pending
            .register(Uuid::new_v4(), None, MessageKind::Spawn)
            .await
            .expect("register");
        let timeout = Duration::from_millis(20);
        assert_eq!(
            waiter.wait_timeout(timeout).await,
            Err(PendingError::TimedOut(timeout))
        );
    }
}
