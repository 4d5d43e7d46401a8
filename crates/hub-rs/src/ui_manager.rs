use crate::wire::{encode_envelope, CloseSignal, ConnId, FrameSender};
use hub_core::protocol::{
    Envelope, LockUiPayload, Message, MessageKind, QuitPayload, SetIdPayload,
};
use hub_core::state::StateTracker;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// What the hub should do with a message a UI sent.
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    /// Route it; the sender id has been rewritten to the hub.
    Forward(Envelope),
    /// Held until the UI is unlocked.
    Queued,
    /// The client asked to be disconnected.
    Disconnect,
    Ignored,
}

struct UiClient {
    conn_id: ConnId,
    sender: FrameSender,
    close: CloseSignal,
}

struct UiState {
    next_id: i32,
    clients: BTreeMap<i32, UiClient>,
    locked: bool,
    quitting: bool,
    outgoing: VecDeque<Envelope>,
    inbound: VecDeque<Envelope>,
}

pub struct UiManager {
    hub_id: AtomicI32,
    state: Arc<dyn StateTracker>,
    inner: Mutex<UiState>,
}

impl UiManager {
    /// The UI starts locked; the hub unlocks it once a manager is present.
    pub fn new(hub_id: i32, state: Arc<dyn StateTracker>) -> Self {
        Self {
            hub_id: AtomicI32::new(hub_id),
            state,
            inner: Mutex::new(UiState {
                next_id: 1,
                clients: BTreeMap::new(),
                locked: true,
                quitting: false,
                outgoing: VecDeque::new(),
                inbound: VecDeque::new(),
            }),
        }
    }

    pub fn set_hub_id(&self, hub_id: i32) {
        self.hub_id.store(hub_id, Ordering::SeqCst);
    }

    fn hub_id(&self) -> i32 {
        self.hub_id.load(Ordering::SeqCst)
    }

    /// Admits a UI: assigns its client id, replays session state, then
    /// reports the current lock flag, in that order. A UI that cannot keep
    /// up is dropped and its connection is closed through `close`.
    pub async fn add_client(
        &self,
        conn_id: ConnId,
        sender: FrameSender,
        close: CloseSignal,
    ) -> i32 {
        let mut inner = self.inner.lock().await;
        let client_id = inner.next_id;
        inner.next_id += 1;

        let mut greeting = vec![Envelope::new(
            self.hub_id(),
            Message::SetId(SetIdPayload { id: client_id }),
        )];
        if !inner.quitting {
            greeting.extend(self.state.state_log());
        }
        greeting.push(Envelope::new(
            self.hub_id(),
            Message::LockUi(LockUiPayload {
                locked: inner.locked,
            }),
        ));

        let client = UiClient {
            conn_id,
            sender,
            close,
        };
        if greeting.iter().all(|envelope| deliver(&client, envelope)) {
            inner.clients.insert(client_id, client);
            info!(event = "ui_client_added", conn_id, client_id, locked = inner.locked);
        } else {
            warn!(event = "ui_client_greeting_failed", conn_id, client_id);
            client.close.trip();
        }
        client_id
    }

    pub async fn remove_client(&self, conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.clients.len();
        inner.clients.retain(|_, client| client.conn_id != conn_id);
        let removed = inner.clients.len() != before;
        if removed {
            info!(event = "ui_client_removed", conn_id);
        }
        removed
    }

    /// Broadcasts to every UI, or queues while locked.
    pub async fn send_message(&self, envelope: &Envelope) {
        let mut inner = self.inner.lock().await;
        if inner.locked {
            inner.outgoing.push_back(envelope.clone());
            return;
        }
        broadcast(&mut inner, envelope);
    }

    /// Sets the lock flag and tells the UIs. Unlocking flushes queued
    /// broadcasts in order and returns queued UI input for routing.
    pub async fn lock_ui(&self, locked: bool) -> Vec<Envelope> {
        let mut inner = self.inner.lock().await;
        if inner.locked == locked {
            return Vec::new();
        }
        inner.locked = locked;
        info!(event = "ui_lock_changed", locked, clients = inner.clients.len());

        if locked {
            let notice = self.lock_notice(true);
            broadcast(&mut inner, &notice);
            return Vec::new();
        }

        let queued = std::mem::take(&mut inner.outgoing);
        for envelope in &queued {
            broadcast(&mut inner, envelope);
        }
        let notice = self.lock_notice(false);
        broadcast(&mut inner, &notice);
        inner.inbound.drain(..).collect()
    }

    fn lock_notice(&self, locked: bool) -> Envelope {
        Envelope::new(self.hub_id(), Message::LockUi(LockUiPayload { locked }))
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.lock().await.locked
    }

    /// Classifies input from a UI connection.
    pub async fn handle_message(&self, conn_id: ConnId, mut envelope: Envelope) -> UiAction {
        match envelope.kind() {
            MessageKind::CloseConnection => {
                self.remove_client(conn_id).await;
                return UiAction::Disconnect;
            }
            MessageKind::LockUi | MessageKind::SetId | MessageKind::Identify => {
                debug!(event = "ui_message_ignored", conn_id, kind = %envelope.kind());
                return UiAction::Ignored;
            }
            _ => {}
        }

        envelope.sender_id = self.hub_id();
        let mut inner = self.inner.lock().await;
        if inner.locked && envelope.kind() != MessageKind::Quit {
            inner.inbound.push_back(envelope);
            return UiAction::Queued;
        }
        UiAction::Forward(envelope)
    }

    /// Tells every UI to quit and forgets them.
    pub async fn request_quit(&self) {
        let mut inner = self.inner.lock().await;
        if inner.quitting {
            return;
        }
        inner.quitting = true;
        let quit = Envelope::new(self.hub_id(), Message::Quit(QuitPayload::default()));
        for client in inner.clients.values() {
            deliver(client, &quit);
        }
        let count = inner.clients.len();
        inner.clients.clear();
        inner.outgoing.clear();
        inner.inbound.clear();
        info!(event = "ui_quit_requested", clients = count);
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }
}

fn deliver(client: &UiClient, envelope: &Envelope) -> bool {
    let frame = match encode_envelope(envelope) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "ui_encode_error", conn_id = client.conn_id, error = %err);
            return true;
        }
    };
    match client.sender.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(event = "ui_slow_consumer", conn_id = client.conn_id);
            false
        }
    }
}

fn broadcast(inner: &mut UiState, envelope: &Envelope) {
    inner.clients.retain(|client_id, client| {
        let delivered = deliver(client, envelope);
        if !delivered {
            info!(event = "ui_client_dropped", conn_id = client.conn_id, client_id);
            client.close.trip();
        }
        delivered
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::codec::{decode_frame, DEFAULT_MAX_FRAME_BYTES};
    use hub_core::protocol::{id, SpawnPayload, StatePayload};
    use hub_core::state::MemoryStateTracker;

    fn state_change(n: i64) -> Envelope {
        Envelope::new(
            7,
            Message::State(StatePayload {
                kind: "parameter".to_string(),
                body: serde_json::json!({ "n": n }),
            }),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode"));
        }
        out
    }

    fn manager(state: Arc<MemoryStateTracker>) -> UiManager {
        UiManager::new(id::MASTER_HUB, state)
    }

    #[tokio::test]
    async fn locked_broadcasts_flush_in_order_on_unlock() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        let (tx, mut rx) = mpsc::channel(64);
        ui.add_client(1, tx, CloseSignal::new()).await;
        drain(&mut rx);

        for n in 1..=3 {
            ui.send_message(&state_change(n)).await;
        }
        assert!(drain(&mut rx).is_empty());

        ui.lock_ui(false).await;
        ui.send_message(&state_change(4)).await;

        let received = drain(&mut rx);
        let order = received
            .iter()
            .filter_map(|envelope| match &envelope.msg {
                Message::State(state) => state.body["n"].as_i64(),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(matches!(
            received[3].msg,
            Message::LockUi(LockUiPayload { locked: false })
        ));
    }

    #[tokio::test]
    async fn new_client_gets_id_then_replay_then_lock_flag() {
        let state = Arc::new(MemoryStateTracker::new());
        for (spawn_id, name) in [(1, "reader"), (2, "renderer")] {
            state.handle(&Envelope::new(
                id::MASTER_HUB,
                Message::Spawn(SpawnPayload {
                    hub_id: id::MASTER_HUB,
                    module_name: name.to_string(),
                    spawn_id,
                }),
            ));
        }
        let ui = manager(state);
        let (tx, mut rx) = mpsc::channel(64);
        let client_id = ui.add_client(9, tx, CloseSignal::new()).await;

        let received = drain(&mut rx);
        assert_eq!(received.len(), 4);
        assert!(matches!(received[0].msg, Message::SetId(SetIdPayload { id }) if id == client_id));
        assert!(matches!(&received[1].msg, Message::Spawn(s) if s.module_name == "reader"));
        assert!(matches!(&received[2].msg, Message::Spawn(s) if s.module_name == "renderer"));
        assert!(matches!(
            received[3].msg,
            Message::LockUi(LockUiPayload { locked: true })
        ));
    }

    #[tokio::test]
    async fn client_ids_are_not_reused() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let first = ui.add_client(1, tx_a, CloseSignal::new()).await;
        assert!(ui.remove_client(1).await);
        assert!(!ui.remove_client(1).await);
        let second = ui.add_client(2, tx_b, CloseSignal::new()).await;
        assert_ne!(first, second);
        assert_eq!(ui.client_count().await, 1);
    }

    #[tokio::test]
    async fn input_while_locked_is_released_on_unlock() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        let input = state_change(1);
        assert_eq!(ui.handle_message(3, input.clone()).await, UiAction::Queued);

        let released = ui.lock_ui(false).await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].sender_id, id::MASTER_HUB);

        match ui.handle_message(3, input).await {
            UiAction::Forward(envelope) => assert_eq!(envelope.sender_id, id::MASTER_HUB),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn quit_from_ui_passes_the_lock() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        let quit = Envelope::new(0, Message::Quit(QuitPayload::default()));
        assert!(matches!(
            ui.handle_message(3, quit).await,
            UiAction::Forward(_)
        ));
    }

    #[tokio::test]
    async fn close_connection_removes_client() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        let (tx, _rx) = mpsc::channel(8);
        ui.add_client(5, tx, CloseSignal::new()).await;
        let close = Envelope::new(
            0,
            Message::CloseConnection(hub_core::protocol::CloseConnectionPayload {
                reason: "bye".to_string(),
            }),
        );
        assert_eq!(ui.handle_message(5, close).await, UiAction::Disconnect);
        assert_eq!(ui.client_count().await, 0);
    }

    #[tokio::test]
    async fn request_quit_notifies_and_clears_clients() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        let (tx, mut rx) = mpsc::channel(8);
        ui.add_client(1, tx, CloseSignal::new()).await;
        drain(&mut rx);

        ui.request_quit().await;
        let received = drain(&mut rx);
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0].msg, Message::Quit(_)));
        assert_eq!(ui.client_count().await, 0);

        let (tx_late, mut rx_late) = mpsc::channel(8);
        ui.add_client(2, tx_late, CloseSignal::new()).await;
        let late = drain(&mut rx_late);
        assert_eq!(late.len(), 2, "no state replay while quitting");
    }

    #[tokio::test]
    async fn dead_client_is_dropped_on_broadcast() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        ui.lock_ui(false).await;
        let (tx, rx) = mpsc::channel(8);
        let close = CloseSignal::new();
        ui.add_client(1, tx, close.clone()).await;
        drop(rx);
        ui.send_message(&state_change(1)).await;
        assert_eq!(ui.client_count().await, 0);
        assert!(close.is_tripped(), "the dropped UI's connection is torn down");
    }

    #[tokio::test]
    async fn slow_client_is_dropped_and_closed_but_others_keep_receiving() {
        let ui = manager(Arc::new(MemoryStateTracker::new()));
        ui.lock_ui(false).await;
        let (slow_tx, _slow_rx) = mpsc::channel(2);
        let slow_close = CloseSignal::new();
        ui.add_client(1, slow_tx, slow_close.clone()).await;
        let (tx, mut rx) = mpsc::channel(64);
        let close = CloseSignal::new();
        ui.add_client(2, tx, close.clone()).await;
        drain(&mut rx);

        ui.send_message(&state_change(1)).await;
        assert!(slow_close.is_tripped());
        assert!(!close.is_tripped());
        assert_eq!(ui.client_count().await, 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
