use crate::wire::{encode_envelope, CloseSignal, ConnId, FrameSender};
use hub_core::protocol::{Envelope, Identity};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnId),
    #[error("connection {conn_id} already identified as {identity}")]
    AlreadyIdentified { conn_id: ConnId, identity: Identity },
    #[error("a manager is already connected on connection {existing}")]
    DuplicateManager { existing: ConnId },
    #[error("identity {0} cannot be assigned to a control connection")]
    InvalidIdentity(Identity),
}

#[derive(Debug, Clone)]
pub struct ConnEntry {
    pub conn_id: ConnId,
    pub identity: Identity,
    /// Hub id of a peer hub once known.
    pub peer_id: Option<i32>,
    pub peer_addr: Option<SocketAddr>,
    pub sender: FrameSender,
    pub close: CloseSignal,
}

/// Every live control connection, keyed by connection id.
#[derive(Default)]
pub struct SocketRegistry {
    conn_counter: AtomicU64,
    conns: RwLock<HashMap<ConnId, ConnEntry>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection whose identity is not yet known.
    pub async fn register(&self, sender: FrameSender, peer_addr: Option<SocketAddr>) -> ConnId {
        self.insert(sender, peer_addr, Identity::Unknown, None).await
    }

    /// Adds a connection the hub dialed itself and therefore already knows.
    pub async fn register_identified(
        &self,
        sender: FrameSender,
        peer_addr: Option<SocketAddr>,
        identity: Identity,
        peer_id: Option<i32>,
    ) -> ConnId {
        self.insert(sender, peer_addr, identity, peer_id).await
    }

    async fn insert(
        &self,
        sender: FrameSender,
        peer_addr: Option<SocketAddr>,
        identity: Identity,
        peer_id: Option<i32>,
    ) -> ConnId {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.conns.write().await.insert(
            conn_id,
            ConnEntry {
                conn_id,
                identity,
                peer_id,
                peer_addr,
                sender,
                close: CloseSignal::new(),
            },
        );
        info!(
            event = "hub_conn_registered",
            conn_id,
            identity = %identity,
            peer = ?peer_addr
        );
        conn_id
    }

    /// Assigns the identity of an unidentified connection. Identity is set
    /// exactly once, and at most one manager may be connected.
    pub async fn identify(
        &self,
        conn_id: ConnId,
        identity: Identity,
        peer_id: Option<i32>,
    ) -> Result<(), RegistryError> {
        if matches!(
            identity,
            Identity::Unknown
                | Identity::Request
                | Identity::LocalBulkData
                | Identity::RemoteBulkData
        ) {
            return Err(RegistryError::InvalidIdentity(identity));
        }

        let mut conns = self.conns.write().await;
        if identity == Identity::Manager {
            if let Some(existing) = conns
                .values()
                .find(|entry| entry.identity == Identity::Manager && entry.conn_id != conn_id)
            {
                return Err(RegistryError::DuplicateManager {
                    existing: existing.conn_id,
                });
            }
        }

        let entry = conns
            .get_mut(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;
        if entry.identity != Identity::Unknown {
            return Err(RegistryError::AlreadyIdentified {
                conn_id,
                identity: entry.identity,
            });
        }
        entry.identity = identity;
        entry.peer_id = peer_id;
        info!(event = "hub_conn_identified", conn_id, identity = %identity);
        Ok(())
    }

    pub async fn identity(&self, conn_id: ConnId) -> Option<Identity> {
        self.conns.read().await.get(&conn_id).map(|entry| entry.identity)
    }

    pub async fn entry(&self, conn_id: ConnId) -> Option<ConnEntry> {
        self.conns.read().await.get(&conn_id).cloned()
    }

    /// Returns the entry the first time a connection is removed, `None` after.
    pub async fn remove(&self, conn_id: ConnId) -> Option<ConnEntry> {
        let removed = self.conns.write().await.remove(&conn_id);
        if let Some(entry) = &removed {
            info!(
                event = "hub_conn_removed",
                conn_id,
                identity = %entry.identity
            );
        }
        removed
    }

    /// Fires when a send to the connection fails. A connection that is
    /// already gone reports as closed.
    pub async fn close_signal(&self, conn_id: ConnId) -> watch::Receiver<bool> {
        match self.conns.read().await.get(&conn_id) {
            Some(entry) => entry.close.subscribe(),
            None => watch::channel(true).1,
        }
    }

    pub async fn manager(&self) -> Option<ConnEntry> {
        self.conns
            .read()
            .await
            .values()
            .find(|entry| entry.identity == Identity::Manager && !entry.close.is_tripped())
            .cloned()
    }

    /// Peer hub connections: slaves on the master, the master on a slave.
    pub async fn hubs(&self) -> Vec<ConnEntry> {
        let mut hubs = self
            .conns
            .read()
            .await
            .values()
            .filter(|entry| entry.identity.is_hub() && !entry.close.is_tripped())
            .cloned()
            .collect::<Vec<_>>();
        hubs.sort_by_key(|entry| entry.conn_id);
        hubs
    }

    /// Queues an envelope without waiting. A closed or saturated queue trips
    /// the connection's close signal; its read loop then removes it.
    pub async fn send_to(&self, conn_id: ConnId, envelope: &Envelope) -> bool {
        let frame = match encode_envelope(envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "hub_encode_error", conn_id, error = %err);
                return false;
            }
        };
        self.send_frame(conn_id, frame).await
    }

    pub async fn send_frame(&self, conn_id: ConnId, frame: Vec<u8>) -> bool {
        let target = {
            let conns = self.conns.read().await;
            conns
                .get(&conn_id)
                .map(|entry| (entry.sender.clone(), entry.close.clone()))
        };
        let Some((sender, close)) = target else {
            return false;
        };
        if close.is_tripped() {
            return false;
        }

        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!(event = "hub_send_closed", conn_id);
                close.trip();
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "hub_send_backpressure", conn_id);
                close.trip();
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }
}
