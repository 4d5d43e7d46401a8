use crate::wire::{
    bind_first_free, encode_envelope, read_next_valid_frame, writer_loop, ConnId, Frame,
    FrameSender, DEFAULT_MAX_OBJECT_BYTES,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hub_core::codec::FrameError;
use hub_core::protocol::{
    id, CloseConnectionPayload, Envelope, HubId, Identity, IdentifyPayload, Message, MessageKind,
    ARCHIVE_VERSION,
};
use hub_core::state::StateTracker;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DataProxyError {
    #[error("could not bind a data port in {base}..+{span}: {source}")]
    Bind {
        base: u16,
        span: u16,
        source: io::Error,
    },
    #[error("no data address known for hub {0}")]
    UnknownHub(HubId),
    #[error("connecting to hub {hub} at {addr} failed: {source}")]
    Connect {
        hub: HubId,
        addr: String,
        source: io::Error,
    },
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },
    #[error("no route to {dest_id} rank {rank:?}")]
    NoRoute { dest_id: i32, rank: Option<i32> },
    #[error("{0} does not belong on the data port")]
    Unsupported(MessageKind),
    #[error("data connection {0} closed")]
    PeerGone(ConnId),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Where a frame entered this proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    Local(i32),
    Remote(HubId),
}

#[derive(Clone)]
struct DataPeer {
    conn_id: ConnId,
    sender: FrameSender,
}

/// Relays bulk objects between local ranks and the data proxies of peer hubs.
pub struct DataProxy {
    hub_id: AtomicI32,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    state: Arc<dyn StateTracker>,
    archive_version: u32,
    write_timeout: Duration,
    queue_capacity: usize,
    max_object_bytes: u64,
    conn_counter: AtomicU64,
    local: RwLock<HashMap<i32, DataPeer>>,
    remote: RwLock<HashMap<HubId, DataPeer>>,
}

impl DataProxy {
    pub async fn bind(
        host: IpAddr,
        base_port: u16,
        span: u16,
        state: Arc<dyn StateTracker>,
    ) -> Result<Self, DataProxyError> {
        let listener = bind_first_free(host, base_port, span)
            .await
            .map_err(|source| DataProxyError::Bind {
                base: base_port,
                span,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| DataProxyError::Bind {
                base: base_port,
                span,
                source,
            })?
            .port();
        info!(event = "data_proxy_listening", port);
        Ok(Self {
            hub_id: AtomicI32::new(id::INVALID),
            port,
            listener: Mutex::new(Some(listener)),
            state,
            archive_version: ARCHIVE_VERSION,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 1024,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            conn_counter: AtomicU64::new(0),
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_limits(
        mut self,
        write_timeout: Duration,
        queue_capacity: usize,
        max_object_bytes: u64,
    ) -> Self {
        self.write_timeout = write_timeout;
        self.queue_capacity = queue_capacity.max(1);
        self.max_object_bytes = max_object_bytes;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hub_id(&self) -> HubId {
        self.hub_id.load(Ordering::SeqCst)
    }

    pub fn set_hub_id(&self, hub_id: HubId) {
        self.hub_id.store(hub_id, Ordering::SeqCst);
    }

    pub async fn local_ranks(&self) -> Vec<i32> {
        let mut ranks = self.local.read().await.keys().copied().collect::<Vec<_>>();
        ranks.sort_unstable();
        ranks
    }

    pub async fn remote_hubs(&self) -> Vec<HubId> {
        let mut hubs = self.remote.read().await.keys().copied().collect::<Vec<_>>();
        hubs.sort_unstable();
        hubs
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Ok(());
        };

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => {
                            let proxy = self.clone();
                            tokio::spawn(async move {
                                proxy.handle_accepted(stream, addr).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "data_proxy_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        info!(event = "data_proxy_stop", port = self.port);
        Ok(())
    }

    fn next_conn_id(&self) -> ConnId {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn identify(&self, identity: Identity) -> Envelope {
        let mut payload = IdentifyPayload::new(identity);
        payload.id = self.hub_id();
        payload.archive_version = Some(self.archive_version);
        Envelope::new(self.hub_id(), Message::Identify(payload))
    }

    async fn handle_accepted(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.queue_capacity);
        let write_timeout = self.write_timeout;
        let writer_task = tokio::spawn(writer_loop(conn_id, writer_half, rx, write_timeout));

        send_envelope(&tx, &self.identify(Identity::Request)).await;
        let hello = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_next_valid_frame(&mut reader, conn_id, 0),
        )
        .await
        .ok()
        .flatten();

        let origin = match hello.map(|frame| frame.envelope.msg) {
            Some(Message::Identify(ident)) if ident.identity == Identity::LocalBulkData => {
                self.local.write().await.insert(
                    ident.id,
                    DataPeer {
                        conn_id,
                        sender: tx.clone(),
                    },
                );
                Some(DataOrigin::Local(ident.id))
            }
            Some(Message::Identify(ident)) if ident.identity == Identity::RemoteBulkData => {
                self.check_archive_version(&ident.id.to_string(), ident.archive_version);
                self.remote.write().await.insert(
                    ident.id,
                    DataPeer {
                        conn_id,
                        sender: tx.clone(),
                    },
                );
                Some(DataOrigin::Remote(ident.id))
            }
            Some(other) => {
                warn!(
                    event = "data_proxy_bad_identify",
                    conn_id,
                    peer = %addr,
                    kind = %other.kind()
                );
                None
            }
            None => {
                debug!(event = "data_proxy_no_identify", conn_id, peer = %addr);
                None
            }
        };

        match origin {
            Some(origin) => {
                let reply = match origin {
                    DataOrigin::Local(_) => Identity::LocalBulkData,
                    DataOrigin::Remote(_) => Identity::RemoteBulkData,
                };
                send_envelope(&tx, &self.identify(reply)).await;
                info!(event = "data_peer_connected", conn_id, origin = ?origin, peer = %addr);
                drop(tx);
                self.clone().recv_loop(conn_id, origin, reader).await;
            }
            None => {
                let close = Envelope::new(
                    self.hub_id(),
                    Message::CloseConnection(CloseConnectionPayload {
                        reason: "expected local or remote bulk data identity".to_string(),
                    }),
                );
                send_envelope(&tx, &close).await;
                drop(tx);
            }
        }

        let _ = tokio::time::timeout(self.write_timeout, writer_task).await;
    }

    fn recv_loop<R>(
        self: Arc<Self>,
        conn_id: ConnId,
        origin: DataOrigin,
        mut reader: R,
    ) -> BoxFuture<'static, ()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        async move {
            let max_object_bytes = self.max_object_bytes;
            while let Some(frame) =
                read_next_valid_frame(&mut reader, conn_id, max_object_bytes).await
            {
                if let Err(err) = self.route_frame(origin, &frame).await {
                    warn!(
                        event = "data_route_error",
                        conn_id,
                        origin = ?origin,
                        error = %err
                    );
                }
            }
            self.remove_peer(conn_id).await;
        }
        .boxed()
    }

    /// Forwards a bulk frame toward the rank or hub owning its destination,
    /// dialing the peer hub's data proxy on first use.
    pub async fn route_frame(
        self: &Arc<Self>,
        origin: DataOrigin,
        frame: &Frame,
    ) -> Result<(), DataProxyError> {
        let kind = frame.envelope.kind();
        if !matches!(kind, MessageKind::SendObject | MessageKind::RequestObject) {
            return Err(DataProxyError::Unsupported(kind));
        }
        let dest_id = frame.envelope.dest_id;
        let rank = frame.envelope.dest_rank;
        let no_route = || DataProxyError::NoRoute { dest_id, rank };

        let hub = self.id_to_hub(dest_id).ok_or_else(no_route)?;
        let peer = if hub == self.hub_id() {
            let rank = rank.ok_or_else(no_route)?;
            self.local
                .read()
                .await
                .get(&rank)
                .cloned()
                .ok_or_else(no_route)?
        } else {
            if matches!(origin, DataOrigin::Remote(_)) {
                return Err(no_route());
            }
            let existing = self.remote.read().await.get(&hub).cloned();
            match existing {
                Some(peer) => peer,
                None => self.connect_peer(hub).await?,
            }
        };

        debug!(
            event = "data_forward",
            origin = ?origin,
            dest_id,
            hub,
            bytes = frame.header.len() + frame.payload.len()
        );
        if peer.sender.send(frame.to_bytes()).await.is_err() {
            self.remove_peer(peer.conn_id).await;
            return Err(DataProxyError::PeerGone(peer.conn_id));
        }
        Ok(())
    }

    fn id_to_hub(&self, dest_id: i32) -> Option<HubId> {
        if id::is_hub(dest_id) {
            return Some(dest_id);
        }
        if dest_id == id::LOCAL_HUB || dest_id == id::LOCAL_MANAGER {
            return Some(self.hub_id());
        }
        if id::is_module(dest_id) {
            return self.state.hub_of(dest_id);
        }
        None
    }

    /// Dials the data proxy of `hub` using the addresses in the state tracker.
    pub async fn connect_remote_data(self: &Arc<Self>, hub: HubId) -> Result<(), DataProxyError> {
        self.connect_peer(hub).await.map(|_| ())
    }

    async fn connect_peer(self: &Arc<Self>, hub: HubId) -> Result<DataPeer, DataProxyError> {
        let data = self
            .state
            .hub_data(hub)
            .ok_or(DataProxyError::UnknownHub(hub))?;
        let addr = format!("{}:{}", data.host, data.data_port);
        let stream = TcpStream::connect((data.host.as_str(), data.data_port))
            .await
            .map_err(|source| DataProxyError::Connect {
                hub,
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        let (reader_half, mut writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let handshake = |reason: &str| DataProxyError::Handshake {
            peer: addr.clone(),
            reason: reason.to_string(),
        };
        match read_identify(&mut reader).await {
            Some(ident) if ident.identity == Identity::Request => {}
            Some(_) => return Err(handshake("expected identify request")),
            None => return Err(handshake("no identify request")),
        }

        let hello = encode_envelope(&self.identify(Identity::RemoteBulkData))?;
        writer_half
            .write_all(&hello)
            .await
            .map_err(|source| DataProxyError::Connect {
                hub,
                addr: addr.clone(),
                source,
            })?;

        match read_identify(&mut reader).await {
            Some(ident) if ident.identity == Identity::RemoteBulkData => {
                self.check_archive_version(&addr, ident.archive_version);
            }
            Some(_) => return Err(handshake("peer did not answer as remote bulk data")),
            None => return Err(handshake("no identify reply")),
        }

        let conn_id = self.next_conn_id();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.queue_capacity);
        tokio::spawn(writer_loop(conn_id, writer_half, rx, self.write_timeout));
        let peer = DataPeer { conn_id, sender: tx };

        let peer = {
            let mut remote = self.remote.write().await;
            remote.entry(hub).or_insert(peer).clone()
        };
        if peer.conn_id == conn_id {
            info!(event = "data_remote_connected", conn_id, hub, addr = %addr);
            tokio::spawn(
                self.clone()
                    .recv_loop(conn_id, DataOrigin::Remote(hub), reader),
            );
        }
        Ok(peer)
    }

    fn check_archive_version(&self, peer: &str, theirs: Option<u32>) {
        let Some(theirs) = theirs else {
            return;
        };
        if theirs > self.archive_version {
            warn!(
                event = "data_archive_mismatch",
                peer,
                ours = self.archive_version,
                theirs,
                failing = "objects received from this peer"
            );
        } else if theirs < self.archive_version {
            warn!(
                event = "data_archive_mismatch",
                peer,
                ours = self.archive_version,
                theirs,
                failing = "objects sent to this peer"
            );
        }
    }

    /// Forgets a data connection. Returns false if it was already gone.
    pub async fn remove_peer(&self, conn_id: ConnId) -> bool {
        let mut removed = false;
        self.local.write().await.retain(|_, peer| {
            let keep = peer.conn_id != conn_id;
            removed |= !keep;
            keep
        });
        self.remote.write().await.retain(|_, peer| {
            let keep = peer.conn_id != conn_id;
            removed |= !keep;
            keep
        });
        if removed {
            info!(event = "data_peer_removed", conn_id);
        }
        removed
    }
}

async fn send_envelope(tx: &FrameSender, envelope: &Envelope) {
    match encode_envelope(envelope) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(err) => warn!(event = "data_encode_error", error = %err),
    }
}

async fn read_identify(reader: &mut BufReader<OwnedReadHalf>) -> Option<IdentifyPayload> {
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_next_valid_frame(reader, 0, 0))
        .await
        .ok()
        .flatten()?;
    match frame.envelope.msg {
        Message::Identify(ident) => Some(ident),
        _ => None,
    }
}
