use crate::config::HubConfig;
use crate::data_proxy::{DataProxy, DataProxyError};
use crate::pending::{PendingError, PendingRequests};
use crate::process::{ChildTracker, ProcessKind, Spawner};
use crate::registry::SocketRegistry;
use crate::tunnel::TunnelManager;
use crate::ui_manager::{UiAction, UiManager};
use crate::wire::{bind_first_free, read_next_valid_frame, writer_loop, ConnId};
use hub_core::protocol::{
    id, AddHubPayload, BarrierPayload, CloseConnectionPayload, Envelope, ExecPayload, HubId,
    Identity, IdentifyPayload, Message, MessageKind, ModuleAvailablePayload, ModuleExitPayload,
    ModuleId, QuitPayload, SetIdPayload, SpawnPayload,
};
use hub_core::state::StateTracker;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum HubError {
    #[error("no free control port in {base}..+{span}: {source}")]
    Bind {
        base: u16,
        span: u16,
        source: io::Error,
    },
    #[error("cannot reach master hub at {addr}: {source}")]
    MasterConnect { addr: String, source: io::Error },
    #[error("failed to start {what}: {source}")]
    Spawn { what: String, source: io::Error },
    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition { from: HubPhase, to: HubPhase },
    #[error("barrier {0} is still active")]
    BarrierActive(Uuid),
    #[error("no manager connected")]
    NoManager,
    #[error("not connected to the master hub")]
    NoMaster,
    #[error("hub is already running")]
    AlreadyRunning,
    #[error(transparent)]
    DataProxy(#[from] DataProxyError),
    #[error(transparent)]
    Pending(#[from] PendingError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HubPhase {
    Starting,
    Listening,
    Ready,
    Draining,
    Stopped,
}

impl HubPhase {
    pub fn can_advance_to(self, next: HubPhase) -> bool {
        use HubPhase::*;
        matches!(
            (self, next),
            (Starting, Listening)
                | (Listening, Ready)
                | (Listening, Draining)
                | (Ready, Draining)
                | (Draining, Stopped)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubRole {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Identify,
    SetId,
    Exec,
    Spawn,
    Quit,
    Barrier,
    BarrierReached,
    Tunnel,
    LockUi,
    AddHub,
    Close,
}

/// Where a control message goes, decided from who sent it and what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePlan {
    Handle(Handler),
    ToManager,
    /// UI clients plus the peer hubs.
    Fanout,
    Reject(&'static str),
}

pub fn route_plan(identity: Identity, kind: MessageKind, role: HubRole) -> RoutePlan {
    use MessageKind as K;
    match (identity, kind) {
        (_, K::Identify) => RoutePlan::Handle(Handler::Identify),
        (Identity::Unknown | Identity::Request, _) => RoutePlan::Reject("peer has not identified"),
        (Identity::LocalBulkData | Identity::RemoteBulkData, _) => {
            RoutePlan::Reject("bulk data peers belong on the data port")
        }
        (_, K::SendObject | K::RequestObject) => {
            RoutePlan::Reject("bulk data belongs on the data port")
        }
        (_, K::CloseConnection) => RoutePlan::Handle(Handler::Close),
        (Identity::Hub, K::SetId) if role == HubRole::Slave => RoutePlan::Handle(Handler::SetId),
        (_, K::SetId) => RoutePlan::Reject("only the master assigns ids"),
        (Identity::Manager, K::Exec) => RoutePlan::Handle(Handler::Exec),
        (_, K::Exec) => RoutePlan::Reject("exec is only accepted from the manager"),
        (Identity::Ui, K::Quit) => RoutePlan::ToManager,
        (Identity::SlaveHub, K::Quit) => RoutePlan::ToManager,
        (_, K::Quit) => RoutePlan::Handle(Handler::Quit),
        (_, K::Spawn) => RoutePlan::Handle(Handler::Spawn),
        (Identity::Ui, K::Barrier | K::BarrierReached) => RoutePlan::ToManager,
        (_, K::Barrier) => RoutePlan::Handle(Handler::Barrier),
        (_, K::BarrierReached) => RoutePlan::Handle(Handler::BarrierReached),
        (Identity::Ui, K::RequestTunnel) => RoutePlan::ToManager,
        (_, K::RequestTunnel) => RoutePlan::Handle(Handler::Tunnel),
        (Identity::Manager, K::LockUi) => RoutePlan::Handle(Handler::LockUi),
        (_, K::LockUi) => RoutePlan::Reject("only the manager locks the ui"),
        (identity, K::AddHub) if identity.is_hub() => RoutePlan::Handle(Handler::AddHub),
        (_, K::AddHub) => RoutePlan::Reject("hub announcements come from hubs"),
        (Identity::Manager, _) => RoutePlan::Fanout,
        (Identity::Hub | Identity::SlaveHub | Identity::Ui, _) => RoutePlan::ToManager,
    }
}

/// Whether the connection stays open after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct ActiveBarrier {
    uuid: Uuid,
    reached: BTreeSet<HubId>,
}

#[derive(Default)]
struct HubState {
    slaves: BTreeMap<HubId, ConnId>,
    slave_count: u32,
    module_count: i32,
    barrier: Option<ActiveBarrier>,
    master_conn: Option<ConnId>,
    modules: BTreeMap<String, PathBuf>,
}

/// Control-plane router for one node of the session.
pub struct Hub {
    config: HubConfig,
    role: HubRole,
    hub_id: AtomicI32,
    control_port: u16,
    listener: Mutex<Option<TcpListener>>,
    registry: SocketRegistry,
    pending: PendingRequests,
    children: ChildTracker,
    tunnels: TunnelManager,
    data: Arc<DataProxy>,
    ui: UiManager,
    state: Arc<dyn StateTracker>,
    phase: watch::Sender<HubPhase>,
    stop: watch::Sender<bool>,
    inner: Mutex<HubState>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        listener: TcpListener,
        data: DataProxy,
        state: Arc<dyn StateTracker>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        let role = if config.is_master() {
            HubRole::Master
        } else {
            HubRole::Slave
        };
        let hub_id = match role {
            HubRole::Master => id::MASTER_HUB,
            HubRole::Slave => id::INVALID,
        };
        let control_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(config.control_port);
        data.set_hub_id(hub_id);
        let (phase, _) = watch::channel(HubPhase::Starting);
        let (stop, _) = watch::channel(false);
        Self {
            role,
            hub_id: AtomicI32::new(hub_id),
            control_port,
            listener: Mutex::new(Some(listener)),
            registry: SocketRegistry::new(),
            pending: PendingRequests::new(),
            children: ChildTracker::new(spawner),
            tunnels: TunnelManager::new(config.bind_host),
            data: Arc::new(data),
            ui: UiManager::new(hub_id, state.clone()),
            state,
            phase,
            stop,
            inner: Mutex::new(HubState::default()),
            config,
        }
    }

    /// Binds the control and data ports, walking upward from the configured
    /// bases.
    pub async fn bind(
        config: HubConfig,
        state: Arc<dyn StateTracker>,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Arc<Self>, HubError> {
        let listener = bind_first_free(config.bind_host, config.control_port, config.port_span)
            .await
            .map_err(|source| HubError::Bind {
                base: config.control_port,
                span: config.port_span,
                source,
            })?;
        let control_port = listener.local_addr()?.port();
        let data_base = match config.data_port {
            Some(port) => port,
            None if config.control_port == 0 => 0,
            None => control_port.saturating_add(1),
        };
        let data = DataProxy::bind(config.bind_host, data_base, config.port_span, state.clone())
            .await?
            .with_limits(
                config.write_timeout,
                config.queue_capacity,
                config.max_object_bytes,
            );
        info!(
            event = "hub_bound",
            control_port,
            data_port = data.port(),
            master = config.is_master()
        );
        Ok(Arc::new(Self::new(config, listener, data, state, spawner)))
    }

    pub fn role(&self) -> HubRole {
        self.role
    }

    pub fn phase(&self) -> HubPhase {
        *self.phase.borrow()
    }

    pub fn hub_id(&self) -> HubId {
        self.hub_id.load(Ordering::SeqCst)
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn data_port(&self) -> u16 {
        self.data.port()
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub async fn run(self: Arc<Self>) -> Result<(), HubError> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Err(HubError::AlreadyRunning);
        };

        let master_stream = match &self.config.master {
            Some(master) => {
                let stream = TcpStream::connect((master.host.as_str(), master.port))
                    .await
                    .map_err(|source| HubError::MasterConnect {
                        addr: master.to_string(),
                        source,
                    })?;
                Some(stream)
            }
            None => None,
        };
        self.launch_manager()?;
        self.advance(HubPhase::Listening)?;

        let data_task = tokio::spawn(self.data.clone().run(self.stop.subscribe()));
        let mut connections = JoinSet::new();
        if let Some(stream) = master_stream {
            let hub = self.clone();
            let stop = self.stop.subscribe();
            connections.spawn(async move { hub.serve_master(stream, stop).await });
        }

        self.scan_modules().await;
        if self.role == HubRole::Master {
            let announce = self.envelope(Message::AddHub(self.own_hub_data()));
            self.state.handle(&announce);
        }
        self.launch_ui();

        info!(
            event = "hub_start",
            hub_id = self.hub_id(),
            control_port = self.control_port,
            data_port = self.data.port(),
            name = %self.config.name
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => {
                            let hub = self.clone();
                            let stop = self.stop.subscribe();
                            connections.spawn(async move {
                                hub.handle_connection(stream, addr, stop).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "hub_accept_error", error = %err);
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.poll_children().await {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        self.stop.send_replace(true);
        let failed = self.pending.fail_all().await;
        self.tunnels.shutdown().await;
        let drained = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(event = "hub_teardown_timeout", remaining = connections.len());
            connections.abort_all();
        }
        let _ = data_task.await;
        info!(event = "hub_stop", hub_id = self.hub_id(), failed_requests = failed);
        Ok(())
    }

    /// Serves one accepted control connection until it closes or the hub
    /// stops.
    pub async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        stop: watch::Receiver<bool>,
    ) {
        let (conn_id, reader, writer_task) = self.attach(stream, Some(addr), None).await;
        let request = self.envelope(Message::Identify(IdentifyPayload::new(Identity::Request)));
        self.registry.send_to(conn_id, &request).await;
        self.serve(conn_id, reader, writer_task, stop).await;
    }

    async fn serve_master(self: Arc<Self>, stream: TcpStream, stop: watch::Receiver<bool>) {
        let addr = stream.peer_addr().ok();
        let (conn_id, reader, writer_task) = self
            .attach(stream, addr, Some((Identity::Hub, id::MASTER_HUB)))
            .await;
        self.inner.lock().await.master_conn = Some(conn_id);
        info!(event = "hub_master_connected", conn_id, peer = ?addr);
        self.serve(conn_id, reader, writer_task, stop).await;
    }

    async fn attach(
        &self,
        stream: TcpStream,
        addr: Option<SocketAddr>,
        known: Option<(Identity, i32)>,
    ) -> (ConnId, BufReader<OwnedReadHalf>, JoinHandle<()>) {
        let _ = stream.set_nodelay(true);
        let (reader_half, writer_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.config.queue_capacity);
        let conn_id = match known {
            Some((identity, peer_id)) => {
                self.registry
                    .register_identified(tx, addr, identity, Some(peer_id))
                    .await
            }
            None => self.registry.register(tx, addr).await,
        };
        let writer_task = tokio::spawn(writer_loop(
            conn_id,
            writer_half,
            rx,
            self.config.write_timeout,
        ));
        (conn_id, BufReader::new(reader_half), writer_task)
    }

    async fn serve(
        &self,
        conn_id: ConnId,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer_task: JoinHandle<()>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut closed = self.registry.close_signal(conn_id).await;
        let max_payload = self.config.max_object_bytes;
        loop {
            let frame = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                Ok(_) = closed.wait_for(|closed| *closed) => {
                    info!(event = "hub_conn_send_failed", conn_id);
                    break;
                }
                frame = read_next_valid_frame(&mut reader, conn_id, max_payload) => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            if self.dispatch(conn_id, frame.envelope).await == Flow::Close {
                break;
            }
        }
        self.connection_closed(conn_id).await;
        let flushed = tokio::time::timeout(self.config.write_timeout, &mut writer_task).await;
        if flushed.is_err() {
            writer_task.abort();
        }
    }

    async fn dispatch(&self, conn_id: ConnId, envelope: Envelope) -> Flow {
        let Some(identity) = self.registry.identity(conn_id).await else {
            return Flow::Close;
        };
        if let Message::Identify(payload) = &envelope.msg {
            return self.on_identify(conn_id, payload).await;
        }

        let kind = envelope.kind();
        if self.phase() >= HubPhase::Draining
            && !matches!(
                kind,
                MessageKind::Quit | MessageKind::ModuleExit | MessageKind::CloseConnection
            )
        {
            debug!(event = "hub_drop_while_draining", conn_id, kind = %kind);
            return Flow::Continue;
        }

        let envelope = if identity == Identity::Ui {
            match self.ui.handle_message(conn_id, envelope).await {
                UiAction::Forward(envelope) => envelope,
                UiAction::Queued | UiAction::Ignored => return Flow::Continue,
                UiAction::Disconnect => return Flow::Close,
            }
        } else {
            envelope
        };
        self.route(conn_id, identity, envelope).await
    }

    /// Records the identity a peer declared, or answers its identify request.
    pub async fn on_identify(&self, conn_id: ConnId, payload: &IdentifyPayload) -> Flow {
        let current = self.registry.identity(conn_id).await.unwrap_or(Identity::Unknown);
        if payload.identity == Identity::Request {
            let mut reply = IdentifyPayload::new(match self.role {
                HubRole::Master => Identity::Hub,
                HubRole::Slave => Identity::SlaveHub,
            });
            reply.id = self.hub_id();
            reply.name = self.config.name.clone();
            self.registry
                .send_to(conn_id, &self.envelope(Message::Identify(reply)))
                .await;
            return Flow::Continue;
        }
        if current != Identity::Unknown {
            warn!(
                event = "hub_protocol_error",
                conn_id,
                identity = %current,
                reason = "peer identified twice"
            );
            return Flow::Continue;
        }

        match payload.identity {
            Identity::Manager => self.on_manager(conn_id).await,
            Identity::Ui => {
                if let Err(err) = self.registry.identify(conn_id, Identity::Ui, None).await {
                    return self.reject(conn_id, &err.to_string()).await;
                }
                match self.registry.entry(conn_id).await {
                    Some(entry) => {
                        self.ui.add_client(conn_id, entry.sender, entry.close).await;
                        Flow::Continue
                    }
                    None => Flow::Close,
                }
            }
            Identity::SlaveHub if self.role == HubRole::Master => {
                self.add_slave(conn_id, payload).await
            }
            other => {
                self.reject(conn_id, &format!("identity {other} is not accepted here"))
                    .await
            }
        }
    }

    async fn on_manager(&self, conn_id: ConnId) -> Flow {
        if let Err(err) = self.registry.identify(conn_id, Identity::Manager, None).await {
            warn!(event = "hub_manager_rejected", conn_id, error = %err);
            return self.reject(conn_id, &err.to_string()).await;
        }
        let hub_id = self.hub_id();
        // A slave greets its manager once the master has assigned the id.
        if hub_id != id::INVALID {
            self.greet_manager(conn_id, hub_id).await;
        }
        info!(event = "hub_manager_connected", conn_id, hub_id);
        self.hub_ready().await;
        Flow::Continue
    }

    /// Sends the hub id followed by the session state replay.
    async fn greet_manager(&self, conn_id: ConnId, hub_id: HubId) {
        let set_id = self.envelope(Message::SetId(SetIdPayload { id: hub_id }));
        if !self.registry.send_to(conn_id, &set_id).await {
            return;
        }
        for envelope in self.state.state_log() {
            if !self.registry.send_to(conn_id, &envelope).await {
                break;
            }
        }
    }

    async fn add_slave(&self, conn_id: ConnId, payload: &IdentifyPayload) -> Flow {
        let slave_id = {
            let mut inner = self.inner.lock().await;
            inner.slave_count += 1;
            id::slave_hub(inner.slave_count)
        };
        if let Err(err) = self
            .registry
            .identify(conn_id, Identity::SlaveHub, Some(slave_id))
            .await
        {
            return self.reject(conn_id, &err.to_string()).await;
        }
        self.inner.lock().await.slaves.insert(slave_id, conn_id);

        self.registry
            .send_to(conn_id, &self.envelope(Message::SetId(SetIdPayload { id: slave_id })))
            .await;
        for envelope in self.state.state_log() {
            if !self.registry.send_to(conn_id, &envelope).await {
                break;
            }
        }
        info!(event = "hub_slave_added", conn_id, slave_id, name = %payload.name);
        Flow::Continue
    }

    async fn reject(&self, conn_id: ConnId, reason: &str) -> Flow {
        let close = self.envelope(Message::CloseConnection(CloseConnectionPayload {
            reason: reason.to_string(),
        }));
        self.registry.send_to(conn_id, &close).await;
        Flow::Close
    }

    /// Routes a message from an identified peer.
    pub async fn route(&self, conn_id: ConnId, identity: Identity, envelope: Envelope) -> Flow {
        let kind = envelope.kind();
        let plan = route_plan(identity, kind, self.role);
        self.trace(&envelope, identity, plan);

        if identity == Identity::Hub {
            if let Some(token) = reply_token(&envelope) {
                self.pending.fulfill(token, envelope.clone()).await;
            }
        }

        match plan {
            RoutePlan::Reject(reason) => {
                warn!(
                    event = "hub_protocol_error",
                    conn_id,
                    identity = %identity,
                    kind = %kind,
                    reason
                );
                Flow::Continue
            }
            RoutePlan::ToManager => {
                self.state.handle(&envelope);
                self.send_manager(&envelope).await;
                Flow::Continue
            }
            RoutePlan::Fanout => {
                self.state.handle(&envelope);
                self.ui.send_message(&envelope).await;
                self.send_peers(&envelope, Some(conn_id)).await;
                Flow::Continue
            }
            RoutePlan::Handle(handler) => self.handle(conn_id, identity, handler, envelope).await,
        }
    }

    async fn handle(
        &self,
        conn_id: ConnId,
        identity: Identity,
        handler: Handler,
        envelope: Envelope,
    ) -> Flow {
        match (handler, &envelope.msg) {
            (Handler::Close, Message::CloseConnection(close)) => {
                info!(event = "hub_close_requested", conn_id, reason = %close.reason);
                return Flow::Close;
            }
            (Handler::SetId, Message::SetId(set)) => self.on_set_id(set.id).await,
            (Handler::Exec, Message::Exec(exec)) => self.handle_exec(exec).await,
            (Handler::Spawn, _) => self.handle_spawn(conn_id, identity, &envelope).await,
            (Handler::Quit, _) => self.handle_quit(identity, &envelope).await,
            (Handler::Barrier, Message::Barrier(barrier)) => {
                self.handle_barrier(identity, barrier.uuid, &envelope).await
            }
            (Handler::BarrierReached, Message::BarrierReached(barrier)) => {
                self.handle_barrier_reached(conn_id, identity, barrier.uuid, &envelope)
                    .await
            }
            (Handler::Tunnel, Message::RequestTunnel(request)) => {
                match self.tunnels.process_request(request).await {
                    Ok(()) => info!(
                        event = "hub_tunnel_request",
                        listen_port = request.listen_port,
                        remove = request.remove
                    ),
                    Err(err) => warn!(
                        event = "hub_tunnel_error",
                        listen_port = request.listen_port,
                        error = %err
                    ),
                }
            }
            (Handler::LockUi, Message::LockUi(lock)) => {
                let backlog = self.ui.lock_ui(lock.locked).await;
                self.route_ui_backlog(backlog).await;
            }
            (Handler::AddHub, Message::AddHub(hub)) => {
                self.handle_add_hub(conn_id, identity, hub.clone(), &envelope)
                    .await
            }
            (handler, _) => {
                debug!(event = "hub_handler_mismatch", conn_id, handler = ?handler);
            }
        }
        Flow::Continue
    }

    async fn on_set_id(&self, hub_id: HubId) {
        if self.hub_id() != id::INVALID {
            warn!(event = "hub_protocol_error", hub_id, reason = "hub id already assigned");
            return;
        }
        self.hub_id.store(hub_id, Ordering::SeqCst);
        self.data.set_hub_id(hub_id);
        self.ui.set_hub_id(hub_id);
        info!(event = "hub_id_assigned", hub_id);

        let announce = self.envelope(Message::AddHub(self.own_hub_data()));
        self.state.handle(&announce);
        self.send_master(&announce).await;

        let modules = self.inner.lock().await.modules.clone();
        for (name, path) in modules {
            let available = self.envelope(Message::ModuleAvailable(ModuleAvailablePayload {
                hub_id,
                name,
                path: path.display().to_string(),
            }));
            self.state.handle(&available);
            self.send_master(&available).await;
        }

        if let Some(manager) = self.registry.manager().await {
            self.greet_manager(manager.conn_id, hub_id).await;
        }
        self.hub_ready().await;
    }

    /// Unlocks the UI, or starts the startup script, once both the manager
    /// and the hub id are known.
    async fn hub_ready(&self) {
        if self.hub_id() == id::INVALID || self.registry.manager().await.is_none() {
            return;
        }
        if !matches!(self.advance(HubPhase::Ready), Ok(true)) {
            return;
        }
        if self.role == HubRole::Master && self.launch_script() {
            return;
        }
        let backlog = self.ui.lock_ui(false).await;
        self.route_ui_backlog(backlog).await;
    }

    async fn route_ui_backlog(&self, backlog: Vec<Envelope>) {
        for envelope in backlog {
            match route_plan(Identity::Ui, envelope.kind(), self.role) {
                RoutePlan::ToManager => {
                    self.state.handle(&envelope);
                    self.send_manager(&envelope).await;
                }
                RoutePlan::Handle(Handler::Spawn) => {
                    self.handle_spawn(0, Identity::Ui, &envelope).await;
                }
                plan => {
                    debug!(event = "hub_ui_backlog_dropped", kind = %envelope.kind(), plan = ?plan);
                }
            }
        }
    }

    async fn handle_exec(&self, exec: &ExecPayload) {
        if !id::is_module(exec.module_id) {
            warn!(
                event = "hub_protocol_error",
                module_id = exec.module_id,
                reason = "exec without a module id"
            );
            return;
        }
        let Some(program) = self.resolve_executable(&exec.executable).await else {
            warn!(
                event = "hub_exec_unknown_module",
                module_id = exec.module_id,
                executable = %exec.executable
            );
            self.report_module_exit(exec.module_id).await;
            return;
        };
        if let Err(err) =
            self.children
                .spawn(ProcessKind::Module(exec.module_id), &program, &exec.args)
        {
            warn!(
                event = "hub_exec_failed",
                module_id = exec.module_id,
                program = %program.display(),
                error = %err
            );
            self.report_module_exit(exec.module_id).await;
        }
    }

    async fn resolve_executable(&self, executable: &str) -> Option<PathBuf> {
        if self.config.module_dir.is_none() {
            return Some(PathBuf::from(executable));
        }
        let name = Path::new(executable).file_name()?.to_str()?;
        self.inner.lock().await.modules.get(name).cloned()
    }

    async fn handle_spawn(&self, conn_id: ConnId, identity: Identity, envelope: &Envelope) {
        let Message::Spawn(spawn) = &envelope.msg else {
            return;
        };
        if spawn.spawn_id == id::INVALID {
            match self.role {
                HubRole::Master => self.assign_spawn(spawn.clone(), envelope.uuid).await,
                HubRole::Slave if identity == Identity::Hub => {
                    warn!(
                        event = "hub_protocol_error",
                        conn_id,
                        reason = "unassigned spawn from master"
                    );
                }
                HubRole::Slave => {
                    if !self.send_master(envelope).await {
                        warn!(event = "hub_spawn_unroutable", module = %spawn.module_name);
                    }
                }
            }
            return;
        }

        self.state.handle(envelope);
        self.send_manager(envelope).await;
        self.ui.send_message(envelope).await;
        if self.role == HubRole::Master {
            self.send_slaves(envelope, Some(conn_id)).await;
        }
    }

    async fn assign_spawn(&self, spawn: SpawnPayload, request: Option<Uuid>) {
        let known = spawn.hub_id == self.hub_id()
            || self.state.hub_data(spawn.hub_id).is_some()
            || self.inner.lock().await.slaves.contains_key(&spawn.hub_id);
        let spawn_id = if known {
            let mut inner = self.inner.lock().await;
            let spawn_id = id::MODULE_BASE + inner.module_count;
            inner.module_count += 1;
            spawn_id
        } else {
            id::INVALID
        };

        let target = spawn.hub_id;
        let mut notify = self
            .envelope(Message::Spawn(SpawnPayload { spawn_id, ..spawn }))
            .with_dest(target);
        if let Some(uuid) = request {
            notify = notify.with_referrer(uuid);
        }
        if spawn_id == id::INVALID {
            warn!(event = "hub_spawn_unknown_hub", hub_id = target);
        } else {
            self.state.handle(&notify);
            info!(event = "hub_spawn_assigned", spawn_id, hub_id = target);
        }
        self.send_manager(&notify).await;
        self.ui.send_message(&notify).await;
        self.send_slaves(&notify, None).await;
        if let Some(uuid) = request {
            self.pending.fulfill(uuid, notify).await;
        }
    }

    /// Requests a new module on `hub_id` and waits for its assigned id.
    pub async fn spawn_module(
        &self,
        hub_id: HubId,
        module_name: impl Into<String>,
    ) -> Result<Envelope, HubError> {
        let uuid = Uuid::new_v4();
        let spawn = SpawnPayload {
            hub_id,
            module_name: module_name.into(),
            spawn_id: id::INVALID,
        };
        match self.role {
            HubRole::Master => {
                let waiter = self.pending.register(uuid, None, MessageKind::Spawn).await?;
                self.assign_spawn(spawn, Some(uuid)).await;
                Ok(waiter.wait().await?)
            }
            HubRole::Slave => {
                let master = self.inner.lock().await.master_conn.ok_or(HubError::NoMaster)?;
                let waiter = self
                    .pending
                    .register(uuid, Some(master), MessageKind::Spawn)
                    .await?;
                let request = self.envelope(Message::Spawn(spawn)).with_uuid(uuid);
                if !self.registry.send_to(master, &request).await {
                    return Err(HubError::NoMaster);
                }
                Ok(waiter.wait_timeout(SPAWN_TIMEOUT).await?)
            }
        }
    }

    /// Starts a session-wide barrier and waits until every participant has
    /// reached it.
    pub async fn barrier(&self) -> Result<Envelope, HubError> {
        let uuid = Uuid::new_v4();
        match self.role {
            HubRole::Master => {
                let manager = self.registry.manager().await.ok_or(HubError::NoManager)?;
                self.claim_barrier(uuid).await?;
                let waiter = match self
                    .pending
                    .register(uuid, Some(manager.conn_id), MessageKind::Barrier)
                    .await
                {
                    Ok(waiter) => waiter,
                    Err(err) => {
                        self.inner.lock().await.barrier = None;
                        return Err(err.into());
                    }
                };
                self.announce_barrier(uuid).await;
                Ok(waiter.wait().await?)
            }
            HubRole::Slave => {
                let master = self.inner.lock().await.master_conn.ok_or(HubError::NoMaster)?;
                let waiter = self
                    .pending
                    .register(uuid, Some(master), MessageKind::Barrier)
                    .await?;
                let request = self
                    .envelope(Message::Barrier(BarrierPayload { uuid }))
                    .with_uuid(uuid);
                if !self.registry.send_to(master, &request).await {
                    return Err(HubError::NoMaster);
                }
                Ok(waiter.wait().await?)
            }
        }
    }

    async fn claim_barrier(&self, uuid: Uuid) -> Result<(), HubError> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = &inner.barrier {
            return Err(HubError::BarrierActive(active.uuid));
        }
        inner.barrier = Some(ActiveBarrier {
            uuid,
            reached: BTreeSet::new(),
        });
        Ok(())
    }

    async fn announce_barrier(&self, uuid: Uuid) {
        let barrier = self
            .envelope(Message::Barrier(BarrierPayload { uuid }))
            .with_uuid(uuid);
        self.send_slaves(&barrier, None).await;
        self.send_manager(&barrier).await;
        info!(event = "hub_barrier_started", uuid = %uuid);
    }

    async fn handle_barrier(&self, identity: Identity, uuid: Uuid, envelope: &Envelope) {
        match (self.role, identity) {
            (HubRole::Master, _) => match self.claim_barrier(uuid).await {
                Ok(()) => self.announce_barrier(uuid).await,
                Err(err) => {
                    warn!(event = "hub_protocol_error", uuid = %uuid, error = %err);
                }
            },
            (HubRole::Slave, Identity::Hub) => {
                self.send_manager(envelope).await;
            }
            (HubRole::Slave, _) => {
                self.send_master(envelope).await;
            }
        }
    }

    async fn handle_barrier_reached(
        &self,
        conn_id: ConnId,
        identity: Identity,
        uuid: Uuid,
        envelope: &Envelope,
    ) {
        if self.role == HubRole::Slave {
            match identity {
                Identity::Hub => {
                    self.ui.send_message(envelope).await;
                    self.send_manager(envelope).await;
                }
                _ => {
                    self.send_master(envelope).await;
                }
            }
            return;
        }

        let participant = match identity {
            Identity::Manager => self.hub_id(),
            _ => match self.registry.entry(conn_id).await.and_then(|entry| entry.peer_id) {
                Some(peer) => peer,
                None => return,
            },
        };
        {
            let mut inner = self.inner.lock().await;
            match inner.barrier.as_mut() {
                Some(active) if active.uuid == uuid => {
                    active.reached.insert(participant);
                }
                _ => {
                    debug!(event = "hub_barrier_unmatched", uuid = %uuid, participant);
                    return;
                }
            }
        }
        self.check_barrier().await;
    }

    async fn check_barrier(&self) {
        let completed = {
            let mut inner = self.inner.lock().await;
            let hub_id = self.hub_id();
            let done = match &inner.barrier {
                Some(active) => {
                    active.reached.contains(&hub_id)
                        && inner.slaves.keys().all(|slave| active.reached.contains(slave))
                }
                None => false,
            };
            if done {
                inner.barrier.take()
            } else {
                None
            }
        };
        let Some(active) = completed else {
            return;
        };

        let reached = self
            .envelope(Message::BarrierReached(BarrierPayload { uuid: active.uuid }))
            .with_uuid(active.uuid);
        self.ui.send_message(&reached).await;
        self.send_slaves(&reached, None).await;
        self.send_manager(&reached).await;
        self.pending.fulfill(active.uuid, reached).await;
        info!(
            event = "hub_barrier_reached",
            uuid = %active.uuid,
            participants = active.reached.len()
        );
    }

    async fn handle_quit(&self, identity: Identity, envelope: &Envelope) {
        info!(event = "hub_quit", from = %identity, sender_id = envelope.sender_id);
        match identity {
            Identity::Manager => {
                if self.role == HubRole::Master {
                    self.send_slaves(envelope, None).await;
                }
            }
            _ => {
                self.send_manager(envelope).await;
            }
        }
        self.ui.request_quit().await;
        self.enter_draining();
    }

    async fn handle_add_hub(
        &self,
        conn_id: ConnId,
        identity: Identity,
        mut hub: AddHubPayload,
        envelope: &Envelope,
    ) {
        if hub.host.is_empty() {
            hub.host = match (identity, &self.config.master) {
                (Identity::Hub, Some(master)) if hub.id == id::MASTER_HUB => master.host.clone(),
                _ => self
                    .registry
                    .entry(conn_id)
                    .await
                    .and_then(|entry| entry.peer_addr)
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_default(),
            };
        }
        let mut announce = envelope.clone();
        announce.msg = Message::AddHub(hub);
        self.state.handle(&announce);
        self.send_manager(&announce).await;
        self.ui.send_message(&announce).await;
        if self.role == HubRole::Master {
            self.send_slaves(&announce, Some(conn_id)).await;
        }
    }

    async fn report_module_exit(&self, module_id: ModuleId) {
        if !self.state.is_module_running(module_id) {
            return;
        }
        let exit = Envelope::new(
            module_id,
            Message::ModuleExit(ModuleExitPayload { module_id }),
        );
        self.state.handle(&exit);
        self.send_manager(&exit).await;
        self.send_peers(&exit, None).await;
    }

    /// Reaps exited children. Returns true once the hub may stop.
    async fn poll_children(&self) -> bool {
        for exit in self.children.reap() {
            match exit.kind {
                ProcessKind::Manager => {
                    if self.phase() < HubPhase::Draining {
                        error!(event = "hub_manager_died", pid = exit.pid, code = ?exit.code);
                        self.children.kill_all();
                        self.ui.request_quit().await;
                        if self.role == HubRole::Master {
                            let quit = self.envelope(Message::Quit(QuitPayload {
                                reason: Some("manager exited".to_string()),
                            }));
                            self.send_slaves(&quit, None).await;
                        }
                        self.enter_draining();
                    }
                }
                ProcessKind::Module(module_id) => self.report_module_exit(module_id).await,
                ProcessKind::Script => {
                    info!(event = "hub_script_finished", code = ?exit.code);
                    if self.phase() < HubPhase::Draining {
                        let backlog = self.ui.lock_ui(false).await;
                        self.route_ui_backlog(backlog).await;
                    }
                }
                ProcessKind::Ui => {}
            }
        }
        self.tunnels.cleanup();

        if self.phase() == HubPhase::Draining && self.children.is_empty() {
            let _ = self.advance(HubPhase::Stopped);
            return true;
        }
        false
    }

    async fn connection_closed(&self, conn_id: ConnId) {
        let entry = self.registry.remove(conn_id).await;
        self.ui.remove_client(conn_id).await;
        let failed = self.pending.fail_owner(conn_id).await;

        let (lost_slave, lost_master) = {
            let mut inner = self.inner.lock().await;
            let slave = inner
                .slaves
                .iter()
                .find(|(_, conn)| **conn == conn_id)
                .map(|(slave, _)| *slave);
            if let Some(slave) = slave {
                inner.slaves.remove(&slave);
            }
            let master = inner.master_conn == Some(conn_id);
            if master {
                inner.master_conn = None;
            }
            if self.role == HubRole::Master
                && entry.as_ref().map(|entry| entry.identity) == Some(Identity::Manager)
            {
                if let Some(active) = inner.barrier.take() {
                    warn!(event = "hub_barrier_abandoned", uuid = %active.uuid);
                }
            }
            (slave, master)
        };

        debug!(
            event = "hub_conn_closed",
            conn_id,
            identity = ?entry.as_ref().map(|entry| entry.identity),
            failed_requests = failed
        );
        if let Some(slave) = lost_slave {
            warn!(event = "hub_slave_lost", conn_id, slave_id = slave);
            self.check_barrier().await;
        }
        if lost_master && self.phase() < HubPhase::Draining {
            warn!(event = "hub_master_lost", conn_id);
            let quit = self.envelope(Message::Quit(QuitPayload {
                reason: Some("lost connection to master hub".to_string()),
            }));
            self.send_manager(&quit).await;
            self.ui.request_quit().await;
            self.enter_draining();
        }
    }

    /// Stops the session on this hub: peers are told to quit and children
    /// are killed. `run` returns once they have been reaped.
    pub async fn shutdown(&self) {
        info!(event = "hub_shutdown_requested", hub_id = self.hub_id());
        let quit = self.envelope(Message::Quit(QuitPayload {
            reason: Some("hub shutting down".to_string()),
        }));
        self.send_manager(&quit).await;
        if self.role == HubRole::Master {
            self.send_slaves(&quit, None).await;
        }
        self.ui.request_quit().await;
        self.enter_draining();
        self.children.kill_all();
    }

    fn enter_draining(&self) {
        if let Err(err) = self.advance(HubPhase::Draining) {
            warn!(event = "hub_phase_error", error = %err);
        }
    }

    fn advance(&self, next: HubPhase) -> Result<bool, HubError> {
        let mut result = Ok(false);
        self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            if !phase.can_advance_to(next) {
                result = Err(HubError::IllegalTransition {
                    from: *phase,
                    to: next,
                });
                return false;
            }
            info!(event = "hub_phase", from = ?*phase, to = ?next);
            *phase = next;
            result = Ok(true);
            true
        });
        result
    }

    fn launch_manager(&self) -> Result<(), HubError> {
        let Some(program) = &self.config.manager else {
            return Ok(());
        };
        let args = vec!["localhost".to_string(), self.control_port.to_string()];
        self.children
            .spawn(ProcessKind::Manager, program, &args)
            .map_err(|source| HubError::Spawn {
                what: format!("manager {}", program.display()),
                source,
            })?;
        Ok(())
    }

    fn launch_ui(&self) {
        let Some(executable) = self.config.ui.executable() else {
            return;
        };
        let program = self.config.bin_dir.join(executable);
        let args = vec![
            "-from-hub".to_string(),
            "localhost".to_string(),
            self.control_port.to_string(),
        ];
        if let Err(err) = self.children.spawn(ProcessKind::Ui, &program, &args) {
            warn!(event = "hub_ui_spawn_failed", program = %program.display(), error = %err);
        }
    }

    fn launch_script(&self) -> bool {
        let Some(script) = &self.config.script else {
            return false;
        };
        let interpreter = PathBuf::from(&self.config.script_interpreter);
        let args = vec![
            script.display().to_string(),
            "localhost".to_string(),
            self.control_port.to_string(),
        ];
        match self.children.spawn(ProcessKind::Script, &interpreter, &args) {
            Ok(pid) => {
                info!(event = "hub_script_started", pid, script = %script.display());
                true
            }
            Err(err) => {
                warn!(event = "hub_script_failed", script = %script.display(), error = %err);
                false
            }
        }
    }

    async fn scan_modules(&self) {
        let Some(dir) = &self.config.module_dir else {
            return;
        };
        let modules = match scan_module_dir(dir) {
            Ok(modules) => modules,
            Err(err) => {
                warn!(event = "hub_module_scan_failed", dir = %dir.display(), error = %err);
                return;
            }
        };
        info!(event = "hub_modules_scanned", dir = %dir.display(), count = modules.len());
        self.inner.lock().await.modules = modules.clone();

        if self.role == HubRole::Master {
            for (name, path) in modules {
                let available = self.envelope(Message::ModuleAvailable(ModuleAvailablePayload {
                    hub_id: self.hub_id(),
                    name,
                    path: path.display().to_string(),
                }));
                self.state.handle(&available);
            }
        }
    }

    fn own_hub_data(&self) -> AddHubPayload {
        AddHubPayload {
            id: self.hub_id(),
            name: self.config.name.clone(),
            host: self.config.advertise_host.clone().unwrap_or_default(),
            control_port: self.control_port,
            data_port: self.data.port(),
        }
    }

    fn envelope(&self, msg: Message) -> Envelope {
        Envelope::new(self.hub_id(), msg)
    }

    fn trace(&self, envelope: &Envelope, identity: Identity, plan: RoutePlan) {
        let Some(filter) = self.config.trace else {
            return;
        };
        if !filter.matches(envelope.kind()) {
            return;
        }
        let (manager, ui, peers) = match plan {
            RoutePlan::ToManager => (true, false, false),
            RoutePlan::Fanout => (false, true, true),
            RoutePlan::Handle(_) | RoutePlan::Reject(_) => (false, false, false),
        };
        info!(
            event = "hub_trace",
            kind = %envelope.kind(),
            from = %identity,
            sender_id = envelope.sender_id,
            dest_id = envelope.dest_id,
            handled = matches!(plan, RoutePlan::Handle(_)),
            manager,
            ui,
            peers
        );
    }

    async fn send_manager(&self, envelope: &Envelope) -> bool {
        match self.registry.manager().await {
            Some(manager) => self.registry.send_to(manager.conn_id, envelope).await,
            None => {
                debug!(event = "hub_no_manager", kind = %envelope.kind());
                false
            }
        }
    }

    async fn send_master(&self, envelope: &Envelope) -> bool {
        let master = self.inner.lock().await.master_conn;
        match master {
            Some(conn_id) => self.registry.send_to(conn_id, envelope).await,
            None => false,
        }
    }

    async fn send_slaves(&self, envelope: &Envelope, except: Option<ConnId>) {
        let conns = self
            .inner
            .lock()
            .await
            .slaves
            .values()
            .copied()
            .filter(|conn_id| Some(*conn_id) != except)
            .collect::<Vec<_>>();
        for conn_id in conns {
            self.registry.send_to(conn_id, envelope).await;
        }
    }

    async fn send_peers(&self, envelope: &Envelope, except: Option<ConnId>) {
        match self.role {
            HubRole::Master => self.send_slaves(envelope, except).await,
            HubRole::Slave => {
                let master = self.inner.lock().await.master_conn;
                if let Some(conn_id) = master.filter(|conn_id| Some(*conn_id) != except) {
                    self.registry.send_to(conn_id, envelope).await;
                }
            }
        }
    }
}

/// Token under which a reply from the master completes a local waiter.
fn reply_token(envelope: &Envelope) -> Option<Uuid> {
    match &envelope.msg {
        Message::Spawn(_) => envelope.referrer,
        Message::BarrierReached(barrier) => Some(barrier.uuid),
        _ => None,
    }
}

/// Executables directly inside `dir`, keyed by file name.
pub fn scan_module_dir(dir: &Path) -> io::Result<BTreeMap<String, PathBuf>> {
    let mut modules = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() || !is_executable(&metadata) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            modules.insert(name.to_string(), entry.path());
        }
    }
    Ok(modules)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
