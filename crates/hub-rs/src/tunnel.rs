use futures_util::future::join_all;
use hub_core::protocol::RequestTunnelPayload;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PUMP_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("a tunnel already listens on port {0}")]
    PortInUse(u16),
    #[error("did not find tunnel on port {0}")]
    NotFound(u16),
    #[error("tunnel on port {0} has no destination")]
    MissingDestination(u16),
    #[error("could not resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("could not listen on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}

/// Marker held by a live byte pump; the tunnel only keeps weak handles.
#[derive(Debug)]
pub struct TunnelStream {
    pub client: SocketAddr,
}

#[derive(Default)]
struct StreamSlots {
    slots: Mutex<Vec<Weak<TunnelStream>>>,
}

impl StreamSlots {
    fn lock(&self) -> MutexGuard<'_, Vec<Weak<TunnelStream>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, client: SocketAddr) -> Arc<TunnelStream> {
        let stream = Arc::new(TunnelStream { client });
        self.lock().push(Arc::downgrade(&stream));
        stream
    }

    fn live(&self) -> usize {
        self.lock()
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    fn prune(&self) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|slot| slot.strong_count() > 0);
        before - slots.len()
    }
}

/// One listening port forwarding every accepted connection to `dest`.
pub struct Tunnel {
    listen_port: u16,
    dest: SocketAddr,
    streams: Arc<StreamSlots>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Tunnel {
    fn start(listener: TcpListener, listen_port: u16, dest: SocketAddr) -> Self {
        let streams = Arc::new(StreamSlots::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            listen_port,
            dest,
            streams.clone(),
            shutdown_rx,
        ));
        Self {
            listen_port,
            dest,
            streams,
            shutdown,
            accept_task,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn active_streams(&self) -> usize {
        self.streams.live()
    }

    /// Stops accepting. Established streams run until their sockets close.
    fn close(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        self.accept_task
    }
}

async fn accept_loop(
    listener: TcpListener,
    listen_port: u16,
    dest: SocketAddr,
    streams: Arc<StreamSlots>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((inbound, client)) => {
                        let handle = streams.attach(client);
                        tokio::spawn(async move {
                            forward(inbound, dest, handle).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "tunnel_accept_error", listen_port, error = %err);
                    }
                }
            }
        }
    }
    debug!(event = "tunnel_listener_closed", listen_port);
}

async fn forward(inbound: TcpStream, dest: SocketAddr, handle: Arc<TunnelStream>) {
    let outbound = match TcpStream::connect(dest).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                event = "tunnel_connect_error",
                client = %handle.client,
                dest = %dest,
                error = %err
            );
            return;
        }
    };
    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    let end = pump(inbound, outbound).await;
    match end.result {
        Ok(()) => debug!(
            event = "tunnel_stream_closed",
            client = %handle.client,
            closed_by = end.side.as_str(),
            bytes_up = end.bytes_up,
            bytes_down = end.bytes_down
        ),
        Err(err) => debug!(
            event = "tunnel_stream_error",
            client = %handle.client,
            side = end.side.as_str(),
            bytes_up = end.bytes_up,
            bytes_down = end.bytes_down,
            error = %err
        ),
    }
}

/// The end of a stream pair whose read loop finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Destination,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Destination => "destination",
        }
    }
}

struct PumpEnd {
    side: Side,
    result: io::Result<()>,
    bytes_up: u64,
    bytes_down: u64,
}

/// Copies both directions until either side closes or fails, then drops
/// both sockets. A stream pair never outlives one of its ends.
async fn pump(inbound: TcpStream, outbound: TcpStream) -> PumpEnd {
    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();
    let mut bytes_up = 0u64;
    let mut bytes_down = 0u64;

    let (side, result) = tokio::select! {
        result = copy_half(&mut in_read, &mut out_write, &mut bytes_up) => (Side::Client, result),
        result = copy_half(&mut out_read, &mut in_write, &mut bytes_down) => {
            (Side::Destination, result)
        }
    };
    PumpEnd {
        side,
        result,
        bytes_up,
        bytes_down,
    }
}

/// Forwards `reader` into `writer` until EOF, then flushes a FIN to the
/// other end.
async fn copy_half(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    total: &mut u64,
) -> io::Result<()> {
    let mut buf = vec![0u8; PUMP_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

/// Tunnels keyed by listening port.
pub struct TunnelManager {
    bind_host: IpAddr,
    tunnels: Mutex<HashMap<u16, Tunnel>>,
}

impl TunnelManager {
    pub fn new(bind_host: IpAddr) -> Self {
        Self {
            bind_host,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, Tunnel>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a `RequestTunnel` message, pruning dead streams around it.
    pub async fn process_request(&self, request: &RequestTunnelPayload) -> Result<(), TunnelError> {
        self.cleanup();
        let result = if request.remove {
            self.remove_tunnel(request.listen_port).await
        } else {
            self.add_tunnel(request).await.map(|_| ())
        };
        self.cleanup();
        result
    }

    /// Opens the listener and returns the port actually bound.
    pub async fn add_tunnel(&self, request: &RequestTunnelPayload) -> Result<u16, TunnelError> {
        let requested = request.listen_port;
        if requested != 0 && self.contains(requested) {
            return Err(TunnelError::PortInUse(requested));
        }

        let dest = resolve_destination(request).await?;
        let listener = TcpListener::bind((self.bind_host, requested))
            .await
            .map_err(|source| TunnelError::Bind {
                port: requested,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind {
                port: requested,
                source,
            })?
            .port();

        let tunnel = Tunnel::start(listener, port, dest);
        let mut tunnels = self.lock();
        if tunnels.contains_key(&port) {
            let _ = tunnel.close();
            return Err(TunnelError::PortInUse(port));
        }
        tunnels.insert(port, tunnel);
        info!(event = "tunnel_added", listen_port = port, dest = %dest);
        Ok(port)
    }

    /// Closes the listener on `listen_port`. Fails without side effects when
    /// no such tunnel exists.
    pub async fn remove_tunnel(&self, listen_port: u16) -> Result<(), TunnelError> {
        let tunnel = self
            .lock()
            .remove(&listen_port)
            .ok_or(TunnelError::NotFound(listen_port))?;
        let streams = tunnel.active_streams();
        let _ = tunnel.close().await;
        info!(event = "tunnel_removed", listen_port, active_streams = streams);
        Ok(())
    }

    /// Drops handles of streams that have finished. Returns how many.
    pub fn cleanup(&self) -> usize {
        self.lock()
            .values()
            .map(|tunnel| tunnel.streams.prune())
            .sum()
    }

    pub fn contains(&self, listen_port: u16) -> bool {
        self.lock().contains_key(&listen_port)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn active_streams(&self, listen_port: u16) -> Option<usize> {
        self.lock().get(&listen_port).map(Tunnel::active_streams)
    }

    pub fn dest(&self, listen_port: u16) -> Option<SocketAddr> {
        self.lock().get(&listen_port).map(Tunnel::dest)
    }

    pub async fn shutdown(&self) {
        let tunnels = self.lock().drain().map(|(_, tunnel)| tunnel).collect::<Vec<_>>();
        if tunnels.is_empty() {
            return;
        }
        let count = tunnels.len();
        join_all(tunnels.into_iter().map(Tunnel::close)).await;
        info!(event = "tunnel_shutdown", closed = count);
    }
}

async fn resolve_destination(request: &RequestTunnelPayload) -> Result<SocketAddr, TunnelError> {
    if let Some(addr) = request.dest_addr {
        return Ok(SocketAddr::new(addr, request.dest_port));
    }
    let host = request
        .dest_host
        .as_deref()
        .filter(|host| !host.trim().is_empty())
        .ok_or(TunnelError::MissingDestination(request.listen_port))?;
    let mut addrs = tokio::net::lookup_host((host, request.dest_port))
        .await
        .map_err(|source| TunnelError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| TunnelError::Resolve {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.expect("bind echo");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn request_to(dest: SocketAddr, listen_port: u16) -> RequestTunnelPayload {
        RequestTunnelPayload {
            listen_port,
            dest_host: None,
            dest_addr: Some(dest.ip()),
            dest_port: dest.port(),
            remove: false,
        }
    }

    fn removal(listen_port: u16) -> RequestTunnelPayload {
        RequestTunnelPayload {
            listen_port,
            dest_host: None,
            dest_addr: None,
            dest_port: 0,
            remove: true,
        }
    }

    async fn wait_for_streams(manager: &TunnelManager, port: u16, expected: usize) {
        for _ in 0..150 {
            manager.cleanup();
            if manager.active_streams(port) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {expected} streams, found {:?}",
            manager.active_streams(port)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_bytes_both_ways_and_prunes_closed_streams() {
        let dest = echo_server().await;
        let manager = TunnelManager::new(LOCALHOST);
        let port = manager
            .add_tunnel(&request_to(dest, 0))
            .await
            .expect("add tunnel");
        assert_eq!(manager.dest(port), Some(dest));

        let mut client = TcpStream::connect((LOCALHOST, port)).await.expect("connect");
        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut buf))
            .await
            .expect("read timeout")
            .expect("read");
        assert_eq!(&buf, b"ping");
        wait_for_streams(&manager, port, 1).await;

        drop(client);
        wait_for_streams(&manager, port, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_hangup_tears_down_pair_while_destination_stays_open() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.expect("bind dest");
        let dest = listener.local_addr().expect("addr");
        let (received_tx, received_rx) = tokio::sync::oneshot::channel();
        let destination = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received).await;
            let _ = received_tx.send(received);
            // Keeps the destination socket open past the client hangup.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let manager = TunnelManager::new(LOCALHOST);
        let port = manager
            .add_tunnel(&request_to(dest, 0))
            .await
            .expect("add tunnel");
        let mut client = TcpStream::connect((LOCALHOST, port)).await.expect("connect");
        client.write_all(b"hi").await.expect("write");
        drop(client);

        let received = tokio::time::timeout(Duration::from_secs(3), received_rx)
            .await
            .expect("destination saw eof")
            .expect("destination result");
        assert_eq!(received, b"hi");
        wait_for_streams(&manager, port, 0).await;
        destination.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destination_hangup_disconnects_client() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.expect("bind dest");
        let dest = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"bye").await;
            }
        });

        let manager = TunnelManager::new(LOCALHOST);
        let port = manager
            .add_tunnel(&request_to(dest, 0))
            .await
            .expect("add tunnel");
        let mut client = TcpStream::connect((LOCALHOST, port)).await.expect("connect");
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut received))
            .await
            .expect("client saw eof")
            .expect("read");
        assert_eq!(received, b"bye");
        wait_for_streams(&manager, port, 0).await;
    }

    #[tokio::test]
    async fn duplicate_listen_port_is_rejected() {
        let dest = echo_server().await;
        let manager = TunnelManager::new(LOCALHOST);
        let port = manager
            .add_tunnel(&request_to(dest, 0))
            .await
            .expect("add tunnel");

        let err = manager
            .process_request(&request_to(dest, port))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, TunnelError::PortInUse(p) if p == port));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn removing_unknown_tunnel_fails_and_changes_nothing() {
        let dest = echo_server().await;
        let manager = TunnelManager::new(LOCALHOST);
        let port = manager
            .add_tunnel(&request_to(dest, 0))
            .await
            .expect("add tunnel");
        let unknown = port.wrapping_add(1);

        let err = manager
            .process_request(&removal(unknown))
            .await
            .expect_err("unknown");
        assert!(matches!(err, TunnelError::NotFound(p) if p == unknown));
        assert!(manager.contains(port));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn second_removal_reports_not_found() {
        let dest = echo_server().await;
        let manager = TunnelManager::new(LOCALHOST);
        let port = manager
            .add_tunnel(&request_to(dest, 0))
            .await
            .expect("add tunnel");

        manager
            .process_request(&removal(port))
            .await
            .expect("first removal");
        assert!(manager.is_empty());
        assert!(matches!(
            manager.process_request(&removal(port)).await,
            Err(TunnelError::NotFound(_))
        ));
        assert!(manager.is_empty());
        assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn request_without_destination_fails() {
        let manager = TunnelManager::new(LOCALHOST);
        let request = RequestTunnelPayload {
            listen_port: 0,
            dest_host: None,
            dest_addr: None,
            dest_port: 9,
            remove: false,
        };
        assert!(matches!(
            manager.process_request(&request).await,
            Err(TunnelError::MissingDestination(0))
        ));
        assert!(manager.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hostname_destination_is_resolved() {
        let dest = echo_server().await;
        let manager = TunnelManager::new(LOCALHOST);
        let request = RequestTunnelPayload {
            listen_port: 0,
            dest_host: Some("127.0.0.1".to_string()),
            dest_addr: None,
            dest_port: dest.port(),
            remove: false,
        };
        let port = manager.add_tunnel(&request).await.expect("add tunnel");
        assert_eq!(manager.dest(port), Some(dest));

        manager.shutdown().await;
        assert!(manager.is_empty());
    }
}
