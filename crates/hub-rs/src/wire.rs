use hub_core::codec::{decode_frame, encode_frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
use hub_core::protocol::Envelope;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub type ConnId = u64;

/// Largest bulk payload a peer may declare after a header line.
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 1 << 30;
/// Payload buffers start at most this large and grow as bytes arrive.
const PAYLOAD_PREALLOC_BYTES: usize = 64 * 1024;

/// Queue feeding one connection's writer task with fully encoded frames.
pub type FrameSender = mpsc::Sender<Vec<u8>>;

/// Teardown flag shared by everything that queues frames for one
/// connection. Tripping it makes the connection's read loop exit, so the
/// normal close path runs even though the peer socket is still open.
#[derive(Debug, Clone)]
pub struct CloseSignal(Arc<watch::Sender<bool>>);

impl CloseSignal {
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn trip(&self) {
        self.0.send_replace(true);
    }

    pub fn is_tripped(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded header line plus the raw bytes that followed it on the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Vec<u8>,
    pub envelope: Envelope,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(envelope: Envelope) -> Result<Self, FrameError> {
        Self::with_payload(envelope, Vec::new())
    }

    pub fn with_payload(envelope: Envelope, payload: Vec<u8>) -> Result<Self, FrameError> {
        let declared = envelope.payload_size();
        if declared != payload.len() as u64 {
            return Err(FrameError::Encode(format!(
                "payload is {} bytes but header declares {declared}",
                payload.len()
            )));
        }
        let header = encode_envelope(&envelope)?;
        Ok(Self {
            header,
            envelope,
            payload,
        })
    }

    /// Header line and payload exactly as they travel on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.header.len() + self.payload.len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)
}

/// Reads the next header line and, for bulk messages, its raw payload.
/// Returns `Ok(None)` on a clean end of stream. A declared payload larger
/// than `max_payload` is rejected before any of it is read.
pub async fn read_frame<R>(reader: &mut R, max_payload: u64) -> Result<Option<Frame>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|err| FrameError::Io(err.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let envelope: Envelope = decode_frame(&line, DEFAULT_MAX_FRAME_BYTES)?;
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }

        let expected = envelope.payload_size();
        if expected > max_payload {
            return Err(FrameError::OversizedPayload {
                declared: expected,
                max: max_payload,
            });
        }
        let mut payload = Vec::new();
        if expected > 0 {
            payload.reserve(usize::try_from(expected).map_or(PAYLOAD_PREALLOC_BYTES, |len| {
                len.min(PAYLOAD_PREALLOC_BYTES)
            }));
            (&mut *reader)
                .take(expected)
                .read_to_end(&mut payload)
                .await
                .map_err(|err| FrameError::Io(err.to_string()))?;
            if (payload.len() as u64) < expected {
                return Err(FrameError::TruncatedPayload {
                    read: payload.len(),
                    expected,
                });
            }
        }

        return Ok(Some(Frame {
            header: line,
            envelope,
            payload,
        }));
    }
}

/// Skips malformed lines; stops on end of stream or an unrecoverable error.
pub async fn read_next_valid_frame<R>(
    reader: &mut R,
    conn_id: ConnId,
    max_payload: u64,
) -> Option<Frame>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_frame(reader, max_payload).await {
            Ok(frame) => return frame,
            Err(err) if err.is_recoverable() => {
                warn!(event = "hub_decode_error", conn_id, error = %err);
            }
            Err(err) => {
                debug!(event = "hub_read_error", conn_id, error = %err);
                return None;
            }
        }
    }
}

pub async fn writer_loop<W>(
    conn_id: ConnId,
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "hub_write_error", conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "hub_write_timeout", conn_id);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Binds `base`, walking upward while ports are taken. A base of 0 binds
/// an ephemeral port.
pub async fn bind_first_free(host: IpAddr, base: u16, span: u16) -> io::Result<TcpListener> {
    if base == 0 {
        return TcpListener::bind((host, 0)).await;
    }

    let mut last_err = None;
    for offset in 0..span.max(1) {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                debug!(event = "hub_port_in_use", port);
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no free port in {base}..+{span}"),
        )
    }))
}
