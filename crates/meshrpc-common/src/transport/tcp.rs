use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::InvokeRequest;
use crate::transport::channel::{InboundHandler, MessageSender};
use crate::transport::codec::MessageCodec;

/// Maximum message size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Default timeout for establishing a connection (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for [`TcpChannel`].
#[derive(Debug, Clone)]
pub struct TcpChannelConfig {
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Writes one frame.
///
/// Wire format: `[4-byte length as u32 big-endian] + [data]`
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// Fails if the stream breaks mid-frame or the announced length exceeds
/// `max_frame_size`.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length to prevent allocation of excessively large buffers
    if len > max_frame_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {} bytes)", len, max_frame_size),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Length-prefixed TCP channel to a single peer.
///
/// The write half is shared by every concurrent call behind an async mutex so
/// frames never interleave. The read half is handed to a background task by
/// [`TcpChannel::start_reading`]; it decodes responses and forwards them to an
/// [`InboundHandler`] held weakly, so the channel never keeps its owner alive.
pub struct TcpChannel {
    peer: String,
    codec: Arc<dyn MessageCodec>,
    max_frame_size: usize,
    writer: Mutex<Option<OwnedWriteHalf>>,
    read_half: StdMutex<Option<OwnedReadHalf>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TcpChannel {
    /// Connects to `peer` (`host:port`).
    pub async fn connect(
        peer: &str,
        codec: Arc<dyn MessageCodec>,
        config: &TcpChannelConfig,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| RpcError::Timeout(config.connect_timeout.as_millis() as u64))?
            .map_err(|e| RpcError::communication(peer, format!("Failed to connect: {}", e)))?;

        // Small request frames should not wait on Nagle.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer, error = %e, "failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        debug!(peer, "tcp channel connected");

        Ok(Self {
            peer: peer.to_string(),
            codec,
            max_frame_size: config.max_frame_size,
            writer: Mutex::new(Some(write_half)),
            read_half: StdMutex::new(Some(read_half)),
            reader_task: StdMutex::new(None),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Spawns the inbound listener. Only the first call has an effect.
    pub fn start_reading(&self, handler: Weak<dyn InboundHandler>) {
        let Some(mut read_half) = lock(&self.read_half).take() else {
            return;
        };
        let codec = Arc::clone(&self.codec);
        let peer = self.peer.clone();
        let max_frame_size = self.max_frame_size;

        let task = tokio::spawn(async move {
            let reason = loop {
                let frame = match read_frame(&mut read_half, max_frame_size).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break RpcError::ConnectionClosed(peer.clone()),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "tcp channel read failed");
                        break map_io_error(&peer, e);
                    }
                };

                let response = match codec.decode_response(&frame) {
                    Ok(response) => response,
                    Err(e) => {
                        // The stream itself is intact; only this frame is lost.
                        warn!(peer = %peer, error = %e, "dropping undecodable frame");
                        continue;
                    }
                };

                match handler.upgrade() {
                    Some(handler) => handler.on_response(response),
                    None => return,
                }
            };

            if let Some(handler) = handler.upgrade() {
                handler.on_closed(reason);
            }
        });

        *lock(&self.reader_task) = Some(task);
    }
}

#[async_trait]
impl MessageSender for TcpChannel {
    async fn send(&self, request: &InvokeRequest) -> Result<()> {
        let encoded = self.codec.encode_request(request)?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| RpcError::ConnectionClosed(self.peer.clone()))?;

        write_frame(stream, &encoded)
            .await
            .map_err(|e| map_io_error(&self.peer, e))
    }

    async fn close(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        debug!(peer = %self.peer, "tcp channel closed");
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Map IO errors to appropriate RpcError variants
///
/// - Connection resets/aborts -> `ConnectionClosed`
/// - Everything else -> `Communication`
fn map_io_error(peer: &str, err: std::io::Error) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => RpcError::ConnectionClosed(peer.to_string()),
        _ => RpcError::communication(peer, err.to_string()),
    }
}
