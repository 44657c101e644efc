//! Relay engine - bidirectional byte copy between two established legs
//!
//! `spawn_relay` starts one task per direction and returns immediately.
//! Each direction stops on read EOF, read error or write error. The first
//! direction to stop cancels the session token, which stops the other
//! direction; once both tasks have dropped their halves, both sockets are
//! closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::app::metrics::{format_bytes, CONNECTIONS_ACTIVE, RELAY_BYTES_TOTAL};

use super::stream::Stream;

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// client → upstream
    Upload,
    /// upstream → client
    Download,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// State shared by the two copy tasks of one connection.
///
/// Dropped when the last direction finishes, which is where the
/// connection is accounted as closed.
struct RelaySession {
    label: String,
    closer: CancellationToken,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    started: Instant,
}

impl RelaySession {
    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Upload => &self.uploaded,
            Direction::Download => &self.downloaded,
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        CONNECTIONS_ACTIVE.dec();
        debug!(
            "[{}] Closed (↑{} ↓{} {:?})",
            self.label,
            format_bytes(self.uploaded.load(Ordering::Relaxed)),
            format_bytes(self.downloaded.load(Ordering::Relaxed)),
            self.started.elapsed()
        );
    }
}

/// Handle to a running relay
#[derive(Debug)]
pub struct RelayHandle {
    upload: JoinHandle<u64>,
    download: JoinHandle<u64>,
    closer: CancellationToken,
}

impl RelayHandle {
    /// Force both directions to stop
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Wait for both directions; returns (uploaded, downloaded) byte counts
    pub async fn join(self) -> (u64, u64) {
        let up = self.upload.await.unwrap_or(0);
        let down = self.download.await.unwrap_or(0);
        (up, down)
    }
}

/// Start relaying between `client` and `upstream`.
///
/// Returns as soon as both copy tasks are spawned. Must be called from
/// within a tokio runtime.
pub fn spawn_relay(client: Stream, upstream: Stream, label: impl Into<String>) -> RelayHandle {
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let closer = CancellationToken::new();
    CONNECTIONS_ACTIVE.inc();

    let session = Arc::new(RelaySession {
        label: label.into(),
        closer: closer.clone(),
        uploaded: AtomicU64::new(0),
        downloaded: AtomicU64::new(0),
        started: Instant::now(),
    });

    let upload = tokio::spawn(copy_direction(
        client_read,
        upstream_write,
        Direction::Upload,
        Arc::clone(&session),
    ));
    let download = tokio::spawn(copy_direction(
        upstream_read,
        client_write,
        Direction::Download,
        session,
    ));

    RelayHandle {
        upload,
        download,
        closer,
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    session: Arc<RelaySession>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::zeroed(RELAY_BUFFER_SIZE);
    let mut total = 0u64;
    let closer = session.closer.clone();

    loop {
        let n = tokio::select! {
            _ = closer.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };

        let written = tokio::select! {
            _ = closer.cancelled() => false,
            result = write_chunk(&mut writer, &buf[..n]) => result.is_ok(),
        };
        if !written {
            break;
        }

        total += n as u64;
        session.counter(direction).fetch_add(n as u64, Ordering::Relaxed);
        RELAY_BYTES_TOTAL
            .with_label_values(&[direction.as_str()])
            .inc_by(n as u64);
    }

    trace!("[{}] {} finished after {} bytes", session.label, direction.as_str(), total);

    // First finisher tears the whole session down
    closer.cancel();
    total
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}
