//! Full-duplex byte relay between two open connections
//!
//! Each direction is pumped independently. As soon as one direction reaches
//! end-of-stream or fails, the other one is cancelled, both write halves are
//! shut down, and the relay returns once both pumps have finished.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Size of the per-direction copy buffer
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the first stream and written to the second
    pub a_to_b: u64,
    /// Bytes read from the second stream and written to the first
    pub b_to_a: u64,
}

/// How one direction of a relay ended
#[derive(Debug)]
enum PumpEnd {
    /// The reader reached end-of-stream
    Eof,
    /// The other direction finished first
    Cancelled,
    /// Reading or writing failed
    Failed(io::Error),
}

/// Relay bytes between `a` and `b` until either side closes.
///
/// Both streams are consumed and dropped before this returns, which closes
/// the underlying connections.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let done = CancellationToken::new();

    let ((a_to_b, forward_end), (b_to_a, backward_end)) = tokio::join!(
        pump(&mut a_read, &mut b_write, &done),
        pump(&mut b_read, &mut a_write, &done),
    );

    log_end("a->b", &forward_end);
    log_end("b->a", &backward_end);

    RelayStats { a_to_b, b_to_a }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, done: &CancellationToken) -> (u64, PumpEnd)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;

    let end = tokio::select! {
        result = copy_counted(reader, writer, &mut copied) => match result {
            Ok(()) => PumpEnd::Eof,
            Err(e) => PumpEnd::Failed(e),
        },
        _ = done.cancelled() => PumpEnd::Cancelled,
    };

    // Wake the other direction before touching the writer so a stuck
    // shutdown here can never hold it up.
    done.cancel();
    if let Err(e) = writer.shutdown().await {
        tracing::trace!("Shutdown after relay failed: {}", e);
    }

    (copied, end)
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

fn log_end(direction: &str, end: &PumpEnd) {
    match end {
        PumpEnd::Eof => tracing::trace!("Relay {} reached end of stream", direction),
        PumpEnd::Cancelled => tracing::trace!("Relay {} stopped by peer direction", direction),
        PumpEnd::Failed(e) if is_disconnect(e) => {
            tracing::debug!("Relay {} closed: {}", direction, e)
        }
        PumpEnd::Failed(e) => tracing::warn!("Relay {} failed: {}", direction, e),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
