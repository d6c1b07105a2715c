//! Per-connection line protocol handling.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::codec::LineCodec;
use crate::journal::{Journal, RecordError};

/// Why a connection stopped being serviced.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("shutdown requested while serving the connection")]
    Cancelled,
    #[error("terminate sequence received")]
    TerminateRequested,
    #[error("connection transport failed: {0}")]
    Transport(#[from] std::io::Error),
}

/// Read newline-terminated lines from `stream` and drive the journal until
/// the peer closes, a line ends the connection, or `shutdown` fires.
///
/// Duplicates keep the connection open. A malformed line ends this
/// connection only (`Ok`). The terminate sequence propagates as an error so
/// the server can bring the whole service down. The transport is dropped on
/// every exit path.
pub async fn handle_connection<S>(
    stream: S,
    journal: &Journal,
    shutdown: &CancellationToken,
) -> Result<(), HandlerError>
where
    S: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, LineCodec::new());

    loop {
        tokio::select! {
            // Cancellation wins over a ready frame and interrupts a blocked read.
            biased;

            _ = shutdown.cancelled() => return Err(HandlerError::Cancelled),

            frame = lines.next() => match frame {
                None => return Ok(()),
                Some(Err(e)) => return Err(HandlerError::Transport(e)),
                Some(Ok(line)) => match journal.record(&line) {
                    Ok(_) => {}
                    Err(RecordError::MalformedNumber) => return Ok(()),
                    Err(RecordError::TerminateRequested) => {
                        return Err(HandlerError::TerminateRequested);
                    }
                },
            },
        }
    }
}
