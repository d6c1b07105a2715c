//! Admission-controlled TCP ingestion server.
//!
//! Accepting and admitting are decoupled: the accept loop keeps draining the
//! OS backlog into an unbounded queue while the dispatch loop admits one
//! queued connection per free permit. A handler that reports the terminate
//! sequence brings the whole server down; everything else ends only its own
//! connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::handler::{self, HandlerError};
use crate::journal::Journal;
use crate::permit::{Permit, PermitPool};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Connections serviced concurrently; the rest wait in the queue.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            max_connections: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to accept a connection: {0}")]
    Accept(#[source] io::Error),
    #[error("terminate sequence received from a client")]
    TerminateRequested,
    #[error("shutdown signal received")]
    Cancelled,
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.addr,
                source,
            })?;
        Ok(Self { listener, config })
    }

    /// The bound address. Differs from the configured one when the
    /// configured port is 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires or a fatal failure occurs, then wind
    /// down: stop admitting, cancel in-flight handlers, wait for every
    /// dispatched task, close the listener, and return the first cause.
    pub async fn run(
        self,
        journal: Arc<Journal>,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let Server { listener, config } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, max_connections = config.max_connections, "server listening");
        }

        let internal = shutdown.child_token();
        let pool = PermitPool::new(config.max_connections);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, queue_tx, internal.clone()));

        let mut tasks: JoinSet<Result<(), HandlerError>> = JoinSet::new();
        let mut fatal = None;

        loop {
            tokio::select! {
                _ = internal.cancelled() => break,

                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(err) = inspect(finished) {
                        fatal = Some(err);
                        break;
                    }
                }

                admitted = admit(&pool, &mut queue_rx) => {
                    let Some((permit, stream)) = admitted else { break };
                    let journal = Arc::clone(&journal);
                    let token = internal.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        handler::handle_connection(stream, &journal, &token).await
                    });
                }
            }
        }

        internal.cancel();
        while let Some(finished) = tasks.join_next().await {
            let _ = inspect(finished);
        }

        // The listener is handed back by the accept loop and closed only
        // after every in-flight handler has finished.
        let accept_result = match accept_task.await {
            Ok(Ok(listener)) => {
                drop(listener);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(join_err) => {
                error!(error = %join_err, "accept loop task failed");
                Ok(())
            }
        };

        match (fatal, accept_result) {
            (Some(err), _) => Err(err),
            (None, Err(err)) => Err(err),
            (None, Ok(())) => Err(ServerError::Cancelled),
        }
    }
}

/// Acquire one admission slot, then take one queued connection. Suspends on
/// whichever is missing; abandoning the wait returns the permit to the pool.
async fn admit(
    pool: &PermitPool,
    queue: &mut mpsc::UnboundedReceiver<TcpStream>,
) -> Option<(Permit, TcpStream)> {
    let permit = pool.acquire().await?;
    let stream = queue.recv().await?;
    Some((permit, stream))
}

/// Drain the OS accept backlog into the pending queue until shutdown. Accept
/// never waits on a free slot, so clients beyond the admission bound see an
/// established connection with stalled service. An accept failure is fatal
/// to the whole server.
///
/// On a clean exit the listener is handed back so the caller controls when
/// the socket closes.
async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::UnboundedSender<TcpStream>,
    shutdown: CancellationToken,
) -> Result<TcpListener, ServerError> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(listener),

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    if queue.send(stream).is_err() {
                        return Ok(listener);
                    }
                }
                Err(e) => {
                    shutdown.cancel();
                    return Err(ServerError::Accept(e));
                }
            },
        }
    }
}

fn inspect(finished: Result<Result<(), HandlerError>, JoinError>) -> Option<ServerError> {
    match finished {
        Ok(Ok(())) => {
            debug!("connection closed");
            None
        }
        Ok(Err(HandlerError::Cancelled)) => None,
        Ok(Err(HandlerError::Transport(e))) => {
            debug!(error = %e, "connection ended on transport error");
            None
        }
        Ok(Err(HandlerError::TerminateRequested)) => Some(ServerError::TerminateRequested),
        Err(join_err) => {
            error!(error = %join_err, "connection task failed");
            None
        }
    }
}
