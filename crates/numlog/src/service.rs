//! Service composition: journal, server, flush loop, report loop.
//!
//! [`Service`] wires the pieces together under one cancellation token and
//! guarantees the final flush and the final activity report run before its
//! terminal result is reported, so accepted numbers are not lost on a clean
//! exit.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::journal::Journal;
use crate::server::{Server, ServerConfig, ServerError};

/// What to do when appending a flushed batch to the destination fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Log, drop the batch, keep serving.
    #[default]
    Discard,
    /// Treat the failure as fatal to the whole service.
    Escalate,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub flush_interval: Duration,
    pub report_interval: Duration,
    pub flush_policy: FlushPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            flush_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(10),
            flush_policy: FlushPolicy::Discard,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to persist accepted numbers: {0}")]
    Persistence(#[source] io::Error),
}

impl ServiceError {
    /// True when the service ended because the external shutdown signal
    /// fired, not because anything went wrong.
    pub fn is_graceful(&self) -> bool {
        matches!(self, ServiceError::Server(ServerError::Cancelled))
    }
}

pub struct Service {
    config: ServiceConfig,
    journal: Arc<Journal>,
    server: Server,
}

impl Service {
    /// Bind the listener and wire the journal to `destination`, the
    /// already-open append sink for first-seen numbers.
    pub async fn bind<W>(config: ServiceConfig, destination: W) -> Result<Self, ServiceError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let server = Server::bind(config.server.clone()).await?;
        Ok(Self {
            journal: Arc::new(Journal::new(destination)),
            config,
            server,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.journal)
    }

    /// Run until `shutdown` fires, a client sends the terminate sequence, or
    /// a fatal failure occurs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let Service {
            config,
            journal,
            server,
        } = self;
        let internal = shutdown.child_token();

        let flusher = tokio::spawn(flush_loop(
            Arc::clone(&journal),
            config.flush_interval,
            config.flush_policy,
            internal.clone(),
        ));
        let reporter = tokio::spawn(report_loop(
            Arc::clone(&journal),
            config.report_interval,
            internal.clone(),
        ));

        let server_result = server.run(Arc::clone(&journal), internal.clone()).await;
        internal.cancel();

        let persistence_failure = match flusher.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_err) => {
                error!(error = %join_err, "flush task failed");
                None
            }
        };
        if let Err(join_err) = reporter.await {
            error!(error = %join_err, "report task failed");
        }

        // Final flush before the service reports itself down.
        let final_flush_failure = match journal.flush().await {
            Ok(entries) => {
                if entries > 0 {
                    debug!(entries, "final flush complete");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "final flush failed, pending batch lost");
                Some(e)
            }
        };
        println!("{}", journal.report());

        match server_result {
            Ok(()) => Ok(()),
            Err(ServerError::Cancelled) => {
                if let Some(e) = persistence_failure {
                    Err(ServiceError::Persistence(e))
                } else if let (FlushPolicy::Escalate, Some(e)) =
                    (config.flush_policy, final_flush_failure)
                {
                    Err(ServiceError::Persistence(e))
                } else {
                    Err(ServiceError::Server(ServerError::Cancelled))
                }
            }
            Err(e) => Err(ServiceError::Server(e)),
        }
    }
}

/// Append the pending batch to the destination on a fixed cadence. Under
/// [`FlushPolicy::Escalate`] a write failure cancels the whole service and
/// surfaces as [`ServiceError::Persistence`].
async fn flush_loop(
    journal: Arc<Journal>,
    every: Duration,
    policy: FlushPolicy,
    shutdown: CancellationToken,
) -> Result<(), io::Error> {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),

            _ = ticker.tick() => match journal.flush().await {
                Ok(0) => {}
                Ok(entries) => debug!(entries, "flushed pending batch"),
                Err(e) => match policy {
                    FlushPolicy::Discard => warn!(error = %e, "flush failed, batch dropped"),
                    FlushPolicy::Escalate => {
                        shutdown.cancel();
                        return Err(e);
                    }
                },
            },
        }
    }
}

/// Emit the activity report on a fixed cadence. The final report is emitted
/// by [`Service::run`] after the last flush.
async fn report_loop(journal: Arc<Journal>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => println!("{}", journal.report()),
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when
/// the tokio runtime is not properly initialized. That is an unrecoverable
/// configuration error and should fail fast at startup.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
