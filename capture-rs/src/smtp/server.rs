use crate::alias::AliasResolver;
use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::smtp::session::SmtpSession;
use crate::storage::DataStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Everything a session or the scanner needs, built once at startup
pub struct ServerContext {
    pub config: Config,
    pub store: Arc<dyn DataStore>,
    pub aliases: Arc<dyn AliasResolver>,
    pub metrics: Arc<Metrics>,
}

impl ServerContext {
    pub fn new(
        config: Config,
        store: Arc<dyn DataStore>,
        aliases: Arc<dyn AliasResolver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            aliases,
            metrics,
        }
    }
}

pub struct SmtpServer {
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl SmtpServer {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.ctx.config.smtp.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown) is called.
    /// The listener is closed on return; open sessions keep running.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("SMTP server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        debug!("New SMTP connection from {}", addr);
                        let ctx = self.ctx.clone();

                        self.sessions.spawn(async move {
                            ctx.metrics.session_opened();
                            let session = SmtpSession::new(ctx.clone(), Some(addr));
                            if let Err(e) = session.handle(socket).await {
                                error!("Session error from {}: {}", addr, e);
                            }
                            ctx.metrics.session_closed();
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        drop(listener);
        info!(
            "SMTP listener closed, {} sessions still open",
            self.live_sessions()
        );
        Ok(())
    }

    /// Stop accepting new connections
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.close();
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Wait until every session has finished
    pub async fn drain(&self) {
        self.sessions.close();
        self.sessions.wait().await;
        debug!("All SMTP sessions drained");
    }
}
