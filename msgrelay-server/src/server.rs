//! TCP server implementation.
//!
//! One request and one response per connection. Each accepted connection runs
//! on its own task; at most `max_connections` are served at once and further
//! clients stay in the listen backlog until a slot frees up.

use crate::connection::{read_request, write_response, ConnectionLimits};
use crate::error::ServerError;
use crate::handler::{Reply, RequestHandler};
use crate::metrics::Metrics;
use msgrelay_protocol::Response;
use msgrelay_storage::RelayStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum connections served at once.
    pub max_connections: usize,
    /// Limits applied while reading a request.
    pub limits: ConnectionLimits,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("limits", &self.limits)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 5,
            limits: ConnectionLimits::default(),
            metrics: None,
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for the relay.
pub struct Server {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<ServerStats>,
    slots: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server over `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn RelayStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handler = RequestHandler::new(store);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self {
            slots: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Runs on an already bound listener until shutdown.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} (max {} concurrent connections)",
            listener.local_addr()?,
            self.config.max_connections
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            // Take a slot before accepting so waiting clients stay queued in
            // the backlog.
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            };

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((mut stream, addr)) => {
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);

                                let result = Self::handle_connection(
                                    &mut stream,
                                    addr,
                                    &handler,
                                    &stats,
                                    config.limits,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                if let Err(e) = stream.shutdown().await {
                                    tracing::debug!("[{}] Shutdown error: {}", addr, e);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = config.metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves the single request of one connection.
    ///
    /// Decode failures are answered with a general error. Transport failures
    /// end the connection with no response; in particular a pull whose
    /// response could not be written leaves its messages queued.
    pub async fn handle_connection<S>(
        stream: &mut S,
        addr: SocketAddr,
        handler: &RequestHandler,
        stats: &ServerStats,
        limits: ConnectionLimits,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reply = match read_request(stream, limits).await {
            Ok(Some(request)) => {
                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                handler.dispatch(&request).await
            }
            Ok(None) => {
                tracing::debug!("[{}] Connection closed by client", addr);
                return Ok(());
            }
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                tracing::warn!("[{}] Rejecting request: {}", addr, e);
                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                handler.record_error(e.reason());
                Reply::general_error()
            }
        };

        let (response, ack) = reply.into_parts();
        let (frame, code, ack) = match response.encode() {
            Ok(frame) => (frame, response.code(), ack),
            Err(e) => {
                tracing::error!("[{}] Cannot encode response: {}", addr, e);
                handler.record_error("encode");
                let fallback = Response::GeneralError;
                (fallback.encode()?, fallback.code(), None)
            }
        };

        let written = write_response(stream, frame, limits.write_timeout).await?;
        if let Some(metrics) = handler.metrics() {
            metrics.bytes_sent_total.inc_by(written as f64);
        }
        tracing::debug!("[{}] Sent response {} ({} bytes)", addr, code.as_u16(), written);

        if let Some(ack) = ack {
            handler.acknowledge(ack).await;
        }
        Ok(())
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver that fires on shutdown.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }
}
