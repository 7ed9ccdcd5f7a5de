//! Downstream Server Implementation

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::auth::{AccessGrant, AuthManager};
use crate::config::Config;
use crate::error::AccessError;
use crate::metrics::Statistics;
use crate::protocol::{sourcetable_body, NtripHandler, NtripRequest, NtripResponse, NtripVersion};
use crate::relay::{RelayHub, Subscriber, SubscriberHandle, SubscriberId};
use crate::Result;

/// Why a streaming connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    ClientClosed,
    Evicted,
    WriteTimeout,
    SocketError,
    Shutdown,
}

/// Everything a connection task needs
#[derive(Clone)]
struct ConnectionContext {
    config: Arc<Config>,
    hub: Arc<RelayHub>,
    auth_manager: Arc<AuthManager>,
    stats: Arc<Statistics>,
}

/// Accepts local NTRIP clients and attaches them to the relay hub
pub struct DownstreamServer {
    listener: Option<TcpListener>,
    context: ConnectionContext,
    connection_slots: Arc<Semaphore>,
    active_connections: Arc<AtomicUsize>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DownstreamServer {
    /// Create a new DownstreamServer
    pub fn new(config: Arc<Config>, hub: Arc<RelayHub>, stats: Arc<Statistics>) -> Self {
        let auth_manager = Arc::new(AuthManager::new(&config));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            listener: None,
            connection_slots: Arc::new(Semaphore::new(config.server.max_clients)),
            context: ConnectionContext {
                config,
                hub,
                auth_manager,
                stats,
            },
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Get the authentication manager
    pub fn auth_manager(&self) -> &Arc<AuthManager> {
        &self.context.auth_manager
    }

    /// Bind the listen socket. Failure here is fatal for the process.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.context.config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind downstream listener to {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        info!("Successfully bound to {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Bind and serve until `shutdown` fires
    pub async fn start(&mut self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.bind().await?;
        self.run(shutdown).await
    }

    /// Main connection acceptance loop
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!(
            mountpoint = %self.context.auth_manager.mountpoint(),
            auth = self.context.auth_manager.auth_required(),
            "Starting connection acceptance loop"
        );

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.dispatch(stream, addr),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    self.initiate_shutdown();
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let permit = match Arc::clone(&self.connection_slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Client limit of {} reached, rejecting connection from {}",
                    self.context.config.server.max_clients, addr
                );
                self.context.auth_manager.record_rejection(&AccessError::Unavailable);
                tokio::spawn(reject_unavailable(stream, self.context.config.server.write_timeout));
                return;
            }
        };

        let connection_id = self.context.hub.next_subscriber_id();

        let context = self.context.clone();
        let active_connections = Arc::clone(&self.active_connections);
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            // Keep the connection slot alive for the duration of the connection
            let _permit: OwnedSemaphorePermit = permit;

            active_connections.fetch_add(1, Ordering::Relaxed);
            let start_time = Instant::now();

            if let Err(e) = handle_connection(context, stream, addr, connection_id, shutdown_rx).await {
                error!("Error handling connection {}: {:#}", connection_id, e);
            }

            debug!(
                "Connection {} from {} closed after {:?}",
                connection_id,
                addr,
                start_time.elapsed()
            );
            active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the bind address if listener is initialized
    pub fn get_bind_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Initiate graceful shutdown
    pub fn initiate_shutdown(&self) {
        if self.shutdown_flag.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Initiating graceful shutdown of downstream server");

        // Connection handlers may all be gone already; nothing to signal then
        if self.shutdown_tx.send(()).is_err() {
            debug!("No connection handlers to notify");
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Wait for all connections to close gracefully
    pub async fn wait_for_connections_to_close(&self, shutdown_timeout: Duration) -> usize {
        let start_time = Instant::now();

        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            self.get_active_connections(),
            shutdown_timeout
        );

        while self.get_active_connections() > 0 && start_time.elapsed() < shutdown_timeout {
            debug!("Waiting for {} active connections to close", self.get_active_connections());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.get_active_connections();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                elapsed, remaining
            );
        }
        remaining
    }

    /// Gracefully shutdown the downstream server
    pub async fn shutdown(&self) -> usize {
        self.initiate_shutdown();
        self.wait_for_connections_to_close(self.context.config.server.shutdown_timeout)
            .await
    }
}

async fn reject_unavailable(stream: TcpStream, write_timeout: Duration) {
    let mut handler = NtripHandler::new(stream);
    let _ = timeout(write_timeout, handler.send_response(&NtripResponse::Unavailable)).await;
    let _ = handler.into_stream().shutdown().await;
}

/// Handle a single connection: handshake, then stream until it ends
#[instrument(skip(context, stream, shutdown_rx), fields(connection_id = connection_id, addr = %addr))]
async fn handle_connection(
    context: ConnectionContext,
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: SubscriberId,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let server = &context.config.server;
    let auth_manager = &context.auth_manager;
    let mountpoint = auth_manager.mountpoint().to_string();
    let mut handler = NtripHandler::new(stream);

    let read = tokio::select! {
        read = timeout(server.handshake_timeout, handler.read_request()) => read,
        _ = shutdown_rx.recv() => {
            debug!("Shutdown during handshake with {}", addr);
            return Ok(());
        }
    };
    let request = match read {
        Err(_) => {
            warn!("Handshake from {} timed out after {:?}", addr, server.handshake_timeout);
            return Ok(());
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
            let error = AccessError::BadRequest(e.to_string());
            auth_manager.record_rejection(&error);
            return reject(&mut handler, &error, &mountpoint, server.write_timeout).await;
        }
        Ok(Err(e)) => {
            debug!("Client {} went away during handshake: {}", addr, e);
            return Ok(());
        }
        Ok(Ok(Err(error))) => {
            warn!("Malformed request from {}: {}", addr, error);
            auth_manager.record_rejection(&error);
            return reject(&mut handler, &error, &mountpoint, server.write_timeout).await;
        }
        Ok(Ok(Ok(request))) => request,
    };
    log_request(&request, addr);

    match auth_manager.authorize(&request, addr) {
        Err(error) => reject(&mut handler, &error, &mountpoint, server.write_timeout).await,
        Ok(AccessGrant::SourceTable) => {
            let response = NtripResponse::SourceTable {
                version: request.version(),
                body: sourcetable_body(&mountpoint, auth_manager.auth_required()),
            };
            send_with_timeout(&mut handler, &response, server.write_timeout).await?;
            debug!("Sent sourcetable to {}", addr);
            Ok(())
        }
        Ok(AccessGrant::Stream) => {
            let version = request.version();
            let subscriber = Arc::new(Subscriber::new(connection_id, Some(addr)));

            send_with_timeout(&mut handler, &NtripResponse::Stream(version), server.write_timeout).await?;
            let handle = context
                .hub
                .register_subscriber(subscriber)
                .context("Failed to register subscriber")?;

            info!(
                "Client {} streaming /{} ({})",
                addr,
                mountpoint,
                if version == NtripVersion::V2 { "NTRIP 2.0" } else { "NTRIP 1.0" }
            );

            let stream = handler.into_stream();
            let (end, delivered) = stream_to_client(&context, stream, handle, &mut shutdown_rx).await;
            info!(
                subscriber_id = connection_id,
                bytes_delivered = delivered,
                "Client {} disconnected: {:?}", addr, end
            );
            Ok(())
        }
    }
}

fn log_request(request: &NtripRequest, addr: SocketAddr) {
    debug!(
        "Request from {}: {} {} (agent: {})",
        addr,
        request.method,
        request.path,
        request.header("User-Agent").unwrap_or("-")
    );
}

async fn reject(
    handler: &mut NtripHandler<TcpStream>,
    error: &AccessError,
    mountpoint: &str,
    write_timeout: Duration,
) -> Result<()> {
    let response = NtripResponse::rejection(error, mountpoint);
    // The client may already be gone; the rejection is best effort.
    if let Err(e) = send_with_timeout(handler, &response, write_timeout).await {
        debug!("Failed to send {}: {}", response.status_line(), e);
    }
    Ok(())
}

async fn send_with_timeout(
    handler: &mut NtripHandler<TcpStream>,
    response: &NtripResponse,
    write_timeout: Duration,
) -> Result<()> {
    timeout(write_timeout, handler.send_response(response))
        .await
        .map_err(|_| anyhow::anyhow!("Response write timed out after {:?}", write_timeout))?
        .context("Failed to send response")?;
    Ok(())
}

/// Drain the subscriber queue into the socket.
///
/// Anything the client sends (NMEA position reports) is read and dropped;
/// EOF on that side means the client left.
async fn stream_to_client(
    context: &ConnectionContext,
    stream: TcpStream,
    mut handle: SubscriberHandle,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> (StreamEnd, u64) {
    let write_timeout = context.config.server.write_timeout;
    let (mut reader, mut writer) = stream.into_split();
    let mut discard = [0u8; 512];

    let end = loop {
        tokio::select! {
            chunk = handle.recv() => match chunk {
                Some(chunk) => {
                    match timeout(write_timeout, writer.write_all(&chunk)).await {
                        Ok(Ok(())) => {
                            handle.subscriber().record_delivery(chunk.len());
                            context.stats.record_bytes_sent(chunk.len());
                        }
                        Ok(Err(e)) => {
                            debug!(subscriber_id = handle.id(), "Socket write failed: {}", e);
                            break StreamEnd::SocketError;
                        }
                        Err(_) => {
                            warn!(subscriber_id = handle.id(), "Socket write timed out after {:?}", write_timeout);
                            break StreamEnd::WriteTimeout;
                        }
                    }
                }
                None => break StreamEnd::Evicted,
            },
            read = reader.read(&mut discard) => match read {
                Ok(0) => break StreamEnd::ClientClosed,
                Ok(n) => trace!(subscriber_id = handle.id(), "Discarded {} bytes from client", n),
                Err(e) => {
                    debug!(subscriber_id = handle.id(), "Socket read failed: {}", e);
                    break StreamEnd::SocketError;
                }
            },
            _ = shutdown_rx.recv() => break StreamEnd::Shutdown,
        }
    };

    let delivered = handle.subscriber().bytes_delivered();
    // Unregisters the subscriber if the hub still holds it
    drop(handle);
    let _ = writer.shutdown().await;
    (end, delivered)
}
