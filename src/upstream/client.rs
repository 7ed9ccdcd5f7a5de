//! Upstream NTRIP Client

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::session::{Session, SessionInfo, SessionState};
use crate::config::Config;
use crate::error::UpstreamError;
use crate::metrics::Statistics;
use crate::protocol::{build_request, NtripHandler, ResponseStatus};
use crate::relay::RelayHub;
use crate::rtcm::FrameParser;

/// Owns the connection to the remote caster
pub struct UpstreamClient {
    config: Arc<Config>,
    hub: Arc<RelayHub>,
    stats: Arc<Statistics>,
}

impl UpstreamClient {
    /// Create a new upstream client feeding `hub`
    pub fn new(config: Arc<Config>, hub: Arc<RelayHub>, stats: Arc<Statistics>) -> Self {
        Self { config, hub, stats }
    }

    /// Fresh session descriptor for the next connection attempt
    pub fn new_session_info(&self) -> Arc<SessionInfo> {
        let upstream = &self.config.upstream;
        Arc::new(SessionInfo::new(
            self.config.upstream_addr(),
            upstream.mountpoint.trim_start_matches('/').to_string(),
            upstream.username.clone(),
        ))
    }

    /// Connect and perform the NTRIP handshake
    pub async fn connect(&self) -> Result<Session, UpstreamError> {
        self.connect_session(self.new_session_info()).await
    }

    /// Connect using a session descriptor the caller already observes
    pub async fn connect_session(&self, info: Arc<SessionInfo>) -> Result<Session, UpstreamError> {
        info.set_state(SessionState::Connecting);
        let result = self.establish(&info).await;
        match &result {
            Ok(_) => info.set_state(SessionState::Streaming),
            Err(_) => info.set_state(SessionState::Failed),
        }
        result
    }

    async fn establish(&self, info: &Arc<SessionInfo>) -> Result<Session, UpstreamError> {
        let upstream = &self.config.upstream;
        let addr = self.config.upstream_addr();

        info!("Connecting to NTRIP caster {}, mountpoint '{}'", addr, info.mountpoint);

        let stream = match timeout(upstream.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(UpstreamError::Connect { addr, source }),
            Err(_) => {
                return Err(UpstreamError::Timeout {
                    stage: "connect",
                    after: upstream.connect_timeout,
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on upstream socket: {}", e);
        }

        let request = build_request(
            &upstream.host,
            upstream.port,
            &info.mountpoint,
            &upstream.username,
            &upstream.password,
            &upstream.user_agent,
        );
        debug!(session_id = %info.session_id, "Sending NTRIP request for /{}", info.mountpoint);

        let mut handler = NtripHandler::new(stream);
        let exchange = async {
            handler.send_request(&request).await?;
            handler.receive_response().await
        };
        let head = match timeout(upstream.handshake_timeout, exchange).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                return Err(UpstreamError::Handshake {
                    reason: format!("failed to read response: {}", e),
                    status_line: String::new(),
                })
            }
            Err(_) => {
                return Err(UpstreamError::Timeout {
                    stage: "handshake",
                    after: upstream.handshake_timeout,
                })
            }
        };

        let status_line = head.first_line().to_string();
        let status = ResponseStatus::classify(&status_line);
        if !status.is_success() {
            warn!("Caster {} refused /{}: {}", addr, info.mountpoint, status_line);
            return Err(UpstreamError::Handshake {
                reason: status.describe().to_string(),
                status_line,
            });
        }

        info.set_status_line(&status_line);
        info!(
            session_id = %info.session_id,
            initial_bytes = head.leftover.len(),
            "NTRIP stream started: {}", status_line
        );

        Ok(Session::new(Arc::clone(info), handler.into_stream(), head.leftover))
    }

    /// Relay the session's byte stream into the hub until it ends.
    ///
    /// Returns `Ok(())` when stopped through `shutdown`; any other end of the
    /// stream is an error and leaves the session `Failed`.
    pub async fn stream(
        &self,
        session: Session,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), UpstreamError> {
        let (info, mut stream, pending) = session.into_parts();
        let buffer_size = self.config.upstream.buffer_size;
        let read_timeout = self.config.upstream.read_timeout;
        let mut parser = FrameParser::with_statistics(Arc::clone(&self.stats));
        let mut buf = BytesMut::with_capacity(buffer_size);

        if !pending.is_empty() {
            self.ingest(&info, &mut parser, pending);
        }

        let result = loop {
            buf.reserve(buffer_size);
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(session_id = %info.session_id, "Upstream read loop stopped by shutdown");
                    break Ok(());
                }
                read = timeout(read_timeout, stream.read_buf(&mut buf)) => match read {
                    Err(_) => break Err(UpstreamError::Stalled(read_timeout)),
                    Ok(Ok(0)) => break Err(UpstreamError::Closed),
                    Ok(Ok(_)) => {
                        let chunk = buf.split().freeze();
                        self.ingest(&info, &mut parser, chunk);
                    }
                    Ok(Err(e)) => break Err(UpstreamError::Io(e)),
                }
            }
        };

        if parser.buffered() > 0 {
            trace!("Discarding {} buffered bytes of an incomplete frame", parser.buffered());
        }
        if result.is_err() {
            info.set_state(SessionState::Failed);
        }
        info.log_stats();
        result
    }

    fn ingest(&self, info: &SessionInfo, parser: &mut FrameParser, chunk: Bytes) {
        let len = chunk.len();
        self.stats.record_bytes(len);
        info.add_bytes(len);

        parser.extend(&chunk);
        let reached = self.hub.broadcast(chunk);

        let valid = parser.frames().filter(|frame| frame.valid).count() as u64;
        info.add_messages(valid);
        trace!(bytes = len, frames = valid, subscribers = reached, "Relayed upstream chunk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcm::RtcmFrame;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn fake_caster(response: &'static [u8]) -> (std::net::SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut handler = NtripHandler::new(socket);
            let head = handler.read_head().await.unwrap();
            let mut socket = handler.into_stream();
            socket.write_all(response).await.unwrap();
            head.text
        });
        (addr, task)
    }

    fn client_for(addr: std::net::SocketAddr, username: &str) -> (UpstreamClient, Arc<RelayHub>, Arc<Statistics>) {
        let mut config = Config::default();
        config.upstream.host = addr.ip().to_string();
        config.upstream.port = addr.port();
        config.upstream.mountpoint = "RTCM4".to_string();
        config.upstream.username = username.to_string();
        config.upstream.password = "secret".to_string();
        config.upstream.read_timeout = Duration::from_millis(300);

        let stats = Arc::new(Statistics::new());
        let hub = Arc::new(RelayHub::new(16, Arc::clone(&stats)));
        let client = UpstreamClient::new(Arc::new(config), Arc::clone(&hub), Arc::clone(&stats));
        (client, hub, stats)
    }

    #[tokio::test]
    async fn test_handshake_sends_credentials_and_keeps_leftover() {
        let (addr, caster) = fake_caster(b"ICY 200 OK\r\n\r\n\xD3\x00").await;
        let (client, _hub, _stats) = client_for(addr, "rover");

        let session = client.connect().await.unwrap();
        assert_eq!(session.info().state(), SessionState::Streaming);
        assert_eq!(session.info().status_line(), Some("ICY 200 OK"));

        let request = caster.await.unwrap();
        assert!(request.starts_with("GET /RTCM4 HTTP/1.1"));
        assert!(request.contains("Authorization: Basic cm92ZXI6c2VjcmV0"));
        assert!(request.contains("Ntrip-Version: Ntrip/2.0"));

        // the leftover may arrive in the same read as the head or not at all yet
        assert!(session.pending().len() <= 2);
    }

    #[tokio::test]
    async fn test_rejected_handshake_keeps_status_line() {
        let (addr, _caster) = fake_caster(b"HTTP/1.1 401 Unauthorized\r\n\r\n").await;
        let (client, _hub, _stats) = client_for(addr, "rover");

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.status_line(), Some("HTTP/1.1 401 Unauthorized"));
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_sourcetable_reply_is_a_failure() {
        let (addr, _caster) = fake_caster(b"SOURCETABLE 200 OK\r\n\r\nENDSOURCETABLE\r\n").await;
        let (client, _hub, _stats) = client_for(addr, "");

        let info = client.new_session_info();
        let err = client.connect_session(Arc::clone(&info)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Handshake { .. }));
        assert_eq!(info.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (client, _hub, _stats) = client_for(addr, "");
        assert!(matches!(client.connect().await, Err(UpstreamError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_stream_relays_and_counts_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frame = RtcmFrame::encode(&[0x43, 0x20, 0x01, 0x02]);
        let payload = frame.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut handler = NtripHandler::new(socket);
            handler.read_head().await.unwrap();
            let mut socket = handler.into_stream();
            socket.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(&payload).await.unwrap();
        });

        let (client, hub, stats) = client_for(addr, "");
        let mut subscriber = hub.register(hub.next_subscriber_id()).unwrap();
        let (_tx, mut shutdown) = broadcast::channel(1);

        let session = client.connect().await.unwrap();
        let info = Arc::clone(session.info());
        let result = client.stream(session, &mut shutdown).await;
        assert!(matches!(result, Err(UpstreamError::Closed)));
        assert_eq!(info.state(), SessionState::Failed);

        let mut received = Vec::new();
        while let Ok(chunk) = subscriber.try_recv() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, frame.to_vec());
        assert_eq!(info.messages_received(), 1);
        assert_eq!(stats.snapshot().message_counts.get(&1074), Some(&1));
    }

    #[tokio::test]
    async fn test_silent_caster_is_stalled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _caster = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut handler = NtripHandler::new(socket);
            handler.read_head().await.unwrap();
            let mut socket = handler.into_stream();
            socket.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (client, _hub, _stats) = client_for(addr, "");
        let (_tx, mut shutdown) = broadcast::channel(1);
        let session = client.connect().await.unwrap();

        let result = client.stream(session, &mut shutdown).await;
        assert!(matches!(result, Err(UpstreamError::Stalled(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_read_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _caster = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut handler = NtripHandler::new(socket);
            handler.read_head().await.unwrap();
            let mut socket = handler.into_stream();
            socket.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (client, _hub, _stats) = client_for(addr, "");
        let (tx, mut shutdown) = broadcast::channel(1);
        let session = client.connect().await.unwrap();
        tx.send(()).unwrap();

        assert!(client.stream(session, &mut shutdown).await.is_ok());
    }
}
