//! Relay server accept loop and per-connection I/O driver.
//!
//! A spawned writer task draining an mpsc channel, `tokio::select!`-based
//! graceful shutdown on SIGINT/SIGTERM, and a periodic cleanup task, over
//! the binary length-prefixed framing [`securemsg_sdk::transport`] defines,
//! driving one [`Connection`] state machine per accepted socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use securemsg_sdk::nonce::NonceTracker;
use securemsg_sdk::transport::{read_length_prefixed, write_length_prefixed};

use crate::config::ServerConfig;
use crate::connection::{Connection, OutboundEvent, SharedState};
use crate::ratelimit::RateLimiter;
use crate::store::MessageStore;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Matches the handshake frame length exactly, plus the general per-frame
/// cap for everything after the handshake.
const LENGTH_PREFIX_HEADROOM: usize = 256;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Process-wide server state: the shared relay state plus the live
/// connection count admission control consults.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server { config }
    }

    fn build_shared(&self) -> Arc<SharedState> {
        Arc::new(SharedState {
            nonce_tracker: NonceTracker::new(self.config.nonce_tracker_config()),
            handshake_limiter: RateLimiter::new(60_000, self.config.handshake_rate_per_min),
            message_limiter: RateLimiter::new(self.config.message_rate_window_ms, self.config.message_rate_max),
            message_store: MessageStore::new(self.config.message_expiry_ms, self.config.max_stored_messages),
            max_message_size: self.config.max_message_size,
        })
    }

    fn spawn_cleanup_task(&self, shared: Arc<SharedState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let now = now_ms();
                shared.nonce_tracker.sweep(now);
                shared.handshake_limiter.gc(now);
                shared.message_limiter.gc(now);
                shared.message_store.cleanup(now);
                tracing::debug!("Cleanup pass complete");
            }
        })
    }

    /// Bind and serve until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        tracing::info!(addr = %self.config.listen_addr(), "Relay listening");
        let shared = self.build_shared();
        let max_message_size = self.config.max_message_size;
        let max_sessions = self.config.max_sessions;
        let active_sessions = Arc::new(AtomicUsize::new(0));

        self.spawn_cleanup_task(Arc::clone(&shared));

        let shutdown = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received shutdown signal");
            }
        };

        tokio::select! {
            _ = shutdown => {}
            result = accept_loop(listener, shared, max_message_size, max_sessions, Arc::clone(&active_sessions)) => {
                if let Err(e) = result {
                    tracing::error!("Accept loop error: {e}");
                }
            }
        }
        Ok(())
    }

    /// Bind and return the listener address plus a join handle, for tests
    /// that need to connect to a live server and then tear it down.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let addr = listener.local_addr()?;
        let shared = self.build_shared();
        let max_message_size = self.config.max_message_size;
        let max_sessions = self.config.max_sessions;
        let active_sessions = Arc::new(AtomicUsize::new(0));

        self.spawn_cleanup_task(Arc::clone(&shared));

        let handle = tokio::spawn(accept_loop(listener, shared, max_message_size, max_sessions, active_sessions));
        Ok((addr, handle))
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<SharedState>,
    max_message_size: usize,
    max_sessions: usize,
    active_sessions: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let shared = Arc::clone(&shared);
        let active_sessions = Arc::clone(&active_sessions);
        tokio::spawn(async move {
            active_sessions.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = handle_connection(stream, remote_addr, shared, max_message_size, max_sessions, &active_sessions).await {
                tracing::warn!(%remote_addr, "Connection error: {e}");
            }
            active_sessions.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<SharedState>,
    max_message_size: usize,
    max_sessions: usize,
    active_sessions: &AtomicUsize,
) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    // Bucket handshake rate limiting by IP only: a fresh TCP connection
    // gets a fresh ephemeral port, so keying on the full socket address
    // would make the limiter unable to see repeat attempts from one host.
    let mut conn = Connection::new(remote_addr.ip().to_string());

    let (tx, mut rx) = mpsc::channel::<OutboundEvent>(64);
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OutboundEvent::Bytes(bytes) => {
                    if write_length_prefixed(&mut write_half, &bytes).await.is_err() {
                        break;
                    }
                }
                OutboundEvent::Close(_, _) => break,
            }
        }
    });

    let current = active_sessions.load(Ordering::Relaxed);
    if let Some(event) = conn.admit(current, max_sessions) {
        let _ = tx.send(event).await;
        drop(tx);
        let _ = writer.await;
        return Ok(());
    }

    let read_cap = max_message_size + LENGTH_PREFIX_HEADROOM;
    loop {
        let frame = match read_length_prefixed(&mut read_half, read_cap).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%remote_addr, "Read error: {e}");
                break;
            }
        };

        let events = conn.on_frame(&frame, &shared, now_ms());
        let mut should_stop = false;
        for event in events {
            should_stop |= matches!(event, OutboundEvent::Close(_, _));
            if tx.send(event).await.is_err() {
                should_stop = true;
                break;
            }
        }
        if should_stop {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use securemsg_sdk::handshake;
    use securemsg_sdk::identity::{EphemeralKeyPair, IdentityKeyPair};
    use securemsg_sdk::transport::TcpDuplexChannel;
    use securemsg_sdk::session::DuplexChannel;

    fn test_config(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            host: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn accepts_a_handshake_over_loopback() {
        let server = Server::new(test_config(0));
        let (addr, _handle) = server.start().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = TcpDuplexChannel::new(stream, 1 << 20);

        let identity = IdentityKeyPair::generate();
        let ephemeral = EphemeralKeyPair::generate();
        let init = handshake::build_initiator_init(identity.signing_key(), &ephemeral, now_ms() as u64, [3u8; 16]);
        channel.send(init.to_vec()).await.unwrap();

        let event = channel.recv().await.unwrap();
        match event {
            securemsg_sdk::session::ChannelEvent::Frame(bytes) => {
                assert_eq!(bytes.len(), handshake::RESPONDER_REPLY_LEN);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
