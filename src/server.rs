//! TCP surface: listener, accept loop, connection registry, and graceful
//! shutdown. One task per connection; within a connection, frames are
//! handled strictly in arrival order.

use crate::config::Config;
use crate::connection::{Connection, ConnectionState, ConnectionStats};
use crate::error::Result;
use crate::router;
use crate::session::SessionManager;
use crate::store::ModelStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_current: AtomicU64,
    pub connections_total: AtomicU64,
    pub commands_handled: AtomicU64,
}

/// Registry entry; stats stay readable after the socket is gone.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub stats: Arc<ConnectionStats>,
}

pub struct ServerState {
    pub cfg: Config,
    pub store: ModelStore,
    pub sessions: Arc<SessionManager>,
    pub connections: Mutex<HashMap<u64, ConnectionHandle>>,
    pub stats: ServerStats,
    next_connection_id: AtomicU64,
}

impl ServerState {
    pub fn new(cfg: Config) -> Self {
        let sessions = Arc::new(SessionManager::new(
            cfg.session_idle_timeout(),
            cfg.session_absolute_timeout(),
        ));
        Self {
            cfg,
            store: ModelStore::new(),
            sessions,
            connections: Mutex::new(HashMap::new()),
            stats: ServerStats::default(),
            next_connection_id: AtomicU64::new(0),
        }
    }

    fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn connection_stats(&self, id: u64) -> Option<Arc<ConnectionStats>> {
        self.connections.lock().await.get(&id).map(|h| h.stats.clone())
    }
}

/// Run until the process is stopped.
pub async fn run(cfg: Config) -> Result<()> {
    let (_state, addr, _shutdown, handle) = spawn_with_shutdown(cfg).await?;
    tracing::info!(listen_addr = %addr, "listening");
    handle.await.map_err(|e| crate::error::Error::Msg(e.to_string()))?;
    Ok(())
}

/// Bind and serve in a background task. The returned sender stops the
/// listener, closes open connections, and drains their handlers.
pub async fn spawn_with_shutdown(
    cfg: Config,
) -> Result<(
    Arc<ServerState>,
    SocketAddr,
    watch::Sender<bool>,
    tokio::task::JoinHandle<()>,
)> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let addr = listener.local_addr()?;
    let state = Arc::new(ServerState::new(cfg));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    crate::session::spawn_sweeper(
        state.sessions.clone(),
        state.cfg.session_sweep_interval(),
        shutdown_rx.clone(),
    );

    let serve_state = state.clone();
    let handle = tokio::spawn(async move {
        serve(serve_state, listener, shutdown_rx).await;
    });
    Ok((state, addr, shutdown_tx, handle))
}

async fn serve(state: Arc<ServerState>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let current = state.stats.connections_current.load(Ordering::Relaxed);
                if current >= state.cfg.max_connections() as u64 {
                    tracing::warn!(%addr, current, "connection limit reached, dropping");
                    continue;
                }
                let id = state.next_connection_id();
                tracing::debug!(%addr, conn = id, "accepted connection");
                let conn = Connection::new(id, addr);
                {
                    let mut registry = state.connections.lock().await;
                    registry.insert(id, ConnectionHandle {
                        id,
                        peer_addr: addr,
                        stats: conn.stats.clone(),
                    });
                }
                state.stats.connections_current.fetch_add(1, Ordering::Relaxed);
                state.stats.connections_total.fetch_add(1, Ordering::Relaxed);

                let conn_state = state.clone();
                let conn_shutdown = shutdown.clone();
                tasks.spawn(async move {
                    handle_connection(conn_state, socket, conn, conn_shutdown).await;
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    // Listener drops here; connections observe shutdown and close, then we
    // wait for their handlers to drain.
    drop(listener);
    while tasks.join_next().await.is_some() {}
    tracing::info!("server stopped");
}

async fn handle_connection(
    state: Arc<ServerState>,
    mut socket: TcpStream,
    mut conn: Connection,
    mut shutdown: watch::Receiver<bool>,
) {
    conn.set_state(ConnectionState::Connected);
    let idle = state.cfg.connection_idle_timeout();
    let max_len = state.cfg.max_message_size();
    let mut scratch = [0u8; 8192];

    'outer: loop {
        let read = tokio::select! {
            r = tokio::time::timeout(idle, socket.read(&mut scratch)) => match r {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::debug!(conn = conn.id, error = %e, "read failed");
                    conn.fail();
                    break;
                }
                Err(_) => {
                    tracing::info!(conn = conn.id, "idle timeout, closing");
                    conn.set_state(ConnectionState::Closing);
                    break;
                }
            },
            _ = shutdown.changed() => {
                conn.set_state(ConnectionState::Closing);
                break;
            }
        };
        if read == 0 {
            // A partial frame at peer close raises truncated; the connection
            // still transitions straight to closed.
            if let Some(e) = conn.truncation_error() {
                tracing::warn!(conn = conn.id, error = %e, "peer closed mid-frame");
            }
            conn.set_state(ConnectionState::Closed);
            break;
        }
        conn.extend(&scratch[..read]);

        loop {
            match conn.next_frame(max_len) {
                Ok(Some(frame)) => {
                    let reply = router::handle_frame(&state, &mut conn, &frame).await;
                    if let Some(reply) = reply
                        && !write_reply(&mut socket, &mut conn, &reply).await
                    {
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn = conn.id, error = %e, "unrecoverable framing error");
                    // Best-effort error reply goes out before the teardown.
                    let peeked = frame_peek(&conn);
                    if let Some(reply) = router::framing_error_reply(&mut conn, &peeked, &e) {
                        let _ = write_reply(&mut socket, &mut conn, &reply).await;
                    }
                    conn.fail();
                    break 'outer;
                }
            }
        }
    }

    let _ = socket.shutdown().await;
    conn.set_state(ConnectionState::Closing);
    conn.set_state(ConnectionState::Closed);
    conn.clear_cursors();
    state.connections.lock().await.remove(&conn.id);
    state.stats.connections_current.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(
        conn = conn.id,
        frames = conn.stats.frames_received.load(Ordering::Relaxed),
        replies = conn.stats.replies_sent.load(Ordering::Relaxed),
        bytes_in = conn.stats.bytes_received.load(Ordering::Relaxed),
        bytes_out = conn.stats.bytes_sent.load(Ordering::Relaxed),
        "connection closed"
    );
}

fn frame_peek(conn: &Connection) -> Vec<u8> {
    conn.peek(crate::protocol::HEADER_LEN)
}

/// Write one reply unless the connection is already closing; returns false
/// when the connection must be torn down.
async fn write_reply(socket: &mut TcpStream, conn: &mut Connection, reply: &[u8]) -> bool {
    if !conn.state().can_send() {
        tracing::warn!(conn = conn.id, "dropping reply on closing connection");
        return true;
    }
    match socket.write_all(reply).await {
        Ok(()) => {
            conn.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
            conn.stats
                .bytes_sent
                .fetch_add(reply.len() as u64, Ordering::Relaxed);
            true
        }
        Err(e) => {
            tracing::debug!(conn = conn.id, error = %e, "write failed");
            conn.fail();
            false
        }
    }
}
