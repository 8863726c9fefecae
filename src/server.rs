use crate::config::Config;
use crate::cursor::CursorHandle;
use crate::dispatch::{Dispatcher, Outcome};
use crate::error::{Error, Result};
use crate::protocol::{Frame, OP_SEND, read_frame, write_frame};
use crate::reply;
use crate::store::{Backend, MemoryStore, PgStore};
use crate::write_concern::WriteConcern;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

static REQ_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    loop {
        let id = REQ_ID.fetch_add(1, Ordering::Relaxed);
        if id > 0 {
            return id;
        }
        // wrapped around; ids are positive and 0 means "not a reply"
        let _ = REQ_ID.compare_exchange(id.wrapping_add(1), 1, Ordering::Relaxed, Ordering::Relaxed);
    }
}

pub struct AppState {
    pub dispatcher: Dispatcher<Backend>,
    /// Bus address requests must name.
    pub address: String,
    pub max_message_bytes: usize,
}

// Continuations are keyed by the id of the `more-exist` reply they answer,
// per connection, so clients never see each other's cursors.
struct Connection {
    pending: Mutex<HashMap<i32, CursorHandle>>,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Open the store selected by `cfg`.
pub async fn connect_backend(cfg: &Config) -> Result<Backend> {
    if cfg.fake {
        return Ok(Backend::Memory(MemoryStore::new(cfg.db_name.clone())));
    }
    let pg = PgStore::connect(&cfg.connection_url(), &cfg.db_name, cfg.pool_size, cfg.server_used()).await?;
    pg.bootstrap().await?;
    Ok(Backend::Postgres(pg))
}

pub async fn build_state(cfg: &Config) -> Result<AppState> {
    let default_wc: WriteConcern = cfg
        .default_write_concern
        .parse()
        .map_err(|e: Error| Error::Config(format!("default_write_concern: {}", e)))?;
    let backend = connect_backend(cfg).await?;
    tracing::info!(backend = backend.kind(), db = %cfg.db_name, write_concern = %default_wc, "store ready");
    Ok(AppState {
        dispatcher: Dispatcher::new(backend, cfg.db_name.clone(), default_wc),
        address: cfg.address.clone(),
        max_message_bytes: cfg.max_message_bytes,
    })
}

/// Serve until Ctrl-C.
pub async fn run(cfg: Config) -> Result<()> {
    let (_state, local_addr, shutdown, handle) = spawn_with_shutdown(cfg).await?;
    tracing::info!(%local_addr, "persistor listening");
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutting down");
            let _ = shutdown.send(true);
        }
        res = handle => {
            return res.map_err(|e| Error::Msg(e.to_string()))?;
        }
    }
    Ok(())
}

/// Spawn the server on the configured listen address and run until `shutdown` is signaled.
/// Returns the shared `AppState`, the bound local address, a shutdown sender, and the task handle.
pub async fn spawn_with_shutdown(
    cfg: Config,
) -> Result<(Arc<AppState>, SocketAddr, watch::Sender<bool>, JoinHandle<Result<()>>)> {
    let state = Arc::new(build_state(&cfg).await?);
    spawn_with_state(&cfg, state).await
}

/// Like [`spawn_with_shutdown`] with a state built by the caller.
pub async fn spawn_with_state(
    cfg: &Config,
    state: Arc<AppState>,
) -> Result<(Arc<AppState>, SocketAddr, watch::Sender<bool>, JoinHandle<Result<()>>)> {
    // Allow ephemeral port usage in tests (e.g., 127.0.0.1:0)
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let local_addr = listener.local_addr()?;

    let ttl = Duration::from_secs(cfg.cursor_timeout_secs.unwrap_or(300));
    let sweep_interval = Duration::from_secs(cfg.cursor_sweep_interval_secs.unwrap_or(30).max(1));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let sweeper_state = state.clone();
    let mut sweeper_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    sweeper_state.dispatcher.sweep_cursors(ttl).await;
                }
                _ = sweeper_shutdown.changed() => {
                    if *sweeper_shutdown.borrow() { break; }
                }
            }
        }
    });

    let state_accept = state.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                res = listener.accept() => {
                    let (socket, addr) = res?;
                    tracing::debug!(%addr, "accepted connection");
                    let state = state_accept.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, socket).await {
                            tracing::debug!(error = %e, "connection closed with error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
        Ok(())
    });

    Ok((state, local_addr, shutdown_tx, handle))
}

async fn handle_connection(state: Arc<AppState>, socket: TcpStream) -> Result<()> {
    let _ = socket.set_nodelay(true);
    let (mut rd, wr) = socket.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(wr, rx));
    let conn = Arc::new(Connection { pending: Mutex::new(HashMap::new()), tx });

    let mut in_flight = JoinSet::new();
    let res = loop {
        let frame = match read_frame(&mut rd, state.max_message_bytes).await {
            Ok(Some(f)) => f,
            Ok(None) => break Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "dropping connection");
                break Err(e);
            }
        };
        let state = state.clone();
        let conn = conn.clone();
        in_flight.spawn(async move { handle_frame(&state, &conn, frame).await });
        // Reap finished handlers so a long-lived connection does not accumulate them
        while in_flight.try_join_next().is_some() {}
    };

    while in_flight.join_next().await.is_some() {}
    let abandoned: Vec<CursorHandle> = conn.pending.lock().await.drain().map(|(_, h)| h).collect();
    if !abandoned.is_empty() {
        tracing::debug!(cursors = abandoned.len(), "releasing cursors of closed connection");
    }
    for handle in abandoned {
        state.dispatcher.release_cursor(handle).await;
    }
    drop(conn);
    let _ = writer.await;
    res
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut wr, &frame).await {
            tracing::debug!(error = %e, "write failed");
            break;
        }
    }
}

async fn handle_frame(state: &AppState, conn: &Connection, frame: Frame) {
    if frame.op_code != OP_SEND {
        tracing::warn!(op_code = frame.op_code, "unsupported op code");
        return;
    }
    let outcome = if frame.response_to != 0 {
        let handle = conn.pending.lock().await.remove(&frame.response_to);
        match handle {
            Some(h) => state.dispatcher.continue_cursor(h).await,
            None => Outcome { reply: reply::error("unknown cursor"), cursor: None },
        }
    } else if frame.address != state.address {
        tracing::debug!(address = %frame.address, "request for unknown address");
        Outcome { reply: reply::error(format!("no handler at address '{}'", frame.address)), cursor: None }
    } else {
        state.dispatcher.handle(&frame.body).await
    };

    let body = match serde_json::to_vec(&outcome.reply) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode reply");
            let fallback = reply::error(format!("failed to encode reply: {}", e));
            serde_json::to_vec(&fallback).unwrap_or_default()
        }
    };
    let request_id = next_request_id();
    if let Some(h) = outcome.cursor {
        let mut pending = conn.pending.lock().await;
        prune_reclaimed(state, &mut pending).await;
        pending.insert(request_id, h);
    }
    let more = outcome.cursor.is_some();
    if conn.tx.send(Frame::reply(request_id, frame.request_id, more, body)).is_err() {
        if let Some(h) = conn.pending.lock().await.remove(&request_id) {
            state.dispatcher.release_cursor(h).await;
        }
    }
}

// Drop continuation keys whose cursors the sweeper has reclaimed
async fn prune_reclaimed(state: &AppState, pending: &mut HashMap<i32, CursorHandle>) {
    let mut stale = Vec::new();
    for (&reply_id, &handle) in pending.iter() {
        if !state.dispatcher.cursors().contains(handle).await {
            stale.push(reply_id);
        }
    }
    for reply_id in stale {
        pending.remove(&reply_id);
    }
}
