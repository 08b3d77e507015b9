//! `Connection`: an authenticated transport channel multiplexing many
//! `Flow`s (spec §3 "Connection", §4.2 "Flow").
//!
//! Multiplexing is a stream-id-tagged envelope over one
//! [`crate::transport::MessageConn`], grounded in the teacher's
//! `mux.rs` (`StreamId`, per-stream oneshot/channel registry), widened
//! from request/response pairing to a general bidirectional byte
//! stream per flow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::flow::Flow;
use crate::security::{Blessings, Discharge};
use crate::transport::MessageConn;

/// Identifies one multiplexed stream within a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport connected, handshake not yet complete.
    Handshaking = 0,
    /// Handshake complete, flows may be opened/accepted.
    Active = 1,
    /// `close()` has been requested; no new flows permitted.
    Closing = 2,
    /// Fully torn down.
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn envelope(stream_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn parse_envelope(mut buf: Vec<u8>) -> Option<(u64, Vec<u8>)> {
    if buf.len() < 8 {
        return None;
    }
    let payload = buf.split_off(8);
    let id = u64::from_be_bytes(buf.try_into().ok()?);
    Some((id, payload))
}

/// An authenticated transport channel between two routing-ids,
/// multiplexing many flows. Created by `Dial` or `Accept`; destroyed
/// when closed, evicted, or on underlying transport failure.
pub struct Connection {
    transport: Arc<dyn MessageConn>,
    local_endpoint: Mutex<Option<Endpoint>>,
    remote_endpoint: Mutex<Option<Endpoint>>,
    local_blessings: Blessings,
    remote_blessings: Mutex<Blessings>,
    local_discharges: Vec<Discharge>,
    remote_discharges: Mutex<Vec<Discharge>>,
    state: AtomicU8,
    next_stream_id: AtomicU64,
    demux: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    last_use_ms: AtomicU64,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    cache_ref: Mutex<Option<Weak<crate::cache::Cache>>>,
}

impl Connection {
    /// Wraps an already-connected transport into a `Connection` in the
    /// `Handshaking` state. `accept_tx`, if given, receives peer-opened
    /// flows (server side); `None` means this side never expects the
    /// peer to open flows (pure client connection).
    pub fn new(
        transport: Box<dyn MessageConn>,
        local_blessings: Blessings,
        accept_tx: Option<mpsc::UnboundedSender<Flow>>,
    ) -> Arc<Self> {
        let transport: Arc<dyn MessageConn> = Arc::from(transport);
        let conn = Arc::new(Connection {
            transport: transport.clone(),
            local_endpoint: Mutex::new(None),
            remote_endpoint: Mutex::new(None),
            local_blessings,
            remote_blessings: Mutex::new(Blessings::empty()),
            local_discharges: Vec::new(),
            remote_discharges: Mutex::new(Vec::new()),
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            next_stream_id: AtomicU64::new(1),
            demux: Mutex::new(HashMap::new()),
            last_use_ms: AtomicU64::new(now_ms()),
            reader_task: Mutex::new(None),
            cache_ref: Mutex::new(None),
        });
        let weak = Arc::downgrade(&conn);
        let handle = tokio::spawn(reader_loop(transport, weak, accept_tx));
        *conn.reader_task.lock().unwrap() = Some(handle);
        conn
    }

    /// Marks the handshake complete and records the authenticated
    /// remote endpoint and its initial blessings.
    pub fn mark_active(&self, remote_endpoint: Endpoint, remote_blessings: Blessings) {
        *self.remote_endpoint.lock().unwrap() = Some(remote_endpoint);
        *self.remote_blessings.lock().unwrap() = remote_blessings;
        self.state.store(ConnectionState::Active as u8, Ordering::SeqCst);
    }

    /// Records this side's own listening/dial endpoint, once known.
    pub fn set_local_endpoint(&self, endpoint: Endpoint) {
        *self.local_endpoint.lock().unwrap() = Some(endpoint);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// This side's own endpoint, if known.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_endpoint.lock().unwrap().clone()
    }

    /// The authenticated remote endpoint, if the handshake has
    /// completed.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote_endpoint.lock().unwrap().clone()
    }

    /// Blessings this side presented during handshake.
    pub fn local_blessings(&self) -> Blessings {
        self.local_blessings.clone()
    }

    /// Blessings the remote side presented during handshake.
    pub fn remote_blessings(&self) -> Blessings {
        self.remote_blessings.lock().unwrap().clone()
    }

    /// Discharges this side presented during handshake.
    pub fn local_discharges(&self) -> Vec<Discharge> {
        self.local_discharges.clone()
    }

    /// Discharges the remote side presented during handshake.
    pub fn remote_discharges(&self) -> Vec<Discharge> {
        self.remote_discharges.lock().unwrap().clone()
    }

    /// Monotonic-ish last-use timestamp (epoch ms), bumped by any
    /// flow read or write. Used by the cache to order its LRU list.
    pub fn last_use_ms(&self) -> u64 {
        self.last_use_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_use_ms.store(now_ms(), Ordering::Relaxed);
        let cache = self.cache_ref.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let (Some(cache), Some(ep)) = (cache, self.remote_endpoint()) {
            cache.bump(ep.routing_id());
        }
    }

    /// Records the cache this connection is (or will be) indexed
    /// under, so flow reads/writes can bump LRU recency (spec §9
    /// design note: Flow operations mutate Connection last-use under
    /// the cache lock, a brief critical section, never while holding
    /// the Connection through the Flow back-pointer).
    pub(crate) fn set_cache(&self, cache: Weak<crate::cache::Cache>) {
        *self.cache_ref.lock().unwrap() = Some(cache);
    }

    /// Opens a new flow on this connection, to be used by the local
    /// side to initiate an RPC (the `Dial`-side of spec §4.4).
    pub fn open_flow(self: &Arc<Self>) -> Flow {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.demux.lock().unwrap().insert(id, tx);
        Flow::new(
            Arc::downgrade(self),
            StreamId(id),
            rx,
            self.local_endpoint(),
            self.remote_endpoint(),
            self.local_blessings.clone(),
            self.remote_blessings(),
            self.local_discharges.clone(),
            self.remote_discharges(),
        )
    }

    pub(crate) async fn send_framed(&self, stream_id: StreamId, bytes: &[u8]) -> Result<()> {
        self.transport.send(&envelope(stream_id.0, bytes)).await
    }

    pub(crate) fn deregister_flow(&self, stream_id: StreamId) {
        self.demux.lock().unwrap().remove(&stream_id.0);
    }

    /// Number of flows currently open on this connection.
    pub fn live_flow_count(&self) -> usize {
        self.demux.lock().unwrap().len()
    }

    /// Idempotently tears the connection down: stops the reader task
    /// and marks every still-registered flow closed by dropping its
    /// channel, which surfaces as end-of-stream to readers.
    pub fn close(&self) {
        let prev = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if prev == ConnectionState::Closed as u8 {
            return;
        }
        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
        self.demux.lock().unwrap().clear();
        debug!("connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reader_loop(
    transport: Arc<dyn MessageConn>,
    conn: Weak<Connection>,
    accept_tx: Option<mpsc::UnboundedSender<Flow>>,
) {
    loop {
        let msg = match transport.recv().await {
            Ok(Some(m)) => m,
            Ok(None) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        };
        let Some((stream_id, payload)) = parse_envelope(msg) else {
            warn!("dropped malformed frame envelope");
            continue;
        };
        let Some(conn) = conn.upgrade() else { break };

        let existing = conn.demux.lock().unwrap().get(&stream_id).cloned();
        match existing {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => {
                let Some(accept_tx) = &accept_tx else {
                    warn!(stream_id, "unsolicited stream id on client-only connection");
                    continue;
                };
                let (tx, rx) = mpsc::unbounded_channel();
                conn.demux.lock().unwrap().insert(stream_id, tx.clone());
                let flow = Flow::new(
                    Arc::downgrade(&conn),
                    StreamId(stream_id),
                    rx,
                    conn.local_endpoint(),
                    conn.remote_endpoint(),
                    conn.local_blessings.clone(),
                    conn.remote_blessings(),
                    conn.local_discharges.clone(),
                    conn.remote_discharges(),
                );
                let _ = tx.send(payload);
                if accept_tx.send(flow).is_err() {
                    break;
                }
            }
        }
    }
    if let Some(conn) = conn.upgrade() {
        conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Blessings;
    use crate::transport::{Listener, TcpTransport, Transport};
    use std::time::Duration;

    #[tokio::test]
    async fn open_flow_and_echo_across_connection_pair() {
        let transport = TcpTransport::new();
        let listener = transport.listen("tcp", "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
            let server_conn = Connection::new(conn, Blessings::empty(), Some(accept_tx));
            server_conn.mark_active(
                Endpoint::new("tcp", "client", crate::endpoint::RoutingId::NIL, vec![]),
                Blessings::empty(),
            );
            let flow = accept_rx.recv().await.unwrap();
            let msg = flow.read().await.unwrap().unwrap();
            flow.write(&msg).await.unwrap();
        });

        let client_conn_raw = transport.dial("tcp", &addr, Duration::from_secs(1)).await.unwrap();
        let client_conn = Connection::new(client_conn_raw, Blessings::empty(), None);
        client_conn.mark_active(
            Endpoint::new("tcp", &addr, crate::endpoint::RoutingId::NIL, vec![]),
            Blessings::empty(),
        );
        let flow = client_conn.open_flow();
        flow.write(b"ping").await.unwrap();
        let echoed = flow.read().await.unwrap().unwrap();
        assert_eq!(echoed, b"ping");

        server.await.unwrap();
    }

    #[test]
    fn connection_state_roundtrip() {
        assert_eq!(ConnectionState::from(0) as u8, ConnectionState::Handshaking as u8);
        assert_eq!(ConnectionState::from(3) as u8, ConnectionState::Closed as u8);
    }
}
