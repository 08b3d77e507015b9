//! Flow Manager (C4, spec §4.4): owns the connection cache and
//! orchestrates `Dial`/`Accept`/`Listen` over a pluggable
//! [`crate::transport::Transport`].
//!
//! Grounded in the teacher's connection-pool acquire/release pattern
//! (`pool.rs`'s `ConnectionPool::acquire`), generalized from a flat
//! pool to the cache's reservation rendezvous and widened from
//! "acquire a Connection" to "hand back an open Flow".
//!
//! `Dial`/`Listen` take `manager: &Arc<FlowManager>` explicitly rather
//! than a custom `self: &Arc<Self>` receiver, since a reference to a
//! smart pointer is not a stable method receiver type.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::endpoint::{Endpoint, RoutingId};
use crate::error::{CoreError, Result};
use crate::flow::Flow;
use crate::security::{Blessings, PeerAuthorizer};
use crate::transport::{Listener, Transport};

/// Releases a cache reservation on drop unless [`ReservationGuard::disarm`]
/// has run. Covers both ordinary failure returns and the future simply
/// being dropped (task abort, a losing `select!` branch) part way
/// through `dial`.
struct ReservationGuard {
    cache: Arc<Cache>,
    proto: String,
    addr: String,
    blessings: Vec<String>,
    armed: bool,
}

impl ReservationGuard {
    fn new(cache: Arc<Cache>, proto: String, addr: String, blessings: Vec<String>) -> Self {
        ReservationGuard {
            cache,
            proto,
            addr,
            blessings,
            armed: true,
        }
    }

    /// Releases the reservation immediately and prevents the `Drop` impl
    /// from releasing it a second time.
    fn release(mut self) {
        self.armed = false;
        self.cache.unreserve(&self.proto, &self.addr, &self.blessings);
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cache.unreserve(&self.proto, &self.addr, &self.blessings);
        }
    }
}

struct ListenerHandle {
    local_endpoint: Endpoint,
}

/// Owns the connection cache, the set of active listeners, and a
/// queue of peer-initiated flows collected from every listener.
pub struct FlowManager {
    transport: Arc<dyn Transport>,
    cache: Arc<Cache>,
    local_blessings: Blessings,
    listeners: Mutex<Vec<ListenerHandle>>,
    accept_tx: mpsc::UnboundedSender<Flow>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<Flow>>,
    dial_timeout: Duration,
}

impl FlowManager {
    /// Builds a manager over `transport`, presenting `local_blessings`
    /// on every connection it originates or accepts.
    pub fn new(transport: Arc<dyn Transport>, local_blessings: Blessings) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(FlowManager {
            transport,
            cache: Arc::new(Cache::new()),
            local_blessings,
            listeners: Mutex::new(Vec::new()),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            dial_timeout: Duration::from_secs(10),
        })
    }

    /// The cache backing this manager, shared with callers that need
    /// direct inspection (tests, metrics).
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Binds a transport listener on `(protocol, address)` and starts
    /// an accept task feeding newly accepted flows into this manager's
    /// shared accept queue.
    pub async fn listen(manager: &Arc<Self>, protocol: &str, address: &str) -> Result<Endpoint> {
        let listener = manager.transport.listen(protocol, address).await?;
        let bound_addr = listener.local_addr();
        let local_endpoint = Endpoint::new(protocol, bound_addr, RoutingId::NIL, manager.local_blessings.names());
        manager.listeners.lock().unwrap().push(ListenerHandle {
            local_endpoint: local_endpoint.clone(),
        });

        tokio::spawn(accept_loop(manager.clone(), listener));
        Ok(local_endpoint)
    }

    /// The local endpoints of every currently bound listener.
    pub fn listening_endpoints(&self) -> Vec<Endpoint> {
        self.listeners.lock().unwrap().iter().map(|l| l.local_endpoint.clone()).collect()
    }

    /// Opens a Flow to `endpoint`, reusing a cached connection if one
    /// matches, otherwise dialing a fresh one (spec §4.4 `Dial`).
    /// Honours `cancel` at every suspension point and releases its
    /// cache reservation on every exit, including cancellation of the
    /// calling task or the future simply being dropped.
    pub async fn dial(
        manager: &Arc<Self>,
        endpoint: &Endpoint,
        peer_authorizer: &dyn PeerAuthorizer,
        cancel: &CancelToken,
    ) -> Result<Flow> {
        let proto = endpoint.protocol().to_string();
        let addr = endpoint.address().to_string();
        let blessings = endpoint.blessing_names().to_vec();

        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Canceled("dial cancelled".to_string())),
            found = manager.cache.reserved_find(&proto, &addr, &blessings) => found,
        };

        if let Some(conn) = found {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Canceled("dial cancelled".to_string())),
                result = peer_authorizer.authorize_peer(&conn.remote_blessings()) => result?,
            }
            return Ok(conn.open_flow());
        }

        // Reservation now held by this call; the guard releases it on
        // every exit below, including the future being dropped before
        // `dial_fresh` resolves.
        let guard = ReservationGuard::new(manager.cache.clone(), proto.clone(), addr.clone(), blessings);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Canceled("dial cancelled".to_string())),
            result = Self::dial_fresh(manager, &proto, &addr, peer_authorizer) => result,
        };

        if result.is_ok() {
            guard.release();
        }
        result
    }

    async fn dial_fresh(
        manager: &Arc<Self>,
        proto: &str,
        addr: &str,
        peer_authorizer: &dyn PeerAuthorizer,
    ) -> Result<Flow> {
        let raw = manager.transport.dial(proto, addr, manager.dial_timeout).await?;
        let conn = Connection::new(raw, manager.local_blessings.clone(), None);

        // A real handshake would negotiate the remote routing id and
        // blessings; this transport does not speak one yet, so the
        // dialed address stands in as the identity until the wire
        // protocol grows a handshake frame.
        let remote_endpoint = Endpoint::new(proto, addr, RoutingId::NIL, Vec::new());
        let remote_blessings = Blessings::empty();
        conn.mark_active(remote_endpoint.clone(), remote_blessings.clone());

        if let Err(e) = peer_authorizer.authorize_peer(&remote_blessings).await {
            conn.close();
            return Err(e);
        }

        Cache::insert(&manager.cache, conn.clone())?;
        Ok(conn.open_flow())
    }

    /// Blocks until a peer-initiated flow is available on any
    /// listener, or returns `None` once the manager has been closed.
    pub async fn accept(&self) -> Option<Flow> {
        self.accept_rx.lock().unwrap().recv().await
    }

    /// Tears down every listener's reader path and closes the cache.
    pub fn close(&self) {
        self.cache.close();
    }
}

async fn accept_loop(manager: Arc<FlowManager>, listener: Box<dyn Listener>) {
    loop {
        let conn_transport = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "listener accept failed, stopping accept loop");
                break;
            }
        };
        let (flow_tx, mut flow_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(conn_transport, manager.local_blessings.clone(), Some(flow_tx));
        let remote_endpoint = Endpoint::new(
            "tcp",
            conn.remote_endpoint().map(|e| e.address().to_string()).unwrap_or_default(),
            RoutingId::NIL,
            Vec::new(),
        );
        conn.mark_active(remote_endpoint, Blessings::empty());
        if let Err(e) = Cache::insert_with_routing_id(&manager.cache, conn.clone()) {
            warn!(error = %e, "failed to install accepted connection in cache");
            conn.close();
            continue;
        }

        let accept_tx = manager.accept_tx.clone();
        tokio::spawn(async move {
            while let Some(flow) = flow_rx.recv().await {
                if accept_tx.send(flow).is_err() {
                    break;
                }
            }
        });
        debug!("accepted new connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{new_cancel_pair, CancelReason};
    use crate::transport::TcpTransport;

    struct PassthroughPeerAuth;

    #[async_trait::async_trait]
    impl PeerAuthorizer for PassthroughPeerAuth {
        async fn authorize_peer(&self, _remote: &Blessings) -> Result<()> {
            Ok(())
        }
    }

    /// A transport whose `dial` never resolves, for exercising
    /// cancellation of a dial stuck mid-flight.
    struct SlowTransport;

    #[async_trait::async_trait]
    impl Transport for SlowTransport {
        async fn dial(
            &self,
            _protocol: &str,
            _address: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn crate::transport::MessageConn>> {
            std::future::pending().await
        }

        async fn listen(&self, _protocol: &str, _address: &str) -> Result<Box<dyn Listener>> {
            unimplemented!("not exercised by the cancellation test")
        }
    }

    #[tokio::test]
    async fn dial_and_accept_roundtrip() {
        let server_transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let server = FlowManager::new(server_transport, Blessings::empty());
        let local_ep = FlowManager::listen(&server, "tcp", "127.0.0.1:0").await.unwrap();

        let client_transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let client = FlowManager::new(client_transport, Blessings::empty());
        let target = Endpoint::new("tcp", local_ep.address(), RoutingId::NIL, Vec::new());

        let client_flow = FlowManager::dial(&client, &target, &PassthroughPeerAuth, &CancelToken::none())
            .await
            .unwrap();
        let server_flow = server.accept().await.unwrap();

        client_flow.write(b"hello").await.unwrap();
        let got = server_flow.read().await.unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn dial_to_unreachable_address_releases_reservation() {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let manager = FlowManager::new(transport, Blessings::empty());
        let target = Endpoint::new("tcp", "127.0.0.1:1", RoutingId::NIL, Vec::new());
        let err = FlowManager::dial(&manager, &target, &PassthroughPeerAuth, &CancelToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));

        // The reservation must have been released; a second dial
        // attempt does not hang waiting on a stale reservation.
        let err2 = tokio::time::timeout(
            Duration::from_secs(2),
            FlowManager::dial(&manager, &target, &PassthroughPeerAuth, &CancelToken::none()),
        )
        .await
        .expect("dial must not block on a leaked reservation")
        .unwrap_err();
        assert!(matches!(err2, CoreError::Io(_)));
    }

    #[tokio::test]
    async fn dial_is_cancelled_and_releases_reservation() {
        let transport: Arc<dyn Transport> = Arc::new(SlowTransport);
        let manager = FlowManager::new(transport, Blessings::empty());
        let target = Endpoint::new("tcp", "198.51.100.1:1", RoutingId::NIL, Vec::new());

        let (cancel, handle) = new_cancel_pair();
        let manager_clone = manager.clone();
        let target_clone = target.clone();
        let dial_task = tokio::spawn(async move {
            FlowManager::dial(&manager_clone, &target_clone, &PassthroughPeerAuth, &cancel).await
        });

        tokio::task::yield_now().await;
        handle.cancel(CancelReason::UserRequested);
        let err = dial_task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Canceled(_)));

        // If the reservation had leaked, this would block forever
        // waiting on a notify that nothing ever fires; instead it must
        // see no match and re-reserve immediately.
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            manager.cache().reserved_find(
                target.protocol(),
                target.address(),
                target.blessing_names(),
            ),
        )
        .await
        .expect("reservation must have been released, not left dangling");
        assert!(second.is_none());
    }
}
