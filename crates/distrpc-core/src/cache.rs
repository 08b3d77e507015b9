//! Connection Cache (component C3, spec §4.3): a concurrent keyed
//! store of live connections with reservation rendezvous and LRU
//! eviction.
//!
//! A single `std::sync::Mutex` guards `addr_index`, `rid_index`, the
//! LRU order and the reservations table; it is never held across an
//! `.await` (spec §5). Reservation wakeup uses one `tokio::sync::Notify`
//! per outstanding key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::debug;

use crate::connection::Connection;
use crate::endpoint::RoutingId;
use crate::error::{CoreError, Result};

type AddrKey = (String, String);
type ReservationKey = (String, String, Vec<String>);

struct CacheInner {
    addr_index: HashMap<AddrKey, Arc<Connection>>,
    rid_index: HashMap<RoutingId, Arc<Connection>>,
    /// Ordered least-recently-used first, most-recently-used last.
    lru: Vec<RoutingId>,
    reservations: HashMap<ReservationKey, Arc<Notify>>,
}

impl CacheInner {
    fn bump(&mut self, rid: RoutingId) {
        if let Some(pos) = self.lru.iter().position(|r| *r == rid) {
            self.lru.remove(pos);
            self.lru.push(rid);
        }
    }

    fn find_matching_addr(&self, proto: &str, addr: &str, blessings: &[String]) -> Option<Arc<Connection>> {
        let c = self.addr_index.get(&(proto.to_string(), addr.to_string()))?;
        let ep = c.remote_endpoint()?;
        if ep.blessings_match(blessings) {
            Some(c.clone())
        } else {
            None
        }
    }
}

/// Concurrent connection cache fronting both the client dispatch
/// engine and the server flow acceptor.
pub struct Cache {
    inner: Mutex<CacheInner>,
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new()
    }
}

impl Cache {
    /// An empty cache.
    pub fn new() -> Self {
        Cache {
            inner: Mutex::new(CacheInner {
                addr_index: HashMap::new(),
                rid_index: HashMap::new(),
                lru: Vec::new(),
                reservations: HashMap::new(),
            }),
        }
    }

    /// Indexes `c` under both `addr_index` and `rid_index`, placing it
    /// at MRU. Fails if another connection with the same routing id is
    /// already present — the caller must close `c`. If a connection
    /// already exists at the same address key, the older one is
    /// evicted (closed) and replaced.
    ///
    /// Takes `cache` as an explicit `&Arc<Cache>` rather than a custom
    /// self receiver (`self: &Arc<Self>` is not a stable receiver type)
    /// so the connection can hold a `Weak` back-pointer for LRU bumps.
    pub fn insert(cache: &Arc<Self>, c: Arc<Connection>) -> Result<()> {
        let ep = c
            .remote_endpoint()
            .ok_or_else(|| CoreError::BadState("cannot insert a connection before handshake".into()))?;
        let rid = ep.routing_id();
        let addr_key = (ep.protocol().to_string(), ep.address().to_string());

        let evicted = {
            let mut inner = cache.inner.lock().unwrap();
            if inner.rid_index.contains_key(&rid) {
                return Err(CoreError::BadState(format!(
                    "connection with routing id {rid} already cached"
                )));
            }
            let evicted = inner.addr_index.insert(addr_key, c.clone());
            inner.rid_index.insert(rid, c.clone());
            inner.lru.push(rid);
            evicted
        };
        c.set_cache(Arc::downgrade(cache));
        if let Some(old) = evicted {
            debug!(%rid, "evicting stale connection at reused address key");
            old.close();
        }
        Ok(())
    }

    /// `ridIndex`-only insertion, used for accepted connections where
    /// the address key is uninteresting.
    pub fn insert_with_routing_id(cache: &Arc<Self>, c: Arc<Connection>) -> Result<()> {
        let ep = c
            .remote_endpoint()
            .ok_or_else(|| CoreError::BadState("cannot insert a connection before handshake".into()))?;
        let rid = ep.routing_id();
        {
            let mut inner = cache.inner.lock().unwrap();
            if inner.rid_index.contains_key(&rid) {
                return Err(CoreError::BadState(format!(
                    "connection with routing id {rid} already cached"
                )));
            }
            inner.rid_index.insert(rid, c.clone());
            inner.lru.push(rid);
        }
        c.set_cache(Arc::downgrade(cache));
        Ok(())
    }

    /// Returns the matching connection if present; if none, installs a
    /// reservation for this key and returns `None`. Any subsequent call
    /// with the same key blocks until [`Cache::unreserve`] is called by
    /// anyone, then retries the lookup against the now-current state.
    pub async fn reserved_find(
        &self,
        proto: &str,
        addr: &str,
        blessings: &[String],
    ) -> Option<Arc<Connection>> {
        let key: ReservationKey = (proto.to_string(), addr.to_string(), blessings.to_vec());
        loop {
            enum Step {
                Found(Arc<Connection>),
                Reserved,
                Wait(Arc<Notify>),
            }
            let step = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(c) = inner.find_matching_addr(proto, addr, blessings) {
                    if let Some(ep) = c.remote_endpoint() {
                        inner.bump(ep.routing_id());
                    }
                    Step::Found(c)
                } else if let Some(notify) = inner.reservations.get(&key) {
                    Step::Wait(notify.clone())
                } else {
                    inner.reservations.insert(key.clone(), Arc::new(Notify::new()));
                    Step::Reserved
                }
            };
            match step {
                Step::Found(c) => return Some(c),
                Step::Reserved => return None,
                Step::Wait(notify) => notify.notified().await,
            }
        }
    }

    /// Wakes all pending `reserved_find` waiters on `key`.
    pub fn unreserve(&self, proto: &str, addr: &str, blessings: &[String]) {
        let key: ReservationKey = (proto.to_string(), addr.to_string(), blessings.to_vec());
        let notify = self.inner.lock().unwrap().reservations.remove(&key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Non-blocking lookup in `rid_index`.
    pub fn find_with_routing_id(&self, rid: RoutingId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock().unwrap();
        let found = inner.rid_index.get(&rid).cloned();
        if found.is_some() {
            inner.bump(rid);
        }
        found
    }

    /// Evicts the `n` least-recently-used connections and closes them,
    /// removing them atomically from both indices before closing so no
    /// subsequent find can hand out a dying connection.
    pub fn kill_connections(&self, n: usize) -> Vec<Arc<Connection>> {
        let victims = {
            let mut inner = self.inner.lock().unwrap();
            let n = n.min(inner.lru.len());
            let victim_rids: Vec<RoutingId> = inner.lru.drain(0..n).collect();
            let mut victims = Vec::with_capacity(victim_rids.len());
            for rid in victim_rids {
                if let Some(c) = inner.rid_index.remove(&rid) {
                    if let Some(ep) = c.remote_endpoint() {
                        inner
                            .addr_index
                            .remove(&(ep.protocol().to_string(), ep.address().to_string()));
                    }
                    victims.push(c);
                }
            }
            victims
        };
        for c in &victims {
            c.close();
        }
        victims
    }

    /// Removes a connection from the cache because the underlying
    /// transport reported it dead, waking any reservation waiters that
    /// would otherwise have matched it.
    pub fn remove_dead(&self, rid: RoutingId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.rid_index.remove(&rid) {
            if let Some(ep) = c.remote_endpoint() {
                inner
                    .addr_index
                    .remove(&(ep.protocol().to_string(), ep.address().to_string()));
            }
        }
        inner.lru.retain(|r| *r != rid);
    }

    /// Bumps `rid` to MRU. Called by `Connection::touch()` on every
    /// flow read/write, and internally by `insert`/`insert_with_routing_id`.
    pub(crate) fn bump(&self, rid: RoutingId) {
        self.inner.lock().unwrap().bump(rid);
    }

    /// Closes all connections and clears both indices. Idempotent.
    pub fn close(&self) {
        let (conns, reservations) = {
            let mut inner = self.inner.lock().unwrap();
            let conns: Vec<Arc<Connection>> = inner.rid_index.drain().map(|(_, c)| c).collect();
            inner.addr_index.clear();
            inner.lru.clear();
            let reservations: Vec<Arc<Notify>> = inner.reservations.drain().map(|(_, n)| n).collect();
            (conns, reservations)
        };
        for c in &conns {
            c.close();
        }
        for n in &reservations {
            n.notify_waiters();
        }
    }

    /// Current number of live entries in `rid_index` (and thus the LRU
    /// list, per the cache's invariant that the two always agree).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rid_index.len()
    }

    /// True if the cache holds no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
