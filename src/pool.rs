//
// Copyright 2018-2019 Tamas Blummer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//!
//! # Connection pool
//!
//! Shared by the Electrum and peer-to-peer layers (spec §4.2): maintains a target number of
//! healthy connections, scores peers, redials, and dispatches quorum RPCs. Generic over the
//! `Transport` so one implementation serves both protocol families, grounded directly on
//! `ElectrodConnectionPool` (`original_source/spruned/daemon/electrod/electrod_connection.py`).
//!

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

use crate::error::{Result, SprunedError};
use crate::peer::{Peer, PeerErrorKind, PeerEvent, PeerId, PeerStatus, Transport};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const PICK_RETRY_LIMIT: usize = 100;

/// Builds a fresh `Transport` for a server address. One implementation per protocol family
/// (`p2p_wire`, `electrum_wire`) is handed to the pool at construction time.
pub trait TransportFactory<A, T: Transport>: Send + Sync {
    fn build(&self, addr: &A) -> T;
}

impl<A, T, F> TransportFactory<A, T> for F
where
    T: Transport,
    F: Fn(&A) -> T + Send + Sync,
{
    fn build(&self, addr: &A) -> T {
        self(addr)
    }
}

struct Slot<T: Transport> {
    addr_key: String,
    status: Arc<PeerStatus>,
    peer: Arc<Mutex<Peer<T>>>,
}

/// Target-count connection pool, generic over transport.
pub struct ConnectionPool<A, T: Transport> {
    servers: Vec<A>,
    required_connections: usize,
    slots: DashMap<PeerId, Slot<T>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    events_tx: broadcast::Sender<PeerEvent>,
    factory: Box<dyn TransportFactory<A, T>>,
}

impl<A, T> ConnectionPool<A, T>
where
    A: Clone + Eq + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    pub fn new(servers: Vec<A>, required_connections: usize, factory: impl TransportFactory<A, T> + 'static) -> Arc<Self> {
        let (events_tx, _rx) = broadcast::channel(256);
        Arc::new(ConnectionPool {
            servers,
            required_connections,
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            events_tx,
            factory: Box::new(factory),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn usable_ids(&self) -> Vec<PeerId> {
        // Snapshot: the pool's own keepalive/error tasks are the only writers (§5), callers
        // either see this snapshot or accept a peer disappearing under them on next use.
        // Status is read straight off the shared `PeerStatus`, lock-free, never touching the
        // `Mutex<Peer<T>>` that guards the transport itself.
        self.slots
            .iter()
            .filter(|entry| entry.value().status.usable())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn pick_one(&self) -> Result<PeerId> {
        let usable = self.usable_ids();
        usable.choose(&mut thread_rng()).copied().ok_or_else(SprunedError::no_peers)
    }

    pub fn pick_many(&self, k: usize) -> Result<Vec<PeerId>> {
        let mut usable = self.usable_ids();
        if usable.len() < k {
            return Err(SprunedError::no_peers());
        }
        usable.shuffle(&mut thread_rng());
        usable.truncate(k);
        Ok(usable)
    }

    pub async fn peer_handle(&self, id: PeerId) -> Result<Arc<Mutex<Peer<T>>>> {
        self.slots
            .get(&id)
            .map(|slot| slot.peer.clone())
            .ok_or_else(SprunedError::no_peers)
    }

    /// Quorum RPC dispatch, per spec §4.2.
    pub async fn call(&self, method: &str, params: Value, agreement: usize, return_peer: bool) -> Result<(Option<PeerId>, Value)> {
        if return_peer && agreement > 1 {
            return Err(SprunedError::config("return_peer is only valid with agreement=1"));
        }
        debug_assert!(
            agreement <= self.required_connections,
            "agreement must not exceed required_connections"
        );
        if agreement == 0 {
            return Err(SprunedError::config("agreement must be at least 1"));
        }

        if agreement == 1 {
            let id = self.pick_one()?;
            let handle = self.peer_handle(id).await?;
            let mut peer = handle.lock().await;
            let value = peer.rpc(method, params).await?;
            let returned_id = if return_peer { Some(id) } else { None };
            return Ok((returned_id, value));
        }

        let ids = self.pick_many(agreement)?;
        let mut futs = Vec::with_capacity(ids.len());
        for id in &ids {
            let handle = self.peer_handle(*id).await?;
            let method = method.to_owned();
            let params = params.clone();
            futs.push(async move {
                let mut peer = handle.lock().await;
                peer.rpc(&method, params).await
            });
        }
        let responses: Vec<Value> = join_all(futs).await.into_iter().filter_map(Result::ok).collect();
        if responses.len() < agreement {
            return Err(SprunedError::missing_response(format!(
                "requested {} responses, received {}",
                agreement,
                responses.len()
            )));
        }
        let accepted = agreement_rule(&responses, agreement)?;
        Ok((None, accepted))
    }

    /// Every 10s, fill the gap between `required_connections` and the usable peer count.
    pub fn spawn_keepalive(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(KEEPALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                if pool.stopped.load(Ordering::Relaxed) {
                    break;
                }
                let missing = pool.required_connections.saturating_sub(pool.usable_ids().len());
                if missing > 0 {
                    debug!("connection pool: need {} more connections", missing);
                    pool.clone().connect_missing(missing).await;
                }
            }
        });
    }

    /// Listens for `Error` events and applies the peer-error policy of §4.2.
    pub fn spawn_error_handler(self: &Arc<Self>) {
        let pool = self.clone();
        let mut rx = self.events_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let PeerEvent::Error(id, kind) = event {
                    pool.handle_peer_error(id, kind).await;
                }
            }
        });
    }

    async fn handle_peer_error(&self, id: PeerId, _kind: PeerErrorKind) {
        let handle = match self.peer_handle(id).await {
            Ok(h) => h,
            Err(_) => return,
        };
        let mut peer = handle.lock().await;
        if !peer.connected() {
            return;
        }
        if peer.score() <= 0 {
            error!("disconnecting peer {:?}: score exhausted", id);
            peer.disconnect().await;
            return;
        }
        if peer.ping().await.is_none() {
            error!("disconnecting peer {:?}: ping timeout", id);
            peer.disconnect().await;
        }
    }

    fn pick_servers(&self, howmany: usize) -> Result<Vec<A>> {
        if self.servers.is_empty() {
            return Err(SprunedError::no_peers());
        }
        let taken: std::collections::HashSet<String> = self.slots.iter().map(|e| e.value().addr_key.clone()).collect();
        let mut chosen = Vec::new();
        let mut attempts = 0;
        while chosen.len() < howmany {
            attempts += 1;
            if attempts > PICK_RETRY_LIMIT {
                return Err(SprunedError::no_peers());
            }
            let candidate = self.servers.choose(&mut thread_rng()).expect("servers is non-empty");
            let key = candidate.to_string();
            if taken.contains(&key) || chosen.iter().any(|c: &A| c.to_string() == key) {
                continue;
            }
            chosen.push(candidate.clone());
        }
        Ok(chosen)
    }

    pub(crate) async fn connect_missing(self: Arc<Self>, howmany: usize) {
        let servers = match self.pick_servers(howmany) {
            Ok(s) => s,
            Err(_) => {
                error!("connection pool: no servers available to reach required_connections");
                return;
            }
        };
        for addr in servers {
            let pool = self.clone();
            tokio::spawn(async move {
                let id = PeerId(pool.next_id.fetch_add(1, Ordering::Relaxed));
                let transport = pool.factory.build(&addr);
                let peer = Peer::new(id, transport, pool.events_tx.clone());
                let status = peer.status();
                let handle = Arc::new(Mutex::new(peer));
                pool.slots.insert(
                    id,
                    Slot {
                        addr_key: addr.to_string(),
                        status,
                        peer: handle.clone(),
                    },
                );
                let mut peer = handle.lock().await;
                if peer.connect().await.is_ok() {
                    info!("connected to {}", addr);
                } else {
                    pool.slots.remove(&id);
                }
            });
        }
    }
}

/// A response is accepted iff it equals at least `agreement` of the collected responses
/// (strict equality, post-normalisation), per spec §4.2.
fn agreement_rule(responses: &[Value], agreement: usize) -> Result<Value> {
    for candidate in responses {
        let count = responses.iter().filter(|r| *r == candidate).count();
        if count >= agreement {
            return Ok(candidate.clone());
        }
    }
    Err(SprunedError::no_quorum(responses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agreement_rule_accepts_majority() {
        let responses = vec![json!(1), json!(1), json!(2)];
        assert_eq!(agreement_rule(&responses, 2).unwrap(), json!(1));
    }

    #[test]
    fn agreement_rule_rejects_no_majority() {
        let responses = vec![json!(1), json!(2), json!(3)];
        assert!(agreement_rule(&responses, 2).is_err());
    }

    #[test]
    fn agreement_rule_single_response_trivially_agrees_with_itself() {
        let responses = vec![json!("only")];
        assert_eq!(agreement_rule(&responses, 1).unwrap(), json!("only"));
    }
}
