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
//! # Peer
//!
//! One bidirectional link to a remote, scored and state-machined the same way whether the
//! remote speaks Bitcoin P2P or Electrum. Transport-specific framing lives behind the
//! `Transport` trait in `p2p_wire.rs` / `electrum_wire.rs`; this module owns only scoring,
//! state transitions and event fan-out.
//!

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::error::{Result, SprunedError};
use crate::types::Header;

/// Initial and ceiling score a fresh peer starts with.
pub const START_SCORE: i32 = 10;
/// Default per-call RPC deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// Default liveness-probe deadline.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Opaque identifier handed out by a `ConnectionPool`; reactors hold these, never a `Peer`
/// reference, so peers never outlive the pool that owns them (§9 "Shared peer ownership").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// The peer state machine: `New -> Connecting -> Connected <-> Errored -> Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Errored,
    Closed,
}

/// Events a `Peer` fans out, replacing the heterogeneous callback lists of the source
/// program with one typed enum over a broadcast channel (§9 "Callback fan-out").
#[derive(Clone, Debug)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Header(PeerId, Header),
    Peers(PeerId, Vec<std::net::SocketAddr>),
    Error(PeerId, PeerErrorKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerErrorKind {
    Transport,
    Timeout,
    Protocol,
}

/// What a concrete wire protocol must provide so `Peer` can drive it generically.
///
/// Implemented by `p2p_wire::BitcoinP2PTransport` and `electrum_wire::ElectrumTransport`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the connection and performs the protocol handshake, returning the peer's
    /// self-reported protocol/software version string.
    async fn connect(&mut self) -> Result<String>;

    /// One request/response round trip, pre-serialised to/from `serde_json::Value` so the
    /// pool and reactors do not need to know which wire protocol is underneath.
    async fn rpc(&mut self, method: &str, params: Value) -> Result<Value>;

    /// Installs a subscription; the first value is the initial state, subsequent values are
    /// delivered on `updates`.
    async fn subscribe(&mut self, channel: &str) -> Result<(Value, broadcast::Receiver<Value>)>;

    /// Best-effort close. Must not panic if already closed.
    async fn disconnect(&mut self);
}

/// The lock-free slice of a peer's state: score and connection state, shared between the
/// `Peer` itself and any pool that wants to snapshot usability without contending on the
/// transport lock (§5 "the pool's connection list ... callers ... take a snapshot").
#[derive(Default)]
pub struct PeerStatus {
    score: AtomicI32,
    state: std::sync::Mutex<PeerStateCell>,
    last_seen: AtomicU64,
}

struct PeerStateCell(PeerState);

impl Default for PeerStateCell {
    fn default() -> Self {
        PeerStateCell(PeerState::New)
    }
}

impl PeerStatus {
    pub fn score(&self) -> i32 {
        self.score.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PeerState {
        self.state.lock().expect("peer state lock poisoned").0
    }

    /// True for `Connected` and `Errored`: both represent a live transport, just as the
    /// source program tracks `connected` as a boolean independent of pending errors.
    pub fn connected(&self) -> bool {
        matches!(self.state(), PeerState::Connected | PeerState::Errored)
    }

    /// `connected ∧ score > 0`, exactly as defined in spec §3.
    pub fn usable(&self) -> bool {
        self.connected() && self.score() > 0
    }
}

/// One connection to a remote peer: scoring, state, and the generic request/subscribe API
/// described in spec §4.1.
pub struct Peer<T: Transport> {
    id: PeerId,
    transport: T,
    status: Arc<PeerStatus>,
    events: broadcast::Sender<PeerEvent>,
}

impl<T: Transport> Peer<T> {
    pub fn new(id: PeerId, transport: T, events: broadcast::Sender<PeerEvent>) -> Self {
        Peer {
            id,
            transport,
            status: Arc::new(PeerStatus {
                score: AtomicI32::new(START_SCORE),
                state: std::sync::Mutex::new(PeerStateCell(PeerState::New)),
                last_seen: AtomicU64::new(0),
            }),
            events,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// A cheap, clonable handle to this peer's score/state, independent of whatever lock
    /// guards the `Peer` itself.
    pub fn status(&self) -> Arc<PeerStatus> {
        self.status.clone()
    }

    pub fn score(&self) -> i32 {
        self.status.score()
    }

    pub fn state(&self) -> PeerState {
        self.status.state()
    }

    pub fn connected(&self) -> bool {
        self.status.connected()
    }

    pub fn usable(&self) -> bool {
        self.status.usable()
    }

    fn set_state(&self, state: PeerState) {
        self.status.state.lock().expect("peer state lock poisoned").0 = state;
    }

    /// Penalises a peer for protocol-level misbehaviour that isn't a transport/timeout
    /// error (e.g. a divergent header chain, a reorg proposal rejected as too deep):
    /// other `Peer` methods already decrement score around their own error paths, this is
    /// the entry point for callers that observed the problem one layer up.
    pub fn penalize(&self, by: i32) {
        self.decrement_score(by);
    }

    /// Score never goes negative (the spec's Open Question, resolved at `score >= 0`,
    /// disconnect happens the instant it reads 0).
    fn decrement_score(&self, by: i32) -> i32 {
        loop {
            let current = self.status.score.load(Ordering::Relaxed);
            let next = (current - by).max(0);
            if self
                .status
                .score
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        // A broadcast send fails only when there are no receivers; that is not an error here.
        let _ = self.events.send(event);
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.set_state(PeerState::Connecting);
        match self.transport.connect().await {
            Ok(_version) => {
                self.set_state(PeerState::Connected);
                self.emit(PeerEvent::Connected(self.id));
                Ok(())
            }
            Err(e) => {
                self.decrement_score(4);
                self.set_state(PeerState::Closed);
                self.emit(PeerEvent::Error(self.id, PeerErrorKind::Transport));
                Err(e)
            }
        }
    }

    pub async fn rpc(&mut self, method: &str, params: Value) -> Result<Value> {
        match timeout(DEFAULT_RPC_TIMEOUT, self.transport.rpc(method, params)).await {
            Ok(Ok(value)) => {
                if self.state() == PeerState::Errored {
                    self.set_state(PeerState::Connected);
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                self.decrement_score(1);
                self.set_state(PeerState::Errored);
                self.emit(PeerEvent::Error(self.id, PeerErrorKind::Transport));
                Err(e)
            }
            Err(_elapsed) => {
                self.decrement_score(1);
                self.set_state(PeerState::Errored);
                self.emit(PeerEvent::Error(self.id, PeerErrorKind::Timeout));
                Err(SprunedError::timeout(format!("{} timed out on peer {:?}", method, self.id)))
            }
        }
    }

    pub async fn subscribe(&mut self, channel: &str) -> Result<(Value, broadcast::Receiver<Value>)> {
        match self.transport.subscribe(channel).await {
            Ok(r) => Ok(r),
            Err(e) => {
                self.decrement_score(1);
                self.set_state(PeerState::Errored);
                self.emit(PeerEvent::Error(self.id, PeerErrorKind::Transport));
                Err(e)
            }
        }
    }

    pub async fn ping(&mut self) -> Option<Duration> {
        let start = std::time::Instant::now();
        match timeout(DEFAULT_PING_TIMEOUT, self.transport.rpc("ping", Value::Null)).await {
            Ok(Ok(_)) => Some(start.elapsed()),
            _ => None,
        }
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.set_state(PeerState::Closed);
        self.emit(PeerEvent::Disconnected(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FlakyTransport {
        fail_connect: bool,
        fail_rpc_times: Arc<AtomicI32>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&mut self) -> Result<String> {
            if self.fail_connect {
                Err(SprunedError::transport("refused"))
            } else {
                Ok("1.0".to_owned())
            }
        }

        async fn rpc(&mut self, _method: &str, _params: Value) -> Result<Value> {
            let remaining = self.fail_rpc_times.load(Ordering::Relaxed);
            if remaining > 0 {
                self.fail_rpc_times.store(remaining - 1, Ordering::Relaxed);
                Err(SprunedError::transport("flaky"))
            } else {
                Ok(Value::Bool(true))
            }
        }

        async fn subscribe(&mut self, _channel: &str) -> Result<(Value, broadcast::Receiver<Value>)> {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx;
            Ok((Value::Null, rx))
        }

        async fn disconnect(&mut self) {}
    }

    fn peer(fail_connect: bool, fail_rpc_times: i32) -> Peer<FlakyTransport> {
        let (tx, _rx) = broadcast::channel(16);
        Peer::new(
            PeerId(1),
            FlakyTransport {
                fail_connect,
                fail_rpc_times: Arc::new(AtomicI32::new(fail_rpc_times)),
            },
            tx,
        )
    }

    #[tokio::test]
    async fn connect_failure_decrements_score_by_four() {
        let mut p = peer(true, 0);
        assert!(p.connect().await.is_err());
        assert_eq!(p.score(), START_SCORE - 4);
        assert_eq!(p.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn rpc_timeouts_decrement_score_by_one_and_stay_usable() {
        let mut p = peer(false, 2);
        p.connect().await.unwrap();
        assert!(p.rpc("getinfo", Value::Null).await.is_err());
        assert_eq!(p.score(), START_SCORE - 1);
        assert!(p.usable()); // Errored still counts as connected, score still positive
        assert!(p.rpc("getinfo", Value::Null).await.is_err());
        assert_eq!(p.score(), START_SCORE - 2);
        assert!(p.rpc("getinfo", Value::Null).await.is_ok());
        assert!(p.usable());
    }

    #[tokio::test]
    async fn score_never_goes_negative() {
        let mut p = peer(false, 100);
        p.connect().await.unwrap();
        for _ in 0..20 {
            let _ = p.rpc("getinfo", Value::Null).await;
        }
        assert_eq!(p.score(), 0);
    }
}
