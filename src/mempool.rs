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
//! # Mempool observer (external collaborator, interface only)
//!
//! Tracks pending transactions announced over `inv`/`tx` so `estimatefee` and future
//! mempool-aware RPCs have a feed to read from (spec §4.9). `mempool_size == 0` disables
//! tracking entirely rather than running a zero-capacity cache that churns on every `observe`.
//!

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bitcoin::Txid;
use tokio::sync::Mutex;

#[async_trait]
pub trait MempoolObserver: Send + Sync {
    /// Records a transaction seen via `inv`/`tx`. `raw` carries the transaction body when the
    /// peer followed up with one; an `inv`-only sighting passes `None`.
    async fn observe(&self, txid: Txid, raw: Option<Vec<u8>>);

    async fn forget(&self, txid: &Txid);

    async fn contains(&self, txid: &Txid) -> bool;

    async fn len(&self) -> usize;

    /// Placeholder fee estimate for `target_blocks` confirmation; `None` until a real
    /// fee-bucketing strategy is wired in. Out of scope per §4.9: this observer is a feed, not
    /// an estimator.
    async fn estimate_fee(&self, target_blocks: u32) -> Option<f64>;
}

struct BoundedInner {
    order: VecDeque<Txid>,
    raw: HashMap<Txid, Option<Vec<u8>>>,
}

/// Bounded FIFO tracker: past `capacity` entries, the oldest sighting is evicted to make room
/// for the newest, mirroring how a real mempool ages out low-fee transactions under pressure
/// without this crate needing to model fees to do it.
pub struct BoundedMempool {
    capacity: usize,
    inner: Mutex<BoundedInner>,
}

impl BoundedMempool {
    pub fn new(capacity: usize) -> Self {
        BoundedMempool {
            capacity,
            inner: Mutex::new(BoundedInner {
                order: VecDeque::new(),
                raw: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl MempoolObserver for BoundedMempool {
    async fn observe(&self, txid: Txid, raw: Option<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.raw.contains_key(&txid) {
            inner.raw.insert(txid, raw);
            return;
        }
        while inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.raw.remove(&oldest);
            }
        }
        inner.order.push_back(txid);
        inner.raw.insert(txid, raw);
    }

    async fn forget(&self, txid: &Txid) {
        let mut inner = self.inner.lock().await;
        inner.raw.remove(txid);
        inner.order.retain(|t| t != txid);
    }

    async fn contains(&self, txid: &Txid) -> bool {
        self.inner.lock().await.raw.contains_key(txid)
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    async fn estimate_fee(&self, _target_blocks: u32) -> Option<f64> {
        None
    }
}

/// Used when `mempool_size == 0`: every observation is dropped, membership checks always miss.
pub struct DisabledMempool;

#[async_trait]
impl MempoolObserver for DisabledMempool {
    async fn observe(&self, _txid: Txid, _raw: Option<Vec<u8>>) {}

    async fn forget(&self, _txid: &Txid) {}

    async fn contains(&self, _txid: &Txid) -> bool {
        false
    }

    async fn len(&self) -> usize {
        0
    }

    async fn estimate_fee(&self, _target_blocks: u32) -> Option<f64> {
        None
    }
}

pub fn build(mempool_size: usize) -> Box<dyn MempoolObserver> {
    if mempool_size == 0 {
        Box::new(DisabledMempool)
    } else {
        Box::new(BoundedMempool::new(mempool_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(byte: u8) -> Txid {
        use bitcoin::hashes::Hash;
        Txid::from_slice(&[byte; 32]).unwrap()
    }

    #[tokio::test]
    async fn bounded_mempool_evicts_oldest_past_capacity() {
        let mempool = BoundedMempool::new(2);
        mempool.observe(txid(1), None).await;
        mempool.observe(txid(2), None).await;
        mempool.observe(txid(3), None).await;

        assert_eq!(mempool.len().await, 2);
        assert!(!mempool.contains(&txid(1)).await);
        assert!(mempool.contains(&txid(2)).await);
        assert!(mempool.contains(&txid(3)).await);
    }

    #[tokio::test]
    async fn forget_removes_an_entry_without_disturbing_others() {
        let mempool = BoundedMempool::new(4);
        mempool.observe(txid(1), None).await;
        mempool.observe(txid(2), None).await;
        mempool.forget(&txid(1)).await;

        assert!(!mempool.contains(&txid(1)).await);
        assert!(mempool.contains(&txid(2)).await);
        assert_eq!(mempool.len().await, 1);
    }

    #[tokio::test]
    async fn disabled_mempool_tracks_nothing() {
        let mempool = build(0);
        mempool.observe(txid(1), None).await;
        assert!(!mempool.contains(&txid(1)).await);
        assert_eq!(mempool.len().await, 0);
    }

    #[tokio::test]
    async fn nonzero_capacity_via_build_selects_bounded_backend() {
        let mempool = build(5);
        mempool.observe(txid(9), Some(vec![1, 2, 3])).await;
        assert!(mempool.contains(&txid(9)).await);
    }
}
