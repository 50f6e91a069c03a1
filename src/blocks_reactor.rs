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
//! # Blocks reactor
//!
//! Retains the last `keep_blocks` block bodies relative to the current tip, fetching each
//! exactly once no matter how many callers want it concurrently (spec §4.4). Grounded on
//! murmel/defiads `node.rs::download_blocks`'s single queue-per-node idea, generalised to a
//! per-hash single-flight map since this crate serves many concurrent callers rather than one
//! dispatcher loop.
//!

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::encode;
use bitcoin::hashes::hex::FromHex;
use bitcoin::BlockHash;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use rand::{thread_rng, Rng};

use crate::error::{Result, SprunedError};
use crate::peer::Transport;
use crate::pool::ConnectionPool;
use crate::repository::Repository;
use crate::types::{Block, RawHeader};

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_JITTER: f64 = 0.2;
const MAX_FETCH_ATTEMPTS: u32 = 8;

#[derive(Clone)]
pub struct BlocksReactorConfig {
    pub keep_blocks: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for BlocksReactorConfig {
    fn default() -> Self {
        BlocksReactorConfig {
            keep_blocks: 50,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: DEFAULT_JITTER,
        }
    }
}

type FetchResult = std::result::Result<(u32, bitcoin::Block), String>;

struct Retained {
    height: u32,
    raw: bitcoin::Block,
}

pub struct BlocksReactor<A, T: Transport> {
    pool: Arc<ConnectionPool<A, T>>,
    repository: Arc<dyn Repository>,
    config: BlocksReactorConfig,
    retained: DashMap<BlockHash, Retained>,
    inflight: DashMap<BlockHash, Shared<BoxFuture<'static, FetchResult>>>,
}

impl<A, T> BlocksReactor<A, T>
where
    A: Clone + Eq + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    pub fn new(pool: Arc<ConnectionPool<A, T>>, repository: Arc<dyn Repository>, config: BlocksReactorConfig) -> Arc<Self> {
        Arc::new(BlocksReactor {
            pool,
            repository,
            config,
            retained: DashMap::new(),
            inflight: DashMap::new(),
        })
    }

    /// Fetches the body for `hash`. Concurrent calls for the same hash share one upstream
    /// request (testable property #5): the second caller in finds the first's in-flight
    /// `Shared` future already registered and awaits that instead of dialing again.
    pub async fn fetch(&self, hash: BlockHash) -> Result<Block> {
        if let Some(cached) = self.retained.get(&hash).map(|r| (r.height, r.raw.clone())) {
            return Ok(self.project(hash, cached.0, &cached.1).await);
        }

        let shared = self
            .inflight
            .entry(hash)
            .or_insert_with(|| {
                let pool = self.pool.clone();
                let repository = self.repository.clone();
                let config = self.config.clone();
                async move { fetch_with_backoff(pool, repository, hash, config).await }
                    .boxed()
                    .shared()
            })
            .clone();

        let result = shared.await;
        self.inflight.remove(&hash);
        match result {
            Ok((height, raw)) => {
                let block = self.project(hash, height, &raw).await;
                self.retained.insert(hash, Retained { height, raw });
                Ok(block)
            }
            Err(message) => Err(SprunedError::transport(message)),
        }
    }

    /// Schedules a background fetch of the new tip and evicts anything below the retention
    /// floor. Does not block the headers reactor's apply path on a block download.
    pub fn on_new_tip(self: &Arc<Self>, tip_height: u32, tip_hash: BlockHash) {
        self.evict_below(tip_height);
        let reactor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reactor.fetch(tip_hash).await {
                warn!("block fetch for new tip {} failed: {}", tip_hash, e);
            }
        });
    }

    /// Drops any in-flight registration for a header that a reorg just rolled back. The
    /// upstream request already dispatched is not aborted, only disowned: the next caller for
    /// that hash (if any) will start a fresh fetch rather than share a result nobody wants.
    pub fn cancel(&self, hash: &BlockHash) {
        self.inflight.remove(hash);
    }

    fn evict_below(&self, tip_height: u32) {
        let floor = tip_height.saturating_sub(self.config.keep_blocks);
        self.retained.retain(|_, r| r.height >= floor);
    }

    async fn project(&self, hash: BlockHash, height: u32, raw: &bitcoin::Block) -> Block {
        let tip_height = self.repository.tip_height().await.unwrap_or(height);
        let confirmations = (tip_height as i64 - height as i64 + 1).max(0);
        let time = self.repository.at_height(height).await.map(|h| h.header.time).unwrap_or(raw.header.time);
        Block {
            hash,
            header: RawHeader::from(raw.header),
            txids: raw.txdata.iter().map(|tx| tx.txid()).collect(),
            size: encode::serialize(raw).len() as u32,
            txs: None,
            confirmations,
            time,
            mediantime: None,
        }
    }
}

async fn fetch_block_once<A, T>(pool: &Arc<ConnectionPool<A, T>>, repository: &Arc<dyn Repository>, hash: BlockHash) -> Result<(u32, bitcoin::Block)>
where
    A: Clone + Eq + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    let height = repository
        .by_hash(&hash)
        .await
        .map(|h| h.height)
        .ok_or_else(|| SprunedError::validation(format!("fetch requested for header {} not in the local chain", hash)))?;
    let params = serde_json::to_value(hash).map_err(|e| SprunedError::transport(e.to_string()))?;
    let (_peer, value) = pool.call("getblock", params, 1, true).await?;
    let hex: String = serde_json::from_value(value).map_err(|e| SprunedError::transport(e.to_string()))?;
    let bytes = Vec::<u8>::from_hex(&hex).map_err(|e| SprunedError::transport(e.to_string()))?;
    let block: bitcoin::Block = encode::deserialize(&bytes).map_err(|e| SprunedError::transport(e.to_string()))?;
    Ok((height, block))
}

async fn fetch_with_backoff<A, T>(pool: Arc<ConnectionPool<A, T>>, repository: Arc<dyn Repository>, hash: BlockHash, config: BlocksReactorConfig) -> FetchResult
where
    A: Clone + Eq + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    let mut attempt = 0u32;
    loop {
        match fetch_block_once(&pool, &repository, hash).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_FETCH_ATTEMPTS {
                    return Err(e.to_string());
                }
                let wait = backoff_duration(attempt, &config);
                debug!("block fetch for {} failed (attempt {}), retrying in {:?}: {}", hash, attempt, wait, e);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Exponential backoff, base 1s, cap 60s, +/-20% jitter, per spec §4.4.
fn backoff_duration(attempt: u32, config: &BlocksReactorConfig) -> Duration {
    let exp = config.base_backoff.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let capped = exp.min(config.max_backoff.as_secs_f64());
    let jitter = thread_rng().gen_range(-config.jitter, config.jitter);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemRepository;
    use crate::types::Header;
    use async_trait::async_trait;
    use bitcoin::{Block as RawBlock, BlockHeader, TxMerkleNode};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    #[test]
    fn backoff_respects_cap_with_jitter() {
        let config = BlocksReactorConfig::default();
        for attempt in 1..10 {
            let d = backoff_duration(attempt, &config);
            assert!(d <= config.max_backoff + config.max_backoff.mul_f64(config.jitter));
        }
    }

    struct CountingTransport {
        calls: Arc<AtomicU32>,
        block: RawBlock,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn connect(&mut self) -> Result<String> {
            Ok("stub".to_owned())
        }

        async fn rpc(&mut self, method: &str, _params: Value) -> Result<Value> {
            assert_eq!(method, "getblock");
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(serde_json::json!(encode::serialize_hex(&self.block)))
        }

        async fn subscribe(&mut self, _channel: &str) -> Result<(Value, broadcast::Receiver<Value>)> {
            let (_tx, rx) = broadcast::channel(1);
            Ok((Value::Null, rx))
        }

        async fn disconnect(&mut self) {}
    }

    fn sample_block() -> RawBlock {
        let header = BlockHeader {
            version: 1,
            prev_blockhash: BlockHash::default(),
            merkle_root: TxMerkleNode::default(),
            time: 0,
            bits: 0x207fffff,
            nonce: 0,
        };
        RawBlock { header, txdata: Vec::new() }
    }

    #[tokio::test]
    async fn concurrent_fetches_for_the_same_hash_share_one_upstream_request() {
        let block = sample_block();
        let hash = block.block_hash();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_factory = calls.clone();
        let block_for_factory = block.clone();
        let pool = ConnectionPool::new(vec!["stub".to_owned()], 1, move |_addr: &String| CountingTransport {
            calls: calls_for_factory.clone(),
            block: block_for_factory.clone(),
        });
        pool.clone().connect_missing(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let repo: Arc<dyn Repository> = Arc::new(MemRepository::new());
        repo.append(Header {
            height: 0,
            header: block.header,
            chainwork: block.header.work(),
        })
        .await
        .unwrap();

        let reactor = BlocksReactor::new(pool, repo, BlocksReactorConfig::default());
        let (a, b) = tokio::join!(reactor.fetch(hash), reactor.fetch(hash));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
