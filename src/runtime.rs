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
//! # Runtime
//!
//! Assembles every component from a `Config` in the explicit order spec §4.11 requires:
//! repository/cache, then pools, then reactors, then the aggregation service, then the RPC
//! contract. Nothing here is constructed at module load time; generalises murmel's
//! `constructor.rs::Constructor`, trading its mio/futures-preview thread pool for `tokio` tasks
//! spawned by the pools and reactors themselves.
//!

use std::net::SocketAddr;
use std::sync::Arc;

use crate::aggregation::AggregationService;
use crate::blocks_reactor::{BlocksReactor, BlocksReactorConfig};
use crate::cache::{CacheAgent, FileCacheAgent, MemCacheAgent};
use crate::config::Config;
use crate::electrum_wire::ElectrumTransport;
use crate::error::Result;
use crate::headers_reactor::{HeaderEvent, HeaderSyncConfig, HeadersReactor};
use crate::mempool::{self, MempoolObserver};
use crate::p2p_wire::{BitcoinP2PConfig, BitcoinP2PTransport};
use crate::pool::ConnectionPool;
use crate::repository::{MemRepository, Repository};
use crate::rpc_api::SprunedRpcApi;
use crate::types::ServerAddr;
use crate::zmq_publisher::{self, ZmqPublisher};

/// Forwards header chain events into the blocks reactor (§4.4: tip advance schedules a fetch,
/// rollback cancels any in-flight one for that header) for as long as both reactors live.
fn spawn_tip_forwarder<A, T>(headers: Arc<HeadersReactor<A, T>>, blocks: Arc<crate::blocks_reactor::BlocksReactor<A, T>>)
where
    A: Clone + Eq + std::fmt::Display + Send + Sync + 'static,
    T: crate::peer::Transport,
{
    let mut events = headers.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HeaderEvent::Apply(header) => blocks.on_new_tip(header.height, header.hash()),
                HeaderEvent::Rollback(header) => blocks.cancel(&header.hash()),
            }
        }
    });
}

/// Everything a running node needs, wired together. Held behind `Arc` so reactors' background
/// tasks and the embedder's RPC/HTTP layer can share it.
pub struct Runtime {
    p2p_pool: Arc<ConnectionPool<SocketAddr, BitcoinP2PTransport>>,
    electrum_pool: Option<Arc<ConnectionPool<ServerAddr, ElectrumTransport>>>,
    repository: Arc<dyn Repository>,
    headers: Arc<HeadersReactor<SocketAddr, BitcoinP2PTransport>>,
    blocks: Arc<BlocksReactor<SocketAddr, BitcoinP2PTransport>>,
    aggregation: Arc<AggregationService>,
    mempool: Arc<dyn MempoolObserver>,
    zmq: Arc<dyn ZmqPublisher>,
    cache: Arc<dyn CacheAgent>,
    rpc: Arc<SprunedRpcApi<SocketAddr, BitcoinP2PTransport>>,
}

impl Runtime {
    /// Builds every component in the order spec §4.11 fixes: repository and cache first (pure
    /// storage, no I/O yet), then the connection pools, then the reactors that drive them, then
    /// the aggregation service, and finally the RPC contract that ties them together. No
    /// concrete `UpstreamService` backend ships in this crate (§4.5/§6 treat Electrum- and
    /// HTTP-sourced aggregation services as external collaborators); embedders add theirs to
    /// the returned `Runtime::aggregation()` handle via `add_service`/`add_primary_service`.
    pub async fn build(config: Config) -> Result<Arc<Runtime>> {
        let repository: Arc<dyn Repository> = Arc::new(MemRepository::new());

        // An explicitly blank `data_dir` opts into the in-memory cache; otherwise the durable
        // file backend is used, sized by disk rather than `cache_size_bytes` (the on-disk
        // layout has no single-process byte budget to enforce).
        let cache: Arc<dyn CacheAgent> = if config.data_dir.is_empty() {
            Arc::new(MemCacheAgent::new(config.cache_size_bytes))
        } else {
            Arc::new(FileCacheAgent::new(config.data_dir.clone())?)
        };

        let network: bitcoin::Network = config.network.into();

        let p2p_config = BitcoinP2PConfig {
            network,
            user_agent: format!("/spruned:{}/", env!("CARGO_PKG_VERSION")),
            start_height: 0,
        };
        let p2p_pool = ConnectionPool::new(config.p2p_peers.clone(), config.required_connections, move |addr: &SocketAddr| {
            BitcoinP2PTransport::new(*addr, p2p_config.clone())
        });
        p2p_pool.spawn_keepalive();
        p2p_pool.spawn_error_handler();

        let electrum_pool = if config.electrum_servers.is_empty() {
            None
        } else {
            let pool = ConnectionPool::new(
                config.electrum_servers.clone(),
                config.required_connections,
                |server: &ServerAddr| ElectrumTransport::new(server.clone()),
            );
            pool.spawn_keepalive();
            pool.spawn_error_handler();
            Some(pool)
        };

        let headers = HeadersReactor::new(p2p_pool.clone(), repository.clone(), HeaderSyncConfig::default());
        headers.ensure_genesis(bitcoin::blockdata::constants::genesis_block(network).header).await?;
        headers.spawn();

        let blocks = BlocksReactor::new(
            p2p_pool.clone(),
            repository.clone(),
            BlocksReactorConfig {
                keep_blocks: config.keep_blocks,
                ..BlocksReactorConfig::default()
            },
        );

        spawn_tip_forwarder(headers.clone(), blocks.clone());

        let aggregation = Arc::new(AggregationService::new(cache.clone(), config.min_sources));

        let mempool: Arc<dyn MempoolObserver> = Arc::from(mempool::build(config.mempool_size));
        let zmq: Arc<dyn ZmqPublisher> = Arc::from(zmq_publisher::build(config.zmq_enabled)?);

        let rpc = Arc::new(SprunedRpcApi::new(aggregation.clone(), headers.clone(), p2p_pool.clone(), mempool.clone()));

        Ok(Arc::new(Runtime {
            p2p_pool,
            electrum_pool,
            repository,
            headers,
            blocks,
            aggregation,
            mempool,
            zmq,
            cache,
            rpc,
        }))
    }

    pub fn rpc(&self) -> Arc<SprunedRpcApi<SocketAddr, BitcoinP2PTransport>> {
        self.rpc.clone()
    }

    pub fn aggregation(&self) -> Arc<AggregationService> {
        self.aggregation.clone()
    }

    pub fn blocks(&self) -> Arc<BlocksReactor<SocketAddr, BitcoinP2PTransport>> {
        self.blocks.clone()
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.repository.clone()
    }

    pub fn mempool(&self) -> Arc<dyn MempoolObserver> {
        self.mempool.clone()
    }

    pub fn zmq(&self) -> Arc<dyn ZmqPublisher> {
        self.zmq.clone()
    }

    pub fn cache(&self) -> Arc<dyn CacheAgent> {
        self.cache.clone()
    }

    /// Explicit shutdown order (§4.11): stop RPC acceptance (owned by the embedder's HTTP
    /// listener, not this crate) happens before this is called; next, stop the reactors so no
    /// new repository writes start, then the pools so in-flight RPCs finish or time out
    /// naturally rather than being preempted (§5), then flush the cache. Both reference cache
    /// backends are synchronous write-through, so that last step is a no-op here; a
    /// write-behind backend would hook in at this point.
    pub fn shutdown(&self) {
        self.headers.stop();
        self.p2p_pool.stop();
        if let Some(pool) = &self.electrum_pool {
            pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_str(
            r#"
                data_dir = ""
                p2p_peers = ["127.0.0.1:1"]
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn builds_every_component_and_seeds_the_genesis_header() {
        let runtime = Runtime::build(test_config()).await.unwrap();
        assert_eq!(runtime.repository().tip_height().await, Some(0));
        runtime.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let runtime = Runtime::build(test_config()).await.unwrap();
        runtime.shutdown();
        runtime.shutdown();
    }
}
