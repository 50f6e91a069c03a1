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
//! # Repository
//!
//! Persists the header chain. The only writer is the headers reactor; everything else reads.
//! No storage engine is specified by this crate: `MemRepository` is a reference
//! implementation good enough for tests and for running without an on-disk backend.
//!

use async_trait::async_trait;
use bitcoin::BlockHash;
use tokio::sync::RwLock;

use crate::error::{Result, SprunedError};
use crate::types::{Header, HeaderChain};

#[async_trait]
pub trait Repository: Send + Sync {
    /// Appends a header that must extend the current tip by exactly one height.
    async fn append(&self, header: Header) -> Result<()>;

    /// Rolls the chain back so `new_tip_height` becomes the new tip, returning the removed
    /// headers in descending height order.
    async fn rollback_to(&self, new_tip_height: u32) -> Result<Vec<Header>>;

    async fn tip(&self) -> Option<Header>;

    async fn tip_height(&self) -> Option<u32>;

    async fn at_height(&self, height: u32) -> Option<Header>;

    async fn by_hash(&self, hash: &BlockHash) -> Option<Header>;

    /// The last `n` headers, used to build a P2P locator back `SAFETY` blocks.
    async fn tail(&self, n: u32) -> Vec<Header>;
}

/// In-memory reference implementation: reactor tests and the degraded fallback when no
/// on-disk backend is configured (§4.7).
pub struct MemRepository {
    chain: RwLock<HeaderChain>,
}

impl MemRepository {
    pub fn new() -> Self {
        MemRepository {
            chain: RwLock::new(HeaderChain::new()),
        }
    }
}

impl Default for MemRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemRepository {
    async fn append(&self, header: Header) -> Result<()> {
        self.chain
            .write()
            .await
            .push(header)
            .map_err(SprunedError::repository)
    }

    async fn rollback_to(&self, new_tip_height: u32) -> Result<Vec<Header>> {
        Ok(self.chain.write().await.rollback_to(new_tip_height))
    }

    async fn tip(&self) -> Option<Header> {
        self.chain.read().await.tip().copied()
    }

    async fn tip_height(&self) -> Option<u32> {
        self.chain.read().await.tip_height()
    }

    async fn at_height(&self, height: u32) -> Option<Header> {
        self.chain.read().await.at_height(height).copied()
    }

    async fn by_hash(&self, hash: &BlockHash) -> Option<Header> {
        self.chain.read().await.by_hash(hash).copied()
    }

    async fn tail(&self, n: u32) -> Vec<Header> {
        self.chain.read().await.tail(n).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::util::uint::Uint256;
    use bitcoin::{BlockHeader, TxMerkleNode};

    fn header(height: u32, prev: BlockHash) -> Header {
        Header {
            height,
            header: BlockHeader {
                version: 1,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::default(),
                time: height,
                bits: 0x207fffff,
                nonce: 0,
            },
            chainwork: Uint256::from_u64(height as u64).unwrap(),
        }
    }

    #[tokio::test]
    async fn append_then_rollback_restores_prior_tip() {
        let repo = MemRepository::new();
        let genesis = header(0, BlockHash::default());
        repo.append(genesis).await.unwrap();
        let h1 = header(1, genesis.hash());
        repo.append(h1).await.unwrap();
        let h2 = header(2, h1.hash());
        repo.append(h2).await.unwrap();

        let removed = repo.rollback_to(1).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].height, 2);
        assert_eq!(repo.tip_height().await, Some(1));
    }

    #[tokio::test]
    async fn by_hash_resolves_appended_header() {
        let repo = MemRepository::new();
        let genesis = header(0, BlockHash::default());
        repo.append(genesis).await.unwrap();
        assert_eq!(repo.by_hash(&genesis.hash()).await.map(|h| h.height), Some(0));
    }
}
