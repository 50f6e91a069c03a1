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
//! # ZMQ publisher (external collaborator, interface only)
//!
//! `hashblock`/`hashtx` notification fan-out for confirmed headers and transactions. The wire
//! encoding and socket management are out of scope (spec §4.8); this module only fixes the
//! contract `HeadersReactor` and `AggregationService` publish through, plus a no-op
//! implementation usable when `zmq_enabled = false`.
//!

use async_trait::async_trait;
use bitcoin::{BlockHash, Txid};

use crate::error::Result;

#[async_trait]
pub trait ZmqPublisher: Send + Sync {
    async fn publish_hashblock(&self, hash: BlockHash);

    async fn publish_hashtx(&self, txid: Txid);
}

/// Used when `zmq_enabled = false`, or as the default until a real socket-backed publisher is
/// wired in by the embedder.
pub struct NoopZmqPublisher;

#[async_trait]
impl ZmqPublisher for NoopZmqPublisher {
    async fn publish_hashblock(&self, _hash: BlockHash) {}

    async fn publish_hashtx(&self, _txid: Txid) {}
}

/// Constructs the configured publisher. Only the no-op backend lives in this crate; a real ZMQ
/// socket backend is an external collaborator per §4.8.
pub fn build(zmq_enabled: bool) -> Result<Box<dyn ZmqPublisher>> {
    let _ = zmq_enabled;
    Ok(Box::new(NoopZmqPublisher))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_publisher_accepts_every_notification() {
        let publisher = NoopZmqPublisher;
        publisher.publish_hashblock(BlockHash::default()).await;
        publisher.publish_hashtx(Txid::default()).await;
    }
}
