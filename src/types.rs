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
//! # Data model
//!
//! Plain, serializable shapes shared by every component. Nothing here owns I/O.
//!

use std::collections::HashMap;
use std::net::SocketAddr;

use bitcoin::hash_types::{BlockHash, Txid};
use bitcoin::util::uint::Uint256;
use bitcoin::BlockHeader;
use serde_derive::{Deserialize, Serialize};

/// One block header plus the height it was accepted at.
///
/// `hash` is never stored independent of `header`: it is always `header.block_hash()`,
/// computed on demand rather than cached, so the invariant in the specification
/// (`hash` is derived deterministically from the other fields) cannot be violated by
/// construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub height: u32,
    pub header: BlockHeader,
    pub chainwork: Uint256,
}

impl Header {
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_blockhash
    }
}

/// An ordered, contiguous run of headers from height 0 to `tip`, indexed both ways.
///
/// Invariants upheld by every mutating method: at most one header per height, contiguous
/// from 0, and `chain[h].prev_hash() == chain[h-1].hash()` for every `h > 0`.
#[derive(Default)]
pub struct HeaderChain {
    by_height: Vec<Header>,
    by_hash: HashMap<BlockHash, u32>,
}

impl HeaderChain {
    pub fn new() -> Self {
        HeaderChain {
            by_height: Vec::new(),
            by_hash: HashMap::new(),
        }
    }

    pub fn tip(&self) -> Option<&Header> {
        self.by_height.last()
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.tip().map(|h| h.height)
    }

    pub fn at_height(&self, height: u32) -> Option<&Header> {
        self.by_height.get(height as usize)
    }

    pub fn by_hash(&self, hash: &BlockHash) -> Option<&Header> {
        self.by_hash.get(hash).and_then(|h| self.at_height(*h))
    }

    pub fn contains_hash(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Appends a header that must extend the current tip by exactly one height.
    ///
    /// Callers (the headers reactor) are responsible for having already validated PoW and
    /// linkage; this only enforces the structural invariant.
    pub fn push(&mut self, header: Header) -> Result<(), String> {
        match self.tip() {
            None => {
                if header.height != 0 {
                    return Err(format!("first header must be height 0, got {}", header.height));
                }
            }
            Some(tip) => {
                if header.height != tip.height + 1 {
                    return Err(format!(
                        "header height {} does not extend tip height {}",
                        header.height, tip.height
                    ));
                }
                if header.prev_hash() != tip.hash() {
                    return Err(format!(
                        "header prev_hash {} does not match tip hash {}",
                        header.prev_hash(),
                        tip.hash()
                    ));
                }
            }
        }
        let height = header.height;
        let hash = header.hash();
        self.by_height.push(header);
        self.by_hash.insert(hash, height);
        Ok(())
    }

    /// Rolls the chain back so that `new_tip_height` becomes the new tip, returning the
    /// removed headers in descending height order (the order rollback callbacks must fire in).
    pub fn rollback_to(&mut self, new_tip_height: u32) -> Vec<Header> {
        let mut removed = Vec::new();
        while let Some(tip) = self.tip() {
            if tip.height <= new_tip_height {
                break;
            }
            let header = self.by_height.pop().expect("tip exists");
            self.by_hash.remove(&header.hash());
            removed.push(header);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }

    /// The last `n` headers, used to build a locator back SAFETY blocks.
    pub fn tail(&self, n: u32) -> &[Header] {
        let len = self.by_height.len();
        let start = len.saturating_sub(n as usize);
        &self.by_height[start..]
    }
}

/// A block body as returned to callers: canonical-order txids, optional full transactions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub hash: BlockHash,
    pub header: RawHeader,
    pub txids: Vec<Txid>,
    pub size: u32,
    pub txs: Option<Vec<RawTransaction>>,
    pub confirmations: i64,
    pub time: u32,
    pub mediantime: Option<u32>,
}

/// `bitcoin::BlockHeader` is not `Serialize`; this is the wire-stable projection cached
/// and returned over JSON-RPC.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RawHeader {
    pub version: i32,
    pub prev_blockhash: BlockHash,
    pub merkle_root: bitcoin::hash_types::TxMerkleNode,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl From<BlockHeader> for RawHeader {
    fn from(h: BlockHeader) -> Self {
        RawHeader {
            version: h.version,
            prev_blockhash: h.prev_blockhash,
            merkle_root: h.merkle_root,
            time: h.time,
            bits: h.bits,
            nonce: h.nonce,
        }
    }
}

impl From<RawHeader> for BlockHeader {
    fn from(h: RawHeader) -> Self {
        BlockHeader {
            version: h.version,
            prev_blockhash: h.prev_blockhash,
            merkle_root: h.merkle_root,
            time: h.time,
            bits: h.bits,
            nonce: h.nonce,
        }
    }
}

/// An aggregated, joined transaction answer as returned by `getrawtransaction`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: Txid,
    pub rawtx: String,
    pub blockhash: Option<BlockHash>,
    pub blockheight: Option<u32>,
    pub confirmations: Option<i64>,
    pub time: Option<u32>,
    pub size: u32,
}

/// A Bitcoin P2P peer address, as gossiped via `addr` or configured statically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddr(pub SocketAddr);

/// An Electrum server address: hostname plus the protocol to dial it with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub hostname: String,
    pub protocol: ElectrumProtocol,
}

/// Transport used to reach an Electrum server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectrumProtocol {
    Tcp,
    Ssl,
}

impl ElectrumProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            ElectrumProtocol::Tcp => 50001,
            ElectrumProtocol::Ssl => 50002,
        }
    }
}
