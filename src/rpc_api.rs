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
//! # JSON-RPC surface (external collaborator, interface only)
//!
//! `RpcApi` is the Bitcoin-Core-compatible subset of §6: one method per call, returning the
//! shapes of §3, plus a `JsonRpcError` mapping onto Bitcoin Core's numeric codes. The HTTP
//! transport, request routing and Basic-Auth framing stay out of scope; `SprunedRpcApi` wires
//! `AggregationService` (block/transaction lookups) and `HeadersReactor` (locally-served header
//! lookups, per §4.5's note that `getblockheader` never goes to upstream services) into one
//! implementation.
//!

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::hex::FromHex;
use bitcoin::{BlockHash, Txid};
use serde_derive::Serialize;
use serde_json::{Map, Value};

use crate::aggregation::AggregationService;
use crate::error::{ErrorKind, SprunedError};
use crate::headers_reactor::HeadersReactor;
use crate::mempool::MempoolObserver;
use crate::peer::Transport;
use crate::pool::ConnectionPool;

/// Bitcoin Core's well-known RPC error codes (`rpc/protocol.h`); only the subset this surface
/// can actually raise.
pub const RPC_MISC_ERROR: i32 = -1;
pub const RPC_TYPE_ERROR: i32 = -3;
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const RPC_CLIENT_NOT_CONNECTED: i32 = -9;
pub const RPC_DESERIALIZATION_ERROR: i32 = -22;
pub const RPC_VERIFY_ERROR: i32 = -25;
pub const RPC_IN_WARMUP: i32 = -28;
pub const RPC_INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        JsonRpcError { code, message: message.into() }
    }

    pub fn block_not_found() -> Self {
        Self::new(RPC_INVALID_ADDRESS_OR_KEY, "Block not found")
    }

    pub fn tx_not_found() -> Self {
        Self::new(RPC_INVALID_ADDRESS_OR_KEY, "No such mempool or blockchain transaction")
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(RPC_TYPE_ERROR, message)
    }

    pub fn in_warmup() -> Self {
        Self::new(RPC_IN_WARMUP, "genesis not yet loaded")
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(RPC_INTERNAL_ERROR, message)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Maps an internal error kind (spec §7) onto the Bitcoin Core code a client would recognise.
impl From<SprunedError> for JsonRpcError {
    fn from(err: SprunedError) -> Self {
        let code = match err.kind() {
            ErrorKind::Transport | ErrorKind::NoPeers | ErrorKind::MissingResponse => RPC_CLIENT_NOT_CONNECTED,
            ErrorKind::Timeout | ErrorKind::NoQuorum => RPC_MISC_ERROR,
            ErrorKind::Validation => RPC_DESERIALIZATION_ERROR,
            ErrorKind::ReorgTooDeep => RPC_VERIFY_ERROR,
            ErrorKind::Config | ErrorKind::Repository => RPC_INTERNAL_ERROR,
        };
        JsonRpcError::new(code, err.to_string())
    }
}

type RpcResult<T> = std::result::Result<T, JsonRpcError>;

#[async_trait]
pub trait RpcApi: Send + Sync {
    async fn getblock(&self, blockhash: &str) -> RpcResult<Map<String, Value>>;
    async fn getblockheader(&self, blockhash: &str) -> RpcResult<Map<String, Value>>;
    async fn getrawtransaction(&self, txid: &str, verbose: bool) -> RpcResult<Value>;
    async fn getblockhash(&self, height: u32) -> RpcResult<String>;
    async fn getbestblockhash(&self) -> RpcResult<String>;
    async fn estimatefee(&self, blocks: u32) -> RpcResult<f64>;
    async fn sendrawtransaction(&self, hex: &str) -> RpcResult<String>;
}

pub struct SprunedRpcApi<A, T: Transport> {
    aggregation: Arc<AggregationService>,
    headers: Arc<HeadersReactor<A, T>>,
    pool: Arc<ConnectionPool<A, T>>,
    mempool: Arc<dyn MempoolObserver>,
}

impl<A, T> SprunedRpcApi<A, T>
where
    A: Clone + Eq + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    pub fn new(
        aggregation: Arc<AggregationService>,
        headers: Arc<HeadersReactor<A, T>>,
        pool: Arc<ConnectionPool<A, T>>,
        mempool: Arc<dyn MempoolObserver>,
    ) -> Self {
        SprunedRpcApi { aggregation, headers, pool, mempool }
    }

    fn parse_blockhash(s: &str) -> RpcResult<BlockHash> {
        BlockHash::from_str(s).map_err(|e| JsonRpcError::invalid_parameter(e.to_string()))
    }
}

#[async_trait]
impl<A, T> RpcApi for SprunedRpcApi<A, T>
where
    A: Clone + Eq + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    async fn getblock(&self, blockhash: &str) -> RpcResult<Map<String, Value>> {
        self.aggregation.get_block(blockhash).await.map_err(JsonRpcError::from)
    }

    /// Served from the locally maintained chain, never from upstream services (§4.5).
    async fn getblockheader(&self, blockhash: &str) -> RpcResult<Map<String, Value>> {
        let hash = Self::parse_blockhash(blockhash)?;
        let header = self.headers.header_by_hash(&hash).await.ok_or_else(JsonRpcError::block_not_found)?;
        let tip_height = self.headers.tip_height().await.unwrap_or(header.height);

        let mut out = Map::new();
        out.insert("hash".to_owned(), Value::String(header.hash().to_string()));
        out.insert("confirmations".to_owned(), Value::from(tip_height as i64 - header.height as i64 + 1));
        out.insert("height".to_owned(), Value::from(header.height));
        out.insert("version".to_owned(), Value::from(header.header.version));
        out.insert("merkleroot".to_owned(), Value::String(header.header.merkle_root.to_string()));
        out.insert("time".to_owned(), Value::from(header.header.time));
        out.insert("nonce".to_owned(), Value::from(header.header.nonce));
        out.insert("bits".to_owned(), Value::String(format!("{:08x}", header.header.bits)));
        out.insert("chainwork".to_owned(), Value::String(format!("{}", header.chainwork)));
        out.insert("previousblockhash".to_owned(), Value::String(header.header.prev_blockhash.to_string()));
        Ok(out)
    }

    async fn getrawtransaction(&self, txid: &str, verbose: bool) -> RpcResult<Value> {
        if verbose {
            return Err(JsonRpcError::not_supported("verbose raw transactions are not supported"));
        }
        let joined = self.aggregation.get_raw_transaction(txid).await.map_err(JsonRpcError::from)?;
        match joined.get("rawtx") {
            Some(value) => Ok(value.clone()),
            None => Err(JsonRpcError::tx_not_found()),
        }
    }

    async fn getblockhash(&self, height: u32) -> RpcResult<String> {
        self.headers
            .header_at_height(height)
            .await
            .map(|h| h.hash().to_string())
            .ok_or_else(JsonRpcError::block_not_found)
    }

    async fn getbestblockhash(&self) -> RpcResult<String> {
        let tip_height = self.headers.tip_height().await.ok_or_else(JsonRpcError::in_warmup)?;
        self.headers
            .header_at_height(tip_height)
            .await
            .map(|h| h.hash().to_string())
            .ok_or_else(JsonRpcError::in_warmup)
    }

    /// Matches Bitcoin Core's deprecated `estimatefee`: insufficient data is a valid `-1`
    /// answer, not an RPC error.
    async fn estimatefee(&self, blocks: u32) -> RpcResult<f64> {
        Ok(self.mempool.estimate_fee(blocks).await.unwrap_or(-1.0))
    }

    async fn sendrawtransaction(&self, hex: &str) -> RpcResult<String> {
        let bytes = Vec::<u8>::from_hex(hex).map_err(|e| JsonRpcError::new(RPC_DESERIALIZATION_ERROR, e.to_string()))?;
        let tx: bitcoin::Transaction =
            bitcoin::consensus::encode::deserialize(&bytes).map_err(|e| JsonRpcError::new(RPC_DESERIALIZATION_ERROR, format!("TX decode failed: {}", e)))?;
        let params = serde_json::to_value(hex).map_err(|e| JsonRpcError::new(RPC_INTERNAL_ERROR, e.to_string()))?;
        self.pool.call("sendrawtransaction", params, 1, false).await.map_err(JsonRpcError::from)?;
        let txid: Txid = tx.txid();
        Ok(txid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_distinct_bitcoin_core_codes() {
        let codes = [
            JsonRpcError::from(SprunedError::no_peers()).code,
            JsonRpcError::from(SprunedError::timeout("t")).code,
            JsonRpcError::from(SprunedError::validation("v")).code,
            JsonRpcError::from(SprunedError::reorg_too_deep(0, 10, 5)).code,
            JsonRpcError::from(SprunedError::config("c")).code,
        ];
        assert_eq!(codes[0], RPC_CLIENT_NOT_CONNECTED);
        assert_eq!(codes[1], RPC_MISC_ERROR);
        assert_eq!(codes[2], RPC_DESERIALIZATION_ERROR);
        assert_eq!(codes[3], RPC_VERIFY_ERROR);
        assert_eq!(codes[4], RPC_INTERNAL_ERROR);
    }

    #[test]
    fn estimatefee_style_errors_stay_out_of_band() {
        // estimatefee never produces a JsonRpcError for "no data"; see SprunedRpcApi::estimatefee.
        assert_eq!(JsonRpcError::block_not_found().code, RPC_INVALID_ADDRESS_OR_KEY);
    }
}
