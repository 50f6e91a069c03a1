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
//! # Aggregation service
//!
//! Scatter/gather across redundant upstream services with a join rule tolerant of small time
//! skews but strict everywhere else, plus the cache write-through policy of §4.5. A near-direct
//! generalisation of `SprunedVOService`
//! (`original_source/spruned/service/spruned_vo_service.py`): service selection, `_join_data`
//! and the `maybe_cached` gate map onto `pick_services`, `join` and the cache checks below.
//!
//! `_join_data`'s untyped dict comparison is generalised into `ServiceAnswer`: one type per RPC
//! method (`GetBlockAnswer`, `GetRawTransactionAnswer`), each field's agreement rule declared
//! once via `ComparisonMode` instead of re-derived from a hardcoded key-name list at join time.
//!

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use serde_json::{Map, Value};

use crate::cache::CacheAgent;
use crate::error::{Divergence, Result, SprunedError};

/// Default tolerance for `ComparisonMode::TimeTolerant` fields, per §4.5.
pub const MAX_TIME_DIVERGENCE: Duration = Duration::from_secs(10);
const PICK_RETRY_LIMIT: usize = 50;

/// How a `ServiceAnswer` field is reconciled across responses, per §3 "ServiceAnswer".
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ComparisonMode {
    /// Non-null values across responses must be identical.
    Exact,
    /// Non-null values may differ by up to the given tolerance (time-like fields).
    TimeTolerant(Duration),
    /// No agreement check at all: the first non-null response wins outright.
    PreferNonNull,
}

/// The typed product the join rule operates on: a JSON object plus the field table that tells
/// the joiner how to reconcile each key. A field absent from the table (an upstream extension
/// this crate doesn't know about) defaults to `Exact`.
pub trait ServiceAnswer: Sized {
    fn fields() -> &'static [(&'static str, ComparisonMode)];
    fn into_map(self) -> Map<String, Value>;
    fn from_map(map: Map<String, Value>) -> Self;

    fn comparison_mode(key: &str) -> ComparisonMode {
        Self::fields()
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, mode)| *mode)
            .unwrap_or(ComparisonMode::Exact)
    }
}

/// `getblock`'s joined answer. `confirmations`/`nextblockhash` are left `PreferNonNull`: they
/// depend on how far each source's own view of the chain tip has advanced, so requiring
/// agreement on them would reject perfectly good responses from a lagging-but-honest source.
pub struct GetBlockAnswer(pub Map<String, Value>);

const GET_BLOCK_FIELDS: &[(&str, ComparisonMode)] = &[
    ("hash", ComparisonMode::Exact),
    ("confirmations", ComparisonMode::PreferNonNull),
    ("height", ComparisonMode::Exact),
    ("version", ComparisonMode::Exact),
    ("merkleroot", ComparisonMode::Exact),
    ("time", ComparisonMode::TimeTolerant(MAX_TIME_DIVERGENCE)),
    ("mediantime", ComparisonMode::TimeTolerant(MAX_TIME_DIVERGENCE)),
    ("nonce", ComparisonMode::Exact),
    ("bits", ComparisonMode::Exact),
    ("difficulty", ComparisonMode::Exact),
    ("chainwork", ComparisonMode::Exact),
    ("previousblockhash", ComparisonMode::Exact),
    ("nextblockhash", ComparisonMode::PreferNonNull),
    ("strippedsize", ComparisonMode::Exact),
    ("size", ComparisonMode::Exact),
    ("weight", ComparisonMode::Exact),
    ("tx", ComparisonMode::Exact),
];

impl ServiceAnswer for GetBlockAnswer {
    fn fields() -> &'static [(&'static str, ComparisonMode)] {
        GET_BLOCK_FIELDS
    }

    fn into_map(self) -> Map<String, Value> {
        self.0
    }

    fn from_map(map: Map<String, Value>) -> Self {
        GetBlockAnswer(map)
    }
}

/// `getrawtransaction`'s joined answer. `blockhash`/`blockheight`/`confirmations` are
/// `PreferNonNull` for the same lagging-source reason as `GetBlockAnswer`'s fields: a source
/// that hasn't seen the confirming block yet still returns a useful `rawtx`.
pub struct GetRawTransactionAnswer(pub Map<String, Value>);

const GET_RAW_TRANSACTION_FIELDS: &[(&str, ComparisonMode)] = &[
    ("txid", ComparisonMode::Exact),
    ("rawtx", ComparisonMode::Exact),
    ("blockhash", ComparisonMode::PreferNonNull),
    ("blockheight", ComparisonMode::PreferNonNull),
    ("confirmations", ComparisonMode::PreferNonNull),
    ("time", ComparisonMode::TimeTolerant(MAX_TIME_DIVERGENCE)),
    ("size", ComparisonMode::Exact),
];

impl ServiceAnswer for GetRawTransactionAnswer {
    fn fields() -> &'static [(&'static str, ComparisonMode)] {
        GET_RAW_TRANSACTION_FIELDS
    }

    fn into_map(self) -> Map<String, Value> {
        self.0
    }

    fn from_map(map: Map<String, Value>) -> Self {
        GetRawTransactionAnswer(map)
    }
}

/// What an upstream collaborator (an Electrum aggregator, a block explorer, a full node RPC)
/// must provide. §6 "Upstream service contract": every field that cannot be served is returned
/// as an explicit JSON `null`, never omitted.
#[async_trait]
pub trait UpstreamService: Send + Sync {
    async fn get_block(&self, blockhash: &str) -> Result<GetBlockAnswer>;
    async fn get_raw_transaction(&self, txid: &str) -> Result<GetRawTransactionAnswer>;
}

pub struct AggregationService {
    secondaries: Vec<Arc<dyn UpstreamService>>,
    primaries: Vec<Arc<dyn UpstreamService>>,
    cache: Arc<dyn CacheAgent>,
    min_sources: usize,
}

impl AggregationService {
    pub fn new(cache: Arc<dyn CacheAgent>, min_sources: usize) -> Self {
        AggregationService {
            secondaries: Vec::new(),
            primaries: Vec::new(),
            cache,
            min_sources,
        }
    }

    pub fn add_service(&mut self, service: Arc<dyn UpstreamService>) {
        self.secondaries.push(service);
    }

    pub fn add_primary_service(&mut self, service: Arc<dyn UpstreamService>) {
        self.primaries.push(service);
    }

    /// Sample uniformly without replacement from secondaries until `min_sources` is met,
    /// always including every primary, per §4.5 "Service selection".
    fn pick_services(&self) -> Result<Vec<Arc<dyn UpstreamService>>> {
        if self.primaries.len() >= self.min_sources {
            return Ok(self.primaries.clone());
        }
        let need = self.min_sources - self.primaries.len();
        if self.secondaries.is_empty() {
            return Err(SprunedError::no_peers());
        }
        let mut chosen: Vec<usize> = Vec::new();
        let mut attempts = 0;
        let mut rng = rand::thread_rng();
        while chosen.len() < need && chosen.len() < self.secondaries.len() {
            attempts += 1;
            if attempts > PICK_RETRY_LIMIT {
                return Err(SprunedError::no_peers());
            }
            let idx = rng.gen_range(0, self.secondaries.len());
            if !chosen.contains(&idx) {
                chosen.push(idx);
            }
        }
        let mut result: Vec<_> = chosen.into_iter().map(|i| self.secondaries[i].clone()).collect();
        result.extend(self.primaries.iter().cloned());
        Ok(result)
    }

    pub async fn get_block(&self, blockhash: &str) -> Result<Map<String, Value>> {
        if let Some(bytes) = self.cache.get("getblock", blockhash).await? {
            return deserialize_cached(&bytes);
        }
        let services = self.pick_services()?;
        let futs = services.iter().map(|s| {
            let s = s.clone();
            let blockhash = blockhash.to_owned();
            async move { s.get_block(&blockhash).await }
        });
        let responses = gather(futs, self.min_sources).await?;
        let joined = join::<GetBlockAnswer>(responses)?.into_map();

        let confirmations = joined.get("confirmations").and_then(Value::as_i64).unwrap_or(0);
        if confirmations > 3 {
            let bytes = serde_json::to_vec(&joined).map_err(|e| SprunedError::transport(e.to_string()))?;
            self.cache.put("getblock", blockhash, bytes, None).await?;
        }
        Ok(joined)
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> Result<Map<String, Value>> {
        if let Some(bytes) = self.cache.get("getrawtransaction", txid).await? {
            return deserialize_cached(&bytes);
        }
        let services = self.pick_services()?;
        let futs = services.iter().map(|s| {
            let s = s.clone();
            let txid = txid.to_owned();
            async move { s.get_raw_transaction(&txid).await }
        });
        let responses = gather(futs, self.min_sources).await?;
        let joined = join::<GetRawTransactionAnswer>(responses)?.into_map();

        let containing_block_cached = match joined.get("blockhash").and_then(Value::as_str) {
            Some(blockhash) => self.cache.get("getblock", blockhash).await?.is_some(),
            None => false,
        };
        if containing_block_cached {
            let bytes = serde_json::to_vec(&joined).map_err(|e| SprunedError::transport(e.to_string()))?;
            self.cache.put("getrawtransaction", txid, bytes, None).await?;
        }
        Ok(joined)
    }
}

fn deserialize_cached(bytes: &[u8]) -> Result<Map<String, Value>> {
    serde_json::from_slice(bytes).map_err(|e| SprunedError::repository(e.to_string()))
}

async fn gather<F, S>(futs: impl Iterator<Item = F>, min_sources: usize) -> Result<Vec<S>>
where
    F: std::future::Future<Output = Result<S>>,
{
    let responses: Vec<S> = join_all(futs).await.into_iter().filter_map(std::result::Result::ok).collect();
    if responses.len() < min_sources {
        return Err(SprunedError::missing_response(format!(
            "requested {} upstream responses, received {}",
            min_sources,
            responses.len()
        )));
    }
    Ok(responses)
}

/// Joins scattered upstream `ServiceAnswer`s into one, per §4.5 "Join rule". Every key present
/// in any response is resolved by its declared `ComparisonMode`: `Exact` and `TimeTolerant`
/// non-null values must agree (within tolerance for the latter), `PreferNonNull` skips the
/// agreement check entirely; either way the first non-null occurrence (in response order) is
/// the accepted value.
pub fn join<S: ServiceAnswer>(responses: Vec<S>) -> Result<S> {
    if responses.is_empty() {
        return Err(SprunedError::missing_response("no responses to join"));
    }
    let maps: Vec<Map<String, Value>> = responses.into_iter().map(ServiceAnswer::into_map).collect();

    let mut keys: Vec<String> = Vec::new();
    for r in &maps {
        for k in r.keys() {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }
    }

    let mut result = Map::new();
    for key in keys {
        let non_null: Vec<&Value> = maps.iter().filter_map(|r| r.get(&key)).filter(|v| !v.is_null()).collect();
        if non_null.is_empty() {
            result.insert(key, Value::Null);
            continue;
        }
        let mode = S::comparison_mode(&key);
        if mode != ComparisonMode::PreferNonNull {
            for candidate in &non_null[1..] {
                if !values_agree(mode, non_null[0], candidate) {
                    return Err(SprunedError::no_quorum(Divergence {
                        key: key.clone(),
                        values: non_null.iter().map(|v| v.to_string()).collect(),
                    }));
                }
            }
        }
        result.insert(key, non_null[0].clone());
    }
    Ok(S::from_map(result))
}

fn values_agree(mode: ComparisonMode, a: &Value, b: &Value) -> bool {
    if let ComparisonMode::TimeTolerant(tolerance) = mode {
        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            return (x - y).abs() <= tolerance.as_secs() as i64;
        }
    }
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCacheAgent;
    use serde_json::json;

    fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn join_accepts_matching_responses() {
        let a = GetBlockAnswer(obj(&[("height", json!(10)), ("time", json!(1000))]));
        let b = GetBlockAnswer(obj(&[("height", json!(10)), ("time", json!(1005))]));
        let joined = join(vec![a, b]).unwrap().into_map();
        assert_eq!(joined["height"], json!(10));
        assert_eq!(joined["time"], json!(1000));
    }

    #[test]
    fn join_rejects_time_divergence_past_tolerance() {
        let a = GetBlockAnswer(obj(&[("time", json!(1000))]));
        let b = GetBlockAnswer(obj(&[("time", json!(1011))]));
        assert!(join(vec![a, b]).is_err());
    }

    #[test]
    fn join_rejects_exact_key_disagreement() {
        let a = GetBlockAnswer(obj(&[("height", json!(10))]));
        let b = GetBlockAnswer(obj(&[("height", json!(11))]));
        assert!(join(vec![a, b]).is_err());
    }

    #[test]
    fn join_fills_null_from_a_peer_that_has_the_field() {
        let a = GetBlockAnswer(obj(&[("mediantime", json!(Value::Null))]));
        let b = GetBlockAnswer(obj(&[("mediantime", json!(500))]));
        let joined = join(vec![a, b]).unwrap().into_map();
        assert_eq!(joined["mediantime"], json!(500));
    }

    #[test]
    fn join_prefer_non_null_skips_agreement_check() {
        let a = GetBlockAnswer(obj(&[("confirmations", json!(3))]));
        let b = GetBlockAnswer(obj(&[("confirmations", json!(4))]));
        // Disagreement on a PreferNonNull field never raises NoQuorum; the first response wins.
        let joined = join(vec![a, b]).unwrap().into_map();
        assert_eq!(joined["confirmations"], json!(3));
    }

    struct StubService {
        block: Map<String, Value>,
    }

    #[async_trait]
    impl UpstreamService for StubService {
        async fn get_block(&self, _blockhash: &str) -> Result<GetBlockAnswer> {
            Ok(GetBlockAnswer(self.block.clone()))
        }

        async fn get_raw_transaction(&self, _txid: &str) -> Result<GetRawTransactionAnswer> {
            Ok(GetRawTransactionAnswer(Map::new()))
        }
    }

    #[tokio::test]
    async fn get_block_caches_only_past_confirmation_threshold() {
        let cache = Arc::new(MemCacheAgent::new(1 << 20));
        let mut service = AggregationService::new(cache.clone(), 1);
        service.add_primary_service(Arc::new(StubService {
            block: obj(&[("confirmations", json!(2))]),
        }));
        service.get_block("deadbeef").await.unwrap();
        assert!(cache.get("getblock", "deadbeef").await.unwrap().is_none());

        let mut service = AggregationService::new(cache.clone(), 1);
        service.add_primary_service(Arc::new(StubService {
            block: obj(&[("confirmations", json!(4))]),
        }));
        service.get_block("cafebabe").await.unwrap();
        assert!(cache.get("getblock", "cafebabe").await.unwrap().is_some());
    }
}
