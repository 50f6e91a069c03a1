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
//! A multi-source, SPV-class Bitcoin node: it keeps the longest valid header chain, fetches
//! and caches block and transaction data from redundant upstream sources, and answers a
//! Bitcoin-Core-compatible JSON-RPC subset. See [`runtime::Runtime`] for how the pieces are
//! wired together.
//!

pub mod aggregation;
pub mod blocks_reactor;
pub mod cache;
pub mod config;
pub mod electrum_wire;
pub mod error;
pub mod headers_reactor;
pub mod mempool;
pub mod p2p_wire;
pub mod peer;
pub mod pool;
pub mod repository;
pub mod rpc_api;
pub mod runtime;
pub mod types;
pub mod zmq_publisher;
