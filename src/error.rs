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
//! # Error kinds
//!
//! One enum per §7 of the specification. Every variant either names a peer whose score
//! should move, or is returned straight to the caller; none are swallowed.
//!

use std::fmt;

use bitcoin::hash_types::BlockHash;

/// The stable kind of a `SprunedError`, independent of its payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// connection or handshake failure
    Transport,
    /// an RPC exceeded its deadline
    Timeout,
    /// fewer usable responses than requested
    MissingResponse,
    /// responses disagreed past tolerance
    NoQuorum,
    /// the pool could not satisfy a selection request
    NoPeers,
    /// a header failed PoW or linkage checks
    Validation,
    /// a peer proposed a reorg deeper than the configured limit
    ReorgTooDeep,
    /// configuration failed validation at load time
    Config,
    /// the repository contract signalled a persistence failure
    Repository,
}

/// Errors raised anywhere in this crate.
///
/// Carries a `kind` for callers that branch on error class (the JSON-RPC transport maps
/// `kind` to a JSON-RPC error code) and a boxed source for the underlying cause.
#[derive(Debug)]
pub struct SprunedError {
    kind: ErrorKind,
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl SprunedError {
    fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        SprunedError {
            kind,
            source: source.into(),
        }
    }

    pub fn transport<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Self {
        Self::new(ErrorKind::Transport, e)
    }

    pub fn timeout<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Self {
        Self::new(ErrorKind::Timeout, e)
    }

    pub fn missing_response(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingResponse, context.into())
    }

    pub fn no_quorum(divergent: impl fmt::Debug) -> Self {
        Self::new(ErrorKind::NoQuorum, format!("divergent responses: {:?}", divergent))
    }

    pub fn no_peers() -> Self {
        Self::new(ErrorKind::NoPeers, "no usable peer satisfies the selection request")
    }

    pub fn validation(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, context.into())
    }

    pub fn reorg_too_deep(ancestor_height: u32, tip_height: u32, limit: u32) -> Self {
        Self::new(
            ErrorKind::ReorgTooDeep,
            format!(
                "reorg from {} to {} exceeds limit of {} blocks",
                tip_height, ancestor_height, limit
            ),
        )
    }

    pub fn config(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, context.into())
    }

    pub fn repository<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Self {
        Self::new(ErrorKind::Repository, e)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_inner(self) -> Box<dyn std::error::Error + Send + Sync> {
        self.source
    }
}

impl fmt::Display for SprunedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.source)
    }
}

impl std::error::Error for SprunedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// divergence detail attached to a `NoQuorum` error, kept around for observability
#[derive(Debug, Clone)]
pub struct Divergence {
    pub key: String,
    pub values: Vec<String>,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {:?} diverged: {:?}", self.key, self.values)
    }
}

/// a block hash that was rejected by header validation, for log context
#[derive(Debug, Clone, Copy)]
pub struct RejectedHeader(pub BlockHash);

impl fmt::Display for RejectedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected header {}", self.0)
    }
}

pub type Result<T> = std::result::Result<T, SprunedError>;
