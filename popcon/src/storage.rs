// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of popcon.
//
// popcon is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// popcon is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with popcon.  If not,
// see <http://www.gnu.org/licenses/>.

//! # storage
//!
//! Abstractions for the popcon storage layer.
//!
//! popcon keeps all of its shared state outside the process: every request may be served by a
//! different instance, and there's no in-process memory shared across requests. What popcon asks of
//! its datastore is modest: a key-value map with per-key reads & writes, a little string metadata
//! attached to each value, and a conditional ("compare-and-swap") write for callers that need a
//! single-key read-modify-write. Nothing here assumes multi-key transactions.
//!
//! The state is divided into three logical [Partitions]:
//!
//! - `cache`: the fast primary store for the "latest version" record; this is the store that's
//!   expected to reject writes from time to time (rate limits, daily write quotas)
//! - `blobs`: a slower store without such limits; it holds the fallback version record & the
//!   monthly statistics
//! - `votes`: the vote ledger, keyed by requester

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("The write to {key} was rejected; quota or rate limit exceeded"))]
    QuotaExceeded { key: String, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A value together with its metadata
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Item {
    pub value: String,
    pub metadata: BTreeMap<String, String>,
}

impl Item {
    pub fn new(value: impl Into<String>) -> Item {
        Item {
            value: value.into(),
            metadata: BTreeMap::new(),
        }
    }
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Item {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Object-safe trait abstracting over the various key-value stores popcon can run against
#[async_trait]
pub trait Backend {
    /// Retrieve the [Item] stored under `key`; None means there is no such key.
    async fn get(&self, key: &str) -> Result<Option<Item>>;
    /// Unconditionally write `item` under `key`
    async fn put(&self, key: &str, item: &Item) -> Result<()>;
    /// Write `item` under `key` if & only if the value presently stored there is `expected` (with
    /// `None` meaning "there is no value stored under `key`"). Return true if the write took place,
    /// false if we lost a race with some other writer.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, item: &Item)
    -> Result<bool>;
    /// Remove `key`; removing a key that isn't there is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// The three logical partitions in which popcon keeps its state
#[derive(Clone)]
pub struct Partitions {
    pub cache: Arc<dyn Backend + Send + Sync>,
    pub blobs: Arc<dyn Backend + Send + Sync>,
    pub votes: Arc<dyn Backend + Send + Sync>,
}

/// How should read-modify-write sequences against the datastore be carried out?
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Read, modify & write back with no coordination. Two concurrent updates to the same key can
    /// both read the old value, and one of them will be lost. This is the low-latency default; the
    /// only consequence is the occasional double-counted (or dropped) vote.
    #[default]
    Relaxed,
    /// Use [Backend::compare_and_swap], retrying on a lost race. This closes the lost-update
    /// window at the cost of extra round-trips under contention.
    Strict,
}

/// The number of times a [DedupPolicy::Strict] read-modify-write will retry before giving up
pub const MAX_CAS_ATTEMPTS: usize = 8;
