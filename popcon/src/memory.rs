// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
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

//! # memory
//!
//! [Backend] implementation that lives entirely in-process.
//!
//! [Backend]: crate::storage::Backend
//!
//! This is useful for local development & testing. It can also be given a daily write quota, after
//! which it will reject writes the way an edge key-value store does once its daily allowance is
//! spent; that makes it a convenient stand-in when exercising the version cache's fallback path.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::storage::{self, Backend, Item, QuotaExceededSnafu};

/// Writes consumed so far on a given (UTC) day
#[derive(Debug)]
struct Usage {
    day: NaiveDate,
    writes: u64,
}

/// An in-memory key-value store
#[derive(Debug, Default)]
pub struct Store {
    map: RwLock<HashMap<String, Item>>,
    quota: Option<u64>,
    usage: Mutex<Option<Usage>>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }
    /// Create a store that will accept at most `writes_per_day` writes per UTC day
    pub fn with_write_quota(writes_per_day: u64) -> Store {
        Store {
            quota: Some(writes_per_day),
            ..Default::default()
        }
    }
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }
    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }
    /// Charge one write against today's quota; fail if it's exhausted
    async fn charge(&self, key: &str) -> storage::Result<()> {
        if let Some(quota) = self.quota {
            let today = Utc::now().date_naive();
            let mut guard = self.usage.lock().await;
            let usage = guard.get_or_insert(Usage {
                day: today,
                writes: 0,
            });
            if usage.day != today {
                // New day, new allowance
                *usage = Usage {
                    day: today,
                    writes: 0,
                };
            }
            if usage.writes >= quota {
                debug!("Write quota of {quota} exhausted; rejecting the write to {key}");
                return QuotaExceededSnafu { key }.fail();
            }
            usage.writes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for Store {
    async fn get(&self, key: &str) -> storage::Result<Option<Item>> {
        Ok(self.map.read().await.get(key).cloned())
    }
    async fn put(&self, key: &str, item: &Item) -> storage::Result<()> {
        self.charge(key).await?;
        self.map.write().await.insert(key.to_owned(), item.clone());
        Ok(())
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        item: &Item,
    ) -> storage::Result<bool> {
        // Hold the write lock across the comparison so that the check & the write are atomic with
        // respect to other callers.
        let mut map = self.map.write().await;
        let current = map.get(key).map(|item| item.value.as_str());
        if current != expected {
            return Ok(false);
        }
        self.charge(key).await?;
        map.insert(key.to_owned(), item.clone());
        Ok(true)
    }
    async fn delete(&self, key: &str) -> storage::Result<()> {
        self.map.write().await.remove(key);
        Ok(())
    }
}
