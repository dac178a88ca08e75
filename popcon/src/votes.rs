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

//! # votes
//!
//! The vote ledger: for each requester key (the caller's network address, in practice) a list of
//! the votes recently recorded for it. Its sole purpose is to answer "has this requester already
//! voted today, with this identity string?"
//!
//! A vote is a duplicate iff there's an entry under the same requester key with the *same verbatim
//! identity string* dated today (UTC). Two different identity strings from one address (two
//! machines behind the same NAT, say) are two votes: the model is one vote per device per day, not
//! one vote per address per day.
//!
//! Each requester's list is a JSON array stored under the requester key. Entries older than the
//! configured retention are dropped whenever the list is rewritten; a retention shorter than a day
//! would defeat deduplication, so [Config::new] won't accept one.
//!
//! ## Consistency
//!
//! Under [DedupPolicy::Relaxed] recording a vote is a plain read-modify-write, so two concurrent
//! requests from the same requester can both see "not voted yet" and both count. That lost-update
//! race is accepted in exchange for latency. [DedupPolicy::Strict] closes it by writing back with
//! [Backend::compare_and_swap] and retrying on a lost race.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::debug;

use crate::{
    define_metric,
    metrics::Sort,
    storage::{self, Backend, DedupPolicy, Item, MAX_CAS_ATTEMPTS},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Gave up recording a vote for {key} after {attempts} lost races"))]
    Contention {
        key: String,
        attempts: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("The ledger for {key} couldn't be deserialized: {source}"))]
    De {
        key: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("A vote retention of {hours} hours is too short to deduplicate by day"))]
    Retention { hours: i64, backtrace: Backtrace },
    #[snafu(display("The ledger for {key} couldn't be serialized: {source}"))]
    Ser {
        key: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error for ledger {key}: {source}"))]
    Storage {
        key: String,
        #[snafu(source(from(storage::Error, Box::new)))]
        source: Box<storage::Error>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "votes.recorded",   votes_recorded,   Sort::IntegralCounter }
define_metric! { "votes.duplicates", votes_duplicates, Sort::IntegralCounter }
define_metric! { "votes.pruned",     votes_pruned,     Sort::IntegralCounter }

/// One recorded vote
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoteEntry {
    pub timestamp: DateTime<Utc>,
    pub identity: String,
}

/// Ledger configuration
#[derive(Clone, Copy, Debug)]
pub struct Config {
    retention: Duration,
    policy: DedupPolicy,
}

impl Config {
    pub fn new(retention_hours: u32, policy: DedupPolicy) -> Result<Config> {
        let hours = i64::from(retention_hours);
        if hours < 24 {
            return RetentionSnafu { hours }.fail();
        }
        Ok(Config {
            retention: Duration::hours(hours),
            policy,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            retention: Duration::hours(48),
            policy: DedupPolicy::default(),
        }
    }
}

fn is_same_vote(entry: &VoteEntry, identity: &str, now: &DateTime<Utc>) -> bool {
    entry.identity == identity && entry.timestamp.date_naive() == now.date_naive()
}

pub struct Ledger {
    store: Arc<dyn Backend + Send + Sync>,
    config: Config,
}

impl Ledger {
    pub fn new(store: Arc<dyn Backend + Send + Sync>, config: Config) -> Ledger {
        Ledger { store, config }
    }
    /// Read the ledger for `key`; also return the raw value for use in a conditional write
    async fn load(&self, key: &str) -> Result<(Option<String>, Vec<VoteEntry>)> {
        match self.store.get(key).await.context(StorageSnafu { key })? {
            Some(item) => {
                let entries = serde_json::from_str(&item.value).context(DeSnafu { key })?;
                Ok((Some(item.value), entries))
            }
            None => Ok((None, Vec::new())),
        }
    }
    /// Has `key` already voted today with identity string `identity`?
    pub async fn has_voted_today(
        &self,
        key: &str,
        identity: &str,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let (_, entries) = self.load(key).await?;
        Ok(entries.iter().any(|e| is_same_vote(e, identity, now)))
    }
    /// Unconditionally record a vote for `key` & `identity`
    pub async fn record_vote(&self, key: &str, identity: &str, now: &DateTime<Utc>) -> Result<()> {
        self.update(key, identity, now, false).await.map(|_| ())
    }
    /// Record a vote for `key` & `identity` unless one has already been recorded today; return
    /// true if this call recorded it
    pub async fn check_and_record(
        &self,
        key: &str,
        identity: &str,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        self.update(key, identity, now, true).await
    }
    async fn update(
        &self,
        key: &str,
        identity: &str,
        now: &DateTime<Utc>,
        dedup: bool,
    ) -> Result<bool> {
        let attempts = match self.config.policy {
            DedupPolicy::Relaxed => 1,
            DedupPolicy::Strict => MAX_CAS_ATTEMPTS,
        };
        for attempt in 0..attempts {
            let (raw, mut entries) = self.load(key).await?;
            if dedup && entries.iter().any(|e| is_same_vote(e, identity, now)) {
                votes_duplicates.add(1, &[]);
                return Ok(false);
            }

            let before = entries.len();
            entries.retain(|e| *now - e.timestamp < self.config.retention);
            let pruned = before - entries.len();
            entries.push(VoteEntry {
                timestamp: *now,
                identity: identity.to_owned(),
            });
            let item = Item::new(serde_json::to_string(&entries).context(SerSnafu { key })?);

            let written = match self.config.policy {
                DedupPolicy::Relaxed => {
                    self.store.put(key, &item).await.context(StorageSnafu { key })?;
                    true
                }
                DedupPolicy::Strict => self
                    .store
                    .compare_and_swap(key, raw.as_deref(), &item)
                    .await
                    .context(StorageSnafu { key })?,
            };
            if written {
                if pruned > 0 {
                    votes_pruned.add(pruned as u64, &[]);
                }
                votes_recorded.add(1, &[]);
                return Ok(true);
            }
            debug!("Lost a race recording a vote for {key} (attempt {})", attempt + 1);
        }
        ContentionSnafu { key, attempts }.fail()
    }
}
