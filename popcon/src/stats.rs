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

//! # stats
//!
//! Monthly popularity-contest statistics.
//!
//! Votes are aggregated into one bucket per calendar month (UTC), keyed by `YYYY-MM`. Each bucket
//! holds a vote count and four independent tallies: OS, OS family, client language & client
//! version. A bucket is created the first time it's incremented and is never deleted.
//!
//! Like the vote ledger, an increment is a read-modify-write against a single key, and so is
//! subject to lost updates under [DedupPolicy::Relaxed]; see [crate::votes] for more.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Datelike, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap};
use snafu::{Backtrace, ResultExt, Snafu};
use tower_http::cors::CorsLayer;
use tracing::{debug, error};

use crate::{
    define_metric,
    http::{internal_error, not_found},
    metrics::Sort,
    popcon::Popcon,
    storage::{self, Backend, DedupPolicy, Item, MAX_CAS_ATTEMPTS},
    user_agent::IdentityInfo,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Gave up incrementing {month} after {attempts} lost races"))]
    Contention {
        month: String,
        attempts: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("The bucket for {month} couldn't be deserialized: {source}"))]
    De {
        month: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The bucket for {month} couldn't be serialized: {source}"))]
    Ser {
        month: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error for bucket {month}: {source}"))]
    Storage {
        month: String,
        #[snafu(source(from(storage::Error, Box::new)))]
        source: Box<storage::Error>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "stats.increments", stats_increments, Sort::IntegralCounter }
define_metric! { "stats.served",     stats_served,     Sort::IntegralCounter }

/// The bucket key for the month containing `now`
pub fn month_key(now: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

/// The bucket key for the month before the one containing `now`
pub fn previous_month_key(now: &DateTime<Utc>) -> String {
    let (year, month) = if now.month() == 1 {
        (now.year() - 1, 12)
    } else {
        (now.year(), now.month() - 1)
    };
    format!("{year:04}-{month:02}")
}

/// One month's statistics, as persisted
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_count: Option<u64>,
    #[serde(default)]
    pub os: BTreeMap<String, u64>,
    #[serde(default)]
    pub os_family: BTreeMap<String, u64>,
    #[serde(default)]
    pub language: BTreeMap<String, u64>,
    #[serde(default)]
    pub version: BTreeMap<String, u64>,
}

fn bump(tally: &mut BTreeMap<String, u64>, value: Option<String>) {
    if let Some(value) = value {
        *tally.entry(value).or_insert(0) += 1;
    }
}

impl MonthlyStats {
    /// Count one vote; each category is only touched if `info` has a value for it
    pub fn add(&mut self, info: &IdentityInfo) {
        self.vote_count = Some(self.vote_count.unwrap_or(0) + 1);
        bump(&mut self.os, info.os.clone());
        bump(&mut self.os_family, info.os_family.map(|f| f.to_string()));
        bump(&mut self.language, info.language.clone());
        bump(&mut self.version, info.version.clone());
    }
}

/// A single category's counts, most popular first
///
/// Serializes as a JSON object whose keys appear in descending order of count. Ties are broken by
/// key order, so the result is deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Ranking(pub Vec<(String, u64)>);

impl From<&BTreeMap<String, u64>> for Ranking {
    fn from(tally: &BTreeMap<String, u64>) -> Self {
        // `sorted_by` is stable & `tally` iterates in key order
        Ranking(
            tally
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .sorted_by(|lhs, rhs| rhs.1.cmp(&lhs.1))
                .collect(),
        )
    }
}

impl Serialize for Ranking {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A read-only, sorted view on a [MonthlyStats]
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SortedStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_count: Option<u64>,
    pub os: Ranking,
    pub os_family: Ranking,
    pub language: Ranking,
    pub version: Ranking,
}

impl From<&MonthlyStats> for SortedStats {
    fn from(stats: &MonthlyStats) -> Self {
        SortedStats {
            vote_count: stats.vote_count,
            os: (&stats.os).into(),
            os_family: (&stats.os_family).into(),
            language: (&stats.language).into(),
            version: (&stats.version).into(),
        }
    }
}

/// Reads & updates the monthly buckets
pub struct Aggregator {
    store: Arc<dyn Backend + Send + Sync>,
    policy: DedupPolicy,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Backend + Send + Sync>, policy: DedupPolicy) -> Aggregator {
        Aggregator { store, policy }
    }
    async fn load(&self, month: &str) -> Result<(Option<String>, MonthlyStats)> {
        match self
            .store
            .get(month)
            .await
            .context(StorageSnafu { month })?
        {
            Some(item) => {
                let stats = serde_json::from_str(&item.value).context(DeSnafu { month })?;
                Ok((Some(item.value), stats))
            }
            None => Ok((None, MonthlyStats::default())),
        }
    }
    /// Count one vote described by `info` in the bucket for `month`
    pub async fn increment(&self, month: &str, info: &IdentityInfo) -> Result<()> {
        let attempts = match self.policy {
            DedupPolicy::Relaxed => 1,
            DedupPolicy::Strict => MAX_CAS_ATTEMPTS,
        };
        for attempt in 0..attempts {
            let (raw, mut stats) = self.load(month).await?;
            stats.add(info);
            let item = Item::new(serde_json::to_string(&stats).context(SerSnafu { month })?);
            let written = match self.policy {
                DedupPolicy::Relaxed => {
                    self.store
                        .put(month, &item)
                        .await
                        .context(StorageSnafu { month })?;
                    true
                }
                DedupPolicy::Strict => self
                    .store
                    .compare_and_swap(month, raw.as_deref(), &item)
                    .await
                    .context(StorageSnafu { month })?,
            };
            if written {
                stats_increments.add(1, &[]);
                return Ok(());
            }
            debug!("Lost a race incrementing {month} (attempt {})", attempt + 1);
        }
        ContentionSnafu { month, attempts }.fail()
    }
    /// Read the bucket for `month`, each category sorted by descending count; a month with no
    /// bucket yet reads as empty
    pub async fn read_sorted(&self, month: &str) -> Result<SortedStats> {
        let (_, stats) = self.load(month).await?;
        Ok((&stats).into())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MonthReport {
    date: String,
    #[serde(flatten)]
    stats: SortedStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    this_month: MonthReport,
    last_month: MonthReport,
}

/// `GET /stats` handler
async fn stats(State(state): State<Arc<Popcon>>, headers: HeaderMap) -> Response {
    async fn stats1(aggregator: &Aggregator, now: &DateTime<Utc>) -> Result<StatsResponse> {
        let this_month = month_key(now);
        let last_month = previous_month_key(now);
        Ok(StatsResponse {
            this_month: MonthReport {
                stats: aggregator.read_sorted(&this_month).await?,
                date: this_month,
            },
            last_month: MonthReport {
                stats: aggregator.read_sorted(&last_month).await?,
                date: last_month,
            },
        })
    }

    match stats1(&state.stats, &Utc::now()).await {
        Ok(rsp) => {
            stats_served.add(1, &[]);
            Json(rsp).into_response()
        }
        Err(err) => {
            error!("{:?}", err);
            internal_error(&state, &headers)
        }
    }
}

pub fn make_router(state: Arc<Popcon>) -> Router<Arc<Popcon>> {
    Router::new()
        // The statistics are public, and may be charted from anywhere
        .route(
            "/stats",
            get(stats)
                .fallback(not_found)
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
