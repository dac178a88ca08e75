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

//! # version_cache
//!
//! A tiered cache for the one value popcon caches: the latest release version.
//!
//! The upstream release API is rate-limited, so the version is cached in a fast primary store with
//! a time-to-live. That store may itself reject writes (edge key-value stores commonly carry a
//! daily write quota). When it does, the value is written to the next, slower, tier instead, and
//! the write failure goes no further.
//!
//! Reads try the tiers in order and the first hit wins. The primary tier enforces its TTL; the
//! fallback tier doesn't (by default), since its mere presence means it was written as a last
//! resort. A successful primary write removes the fallback copy.
//!
//! Note that a fallback hit means upstream isn't consulted, and so the primary tier never sees the
//! write that would clear the fallback. With no maximum age configured, a value that landed in the
//! fallback tier is therefore served until someone deletes it. Set `fallback-max-age-seconds` to
//! bound that.
//!
//! A tier whose store can't be read (as opposed to one holding a malformed record) is treated as a
//! miss, so an outage in the primary store degrades to the fallback tier rather than failing.
//!
//! ```text
//!   get_current ──► primary (TTL) ──miss/unreachable──► fallback (no TTL) ──miss──► Lookup::Miss
//!   refresh     ──► primary ──write failed──► fallback
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::Deserialize;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    define_metric,
    metrics::Sort,
    storage::{self, Backend, Item},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The {tier} record {key} has a malformed fetchedAt timestamp: {source}"))]
    BadTimestamp {
        tier: String,
        key: String,
        source: chrono::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("The {tier} record {key} has no fetchedAt metadata"))]
    MissingMetadata {
        tier: String,
        key: String,
        backtrace: Backtrace,
    },
    #[snafu(display("No cache tiers were configured"))]
    NoTiers { backtrace: Backtrace },
    #[snafu(display("Storage error in the {tier} tier: {source}"))]
    Storage {
        tier: String,
        #[snafu(source(from(storage::Error, Box::new)))]
        source: Box<storage::Error>,
        backtrace: Backtrace,
    },
}

impl Error {
    /// True if this error is a write rejected for quota or rate-limit reasons
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::Storage { source, .. } if source.is_quota())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "version.cache.hits",            version_cache_hits,            Sort::IntegralCounter }
define_metric! { "version.cache.misses",          version_cache_misses,          Sort::IntegralCounter }
define_metric! { "version.cache.write.fallbacks", version_cache_write_fallbacks, Sort::IntegralCounter }
define_metric! { "version.cache.read.failures",   version_cache_read_failures,   Sort::IntegralCounter }
define_metric! { "version.cache.age.seconds",     version_cache_age_seconds,     Sort::IntegralGauge }

/// The key under which the version record is stored, in every tier
pub const VERSION_KEY: &str = "latest";

/// The metadata field holding the time at which the value was fetched (RFC 3339)
pub const FETCHED_AT: &str = "fetchedAt";

/// Strip exactly one leading 'v' from a release tag
///
/// Consumers expect bare version numbers ("1.2.3"), but release tags are commonly "v1.2.3".
pub fn normalize_tag(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

/// One store in an ordered chain of cache tiers
#[async_trait]
pub trait Tier {
    fn name(&self) -> &str;
    /// Return the cached value if present & (by this tier's lights) fresh as of `now`
    async fn try_read(&self, now: &DateTime<Utc>) -> Result<Option<String>>;
    /// Store `value`, fetched at `now`
    async fn try_write(&self, value: &str, now: &DateTime<Utc>) -> Result<()>;
    /// Forget any value held by this tier
    async fn clear(&self) -> Result<()>;
}

fn fetched_at(tier: &str, key: &str, item: &Item) -> Result<Option<DateTime<Utc>>> {
    item.metadata
        .get(FETCHED_AT)
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .context(BadTimestampSnafu { tier, key })
        })
        .transpose()
}

fn record(value: &str, now: &DateTime<Utc>) -> Item {
    Item::new(value).with_metadata(FETCHED_AT, now.to_rfc3339())
}

/// The fast, TTL-checked tier
///
/// A record without `fetchedAt` metadata means someone other than popcon wrote it, or it was
/// corrupted; either way it's a hard error, not a miss.
pub struct PrimaryTier {
    store: Arc<dyn Backend + Send + Sync>,
    ttl: Duration,
}

impl PrimaryTier {
    pub fn new(store: Arc<dyn Backend + Send + Sync>, ttl: Duration) -> PrimaryTier {
        PrimaryTier { store, ttl }
    }
}

#[async_trait]
impl Tier for PrimaryTier {
    fn name(&self) -> &str {
        "primary"
    }
    async fn try_read(&self, now: &DateTime<Utc>) -> Result<Option<String>> {
        let tier = self.name();
        let item = match self
            .store
            .get(VERSION_KEY)
            .await
            .context(StorageSnafu { tier })?
        {
            Some(item) => item,
            None => return Ok(None),
        };
        let fetched = fetched_at(tier, VERSION_KEY, &item)?.ok_or_else(|| {
            MissingMetadataSnafu {
                tier,
                key: VERSION_KEY,
            }
            .build()
        })?;
        let age = *now - fetched;
        if age < self.ttl {
            version_cache_age_seconds.record(age.num_seconds().max(0) as u64, &[]);
            Ok(Some(item.value))
        } else {
            debug!("The primary version record is stale ({}s old)", age.num_seconds());
            Ok(None)
        }
    }
    async fn try_write(&self, value: &str, now: &DateTime<Utc>) -> Result<()> {
        self.store
            .put(VERSION_KEY, &record(value, now))
            .await
            .context(StorageSnafu { tier: self.name() })
    }
    async fn clear(&self) -> Result<()> {
        self.store
            .delete(VERSION_KEY)
            .await
            .context(StorageSnafu { tier: self.name() })
    }
}

/// The slow, last-resort tier
///
/// Values here are served regardless of age unless a maximum age was configured.
pub struct FallbackTier {
    store: Arc<dyn Backend + Send + Sync>,
    max_age: Option<Duration>,
}

impl FallbackTier {
    pub fn new(store: Arc<dyn Backend + Send + Sync>, max_age: Option<Duration>) -> FallbackTier {
        FallbackTier { store, max_age }
    }
}

#[async_trait]
impl Tier for FallbackTier {
    fn name(&self) -> &str {
        "fallback"
    }
    async fn try_read(&self, now: &DateTime<Utc>) -> Result<Option<String>> {
        let tier = self.name();
        let item = match self
            .store
            .get(VERSION_KEY)
            .await
            .context(StorageSnafu { tier })?
        {
            Some(item) => item,
            None => return Ok(None),
        };
        if let (Some(max_age), Some(fetched)) =
            (self.max_age, fetched_at(tier, VERSION_KEY, &item)?)
        {
            if *now - fetched >= max_age {
                debug!("The fallback version record is older than {max_age}");
                return Ok(None);
            }
        }
        Ok(Some(item.value))
    }
    async fn try_write(&self, value: &str, now: &DateTime<Utc>) -> Result<()> {
        self.store
            .put(VERSION_KEY, &record(value, now))
            .await
            .context(StorageSnafu { tier: self.name() })
    }
    async fn clear(&self) -> Result<()> {
        self.store
            .delete(VERSION_KEY)
            .await
            .context(StorageSnafu { tier: self.name() })
    }
}

/// Which write failures cascade to the next tier
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CascadeOn {
    /// Only quota & rate-limit rejections
    Quota,
    /// Any failure at all
    #[default]
    AnyError,
}

/// How the [VersionCache] moves between tiers
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    pub cascade_on: CascadeOn,
    /// After a successful write, clear all the tiers below the one written
    pub clear_lower: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            cascade_on: CascadeOn::default(),
            clear_lower: true,
        }
    }
}

/// The result of a cache lookup
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// `value` was found in the tier named `tier`
    Hit { value: String, tier: String },
    Miss,
}

pub struct VersionCache {
    tiers: Vec<Box<dyn Tier + Send + Sync>>,
    policy: Policy,
}

impl VersionCache {
    pub fn new(tiers: Vec<Box<dyn Tier + Send + Sync>>, policy: Policy) -> Result<VersionCache> {
        if tiers.is_empty() {
            return NoTiersSnafu.fail();
        }
        Ok(VersionCache { tiers, policy })
    }
    /// The usual arrangement: a TTL-checked tier on the `cache` partition backed by a fallback
    /// tier on the `blobs` partition
    pub fn two_tier(
        primary: Arc<dyn Backend + Send + Sync>,
        fallback: Arc<dyn Backend + Send + Sync>,
        ttl: Duration,
        fallback_max_age: Option<Duration>,
        policy: Policy,
    ) -> VersionCache {
        VersionCache {
            tiers: vec![
                Box::new(PrimaryTier::new(primary, ttl)),
                Box::new(FallbackTier::new(fallback, fallback_max_age)),
            ],
            policy,
        }
    }
    /// Look up the current version; the first tier with a fresh value wins
    ///
    /// A tier whose store can't be reached is skipped. A record that's there but malformed is a
    /// hard error.
    pub async fn get_current(&self, now: &DateTime<Utc>) -> Result<Lookup> {
        for tier in &self.tiers {
            match tier.try_read(now).await {
                Ok(Some(value)) => {
                    version_cache_hits.add(1, &[KeyValue::new("tier", tier.name().to_owned())]);
                    return Ok(Lookup::Hit {
                        value,
                        tier: tier.name().to_owned(),
                    });
                }
                Ok(None) => (),
                Err(err @ Error::Storage { .. }) => {
                    warn!("Reading the {} tier failed ({err}); skipping it", tier.name());
                    version_cache_read_failures
                        .add(1, &[KeyValue::new("tier", tier.name().to_owned())]);
                }
                Err(err) => return Err(err),
            }
        }
        version_cache_misses.add(1, &[]);
        Ok(Lookup::Miss)
    }
    /// Store `value` (fetched at `now`) in the first tier that will take it; return the name of
    /// that tier
    ///
    /// A write failure only escapes if there's no tier left to cascade to, or if the policy says
    /// this kind of failure doesn't cascade.
    pub async fn refresh(&self, value: &str, now: &DateTime<Utc>) -> Result<String> {
        let mut tiers = self.tiers.iter().enumerate().peekable();
        while let Some((idx, tier)) = tiers.next() {
            match tier.try_write(value, now).await {
                Ok(()) => {
                    if self.policy.clear_lower {
                        for lower in &self.tiers[idx + 1..] {
                            if let Err(err) = lower.clear().await {
                                warn!("Failed to clear the {} tier: {err}", lower.name());
                            }
                        }
                    }
                    return Ok(tier.name().to_owned());
                }
                Err(err) => {
                    let cascade = match self.policy.cascade_on {
                        CascadeOn::Quota => err.is_quota(),
                        CascadeOn::AnyError => true,
                    };
                    if !cascade || tiers.peek().is_none() {
                        return Err(err);
                    }
                    warn!(
                        "Writing the version to the {} tier failed ({err}); falling back",
                        tier.name()
                    );
                    version_cache_write_fallbacks.add(1, &[]);
                }
            }
        }
        // `self.tiers` is non-empty, so the loop always returns
        NoTiersSnafu.fail()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    use crate::memory;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn tags() {
        assert_eq!(normalize_tag("v1.2.3"), "1.2.3");
        assert_eq!(normalize_tag("1.2.3"), "1.2.3");
        assert_eq!(normalize_tag("vv1.2.3"), "v1.2.3");
        assert_eq!(normalize_tag("V1.2.3"), "V1.2.3");
        assert_eq!(normalize_tag(""), "");
    }

    #[tokio::test]
    async fn ttl() {
        let primary = Arc::new(memory::Store::new());
        let fallback = Arc::new(memory::Store::new());
        let cache = VersionCache::two_tier(
            primary,
            fallback,
            Duration::seconds(3600),
            None,
            Policy::default(),
        );
        assert_eq!(cache.get_current(&t0()).await.unwrap(), Lookup::Miss);
        assert_eq!(cache.refresh("1.2.3", &t0()).await.unwrap(), "primary");
        let just_before = t0() + Duration::seconds(3599);
        assert_eq!(
            cache.get_current(&just_before).await.unwrap(),
            Lookup::Hit {
                value: "1.2.3".to_owned(),
                tier: "primary".to_owned()
            }
        );
        let expiry = t0() + Duration::seconds(3600);
        assert_eq!(cache.get_current(&expiry).await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn fallback_on_quota() {
        let primary = Arc::new(memory::Store::with_write_quota(0));
        let fallback = Arc::new(memory::Store::new());
        let cache = VersionCache::two_tier(
            primary.clone(),
            fallback.clone(),
            Duration::seconds(60),
            None,
            Policy::default(),
        );
        assert_eq!(cache.refresh("2.0.0", &t0()).await.unwrap(), "fallback");
        assert!(primary.is_empty().await);
        // The fallback tier has no TTL
        let much_later = t0() + Duration::days(30);
        assert_eq!(
            cache.get_current(&much_later).await.unwrap(),
            Lookup::Hit {
                value: "2.0.0".to_owned(),
                tier: "fallback".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn primary_write_clears_fallback() {
        let primary = Arc::new(memory::Store::new());
        let fallback = Arc::new(memory::Store::new());
        fallback
            .put(VERSION_KEY, &record("1.0.0", &t0()))
            .await
            .unwrap();
        let cache = VersionCache::two_tier(
            primary,
            fallback.clone(),
            Duration::seconds(60),
            None,
            Policy::default(),
        );
        cache.refresh("1.1.0", &t0()).await.unwrap();
        assert!(fallback.is_empty().await);
    }

    #[tokio::test]
    async fn cascade_only_on_quota() {
        // Nothing to cascade to: the failure surfaces
        let cache = VersionCache::new(
            vec![Box::new(PrimaryTier::new(
                Arc::new(memory::Store::with_write_quota(0)),
                Duration::seconds(60),
            ))],
            Policy {
                cascade_on: CascadeOn::Quota,
                clear_lower: true,
            },
        )
        .unwrap();
        let err = cache.refresh("1.0.0", &t0()).await.unwrap_err();
        assert!(err.is_quota());

        assert!(matches!(
            VersionCache::new(vec![], Policy::default()),
            Err(Error::NoTiers { .. })
        ));
    }

    #[tokio::test]
    async fn missing_metadata_is_an_error() {
        let primary = Arc::new(memory::Store::new());
        primary.put(VERSION_KEY, &Item::new("1.0.0")).await.unwrap();
        let cache = VersionCache::two_tier(
            primary,
            Arc::new(memory::Store::new()),
            Duration::seconds(60),
            None,
            Policy::default(),
        );
        assert!(matches!(
            cache.get_current(&t0()).await,
            Err(Error::MissingMetadata { .. })
        ));
    }

    /// A store that can't be read from
    struct Unreachable;

    #[async_trait]
    impl Backend for Unreachable {
        async fn get(&self, _key: &str) -> storage::Result<Option<Item>> {
            Err(storage::Error::new(std::io::Error::other("unavailable")))
        }
        async fn put(&self, _key: &str, _item: &Item) -> storage::Result<()> {
            Err(storage::Error::new(std::io::Error::other("unavailable")))
        }
        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _item: &Item,
        ) -> storage::Result<bool> {
            Err(storage::Error::new(std::io::Error::other("unavailable")))
        }
        async fn delete(&self, _key: &str) -> storage::Result<()> {
            Err(storage::Error::new(std::io::Error::other("unavailable")))
        }
    }

    #[tokio::test]
    async fn unreachable_primary_degrades() {
        let fallback = Arc::new(memory::Store::new());
        fallback
            .put(VERSION_KEY, &record("1.0.0", &t0()))
            .await
            .unwrap();
        let cache = VersionCache::two_tier(
            Arc::new(Unreachable),
            fallback.clone(),
            Duration::seconds(60),
            None,
            Policy::default(),
        );
        assert_eq!(
            cache.get_current(&t0()).await.unwrap(),
            Lookup::Hit {
                value: "1.0.0".to_owned(),
                tier: "fallback".to_owned()
            }
        );

        // ...and with nothing in the fallback tier, it's a plain miss
        fallback.delete(VERSION_KEY).await.unwrap();
        assert_eq!(cache.get_current(&t0()).await.unwrap(), Lookup::Miss);

        // Writes cascade past the unreachable tier, too
        assert_eq!(cache.refresh("1.1.0", &t0()).await.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn fallback_max_age() {
        let fallback = Arc::new(memory::Store::new());
        fallback
            .put(VERSION_KEY, &record("1.0.0", &t0()))
            .await
            .unwrap();
        let tier = FallbackTier::new(fallback, Some(Duration::days(7)));
        assert_eq!(
            tier.try_read(&(t0() + Duration::days(6))).await.unwrap(),
            Some("1.0.0".to_owned())
        );
        assert_eq!(tier.try_read(&(t0() + Duration::days(7))).await.unwrap(), None);
    }
}
