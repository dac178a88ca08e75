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

//! # The popcon Integration Test Framework
//!
//! Each test gets a fresh [Fixture]: the full popcon [Router] over in-memory stores, with a
//! [MockServer] standing in for the GitHub API. Requests are driven through the router directly,
//! so no ports are involved.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
};
use chrono::Duration;
use http_body_util::BodyExt;
use lazy_static::lazy_static;
use libtest_mimic::Failed;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use popcon::{
    contest::{Contest, LogSink},
    http::{HeaderNames, make_router},
    memory,
    popcon::Popcon,
    releases::{GitHub, GitHubConfig, user_agent},
    stats::Aggregator,
    storage::{self, Backend, DedupPolicy, Item},
    user_agent::Parser,
    version_cache::{Policy, VersionCache},
    votes::{self, Ledger},
};

pub const MARKER: &str = "Ecoji";

pub const ISSUE_TRACKER: &str = "https://github.com/someone/ecoji/issues";

pub const RELEASES_PATH: &str = "/repos/someone/ecoji/releases";

lazy_static! {
    /// One meter provider for the whole test program
    ///
    /// The instruments are process-wide statics bound to whichever provider is global when they're
    /// first used, so every [Fixture] has to share this one (& it has to be installed before any
    /// request is served).
    static ref TELEMETRY: (SdkMeterProvider, PrometheusExporter) = {
        let exporter = PrometheusExporter::new();
        let provider = SdkMeterProvider::builder()
            .with_reader(exporter.clone())
            .build();
        opentelemetry::global::set_meter_provider(provider.clone());
        (provider, exporter)
    };
}

/// Knobs the individual tests may turn
#[derive(Clone, Debug)]
pub struct Options {
    pub cache_write_quota: Option<u64>,
    pub policy: DedupPolicy,
    pub ttl: Duration,
    /// Stall every vote ledger read, so that concurrent requests for the same requester all read
    /// the ledger before any of them writes it
    pub slow_ledger_reads: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cache_write_quota: None,
            policy: DedupPolicy::Relaxed,
            ttl: Duration::hours(1),
            slow_ledger_reads: false,
        }
    }
}

/// A [Backend] whose reads take a while
pub struct Sluggish(pub Arc<memory::Store>);

#[async_trait]
impl Backend for Sluggish {
    async fn get(&self, key: &str) -> storage::Result<Option<Item>> {
        let item = self.0.get(key).await?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(item)
    }
    async fn put(&self, key: &str, item: &Item) -> storage::Result<()> {
        self.0.put(key, item).await
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        item: &Item,
    ) -> storage::Result<bool> {
        self.0.compare_and_swap(key, expected, item).await
    }
    async fn delete(&self, key: &str) -> storage::Result<()> {
        self.0.delete(key).await
    }
}

pub struct Fixture {
    pub router: Router,
    pub upstream: MockServer,
    pub cache: Arc<memory::Store>,
    pub blobs: Arc<memory::Store>,
    pub votes: Arc<memory::Store>,
}

impl Fixture {
    pub async fn new(opts: Options) -> Result<Fixture, Failed> {
        let upstream = MockServer::start().await;
        let cache = Arc::new(
            opts.cache_write_quota
                .map(memory::Store::with_write_quota)
                .unwrap_or_default(),
        );
        let blobs = Arc::new(memory::Store::new());
        let votes = Arc::new(memory::Store::new());

        let github = GitHub::new(
            &GitHubConfig {
                api_base: Url::parse(&upstream.uri())?,
                owner: "someone".to_owned(),
                repo: "ecoji".to_owned(),
                ..Default::default()
            },
            &user_agent(),
        )?;

        let ledger: Arc<dyn Backend + Send + Sync> = if opts.slow_ledger_reads {
            Arc::new(Sluggish(votes.clone()))
        } else {
            votes.clone()
        };

        let stats = Arc::new(Aggregator::new(blobs.clone(), opts.policy));
        let contest = Contest::new(
            Parser::new(MARKER)?,
            Ledger::new(ledger, votes::Config::new(48, opts.policy)?),
            stats.clone(),
        );

        let state = Arc::new(Popcon {
            versions: VersionCache::two_tier(
                cache.clone(),
                blobs.clone(),
                opts.ttl,
                None,
                Policy::default(),
            ),
            releases: Arc::new(github),
            contest: Arc::new(contest),
            stats,
            headers: HeaderNames::default(),
            issue_tracker: ISSUE_TRACKER.to_owned(),
            exporter: TELEMETRY.1.clone(),
            // Tallying synchronously lets the tests check `/stats` right after `/version`
            await_tally: true,
            sink: Arc::new(LogSink),
        });

        Ok(Fixture {
            router: make_router(state),
            upstream,
            cache,
            blobs,
            votes,
        })
    }
    /// Have the mock GitHub API list `tags`, newest first
    pub async fn releases(&self, tags: &[&str]) {
        Mock::given(method("GET"))
            .and(path(RELEASES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(
                tags.iter().map(|tag| json!({ "tag_name": tag })).collect(),
            )))
            .mount(&self.upstream)
            .await;
    }
    /// Have the mock GitHub API fail every request with `status`
    pub async fn upstream_failure(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(RELEASES_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.upstream)
            .await;
    }
    /// The number of requests the mock GitHub API has seen
    pub async fn upstream_requests(&self) -> usize {
        self.upstream
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }
    /// Issue a `GET` for `uri` with the given request headers
    pub async fn get(
        &self,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> Result<(StatusCode, HeaderMap, String), Failed> {
        self.send(Method::GET, uri, headers).await
    }
    /// Issue a bodiless `POST` for `uri`
    pub async fn post(&self, uri: &str) -> Result<(StatusCode, HeaderMap, String), Failed> {
        self.send(Method::POST, uri, &[]).await
    }
    async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> Result<(StatusCode, HeaderMap, String), Failed> {
        let request = headers
            .iter()
            .fold(
                Request::builder().method(method).uri(uri),
                |builder, (name, value)| builder.header(*name, *value),
            )
            .body(Body::empty())?;
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, headers, String::from_utf8(body.to_vec())?))
    }
    /// Fetch `/stats` & return this month's report
    pub async fn this_month(&self) -> Result<Value, Failed> {
        let (status, _, body) = self.get("/stats", &[]).await?;
        if status != StatusCode::OK {
            return Err(format!("/stats returned {status}: {body}").into());
        }
        let mut rsp: Value = serde_json::from_str(&body)?;
        Ok(rsp["thisMonth"].take())
    }
}

/// Run `f` to completion on a fresh Tokio runtime
pub fn block_on<F>(f: F) -> Result<(), Failed>
where
    F: Future<Output = Result<(), Failed>>,
{
    block_on_with(f)
}

/// Run `f` to completion on a fresh Tokio runtime & return its output
pub fn block_on_with<T, F>(f: F) -> Result<T, Failed>
where
    F: Future<Output = Result<T, Failed>>,
{
    tokio::runtime::Runtime::new()?.block_on(f)
}

/// Compare `actual` against `expected`, producing a readable failure
pub fn check<T: PartialEq + std::fmt::Debug>(what: &str, actual: T, expected: T) -> Result<(), Failed> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{what}: expected {expected:?}, got {actual:?}").into())
    }
}

pub struct Test {
    pub name: &'static str,
    pub test_fn: fn() -> std::result::Result<(), Failed>,
}

inventory::collect!(Test);
