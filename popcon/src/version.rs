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

//! # The `/version` endpoint
//!
//! Clients ask `/version` for the latest release version, and that request is also their vote in
//! the popularity contest. The vote is tallied first (awaited or detached, per configuration) and
//! can never affect the response.
//!
//! `?fake=<value>` echoes `<value>` back without consulting the cache, which lets client
//! developers exercise their "new version available" paths.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, info};

use crate::{
    contest::{VoteRequest, spawn_tally},
    define_metric,
    http::{HeaderNames, header_string, internal_error, not_found},
    metrics::Sort,
    popcon::Popcon,
    releases::{self, Resolution, resolve_latest},
    version_cache::{self, Lookup},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While consulting the version cache, {source}"))]
    Cache { source: version_cache::Error },
    #[snafu(display("While listing releases, {source}"))]
    Releases { source: releases::Error },
}

type Result<T> = std::result::Result<T, Error>;

define_metric! { "version.served",    version_served,    Sort::IntegralCounter }
define_metric! { "version.not_found", version_not_found, Sort::IntegralCounter }
define_metric! { "version.fakes",     version_fakes,     Sort::IntegralCounter }

#[derive(Debug, Deserialize)]
struct VersionParams {
    fake: Option<String>,
}

/// Pull the vote-relevant headers out of a request
pub fn vote_request(names: &HeaderNames, headers: &HeaderMap) -> VoteRequest {
    VoteRequest {
        identity: header_string(headers, &names.identity),
        language: header_string(headers, &names.language),
        version: header_string(headers, &names.version),
        requester: header_string(headers, &names.requester),
    }
}

/// Find the latest version: from the cache if possible, from upstream if not
async fn latest_version(state: &Popcon, now: &DateTime<Utc>) -> Result<Resolution> {
    if let Lookup::Hit { value, tier } = state.versions.get_current(now).await.context(CacheSnafu)? {
        debug!("Version {value} served from the {tier} tier");
        return Ok(Resolution::Latest(value));
    }

    let resolution = resolve_latest(
        &state
            .releases
            .list_recent_releases()
            .await
            .context(ReleasesSnafu)?,
    );
    if let Resolution::Latest(value) = &resolution {
        // A failure to cache is no reason to fail the request
        match state.versions.refresh(value, now).await {
            Ok(tier) => info!("Cached version {value} in the {tier} tier"),
            Err(err) => error!("Failed to cache version {value}: {err:?}"),
        }
    }
    Ok(resolution)
}

/// `GET /version` handler
async fn version(
    State(state): State<Arc<Popcon>>,
    Query(params): Query<VersionParams>,
    headers: HeaderMap,
) -> Response {
    let now = Utc::now();
    let vote = vote_request(&state.headers, &headers);
    if state.await_tally {
        if let Err(err) = state.contest.tally_and_report(&vote, &now).await {
            state.sink.report(err);
        }
    } else {
        spawn_tally(state.contest.clone(), vote, now, state.sink.clone());
    }

    if let Some(fake) = params.fake {
        version_fakes.add(1, &[]);
        return fake.into_response();
    }

    match latest_version(&state, &now).await {
        Ok(Resolution::Latest(value)) => {
            version_served.add(1, &[]);
            value.into_response()
        }
        Ok(Resolution::NoReleases) => {
            version_not_found.add(1, &[]);
            (StatusCode::NOT_FOUND, "No releases found").into_response()
        }
        Ok(Resolution::OnlyContinuous) => {
            version_not_found.add(1, &[]);
            (
                StatusCode::NOT_FOUND,
                "No releases found (except continuous)",
            )
                .into_response()
        }
        Err(err) => {
            error!("{:?}", err);
            internal_error(&state, &headers)
        }
    }
}

pub fn make_router(state: Arc<Popcon>) -> Router<Arc<Popcon>> {
    Router::new()
        .route("/version", get(version).fallback(not_found))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::http::HeaderValue;

    #[test]
    fn vote_requests() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "user-agent",
            HeaderValue::from_static("Ecoji 1.2 on Windows 10"),
        );
        headers.insert("x-app-language", HeaderValue::from_static("fr_FR"));
        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.2"));
        let vote = vote_request(&HeaderNames::default(), &headers);
        assert_eq!(vote.identity.as_deref(), Some("Ecoji 1.2 on Windows 10"));
        assert_eq!(vote.language.as_deref(), Some("fr_FR"));
        assert_eq!(vote.version, None);
        assert_eq!(vote.requester.as_deref(), Some("198.51.100.2"));
    }
}
