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

//! # releases
//!
//! Finding out what the latest release is.
//!
//! The upstream source of truth is a release listing on a source-hosting service (GitHub, for
//! now). The project publishes a rolling "continuous" pre-release alongside its real releases; that
//! tag is never the answer.

use async_trait::async_trait;
use http::{
    HeaderValue, StatusCode,
    header::{ACCEPT, AUTHORIZATION},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;
use tracing::debug;
use url::Url;

use crate::{define_metric, metrics::Sort, version_cache::normalize_tag};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    ReqwestClient {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The release listing couldn't be deserialized: {source}"))]
    Json {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The release listing request failed: {source}"))]
    Request {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The release listing request returned status {status}"))]
    Status {
        status: StatusCode,
        backtrace: Backtrace,
    },
    #[snafu(display("The API token is not a legal header value: {source}"))]
    Token {
        source: http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to form the release listing URL: {source}"))]
    Url {
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "releases.requests", releases_requests, Sort::IntegralCounter }
define_metric! { "releases.errors",   releases_errors,   Sort::IntegralCounter }

/// The tag of the rolling pre-release, which is never "the latest version"
pub const SENTINEL: &str = "continuous";

/// A single release, as far as popcon cares
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Release {
    #[serde(rename = "tag_name")]
    pub tag: String,
}

/// What a release listing says the latest version is
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// The latest version, normalized
    Latest(String),
    /// There were no releases at all
    NoReleases,
    /// There were releases, but they were all the sentinel
    OnlyContinuous,
}

/// Pick the latest version out of `releases` (newest first)
pub fn resolve_latest(releases: &[Release]) -> Resolution {
    if releases.is_empty() {
        return Resolution::NoReleases;
    }
    match releases.iter().find(|release| release.tag != SENTINEL) {
        Some(release) => Resolution::Latest(normalize_tag(&release.tag).to_owned()),
        None => Resolution::OnlyContinuous,
    }
}

/// A source of release listings
#[async_trait]
pub trait ReleaseSource {
    /// The most recent releases, newest first
    async fn list_recent_releases(&self) -> Result<Vec<Release>>;
}

fn default_api_base() -> Url {
    Url::parse("https://api.github.com").unwrap(/* known good */)
}

fn default_page_size() -> u8 {
    10
}

/// GitHub release source configuration
#[derive(Clone, Debug, Deserialize)]
pub struct GitHubConfig {
    #[serde(rename = "api-base", default = "default_api_base")]
    pub api_base: Url,
    pub owner: String,
    pub repo: String,
    #[serde(rename = "page-size", default = "default_page_size")]
    pub page_size: u8,
    /// Optional API token; unauthenticated requests get a much lower rate limit
    pub token: Option<SecretString>,
}

impl Default for GitHubConfig {
    /// No repository; useful only as a placeholder
    fn default() -> Self {
        GitHubConfig {
            api_base: default_api_base(),
            owner: String::new(),
            repo: String::new(),
            page_size: default_page_size(),
            token: None,
        }
    }
}

/// [ReleaseSource] implementation that asks the GitHub REST API
pub struct GitHub {
    client: reqwest::Client,
    url: Url,
    token: Option<SecretString>,
}

impl GitHub {
    pub fn new(config: &GitHubConfig, user_agent: &str) -> Result<GitHub> {
        let mut url = Url::parse(&format!(
            "{}/repos/{}/{}/releases",
            config.api_base.as_str().trim_end_matches('/'),
            config.owner,
            config.repo
        ))
        .context(UrlSnafu)?;
        url.query_pairs_mut()
            .append_pair("per_page", &config.page_size.to_string());
        reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context(ReqwestClientSnafu)?
            .pipe(|client| GitHub {
                client,
                url,
                token: config.token.clone(),
            })
            .pipe(Ok)
    }
}

#[async_trait]
impl ReleaseSource for GitHub {
    async fn list_recent_releases(&self) -> Result<Vec<Release>> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        if let Some(token) = &self.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .context(TokenSnafu)?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }

        releases_requests.add(1, &[]);
        let response = request.send().await.context(RequestSnafu).inspect_err(|_| {
            releases_errors.add(1, &[]);
        })?;
        let status = response.status();
        if !status.is_success() {
            releases_errors.add(1, &[]);
            return StatusSnafu { status }.fail();
        }
        let releases = response.json::<Vec<Release>>().await.context(JsonSnafu)?;
        debug!("{} lists {} releases", self.url, releases.len());
        Ok(releases)
    }
}

/// The user agent popcon presents upstream; GitHub rejects requests without one
pub fn user_agent() -> String {
    format!("popcon/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod test {
    use super::*;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, header_exists, method, path, query_param},
    };

    fn release(tag: &str) -> Release {
        Release {
            tag: tag.to_owned(),
        }
    }

    #[test]
    fn resolution() {
        assert_eq!(
            resolve_latest(&[release("continuous"), release("v2.0.0")]),
            Resolution::Latest("2.0.0".to_owned())
        );
        assert_eq!(
            resolve_latest(&[release("v3.1"), release("v3.0")]),
            Resolution::Latest("3.1".to_owned())
        );
        assert_eq!(
            resolve_latest(&[release("continuous")]),
            Resolution::OnlyContinuous
        );
        assert_eq!(resolve_latest(&[]), Resolution::NoReleases);
    }

    fn config(server: &MockServer, token: Option<&str>) -> GitHubConfig {
        GitHubConfig {
            api_base: Url::parse(&server.uri()).unwrap(),
            owner: "someone".to_owned(),
            repo: "app".to_owned(),
            page_size: 5,
            token: token.map(|s| SecretString::from(s.to_owned())),
        }
    }

    #[tokio::test]
    async fn github_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/someone/app/releases"))
            .and(query_param("per_page", "5"))
            .and(header("accept", "application/vnd.github+json"))
            .and(header("authorization", "Bearer sekrit"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "tag_name": "continuous", "name": "Continuous build" },
                { "tag_name": "v1.5.0", "name": "1.5.0" },
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let github = GitHub::new(&config(&server, Some("sekrit")), &user_agent()).unwrap();
        let releases = github.list_recent_releases().await.unwrap();
        assert_eq!(releases, vec![release("continuous"), release("v1.5.0")]);
        assert_eq!(
            resolve_latest(&releases),
            Resolution::Latest("1.5.0".to_owned())
        );
    }

    #[tokio::test]
    async fn github_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let github = GitHub::new(&config(&server, None), &user_agent()).unwrap();
        assert!(matches!(
            github.list_recent_releases().await,
            Err(Error::Status { status, .. }) if status == StatusCode::FORBIDDEN
        ));
    }
}
