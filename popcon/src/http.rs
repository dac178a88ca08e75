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

//! # popcon HTTP shell
//!
//! Everything needed to stand-up the popcon [Router]: the request headers we pay attention to,
//! the handlers that aren't specific to any one module, the error response, and the middleware.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use axum::{
    Router,
    extract::{MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use opentelemetry::KeyValue;
use serde::Deserialize;
use tap::Pipe;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::error;

use crate::{define_metric, metrics::Sort, popcon::Popcon, stats, version};

/// The header popcon uses for its own request IDs
pub const REQUEST_ID: &str = "x-request-id";

fn default_identity() -> String {
    "user-agent".to_owned()
}

fn default_language() -> String {
    "x-app-language".to_owned()
}

fn default_version() -> String {
    "x-app-version".to_owned()
}

fn default_requester() -> String {
    "cf-connecting-ip".to_owned()
}

fn default_trace() -> String {
    "cf-ray".to_owned()
}

/// The request headers popcon consults
///
/// The defaults suit a deployment behind Cloudflare; behind some other edge the address & trace
/// headers will likely be different.
#[derive(Clone, Debug, Deserialize)]
pub struct HeaderNames {
    /// The free-form client identity string
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Client language, for legacy clients
    #[serde(default = "default_language")]
    pub language: String,
    /// Client version, for legacy clients
    #[serde(default = "default_version")]
    pub version: String,
    /// The caller's network address, as reported by the edge; used as the vote deduplication key
    #[serde(default = "default_requester")]
    pub requester: String,
    /// Edge-provided trace ID, quoted in 500 responses
    #[serde(default = "default_trace")]
    pub trace: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        HeaderNames {
            identity: default_identity(),
            language: default_language(),
            version: default_version(),
            requester: default_requester(),
            trace: default_trace(),
        }
    }
}

/// Retrieve header `name` from `headers` as a `String`; absent, empty or non-visible-ASCII headers
/// are treated alike
pub fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Build the response for an error on the synchronous request path
///
/// The body quotes a correlation ID (the edge's trace ID if we have one, our own request ID if
/// not) & points at the issue tracker. It never includes the error itself; that goes to the log.
pub fn internal_error(state: &Popcon, headers: &HeaderMap) -> Response {
    let id = header_string(headers, &state.headers.trace)
        .or_else(|| header_string(headers, REQUEST_ID))
        .unwrap_or_else(|| "unknown".to_owned());
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!(
            "Internal server error (request {}). Please report this at {}",
            id, state.issue_tracker
        ),
    )
        .into_response()
}

define_metric! { "http.requests", http_requests, Sort::IntegralCounter }

/// The route attribute for requests that matched no route; keeps the attribute set bounded
const UNMATCHED: &str = "unmatched";

/// Count requests by method & route
///
/// The route is the *matched* route template, never the raw path: the fallback answers any path at
/// all, and a label per path would grow without bound.
async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED.to_owned());
    let method = match *request.method() {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::OPTIONS => "OPTIONS",
        Method::PATCH => "PATCH",
        _ => "other",
    };
    http_requests.add(
        1,
        &[KeyValue::new("method", method), KeyValue::new("route", route)],
    );
    next.run(request).await
}

const INDEX: &str = include_str!("../assets/index.html");

async fn index() -> Html<&'static str> {
    Html(INDEX)
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Popcon>>, headers: HeaderMap) -> Response {
    let mut output = Vec::new();
    if let Err(err) = state.exporter.export(&mut output) {
        error!("Failed to encode Prometheus metrics: {err:?}");
        return internal_error(&state, &headers);
    }
    match String::from_utf8(output) {
        Ok(text) => text.into_response(),
        Err(err) => {
            error!("Non UTF-8 Prometheus exporter output: {err}");
            internal_error(&state, &headers)
        }
    }
}

/// Answer anything we don't serve, including the wrong method on a route we do
pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Generate request IDs by simply incrementing a counter
///
/// Easier to read than a UUID, and a rough gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| HeaderValue::from_str(&s).ok())
            .map(RequestId::new)
    }
}

/// Make the popcon [Router]
pub fn make_router(state: Arc<Popcon>) -> Router {
    Router::new()
        .route("/", get(index).fallback(not_found))
        .route("/healthcheck", get(healthcheck).fallback(not_found))
        .route("/metrics", get(metrics).fallback(not_found))
        .merge(version::make_router(state.clone()))
        .merge(stats::make_router(state.clone()))
        .fallback(not_found)
        // Incoming requests should hit the `SetRequestIdLayer` *first*, so it's applied last:
        //
        //                 requests
        //                    |
        //                    v
        // +---------  SetRequestIdLayer      ---------+
        // | +-------      OTEL layer         -------+ |
        // | | +-----      TraceLayer         -----+ | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | | |                               | | | |
        // | | | |          handler              | | | |
        // | | | |                               | | | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | +-----      TraceLayer         -----+ | |
        // | +-------      OTEL Layer         -------+ |
        // +---------   SetRequestIdLayer     ---------+
        //                    |
        //                    v
        //                responses
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID,
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}
