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

//! # popcon application state

use std::sync::Arc;

use opentelemetry_prometheus_text_exporter::PrometheusExporter;

use crate::{
    contest::{Contest, ErrorSink},
    http::HeaderNames,
    releases::ReleaseSource,
    stats::Aggregator,
    version_cache::VersionCache,
};

pub struct Popcon {
    pub versions: VersionCache,
    pub releases: Arc<dyn ReleaseSource + Send + Sync>,
    pub contest: Arc<Contest>,
    pub stats: Arc<Aggregator>,
    pub headers: HeaderNames,
    /// Where users should report problems; quoted in 500 responses
    pub issue_tracker: String,
    pub exporter: PrometheusExporter,
    /// If true, `/version` waits for the vote to be tallied before responding
    pub await_tally: bool,
    pub sink: Arc<dyn ErrorSink + Send + Sync>,
}
