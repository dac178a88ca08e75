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

//! # contest
//!
//! The popularity contest proper: turning one inbound request into (at most) one vote.
//!
//! For each request:
//!
//! 1. parse the identity string; requests from unrecognized clients are skipped
//! 2. determine the requester key; without one we can't deduplicate, so that's an error
//! 3. check the vote ledger & record the vote, unless this requester already voted today with this
//!    identity string
//! 4. increment this month's statistics
//!
//! None of this is allowed to affect the response to the request that carried the vote. It can be
//! awaited (in which case failures are logged by the caller) or handed to [spawn_tally], which runs
//! it as a detached task and reports failures to an [ErrorSink].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    define_metric,
    metrics::Sort,
    stats::{self, Aggregator, month_key},
    user_agent::{self, AuxiliaryHeaders, Parser},
    votes::{self, Ledger},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The requester key couldn't be determined; is the address header missing?"))]
    NoRequesterKey { backtrace: Backtrace },
    #[snafu(display("While updating monthly stats, {source}"))]
    Stats {
        #[snafu(source(from(stats::Error, Box::new)))]
        source: Box<stats::Error>,
    },
    #[snafu(display("While parsing the identity string, {source}"))]
    UserAgent { source: user_agent::Error },
    #[snafu(display("While consulting the vote ledger, {source}"))]
    Votes {
        #[snafu(source(from(votes::Error, Box::new)))]
        source: Box<votes::Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "contest.tallies",  contest_tallies,  Sort::IntegralCounter }
define_metric! { "contest.failures", contest_failures, Sort::IntegralCounter }

/// The vote-relevant parts of an inbound request
#[derive(Clone, Debug, Default)]
pub struct VoteRequest {
    /// The free-form identity string (the User-Agent)
    pub identity: Option<String>,
    /// Legacy clients' language header
    pub language: Option<String>,
    /// Legacy clients' version header
    pub version: Option<String>,
    /// The caller's network address, as reported by the edge
    pub requester: Option<String>,
}

/// What became of a request's vote
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tally {
    /// Not from a recognized client
    Skipped,
    /// This requester already voted today with this identity
    Duplicate,
    Counted,
}

impl Tally {
    fn as_str(&self) -> &'static str {
        match self {
            Tally::Skipped => "skipped",
            Tally::Duplicate => "duplicate",
            Tally::Counted => "counted",
        }
    }
}

pub struct Contest {
    parser: Parser,
    ledger: Ledger,
    aggregator: Arc<Aggregator>,
}

impl Contest {
    pub fn new(parser: Parser, ledger: Ledger, aggregator: Arc<Aggregator>) -> Contest {
        Contest {
            parser,
            ledger,
            aggregator,
        }
    }
    /// Count the vote carried by `request`, if any
    pub async fn tally(&self, request: &VoteRequest, now: &DateTime<Utc>) -> Result<Tally> {
        let identity = match request.identity.as_deref() {
            Some(identity) => identity,
            None => return Ok(Tally::Skipped),
        };
        let aux = AuxiliaryHeaders {
            language: request.language.as_deref(),
            version: request.version.as_deref(),
        };
        let info = match self.parser.parse(identity, &aux).context(UserAgentSnafu)? {
            Some(info) => info,
            None => return Ok(Tally::Skipped),
        };
        let key = request.requester.as_deref().context(NoRequesterKeySnafu)?;
        if !self
            .ledger
            .check_and_record(key, identity, now)
            .await
            .context(VotesSnafu)?
        {
            return Ok(Tally::Duplicate);
        }
        self.aggregator
            .increment(&month_key(now), &info)
            .await
            .context(StatsSnafu)?;
        Ok(Tally::Counted)
    }
    /// [tally](Contest::tally), with the outcome counted & logged
    pub async fn tally_and_report(
        &self,
        request: &VoteRequest,
        now: &DateTime<Utc>,
    ) -> Result<Tally> {
        let tally = self.tally(request, now).await?;
        debug!("Vote {}", tally.as_str());
        contest_tallies.add(1, &[KeyValue::new("outcome", tally.as_str())]);
        Ok(tally)
    }
}

/// Destination for errors from detached tallies
pub trait ErrorSink {
    fn report(&self, err: Error);
}

/// The default [ErrorSink]: log a warning & bump a counter
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, err: Error) {
        contest_failures.add(1, &[]);
        warn!("Failed to tally a vote: {err}");
    }
}

/// Tally `request` on a detached task
///
/// The returned handle needn't be awaited; any failure goes to `sink`.
pub fn spawn_tally(
    contest: Arc<Contest>,
    request: VoteRequest,
    now: DateTime<Utc>,
    sink: Arc<dyn ErrorSink + Send + Sync>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            if let Err(err) = contest.tally_and_report(&request, &now).await {
                sink.report(err);
            }
        }
        .instrument(info_span!("tally")),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    use chrono::TimeZone;

    use crate::{memory, storage::DedupPolicy};

    const UA: &str = "Ecoji/1.4.0 (Ubuntu 24.04; linux; 1.4.0; en_US)";

    fn contest() -> Contest {
        Contest::new(
            Parser::new("Ecoji").unwrap(),
            Ledger::new(Arc::new(memory::Store::new()), votes::Config::default()),
            Arc::new(Aggregator::new(
                Arc::new(memory::Store::new()),
                DedupPolicy::Relaxed,
            )),
        )
    }

    fn request(identity: Option<&str>, requester: Option<&str>) -> VoteRequest {
        VoteRequest {
            identity: identity.map(str::to_owned),
            requester: requester.map(str::to_owned),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn protocol() {
        let contest = contest();
        let now = Utc.with_ymd_and_hms(2025, 2, 28, 23, 0, 0).unwrap();

        assert_eq!(
            contest.tally(&request(None, Some("1.2.3.4")), &now).await.unwrap(),
            Tally::Skipped
        );
        assert_eq!(
            contest
                .tally(&request(Some("curl/8.0"), Some("1.2.3.4")), &now)
                .await
                .unwrap(),
            Tally::Skipped
        );
        assert!(matches!(
            contest.tally(&request(Some(UA), None), &now).await,
            Err(Error::NoRequesterKey { .. })
        ));
        assert!(matches!(
            contest
                .tally(&request(Some("Ecoji/1.0 (Linux)"), Some("1.2.3.4")), &now)
                .await,
            Err(Error::UserAgent { .. })
        ));

        let req = request(Some(UA), Some("1.2.3.4"));
        assert_eq!(contest.tally(&req, &now).await.unwrap(), Tally::Counted);
        assert_eq!(contest.tally(&req, &now).await.unwrap(), Tally::Duplicate);
        let stats = contest.aggregator.read_sorted("2025-02").await.unwrap();
        assert_eq!(stats.vote_count, Some(1));

        // Next day is next month, here
        let tomorrow = Utc.with_ymd_and_hms(2025, 3, 1, 1, 0, 0).unwrap();
        assert_eq!(contest.tally(&req, &tomorrow).await.unwrap(), Tally::Counted);
        let stats = contest.aggregator.read_sorted("2025-03").await.unwrap();
        assert_eq!(stats.vote_count, Some(1));
    }

    #[derive(Default)]
    struct Collector(Mutex<Vec<String>>);

    impl ErrorSink for Collector {
        fn report(&self, err: Error) {
            self.0.lock().unwrap().push(err.to_string());
        }
    }

    #[tokio::test]
    async fn detached_failures_go_to_the_sink() {
        let contest = Arc::new(contest());
        let sink = Arc::new(Collector::default());
        spawn_tally(
            contest.clone(),
            request(Some(UA), None),
            Utc::now(),
            sink.clone(),
        )
        .await
        .unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);

        spawn_tally(
            contest,
            request(Some(UA), Some("5.6.7.8")),
            Utc::now(),
            sink.clone(),
        )
        .await
        .unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
