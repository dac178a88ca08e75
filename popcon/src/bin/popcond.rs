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

//! # popcond
//!
//! The popcon server.
//!
//! popcond is meant to run in the foreground (in a container, or under a supervisor) behind an
//! edge proxy that supplies the caller's address & a trace ID in request headers. It logs to
//! stdout. SIGHUP re-reads the configuration file & rebuilds the storage connections; SIGTERM shuts
//! down gracefully.

use std::{env, fmt::Display, future::IntoFuture, io, net::SocketAddr, path::PathBuf, sync::Arc};

use chrono::Duration;
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::Notify,
};
use tracing::{Level, debug, error, info};
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt, layer::SubscriberExt};
use url::Url;

use popcon::{
    contest::{Contest, LogSink},
    dynamodb::{self, Credentials, Location as DynamoLocation, Tables},
    http::{HeaderNames, make_router},
    memory,
    metrics::{check_metric_names, metric_names},
    popcon::Popcon,
    releases::{self, GitHub, GitHubConfig},
    stats::Aggregator,
    storage::{DedupPolicy, Partitions},
    user_agent::{self, Parser},
    version_cache::{CascadeOn, Policy, VersionCache},
    votes::{self, Ledger},
};

/// The popcond application error type
///
/// [Debug] is implemented by hand, in terms of [Display], since `main()` returns `Result<(),
/// Error>` & the Rust runtime will print the `Debug` representation of any error it returns. The
/// derived implementation is neither readable nor brief.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to connect to DynamoDB: {source}"))]
    Dynamo { source: dynamodb::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to setup the GitHub release source: {source}"))]
    GitHub { source: releases::Error },
    #[snafu(display("The application marker is unusable: {source}"))]
    Marker { source: user_agent::Error },
    #[snafu(display("No GitHub repository was configured (github.owner & github.repo)"))]
    NoRepository,
    #[snafu(display("While building the OLTP exporter, {source}"))]
    OltpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Bad vote ledger configuration: {source}"))]
    Retention { source: votes::Error },
    #[snafu(display("Failed to install a handler for {signame}: {source}"))]
    Signal {
        signame: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

const DEFAULT_CONFIG: &str = "/etc/popcond.toml";

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
    /// Overrides any token given in the configuration file
    pub github_token: Option<SecretString>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
            github_token: matches
                .get_one::<String>("github-token")
                .map(|s| SecretString::from(s.clone())),
        })
    }
}

/// popcon datastore configuration
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    /// Keep everything in memory; nothing survives a restart (or a SIGHUP)
    #[serde(rename = "memory")]
    Memory {
        /// Daily write quota for the primary version cache store; handy for exercising the
        /// fallback tier
        #[serde(rename = "cache-write-quota", default)]
        cache_write_quota: Option<u64>,
    },
    /// Use DynamoDB, or anything speaking its protocol
    #[serde(rename = "dynamo")]
    Dynamo {
        /// AWS credentials: key ID & secret key; if not given, the usual AWS credential chain
        /// applies
        credentials: Option<Credentials>,
        location: DynamoLocation,
        #[serde(default)]
        tables: Tables,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            cache_write_quota: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<std::time::Duration>,
}

/// Version cache configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VersionCacheConfig {
    /// How long a version fetched from upstream is good for
    #[serde(rename = "ttl-seconds")]
    ttl_seconds: u32,
    /// If set, values in the fallback tier older than this are ignored
    #[serde(rename = "fallback-max-age-seconds")]
    fallback_max_age_seconds: Option<u32>,
    #[serde(rename = "cascade-on")]
    cascade_on: CascadeOn,
}

impl Default for VersionCacheConfig {
    fn default() -> Self {
        VersionCacheConfig {
            ttl_seconds: 3600,
            fallback_max_age_seconds: None,
            cascade_on: CascadeOn::default(),
        }
    }
}

/// popcon configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ConfigV1 {
    /// Local address at which to listen for requests; specify as "address:port"
    address: SocketAddr,
    /// OTLP export target; None means don't export
    otlp_export: Option<OtelExportConfig>,
    storage: StorageConfig,
    /// The token by which the application identifies itself in its User-Agent
    marker: String,
    /// Where users should report problems
    issue_tracker: String,
    github: GitHubConfig,
    version_cache: VersionCacheConfig,
    headers: HeaderNames,
    dedup_policy: DedupPolicy,
    /// Hours for which votes are remembered; must be at least 24
    vote_retention_hours: u32,
    /// Wait for each vote to be tallied before answering `/version`
    await_tally: bool,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            address: "0.0.0.0:20690".parse::<SocketAddr>().unwrap(/* known good */),
            otlp_export: None,
            storage: StorageConfig::default(),
            marker: "popcon".to_owned(),
            issue_tracker: "the project's issue tracker".to_owned(),
            github: GitHubConfig::default(),
            version_cache: VersionCacheConfig::default(),
            headers: HeaderNames::default(),
            dedup_policy: DedupPolicy::default(),
            vote_retention_hours: 48,
            await_tally: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the popcond configuration file
///
/// If no configuration file was named & the default isn't there, use the default configuration.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from(DEFAULT_CONFIG), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Configure popcond logging: JSON to stdout unless `--plain` was given
fn configure_logging(logopts: &LogOpts) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types, hence the box
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Build the three storage partitions according to configuration
async fn select_storage(config: &StorageConfig) -> Result<Partitions> {
    match config {
        StorageConfig::Memory { cache_write_quota } => Ok(Partitions {
            cache: Arc::new(
                cache_write_quota
                    .map(memory::Store::with_write_quota)
                    .unwrap_or_default(),
            ),
            blobs: Arc::new(memory::Store::new()),
            votes: Arc::new(memory::Store::new()),
        }),
        StorageConfig::Dynamo {
            credentials,
            location,
            tables,
        } => {
            let client = dynamodb::Client::new(location, credentials)
                .await
                .context(DynamoSnafu)?;
            Ok(Partitions {
                cache: Arc::new(client.table(&tables.cache)),
                blobs: Arc::new(client.table(&tables.blobs)),
                votes: Arc::new(client.table(&tables.votes)),
            })
        }
    }
}

/// Assemble the application state from configuration
async fn make_state(
    cfg: &ConfigV1,
    opts: &CliOpts,
    exporter: &PrometheusExporter,
) -> Result<Arc<Popcon>> {
    if cfg.github.owner.is_empty() || cfg.github.repo.is_empty() {
        return NoRepositorySnafu.fail();
    }
    let partitions = select_storage(&cfg.storage).await?;

    let mut github = cfg.github.clone();
    if opts.github_token.is_some() {
        github.token = opts.github_token.clone();
    }
    let releases = GitHub::new(&github, &releases::user_agent()).context(GitHubSnafu)?;

    let versions = VersionCache::two_tier(
        partitions.cache.clone(),
        partitions.blobs.clone(),
        Duration::seconds(i64::from(cfg.version_cache.ttl_seconds)),
        cfg.version_cache
            .fallback_max_age_seconds
            .map(|s| Duration::seconds(i64::from(s))),
        Policy {
            cascade_on: cfg.version_cache.cascade_on,
            clear_lower: true,
        },
    );

    let stats = Arc::new(Aggregator::new(partitions.blobs.clone(), cfg.dedup_policy));
    let ledger = Ledger::new(
        partitions.votes.clone(),
        votes::Config::new(cfg.vote_retention_hours, cfg.dedup_policy).context(RetentionSnafu)?,
    );
    let contest = Contest::new(
        Parser::new(&cfg.marker).context(MarkerSnafu)?,
        ledger,
        stats.clone(),
    );

    Ok(Arc::new(Popcon {
        versions,
        releases: Arc::new(releases),
        contest: Arc::new(contest),
        stats,
        headers: cfg.headers.clone(),
        issue_tracker: cfg.issue_tracker.clone(),
        exporter: exporter.clone(),
        await_tally: cfg.await_tally,
        sink: Arc::new(LogSink),
    }))
}

/// Serve popcon requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu { signame: "SIGHUP" })?;
    let mut sigterm =
        signal(SignalKind::terminate()).context(SignalSnafu { signame: "SIGTERM" })?;

    let exporter = init_telemetry(cfg.otlp_export.as_ref())?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our state each pass, in case configuration values have changed:
        let state = make_state(&cfg, &opts, &exporter).await?;

        let nfy = Arc::new(Notify::new());
        let server = axum::serve(
            TcpListener::bind(cfg.address)
                .await
                .context(BindSnafu { addr: cfg.address })?,
            make_router(state),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()));
        info!("Listening on {}", cfg.address);

        let mut server = server.into_future();

        tokio::select! {
            res = &mut server => {
                // This shouldn't happen
                error!("The server exited unexpectedly with {:?}; shutting-down.", res);
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                // Fall back to the last known-good configuration if the new one won't parse
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{err:?}; keeping the current configuration.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                break;
            }
        }
    }

    Ok(())
}

/// Initialize telemetry
///
/// <div class="warning">
///
/// This method must be invoked from inside the Tokio runtime, but before any instruments are
/// accessed.
///
/// </div>
///
/// Return an exporter that can be used to implement a `/metrics` endpoint; if configured, also
/// push metrics in OTLP format.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<PrometheusExporter> {
    check_metric_names();
    debug!("Registered metrics: {:?}", metric_names());
    let prometheus_exporter = PrometheusExporter::new();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "popcon"))
                .build(),
        )
        .with_reader(prometheus_exporter.clone());

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OltpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(prometheus_exporter)
}

/// Configure logging, then serve
///
/// Logging is configured here, not in `main()`, since it depends on the configuration file, and
/// before `serve()`, since that's instrumented & we'd like its span recorded.
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Failure to parse at this point is fatal; in `serve()`, we fall back to the last
    // "known-good" configuration & keep going.
    let cfg = match parse_config(&opts.cfg) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("While reading configuration: {err:?}");
            return Err(err);
        }
    };
    let (formatter, filter) = configure_logging(&opts.log_opts)?;

    // Nb. this can only be invoked once
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)?;
    drop(bootstrap_logging_guard);

    info!("popcond version {} starting.", crate_version!());

    serve(opts, cfg).await
}

fn main() -> Result<()> {
    // Most of popcond's configuration is read from file; the few command-line options that it
    // accepts govern where to find that file & how to log. They all have corresponding environment
    // variables for convenience when running in a container.
    let opts = CliOpts::new(
        Command::new("popcond")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Latest-release lookup & anonymous popularity contest")
            .long_about(
                "`popcond` reports the latest release of a desktop application & anonymously \
                 counts, once per device per day, the platforms from which it's asked.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("POPCON_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("POPCON_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("github-token")
                    .long("github-token")
                    .num_args(1)
                    .env("POPCON_GITHUB_TOKEN")
                    .hide_env_values(true)
                    .help("GitHub API token; overrides any token in the configuration file"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("POPCON_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("POPCON_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("POPCON_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // A number of things can go wrong before we've parsed our configuration file and configured
    // logging, so setup a *temporary* logger to stderr via `set_default()`.
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
