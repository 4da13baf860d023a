#![cfg_attr(
    test,
    allow(clippy::map_unwrap_or, clippy::unwrap_used, clippy::too_many_lines)
)]

mod audit;
mod bandwidth;
mod blacklist;
mod cache_store;
mod config;
mod error;
mod fetch;
mod http_util;
mod humanfmt;
mod lifecycle;
mod links;
mod queue;
mod record;
mod relay;
mod role;
mod task_setup;
mod uri_path;
mod web_interface;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use clap::Parser;
use http_body_util::{BodyExt as _, Empty, combinators::BoxBody};
use log::{LevelFilter, debug, error, info, trace, warn};
use rand::Rng as _;
use rand::SeedableRng as _;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use simplelog::CombinedLogger;
use simplelog::ConfigBuilder;
use simplelog::WriteLogger;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;
use tokio::sync::Semaphore;

use crate::audit::AuditLog;
use crate::bandwidth::BandwidthPolicy;
use crate::bandwidth::DownlinkLimiter;
use crate::bandwidth::Unlimited;
use crate::blacklist::Blacklist;
use crate::cache_store::CacheStore;
use crate::config::Config;
use crate::config::ProxyRole;
use crate::error::ProxyCacheError;
use crate::fetch::Fetcher;
use crate::fetch::HttpFetcher;
use crate::humanfmt::HumanFmt;
use crate::lifecycle::handle_connection;
use crate::lifecycle::replay_log_file;
use crate::queue::RequestQueue;
use crate::role::fulfill_queue;
use crate::task_setup::task_setup;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Everything a connection worker needs, shared by all workers.
#[derive(Clone)]
struct State {
    config: Arc<Config>,
    cache: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    audit: Arc<AuditLog>,
    blacklist: Arc<Blacklist>,
    bandwidth: Arc<dyn BandwidthPolicy>,
    queue: Arc<RequestQueue>,
    request_ids: Arc<AtomicU64>,
    start_time: OffsetDateTime,
}

impl State {
    fn new(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        audit: AuditLog,
        start_time: OffsetDateTime,
    ) -> Self {
        let bandwidth: Arc<dyn BandwidthPolicy> = match config.downlink_rate {
            Some(rate) => Arc::new(DownlinkLimiter::new(rate)),
            None => Arc::new(Unlimited),
        };

        Self {
            cache: CacheStore::new(config.cache_directory.clone()),
            blacklist: Arc::new(Blacklist::new(config.blacklist.clone())),
            config: Arc::new(config),
            fetcher,
            audit: Arc::new(audit),
            bandwidth,
            queue: Arc::new(RequestQueue::default()),
            request_ids: Arc::new(AtomicU64::new(1)),
            start_time,
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes the next issued id greater than `id`.
    fn resume_request_ids_after(&self, id: u64) {
        self.request_ids
            .fetch_max(id.saturating_add(1), Ordering::Relaxed);
    }

    /// State rooted in `dir` with `cache/`, `packages/` and `logs/` below it.
    #[cfg(test)]
    fn for_tests(dir: &Path, role: ProxyRole, fetcher: Arc<dyn Fetcher>) -> Self {
        let mut config = Config::default();
        config.role = role;
        config.cache_directory = dir.join("cache");
        config.packages_directory = dir.join("packages");
        config.log_directory = dir.join("logs");

        let start_time = OffsetDateTime::now_utc();
        let audit = AuditLog::create(&config.log_directory, start_time).unwrap();

        Self::new(config, fetcher, audit, start_time)
    }
}

/// Creates a file named like `path` with a random extension, without
/// clobbering an existing one.
fn mkstemp(path: &Path) -> std::io::Result<(std::fs::File, PathBuf)> {
    const MAX_TRIES: u32 = 10;

    let mut rng = SmallRng::from_os_rng();
    let mut tries = 0;

    loop {
        let suffix: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(&suffix);
        let candidate = PathBuf::from(name);

        match std::fs::File::options()
            .create_new(true)
            .write(true)
            .mode(0o640)
            .open(&candidate)
        {
            Ok(file) => return Ok((file, candidate)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                tries += 1;
                if tries > MAX_TRIES {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[must_use]
fn empty() -> BoxBody<bytes::Bytes, ProxyCacheError> {
    Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
#[must_use]
fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody<bytes::Bytes, ProxyCacheError> {
    http_body_util::Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

async fn main_loop(
    config: Config,
    audit: AuditLog,
    start_time: OffsetDateTime,
    replay: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut addr = SocketAddr::from((config.bind_addr, config.bind_port.get()));

    let listener = match TcpListener::bind(addr).await {
        Ok(x) => x,
        Err(err) => {
            if config.bind_addr != Ipv6Addr::UNSPECIFIED {
                error!("Error binding on {addr}:  {err}");
                Err(err)?;
            }

            // IPv6 may be unavailable; retry the default address on IPv4.
            addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.bind_port.get()));
            TcpListener::bind(addr).await.map_err(|err| {
                error!("Error binding fallback on {addr}:  {err}");
                err
            })?
        }
    };
    info!("Listening on http://{addr} as {} node", config.role);

    let fetcher = Arc::new(HttpFetcher::new(config.http_timeout(), config.gateway.clone()));
    let state = State::new(config, fetcher, audit, start_time);

    if let Some(path) = replay {
        match replay_log_file(&state, &path).await {
            Ok(count) => info!("Replayed {count} requests from `{}`", path.display()),
            Err(err) => {
                error!("Failed to replay `{}`:  {err}", path.display());
                Err(err)?;
            }
        }
    }

    if state.config.role == ProxyRole::Local && state.config.queue_fulfillment {
        let fulfill_state = state.clone();
        tokio::task::spawn(async move { fulfill_queue(fulfill_state).await });
    }

    let workers = Arc::new(Semaphore::new(state.config.max_connections.get()));

    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

    loop {
        trace!(
            "Idle workers:  {}/{}",
            workers.available_permits(),
            state.config.max_connections
        );

        let permit = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                return Ok(());
            },
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                return Ok(());
            },
            p = Arc::clone(&workers).acquire_owned() => p?,
        };

        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                return Ok(());
            },
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                return Ok(());
            },
            n = listener.accept() => n
        };

        let (stream, client) = next.map_err(|err| {
            error!("Error accepting connection:  {err}");
            err
        })?;

        let client_ip = client.ip().to_canonical();
        info!("New client connection from {client_ip}");
        let client_start = Instant::now();

        let st = state.clone();
        tokio::task::spawn(async move {
            let _permit = permit;

            handle_connection(&st, stream, client_ip).await;

            info!(
                "Closed connection to {client_ip} after {}",
                HumanFmt::Time(client_start.elapsed())
            );
        });
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        default_value = config::DEFAULT_CONFIGURATION_PATH,
        value_name = "PATH"
    )]
    config_path: PathBuf,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
    /// Permit daemon running as root user (potentially dangerous)
    #[arg(long, default_value = "false")]
    permit_running_daemon_as_root: bool,
    /// Rebuild request state from a previous messages log before serving
    #[arg(long, value_name = "PATH")]
    replay: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Cli::parse();

    let (config, cgf_fallback) = Config::new(&args.config_path)?;
    let start_time = OffsetDateTime::now_utc();

    let output_log_config = if args.skip_log_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    let internal_log_config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Error)
        .set_level_padding(simplelog::LevelPadding::Right)
        .set_target_level(LevelFilter::Warn)
        .set_thread_level(LevelFilter::Error)
        .set_thread_mode(simplelog::ThreadLogMode::Names)
        .set_time_format_rfc2822()
        .build();

    task_setup(&config)?;

    let audit = AuditLog::create(&config.log_directory, start_time)?;
    let errors_log = std::fs::File::options()
        .create(true)
        .append(true)
        .open(audit.errors_path())?;

    CombinedLogger::init(vec![
        TermLogger::new(
            args.log_level.unwrap_or(config.log_level),
            output_log_config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Warn, internal_log_config, errors_log),
    ])?;

    debug!("Logger initialized");
    trace!("Tracing enabled");

    if cgf_fallback {
        info!(
            "Default configuration file {} not found, using defaults",
            args.config_path.display()
        );
    }

    debug!("Configuration: {config:?}");

    if nix::unistd::getuid().is_root() {
        if args.permit_running_daemon_as_root {
            warn!("!! Running as root is not recommended !!");
        } else {
            error!("Running as root is not recommended and not permitted by default");
            std::process::exit(1);
        }
    }

    info!(
        "Using cache directory `{}`, packages directory `{}`, audit log `{}`",
        config.cache_directory.display(),
        config.packages_directory.display(),
        audit.messages_path().display()
    );

    std::panic::set_hook(Box::new(move |info| {
        error!("{info}");
        eprintln!("{info}");
    }));

    scopeguard::defer! {
        info!("Stopped.");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("splitproxy-w")
        .build()?;

    runtime.block_on(async { main_loop(config, audit, start_time, args.replay).await })
}
