//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to
//! prevent log leaks. Durations use humantime syntax ("500ms", "30s", "5m").

pub mod schedule;

pub use schedule::ScheduleConfig;

use std::path::PathBuf;
use std::time::Duration;

use crate::claim::StrategyKind;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker: WorkerConfig,
    /// Present whenever the lease strategy is selected.
    pub sweep: Option<SweepConfig>,
    /// Optional TOML file of extra scheduled tasks.
    pub schedules_path: Option<PathBuf>,
}

/// How many loops run and how they pace themselves.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub strategy: StrategyKind,
    /// Concurrent worker loops in this process.
    pub workers: usize,
    /// Maximum items claimed per iteration.
    pub batch_size: usize,
    /// Pause after an iteration that found nothing to claim.
    pub idle_delay: Duration,
    /// Pause after a failed iteration.
    pub failure_backoff: Duration,
    /// How long an in-flight iteration may keep running after shutdown is
    /// requested before it is aborted.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Lease,
            workers: 4,
            batch_size: 100,
            idle_delay: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Connection pool size for this process.
    ///
    /// Transaction-scoped claims pin a connection per loop for the whole
    /// batch; the extra two cover the sweeper and ad-hoc queries.
    pub fn pool_size(&self) -> u32 {
        u32::try_from(self.workers.saturating_add(2)).unwrap_or(u32::MAX)
    }
}

/// Stale-claim sweep policy for the lease strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// How often the sweeper runs.
    pub interval: Duration,
    /// Claims older than this are presumed abandoned. Must exceed the longest
    /// plausible processing time of one batch.
    pub threshold: Duration,
}

impl SweepConfig {
    pub fn new(interval: Duration, threshold: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::Config("sweep interval must be non-zero".to_string()));
        }
        if threshold.is_zero() {
            return Err(Error::Config("stale threshold must be non-zero".to_string()));
        }
        Ok(Self {
            interval,
            threshold,
        })
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = WorkerConfig::default();
        let strategy = match optional_var("WORKQ_STRATEGY") {
            Some(s) => s.parse()?,
            None => defaults.strategy,
        };

        let worker = WorkerConfig {
            strategy,
            workers: positive_var("WORKQ_WORKERS", defaults.workers)?,
            batch_size: positive_var("WORKQ_BATCH_SIZE", defaults.batch_size)?,
            idle_delay: duration_var("WORKQ_IDLE_DELAY")?.unwrap_or(defaults.idle_delay),
            failure_backoff: duration_var("WORKQ_FAILURE_BACKOFF")?
                .unwrap_or(defaults.failure_backoff),
            shutdown_grace: duration_var("WORKQ_SHUTDOWN_GRACE")?
                .unwrap_or(defaults.shutdown_grace),
        };

        // A lease that is never swept is never recovered, so both knobs are
        // mandatory for the lease strategy.
        let sweep = match strategy {
            StrategyKind::Lease => Some(SweepConfig::new(
                required_duration("WORKQ_SWEEP_INTERVAL")?,
                required_duration("WORKQ_STALE_THRESHOLD")?,
            )?),
            StrategyKind::Transaction => None,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            worker,
            sweep,
            schedules_path: optional_var("WORKQ_SCHEDULES").map(PathBuf::from),
        })
    }
}

/// Parse a humantime duration ("250ms", "30s", "1h 30m").
pub fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::Config(format!("{name}: invalid duration {value:?}: {e}")))
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required_duration(name: &str) -> Result<Duration> {
    parse_duration(name, &required_var(name)?)
}

fn duration_var(name: &str) -> Result<Option<Duration>> {
    optional_var(name)
        .map(|v| parse_duration(name, &v))
        .transpose()
}

fn positive_var(name: &str, default: usize) -> Result<usize> {
    let Some(raw) = optional_var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(Error::Config(format!("{name} must be at least 1"))),
        Ok(n) => Ok(n),
        Err(e) => Err(Error::Config(format!("{name}: invalid number {raw:?}: {e}"))),
    }
}
