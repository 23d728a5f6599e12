//! CLI surface and run configuration.
//!
//! `Cli` is the clap-facing argument set; [`RunConfig`] is the validated,
//! immutable configuration the engine consumes. Every cross-field rule
//! (mutually exclusive option sets, required groups, sign checks) is applied
//! in [`RunConfig::from_cli`] before any worker starts, so an invalid
//! combination exits with code 1 without touching the network.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::keygen::KeyPolicy;
use crate::pool::PoolSizing;
use crate::rate::RatePolicy;

pub const DEFAULT_REQUESTS: u64 = 100_000;
pub const DEFAULT_POOL_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Operation {
    Set,
    Get,
    Custom,
}

/// Ramp shape for a dynamic QPS schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RampMode {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warning,
    Info,
    Debug,
}

/// How long the run lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Requests(u64),
    Duration(Duration),
}

/// Worker process-group count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processes {
    Auto,
    Fixed(usize),
}

impl Processes {
    pub fn count(&self) -> usize {
        match self {
            Processes::Auto => num_cpus::get().max(1),
            Processes::Fixed(n) => (*n).max(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is mutually exclusive with {1}")]
    MutuallyExclusive(&'static str, &'static str),
    #[error("{option} requires {required}")]
    Requires {
        option: &'static str,
        required: &'static str,
    },
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        option: &'static str,
        reason: String,
    },
    #[error("--qps-change must be non-zero and share the sign of (end-qps - start-qps)")]
    RampSignMismatch,
    #[error("exponential ramp mode requires --qps-ramp-factor")]
    MissingRampFactor,
    #[error(transparent)]
    UnknownCustomCommand(#[from] crate::custom::UnknownCommand),
}

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "kvbench", version, about = "Load generator and measurement harness for Valkey/Redis-compatible datastores")]
pub struct Cli {
    /// Server hostname
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server port
    #[arg(short = 'p', long, default_value_t = 6379)]
    pub port: u16,
    /// Use TLS for the connection
    #[arg(long)]
    pub tls: bool,
    /// Use the cluster client
    #[arg(long)]
    pub cluster: bool,
    /// Prefer reading from replica nodes
    #[arg(long)]
    pub read_from_replica: bool,
    /// Per-request timeout in milliseconds; zero or negative means unset
    #[arg(long, value_name = "MS", allow_hyphen_values = true)]
    pub request_timeout: Option<i64>,
    /// Connection establishment timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub connection_timeout: Option<u64>,

    /// Number of pooled connections
    #[arg(short = 'c', long)]
    pub clients: Option<usize>,
    /// Initial pool size for gradual connection ramp-up
    #[arg(long)]
    pub clients_ramp_start: Option<usize>,
    /// Final pool size for gradual connection ramp-up
    #[arg(long)]
    pub clients_ramp_end: Option<usize>,
    /// Connections added per ramp step
    #[arg(long)]
    pub clients_per_ramp: Option<usize>,
    /// Seconds between connection ramp steps
    #[arg(long, value_name = "SECONDS")]
    pub client_ramp_interval: Option<u64>,

    /// Number of worker tasks per process group
    #[arg(long, default_value_t = 1)]
    pub threads: usize,
    /// Total number of requests
    #[arg(short = 'n', long)]
    pub requests: Option<u64>,
    /// Test duration in seconds
    #[arg(long, value_name = "SECONDS")]
    pub test_duration: Option<u64>,
    /// Value size in bytes for SET
    #[arg(short = 'd', long, default_value_t = 3)]
    pub datasize: usize,
    /// Operation to benchmark
    #[arg(short = 't', long = "type", value_enum, default_value_t = Operation::Set)]
    pub operation: Operation,
    /// Use random keys drawn from a keyspace of this size
    #[arg(short = 'r', long, value_name = "KEYSPACE")]
    pub random: Option<u64>,
    /// Use sequential keys over a keyspace of this size
    #[arg(long, value_name = "KEYSPACE")]
    pub sequential: Option<u64>,
    /// Shift generated keys by this offset
    #[arg(long)]
    pub keyspace_offset: Option<u64>,
    /// Randomize each worker's sequential starting point
    #[arg(long)]
    pub sequential_random_start: bool,

    /// Fixed queries-per-second limit
    #[arg(long)]
    pub qps: Option<u64>,
    /// Starting QPS for a dynamic rate
    #[arg(long)]
    pub start_qps: Option<u64>,
    /// Ending QPS for a dynamic rate
    #[arg(long)]
    pub end_qps: Option<u64>,
    /// Seconds between QPS adjustments
    #[arg(long, value_name = "SECONDS")]
    pub qps_change_interval: Option<u64>,
    /// QPS adjustment per interval (linear mode)
    #[arg(long, allow_hyphen_values = true)]
    pub qps_change: Option<i64>,
    /// Ramp shape for dynamic QPS
    #[arg(long, value_enum, default_value_t = RampMode::Linear)]
    pub qps_ramp_mode: RampMode,
    /// Multiplier applied per interval (exponential mode)
    #[arg(long)]
    pub qps_ramp_factor: Option<f64>,

    /// Emit CSV metrics to stdout every N seconds
    #[arg(long, value_name = "SECONDS")]
    pub interval_metrics_interval_duration_sec: Option<u64>,
    /// Log verbosity; no log sink is installed unless this is set
    #[arg(long, value_enum, default_value_t = LogLevel::Off, ignore_case = true)]
    pub log_level: LogLevel,

    /// Worker process groups: a number or "auto" (CPU count)
    #[arg(long, default_value = "auto")]
    pub processes: String,
    /// Force a single process group
    #[arg(long)]
    pub single_process: bool,

    /// Path selecting a custom command plug-in
    #[arg(long)]
    pub custom_command_file: Option<PathBuf>,
    /// Opaque string handed to the plug-in's constructor
    #[arg(long)]
    pub custom_command_args: Option<String>,
}

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RunConfig {
    #[builder(default = String::from("127.0.0.1"), setter(into))]
    pub host: String,
    #[builder(default = 6379)]
    pub port: u16,
    #[builder(default = false)]
    pub tls: bool,
    #[builder(default = false)]
    pub cluster: bool,
    #[builder(default = false)]
    pub read_from_replica: bool,
    #[builder(default)]
    pub request_timeout: Option<Duration>,
    #[builder(default)]
    pub connection_timeout: Option<Duration>,
    #[builder(default = PoolSizing::Fixed(DEFAULT_POOL_SIZE))]
    pub pool: PoolSizing,
    /// Worker tasks per process group.
    #[builder(default = 1)]
    pub workers: usize,
    #[builder(default = Bound::Requests(DEFAULT_REQUESTS))]
    pub bound: Bound,
    #[builder(default = 3)]
    pub value_size: usize,
    #[builder(default = Operation::Set)]
    pub operation: Operation,
    #[builder(default = KeyPolicy::PerWorker)]
    pub keys: KeyPolicy,
    #[builder(default = RatePolicy::None)]
    pub rate: RatePolicy,
    #[builder(default)]
    pub csv_interval: Option<Duration>,
    #[builder(default = Processes::Fixed(1))]
    pub processes: Processes,
    #[builder(default)]
    pub custom_command_file: Option<PathBuf>,
    #[builder(default)]
    pub custom_command_args: Option<String>,
    #[builder(default = LogLevel::Off)]
    pub log_level: LogLevel,
}

impl RunConfig {
    pub fn csv_mode(&self) -> bool {
        self.csv_interval.is_some()
    }

    pub fn process_count(&self) -> usize {
        self.processes.count()
    }

    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let pool = validate_pool(&cli)?;
        let bound = validate_bound(&cli)?;
        let keys = validate_keys(&cli)?;
        let rate = validate_rate(&cli)?;
        let processes = validate_processes(&cli)?;

        let request_timeout = cli
            .request_timeout
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
        let connection_timeout = cli
            .connection_timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let csv_interval = cli
            .interval_metrics_interval_duration_sec
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        if cli.threads == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--threads",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(RunConfig {
            host: cli.host,
            port: cli.port,
            tls: cli.tls,
            cluster: cli.cluster,
            read_from_replica: cli.read_from_replica,
            request_timeout,
            connection_timeout,
            pool,
            workers: cli.threads,
            bound,
            value_size: cli.datasize,
            operation: cli.operation,
            keys,
            rate,
            csv_interval,
            processes,
            custom_command_file: cli.custom_command_file,
            custom_command_args: cli.custom_command_args,
            log_level: cli.log_level,
        })
    }
}

fn validate_pool(cli: &Cli) -> Result<PoolSizing, ConfigError> {
    let ramp_given = [
        cli.clients_ramp_start.is_some(),
        cli.clients_ramp_end.is_some(),
        cli.clients_per_ramp.is_some(),
        cli.client_ramp_interval.is_some(),
    ];
    let ramp_count = ramp_given.iter().filter(|set| **set).count();

    if ramp_count > 0 && cli.clients.is_some() {
        return Err(ConfigError::MutuallyExclusive(
            "--clients",
            "the --clients-ramp-* options",
        ));
    }
    if ramp_count == 0 {
        let size = cli.clients.unwrap_or(DEFAULT_POOL_SIZE);
        if size == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--clients",
                reason: "must be at least 1".to_string(),
            });
        }
        return Ok(PoolSizing::Fixed(size));
    }
    if ramp_count < 4 {
        return Err(ConfigError::Requires {
            option: "connection ramp-up",
            required:
                "--clients-ramp-start, --clients-ramp-end, --clients-per-ramp and --client-ramp-interval together",
        });
    }

    let start = cli.clients_ramp_start.unwrap_or_default();
    let end = cli.clients_ramp_end.unwrap_or_default();
    let step = cli.clients_per_ramp.unwrap_or_default();
    let interval = cli.client_ramp_interval.unwrap_or_default();
    if start == 0 || step == 0 || interval == 0 {
        return Err(ConfigError::InvalidValue {
            option: "--clients-ramp-start/--clients-per-ramp/--client-ramp-interval",
            reason: "must be at least 1".to_string(),
        });
    }
    if end < start {
        return Err(ConfigError::InvalidValue {
            option: "--clients-ramp-end",
            reason: "must be >= --clients-ramp-start".to_string(),
        });
    }
    Ok(PoolSizing::Ramp {
        start,
        end,
        step,
        interval: Duration::from_secs(interval),
    })
}

fn validate_bound(cli: &Cli) -> Result<Bound, ConfigError> {
    if cli.requests.is_some() && cli.test_duration.is_some() {
        return Err(ConfigError::MutuallyExclusive("--requests", "--test-duration"));
    }
    if let Some(secs) = cli.test_duration {
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--test-duration",
                reason: "must be at least 1 second".to_string(),
            });
        }
        return Ok(Bound::Duration(Duration::from_secs(secs)));
    }
    if let Some(n) = cli.requests {
        if n == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--requests",
                reason: "must be at least 1".to_string(),
            });
        }
        return Ok(Bound::Requests(n));
    }
    // --sequential <k> with no explicit budget issues exactly k requests.
    if let Some(keyspace) = cli.sequential {
        return Ok(Bound::Requests(keyspace.max(1)));
    }
    Ok(Bound::Requests(DEFAULT_REQUESTS))
}

fn validate_keys(cli: &Cli) -> Result<KeyPolicy, ConfigError> {
    if cli.random.is_some() && cli.sequential.is_some() {
        return Err(ConfigError::MutuallyExclusive("--random", "--sequential"));
    }
    if cli.sequential_random_start && cli.sequential.is_none() {
        return Err(ConfigError::Requires {
            option: "--sequential-random-start",
            required: "--sequential",
        });
    }
    if cli.keyspace_offset.is_some() && cli.random.is_none() && cli.sequential.is_none() {
        return Err(ConfigError::Requires {
            option: "--keyspace-offset",
            required: "--random or --sequential",
        });
    }
    let offset = cli.keyspace_offset.unwrap_or(0);
    if let Some(keyspace) = cli.random {
        if keyspace == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--random",
                reason: "keyspace must be at least 1".to_string(),
            });
        }
        return Ok(KeyPolicy::Random { keyspace, offset });
    }
    if let Some(keyspace) = cli.sequential {
        if keyspace == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--sequential",
                reason: "keyspace must be at least 1".to_string(),
            });
        }
        return Ok(KeyPolicy::Sequential {
            keyspace,
            offset,
            random_start: cli.sequential_random_start,
        });
    }
    Ok(KeyPolicy::PerWorker)
}

fn validate_rate(cli: &Cli) -> Result<RatePolicy, ConfigError> {
    let dynamic_given = cli.start_qps.is_some()
        || cli.end_qps.is_some()
        || cli.qps_change_interval.is_some()
        || cli.qps_change.is_some();

    if let Some(qps) = cli.qps {
        if dynamic_given {
            return Err(ConfigError::MutuallyExclusive(
                "--qps",
                "the --start-qps/--end-qps dynamic rate options",
            ));
        }
        if qps == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--qps",
                reason: "must be a positive integer".to_string(),
            });
        }
        return Ok(RatePolicy::Fixed(qps));
    }
    if !dynamic_given {
        return Ok(RatePolicy::None);
    }

    let Some(end) = cli.end_qps else {
        return Err(ConfigError::Requires {
            option: "a dynamic rate",
            required: "--end-qps",
        });
    };
    let Some(interval_secs) = cli.qps_change_interval else {
        return Err(ConfigError::Requires {
            option: "a dynamic rate",
            required: "--qps-change-interval",
        });
    };
    if end == 0 || interval_secs == 0 {
        return Err(ConfigError::InvalidValue {
            option: "--end-qps/--qps-change-interval",
            reason: "must be positive".to_string(),
        });
    }
    let start = match cli.start_qps {
        Some(start) if start > 0 => start,
        Some(_) => {
            return Err(ConfigError::InvalidValue {
                option: "--start-qps",
                reason: "must be positive".to_string(),
            })
        }
        None => {
            tracing::warn!("start-qps not set for ramp mode, using end-qps as initial QPS");
            end
        }
    };
    let interval = Duration::from_secs(interval_secs);

    match cli.qps_ramp_mode {
        RampMode::Linear => {
            let Some(step) = cli.qps_change else {
                return Err(ConfigError::Requires {
                    option: "a linear dynamic rate",
                    required: "--qps-change",
                });
            };
            let diff = end as i64 - start as i64;
            if step == 0 || (diff > 0) != (step > 0) || diff == 0 {
                return Err(ConfigError::RampSignMismatch);
            }
            Ok(RatePolicy::Linear {
                start,
                end,
                step,
                interval,
            })
        }
        RampMode::Exponential => {
            let Some(factor) = cli.qps_ramp_factor else {
                return Err(ConfigError::MissingRampFactor);
            };
            if factor <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    option: "--qps-ramp-factor",
                    reason: "must be a positive number".to_string(),
                });
            }
            if factor < 1.0 {
                tracing::warn!("qps-ramp-factor < 1 ramps QPS down each interval");
            }
            Ok(RatePolicy::Exponential {
                start,
                end,
                factor,
                interval,
            })
        }
    }
}

fn validate_processes(cli: &Cli) -> Result<Processes, ConfigError> {
    if cli.single_process {
        return Ok(Processes::Fixed(1));
    }
    if cli.processes.eq_ignore_ascii_case("auto") {
        return Ok(Processes::Auto);
    }
    match cli.processes.parse::<usize>() {
        Ok(n) if n > 0 => Ok(Processes::Fixed(n)),
        _ => Err(ConfigError::InvalidValue {
            option: "--processes",
            reason: format!("expected a positive integer or \"auto\", got {:?}", cli.processes),
        }),
    }
}
