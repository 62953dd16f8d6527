use clap::{ArgAction, CommandFactory, Parser};
use std::collections::HashSet;
use std::ffi::OsString;
use std::str::FromStr;
use thiserror::Error as ThisError;

use crate::commands::CommandKind;
use crate::eviction::PolicyKind;
use crate::memory::MemorySourceKind;

/// Every environment variable starting with this prefix has to map to a known option.
pub const ENV_PREFIX: &str = "SHARDIS_";

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("unknown environment variable {0}")]
    UnknownEnv(String),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("{0}")]
    Conflict(&'static str),
    #[error("unknown command '{0}' in restricted_commands")]
    UnknownCommand(String),
}

/// Server configuration. Flags take precedence over `SHARDIS_*` environment variables, which
/// take precedence over the defaults.
#[derive(Parser, Debug, Clone)]
#[command(name = "shardis", version, about)]
pub struct Config {
    /// Address the listeners bind to
    #[arg(long, env = "SHARDIS_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// The port to listen on
    #[arg(short, long, env = "SHARDIS_PORT", default_value_t = 6379)]
    pub port: u16,

    /// Password clients must AUTH with
    #[arg(long, env = "SHARDIS_REQUIREPASS")]
    pub requirepass: Option<String>,

    /// Number of shards and worker threads, 0 for one per available core
    #[arg(long = "proactor_threads", env = "SHARDIS_PROACTOR_THREADS", default_value_t = 0)]
    pub proactor_threads: usize,

    /// Memory limit, with an optional unit (e.g. 256mb), 0 for unlimited
    #[arg(long, env = "SHARDIS_MAXMEMORY", default_value = "0", value_parser = parse_memory)]
    pub maxmemory: u64,

    /// Evict keys under memory pressure instead of refusing writes
    #[arg(
        long = "cache_mode",
        env = "SHARDIS_CACHE_MODE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub cache_mode: bool,

    /// Writes are refused once resident memory exceeds maxmemory times this ratio
    #[arg(long = "rss_oom_deny_ratio", env = "SHARDIS_RSS_OOM_DENY_RATIO", default_value_t = 1.02)]
    pub rss_oom_deny_ratio: f64,

    /// Evict in the background while under memory pressure
    #[arg(
        long = "enable_heartbeat_eviction",
        env = "SHARDIS_ENABLE_HEARTBEAT_EVICTION",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub enable_heartbeat_eviction: bool,

    /// How eviction candidates are scored (lru or lfu)
    #[arg(long = "eviction_policy", env = "SHARDIS_EVICTION_POLICY", default_value = "lru")]
    pub eviction_policy: PolicyKind,

    /// Fraction of maxmemory above which eviction starts
    #[arg(long = "eviction_watermark", env = "SHARDIS_EVICTION_WATERMARK", default_value_t = 0.9)]
    pub eviction_watermark: f64,

    /// Where resident memory is read from (accounted or rss)
    #[arg(long = "memory_source", env = "SHARDIS_MEMORY_SOURCE", default_value = "accounted")]
    pub memory_source: MemorySourceKind,

    /// Interval between memory samples
    #[arg(
        long = "mem_sample_interval_ms",
        env = "SHARDIS_MEM_SAMPLE_INTERVAL_MS",
        default_value_t = 10
    )]
    pub mem_sample_interval_ms: u64,

    /// Maximum number of keys KEYS returns, 0 for no limit
    #[arg(long = "keys_output_limit", env = "SHARDIS_KEYS_OUTPUT_LIMIT", default_value_t = 8192)]
    pub keys_output_limit: usize,

    /// Commands only allowed on the admin port, comma separated
    #[arg(
        long = "restricted_commands",
        env = "SHARDIS_RESTRICTED_COMMANDS",
        value_delimiter = ','
    )]
    pub restricted_commands: Vec<String>,

    /// Port of the admin listener
    #[arg(long = "admin_port", env = "SHARDIS_ADMIN_PORT")]
    pub admin_port: Option<u16>,
}

impl Config {
    /// Loads the configuration from the process arguments and environment.
    pub fn load() -> Result<Config, ConfigError> {
        Config::load_from(std::env::args_os())
    }

    pub fn load_from<I, T>(args: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        check_env()?;
        let config = Config::try_parse_from(args)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rss_oom_deny_ratio > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "rss_oom_deny_ratio",
                reason: "must be positive".to_string(),
            });
        }

        if !(self.eviction_watermark > 0.0 && self.eviction_watermark <= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "eviction_watermark",
                reason: "must be in (0, 1]".to_string(),
            });
        }

        if self.mem_sample_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "mem_sample_interval_ms",
                reason: "must be positive".to_string(),
            });
        }

        if self.cache_mode && self.maxmemory == 0 {
            return Err(ConfigError::Conflict("cache_mode requires maxmemory"));
        }

        if self.admin_port == Some(self.port) {
            return Err(ConfigError::Conflict(
                "admin_port must differ from port",
            ));
        }

        for name in &self.restricted_commands {
            CommandKind::from_str(name.trim())
                .map_err(|_| ConfigError::UnknownCommand(name.clone()))?;
        }

        Ok(())
    }

    /// Number of shards, resolved against the available cores.
    pub fn threads(&self) -> usize {
        if self.proactor_threads > 0 {
            return self.proactor_threads;
        }

        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn restricted(&self) -> HashSet<CommandKind> {
        self.restricted_commands
            .iter()
            .filter_map(|name| CommandKind::from_str(name.trim()).ok())
            .map(CommandKind::canonical)
            .collect()
    }
}

/// Rejects `SHARDIS_*` variables no option reads, so typos do not go unnoticed.
fn check_env() -> Result<(), ConfigError> {
    let known: HashSet<String> = Config::command()
        .get_arguments()
        .filter_map(|arg| arg.get_env())
        .map(|env| env.to_string_lossy().into_owned())
        .collect();

    for (name, _) in std::env::vars_os() {
        let name = name.to_string_lossy();
        if name.starts_with(ENV_PREFIX) && !known.contains(name.as_ref()) {
            return Err(ConfigError::UnknownEnv(name.into_owned()));
        }
    }

    Ok(())
}

/// Parses a byte size with an optional unit: `b`, `k`/`kb`, `m`/`mb` or `g`/`gb`, powers of
/// 1024, case insensitive.
pub fn parse_memory(value: &str) -> Result<u64, String> {
    let value = value.trim().to_lowercase();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory size '{}'", value))?;

    let multiplier: u64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return Err(format!("unknown memory unit '{}'", unit)),
    };

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory size '{}' is too large", value))
}
