//! Server configuration.
//!
//! Values are layered: built-in defaults, then `POLYKV_*` environment
//! variables, then command-line flags.
//!
//! | Flag              | Environment       | Default     |
//! |-------------------|-------------------|-------------|
//! | `--host`, `-h`    | `POLYKV_HOST`     | `127.0.0.1` |
//! | `--port`, `-p`    | `POLYKV_PORT`     | `9401`      |
//! | `--shards`        | `POLYKV_SHARDS`   | `64`        |
//! | `--sweep-ms`      | `POLYKV_SWEEP_MS` | `100`       |
//! | `--log-level`     | `POLYKV_LOG`      | `info`      |

use crate::storage::engine::DEFAULT_SHARDS;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while reading the configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
}

/// Runtime configuration for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Number of storage shards
    pub shards: usize,
    /// Starting interval of the expiry sweeper
    pub sweep_interval: Duration,
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            shards: DEFAULT_SHARDS,
            sweep_interval: Duration::from_millis(100),
            log_level: "info".to_string(),
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    Run(Config),
    Help,
    Version,
}

impl Config {
    /// Reads the process environment and arguments.
    pub fn load() -> Result<Startup, ConfigError> {
        Self::parse(std::env::args().skip(1), |name| std::env::var(name).ok())
    }

    /// Builds a configuration from `args` (program name excluded) and an
    /// environment lookup.
    pub fn parse<I, E>(args: I, env: E) -> Result<Startup, ConfigError>
    where
        I: IntoIterator<Item = String>,
        E: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        config.apply_env(env)?;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = || args.next().ok_or_else(|| ConfigError::MissingValue(arg.clone()));
            match arg.as_str() {
                "--host" | "-h" => config.host = value()?,
                "--port" | "-p" => config.port = number(&arg, value()?)?,
                "--shards" => config.shards = shard_count(&arg, value()?)?,
                "--sweep-ms" => config.sweep_interval = sweep_interval(&arg, value()?)?,
                "--log-level" => config.log_level = value()?,
                "--help" => return Ok(Startup::Help),
                "--version" | "-v" => return Ok(Startup::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        Ok(Startup::Run(config))
    }

    fn apply_env<E>(&mut self, env: E) -> Result<(), ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(host) = env("POLYKV_HOST") {
            self.host = host;
        }
        if let Some(port) = env("POLYKV_PORT") {
            self.port = number("POLYKV_PORT", port)?;
        }
        if let Some(shards) = env("POLYKV_SHARDS") {
            self.shards = shard_count("POLYKV_SHARDS", shards)?;
        }
        if let Some(ms) = env("POLYKV_SWEEP_MS") {
            self.sweep_interval = sweep_interval("POLYKV_SWEEP_MS", ms)?;
        }
        if let Some(level) = env("POLYKV_LOG") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn number<T: FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value,
    })
}

fn shard_count(name: &str, value: String) -> Result<usize, ConfigError> {
    match number(name, value.clone())? {
        0 => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value,
        }),
        n => Ok(n),
    }
}

fn sweep_interval(name: &str, value: String) -> Result<Duration, ConfigError> {
    match number(name, value.clone())? {
        0 => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value,
        }),
        ms => Ok(Duration::from_millis(ms)),
    }
}

/// Usage text for `--help`.
pub fn usage() -> String {
    format!(
        r#"
polykv {version} - one in-memory store, four wire protocols

USAGE:
    polykv [OPTIONS]

OPTIONS:
    -h, --host <HOST>        Host to bind to (default: {host})
    -p, --port <PORT>        Port to listen on (default: {port})
        --shards <N>         Number of storage shards (default: {shards})
        --sweep-ms <MS>      Initial expiry sweep interval (default: 100)
        --log-level <LEVEL>  Log filter when RUST_LOG is unset (default: info)
    -v, --version            Print version information
        --help               Print this help message

CONNECTING:
    Every protocol is served on the same port:
    $ redis-cli -p {port} SET name polykv
    $ printf 'get name\r\n' | nc 127.0.0.1 {port}
    $ curl http://127.0.0.1:{port}/name
    $ psql -h 127.0.0.1 -p {port} -c 'GET name'
"#,
        version = crate::VERSION,
        host = DEFAULT_HOST,
        port = DEFAULT_PORT,
        shards = DEFAULT_SHARDS,
    )
}
