use std::{io::ErrorKind, path::PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::{app::GenesisAccount, backend::BackendConfig, error::ConfigError, processor::BatchPolicy};

#[derive(Parser, Debug)]
#[command(name = "batchbank", about = "batchbank - batched signed transfers over pluggable account stores")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "batchbank.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Batch policy: all_or_nothing or skip_failed (overrides config file)
    #[arg(short, long)]
    pub policy: Option<BatchPolicy>,

    /// Print metrics in Prometheus format before exiting
    #[arg(long)]
    pub metrics: bool,

    /// Print a fresh key pair and exit
    #[arg(long)]
    pub generate_key: bool,

    /// JSON-lines file of transactions, `-` for stdin
    pub input: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: BackendConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub genesis: Vec<GenesisAccount>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub policy: BatchPolicy,
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: default_logging(),
            storage: BackendConfig::default(),
            processor: ProcessorConfig::default(),
            genesis: Vec::new(),
        }
    }
}

impl Config {
    pub fn parse(contents: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Reads the config file named on the command line and applies CLI
    /// overrides. A missing file means defaults; an unreadable or malformed
    /// one is an error.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Config::parse(&contents, &cli.config)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: cli.config.clone(),
                    source,
                })
            }
        };

        // CLI overrides
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(policy) = cli.policy {
            config.processor.policy = policy;
        }

        Ok(config)
    }
}
