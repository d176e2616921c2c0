//! Configuration management for Syncstage
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Argument error: {0}")]
    Cli(#[from] clap::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "syncstage")]
#[command(about = "Retrieval session engine for content-addressed storage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the expiry reaper and the ops HTTP endpoint until interrupted
    Start(StartCommand),
    /// Run one retrieval session for an owner and stage its listing
    Sync(SyncCommand),
    /// Run one expiry sweep and exit
    Sweep(SweepCommand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    KuboCli,
    KuboHttp,
    Local,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML config file; when given its values replace the defaults below
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory for the cache, block store and sessions
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Root of session working directories [default: <data-dir>/sessions]
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// JSON catalog of content records [default: <data-dir>/catalog.json]
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Content store backend
    #[arg(long, value_enum, default_value_t = StoreKind::KuboCli)]
    pub store: StoreKind,

    /// Kubo binary for the kubo-cli backend
    #[arg(long, default_value = "ipfs")]
    pub ipfs_binary: PathBuf,

    /// Kubo RPC address for the kubo-http backend
    #[arg(long, default_value = "http://127.0.0.1:5001")]
    pub ipfs_api: String,

    /// Seconds an activity entry stays valid per activation
    #[arg(long, default_value_t = 30)]
    pub session_ttl_secs: u64,

    /// Concurrent fetches per session
    #[arg(long, default_value_t = 8)]
    pub fetch_workers: usize,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Args, Debug, Clone)]
pub struct StartCommand {
    #[command(flatten)]
    pub common: CommonArgs,

    /// HTTP port for /health, /metrics and POST /sync/:owner
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 7200)]
    pub reaper_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SyncCommand {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Owner whose records are staged
    #[arg(long)]
    pub owner: String,

    /// Stage only these records (can be specified multiple times)
    #[arg(long = "record-id")]
    pub record_ids: Vec<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SweepCommand {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// What the binary was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Sync { owner_id: String, record_ids: Vec<u64> },
    Sweep,
}

fn default_ipfs_binary() -> PathBuf {
    PathBuf::from("ipfs")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum StoreBackend {
    KuboCli {
        #[serde(default = "default_ipfs_binary")]
        binary: PathBuf,
        /// IPFS_PATH for the child process
        #[serde(default)]
        repo: Option<PathBuf>,
    },
    KuboHttp {
        api_url: String,
    },
    Local {
        /// [default: <data_dir>/blocks]
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::KuboCli {
            binary: default_ipfs_binary(),
            repo: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub api_port: u16,
    pub log_level: String,
    pub store: StoreBackend,
    pub session_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    pub fetch_workers: usize,
    pub fetch_max_attempts: u32,
    pub fetch_backoff_ms: u64,
    pub verify_poll_interval_ms: u64,
    pub verify_max_attempts: u32,
    pub store_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            work_dir: None,
            catalog_path: None,
            api_port: 8080,
            log_level: "info".to_string(),
            store: StoreBackend::default(),
            session_ttl_secs: 30,
            reaper_interval_secs: 7200,
            fetch_workers: 8,
            fetch_max_attempts: 3,
            fetch_backoff_ms: 500,
            verify_poll_interval_ms: 5000,
            verify_max_attempts: 12,
            store_timeout_secs: 120,
        }
    }
}

impl Config {
    /// Create config and action from the process arguments
    pub fn from_cli() -> Result<(Self, Action), ConfigError> {
        Self::from_cli_parsed(Cli::parse())
    }

    /// Same as `from_cli` over an explicit argument list
    pub fn from_args<I, T>(args: I) -> Result<(Self, Action), ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_cli_parsed(Cli::try_parse_from(args)?)
    }

    fn from_cli_parsed(cli: Cli) -> Result<(Self, Action), ConfigError> {
        let (config, action) = match cli.command {
            Commands::Start(cmd) => {
                let mut config = Self::from_common(&cmd.common)?;
                if cmd.common.config.is_none() {
                    config.api_port = cmd.api_port;
                    config.reaper_interval_secs = cmd.reaper_interval_secs;
                }
                (config, Action::Start)
            }
            Commands::Sync(cmd) => (
                Self::from_common(&cmd.common)?,
                Action::Sync {
                    owner_id: cmd.owner,
                    record_ids: cmd.record_ids,
                },
            ),
            Commands::Sweep(cmd) => (Self::from_common(&cmd.common)?, Action::Sweep),
        };

        config.validate()?;
        Ok((config, action))
    }

    fn from_common(args: &CommonArgs) -> Result<Self, ConfigError> {
        if let Some(path) = &args.config {
            return Self::load_from_file(path);
        }

        let store = match args.store {
            StoreKind::KuboCli => StoreBackend::KuboCli {
                binary: args.ipfs_binary.clone(),
                repo: None,
            },
            StoreKind::KuboHttp => StoreBackend::KuboHttp {
                api_url: args.ipfs_api.clone(),
            },
            StoreKind::Local => StoreBackend::Local { path: None },
        };

        Ok(Config {
            data_dir: args.data_dir.clone(),
            work_dir: args.work_dir.clone(),
            catalog_path: args.catalog.clone(),
            log_level: args.log_level.clone(),
            store,
            session_ttl_secs: args.session_ttl_secs,
            fetch_workers: args.fetch_workers,
            ..Config::default()
        })
    }

    /// Load config from a TOML file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::Invalid("session_ttl_secs must be positive".into()));
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid("reaper_interval_secs must be positive".into()));
        }
        if self.fetch_workers == 0 {
            return Err(ConfigError::Invalid("fetch_workers must be positive".into()));
        }
        if self.fetch_max_attempts == 0 || self.verify_max_attempts == 0 {
            return Err(ConfigError::Invalid("attempt limits must be positive".into()));
        }
        Ok(())
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sessions"))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("catalog.json"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            work_root: self.work_dir(),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            fetch_workers: self.fetch_workers,
            fetch_policy: RetryPolicy::exponential(
                self.fetch_max_attempts,
                Duration::from_millis(self.fetch_backoff_ms),
            ),
            verify_policy: RetryPolicy::fixed(
                self.verify_max_attempts,
                Duration::from_millis(self.verify_poll_interval_ms),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.work_dir(), PathBuf::from("./data/sessions"));
        assert_eq!(config.catalog_path(), PathBuf::from("./data/catalog.json"));
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.session_ttl_secs, 30);
        assert_eq!(config.reaper_interval(), Duration::from_secs(7200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_sync_command() {
        let (config, action) = Config::from_args([
            "syncstage",
            "sync",
            "--owner",
            "U1",
            "--record-id",
            "1",
            "--record-id",
            "7",
            "--data-dir",
            "./test-data",
            "--store",
            "local",
            "--fetch-workers",
            "2",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(
            action,
            Action::Sync {
                owner_id: "U1".to_string(),
                record_ids: vec![1, 7]
            }
        );
        assert_eq!(config.data_dir, PathBuf::from("./test-data"));
        assert_eq!(config.store, StoreBackend::Local { path: None });
        assert_eq!(config.fetch_workers, 2);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_config_from_start_command() {
        let (config, action) = Config::from_args([
            "syncstage",
            "start",
            "--api-port",
            "9002",
            "--reaper-interval-secs",
            "60",
            "--store",
            "kubo-http",
            "--ipfs-api",
            "http://10.0.0.5:5001",
        ])
        .unwrap();

        assert_eq!(action, Action::Start);
        assert_eq!(config.api_port, 9002);
        assert_eq!(config.reaper_interval_secs, 60);
        assert_eq!(
            config.store,
            StoreBackend::KuboHttp {
                api_url: "http://10.0.0.5:5001".to_string()
            }
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_args(["syncstage", "sweep", "--fetch-workers", "0"]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncstage.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/syncstage"
session_ttl_secs = 45
verify_max_attempts = 3

[store]
backend = "kubo-cli"
binary = "/usr/local/bin/ipfs"
repo = "/var/lib/ipfs"
"#,
        )
        .unwrap();

        let (config, action) =
            Config::from_args(["syncstage", "sweep", "--config", path.to_str().unwrap()]).unwrap();

        assert_eq!(action, Action::Sweep);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/syncstage"));
        assert_eq!(config.session_ttl_secs, 45);
        assert_eq!(config.fetch_workers, 8);
        assert_eq!(
            config.store,
            StoreBackend::KuboCli {
                binary: PathBuf::from("/usr/local/bin/ipfs"),
                repo: Some(PathBuf::from("/var/lib/ipfs"))
            }
        );

        let settings = config.engine_settings();
        assert_eq!(settings.work_root, PathBuf::from("/var/lib/syncstage/sessions"));
        assert_eq!(settings.session_ttl, Duration::from_secs(45));
        assert_eq!(settings.verify_policy.max_attempts, 3);
    }
}
