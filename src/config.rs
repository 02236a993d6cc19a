//! Run configuration, loaded from one YAML file and validated before any
//! connection attempt.

use anyhow::{Context, Result};
use replay_credentials::{CommandSource, CredentialSource, DbCredentials, StaticSource};
use replay_model::{FilterError, FilterSpec, Filters, PacingMode, Protocol};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid target_cluster_endpoint {0:?}, expected <host>:<port>/<database>")]
    BadEndpoint(String),

    #[error("invalid default_interface {0:?}, expected \"psql\" or \"odbc\"")]
    BadInterface(String),

    #[error("execute_unload_statements requires replay_output to be set")]
    UnloadsNeedOutput,

    #[error("replay_output must be an s3:// location to receive UNLOADs, got {0:?}")]
    UnloadOutputNotS3(String),

    #[error("execute_unload_statements requires unload_iam_role to be set")]
    MissingUnloadRole,

    #[error("unload_system_table_queries requires replay_output and unload_iam_role")]
    SystemTablesNeedOutput,

    #[error("num_workers must be at least 1 when set")]
    ZeroWorkers,

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// `<host>:<port>/<database>` of the target cluster.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl std::str::FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadEndpoint(s.to_string());
        let (address, database) = s.split_once('/').ok_or_else(bad)?;
        let (host, port) = address.split_once(':').ok_or_else(bad)?;
        if host.is_empty() || database.is_empty() {
            return Err(bad());
        }
        let port: u16 = port.parse().map_err(|_| bad())?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
            database: database.to_string(),
        })
    }
}

/// Where the master user's password comes from.
#[derive(Debug, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase", deny_unknown_fields)]
pub enum CredentialConfig {
    /// Password inline or from an environment variable.
    Static {
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_password_env")]
        password_env: String,
    },
    /// External helper printing `{"username": ..., "password": ...}` JSON.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_password_env() -> String {
    "REPLAY_MASTER_PASSWORD".to_string()
}

impl Default for CredentialConfig {
    fn default() -> Self {
        CredentialConfig::Static {
            password: None,
            password_env: default_password_env(),
        }
    }
}

impl CredentialConfig {
    /// Build the credential source for `master_username`.
    pub fn source(&self, master_username: &str) -> Result<Arc<dyn CredentialSource>> {
        match self {
            CredentialConfig::Static {
                password,
                password_env,
            } => {
                let password = match password {
                    Some(p) => p.clone(),
                    None => std::env::var(password_env).with_context(|| {
                        format!("master password not found in ${password_env}")
                    })?,
                };
                Ok(Arc::new(StaticSource::new(DbCredentials::new(
                    master_username,
                    password,
                ))))
            }
            CredentialConfig::Command { command, args } => {
                Ok(Arc::new(CommandSource::new(command, args.clone())))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local directory or `s3://` prefix holding `connections.json`, `SQLs/`
    /// and `copy_replacements.csv`
    pub workload_location: String,
    /// `<host>:<port>/<database>` of the cluster to replay against
    pub target_cluster_endpoint: String,
    pub master_username: String,
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// ODBC driver name from the capture environment; sessions resolved to
    /// odbc degrade to the native wire when unset
    #[serde(default)]
    pub odbc_driver: Option<String>,
    #[serde(default = "default_interface")]
    pub default_interface: String,

    #[serde(default)]
    pub time_interval_between_transactions: PacingMode,
    #[serde(default)]
    pub time_interval_between_queries: PacingMode,

    #[serde(default = "default_true")]
    pub execute_copy_statements: bool,
    #[serde(default)]
    pub execute_unload_statements: bool,
    /// Destination prefix for rewritten UNLOADs and the system table export
    #[serde(default)]
    pub replay_output: Option<String>,
    #[serde(default)]
    pub unload_iam_role: Option<String>,

    /// Where error files and the run summary land; defaults to
    /// `replay_output`, then the current directory
    #[serde(default)]
    pub error_location: Option<String>,
    /// Optional label folded into the replay id
    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub filters: FilterSpec,

    #[serde(default)]
    pub num_workers: Option<usize>,
    #[serde(default = "default_tolerance_sec")]
    pub connection_tolerance_sec: u64,
    #[serde(default = "default_refresh_sec")]
    pub credential_refresh_sec: u64,
    #[serde(default = "default_idle_sec")]
    pub empty_queue_timeout_sec: u64,
    /// Directory for per-worker query timing CSVs; disabled when unset
    #[serde(default)]
    pub timing_log_dir: Option<PathBuf>,

    /// File of `--<table_name>` + UNLOAD blocks to snapshot after the replay
    #[serde(default)]
    pub unload_system_table_queries: Option<String>,
}

fn default_interface() -> String {
    "psql".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tolerance_sec() -> u64 {
    300
}

fn default_refresh_sec() -> u64 {
    600
}

fn default_idle_sec() -> u64 {
    120
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        self.default_protocol()?;
        self.filters()?;

        if self.execute_unload_statements {
            let output = self
                .replay_output
                .as_deref()
                .ok_or(ConfigError::UnloadsNeedOutput)?;
            if !output.starts_with("s3://") {
                return Err(ConfigError::UnloadOutputNotS3(output.to_string()));
            }
            if self.unload_iam_role.is_none() {
                return Err(ConfigError::MissingUnloadRole);
            }
        }
        if self.unload_system_table_queries.is_some()
            && (self.replay_output.is_none() || self.unload_iam_role.is_none())
        {
            return Err(ConfigError::SystemTablesNeedOutput);
        }
        if self.num_workers == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.target_cluster_endpoint.parse()
    }

    pub fn default_protocol(&self) -> Result<Protocol, ConfigError> {
        match self.default_interface.as_str() {
            "psql" => Ok(Protocol::Psql),
            "odbc" => Ok(Protocol::Odbc),
            other => Err(ConfigError::BadInterface(other.to_string())),
        }
    }

    pub fn filters(&self) -> Result<Filters, ConfigError> {
        Ok(Filters::from_spec(&self.filters)?)
    }

    pub fn error_location(&self) -> &str {
        self.error_location
            .as_deref()
            .or(self.replay_output.as_deref())
            .unwrap_or(".")
    }
}
