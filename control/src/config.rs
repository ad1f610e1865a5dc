//! Configuration for the upstream sync controller
//!
//! Three layers, later wins: built-in defaults, the YAML config file, then
//! command-line flags (each flag can also come from an `UPSTREAM_SYNC_*`
//! environment variable). The result is validated once and then shared as an
//! immutable [`SyncConfig`] for the whole process lifetime.
//!
//! Example `config.yaml`:
//! ```yaml
//! Namespace: ingress
//! ServiceName: ingress-nginx-controller
//! PortName: http
//! NginxConf: /etc/nginx/conf.d/upstream.conf
//! ReloadCmd: ["nginx", "-s", "reload"]
//! NodeLabelKey: node-role.kubernetes.io/edge
//! IgnoreNotReady: true
//! ```

use crate::apis::cluster_state::LabelFilter;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default location of the YAML config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/upstream-sync/config.yaml";

/// Default location of the generated nginx upstream file
pub const DEFAULT_UPSTREAM_CONF: &str = "/etc/nginx/conf.d/upstream.conf";

/// API servers cap watch timeouts just under five minutes
const MAX_WATCH_TIMEOUT_SECS: u32 = 295;

/// Configuration errors (all fatal at startup)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("service name must be specified (via config file or --service flag)")]
    MissingServiceName,

    #[error("watch timeout must be between 1 and {max} seconds, got {0}", max = MAX_WATCH_TIMEOUT_SECS - 1)]
    InvalidWatchTimeout(u32),

    #[error("watch backoff must be at least 1 second")]
    ZeroWatchBackoff,

    #[error("reload timeout must be at least 1 second")]
    ZeroReloadTimeout,

    #[error("failed to read config file {}: {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    FileParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Command-line flags
#[derive(Parser, Debug, Default)]
#[command(
    name = "upstream-sync",
    about = "Keeps an nginx upstream block in sync with Kubernetes nodes"
)]
pub struct Cli {
    /// Kubernetes namespace of the service
    #[arg(long, env = "UPSTREAM_SYNC_NAMESPACE")]
    pub namespace: Option<String>,

    /// Kubernetes service name
    #[arg(long = "service", env = "UPSTREAM_SYNC_SERVICE")]
    pub service_name: Option<String>,

    /// Service port name (optional, first port when omitted)
    #[arg(long, env = "UPSTREAM_SYNC_PORT_NAME")]
    pub port_name: Option<String>,

    /// Path to the nginx upstream conf file
    #[arg(long, env = "UPSTREAM_SYNC_NGINX_CONF")]
    pub nginx_conf: Option<PathBuf>,

    /// Name of the generated nginx upstream block
    #[arg(long, env = "UPSTREAM_SYNC_UPSTREAM_NAME")]
    pub upstream_name: Option<String>,

    /// Command to reload nginx (space separated)
    #[arg(long, env = "UPSTREAM_SYNC_RELOAD_CMD")]
    pub reload_cmd: Option<String>,

    /// Node label key to filter nodes (optional)
    #[arg(long, env = "UPSTREAM_SYNC_NODE_LABEL_KEY")]
    pub node_label_key: Option<String>,

    /// Node label value to filter nodes (optional, requires --node-label-key)
    #[arg(long = "node-label-val", env = "UPSTREAM_SYNC_NODE_LABEL_VAL")]
    pub node_label_value: Option<String>,

    /// Ignore nodes that are not Ready
    #[arg(
        long,
        env = "UPSTREAM_SYNC_IGNORE_NOT_READY",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub ignore_not_ready: Option<bool>,

    /// Path to the YAML config file
    #[arg(long = "config", env = "UPSTREAM_SYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config_path: PathBuf,

    /// Log output format
    #[arg(long, env = "UPSTREAM_SYNC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// On-disk config file layout (PascalCase keys)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default)]
    pub nginx_conf: Option<PathBuf>,
    #[serde(default)]
    pub upstream_name: Option<String>,
    #[serde(default)]
    pub reload_cmd: Option<Vec<String>>,
    #[serde(default)]
    pub node_label_key: Option<String>,
    #[serde(default, rename = "NodeLabelVal", alias = "NodeLabelValue")]
    pub node_label_value: Option<String>,
    #[serde(default)]
    pub ignore_not_ready: Option<bool>,
    #[serde(default)]
    pub reload_timeout_secs: Option<u64>,
    #[serde(default)]
    pub watch_backoff_secs: Option<u64>,
    #[serde(default)]
    pub watch_timeout_secs: Option<u32>,
}

/// Validated, immutable controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Namespace of the target service
    pub namespace: String,

    /// Target service name (never empty)
    pub service_name: String,

    /// Port name to resolve; any port when `None`
    pub port_name: Option<String>,

    /// Node label key filter
    pub node_label_key: Option<String>,

    /// Node label value filter (only meaningful with a key)
    pub node_label_value: Option<String>,

    /// Skip nodes whose Ready condition is not True
    pub ignore_not_ready: bool,

    /// Generated nginx upstream file
    pub upstream_conf: PathBuf,

    /// nginx upstream block name
    pub upstream_name: String,

    /// Reload command argument vector (no shell)
    pub reload_cmd: Vec<String>,

    /// Upper bound for one reload command run
    pub reload_timeout: Duration,

    /// Delay before retrying a failed watch subscription
    pub watch_backoff: Duration,

    /// Server-side watch timeout; the API server closes the stream after it
    pub watch_timeout_secs: u32,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_reload_cmd() -> Vec<String> {
    vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()]
}

fn default_reload_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_watch_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_watch_timeout_secs() -> u32 {
    290
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_name: String::new(),
            port_name: None,
            node_label_key: None,
            node_label_value: None,
            ignore_not_ready: false,
            upstream_conf: PathBuf::from(DEFAULT_UPSTREAM_CONF),
            upstream_name: common::DEFAULT_UPSTREAM_NAME.to_string(),
            reload_cmd: default_reload_cmd(),
            reload_timeout: default_reload_timeout(),
            watch_backoff: default_watch_backoff(),
            watch_timeout_secs: default_watch_timeout_secs(),
        }
    }
}

/// Treat empty strings as "not set"
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl SyncConfig {
    /// Load the config file named by `cli` and merge the flags over it.
    ///
    /// A missing file is not an error. An unreadable or malformed file is
    /// logged and skipped so the flags alone can still produce a config.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match load_config_file(&cli.config_path) {
            Ok(Some(file)) => Some(file),
            Ok(None) => {
                debug!(
                    "No config file at {}, using flags and defaults",
                    cli.config_path.display()
                );
                None
            }
            Err(e) => {
                warn!("Ignoring config file: {}", e);
                None
            }
        };

        Self::from_sources(file, cli)
    }

    /// Merge defaults, file values and flags, then validate
    pub fn from_sources(file: Option<ConfigFile>, cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_cli(cli);
        config.validate()?;

        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = non_empty(file.namespace) {
            self.namespace = v;
        }
        if let Some(v) = non_empty(file.service_name) {
            self.service_name = v;
        }
        if let Some(v) = non_empty(file.port_name) {
            self.port_name = Some(v);
        }
        if let Some(v) = file.nginx_conf.filter(|p| !p.as_os_str().is_empty()) {
            self.upstream_conf = v;
        }
        if let Some(v) = non_empty(file.upstream_name) {
            self.upstream_name = v;
        }
        if let Some(v) = file.reload_cmd.filter(|cmd| !cmd.is_empty()) {
            self.reload_cmd = v;
        }
        if let Some(v) = non_empty(file.node_label_key) {
            self.node_label_key = Some(v);
        }
        if let Some(v) = non_empty(file.node_label_value) {
            self.node_label_value = Some(v);
        }
        if let Some(v) = file.ignore_not_ready {
            self.ignore_not_ready = v;
        }
        if let Some(v) = file.reload_timeout_secs {
            self.reload_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.watch_backoff_secs {
            self.watch_backoff = Duration::from_secs(v);
        }
        if let Some(v) = file.watch_timeout_secs {
            self.watch_timeout_secs = v;
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = non_empty(cli.namespace.clone()) {
            self.namespace = v;
        }
        if let Some(v) = non_empty(cli.service_name.clone()) {
            self.service_name = v;
        }
        if let Some(v) = non_empty(cli.port_name.clone()) {
            self.port_name = Some(v);
        }
        if let Some(v) = cli.nginx_conf.clone().filter(|p| !p.as_os_str().is_empty()) {
            self.upstream_conf = v;
        }
        if let Some(v) = non_empty(cli.upstream_name.clone()) {
            self.upstream_name = v;
        }
        if let Some(cmd) = cli.reload_cmd.as_deref() {
            let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                self.reload_cmd = argv;
            }
        }
        if let Some(v) = non_empty(cli.node_label_key.clone()) {
            self.node_label_key = Some(v);
        }
        if let Some(v) = non_empty(cli.node_label_value.clone()) {
            self.node_label_value = Some(v);
        }
        if let Some(v) = cli.ignore_not_ready {
            self.ignore_not_ready = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::MissingServiceName);
        }
        if self.watch_timeout_secs == 0 || self.watch_timeout_secs >= MAX_WATCH_TIMEOUT_SECS {
            return Err(ConfigError::InvalidWatchTimeout(self.watch_timeout_secs));
        }
        if self.watch_backoff.is_zero() {
            return Err(ConfigError::ZeroWatchBackoff);
        }
        if self.reload_timeout.is_zero() {
            return Err(ConfigError::ZeroReloadTimeout);
        }
        Ok(())
    }

    /// Node label filter derived from the key/value settings
    pub fn label_filter(&self) -> LabelFilter {
        LabelFilter::new(self.node_label_key.clone(), self.node_label_value.clone())
    }
}

/// Read and parse a YAML config file; `Ok(None)` if it doesn't exist
pub fn load_config_file(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::FileRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    // An empty file parses as YAML null; treat it as "no values"
    if content.trim().is_empty() {
        return Ok(Some(ConfigFile::default()));
    }

    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::FileParse {
            path: path.to_path_buf(),
            source,
        })
}
