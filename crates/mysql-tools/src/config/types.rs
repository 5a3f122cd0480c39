//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
///
/// Every name the workflows create on the platform (worker apps, the
/// forwarding app, service keys) comes from here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Platform CLI settings.
    #[serde(default)]
    pub cf: CfConfig,

    /// Remote migration workflow settings.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Direct SQL tunnel settings.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Platform JSON API settings.
    #[serde(default)]
    pub api: ApiConfig,
}

/// Platform CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfConfig {
    /// Path or name of the `cf` executable (default: "cf").
    #[serde(default = "default_cf_binary")]
    pub binary: PathBuf,
}

impl Default for CfConfig {
    fn default() -> Self {
        Self {
            binary: default_cf_binary(),
        }
    }
}

/// Remote migration workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Prefix for the throwaway worker app; a fresh UUID is appended per run.
    #[serde(default = "default_app_name_prefix")]
    pub app_name_prefix: String,

    /// Directory holding the worker app files (the `migrate` executable etc.)
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,

    /// Buildpack used to push the worker app (default: binary_buildpack).
    #[serde(default = "default_binary_buildpack")]
    pub buildpack: String,

    /// Start command for the worker app (default: "sleep infinity").
    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Interval between task status fetches in milliseconds (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Upper bound on waiting for the migration task. Unbounded if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,

    /// Delay before fetching logs of a failed task (default: 5).
    #[serde(default = "default_log_flush_delay_secs")]
    pub log_flush_delay_secs: u64,

    /// Delete the worker app after a failed run (default: true).
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Suffix appended to the donor's name on replace (default: "-old").
    #[serde(default = "default_rename_suffix")]
    pub rename_suffix: String,

    /// Let the worker skip TLS certificate checks against both databases.
    #[serde(default)]
    pub skip_tls_validation: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            app_name_prefix: default_app_name_prefix(),
            assets_dir: default_assets_dir(),
            buildpack: default_binary_buildpack(),
            start_command: default_start_command(),
            task_poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: None,
            log_flush_delay_secs: default_log_flush_delay_secs(),
            cleanup: true,
            rename_suffix: default_rename_suffix(),
            skip_tls_validation: false,
        }
    }
}

impl MigrationConfig {
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn log_flush_delay(&self) -> Duration {
        Duration::from_secs(self.log_flush_delay_secs)
    }
}

/// Direct SQL tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Name of the static app pushed to obtain an SSH route (default: "static-app").
    #[serde(default = "default_tunnel_app_name")]
    pub app_name: String,

    /// Buildpack for the forwarding app (default: staticfile_buildpack).
    #[serde(default = "default_static_buildpack")]
    pub buildpack: String,

    /// Port the database listens on behind the route (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub remote_port: u16,

    /// Deadline for all forwarded ports to become reachable (default: 60).
    #[serde(default = "default_tunnel_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Interval between reachability probes in milliseconds (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Backoff after a transient accept error in milliseconds (default: 50).
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,

    /// Name of the service key created per instance (default: "service-key").
    #[serde(default = "default_service_key_name")]
    pub service_key_name: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            app_name: default_tunnel_app_name(),
            buildpack: default_static_buildpack(),
            remote_port: default_mysql_port(),
            poll_timeout_secs: default_tunnel_poll_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            accept_backoff_ms: default_accept_backoff_ms(),
            service_key_name: default_service_key_name(),
        }
    }
}

impl TunnelConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

/// Platform JSON API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Attempts per task status fetch before giving up (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_cf_binary() -> PathBuf {
    PathBuf::from("cf")
}

fn default_app_name_prefix() -> String {
    "migrate-app-".to_string()
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("app")
}

fn default_binary_buildpack() -> String {
    "binary_buildpack".to_string()
}

fn default_start_command() -> String {
    "sleep infinity".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_flush_delay_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_rename_suffix() -> String {
    "-old".to_string()
}

fn default_tunnel_app_name() -> String {
    "static-app".to_string()
}

fn default_static_buildpack() -> String {
    "staticfile_buildpack".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_tunnel_poll_timeout_secs() -> u64 {
    60
}

fn default_accept_backoff_ms() -> u64 {
    50
}

fn default_service_key_name() -> String {
    "service-key".to_string()
}

fn default_max_attempts() -> u32 {
    3
}
