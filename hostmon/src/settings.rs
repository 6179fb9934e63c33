//! Agent settings.
//!
//! The settings tree is plain serde over YAML. Every field has a default so
//! a partial (or absent) configuration file is always valid. Several
//! configuration files can be supplied; later files override earlier ones
//! key by key.

use crate::BootstrapResult;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use slog::Level;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root of the agent configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Logging output, format and verbosity.
    pub logging: LoggingSettings,

    /// Metric store retention tuning.
    pub store: StoreSettings,

    /// Local HTTP API (Prometheus exposition + GraphQL).
    pub api: ApiSettings,

    /// NRPE check-protocol server.
    pub nrpe: NrpeSettings,

    /// Zabbix passive-check server.
    pub zabbix: ZabbixSettings,

    /// Vendor uplink.
    pub uplink: UplinkSettings,

    /// Periodic HTTP checks.
    pub checks: Vec<HttpCheckSettings>,

    /// Crash report collection.
    pub crash_report: CrashReportSettings,

    /// Directory holding the agent state file and crash report work area.
    pub state_dir: PathBuf,
}

/// Logging settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Specifies log output.
    pub output: LogOutput,

    /// The format to use for log messages.
    pub format: LogFormat,

    /// Set the logging verbosity level.
    pub verbosity: LogVerbosity,
}

/// Log output destination.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Write log to terminal.
    #[default]
    Terminal,
    /// Write log to file with the specified path.
    ///
    /// File will be created if it doesn't exist and overwritten otherwise.
    File(PathBuf),
}

/// Format of the log output.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text
    #[default]
    Text,
    /// JSON
    Json,
}

/// Log verbosity levels which match 1:1 with [`slog::Level`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    /// See [`slog::Level::Critical`].
    Critical,
    /// See [`slog::Level::Error`].
    Error,
    /// See [`slog::Level::Warning`].
    Warning,
    /// See [`slog::Level::Info`].
    #[default]
    Info,
    /// See [`slog::Level::Debug`].
    Debug,
    /// See [`slog::Level::Trace`].
    Trace,
}

impl From<LogVerbosity> for Level {
    fn from(level: LogVerbosity) -> Self {
        match level {
            LogVerbosity::Critical => Self::Critical,
            LogVerbosity::Error => Self::Error,
            LogVerbosity::Warning => Self::Warning,
            LogVerbosity::Info => Self::Info,
            LogVerbosity::Debug => Self::Debug,
            LogVerbosity::Trace => Self::Trace,
        }
    }
}

/// Metric store retention settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Points older than this are evicted by the garbage collector.
    pub max_points_age_secs: u64,

    /// Metrics without points and idle for longer than this are purged.
    pub max_metrics_age_secs: u64,

    /// Interval between garbage collection runs.
    pub gc_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_points_age_secs: 600,
            max_metrics_age_secs: 3600,
            gc_interval_secs: 300,
        }
    }
}

/// Local HTTP API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Enables the HTTP API server.
    pub enabled: bool,

    /// Listen port. Overridable with the `PORT` environment variable.
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8015,
        }
    }
}

/// NRPE server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NrpeSettings {
    /// Enables the NRPE server.
    pub enabled: bool,

    /// Listen address.
    pub listen: String,

    /// Static command responses served in addition to the built-in commands.
    pub commands: BTreeMap<String, String>,
}

impl Default for NrpeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:5666".to_owned(),
            commands: BTreeMap::new(),
        }
    }
}

/// Zabbix server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ZabbixSettings {
    /// Enables the Zabbix passive-check server.
    pub enabled: bool,

    /// Listen address.
    pub listen: String,
}

impl Default for ZabbixSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:10050".to_owned(),
        }
    }
}

/// Vendor uplink settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkSettings {
    /// Enables the uplink.
    pub enabled: bool,

    /// Base URL of the vendor API.
    pub base_url: String,

    /// Account identifier used during registration.
    pub account_id: String,

    /// Registration key used during registration.
    pub registration_key: String,

    /// Skip TLS certificate verification. Development only.
    pub tls_insecure: bool,

    /// Capacity of the metric batch queue between the store and the uplink.
    pub queue_size: usize,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            account_id: String::new(),
            registration_key: String::new(),
            tls_insecure: false,
            queue_size: 256,
        }
    }
}

/// A single periodic HTTP check.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCheckSettings {
    /// Name reported in the `check` label of the resulting metric.
    pub name: String,

    /// Target URL.
    pub url: String,

    /// When non-zero, any other status code is critical.
    pub expected_status_code: u16,

    /// Probe interval.
    pub interval_secs: u64,
}

impl Default for HttpCheckSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            expected_status_code: 0,
            interval_secs: 60,
        }
    }
}

/// Crash report settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashReportSettings {
    /// Enables stderr redirection and crash report bundling.
    pub enabled: bool,

    /// Maximum number of crash report archives kept on disk.
    pub max_reports: usize,
}

impl Default for CrashReportSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reports: 2,
        }
    }
}

impl AgentSettings {
    /// Loads settings from the given configuration files, later files
    /// overriding earlier ones. No files yields the defaults.
    pub fn load(paths: &[PathBuf]) -> BootstrapResult<Self> {
        let mut merged = serde_yaml::Value::Null;

        for path in paths {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let value: serde_yaml::Value = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;

            merged = merge_values(merged, value);
        }

        if merged.is_null() {
            return Ok(Self::default());
        }

        serde_yaml::from_value(merged).context("deserializing merged configuration")
    }

    /// Path of the persisted agent identity file.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}

fn merge_values(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;

    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };

                base.insert(key, merged);
            }

            Value::Mapping(base)
        }
        // Scalars, sequences and type changes override wholesale.
        (_, overlay) => overlay,
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            logging: Default::default(),
            store: Default::default(),
            api: Default::default(),
            nrpe: Default::default(),
            zabbix: Default::default(),
            uplink: Default::default(),
            checks: Vec::new(),
            crash_report: Default::default(),
            state_dir: PathBuf::from("/var/lib/hostmon"),
        }
    }
}

/// Parses a comma-separated `--config` argument into individual paths.
pub fn split_config_arg(arg: &str) -> Vec<PathBuf> {
    arg.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Path::new(part).to_path_buf())
        .collect()
}
