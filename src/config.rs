use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::engine::ifaces::NetworkState;
use crate::recorder::RecorderSettings;

/// Lower bound applied to `persist_threshold_bytes`.
pub const MIN_PERSIST_THRESHOLD: u64 = 128 * 1024;
/// Upper bound applied to `persist_threshold_bytes`.
pub const MAX_PERSIST_THRESHOLD: u64 = 2 * 1024 * 1024;

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Top-level configuration for the netstatsd daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the `netstats/` store. Default: /var/lib/netstatsd.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Periodic poll interval. Default: 30m.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a poll waits for providers to answer. Default: 100ms.
    #[serde(default = "default_provider_poll_timeout", with = "humantime_serde")]
    pub provider_poll_timeout: Duration,

    /// Pending bytes that trigger a persist, clamped to [128KiB, 2MiB].
    #[serde(default = "default_persist_threshold_bytes")]
    pub persist_threshold_bytes: u64,

    /// Minimum gap between polls requested by one non-system session. Default: 15s.
    #[serde(default = "default_session_poll_rate_limit", with = "humantime_serde")]
    pub session_poll_rate_limit: Duration,

    /// Bucket and retention settings per recorder.
    #[serde(default)]
    pub recorders: RecordersConfig,

    /// Legacy store import.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Networks active at startup.
    #[serde(default)]
    pub networks: Vec<NetworkState>,
}

/// Bucket and retention settings of one recorder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecorderConfig {
    #[serde(with = "humantime_serde")]
    pub bucket_duration: Duration,
    /// Age at which the active shard is closed.
    #[serde(with = "humantime_serde")]
    pub rotate_age: Duration,
    /// Age at which closed shards are deleted.
    #[serde(with = "humantime_serde")]
    pub delete_age: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordersConfig {
    /// Interface totals from the kernel. Default: 1h / 15d / 90d.
    #[serde(default = "default_network_recorder")]
    pub dev: RecorderConfig,
    /// Uid traffic grouped by interface. Default: 1h / 15d / 90d.
    #[serde(default = "default_network_recorder")]
    pub xt: RecorderConfig,
    /// Untagged per-uid traffic. Default: 2h / 15d / 90d.
    #[serde(default = "default_uid_recorder")]
    pub uid: RecorderConfig,
    /// Tagged per-uid traffic. Default: 2h / 5d / 15d.
    #[serde(default = "default_uid_tag_recorder")]
    pub uid_tag: RecorderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Directory of the legacy store. Migration is skipped when unset.
    #[serde(default)]
    pub legacy_dir: Option<PathBuf>,

    /// Failed attempts after which the import is no longer retried. Default: 1.
    #[serde(default = "default_target_attempts")]
    pub target_attempts: u32,

    /// Cross-check imported data against the legacy recorder. Default: on in
    /// debug builds.
    #[serde(default = "default_verify")]
    pub verify: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g., ":9090"). Empty disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/netstatsd")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_provider_poll_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_persist_threshold_bytes() -> u64 {
    MAX_PERSIST_THRESHOLD
}

fn default_session_poll_rate_limit() -> Duration {
    Duration::from_secs(15)
}

fn default_network_recorder() -> RecorderConfig {
    RecorderConfig {
        bucket_duration: HOUR,
        rotate_age: 15 * DAY,
        delete_age: 90 * DAY,
    }
}

fn default_uid_recorder() -> RecorderConfig {
    RecorderConfig {
        bucket_duration: 2 * HOUR,
        rotate_age: 15 * DAY,
        delete_age: 90 * DAY,
    }
}

fn default_uid_tag_recorder() -> RecorderConfig {
    RecorderConfig {
        bucket_duration: 2 * HOUR,
        rotate_age: 5 * DAY,
        delete_age: 15 * DAY,
    }
}

fn default_target_attempts() -> u32 {
    1
}

fn default_verify() -> bool {
    cfg!(debug_assertions)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            base_dir: default_base_dir(),
            poll_interval: default_poll_interval(),
            provider_poll_timeout: default_provider_poll_timeout(),
            persist_threshold_bytes: default_persist_threshold_bytes(),
            session_poll_rate_limit: default_session_poll_rate_limit(),
            recorders: RecordersConfig::default(),
            migration: MigrationConfig::default(),
            health: HealthConfig::default(),
            networks: Vec::new(),
        }
    }
}

impl Default for RecordersConfig {
    fn default() -> Self {
        Self {
            dev: default_network_recorder(),
            xt: default_network_recorder(),
            uid: default_uid_recorder(),
            uid_tag: default_uid_tag_recorder(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            legacy_dir: None,
            target_attempts: default_target_attempts(),
            verify: default_verify(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            bail!("base_dir is required");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.provider_poll_timeout.is_zero() {
            bail!("provider_poll_timeout must be positive");
        }

        for (name, rec) in self.recorders.named() {
            rec.validate()
                .with_context(|| format!("invalid recorders.{name} config"))?;
        }

        if let Some(dir) = &self.migration.legacy_dir {
            if dir == &self.stats_dir() {
                bail!("migration.legacy_dir must differ from the stats directory");
            }
        }

        for (i, net) in self.networks.iter().enumerate() {
            if net.iface.as_deref().is_some_and(str::is_empty) {
                bail!("networks[{i}].iface must not be empty");
            }
            if net.stacked_ifaces.iter().any(String::is_empty) {
                bail!("networks[{i}].stacked_ifaces must not contain empty names");
            }
        }

        Ok(())
    }

    /// Directory holding the shard files and migration counters.
    pub fn stats_dir(&self) -> PathBuf {
        self.base_dir.join("netstats")
    }

    /// Persist threshold after clamping.
    pub fn persist_threshold(&self) -> i64 {
        let clamped = self
            .persist_threshold_bytes
            .clamp(MIN_PERSIST_THRESHOLD, MAX_PERSIST_THRESHOLD);
        i64::try_from(clamped).unwrap_or(i64::MAX)
    }
}

impl RecordersConfig {
    /// Recorder configs with their store prefixes.
    pub fn named(&self) -> [(&'static str, &RecorderConfig); 4] {
        [
            ("dev", &self.dev),
            ("xt", &self.xt),
            ("uid", &self.uid),
            ("uid_tag", &self.uid_tag),
        ]
    }
}

impl RecorderConfig {
    fn validate(&self) -> Result<()> {
        if self.bucket_duration.as_millis() == 0 {
            bail!("bucket_duration must be at least 1ms");
        }
        if self.rotate_age < self.bucket_duration {
            bail!("rotate_age must be at least bucket_duration");
        }
        if self.delete_age < self.rotate_age {
            bail!("delete_age must be at least rotate_age");
        }
        Ok(())
    }

    pub fn settings(&self) -> RecorderSettings {
        let millis = |d: Duration| i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        RecorderSettings {
            bucket_duration: millis(self.bucket_duration),
            rotate_age: millis(self.rotate_age),
            delete_age: millis(self.delete_age),
        }
    }
}
