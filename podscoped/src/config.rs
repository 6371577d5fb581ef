use anyhow::bail;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/podscope/podscope.toml";
const ENV_CONFIG_PATH: &str = "PODSCOPE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub caches: CacheConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub k8s: K8sConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `PODSCOPE_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Load configuration from an explicit path; a missing or unparsable
    /// file is a startup error rather than a silent default.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))
    }

    /// Rejects configurations a run cannot start with. Called once at
    /// startup; runtime code assumes a validated config.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.event_channel_buffer == 0 {
            bail!("runtime.event_channel_buffer must be at least 1");
        }
        if self.caches.max_process_cache_size == 0 || self.caches.max_pid_cache_size == 0 {
            bail!("cache sizes must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.caches.eviction_ratio) {
            bail!(
                "caches.eviction_ratio must be within [0, 1], got {}",
                self.caches.eviction_ratio
            );
        }
        if !(0.0..=100.0).contains(&self.thresholds.error_rate_pct) {
            bail!(
                "thresholds.error_rate_pct must be within [0, 100], got {}",
                self.thresholds.error_rate_pct
            );
        }
        if self.thresholds.rtt_spike_ms == 0 {
            bail!("thresholds.rtt_spike_ms must be at least 1");
        }
        if self.thresholds.fs_slow_ms == 0 {
            bail!("thresholds.fs_slow_ms must be at least 1");
        }
        if self.k8s.api_timeout_ms == 0 {
            bail!("k8s.api_timeout_ms must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the bounded reader-to-consumer handoff queue. Enqueue is
    /// non-blocking; a full queue drops the event and counts it.
    #[serde(default = "default_event_channel_buffer")]
    pub event_channel_buffer: usize,
    #[serde(default = "default_event_pool_size")]
    pub event_pool_size: usize,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default = "default_cpu_target_pct")]
    pub cpu_target_pct: u64,
    #[serde(default = "default_rss_cap_mb")]
    pub rss_cap_mb: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_channel_buffer: default_event_channel_buffer(),
            event_pool_size: default_event_pool_size(),
            report_interval_secs: default_report_interval_secs(),
            cpu_target_pct: default_cpu_target_pct(),
            rss_cap_mb: default_rss_cap_mb(),
        }
    }
}

fn default_event_channel_buffer() -> usize {
    100
}
fn default_event_pool_size() -> usize {
    256
}
fn default_report_interval_secs() -> u64 {
    10
}
fn default_cpu_target_pct() -> u64 {
    25
}
fn default_rss_cap_mb() -> u64 {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_process_cache_size")]
    pub max_process_cache_size: usize,
    #[serde(default = "default_max_pid_cache_size")]
    pub max_pid_cache_size: usize,
    /// Eviction brings a full cache down to `ceil(max * ratio)` entries.
    #[serde(default = "default_eviction_ratio")]
    pub eviction_ratio: f64,
    #[serde(default = "default_process_name_ttl_secs")]
    pub process_name_ttl_secs: u64,
    #[serde(default = "default_cgroup_ttl_secs")]
    pub cgroup_ttl_secs: u64,
    #[serde(default = "default_max_cgroup_file_path_len")]
    pub max_cgroup_file_path_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_process_cache_size: default_max_process_cache_size(),
            max_pid_cache_size: default_max_pid_cache_size(),
            eviction_ratio: default_eviction_ratio(),
            process_name_ttl_secs: default_process_name_ttl_secs(),
            cgroup_ttl_secs: default_cgroup_ttl_secs(),
            max_cgroup_file_path_len: default_max_cgroup_file_path_len(),
        }
    }
}

fn default_max_process_cache_size() -> usize {
    4096
}
fn default_max_pid_cache_size() -> usize {
    8192
}
fn default_eviction_ratio() -> f64 {
    0.9
}
fn default_process_name_ttl_secs() -> u64 {
    60
}
fn default_cgroup_ttl_secs() -> u64 {
    60
}
fn default_max_cgroup_file_path_len() -> usize {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_proc_base_path")]
    pub proc_base_path: PathBuf,
    #[serde(default = "default_cgroup_base_path")]
    pub cgroup_base_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            proc_base_path: default_proc_base_path(),
            cgroup_base_path: default_cgroup_base_path(),
        }
    }
}

fn default_proc_base_path() -> PathBuf {
    PathBuf::from("/proc")
}
fn default_cgroup_base_path() -> String {
    "/sys/fs/cgroup".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct K8sConfig {
    #[serde(default = "default_k8s_enabled")]
    pub enabled: bool,
    /// Upper bound on any on-demand API lookup made from the event path.
    #[serde(default = "default_k8s_api_timeout_ms")]
    pub api_timeout_ms: u64,
    #[serde(default = "default_informer_sync_timeout_ms")]
    pub informer_sync_timeout_ms: u64,
    #[serde(default = "default_k8s_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_k8s_cache_size")]
    pub cache_size: usize,
}

impl K8sConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
    pub fn informer_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.informer_sync_timeout_ms)
    }
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            enabled: default_k8s_enabled(),
            api_timeout_ms: default_k8s_api_timeout_ms(),
            informer_sync_timeout_ms: default_informer_sync_timeout_ms(),
            cache_ttl_secs: default_k8s_cache_ttl_secs(),
            cache_size: default_k8s_cache_size(),
        }
    }
}

fn default_k8s_enabled() -> bool {
    true
}
fn default_k8s_api_timeout_ms() -> u64 {
    100
}
fn default_informer_sync_timeout_ms() -> u64 {
    2000
}
fn default_k8s_cache_ttl_secs() -> u64 {
    300
}
fn default_k8s_cache_size() -> usize {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThresholdConfig {
    /// Per-category error percentage that flags an anomaly (minimum 10
    /// samples before it can fire).
    #[serde(default = "default_error_rate_pct")]
    pub error_rate_pct: f64,
    #[serde(default = "default_rtt_spike_ms")]
    pub rtt_spike_ms: u64,
    #[serde(default = "default_fs_slow_ms")]
    pub fs_slow_ms: u64,
    /// More than this many RTT spikes per minute on one target escalates
    /// the anomaly severity.
    #[serde(default = "default_spike_escalation_per_min")]
    pub spike_escalation_per_min: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            error_rate_pct: default_error_rate_pct(),
            rtt_spike_ms: default_rtt_spike_ms(),
            fs_slow_ms: default_fs_slow_ms(),
            spike_escalation_per_min: default_spike_escalation_per_min(),
        }
    }
}

fn default_error_rate_pct() -> f64 {
    10.0
}
fn default_rtt_spike_ms() -> u64 {
    100
}
fn default_fs_slow_ms() -> u64 {
    100
}
fn default_spike_escalation_per_min() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Consecutive reader errors within this window collapse into one log.
    #[serde(default = "default_error_log_interval_secs")]
    pub error_log_interval_secs: u64,
    #[serde(default = "default_high_error_count_threshold")]
    pub high_error_count_threshold: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            error_log_interval_secs: default_error_log_interval_secs(),
            high_error_count_threshold: default_high_error_count_threshold(),
        }
    }
}

fn default_error_log_interval_secs() -> u64 {
    5
}
fn default_high_error_count_threshold() -> u64 {
    100
}

/// Validates a Kubernetes object name (pod, namespace, container): RFC 1123
/// label/subdomain shape, lowercase alphanumerics and dashes.
pub fn validate_k8s_name(kind: &str, name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("{kind} name must not be empty");
    }
    if name.len() > 253 {
        bail!("{kind} name exceeds 253 characters");
    }
    let ok_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    if !ok_chars {
        bail!("{kind} name {name:?} contains characters outside [a-z0-9.-]");
    }
    if name.starts_with(['-', '.']) || name.ends_with(['-', '.']) {
        bail!("{kind} name {name:?} must start and end with an alphanumeric");
    }
    Ok(())
}
