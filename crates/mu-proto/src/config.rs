use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::params::Settings;
use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Settings in effect until a consumer sends `SettingsChanged`.
    #[serde(default)]
    pub defaults: Settings,
}

/// Consumer socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

/// Local control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "platform::backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Native host program.  Empty means search beside the executable and on PATH.
    #[serde(default)]
    pub host_program: PathBuf,
    #[serde(default)]
    pub host_args: Vec<String>,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_health_ttl_ms")]
    pub health_ttl_ms: u64,
    #[serde(default = "default_start_poll_interval_ms")]
    pub start_poll_interval_ms: u64,
    #[serde(default = "default_start_poll_attempts")]
    pub start_poll_attempts: u32,
    #[serde(default = "default_reconcile_debounce_ms")]
    pub reconcile_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Quiet time after the last failure before a success resets the state.
    #[serde(default = "default_quiet_reset_secs")]
    pub quiet_reset_secs: u64,
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
    #[serde(default = "default_burst_idle_reset_secs")]
    pub burst_idle_reset_secs: u64,
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,
    #[serde(default = "default_burst_threshold_heavy")]
    pub burst_threshold_heavy: u32,
    #[serde(default = "default_burst_cooldown_secs")]
    pub burst_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_stream_ttl_secs")]
    pub safety_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// How many viewports below the current one candidates may come from.
    #[serde(default = "default_lookahead_viewports")]
    pub lookahead_viewports: f64,
    /// Absolute minimum candidate area in square pixels.
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    /// Minimum candidate area relative to the current item.
    #[serde(default = "default_size_ratio")]
    pub size_ratio: f64,
    /// Distance (in viewports) within which a cached result is swapped in.
    #[serde(default = "default_near_viewports")]
    pub near_viewports: f64,
    /// Per-host score multipliers, keyed by the locator's host.
    #[serde(default)]
    pub site_boost: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_processing_affordance_ms")]
    pub processing_affordance_ms: u64,
    #[serde(default = "default_display_wait_secs")]
    pub display_wait_secs: u64,
    #[serde(default = "default_backoff_transient_secs")]
    pub backoff_transient_secs: u64,
    #[serde(default = "default_backoff_soft_secs")]
    pub backoff_soft_secs: u64,
    #[serde(default = "default_backoff_decode_secs")]
    pub backoff_decode_secs: u64,
    #[serde(default = "default_backoff_integrity_secs")]
    pub backoff_integrity_secs: u64,
    #[serde(default = "default_cycle_debounce_ms")]
    pub cycle_debounce_ms: u64,
    #[serde(default = "default_auto_tick_secs")]
    pub auto_tick_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: platform::backend_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            health_timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host_program: PathBuf::new(),
            host_args: Vec::new(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_ttl_ms: default_health_ttl_ms(),
            start_poll_interval_ms: default_start_poll_interval_ms(),
            start_poll_attempts: default_start_poll_attempts(),
            reconcile_debounce_ms: default_reconcile_debounce_ms(),
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            quiet_reset_secs: default_quiet_reset_secs(),
            burst_window_secs: default_burst_window_secs(),
            burst_idle_reset_secs: default_burst_idle_reset_secs(),
            burst_threshold: default_burst_threshold(),
            burst_threshold_heavy: default_burst_threshold_heavy(),
            burst_cooldown_secs: default_burst_cooldown_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            safety_ttl_secs: default_stream_ttl_secs(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            lookahead_viewports: default_lookahead_viewports(),
            min_area: default_min_area(),
            size_ratio: default_size_ratio(),
            near_viewports: default_near_viewports(),
            site_boost: HashMap::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            processing_affordance_ms: default_processing_affordance_ms(),
            display_wait_secs: default_display_wait_secs(),
            backoff_transient_secs: default_backoff_transient_secs(),
            backoff_soft_secs: default_backoff_soft_secs(),
            backoff_decode_secs: default_backoff_decode_secs(),
            backoff_integrity_secs: default_backoff_integrity_secs(),
            cycle_debounce_ms: default_cycle_debounce_ms(),
            auto_tick_secs: default_auto_tick_secs(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_socket_port() -> u16 {
    platform::MEDIATOR_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    48161
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_health_timeout_ms() -> u64 {
    500
}

fn default_ack_timeout_secs() -> u64 {
    15
}

fn default_health_ttl_ms() -> u64 {
    2000
}

fn default_start_poll_interval_ms() -> u64 {
    350
}

fn default_start_poll_attempts() -> u32 {
    16
}

fn default_reconcile_debounce_ms() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_quiet_reset_secs() -> u64 {
    60
}

fn default_burst_window_secs() -> u64 {
    20
}

fn default_burst_idle_reset_secs() -> u64 {
    8
}

fn default_burst_threshold() -> u32 {
    12
}

fn default_burst_threshold_heavy() -> u32 {
    6
}

fn default_burst_cooldown_secs() -> u64 {
    12
}

fn default_cache_max_entries() -> usize {
    24
}

fn default_cache_max_bytes() -> usize {
    96 * 1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_stream_ttl_secs() -> u64 {
    60
}

fn default_lookahead_viewports() -> f64 {
    3.0
}

fn default_min_area() -> f64 {
    120.0 * 120.0
}

fn default_size_ratio() -> f64 {
    0.55
}

fn default_near_viewports() -> f64 {
    1.5
}

fn default_processing_affordance_ms() -> u64 {
    650
}

fn default_display_wait_secs() -> u64 {
    18
}

fn default_backoff_transient_secs() -> u64 {
    12
}

fn default_backoff_soft_secs() -> u64 {
    20
}

fn default_backoff_decode_secs() -> u64 {
    120
}

fn default_backoff_integrity_secs() -> u64 {
    30
}

fn default_cycle_debounce_ms() -> u64 {
    150
}

fn default_auto_tick_secs() -> u64 {
    2
}

impl LifecycleConfig {
    pub fn health_ttl(&self) -> Duration {
        Duration::from_millis(self.health_ttl_ms)
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl StreamConfig {
    pub fn safety_ttl(&self) -> Duration {
        Duration::from_secs(self.safety_ttl_secs)
    }
}

impl SessionConfig {
    pub fn processing_affordance(&self) -> Duration {
        Duration::from_millis(self.processing_affordance_ms)
    }

    pub fn display_wait(&self) -> Duration {
        Duration::from_secs(self.display_wait_secs)
    }

    pub fn cycle_debounce(&self) -> Duration {
        Duration::from_millis(self.cycle_debounce_ms)
    }

    pub fn auto_tick(&self) -> Duration {
        Duration::from_secs(self.auto_tick_secs)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
