use serde::{Deserialize, Serialize};

/// Quality tier requested from the enhancement backend.  Heavier tiers take
/// longer per image, which also lowers the burst threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Fast,
    #[default]
    Balanced,
    Best,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Fast => "fast",
            QualityTier::Balanced => "balanced",
            QualityTier::Best => "best",
        }
    }
}

/// Output encoding the backend should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Webp,
    Jpeg,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    /// A more widely decodable encoding to fall back to when the display
    /// side cannot decode this one.
    pub fn fallback(&self) -> OutputFormat {
        match self {
            OutputFormat::Webp => OutputFormat::Png,
            OutputFormat::Png => OutputFormat::Jpeg,
            OutputFormat::Jpeg => OutputFormat::Png,
        }
    }
}

pub const MIN_SCALE: u8 = 2;
pub const MAX_SCALE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformParams {
    #[serde(default = "default_scale")]
    pub scale: u8,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_scale() -> u8 {
    MIN_SCALE
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            quality: QualityTier::default(),
            format: OutputFormat::default(),
        }
    }
}

impl TransformParams {
    /// Clamp the scale into the supported range.
    pub fn normalized(mut self) -> Self {
        self.scale = self.scale.clamp(MIN_SCALE, MAX_SCALE);
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Heavy requests keep the backend busy longer per image.
    pub fn is_heavy(&self) -> bool {
        self.quality == QualityTier::Best || self.scale >= MAX_SCALE
    }
}

/// Tuning pushed to the backend via `POST /config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendTuning {
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
    #[serde(default)]
    pub extra_models: bool,
    #[serde(default = "default_idle_shutdown_minutes")]
    pub idle_shutdown_minutes: u64,
}

fn default_cache_max_bytes() -> u64 {
    2048 * 1024 * 1024
}

fn default_cache_max_age_secs() -> u64 {
    14 * 24 * 3600
}

fn default_idle_shutdown_minutes() -> u64 {
    15
}

impl Default for BackendTuning {
    fn default() -> Self {
        Self {
            cache_max_bytes: default_cache_max_bytes(),
            cache_max_age_secs: default_cache_max_age_secs(),
            extra_models: false,
            idle_shutdown_minutes: default_idle_shutdown_minutes(),
        }
    }
}

/// User-facing settings, delivered by consumers in `SettingsChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Hosts the mediator may work on.  Empty means every host.
    #[serde(default)]
    pub allow_sites: Vec<String>,
    /// Hosts that are always excluded; wins over `allow_sites`.
    #[serde(default)]
    pub deny_sites: Vec<String>,
    #[serde(default = "default_preload_count")]
    pub preload_count: usize,
    #[serde(default)]
    pub auto_mode: bool,
    #[serde(default)]
    pub transform: TransformParams,
    #[serde(default)]
    pub backend: BackendTuning,
}

fn default_enabled() -> bool {
    true
}

fn default_preload_count() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            allow_sites: Vec::new(),
            deny_sites: Vec::new(),
            preload_count: default_preload_count(),
            auto_mode: false,
            transform: TransformParams::default(),
            backend: BackendTuning::default(),
        }
    }
}

impl Settings {
    /// Whether a consumer on `site` may use the mediator.
    pub fn allows_site(&self, site: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let site = site.trim().to_ascii_lowercase();
        if self.deny_sites.iter().any(|p| host_matches(&site, p)) {
            return false;
        }
        self.allow_sites.is_empty() || self.allow_sites.iter().any(|p| host_matches(&site, p))
    }
}

/// `pattern` matches the host itself or any of its subdomains.
fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().trim_start_matches("*.").to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    host == pattern
        || host
            .strip_suffix(pattern.as_str())
            .map_or(false, |prefix| prefix.ends_with('.'))
}
