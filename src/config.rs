use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{WaypostError, WaypostResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub accessibility: AccessibilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    pub providers: HashMap<String, ProviderEntry>,
    /// Role-to-model mapping. If a role is absent, falls back to active_provider defaults.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub api_base: String,
    /// Default model for this provider (used as fallback when no role config exists).
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Optional API key stored in config.toml (falls back to env var WAYPOST_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Maps guidance roles to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Fast classifier: task-vs-conversation triage. Strict JSON output.
    pub routing: Option<RoleEntry>,
    /// Conversational replies for non-task messages.
    pub chat: Option<RoleEntry>,
    /// Vision / image-understanding model that produces step guidance.
    pub vision: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    /// Model name sent to the API.
    pub model: String,
    /// Overrides the provider-level temperature for this role.
    pub temperature: Option<f64>,
}

fn default_temperature() -> f64 {
    0.1
}

/// Change-detection thresholds. The defaults were calibrated on a single
/// 1080p-class display; treat them as tunables, not truths. A different
/// resolution or encoder changes what a "major" byte delta looks like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Encoded-size delta (bytes) above which a background frame counts as a
    /// major change (new dialog / popup). Small UI deltas never clear this bar.
    #[serde(default = "default_popup_byte_threshold")]
    pub popup_byte_threshold: u64,
    /// Hamming distance between 64-bit fingerprints above which two frames
    /// are considered meaningfully different.
    #[serde(default = "default_hash_distance_threshold")]
    pub hash_distance_threshold: u32,
    /// "coarse" (8×8 grid) or "fine" (32×32 grid, 4×4 blocks).
    #[serde(default = "default_hash_strategy")]
    pub hash_strategy: String,
    /// Background poll interval for the popup watcher.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_popup_byte_threshold() -> u64 {
    12_288
}

fn default_hash_distance_threshold() -> u32 {
    10
}

fn default_hash_strategy() -> String {
    "coarse".into()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            popup_byte_threshold: default_popup_byte_threshold(),
            hash_distance_threshold: default_hash_distance_threshold(),
            hash_strategy: default_hash_strategy(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessibilityConfig {
    /// Accessibility lookups must never block the loop; past this deadline
    /// the resolver falls back to AI coordinates.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_lookup_timeout_ms() -> u64 {
    3_000
}

fn default_true() -> bool {
    true
}

impl Default for AccessibilityConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout_ms(),
            enabled: true,
        }
    }
}

fn resolve_config_path() -> WaypostResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("waypost").join("config.toml");
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in platform config dir");
            return Ok(candidate);
        }
    }

    Err(WaypostError::Config(
        "config.toml not found next to executable, in working directory, or in config dir".into(),
    ))
}

pub fn load_config() -> WaypostResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config: AppConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_defaults() {
        let d = DetectionConfig::default();
        assert_eq!(d.popup_byte_threshold, 12_288);
        assert_eq!(d.hash_strategy, "coarse");
        assert!(d.poll_interval_ms >= 1_000 && d.poll_interval_ms <= 5_000);
    }

    #[test]
    fn test_minimal_config_parses() {
        let toml_src = r#"
            [llm]
            active_provider = "local"

            [llm.providers.local]
            display_name = "Local"
            api_base = "http://localhost:8080/v1/chat/completions"
            model = "test-model"
        "#;
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.llm.active_provider, "local");
        assert_eq!(cfg.detection.hash_distance_threshold, 10);
        assert!(cfg.accessibility.enabled);
    }
}
