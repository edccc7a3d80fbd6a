//! Configuration for the compositing scheduler
//!
//! Loads configuration from TOML file at `~/.config/hwcomp/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::sync::SyncPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    pub scratch: ScratchConfig,
    pub compositor: CompositorConfig,
    pub displays: Vec<DisplayConfig>,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::with_default_display());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let mut config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;
        if config.displays.is_empty() {
            warn!("No displays configured, adding the default panel");
            config.displays.push(DisplayConfig::default_panel());
        }

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Defaults plus one built-in panel description
    pub fn with_default_display() -> Self {
        Self {
            displays: vec![DisplayConfig::default_panel()],
            ..Default::default()
        }
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("hwcomp");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::with_default_display())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Assignment engine knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Disable direct plane assignment entirely
    pub force_composition: bool,
    /// Layers with a smaller destination edge always go to composition
    pub min_plane_extent: u32,
    /// Keep composited layers in one contiguous z-range
    pub contiguous_composition: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            force_composition: false,
            min_plane_extent: 16,
            contiguous_composition: true,
        }
    }
}

/// Lock and fence timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub lock_timeout_ms: u64,
    pub fence_wait_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 3000,
            fence_wait_timeout_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            fence_timeout: Duration::from_millis(self.fence_wait_timeout_ms),
        }
    }
}

/// Scratch buffer pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    /// Pool size per display; unlocked entries are evicted beyond this
    pub max_entries: usize,
    /// Allocation budget in bytes per display, 0 for unlimited
    pub budget_bytes: u64,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            max_entries: 8,
            budget_bytes: 0,
        }
    }
}

/// Composition fallback chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Name of the backend tried first
    pub preferred: Option<String>,
    /// Walk the remaining backends when the preferred one rejects a frame
    pub cross_backend_fallback: bool,
    /// Backends in priority order
    pub backends: Vec<BackendConfig>,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            preferred: Some("blit".to_string()),
            cross_backend_fallback: true,
            backends: vec![
                BackendConfig {
                    name: "blit".to_string(),
                    max_layers: 4,
                    supports_transform: true,
                    supports_protected: true,
                    min_scale: 0.25,
                    max_scale: 4.0,
                },
                BackendConfig {
                    name: "shader".to_string(),
                    max_layers: 32,
                    supports_transform: true,
                    supports_protected: false,
                    min_scale: 0.0625,
                    max_scale: 16.0,
                },
            ],
        }
    }
}

/// One compositor backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub max_layers: usize,
    #[serde(default)]
    pub supports_transform: bool,
    #[serde(default)]
    pub supports_protected: bool,
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,
    #[serde(default = "default_max_scale")]
    pub max_scale: f32,
}

fn default_min_scale() -> f32 {
    1.0
}

fn default_max_scale() -> f32 {
    1.0
}

/// One physical display and its plane table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Planes in hardware order
    pub planes: Vec<PlaneConfig>,
    pub max_sequential: usize,
    pub min_scale: f32,
    pub max_scale: f32,
    /// Rotation source-height limit when the plane is fed from scratch
    pub max_rotate_height_scratch: u32,
    /// Rotation source-height limit when fed straight from the client buffer
    pub max_rotate_height_direct: u32,
    pub bandwidth_negotiation: bool,
    /// Line source for vsync timestamps (FIFO or character device)
    pub vsync_path: Option<PathBuf>,
    /// Line source for connect/disconnect events
    pub hotplug_path: Option<PathBuf>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: "panel".to_string(),
            width: 1920,
            height: 1080,
            planes: Vec::new(),
            max_sequential: 0,
            min_scale: 0.25,
            max_scale: 4.0,
            max_rotate_height_scratch: 2048,
            max_rotate_height_direct: 1088,
            bandwidth_negotiation: false,
            vsync_path: None,
            hotplug_path: None,
        }
    }
}

impl DisplayConfig {
    /// Four-plane panel: video, two graphics, cursor
    pub fn default_panel() -> Self {
        Self {
            planes: vec![
                PlaneConfig::with_caps(&["scale", "rotate90", "flip", "tiled", "yuv", "sequential"]),
                PlaneConfig::with_caps(&["scale", "yuv", "sequential"]),
                PlaneConfig::with_caps(&["flip"]),
                PlaneConfig {
                    caps: vec!["cursor".to_string()],
                    max_width: Some(256),
                    max_height: Some(256),
                },
            ],
            max_sequential: 2,
            ..Default::default()
        }
    }
}

/// One hardware plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaneConfig {
    /// Capability names: scale, rotate90, flip, tiled, compressed, yuv,
    /// sequential, cursor
    #[serde(default)]
    pub caps: Vec<String>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl PlaneConfig {
    pub fn with_caps(caps: &[&str]) -> Self {
        Self {
            caps: caps.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = Config::with_default_display();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.displays.len(), 1);
        assert_eq!(parsed.displays[0].planes.len(), 4);
        assert_eq!(parsed.scheduler.min_plane_extent, 16);
        assert_eq!(parsed.compositor.backends.len(), 2);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let text = r#"
            [scheduler]
            force_composition = true

            [[displays]]
            name = "hdmi"
            width = 1280
            height = 720

            [[displays.planes]]
            caps = ["scale"]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.scheduler.force_composition);
        assert!(config.scheduler.contiguous_composition);
        assert_eq!(config.sync.lock_timeout_ms, 3000);
        assert_eq!(config.displays[0].name, "hdmi");
        assert_eq!(config.displays[0].planes[0].caps, vec!["scale"]);
    }

    #[test]
    fn test_sync_policy() {
        let policy = SyncConfig::default().policy();
        assert_eq!(policy.lock_timeout, Duration::from_secs(3));
        assert_eq!(policy.fence_timeout, Duration::from_secs(1));
    }
}
