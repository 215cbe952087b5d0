// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Window, graphics, debug and cache settings. The `[graphics]` section is the
// settings object the pipeline-spec derivation and swapchain setup read from.
// Missing files or fields fall back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsSettings,
    pub debug: DebugConfig,
    pub cache: CacheConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Renderer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Face culling choice for generated pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    None,
    Front,
    Back,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

impl FrontFace {
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

/// Blend state applied to every blended colour attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    Opaque,
    Alpha,
    Additive,
}

/// Default texture filtering; selects one of the device's standard samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFilter {
    Nearest,
    Linear,
    Anisotropic,
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsSettings {
    pub vsync: bool,
    pub frames_in_flight: usize,
    /// Queues requested per family; clamped to what the hardware exposes
    pub queues_per_family: u32,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub blend: BlendMode,
    pub texture_filter: TextureFilter,
    pub depth_test: bool,
    pub depth_write: bool,
    pub wireframe: bool,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsSettings {
    fn default() -> Self {
        Self {
            vsync: true,
            frames_in_flight: 2,
            queues_per_family: 4,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            blend: BlendMode::Alpha,
            texture_filter: TextureFilter::Linear,
            depth_test: true,
            depth_write: true,
            wireframe: false,
            clear_color: [0.1, 0.1, 0.12, 1.0],
        }
    }
}

impl GraphicsSettings {
    /// Present mode for the swapchain, picked from what the surface supports
    pub fn choose_present_mode(&self, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        if self.vsync {
            return vk::PresentModeKHR::FIFO;
        }
        [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
            .into_iter()
            .find(|mode| available.contains(mode))
            .unwrap_or(vk::PresentModeKHR::FIFO) // FIFO is always supported
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
        }
    }
}

/// On-disk cache locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("assets/cache"),
        }
    }
}

impl CacheConfig {
    pub fn shader_dir(&self) -> PathBuf {
        self.root.join("shader").join("vulkan")
    }

    pub fn pipeline_dir(&self) -> PathBuf {
        self.root.join("pipeline")
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[graphics]\nvsync = false\ncull_mode = \"none\"\nblend = \"additive\"\n\
             texture_filter = \"anisotropic\"\n\n[cache]\nroot = \"tmp/cache\"\n",
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.graphics.vsync);
        assert_eq!(config.graphics.cull_mode, CullMode::None);
        assert_eq!(config.graphics.blend, BlendMode::Additive);
        assert_eq!(config.graphics.texture_filter, TextureFilter::Anisotropic);
        assert!(config.graphics.depth_test);
        assert_eq!(config.cache.shader_dir(), PathBuf::from("tmp/cache/shader/vulkan"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[graphics\nvsync = ").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn present_mode_follows_vsync() {
        let mut settings = GraphicsSettings::default();
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(settings.choose_present_mode(&modes), vk::PresentModeKHR::FIFO);

        settings.vsync = false;
        assert_eq!(settings.choose_present_mode(&modes), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            settings.choose_present_mode(&[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }
}
