// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// Graphics settings are turned into the settings structs the swapchain,
// buffer allocator and renderer take.

use crate::backend::buffer::AllocatorSettings;
use crate::backend::swapchain::SwapchainSettings;
use crate::error::{CoreError, CoreResult};
use crate::renderer::RendererSettings;
use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkframe".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub max_frames_in_flight: usize,
    pub prefer_mailbox: bool,
    pub min_image_count: u32,
    pub preferred_surface_format: String,
    pub preferred_color_space: String,
    pub enable_pool_allocator: bool,
    pub use_depth: bool,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            prefer_mailbox: true,
            min_image_count: 2,
            preferred_surface_format: "b8g8r8a8_srgb".to_string(),
            preferred_color_space: "srgb_nonlinear".to_string(),
            enable_pool_allocator: false,
            use_depth: true,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    /// env_logger filter string; RUST_LOG is used when unset
    pub log_filter: Option<String>,
    pub show_fps: bool,
    /// Frames rendered before a headless run exits
    pub headless_frames: u32,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vkframe.log".to_string(),
            log_filter: None,
            show_fps: true,
            headless_frames: 120,
        }
    }
}

/// Control key bindings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
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

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.graphics.max_frames_in_flight == 0 {
            return Err(CoreError::Initialization(
                "graphics.max_frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.graphics.min_image_count == 0 {
            return Err(CoreError::Initialization(
                "graphics.min_image_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Preferred surface format as Vulkan enums
    pub fn get_surface_format(&self) -> vk::SurfaceFormatKHR {
        let format = match self.graphics.preferred_surface_format.to_lowercase().as_str() {
            "b8g8r8a8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "b8g8r8a8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "r8g8b8a8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "r8g8b8a8_unorm" => vk::Format::R8G8B8A8_UNORM,
            other => {
                log::warn!("Unknown surface format '{}', defaulting to B8G8R8A8_SRGB", other);
                vk::Format::B8G8R8A8_SRGB
            }
        };
        let color_space = match self.graphics.preferred_color_space.to_lowercase().as_str() {
            "srgb_nonlinear" => vk::ColorSpaceKHR::SRGB_NONLINEAR,
            "extended_srgb_linear" => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            other => {
                log::warn!("Unknown color space '{}', defaulting to SRGB_NONLINEAR", other);
                vk::ColorSpaceKHR::SRGB_NONLINEAR
            }
        };
        vk::SurfaceFormatKHR { format, color_space }
    }

    pub fn swapchain_settings(&self) -> SwapchainSettings {
        SwapchainSettings {
            prefer_mailbox: self.graphics.prefer_mailbox,
            min_image_count: self.graphics.min_image_count,
            preferred_format: self.get_surface_format(),
        }
    }

    pub fn allocator_settings(&self) -> AllocatorSettings {
        AllocatorSettings {
            enable_pool_allocator: self.graphics.enable_pool_allocator,
        }
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        RendererSettings {
            max_frames_in_flight: self.graphics.max_frames_in_flight,
            swapchain: self.swapchain_settings(),
            allocator: self.allocator_settings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert!(config.graphics.prefer_mailbox);
        assert_eq!(config.graphics.min_image_count, 2);
        assert!(!config.graphics.enable_pool_allocator);
        let format = config.get_surface_format();
        assert_eq!(format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(format.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            max_frames_in_flight = 3
            prefer_mailbox = false
            preferred_surface_format = "r8g8b8a8_unorm"

            [debug]
            headless_frames = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.min_image_count, 2);
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.debug.headless_frames, 10);

        let settings = config.renderer_settings();
        assert_eq!(settings.max_frames_in_flight, 3);
        assert!(!settings.swapchain.prefer_mailbox);
        assert_eq!(settings.swapchain.preferred_format.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let err = Config::from_toml_str("[graphics]\nmax_frames_in_flight = 0\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Initialization(_))
        ));
        assert!(Config::from_toml_str("[graphics]\nmin_image_count = 0\n").is_err());
    }

    #[test]
    fn test_unknown_format_falls_back() {
        let mut config = Config::default();
        config.graphics.preferred_surface_format = "rgb565".to_string();
        assert_eq!(config.get_surface_format().format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
    }
}
