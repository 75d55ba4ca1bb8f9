// =============================================================================
// CONFIGURATION - Load settings from anvil.toml
// =============================================================================
//
// Device bring-up knobs for the probe binary and for applications that want
// to drive DeviceCreateInfo from a file instead of code. Missing sections
// and fields fall back to sensible defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AnvilConfig {
    pub device: DeviceConfig,
    pub queues: QueueConfig,
    pub debug: DebugConfig,
}

/// Logical device settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    pub validation_layers: bool,
    /// Default MT-safety inherited by every wrapper created from the device.
    pub mt_safe: bool,
    pub enable_shader_module_cache: bool,
    pub physical_device_index: usize,
    /// Pipeline cache blob used to seed the device cache, rewritten on exit.
    pub pipeline_cache_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "anvil".to_string(),
            validation_layers: cfg!(debug_assertions),
            mt_safe: true,
            enable_shader_module_cache: true,
            physical_device_index: 0,
            pipeline_cache_path: None,
        }
    }
}

/// Queue counts requested per family bucket
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub universal: u32,
    pub compute: u32,
    pub transfer: u32,
    pub protected_compute: bool,
    pub global_priority: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            universal: 1,
            compute: 1,
            transfer: 1,
            protected_compute: false,
            global_priority: "medium".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub check_leaks_on_exit: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            check_leaks_on_exit: true,
        }
    }
}

impl AnvilConfig {
    /// Load configuration from anvil.toml, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("anvil.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load anvil.toml: {:#}. Using defaults.", e);
            AnvilConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(AnvilConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AnvilConfig = toml::from_str(content)?;
        // Reject unknown priorities up front rather than at device creation.
        config.global_priority()?;
        Ok(config)
    }

    /// Get the requested global queue priority as Vulkan enum
    pub fn global_priority(&self) -> Result<vk::QueueGlobalPriorityEXT> {
        match self.queues.global_priority.to_lowercase().as_str() {
            "low" => Ok(vk::QueueGlobalPriorityEXT::LOW),
            "medium" => Ok(vk::QueueGlobalPriorityEXT::MEDIUM),
            "high" => Ok(vk::QueueGlobalPriorityEXT::HIGH),
            "realtime" => Ok(vk::QueueGlobalPriorityEXT::REALTIME),
            other => Err(crate::AnvilError::InvalidConfiguration(format!(
                "unknown global queue priority '{}'",
                other
            ))
            .into()),
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}
