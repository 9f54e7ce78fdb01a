//! Configuration system for the Vellum renderer

use crate::error::{Result, VellumError};
use crate::types::Color;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Renderer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VellumConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Vertex/index buffer pool settings
    pub buffers: BufferPoolConfig,
    /// Offscreen target pooling
    pub framebuffers: FramebufferConfig,
    /// Per-frame settings
    pub frame: FrameConfig,
    /// Program cache settings
    pub shaders: ShaderConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Category-specific log levels (category name -> level string)
    pub category_levels: HashMap<String, String>,
    /// Rate limiting duration in seconds
    pub rate_limit_seconds: u64,
    /// Maximum number of messages before rate limiting kicks in
    pub max_rate_limit_count: u32,
}

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Size in bytes of one hardware page; must be a power of two
    pub page_size: u64,
    /// Smallest size class in bytes; must be a power of two
    pub min_block_size: u64,
    /// Upper bound on resident buffer and texture storage in bytes
    pub memory_budget: u64,
    /// Keep CPU copies of uploaded data for diffing and context restore
    pub shadow_copies: bool,
}

/// Framebuffer manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramebufferConfig {
    /// Released framebuffers kept for reuse; excess ones are destroyed
    pub max_pooled: usize,
}

/// Frame configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Compile time budget per frame in milliseconds
    pub budget_ms: f64,
    /// Color the screen target is cleared to before each frame
    pub clear_color: Color,
}

/// Shader cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Remember failed source pairs instead of recompiling them on every request
    pub memoize_failures: bool,
    /// Replacement vertex source for the default program
    pub default_vertex_source: Option<String>,
    /// Replacement fragment source for the default program
    pub default_fragment_source: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut category_levels = HashMap::new();

        category_levels.insert("core".to_string(), "info".to_string());
        category_levels.insert("graph".to_string(), "info".to_string());
        category_levels.insert("compiler".to_string(), "info".to_string());
        category_levels.insert("buffers".to_string(), "info".to_string());
        category_levels.insert("shaders".to_string(), "info".to_string());
        category_levels.insert("framebuffers".to_string(), "info".to_string());
        category_levels.insert("executor".to_string(), "warn".to_string()); // Per-op noise
        category_levels.insert("driver".to_string(), "warn".to_string());

        Self {
            category_levels,
            rate_limit_seconds: 5,
            max_rate_limit_count: 10,
        }
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            page_size: 1 << 20,
            min_block_size: 256,
            memory_budget: 256 << 20,
            shadow_copies: true,
        }
    }
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self { max_pooled: 8 }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            budget_ms: 16.0,
            clear_color: Color::BLACK,
        }
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            memoize_failures: true,
            default_vertex_source: None,
            default_fragment_source: None,
        }
    }
}

impl VellumConfig {
    /// Parse a configuration from RON text
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let config: Self = ron::from_str(text)
            .map_err(|e| VellumError::configuration(format!("invalid RON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| VellumError::configuration(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, choosing the format by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("ron") => Self::from_ron_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(VellumError::configuration(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Serialize to pretty RON
    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| VellumError::configuration(e.to_string()))
    }

    /// Check the constraints serde can't express
    pub fn validate(&self) -> Result<()> {
        let buffers = &self.buffers;
        if !buffers.page_size.is_power_of_two() {
            return Err(VellumError::configuration(format!(
                "buffers.page_size must be a power of two, got {}",
                buffers.page_size
            )));
        }
        if !buffers.min_block_size.is_power_of_two() || buffers.min_block_size > buffers.page_size
        {
            return Err(VellumError::configuration(format!(
                "buffers.min_block_size must be a power of two no larger than the page, got {}",
                buffers.min_block_size
            )));
        }
        if self.frame.budget_ms.is_nan() || self.frame.budget_ms <= 0.0 {
            return Err(VellumError::configuration("frame.budget_ms must be positive"));
        }
        Ok(())
    }
}

/// Shared configuration handle
pub struct ConfigManager {
    config: Arc<RwLock<VellumConfig>>,
}

impl ConfigManager {
    /// Create a new configuration manager with default settings
    pub fn new() -> Self {
        Self::with_config(VellumConfig::default())
    }

    /// Create a configuration manager with custom config
    pub fn with_config(config: VellumConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Get a copy of the current configuration
    pub fn get_config(&self) -> VellumConfig {
        self.config.read().clone()
    }

    /// Update the configuration
    pub fn update_config<F>(&self, updater: F)
    where
        F: FnOnce(&mut VellumConfig),
    {
        let mut config = self.config.write();
        updater(&mut config);
    }

    /// Get the current logging configuration
    pub fn get_logging_config(&self) -> LoggingConfig {
        self.config.read().logging.clone()
    }

    /// Set log level for a specific category
    pub fn set_category_level(&self, category: &str, level: &str) {
        self.update_config(|config| {
            config
                .logging
                .category_levels
                .insert(category.to_string(), level.to_string());
        });
    }

    /// Get log level for a specific category
    pub fn get_category_level(&self, category: &str) -> Option<String> {
        self.config.read().logging.category_levels.get(category).cloned()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

static CONFIG_MANAGER: OnceLock<ConfigManager> = OnceLock::new();

/// Initialize the global configuration manager
pub fn init_config() -> &'static ConfigManager {
    CONFIG_MANAGER.get_or_init(ConfigManager::new)
}

/// Initialize the global configuration manager with custom config
pub fn init_config_with(config: VellumConfig) -> &'static ConfigManager {
    CONFIG_MANAGER.get_or_init(|| ConfigManager::with_config(config))
}

/// Get the global configuration manager
pub fn get_config_manager() -> Option<&'static ConfigManager> {
    CONFIG_MANAGER.get()
}
