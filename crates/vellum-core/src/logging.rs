//! Category logging for the renderer
//!
//! Messages are tagged with a [`LogCategory`], filtered by per-category
//! levels from [`LoggingConfig`] and optionally rate limited so per-frame
//! failures don't flood the output. Everything is emitted as `tracing`
//! events with a `category` field.

use crate::config::LoggingConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Log levels supported by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Log categories, one per renderer component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    Core,
    Graph,
    Compiler,
    Buffers,
    Shaders,
    Framebuffers,
    Executor,
    Driver,
}

impl LogCategory {
    pub const ALL: [LogCategory; 8] = [
        LogCategory::Core,
        LogCategory::Graph,
        LogCategory::Compiler,
        LogCategory::Buffers,
        LogCategory::Shaders,
        LogCategory::Framebuffers,
        LogCategory::Executor,
        LogCategory::Driver,
    ];

    /// Convert LogCategory to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Core => "core",
            LogCategory::Graph => "graph",
            LogCategory::Compiler => "compiler",
            LogCategory::Buffers => "buffers",
            LogCategory::Shaders => "shaders",
            LogCategory::Framebuffers => "framebuffers",
            LogCategory::Executor => "executor",
            LogCategory::Driver => "driver",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl LogLevel {
    /// Parse a level name, case-insensitively
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_reset: Instant,
    count: u32,
    max_count: u32,
    duration: Duration,
}

impl RateLimitState {
    fn new(max_count: u32, duration: Duration) -> Self {
        Self {
            last_reset: Instant::now(),
            count: 0,
            max_count,
            duration,
        }
    }

    fn should_allow(&mut self) -> bool {
        let now = Instant::now();

        if now.duration_since(self.last_reset) >= self.duration {
            self.last_reset = now;
            self.count = 0;
        }

        if self.count < self.max_count {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Logger configuration and state
#[derive(Debug)]
pub struct LoggerConfig {
    rate_limiters: Mutex<HashMap<String, RateLimitState>>,
    config: LoggingConfig,
}

impl LoggerConfig {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            rate_limiters: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Check if a log message should be allowed based on rate limiting
    pub fn should_allow_log(&self, category: &str) -> bool {
        let mut limiters = self.rate_limiters.lock();

        let limiter = limiters.entry(category.to_string()).or_insert_with(|| {
            RateLimitState::new(
                self.config.max_rate_limit_count,
                Duration::from_secs(self.config.rate_limit_seconds),
            )
        });

        limiter.should_allow()
    }

    /// Check if a log level is enabled for a category
    pub fn is_level_enabled(&self, category: &str, level: LogLevel) -> bool {
        if let Some(category_level) = self
            .config
            .category_levels
            .get(category)
            .and_then(|s| LogLevel::parse(s))
        {
            return level >= category_level;
        }

        level >= LogLevel::Info
    }

    /// Build the subscriber filter for the renderer crates.
    ///
    /// Per-category filtering happens in [`log_internal`], so the filter only
    /// needs to pass the most verbose configured level.
    pub fn env_filter(&self) -> EnvFilter {
        let verbose = self
            .config
            .category_levels
            .values()
            .filter_map(|level| LogLevel::parse(level))
            .min()
            .unwrap_or(LogLevel::Info)
            .min(LogLevel::Info);
        EnvFilter::new(format!(
            "info,vellum_core={level},vellum_renderer={level}",
            level = verbose
        ))
    }

    pub fn update_config(&mut self, config: LoggingConfig) {
        self.config = config;
        self.rate_limiters.lock().clear();
    }
}

static LOGGER: OnceLock<RwLock<LoggerConfig>> = OnceLock::new();

/// Initialize the logging system.
///
/// Installs a `tracing-subscriber` fmt subscriber unless the host already
/// set a global one. `RUST_LOG` takes precedence over the category levels.
pub fn init(config: &LoggingConfig) -> crate::Result<()> {
    let logger_config = LoggerConfig::new(config.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| logger_config.env_filter());

    if LOGGER.set(RwLock::new(logger_config)).is_err() {
        update_config(config.clone());
    }

    // A subscriber installed by the host application wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    Ok(())
}

/// Internal logging function used by the `vellum_*` macros
pub fn log_internal(level: LogLevel, category: &str, message: &str, rate_limited: bool) {
    if let Some(logger) = LOGGER.get() {
        let logger_guard = logger.read();

        if !logger_guard.is_level_enabled(category, level) {
            return;
        }

        if rate_limited && !logger_guard.should_allow_log(category) {
            return;
        }
    }

    match level {
        LogLevel::Trace => tracing::trace!(category, "{}", message),
        LogLevel::Debug => tracing::debug!(category, "{}", message),
        LogLevel::Info => tracing::info!(category, "{}", message),
        LogLevel::Warn => tracing::warn!(category, "{}", message),
        LogLevel::Error => tracing::error!(category, "{}", message),
    }
}

/// Update logger configuration
pub fn update_config(config: LoggingConfig) {
    if let Some(logger) = LOGGER.get() {
        logger.write().update_config(config);
    }
}

// Core logging macros
#[macro_export]
macro_rules! vellum_trace {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Trace, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! vellum_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Debug, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! vellum_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Info, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! vellum_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category.as_str(), &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! vellum_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category.as_str(), &format!($($arg)*), false)
    };
}

// Rate-limited logging macros
#[macro_export]
macro_rules! vellum_warn_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category.as_str(), &format!($($arg)*), true)
    };
}

#[macro_export]
macro_rules! vellum_error_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category.as_str(), &format!($($arg)*), true)
    };
}

pub use vellum_debug;
pub use vellum_error;
pub use vellum_error_rate_limited;
pub use vellum_info;
pub use vellum_trace;
pub use vellum_warn;
pub use vellum_warn_rate_limited;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("invalid"), None);
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn test_rate_limiting() {
        let mut state = RateLimitState::new(2, Duration::from_millis(100));

        assert!(state.should_allow());
        assert!(state.should_allow());
        assert!(!state.should_allow());

        std::thread::sleep(Duration::from_millis(150));
        assert!(state.should_allow());
    }

    #[test]
    fn test_logger_config_levels() {
        let mut config = LoggingConfig::default();
        config
            .category_levels
            .insert("compiler".to_string(), "debug".to_string());
        config.max_rate_limit_count = 1;

        let logger_config = LoggerConfig::new(config);

        assert!(logger_config.is_level_enabled("compiler", LogLevel::Debug));
        assert!(!logger_config.is_level_enabled("compiler", LogLevel::Trace));
        assert!(!logger_config.is_level_enabled("executor", LogLevel::Info));
        assert!(logger_config.is_level_enabled("unknown", LogLevel::Info));

        assert!(logger_config.should_allow_log("compiler"));
        assert!(!logger_config.should_allow_log("compiler"));
    }

    #[test]
    fn test_macros_accept_categories() {
        vellum_debug!(LogCategory::Graph, "group {} dirty", 3);
        vellum_warn_rate_limited!(LogCategory::Executor, "missed deadline");
    }
}
