//! Core types for the Vellum renderer
//!
//! This crate holds what every renderer component shares: graph identities,
//! colors and rectangles, the error taxonomy, configuration and the
//! category logger.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{ConfigManager, VellumConfig};
pub use error::{
    CompileError, DriverError, ErrorContext, FrameError, GraphError, ResourceError, Result,
    VellumError,
};
pub use logging::{LogCategory, LogLevel};
pub use types::{Color, GroupId, IdAllocator, InstructionId, Rect, Viewport};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        config::VellumConfig,
        error::{Result, VellumError},
        logging::{LogCategory, LogLevel},
        types::{Color, GroupId, InstructionId, Rect},
    };
}

/// Framework version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the given configuration
pub fn init(config: &VellumConfig) -> Result<()> {
    config.validate()?;
    logging::init(&config.logging)?;
    tracing::info!("Vellum core v{} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_is_repeatable() {
        let config = VellumConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
