//! Vellum - retained-mode canvas compiler and GPU resource manager
//!
//! Vellum keeps a scene as a graph of nested instruction groups, compiles
//! only the groups that changed into GPU op lists and replays them through
//! a state cache that drops redundant driver calls.
//!
//! ```rust
//! use vellum::prelude::*;
//!
//! fn main() -> vellum::Result<()> {
//!     let mut canvas = vellum::canvas(Box::new(HeadlessDriver::new(320, 240)), VellumConfig::default())?;
//!     let root = canvas.root();
//!     canvas.add_instruction(root, Instruction::color(Color::RED))?;
//!     canvas.add_instruction(root, Instruction::rectangle(Rect::new(0.0, 0.0, 10.0, 10.0)))?;
//!     let report = canvas.render_frame()?;
//!     assert!(report.presented);
//!     Ok(())
//! }
//! ```

pub use vellum_core;
pub use vellum_renderer;

pub use vellum_core::{Result, VellumConfig, VellumError};
pub use vellum_renderer::driver::GpuDriver;
pub use vellum_renderer::CanvasRenderer;

/// Unified prelude module that exports all commonly used types
pub mod prelude {
    pub use vellum_core::prelude::*;
    pub use vellum_renderer::prelude::*;
}

/// Initialize logging from `config`. Safe to call more than once.
pub fn init(config: &VellumConfig) -> Result<()> {
    vellum_core::init(config)
}

/// Initialize logging and create a canvas on `driver`
pub fn canvas(driver: Box<dyn GpuDriver>, config: VellumConfig) -> Result<CanvasRenderer> {
    init(&config)?;
    CanvasRenderer::new(driver, config)
}

/// Load a RON or JSON configuration file and create a canvas with it
pub fn canvas_from_file(
    driver: Box<dyn GpuDriver>,
    path: impl AsRef<std::path::Path>,
) -> Result<CanvasRenderer> {
    let config = VellumConfig::load(path)?;
    canvas(driver, config)
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
