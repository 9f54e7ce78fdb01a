//! Vellum Renderer
//!
//! Retained-mode canvas rendering: an instruction graph of nested groups is
//! compiled into GPU op lists and replayed through a state-diffing executor.
//!
//! ## Features
//! - Incremental compilation that reuses the segments of unchanged groups
//! - Pooled vertex and index storage with chunked change detection
//! - Content-addressed shader cache with memoized failures
//! - Offscreen targets recycled through a size-keyed framebuffer pool
//! - A driver-side state cache that drops redundant binds and uniforms
//! - Deterministic recording driver for tests, wgpu driver for hardware

pub mod buffer;
pub mod canvas;
pub mod compiler;
pub mod context;
pub mod driver;
pub mod executor;
pub mod framebuffer;
pub mod graph;
pub mod handles;
pub mod shader;
pub mod state;
pub mod vertex;

// Re-export commonly used types
pub use buffer::{BufferPool, BufferPoolStats, CompactionReport};
pub use canvas::{CanvasRenderer, CanvasStats, FrameReport};
pub use compiler::{CompileOutcome, CompileStats, CompiledOp, CompiledProgram, Compiler};
pub use context::{ContextStats, GpuContext};
pub use driver::{GpuDriver, HeadlessDriver, HeadlessProbe};
#[cfg(feature = "wgpu")]
pub use driver::WgpuDriver;
pub use executor::{FrameExecutor, FrameStats};
pub use framebuffer::{FramebufferManager, FramebufferStats};
pub use graph::{Instruction, InstructionGraph, Mutation, MutationBatch, Primitive, StateChange};
pub use handles::{BufferHandle, FramebufferHandle, ProgramHandle, TextureHandle};
pub use shader::{ShaderCache, ShaderCacheStats};
pub use vertex::{Geometry, Vertex};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::canvas::{CanvasRenderer, FrameReport};
    pub use crate::driver::{BlendMode, GpuDriver, HeadlessDriver, TextureFormat, Topology};
    pub use crate::graph::{
        Instruction, Mutation, MutationBatch, Primitive, ShaderSource, StateChange, TextureRef,
    };
    pub use crate::handles::{BufferHandle, TextureHandle};
}
