//! Generational handles for GPU resources
//!
//! The graph and compiled programs only ever hold these keys. Raw driver
//! ids stay inside the pools that own them, so a resource can be recreated
//! after context loss without touching the instructions that reference it.

use slotmap::new_key_type;

new_key_type! {
    /// Vertex or index storage owned by the [`BufferPool`](crate::buffer::BufferPool)
    pub struct BufferHandle;
    /// Texture owned by the [`BufferPool`](crate::buffer::BufferPool) texture path
    pub struct TextureHandle;
    /// Linked program owned by the [`ShaderCache`](crate::shader::ShaderCache)
    pub struct ProgramHandle;
    /// Offscreen target owned by the [`FramebufferManager`](crate::framebuffer::FramebufferManager)
    pub struct FramebufferHandle;
}

/// A ref-counted resource an instruction keeps alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResourceHandle {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

impl From<BufferHandle> for GpuResourceHandle {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

impl From<TextureHandle> for GpuResourceHandle {
    fn from(handle: TextureHandle) -> Self {
        Self::Texture(handle)
    }
}
