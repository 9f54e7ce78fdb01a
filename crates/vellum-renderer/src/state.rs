//! Shadow of the driver's bound state
//!
//! Each field is `None` while unknown (at start-up and after context loss),
//! so the first call after a reset always reaches the driver.

use crate::driver::{
    BlendMode, RawBuffer, RawFramebuffer, RawProgram, RawTexture, UniformLocation, UniformValue,
};
use std::collections::HashMap;
use vellum_core::Viewport;

/// Texture units tracked by the cache
pub const MAX_TEXTURE_UNITS: usize = 8;

/// Last-known value of every piece of driver state the renderer sets
#[derive(Debug, Clone, Default)]
pub struct GpuStateCache {
    target: Option<Option<RawFramebuffer>>,
    viewport: Option<Viewport>,
    program: Option<RawProgram>,
    textures: [Option<RawTexture>; MAX_TEXTURE_UNITS],
    blend: Option<BlendMode>,
    vertex_buffer: Option<(RawBuffer, u64)>,
    index_buffer: Option<(RawBuffer, u64)>,
    uniforms: HashMap<(RawProgram, UniformLocation), UniformValue>,
    clip_depth: Option<u32>,
}

fn replace_if_changed<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    if slot.as_ref() == Some(&value) {
        false
    } else {
        *slot = Some(value);
        true
    }
}

impl GpuStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a target binding; `true` when the driver must be told
    pub fn update_target(&mut self, target: Option<RawFramebuffer>) -> bool {
        replace_if_changed(&mut self.target, target)
    }

    pub fn update_viewport(&mut self, viewport: Viewport) -> bool {
        replace_if_changed(&mut self.viewport, viewport)
    }

    pub fn update_program(&mut self, program: RawProgram) -> bool {
        replace_if_changed(&mut self.program, program)
    }

    /// Units past [`MAX_TEXTURE_UNITS`] are never cached
    pub fn update_texture(&mut self, unit: u32, texture: RawTexture) -> bool {
        match self.textures.get_mut(unit as usize) {
            Some(slot) => replace_if_changed(slot, texture),
            None => true,
        }
    }

    pub fn update_blend(&mut self, mode: BlendMode) -> bool {
        replace_if_changed(&mut self.blend, mode)
    }

    pub fn update_vertex_buffer(&mut self, buffer: RawBuffer, offset: u64) -> bool {
        replace_if_changed(&mut self.vertex_buffer, (buffer, offset))
    }

    pub fn update_index_buffer(&mut self, buffer: RawBuffer, offset: u64) -> bool {
        replace_if_changed(&mut self.index_buffer, (buffer, offset))
    }

    /// Uniform values persist per program, as in the driver
    pub fn update_uniform(
        &mut self,
        program: RawProgram,
        location: UniformLocation,
        value: UniformValue,
    ) -> bool {
        match self.uniforms.get(&(program, location)) {
            Some(current) if *current == value => false,
            _ => {
                self.uniforms.insert((program, location), value);
                true
            }
        }
    }

    pub fn update_clip_depth(&mut self, depth: u32) -> bool {
        replace_if_changed(&mut self.clip_depth, depth)
    }

    /// Bound target, `None` while unknown
    pub fn target(&self) -> Option<Option<RawFramebuffer>> {
        self.target
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn program(&self) -> Option<RawProgram> {
        self.program
    }

    pub fn clip_depth(&self) -> Option<u32> {
        self.clip_depth
    }

    pub fn texture(&self, unit: u32) -> Option<RawTexture> {
        self.textures.get(unit as usize).copied().flatten()
    }

    pub fn forget_buffer(&mut self, buffer: RawBuffer) {
        if self.vertex_buffer.is_some_and(|(bound, _)| bound == buffer) {
            self.vertex_buffer = None;
        }
        if self.index_buffer.is_some_and(|(bound, _)| bound == buffer) {
            self.index_buffer = None;
        }
    }

    pub fn forget_texture(&mut self, texture: RawTexture) {
        for slot in self.textures.iter_mut() {
            if *slot == Some(texture) {
                *slot = None;
            }
        }
    }

    pub fn forget_program(&mut self, program: RawProgram) {
        if self.program == Some(program) {
            self.program = None;
        }
        self.uniforms.retain(|(owner, _), _| *owner != program);
    }

    pub fn forget_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        if self.target == Some(Some(framebuffer)) {
            self.target = None;
        }
    }
}
