//! The single path from the renderer to the driver
//!
//! [`GpuContext`] owns the driver privately. State calls are diffed against
//! the [`GpuStateCache`] and dropped when they wouldn't change anything;
//! resource and draw calls always pass through.

use crate::driver::{
    BlendMode, BufferKind, DriverResult, GpuDriver, RawBuffer, RawFramebuffer, RawProgram,
    RawTexture, StencilOp, TextureFormat, TextureRegion, Topology, UniformLocation, UniformValue,
};
use crate::state::GpuStateCache;
use glam::Vec2;
use tracing::debug;
use vellum_core::{Color, DriverError, Viewport};

/// Driver call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// State calls forwarded to the driver
    pub state_calls_issued: u64,
    /// State calls dropped because the driver already had that state
    pub state_calls_elided: u64,
    pub draw_calls: u64,
    pub resource_calls: u64,
}

impl ContextStats {
    pub fn since(&self, earlier: &ContextStats) -> ContextStats {
        ContextStats {
            state_calls_issued: self.state_calls_issued - earlier.state_calls_issued,
            state_calls_elided: self.state_calls_elided - earlier.state_calls_elided,
            draw_calls: self.draw_calls - earlier.draw_calls,
            resource_calls: self.resource_calls - earlier.resource_calls,
        }
    }
}

/// GPU context wrapper with state diffing
pub struct GpuContext {
    driver: Box<dyn GpuDriver>,
    state: GpuStateCache,
    stats: ContextStats,
}

impl GpuContext {
    pub fn new(driver: Box<dyn GpuDriver>) -> Self {
        debug!("GPU context created on {} driver", driver.name());
        Self {
            driver,
            state: GpuStateCache::new(),
            stats: ContextStats::default(),
        }
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn screen_size(&self) -> (u32, u32) {
        self.driver.screen_size()
    }

    pub fn screen_viewport(&self) -> Viewport {
        let (width, height) = self.driver.screen_size();
        Viewport::full(width, height)
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    pub fn state(&self) -> &GpuStateCache {
        &self.state
    }

    /// Forget all cached state; the next call of each kind reaches the driver
    pub fn invalidate(&mut self) {
        self.state.reset();
    }

    fn issue(&mut self, changed: bool) -> bool {
        if changed {
            self.stats.state_calls_issued += 1;
        } else {
            self.stats.state_calls_elided += 1;
        }
        changed
    }

    // Resources

    pub fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DriverResult<RawBuffer> {
        self.stats.resource_calls += 1;
        self.driver.create_buffer(kind, size)
    }

    pub fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) -> DriverResult<()> {
        self.stats.resource_calls += 1;
        self.driver.write_buffer(buffer, offset, data)
    }

    pub fn destroy_buffer(&mut self, buffer: RawBuffer) {
        self.stats.resource_calls += 1;
        self.state.forget_buffer(buffer);
        self.driver.destroy_buffer(buffer);
    }

    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RawTexture> {
        self.stats.resource_calls += 1;
        self.driver.create_texture(width, height, format)
    }

    pub fn write_texture(
        &mut self,
        texture: RawTexture,
        region: TextureRegion,
        data: &[u8],
    ) -> DriverResult<()> {
        self.stats.resource_calls += 1;
        self.driver.write_texture(texture, region, data)
    }

    pub fn destroy_texture(&mut self, texture: RawTexture) {
        self.stats.resource_calls += 1;
        self.state.forget_texture(texture);
        self.driver.destroy_texture(texture);
    }

    pub fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        stencil: bool,
    ) -> DriverResult<(RawFramebuffer, RawTexture)> {
        self.stats.resource_calls += 1;
        self.driver.create_framebuffer(width, height, stencil)
    }

    /// Destroys the framebuffer and its color texture
    pub fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer, texture: RawTexture) {
        self.stats.resource_calls += 1;
        self.state.forget_framebuffer(framebuffer);
        self.state.forget_texture(texture);
        self.driver.destroy_framebuffer(framebuffer);
    }

    pub fn compile_program(&mut self, vertex: &str, fragment: &str) -> DriverResult<RawProgram> {
        self.stats.resource_calls += 1;
        self.driver.compile_program(vertex, fragment)
    }

    pub fn uniform_location(&mut self, program: RawProgram, name: &str) -> Option<UniformLocation> {
        self.driver.uniform_location(program, name)
    }

    pub fn destroy_program(&mut self, program: RawProgram) {
        self.stats.resource_calls += 1;
        self.state.forget_program(program);
        self.driver.destroy_program(program);
    }

    // State

    /// Bind an offscreen target, or the screen for `None`
    pub fn bind_target(&mut self, target: Option<RawFramebuffer>) {
        let changed = self.state.update_target(target);
        if self.issue(changed) {
            self.driver.bind_framebuffer(target);
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        let changed = self.state.update_viewport(viewport);
        if self.issue(changed) {
            self.driver.set_viewport(viewport);
        }
    }

    pub fn use_program(&mut self, program: RawProgram) {
        let changed = self.state.update_program(program);
        if self.issue(changed) {
            self.driver.use_program(program);
        }
    }

    pub fn set_uniform(&mut self, program: RawProgram, location: UniformLocation, value: UniformValue) {
        let changed = self.state.update_uniform(program, location, value);
        if self.issue(changed) {
            self.driver.set_uniform(program, location, &value);
        }
    }

    pub fn bind_texture(&mut self, unit: u32, texture: RawTexture) {
        let changed = self.state.update_texture(unit, texture);
        if self.issue(changed) {
            self.driver.bind_texture(unit, texture);
        }
    }

    pub fn set_blend(&mut self, mode: BlendMode) {
        let changed = self.state.update_blend(mode);
        if self.issue(changed) {
            self.driver.set_blend(mode);
        }
    }

    pub fn bind_vertex_buffer(&mut self, buffer: RawBuffer, offset: u64) {
        let changed = self.state.update_vertex_buffer(buffer, offset);
        if self.issue(changed) {
            self.driver.bind_vertex_buffer(buffer, offset);
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: RawBuffer, offset: u64) {
        let changed = self.state.update_index_buffer(buffer, offset);
        if self.issue(changed) {
            self.driver.bind_index_buffer(buffer, offset);
        }
    }

    /// Stencil depth content draws are tested against
    pub fn set_clip_depth(&mut self, depth: u32) {
        let changed = self.state.update_clip_depth(depth);
        if self.issue(changed) {
            self.driver.set_stencil_ref(depth);
        }
    }

    /// Bound target, `None` while unknown
    pub fn target(&self) -> Option<Option<RawFramebuffer>> {
        self.state.target()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.state.viewport()
    }

    pub fn clip_depth(&self) -> u32 {
        self.state.clip_depth().unwrap_or(0)
    }

    // Output

    pub fn clear(&mut self, color: Option<Color>, stencil: bool) {
        self.driver.clear(color, stencil);
    }

    pub fn draw_stencil_quad(&mut self, quad: &[Vec2; 4], op: StencilOp) {
        self.stats.draw_calls += 1;
        self.driver.draw_stencil_quad(quad, op);
    }

    pub fn draw(&mut self, topology: Topology, first: u32, count: u32) {
        self.stats.draw_calls += 1;
        self.driver.draw(topology, first, count);
    }

    pub fn draw_indexed(&mut self, topology: Topology, first: u32, count: u32) {
        self.stats.draw_calls += 1;
        self.driver.draw_indexed(topology, first, count);
    }

    pub fn flush(&mut self) -> DriverResult<()> {
        self.driver.flush()
    }

    pub fn present(&mut self) -> DriverResult<()> {
        self.driver.present()
    }

    pub fn take_error(&mut self) -> Option<DriverError> {
        self.driver.take_error()
    }

    pub fn is_context_lost(&self) -> bool {
        self.driver.is_context_lost()
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("driver", &self.driver.name())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, HeadlessDriver};

    #[test]
    fn test_redundant_binds_never_reach_driver() {
        let (driver, probe) = HeadlessDriver::with_probe(32, 32);
        let mut ctx = GpuContext::new(Box::new(driver));

        for _ in 0..5 {
            ctx.set_blend(BlendMode::Additive);
            ctx.set_viewport(Viewport::full(32, 32));
        }

        assert_eq!(
            probe.calls(),
            vec![
                DriverCall::SetBlend(BlendMode::Additive),
                DriverCall::SetViewport(Viewport::full(32, 32)),
            ]
        );
        assert_eq!(ctx.stats().state_calls_issued, 2);
        assert_eq!(ctx.stats().state_calls_elided, 8);
    }

    #[test]
    fn test_destroying_bound_buffer_invalidates_binding() {
        let (driver, probe) = HeadlessDriver::with_probe(32, 32);
        let mut ctx = GpuContext::new(Box::new(driver));

        let buffer = ctx.create_buffer(BufferKind::Vertex, 64).unwrap();
        ctx.bind_vertex_buffer(buffer, 0);
        ctx.destroy_buffer(buffer);

        let replacement = ctx.create_buffer(BufferKind::Vertex, 64).unwrap();
        ctx.bind_vertex_buffer(replacement, 0);
        ctx.bind_vertex_buffer(replacement, 0);

        let binds = probe.count_calls(|call| matches!(call, DriverCall::BindVertexBuffer { .. }));
        assert_eq!(binds, 2);
    }

    #[test]
    fn test_draws_always_execute() {
        let (driver, probe) = HeadlessDriver::with_probe(32, 32);
        let mut ctx = GpuContext::new(Box::new(driver));

        ctx.draw(Topology::Triangles, 0, 3);
        ctx.draw(Topology::Triangles, 0, 3);

        assert_eq!(probe.draw_count(), 2);
    }

    #[test]
    fn test_invalidate_reissues_state() {
        let (driver, probe) = HeadlessDriver::with_probe(32, 32);
        let mut ctx = GpuContext::new(Box::new(driver));

        ctx.bind_target(None);
        ctx.invalidate();
        ctx.bind_target(None);

        let binds = probe.count_calls(|call| matches!(call, DriverCall::BindFramebuffer(None)));
        assert_eq!(binds, 2);
    }
}
