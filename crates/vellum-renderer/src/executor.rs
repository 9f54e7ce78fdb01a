//! Frame executor
//!
//! Replays a [`CompiledProgram`] through the [`GpuContext`]. Every bind,
//! uniform and buffer binding passes the state cache, so only real changes
//! reach the driver. Offscreen segments render into pooled framebuffers
//! at their splice position.
//!
//! The base state a `Bind(Program)` resets to is applied at the next draw,
//! minus whatever the ops in between overrode, so a replayed frame whose
//! state matches the cache issues no state calls at all. Custom uniforms a
//! segment left non-zero on a program are part of that base and are reset
//! to zero on its next `Bind(Program)`.

use crate::buffer::BufferPool;
use crate::compiler::{BindTarget, CompiledOp, CompiledProgram, Segment, SegmentItem, VertexSource};
use crate::context::{ContextStats, GpuContext};
use crate::driver::{BlendMode, RawProgram, StencilOp, TextureFormat, UniformValue};
use crate::framebuffer::FramebufferManager;
use crate::graph::TextureRef;
use crate::handles::{FramebufferHandle, ProgramHandle, TextureHandle};
use crate::shader::{ShaderCache, COLOR_UNIFORM, MODELVIEW_UNIFORM, PROJECTION_UNIFORM};
use glam::Mat4;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace};
use vellum_core::config::FrameConfig;
use vellum_core::{
    Color, FrameError, GroupId, LogCategory, ResourceError, vellum_warn, vellum_warn_rate_limited,
};

/// GPU-side collaborators of a frame
pub struct FrameResources<'a> {
    pub ctx: &'a mut GpuContext,
    pub pool: &'a mut BufferPool,
    pub shaders: &'a mut ShaderCache,
    pub framebuffers: &'a mut FramebufferManager,
}

/// Pool and shader cache, split from the context and framebuffers so a
/// target scope can lend those two out separately
struct Assets<'a> {
    pool: &'a mut BufferPool,
    shaders: &'a mut ShaderCache,
}

/// Base state still owed to the driver since the last `Bind(Program)`
#[derive(Debug)]
struct PendingBase {
    uniforms: Vec<(Arc<str>, UniformValue)>,
    texture: bool,
    blend: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub ops_executed: usize,
    pub draws: usize,
    pub segments: usize,
    pub targets_rendered: usize,
    /// Driver traffic of the frame
    pub context: ContextStats,
    pub duration: Duration,
}

/// Walks compiled programs once per frame
#[derive(Debug)]
pub struct FrameExecutor {
    clear_color: Color,
    targets: HashMap<GroupId, FramebufferHandle>,
    default_texture: Option<TextureHandle>,
    program: Option<(ProgramHandle, RawProgram)>,
    base: Option<PendingBase>,
    /// Custom uniforms holding non-zero values, with their zero, per program
    custom_uniforms: HashMap<ProgramHandle, HashMap<Arc<str>, UniformValue>>,
    stats: FrameStats,
}

impl FrameExecutor {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            clear_color: config.clear_color,
            targets: HashMap::new(),
            default_texture: None,
            program: None,
            base: None,
            custom_uniforms: HashMap::new(),
            stats: FrameStats::default(),
        }
    }

    /// Stats of the last executed frame
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn set_clear_color(&mut self, color: Color) {
        self.clear_color = color;
    }

    /// Framebuffer currently backing an offscreen group
    pub fn target_of(&self, group: GroupId) -> Option<FramebufferHandle> {
        self.targets.get(&group).copied()
    }

    /// Forget the bound program; raw ids died with the context
    pub fn on_context_lost(&mut self) {
        self.program = None;
        self.base = None;
        self.custom_uniforms.clear();
    }

    /// Execute `program` against the screen target. Errors latched by the
    /// driver fail the frame after the flush.
    #[instrument(skip_all, fields(revision = program.revision))]
    pub fn execute(
        &mut self,
        program: &CompiledProgram,
        resources: FrameResources<'_>,
    ) -> Result<FrameStats, FrameError> {
        let start = Instant::now();
        let FrameResources {
            ctx,
            pool,
            shaders,
            framebuffers,
        } = resources;
        let before = ctx.stats();
        self.stats = FrameStats::default();

        let default_texture = match self.default_texture {
            Some(handle) if pool.texture_size(handle).is_some() => handle,
            _ => {
                let handle = pool.allocate_texture(ctx, &[255; 4], 1, 1, TextureFormat::Rgba8)?;
                self.default_texture = Some(handle);
                handle
            }
        };

        ctx.bind_target(None);
        ctx.set_viewport(ctx.screen_viewport());
        ctx.set_clip_depth(0);
        ctx.clear(Some(self.clear_color), true);

        let mut assets = Assets { pool, shaders };
        let walked = self.run_segment(
            program,
            program.root,
            ctx,
            framebuffers,
            &mut assets,
            default_texture,
        );
        self.prune_targets(program, ctx, framebuffers);
        walked?;

        ctx.flush()?;
        if let Some(error) = ctx.take_error() {
            return Err(FrameError::Driver(error));
        }

        self.stats.context = ctx.stats().since(&before);
        self.stats.duration = start.elapsed();
        debug!(
            "Executed {} ops ({} draws, {} state calls, {} elided) in {:?}",
            self.stats.ops_executed,
            self.stats.draws,
            self.stats.context.state_calls_issued,
            self.stats.context.state_calls_elided,
            self.stats.duration
        );
        Ok(self.stats.clone())
    }

    fn run_segment(
        &mut self,
        program: &CompiledProgram,
        group: GroupId,
        ctx: &mut GpuContext,
        framebuffers: &mut FramebufferManager,
        assets: &mut Assets<'_>,
        default_texture: TextureHandle,
    ) -> Result<(), FrameError> {
        let segment = program
            .segment(group)
            .ok_or(FrameError::MissingSegment(group))?;
        self.stats.segments += 1;

        let Some(SegmentItem::Op(first)) = segment.items.first() else {
            return self.run_items(program, segment, ctx, framebuffers, assets, default_texture);
        };
        let CompiledOp::BeginTarget {
            width,
            height,
            clear,
            stencil,
            ..
        } = first.op
        else {
            return self.run_items(program, segment, ctx, framebuffers, assets, default_texture);
        };

        let handle = match self.targets.get(&group) {
            Some(handle) => framebuffers.reacquire(ctx, *handle, width, height, stencil)?,
            None => framebuffers.acquire(ctx, width, height, stencil)?,
        };
        self.targets.insert(group, handle);
        self.stats.targets_rendered += 1;

        framebuffers.with_target(ctx, handle, |framebuffers, ctx| {
            if clear.is_some() || stencil {
                ctx.clear(clear, stencil);
            }
            self.run_items(program, segment, ctx, framebuffers, assets, default_texture)
        })
    }

    fn run_items(
        &mut self,
        program: &CompiledProgram,
        segment: &Segment,
        ctx: &mut GpuContext,
        framebuffers: &mut FramebufferManager,
        assets: &mut Assets<'_>,
        default_texture: TextureHandle,
    ) -> Result<(), FrameError> {
        for item in &segment.items {
            match item {
                SegmentItem::Child(child) => {
                    self.run_segment(program, *child, ctx, framebuffers, assets, default_texture)?;
                }
                SegmentItem::Op(tagged) => {
                    self.stats.ops_executed += 1;
                    self.apply(&tagged.op, segment, ctx, framebuffers, assets, default_texture)?;
                }
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        op: &CompiledOp,
        segment: &Segment,
        ctx: &mut GpuContext,
        framebuffers: &FramebufferManager,
        assets: &mut Assets<'_>,
        default_texture: TextureHandle,
    ) -> Result<(), FrameError> {
        match op {
            CompiledOp::Bind(BindTarget::Program(handle)) => {
                let raw = assets.shaders.resolve(ctx, *handle)?;
                ctx.use_program(raw);
                self.program = Some((*handle, raw));

                let viewport = ctx.viewport().unwrap_or_else(|| ctx.screen_viewport());
                let projection = Mat4::orthographic_rh(
                    0.0,
                    viewport.width as f32,
                    viewport.height as f32,
                    0.0,
                    -1.0,
                    1.0,
                );
                let mut uniforms: Vec<(Arc<str>, UniformValue)> = vec![
                    (PROJECTION_UNIFORM.into(), UniformValue::Mat4(projection)),
                    (MODELVIEW_UNIFORM.into(), UniformValue::Mat4(Mat4::IDENTITY)),
                    (COLOR_UNIFORM.into(), Color::WHITE.into()),
                ];
                if let Some(custom) = self.custom_uniforms.get(handle) {
                    uniforms.extend(custom.iter().map(|(name, zero)| (name.clone(), *zero)));
                }
                self.base = Some(PendingBase {
                    uniforms,
                    texture: true,
                    blend: true,
                });
            }
            CompiledOp::Bind(BindTarget::Texture { unit, texture }) => {
                let raw = match *texture {
                    TextureRef::Default => assets.pool.texture_storage(default_texture)?,
                    TextureRef::Texture(handle) => assets.pool.texture_storage(handle)?,
                    TextureRef::Target(group) => {
                        match self.targets.get(&group).and_then(|h| framebuffers.texture_of(*h)) {
                            Some(raw) => raw,
                            None => {
                                vellum_warn_rate_limited!(
                                    LogCategory::Executor,
                                    "{} has not rendered yet, sampling the default texture",
                                    group
                                );
                                assets.pool.texture_storage(default_texture)?
                            }
                        }
                    }
                };
                if let Some(base) = self.base.as_mut().filter(|_| *unit == 0) {
                    base.texture = false;
                }
                ctx.bind_texture(*unit, raw);
            }
            CompiledOp::SetUniform { name, value } => {
                if let Some(base) = self.base.as_mut() {
                    base.uniforms.retain(|(pending, _)| **pending != **name);
                }
                self.set_uniform(ctx, assets, name, *value)?;
            }
            CompiledOp::SetBlend(mode) => {
                if let Some(base) = self.base.as_mut() {
                    base.blend = false;
                }
                ctx.set_blend(*mode);
            }
            CompiledOp::DrawCall {
                source,
                first,
                count,
                topology,
                indexed,
            } => {
                self.flush_base(ctx, assets, default_texture)?;
                match *source {
                    VertexSource::Group(group) => {
                        let geometry = segment
                            .geometry
                            .as_ref()
                            .filter(|_| segment.group == group)
                            .ok_or(FrameError::MissingSegment(group))?;
                        let vertices = assets.pool.storage(geometry.vertices)?;
                        let indices = assets.pool.storage(geometry.indices)?;
                        ctx.bind_vertex_buffer(vertices.raw, vertices.offset);
                        ctx.bind_index_buffer(indices.raw, indices.offset);
                    }
                    VertexSource::Buffers { vertices, indices } => {
                        let vertices = assets.pool.storage(vertices)?;
                        ctx.bind_vertex_buffer(vertices.raw, vertices.offset);
                        if let Some(indices) = indices {
                            let indices = assets.pool.storage(indices)?;
                            ctx.bind_index_buffer(indices.raw, indices.offset);
                        }
                    }
                }
                if *indexed {
                    ctx.draw_indexed(*topology, *first, *count);
                } else {
                    ctx.draw(*topology, *first, *count);
                }
                self.stats.draws += 1;
            }
            CompiledOp::PushClip { quad } => {
                let depth = ctx.clip_depth();
                ctx.draw_stencil_quad(quad, StencilOp::Increment);
                ctx.set_clip_depth(depth + 1);
            }
            CompiledOp::PopClip { quad } => {
                let depth = ctx.clip_depth();
                ctx.draw_stencil_quad(quad, StencilOp::Decrement);
                ctx.set_clip_depth(depth.saturating_sub(1));
            }
            // Handled by the segment walk
            CompiledOp::BeginTarget { .. } | CompiledOp::EndTarget { .. } => {}
        }
        Ok(())
    }

    fn flush_base(
        &mut self,
        ctx: &mut GpuContext,
        assets: &mut Assets<'_>,
        default_texture: TextureHandle,
    ) -> Result<(), FrameError> {
        let Some(base) = self.base.take() else {
            return Ok(());
        };
        for (name, value) in base.uniforms {
            self.set_uniform(ctx, assets, &name, value)?;
        }
        if base.texture {
            ctx.bind_texture(0, assets.pool.texture_storage(default_texture)?);
        }
        if base.blend {
            ctx.set_blend(BlendMode::Alpha);
        }
        Ok(())
    }

    fn set_uniform(
        &mut self,
        ctx: &mut GpuContext,
        assets: &mut Assets<'_>,
        name: &str,
        value: UniformValue,
    ) -> Result<(), FrameError> {
        let Some((handle, raw)) = self.program else {
            return Err(ResourceError::InvalidHandle { kind: "program" }.into());
        };
        match assets.shaders.uniform_location(ctx, handle, name)? {
            Some(location) => {
                ctx.set_uniform(raw, location, value);
                self.track_custom_uniform(handle, name, value);
            }
            None => trace!("Program {:?} has no uniform `{}`", handle, name),
        }
        Ok(())
    }

    fn track_custom_uniform(&mut self, handle: ProgramHandle, name: &str, value: UniformValue) {
        if [PROJECTION_UNIFORM, MODELVIEW_UNIFORM, COLOR_UNIFORM].contains(&name) {
            return;
        }
        let zero = value.zero();
        if value == zero {
            if let Some(custom) = self.custom_uniforms.get_mut(&handle) {
                custom.remove(name);
            }
        } else {
            self.custom_uniforms
                .entry(handle)
                .or_default()
                .insert(name.into(), zero);
        }
    }

    /// Return framebuffers of groups that no longer render offscreen
    fn prune_targets(
        &mut self,
        program: &CompiledProgram,
        ctx: &mut GpuContext,
        framebuffers: &mut FramebufferManager,
    ) {
        self.targets.retain(|group, handle| {
            let live = program
                .segment(*group)
                .is_some_and(|segment| segment.target().is_some());
            if !live {
                if let Err(e) = framebuffers.release(ctx, *handle) {
                    vellum_warn!(LogCategory::Framebuffers, "Releasing target of {} failed: {}", group, e);
                }
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileResources, Compiler};
    use crate::driver::{DriverCall, HeadlessDriver, HeadlessProbe};
    use crate::graph::{Instruction, InstructionGraph};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use vellum_core::config::{BufferPoolConfig, FramebufferConfig, ShaderConfig};
    use vellum_core::{DriverError, Rect};

    struct Harness {
        ctx: GpuContext,
        pool: BufferPool,
        shaders: ShaderCache,
        framebuffers: FramebufferManager,
        compiler: Compiler,
        executor: FrameExecutor,
        probe: HeadlessProbe,
    }

    impl Harness {
        fn new() -> Self {
            let (driver, probe) = HeadlessDriver::with_probe(320, 240);
            let mut ctx = GpuContext::new(Box::new(driver));
            let shaders = ShaderCache::new(&mut ctx, &ShaderConfig::default()).unwrap();
            Self {
                ctx,
                pool: BufferPool::new(BufferPoolConfig::default()),
                shaders,
                framebuffers: FramebufferManager::new(FramebufferConfig::default()),
                compiler: Compiler::new(),
                executor: FrameExecutor::new(&FrameConfig::default()),
                probe,
            }
        }

        fn frame(&mut self, graph: &mut InstructionGraph) -> Result<FrameStats, FrameError> {
            let program: Arc<CompiledProgram> = self
                .compiler
                .compile(
                    graph,
                    &mut CompileResources {
                        ctx: &mut self.ctx,
                        pool: &mut self.pool,
                        shaders: &mut self.shaders,
                    },
                )
                .unwrap()
                .program;
            self.executor.execute(
                &program,
                FrameResources {
                    ctx: &mut self.ctx,
                    pool: &mut self.pool,
                    shaders: &mut self.shaders,
                    framebuffers: &mut self.framebuffers,
                },
            )
        }
    }

    fn square(x: f32) -> Instruction {
        Instruction::rectangle(Rect::new(x, 0.0, 16.0, 16.0))
    }

    #[test]
    fn test_single_rectangle_frame() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        graph.add_instruction(graph.root(), square(0.0)).unwrap();

        let stats = harness.frame(&mut graph).unwrap();

        assert_eq!(stats.draws, 1);
        assert_eq!(
            harness.probe.count_calls(|call| matches!(
                call,
                DriverCall::DrawIndexed { first: 0, count: 6, .. }
            )),
            1
        );
        assert!(harness
            .probe
            .count_calls(|call| matches!(call, DriverCall::UseProgram(_)))
            > 0);
    }

    #[test]
    fn test_replaying_unchanged_program_issues_no_state_calls() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        graph.add_instruction(root, Instruction::color(Color::RED)).unwrap();
        graph.add_instruction(root, square(0.0)).unwrap();
        harness.frame(&mut graph).unwrap();
        harness.probe.clear_calls();

        let stats = harness.frame(&mut graph).unwrap();

        assert_eq!(harness.probe.state_change_count(), 0);
        assert_eq!(harness.probe.draw_count(), 1);
        assert_eq!(stats.context.state_calls_issued, 0);
        assert!(stats.context.state_calls_elided > 0);
    }

    #[test]
    fn test_clip_pushes_and_pops_stencil_depth() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        graph
            .add_instruction(root, Instruction::push_clip(Rect::new(0.0, 0.0, 8.0, 8.0)))
            .unwrap();
        graph.add_instruction(root, square(0.0)).unwrap();
        graph.add_instruction(root, Instruction::pop_clip()).unwrap();

        harness.frame(&mut graph).unwrap();

        let stencil: Vec<_> = harness
            .probe
            .calls()
            .into_iter()
            .filter(|call| {
                matches!(call, DriverCall::StencilQuad { .. } | DriverCall::SetStencilRef(_))
            })
            .map(|call| match call {
                DriverCall::StencilQuad { op, .. } => format!("{:?}", op),
                DriverCall::SetStencilRef(depth) => depth.to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(stencil, vec!["0", "Increment", "1", "Decrement", "0"]);
        assert_eq!(harness.probe.stencil_depth(), 0);
    }

    #[test]
    fn test_offscreen_group_renders_before_its_texture_is_sampled() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let layer = graph.create_offscreen_group(64, 32, Some(Color::TRANSPARENT), true);
        graph.add_instruction(layer, square(0.0)).unwrap();
        graph.attach_group(root, layer, None).unwrap();
        graph
            .add_instruction(
                root,
                Instruction::textured_rectangle(
                    Rect::new(0.0, 0.0, 64.0, 32.0),
                    TextureRef::Target(layer),
                ),
            )
            .unwrap();

        let stats = harness.frame(&mut graph).unwrap();
        assert_eq!(stats.targets_rendered, 1);
        assert_eq!(stats.draws, 2);

        let calls = harness.probe.calls();
        let target = harness.executor.target_of(layer).unwrap();
        let target_texture = harness.framebuffers.texture_of(target).unwrap();
        assert!(calls.iter().any(|call| matches!(
            call,
            DriverCall::BindTexture { texture, .. } if *texture == target_texture
        )));
        assert_eq!(harness.probe.bound_framebuffer(), None);

        harness.probe.clear_calls();
        harness.frame(&mut graph).unwrap();
        assert_eq!(
            harness
                .probe
                .count_calls(|call| matches!(call, DriverCall::CreateFramebuffer { .. })),
            0
        );
    }

    #[test]
    fn test_unrendered_target_samples_default_texture() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        let detached = graph.create_offscreen_group(8, 8, None, false);
        graph
            .add_instruction(
                graph.root(),
                Instruction::textured_rectangle(Rect::new(0.0, 0.0, 8.0, 8.0), TextureRef::Target(detached)),
            )
            .unwrap();

        let stats = harness.frame(&mut graph).unwrap();
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.targets_rendered, 0);
    }

    #[test]
    fn test_detached_target_is_returned_to_pool() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let layer = graph.create_offscreen_group(16, 16, None, false);
        graph.add_instruction(layer, square(0.0)).unwrap();
        graph.attach_group(root, layer, None).unwrap();
        harness.frame(&mut graph).unwrap();
        assert!(harness.executor.target_of(layer).is_some());

        graph.detach_group(root, layer).unwrap();
        harness.frame(&mut graph).unwrap();

        assert_eq!(harness.executor.target_of(layer), None);
        assert_eq!(harness.framebuffers.stats().pooled, 1);
    }

    const GLOW_VERTEX: &str = "@vertex fn vs_main() {}";
    const GLOW_FRAGMENT: &str = "var<uniform> u_glow: f32;\n@fragment fn fs_main() {}";

    /// Root binds the glow program; `glowing` sets `u_glow`, `plain` does not
    fn glow_graph(glowing_first: bool) -> InstructionGraph {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        graph
            .add_instruction(root, Instruction::shader(GLOW_VERTEX, GLOW_FRAGMENT))
            .unwrap();
        let glowing = graph.create_group();
        graph.add_instruction(glowing, Instruction::uniform("u_glow", 1.0f32)).unwrap();
        graph.add_instruction(glowing, square(0.0)).unwrap();
        let plain = graph.create_group();
        graph.add_instruction(plain, square(20.0)).unwrap();

        let order = if glowing_first { [glowing, plain] } else { [plain, glowing] };
        for group in order {
            graph.attach_group(root, group, None).unwrap();
        }
        graph
    }

    /// Last `u_glow` value written before each draw
    fn glow_at_draws(calls: &[DriverCall]) -> Vec<Option<f32>> {
        let mut current = None;
        let mut seen = Vec::new();
        for call in calls {
            match call {
                DriverCall::SetUniform {
                    value: UniformValue::Float(value),
                    ..
                } => current = Some(*value),
                DriverCall::DrawIndexed { .. } => seen.push(current),
                _ => {}
            }
        }
        seen
    }

    #[test]
    fn test_custom_uniform_does_not_leak_to_later_sibling() {
        let mut harness = Harness::new();
        let mut graph = glow_graph(true);

        harness.frame(&mut graph).unwrap();
        assert_eq!(glow_at_draws(&harness.probe.calls()), vec![Some(1.0), Some(0.0)]);
    }

    #[test]
    fn test_custom_uniform_is_reset_on_next_frame() {
        let mut harness = Harness::new();
        let mut graph = glow_graph(false);
        harness.frame(&mut graph).unwrap();
        assert_eq!(glow_at_draws(&harness.probe.calls()), vec![None, Some(1.0)]);
        harness.probe.clear_calls();

        harness.frame(&mut graph).unwrap();
        assert_eq!(glow_at_draws(&harness.probe.calls()), vec![Some(0.0), Some(1.0)]);
    }

    #[test]
    fn test_driver_error_fails_frame() {
        let mut harness = Harness::new();
        let mut graph = InstructionGraph::new();
        graph.add_instruction(graph.root(), square(0.0)).unwrap();
        harness
            .probe
            .fail_next_draw(DriverError::Backend("device hung".to_string()));

        let err = harness.frame(&mut graph).unwrap_err();
        assert_eq!(err, FrameError::Driver(DriverError::Backend("device hung".to_string())));
    }
}
