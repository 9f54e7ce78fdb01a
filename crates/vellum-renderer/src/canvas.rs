//! Canvas renderer
//!
//! [`CanvasRenderer`] owns every component and runs one frame at a time:
//! drain queued mutations, compile, execute, present. It is also the only
//! writer of the graph, so it keeps the pool's reference counts in step with
//! the handles instructions hold. Handles of removed instructions stay
//! retained until a compile succeeds, since the previous program may still
//! draw with them.

use crate::buffer::{BufferPool, BufferPoolStats, CompactionReport};
use crate::compiler::{CompileResources, CompileStats, CompiledProgram, Compiler, Diagnostic};
use crate::context::GpuContext;
use crate::driver::{BufferKind, GpuDriver, TextureFormat, TextureRegion};
use crate::executor::{FrameExecutor, FrameResources, FrameStats};
use crate::framebuffer::{FramebufferManager, FramebufferStats};
use crate::graph::{GraphWriter, Instruction, InstructionGraph, Mutation, MutationQueue, OffscreenTarget};
use crate::handles::{BufferHandle, GpuResourceHandle, TextureHandle};
use crate::shader::{ShaderCache, ShaderCacheStats};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};
use vellum_core::{
    Color, DriverError, ErrorContext, FrameError, GraphError, GroupId, InstructionId, LogCategory,
    ResourceError, VellumConfig, VellumError, vellum_error, vellum_warn, vellum_warn_rate_limited,
};

type Result<T> = std::result::Result<T, VellumError>;

/// What happened during one [`CanvasRenderer::render_frame`]
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// Context was lost; nothing ran
    pub skipped: bool,
    pub presented: bool,
    pub mutations_applied: usize,
    pub mutations_failed: usize,
    pub buffers_released: usize,
    pub compile: Option<CompileStats>,
    /// Set when the compile failed and the previous program was used
    pub compile_error: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub deadline_missed: bool,
    pub execution: Option<FrameStats>,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanvasStats {
    pub frames: u64,
    pub presented: u64,
    pub skipped: u64,
    pub failed_frames: u64,
    pub compile_failures: u64,
    pub missed_deadlines: u64,
    pub context_losses: u64,
}

pub struct CanvasRenderer {
    config: VellumConfig,
    ctx: GpuContext,
    pool: BufferPool,
    shaders: ShaderCache,
    framebuffers: FramebufferManager,
    graph: InstructionGraph,
    queue: MutationQueue,
    /// Released once a compile no longer references them
    displaced: Vec<GpuResourceHandle>,
    compiler: Compiler,
    executor: FrameExecutor,
    context_lost: bool,
    frame: u64,
    stats: CanvasStats,
}

impl CanvasRenderer {
    /// Build the renderer on `driver`. Fails if the default program does not
    /// compile.
    pub fn new(driver: Box<dyn GpuDriver>, config: VellumConfig) -> Result<Self> {
        config.validate()?;
        let mut ctx = GpuContext::new(driver);
        let shaders = ShaderCache::new(&mut ctx, &config.shaders)?;
        info!("Canvas renderer created on {} driver", ctx.driver_name());

        Ok(Self {
            pool: BufferPool::new(config.buffers.clone()),
            framebuffers: FramebufferManager::new(config.framebuffers.clone()),
            executor: FrameExecutor::new(&config.frame),
            graph: InstructionGraph::new(),
            queue: MutationQueue::new(),
            displaced: Vec::new(),
            compiler: Compiler::new(),
            context_lost: false,
            frame: 0,
            stats: CanvasStats::default(),
            config,
            ctx,
            shaders,
        })
    }

    pub fn config(&self) -> &VellumConfig {
        &self.config
    }

    pub fn graph(&self) -> &InstructionGraph {
        &self.graph
    }

    pub fn root(&self) -> GroupId {
        self.graph.root()
    }

    /// Producer handle for other threads; its batches apply at the next frame
    pub fn writer(&self) -> GraphWriter {
        self.queue.writer(&self.graph)
    }

    pub fn program(&self) -> Option<&Arc<CompiledProgram>> {
        self.compiler.program()
    }

    pub fn stats(&self) -> CanvasStats {
        self.stats
    }

    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    pub fn shader_stats(&self) -> ShaderCacheStats {
        self.shaders.stats()
    }

    pub fn framebuffer_stats(&self) -> FramebufferStats {
        self.framebuffers.stats()
    }

    pub fn set_clear_color(&mut self, color: Color) {
        self.config.frame.clear_color = color;
        self.executor.set_clear_color(color);
    }

    // Graph

    pub fn create_group(&mut self) -> Result<GroupId> {
        let id = self.graph.allocator().next_group();
        self.apply(Mutation::CreateGroup { id, target: None })?;
        Ok(id)
    }

    pub fn create_offscreen_group(
        &mut self,
        width: u32,
        height: u32,
        clear: Option<Color>,
        stencil: bool,
    ) -> Result<GroupId> {
        let id = self.graph.allocator().next_group();
        self.apply(Mutation::CreateGroup {
            id,
            target: Some(OffscreenTarget {
                width,
                height,
                clear,
                stencil,
            }),
        })?;
        Ok(id)
    }

    pub fn attach_group(&mut self, parent: GroupId, child: GroupId, index: Option<usize>) -> Result<()> {
        self.apply(Mutation::AttachGroup {
            parent,
            child,
            index,
        })
    }

    pub fn detach_group(&mut self, parent: GroupId, child: GroupId) -> Result<()> {
        self.apply(Mutation::DetachGroup { parent, child })
    }

    /// Destroy a group with everything in it, releasing held resources
    pub fn destroy_group(&mut self, group: GroupId) -> Result<()> {
        self.apply(Mutation::DestroyGroup(group))
    }

    pub fn set_target_size(&mut self, group: GroupId, width: u32, height: u32) -> Result<()> {
        self.apply(Mutation::SetTargetSize {
            group,
            width,
            height,
        })
    }

    pub fn add_instruction(&mut self, group: GroupId, instruction: Instruction) -> Result<InstructionId> {
        let id = self.graph.allocator().next_instruction();
        self.apply(Mutation::AddInstruction {
            group,
            id,
            instruction,
            index: None,
        })?;
        Ok(id)
    }

    pub fn insert_instruction(
        &mut self,
        group: GroupId,
        index: usize,
        instruction: Instruction,
    ) -> Result<InstructionId> {
        let id = self.graph.allocator().next_instruction();
        self.apply(Mutation::AddInstruction {
            group,
            id,
            instruction,
            index: Some(index),
        })?;
        Ok(id)
    }

    pub fn remove_instruction(&mut self, group: GroupId, id: InstructionId) -> Result<()> {
        self.apply(Mutation::RemoveInstruction { group, id })
    }

    pub fn replace(&mut self, id: InstructionId, instruction: Instruction) -> Result<()> {
        self.apply(Mutation::Replace { id, instruction })
    }

    /// Edit an instruction in place
    pub fn mutate<R>(&mut self, id: InstructionId, f: impl FnOnce(&mut Instruction) -> R) -> Result<R> {
        let mut instruction = self
            .graph
            .instruction(id)
            .ok_or(GraphError::UnknownInstruction(id))?
            .clone();
        let result = f(&mut instruction);
        self.apply(Mutation::Replace { id, instruction })?;
        Ok(result)
    }

    /// Force the next frame to recompile the whole graph
    pub fn mark_all_dirty(&mut self) {
        self.graph.mark_all_dirty();
    }

    /// Apply one mutation, retaining what it adds and releasing what it
    /// displaces. A failed mutation changes neither graph nor ref counts.
    pub fn apply(&mut self, mutation: Mutation) -> Result<()> {
        let added = mutation.added_resources();
        self.retain_all(&added)?;
        match mutation.apply(&mut self.graph) {
            Ok(displaced) => {
                for instruction in displaced {
                    self.displaced.extend(instruction.resources());
                }
                Ok(())
            }
            Err(e) => {
                self.release_all(&added);
                Err(e.into())
            }
        }
    }

    fn retain_all(&mut self, handles: &[GpuResourceHandle]) -> Result<()> {
        for (i, handle) in handles.iter().enumerate() {
            let retained = match *handle {
                GpuResourceHandle::Buffer(buffer) => self.pool.retain(buffer),
                GpuResourceHandle::Texture(texture) => self.pool.retain_texture(texture),
            };
            if let Err(e) = retained {
                self.release_all(&handles[..i]);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn release_all(&mut self, handles: &[GpuResourceHandle]) {
        for handle in handles {
            let released = match *handle {
                GpuResourceHandle::Buffer(buffer) => self.pool.release(buffer),
                GpuResourceHandle::Texture(texture) => self.pool.release_texture(texture),
            };
            if let Err(e) = released {
                vellum_warn!(LogCategory::Buffers, "Release of {:?} failed: {}", handle, e);
            }
        }
    }

    // Resources

    /// Upload an image; the caller holds the returned reference
    pub fn upload_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureHandle> {
        Ok(self
            .pool
            .allocate_texture(&mut self.ctx, pixels, width, height, format)?)
    }

    pub fn update_texture(&mut self, texture: TextureHandle, region: TextureRegion, pixels: &[u8]) -> Result<()> {
        Ok(self
            .pool
            .upload_texture_region(&mut self.ctx, texture, region, pixels)?)
    }

    pub fn release_texture(&mut self, texture: TextureHandle) -> Result<()> {
        Ok(self.pool.release_texture(texture)?)
    }

    /// Caller-owned buffer for [`BufferReference`](crate::graph::BufferReference) draws
    pub fn allocate_buffer(&mut self, kind: BufferKind, size: u64) -> Result<BufferHandle> {
        Ok(self.pool.allocate(&mut self.ctx, kind, size)?)
    }

    pub fn upload_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        Ok(self.pool.upload(&mut self.ctx, buffer, offset, data)?)
    }

    pub fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        Ok(self.pool.release(buffer)?)
    }

    /// Give back free GPU memory: coalesce and drop empty pages, idle
    /// textures and pooled framebuffers
    pub fn trim(&mut self) -> CompactionReport {
        self.pool.collect_released();
        let report = self.pool.compact(&mut self.ctx);
        let framebuffers = self.framebuffers.trim(&mut self.ctx);
        debug!("Trimmed {:?} and {} framebuffers", report, framebuffers);
        report
    }

    // Frames

    /// Drain, compile, execute and present one frame.
    ///
    /// A failed compile keeps the previous program and is reported, not
    /// returned. A failed execution is returned and nothing is presented.
    #[instrument(skip(self), fields(frame = self.frame + 1))]
    pub fn render_frame(&mut self) -> Result<FrameReport> {
        self.frame += 1;
        self.stats.frames += 1;
        let mut report = FrameReport {
            frame: self.frame,
            ..Default::default()
        };

        if self.context_lost || self.ctx.is_context_lost() {
            self.on_context_lost();
            self.stats.skipped += 1;
            report.skipped = true;
            return Ok(report);
        }

        for batch in self.queue.drain() {
            for mutation in batch.into_mutations() {
                match self.apply(mutation) {
                    Ok(()) => report.mutations_applied += 1,
                    Err(e) => {
                        report.mutations_failed += 1;
                        vellum_warn!(LogCategory::Graph, "Dropped queued mutation: {}", e);
                    }
                }
            }
        }
        report.buffers_released = self.pool.collect_released();

        let start = Instant::now();
        let compiled = self.compiler.compile(
            &mut self.graph,
            &mut CompileResources {
                ctx: &mut self.ctx,
                pool: &mut self.pool,
                shaders: &mut self.shaders,
            },
        );
        let program = match compiled {
            Ok(outcome) => {
                let displaced = std::mem::take(&mut self.displaced);
                self.release_all(&displaced);
                report.compile = Some(outcome.stats);
                report.diagnostics = outcome.diagnostics;
                Some(outcome.program)
            }
            Err(e) if is_context_lost(&e) => {
                self.on_context_lost();
                self.stats.failed_frames += 1;
                return Err(VellumError::ContextLost);
            }
            Err(e) => {
                self.stats.compile_failures += 1;
                vellum_warn_rate_limited!(
                    LogCategory::Compiler,
                    "Compile failed, keeping the previous program: {}",
                    e
                );
                report.compile_error = Some(e.to_string());
                self.compiler.program().cloned()
            }
        };

        let elapsed = start.elapsed();
        if elapsed.as_secs_f64() * 1000.0 > self.config.frame.budget_ms {
            self.stats.missed_deadlines += 1;
            report.deadline_missed = true;
            vellum_warn_rate_limited!(
                LogCategory::Compiler,
                "Compile took {:?}, over the {} ms frame budget",
                elapsed,
                self.config.frame.budget_ms
            );
        }

        let Some(program) = program else {
            return Ok(report);
        };
        let executed = self.executor.execute(
            &program,
            FrameResources {
                ctx: &mut self.ctx,
                pool: &mut self.pool,
                shaders: &mut self.shaders,
                framebuffers: &mut self.framebuffers,
            },
        );
        match executed {
            Ok(stats) => report.execution = Some(stats),
            Err(e) => return Err(self.frame_failed(e)),
        }

        if let Err(e) = self.ctx.present() {
            return Err(self.frame_failed(FrameError::Driver(e)));
        }
        self.stats.presented += 1;
        report.presented = true;
        Ok(report)
    }

    fn frame_failed(&mut self, error: FrameError) -> VellumError {
        self.stats.failed_frames += 1;
        if error.is_context_lost() {
            self.on_context_lost();
            return VellumError::ContextLost;
        }
        let context = ErrorContext::new("render_frame", "executor").with_metadata("frame", self.frame);
        vellum_error!(
            LogCategory::Executor,
            "Frame not presented: {} ({})",
            error,
            context.format_for_log()
        );
        VellumError::frame_with_context(error, context)
    }

    // Context lifecycle

    /// Drop every raw driver id. Frames are skipped until
    /// [`on_context_restored`](Self::on_context_restored).
    pub fn on_context_lost(&mut self) {
        if self.context_lost {
            return;
        }
        self.context_lost = true;
        self.stats.context_losses += 1;
        self.ctx.invalidate();
        self.pool.on_context_lost();
        self.shaders.on_context_lost();
        self.framebuffers.on_context_lost();
        self.executor.on_context_lost();
        vellum_warn!(LogCategory::Core, "GPU context lost after frame {}", self.frame);
    }

    /// Recreate GPU storage and schedule a full recompile
    pub fn on_context_restored(&mut self) -> Result<()> {
        self.ctx.invalidate();
        self.pool.on_context_restored(&mut self.ctx)?;
        self.shaders
            .resolve(&mut self.ctx, self.shaders.default_program())?;
        self.graph.mark_all_dirty();
        self.compiler.reset();
        self.context_lost = false;
        info!("GPU context restored");
        Ok(())
    }

    pub fn is_context_lost(&self) -> bool {
        self.context_lost
    }
}

fn is_context_lost(error: &VellumError) -> bool {
    matches!(
        error,
        VellumError::ContextLost
            | VellumError::Driver(DriverError::ContextLost)
            | VellumError::Resource(ResourceError::Driver(DriverError::ContextLost))
    )
}
