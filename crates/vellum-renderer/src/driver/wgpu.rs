//! wgpu backend
//!
//! wgpu has no global bind state, so this driver keeps the GL-style state
//! machine on the CPU side. Every draw snapshots the bound state into a
//! recorded step; [`GpuDriver::flush`] turns the recorded steps into render
//! passes and submits them in one command buffer.
//!
//! Uniforms live in a fixed block (two matrices, the color and four
//! parameter vectors) written once per draw at a dynamic offset. Named
//! uniforms other than the three builtins map to parameter slots in the
//! order they are looked up.

use super::{
    BlendMode, BufferKind, DriverResult, GpuDriver, RawBuffer, RawFramebuffer, RawProgram,
    RawTexture, StencilOp, TextureFormat, TextureRegion, Topology, UniformLocation, UniformValue,
};
use crate::shader::{COLOR_UNIFORM, MODELVIEW_UNIFORM, PROJECTION_UNIFORM};
use crate::vertex::Vertex;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use vellum_core::{Color, DriverError, LogCategory, Viewport, vellum_error};
use wgpu::util::DeviceExt;

const UNIFORM_STRIDE: u64 = 256;
const PARAM_SLOTS: u32 = 4;
const FIRST_PARAM: u32 = 3;
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const STENCIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

const CLIP_SHADER: &str = r#"
@vertex
fn vs_main(@location(0) position: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(0.0, 0.0, 0.0, 0.0);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UniformBlock {
    projection: [[f32; 4]; 4],
    modelview: [[f32; 4]; 4],
    color: [f32; 4],
    params: [[f32; 4]; 4],
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY.to_cols_array_2d(),
            modelview: Mat4::IDENTITY.to_cols_array_2d(),
            color: Color::WHITE.to_array(),
            params: [[0.0; 4]; 4],
        }
    }
}

impl UniformBlock {
    fn set(&mut self, location: UniformLocation, value: &UniformValue) {
        match (location.0, value) {
            (0, UniformValue::Mat4(m)) => self.projection = m.to_cols_array_2d(),
            (1, UniformValue::Mat4(m)) => self.modelview = m.to_cols_array_2d(),
            (2, value) => self.color = vector(value),
            (slot, value) if (FIRST_PARAM..FIRST_PARAM + PARAM_SLOTS).contains(&slot) => {
                self.params[(slot - FIRST_PARAM) as usize] = vector(value);
            }
            _ => {}
        }
    }
}

fn vector(value: &UniformValue) -> [f32; 4] {
    match *value {
        UniformValue::Int(v) => [v as f32, 0.0, 0.0, 0.0],
        UniformValue::Float(v) => [v, 0.0, 0.0, 0.0],
        UniformValue::Vec2(v) => [v.x, v.y, 0.0, 0.0],
        UniformValue::Vec3(v) => [v.x, v.y, v.z, 0.0],
        UniformValue::Vec4(v) => v.to_array(),
        UniformValue::Mat4(m) => m.x_axis.to_array(),
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
    width: u32,
    height: u32,
}

struct GpuFramebuffer {
    color: RawTexture,
    stencil: Option<(wgpu::Texture, wgpu::TextureView)>,
}

struct GpuProgram {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    source: String,
    params: HashMap<String, UniformLocation>,
    block: UniformBlock,
}

/// Where the screen target comes from
enum ScreenTarget {
    /// Driver-owned texture, for headless rendering
    Owned(wgpu::Texture),
    /// View set by the platform layer each frame
    External(Option<wgpu::TextureView>),
}

struct Screen {
    target: ScreenTarget,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    stencil: (wgpu::Texture, wgpu::TextureView),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: RawProgram,
    blend: BlendMode,
    topology: Topology,
    format: wgpu::TextureFormat,
    stencil: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClipKey {
    op: StencilOp,
    format: wgpu::TextureFormat,
}

struct DrawStep {
    pipeline: PipelineKey,
    viewport: Viewport,
    uniform_offset: u32,
    texture: RawTexture,
    vertex: (RawBuffer, u64),
    index: Option<(RawBuffer, u64)>,
    first: u32,
    count: u32,
    stencil_ref: u32,
}

struct ClipStep {
    key: ClipKey,
    viewport: Viewport,
    first_vertex: u32,
    stencil_ref: u32,
}

enum Step {
    Draw(DrawStep),
    Clip(ClipStep),
}

struct RecordedPass {
    target: Option<RawFramebuffer>,
    clear_color: Option<Color>,
    clear_stencil: bool,
    steps: Vec<Step>,
}

#[derive(Default)]
struct BoundState {
    framebuffer: Option<RawFramebuffer>,
    viewport: Option<Viewport>,
    program: Option<RawProgram>,
    blend: BlendMode,
    texture: Option<RawTexture>,
    vertex: Option<(RawBuffer, u64)>,
    index: Option<(RawBuffer, u64)>,
    stencil_ref: u32,
}

struct Layouts {
    uniforms: wgpu::BindGroupLayout,
    texture: wgpu::BindGroupLayout,
    content: wgpu::PipelineLayout,
    clip: wgpu::PipelineLayout,
    clip_shader: wgpu::ShaderModule,
    sampler: wgpu::Sampler,
}

/// [`GpuDriver`] on top of a wgpu device
pub struct WgpuDriver {
    device: wgpu::Device,
    queue: wgpu::Queue,
    layouts: Layouts,
    screen: Screen,
    next_id: u64,
    buffers: HashMap<RawBuffer, wgpu::Buffer>,
    textures: HashMap<RawTexture, GpuTexture>,
    framebuffers: HashMap<RawFramebuffer, GpuFramebuffer>,
    programs: HashMap<RawProgram, GpuProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    clip_pipelines: HashMap<ClipKey, wgpu::RenderPipeline>,
    texture_groups: HashMap<RawTexture, wgpu::BindGroup>,
    state: BoundState,
    passes: Vec<RecordedPass>,
    uniform_data: Vec<u8>,
    clip_vertices: Vec<[f32; 2]>,
    error: Option<DriverError>,
    uncaptured: Arc<Mutex<Option<String>>>,
    lost: Arc<AtomicBool>,
}

impl WgpuDriver {
    /// Driver rendering into a surface; the platform layer hands over the
    /// current frame's view with [`set_screen_view`](Self::set_screen_view).
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Self {
        let stencil = create_stencil(&device, width, height);
        let screen = Screen {
            target: ScreenTarget::External(None),
            format,
            width,
            height,
            stencil,
        };
        Self::with_screen(device, queue, screen)
    }

    /// Driver with a driver-owned screen texture and no surface
    pub fn headless(width: u32, height: u32) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            dx12_shader_compiler: wgpu::Dx12Compiler::Fxc,
            flags: wgpu::InstanceFlags::default(),
            gles_minor_version: wgpu::Gles3MinorVersion::Automatic,
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow::anyhow!("No suitable GPU adapter found"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Vellum Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))?;

        info!(adapter = ?adapter.get_info().name, "Created headless wgpu device");

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Vellum Screen"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let stencil = create_stencil(&device, width, height);
        let screen = Screen {
            target: ScreenTarget::Owned(texture),
            format: OFFSCREEN_FORMAT,
            width,
            height,
            stencil,
        };
        Ok(Self::with_screen(device, queue, screen))
    }

    fn with_screen(device: wgpu::Device, queue: wgpu::Queue, screen: Screen) -> Self {
        let uncaptured = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&uncaptured);
        device.on_uncaptured_error(Box::new(move |error| {
            let mut slot = slot.lock();
            if slot.is_none() {
                *slot = Some(error.to_string());
            }
        }));

        let layouts = create_layouts(&device);
        Self {
            device,
            queue,
            layouts,
            screen,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            clip_pipelines: HashMap::new(),
            texture_groups: HashMap::new(),
            state: BoundState::default(),
            passes: Vec::new(),
            uniform_data: Vec::new(),
            clip_vertices: Vec::new(),
            error: None,
            uncaptured,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hand over the view of the surface texture acquired for this frame.
    /// A size change rebuilds the screen stencil buffer.
    pub fn set_screen_view(&mut self, view: wgpu::TextureView, width: u32, height: u32) {
        if (width, height) != (self.screen.width, self.screen.height) {
            self.screen.stencil = create_stencil(&self.device, width, height);
            self.screen.width = width;
            self.screen.height = height;
        }
        self.screen.target = ScreenTarget::External(Some(view));
    }

    /// Flag shared with the platform layer; storing `true` reports the
    /// device as lost
    pub fn context_lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lost)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn latch(&mut self, error: DriverError) {
        if self.error.is_none() {
            vellum_error!(LogCategory::Driver, "wgpu driver error: {}", error);
            self.error = Some(error);
        }
    }

    fn check_alive(&self) -> DriverResult<()> {
        if self.is_context_lost() {
            Err(DriverError::ContextLost)
        } else {
            Ok(())
        }
    }

    /// Run `create` inside an out-of-memory error scope
    fn guarded<T>(&self, requested: u64, create: impl FnOnce(&wgpu::Device) -> T) -> DriverResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(_) => Err(DriverError::OutOfMemory { requested }),
            None => Ok(value),
        }
    }

    fn target_format(&self, framebuffer: Option<RawFramebuffer>) -> (wgpu::TextureFormat, bool) {
        match framebuffer.and_then(|fb| self.framebuffers.get(&fb)) {
            Some(fb) => (OFFSCREEN_FORMAT, fb.stencil.is_some()),
            None => (self.screen.format, true),
        }
    }

    fn target_size(&self, framebuffer: Option<RawFramebuffer>) -> (u32, u32) {
        framebuffer
            .and_then(|fb| self.framebuffers.get(&fb))
            .and_then(|fb| self.textures.get(&fb.color))
            .map(|texture| (texture.width, texture.height))
            .unwrap_or((self.screen.width, self.screen.height))
    }

    /// Pass the next step goes into, opening one when the bound target changed
    fn current_pass(&mut self) -> &mut RecordedPass {
        let target = self.state.framebuffer;
        let reopen = self.passes.last().map_or(true, |pass| pass.target != target);
        if reopen {
            self.passes.push(RecordedPass {
                target,
                clear_color: None,
                clear_stencil: false,
                steps: Vec::new(),
            });
        }
        let last = self.passes.len() - 1;
        &mut self.passes[last]
    }

    fn current_viewport(&self) -> Viewport {
        self.state.viewport.unwrap_or_else(|| {
            let (width, height) = self.target_size(self.state.framebuffer);
            Viewport::full(width, height)
        })
    }

    fn push_uniforms(&mut self, block: UniformBlock) -> u32 {
        let offset = self.uniform_data.len();
        self.uniform_data.extend_from_slice(bytemuck::bytes_of(&block));
        self.uniform_data.resize(offset + UNIFORM_STRIDE as usize, 0);
        offset as u32
    }

    fn record_draw(&mut self, topology: Topology, first: u32, count: u32, indexed: bool) {
        let Some(program) = self.state.program else {
            return self.latch(DriverError::InvalidResource("draw without a program".into()));
        };
        let Some(vertex) = self.state.vertex else {
            return self.latch(DriverError::InvalidResource("draw without a vertex buffer".into()));
        };
        let index = if indexed {
            match self.state.index {
                Some(index) => Some(index),
                None => {
                    return self.latch(DriverError::InvalidResource(
                        "indexed draw without an index buffer".into(),
                    ))
                }
            }
        } else {
            None
        };
        let Some(texture) = self.state.texture else {
            return self.latch(DriverError::InvalidResource("draw without a texture".into()));
        };
        let Some(block) = self.programs.get(&program).map(|p| p.block) else {
            return self.latch(DriverError::InvalidResource(format!("program {}", program.0)));
        };

        let (format, stencil) = self.target_format(self.state.framebuffer);
        let step = DrawStep {
            pipeline: PipelineKey {
                program,
                blend: self.state.blend,
                topology,
                format,
                stencil,
            },
            viewport: self.current_viewport(),
            uniform_offset: self.push_uniforms(block),
            texture,
            vertex,
            index,
            first,
            count,
            stencil_ref: self.state.stencil_ref,
        };
        self.current_pass().steps.push(Step::Draw(step));
    }

    fn ensure_pipelines(&mut self) {
        let mut content = Vec::new();
        let mut clips = Vec::new();
        for pass in &self.passes {
            for step in &pass.steps {
                match step {
                    Step::Draw(draw) if !self.pipelines.contains_key(&draw.pipeline) => {
                        content.push(draw.pipeline)
                    }
                    Step::Clip(clip) if !self.clip_pipelines.contains_key(&clip.key) => {
                        clips.push(clip.key)
                    }
                    _ => {}
                }
            }
        }

        for key in content {
            if self.pipelines.contains_key(&key) {
                continue;
            }
            let Some(program) = self.programs.get(&key.program) else {
                continue;
            };
            let pipeline = create_content_pipeline(&self.device, &self.layouts, program, key);
            debug!(?key, "Created content pipeline");
            self.pipelines.insert(key, pipeline);
        }
        for key in clips {
            if self.clip_pipelines.contains_key(&key) {
                continue;
            }
            let pipeline = create_clip_pipeline(&self.device, &self.layouts, key);
            self.clip_pipelines.insert(key, pipeline);
        }
    }

    fn ensure_texture_groups(&mut self) {
        let needed: Vec<RawTexture> = self
            .passes
            .iter()
            .flat_map(|pass| pass.steps.iter())
            .filter_map(|step| match step {
                Step::Draw(draw) => Some(draw.texture),
                Step::Clip(_) => None,
            })
            .filter(|texture| !self.texture_groups.contains_key(texture))
            .collect();

        for raw in needed {
            if self.texture_groups.contains_key(&raw) {
                continue;
            }
            let Some(texture) = self.textures.get(&raw) else {
                continue;
            };
            let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Vellum Texture Bind Group"),
                layout: &self.layouts.texture,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&texture.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.layouts.sampler),
                    },
                ],
            });
            self.texture_groups.insert(raw, group);
        }
    }

    #[instrument(skip(self), fields(passes = self.passes.len()))]
    fn submit(&mut self) -> DriverResult<()> {
        self.check_alive()?;
        if self.passes.is_empty() {
            return Ok(());
        }
        self.ensure_pipelines();
        self.ensure_texture_groups();

        let passes = std::mem::take(&mut self.passes);
        let uniform_data = std::mem::take(&mut self.uniform_data);
        let clip_vertices = std::mem::take(&mut self.clip_vertices);

        let uniform_buffer = (!uniform_data.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Vellum Frame Uniforms"),
                contents: &uniform_data,
                usage: wgpu::BufferUsages::UNIFORM,
            })
        });
        let uniform_group = uniform_buffer.as_ref().map(|buffer| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Vellum Uniform Bind Group"),
                layout: &self.layouts.uniforms,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size: NonZeroU64::new(std::mem::size_of::<UniformBlock>() as u64),
                    }),
                }],
            })
        });
        let clip_buffer = (!clip_vertices.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Vellum Clip Vertices"),
                contents: bytemuck::cast_slice(&clip_vertices),
                usage: wgpu::BufferUsages::VERTEX,
            })
        });

        let owned_view = match &self.screen.target {
            ScreenTarget::Owned(texture) => {
                Some(texture.create_view(&wgpu::TextureViewDescriptor::default()))
            }
            ScreenTarget::External(_) => None,
        };
        let screen_view = match &self.screen.target {
            ScreenTarget::Owned(_) => owned_view.as_ref(),
            ScreenTarget::External(view) => view.as_ref(),
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Vellum Frame Encoder"),
        });

        let mut failure = None;
        for pass in &passes {
            let (color_view, stencil_view) = match pass.target {
                Some(fb) => {
                    let Some(framebuffer) = self.framebuffers.get(&fb) else {
                        failure.get_or_insert(DriverError::InvalidResource(format!("framebuffer {}", fb.0)));
                        continue;
                    };
                    let Some(color) = self.textures.get(&framebuffer.color) else {
                        continue;
                    };
                    (&color.view, framebuffer.stencil.as_ref().map(|(_, view)| view))
                }
                None => {
                    let Some(view) = screen_view else {
                        failure.get_or_insert(DriverError::InvalidResource(
                            "no screen view for this frame".into(),
                        ));
                        continue;
                    };
                    (view, Some(&self.screen.stencil.1))
                }
            };

            let load = match pass.clear_color {
                Some(color) => wgpu::LoadOp::Clear(wgpu::Color {
                    r: color.r as f64,
                    g: color.g as f64,
                    b: color.b as f64,
                    a: color.a as f64,
                }),
                None => wgpu::LoadOp::Load,
            };
            let stencil_load = if pass.clear_stencil {
                wgpu::LoadOp::Clear(0)
            } else {
                wgpu::LoadOp::Load
            };

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Vellum Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: stencil_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(1.0),
                            store: wgpu::StoreOp::Discard,
                        }),
                        stencil_ops: Some(wgpu::Operations {
                            load: stencil_load,
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for step in &pass.steps {
                match step {
                    Step::Draw(draw) => {
                        let (Some(pipeline), Some(texture_group), Some(uniform_group)) = (
                            self.pipelines.get(&draw.pipeline),
                            self.texture_groups.get(&draw.texture),
                            uniform_group.as_ref(),
                        ) else {
                            continue;
                        };
                        let Some(vertex_buffer) = self.buffers.get(&draw.vertex.0) else {
                            continue;
                        };
                        set_viewport(&mut render_pass, draw.viewport);
                        render_pass.set_pipeline(pipeline);
                        render_pass.set_bind_group(0, uniform_group, &[draw.uniform_offset]);
                        render_pass.set_bind_group(1, texture_group, &[]);
                        render_pass.set_stencil_reference(draw.stencil_ref);
                        render_pass.set_vertex_buffer(0, vertex_buffer.slice(draw.vertex.1..));
                        match draw.index {
                            Some((index, offset)) => {
                                let Some(index_buffer) = self.buffers.get(&index) else {
                                    continue;
                                };
                                render_pass.set_index_buffer(
                                    index_buffer.slice(offset..),
                                    wgpu::IndexFormat::Uint32,
                                );
                                render_pass.draw_indexed(draw.first..draw.first + draw.count, 0, 0..1);
                            }
                            None => render_pass.draw(draw.first..draw.first + draw.count, 0..1),
                        }
                    }
                    Step::Clip(clip) => {
                        let (Some(pipeline), Some(buffer)) =
                            (self.clip_pipelines.get(&clip.key), clip_buffer.as_ref())
                        else {
                            continue;
                        };
                        set_viewport(&mut render_pass, clip.viewport);
                        render_pass.set_pipeline(pipeline);
                        render_pass.set_stencil_reference(clip.stencil_ref);
                        render_pass.set_vertex_buffer(0, buffer.slice(..));
                        render_pass.draw(clip.first_vertex..clip.first_vertex + 6, 0..1);
                    }
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(error) = failure {
            self.latch(error);
        }
        Ok(())
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: width.max(1),
        height: height.max(1),
        depth_or_array_layers: 1,
    }
}

fn create_stencil(device: &wgpu::Device, width: u32, height: u32) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Vellum Stencil"),
        size: extent(width, height),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: STENCIL_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn set_viewport(pass: &mut wgpu::RenderPass<'_>, viewport: Viewport) {
    pass.set_viewport(
        viewport.x as f32,
        viewport.y as f32,
        viewport.width.max(1) as f32,
        viewport.height.max(1) as f32,
        0.0,
        1.0,
    );
}

fn create_layouts(device: &wgpu::Device) -> Layouts {
    let uniforms = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Vellum Uniform Layout"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: NonZeroU64::new(std::mem::size_of::<UniformBlock>() as u64),
            },
            count: None,
        }],
    });

    let texture = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Vellum Texture Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });

    let content = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Vellum Content Pipeline Layout"),
        bind_group_layouts: &[&uniforms, &texture],
        push_constant_ranges: &[],
    });
    let clip = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Vellum Clip Pipeline Layout"),
        bind_group_layouts: &[],
        push_constant_ranges: &[],
    });
    let clip_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Vellum Clip Shader"),
        source: wgpu::ShaderSource::Wgsl(CLIP_SHADER.into()),
    });
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("Vellum Sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });

    Layouts {
        uniforms,
        texture,
        content,
        clip,
        clip_shader,
        sampler,
    }
}

fn blend_state(mode: BlendMode) -> wgpu::BlendState {
    match mode {
        BlendMode::Alpha => wgpu::BlendState::ALPHA_BLENDING,
        BlendMode::PremultipliedAlpha => wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
        BlendMode::Opaque => wgpu::BlendState::REPLACE,
        BlendMode::Additive => wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
        },
    }
}

fn primitive(topology: Topology) -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: match topology {
            Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
            Topology::Lines => wgpu::PrimitiveTopology::LineList,
            Topology::Points => wgpu::PrimitiveTopology::PointList,
        },
        strip_index_format: None,
        front_face: wgpu::FrontFace::Ccw,
        cull_mode: None,
        unclipped_depth: false,
        polygon_mode: wgpu::PolygonMode::Fill,
        conservative: false,
    }
}

fn stencil_state(pass_op: wgpu::StencilOperation, write_mask: u32) -> wgpu::DepthStencilState {
    let face = wgpu::StencilFaceState {
        compare: wgpu::CompareFunction::Equal,
        fail_op: wgpu::StencilOperation::Keep,
        depth_fail_op: wgpu::StencilOperation::Keep,
        pass_op,
    };
    wgpu::DepthStencilState {
        format: STENCIL_FORMAT,
        depth_write_enabled: false,
        depth_compare: wgpu::CompareFunction::Always,
        stencil: wgpu::StencilState {
            front: face,
            back: face,
            read_mask: 0xff,
            write_mask,
        },
        bias: wgpu::DepthBiasState::default(),
    }
}

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
const CLIP_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];

fn create_content_pipeline(
    device: &wgpu::Device,
    layouts: &Layouts,
    program: &GpuProgram,
    key: PipelineKey,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Vellum Content Pipeline"),
        layout: Some(&layouts.content),
        vertex: wgpu::VertexState {
            module: &program.vertex,
            entry_point: "vs_main",
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: Vertex::STRIDE,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &VERTEX_ATTRIBUTES,
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &program.fragment,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format: key.format,
                blend: Some(blend_state(key.blend)),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: primitive(key.topology),
        depth_stencil: key
            .stencil
            .then(|| stencil_state(wgpu::StencilOperation::Keep, 0)),
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
    })
}

fn create_clip_pipeline(device: &wgpu::Device, layouts: &Layouts, key: ClipKey) -> wgpu::RenderPipeline {
    let pass_op = match key.op {
        StencilOp::Increment => wgpu::StencilOperation::IncrementClamp,
        StencilOp::Decrement => wgpu::StencilOperation::DecrementClamp,
    };
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Vellum Clip Pipeline"),
        layout: Some(&layouts.clip),
        vertex: wgpu::VertexState {
            module: &layouts.clip_shader,
            entry_point: "vs_main",
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 2]>() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &CLIP_ATTRIBUTES,
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &layouts.clip_shader,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format: key.format,
                blend: None,
                write_mask: wgpu::ColorWrites::empty(),
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: primitive(Topology::Triangles),
        depth_stencil: Some(stencil_state(pass_op, 0xff)),
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
    })
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
    }
}

/// `queue.write_buffer` wants sizes in multiples of four
fn padded(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    if data.len() % align == 0 {
        std::borrow::Cow::Borrowed(data)
    } else {
        let mut owned = data.to_vec();
        owned.resize(data.len().next_multiple_of(align), 0);
        std::borrow::Cow::Owned(owned)
    }
}

impl GpuDriver for WgpuDriver {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn screen_size(&self) -> (u32, u32) {
        (self.screen.width, self.screen.height)
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DriverResult<RawBuffer> {
        self.check_alive()?;
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;
        let aligned = size.max(1).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.guarded(size, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Vellum Pool Page"),
                size: aligned,
                usage,
                mapped_at_creation: false,
            })
        })?;
        let id = RawBuffer(self.next_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) -> DriverResult<()> {
        self.check_alive()?;
        let target = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| DriverError::InvalidResource(format!("buffer {}", buffer.0)))?;
        let data = padded(data);
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + data.len() as u64 > target.size() {
            return Err(DriverError::InvalidResource(format!(
                "write of {} bytes at {} into buffer {}",
                data.len(),
                offset,
                buffer.0
            )));
        }
        self.queue.write_buffer(target, offset, &data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RawTexture> {
        self.check_alive()?;
        let texture = self.guarded(format.image_size(width, height), |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Vellum Texture"),
                size: extent(width, height),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu_format(format),
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = RawTexture(self.next_id());
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                format,
                width,
                height,
            },
        );
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: RawTexture,
        region: TextureRegion,
        data: &[u8],
    ) -> DriverResult<()> {
        self.check_alive()?;
        let target = self
            .textures
            .get(&texture)
            .ok_or_else(|| DriverError::InvalidResource(format!("texture {}", texture.0)))?;
        let expected = target.format.image_size(region.width, region.height);
        if data.len() as u64 != expected
            || region.x + region.width > target.width
            || region.y + region.height > target.height
        {
            return Err(DriverError::InvalidResource(format!(
                "texture write of {} bytes to {:?}",
                data.len(),
                region
            )));
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: region.x,
                    y: region.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(region.width * target.format.bytes_per_pixel()),
                rows_per_image: Some(region.height),
            },
            extent(region.width, region.height),
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: RawTexture) {
        self.texture_groups.remove(&texture);
        if let Some(texture) = self.textures.remove(&texture) {
            texture.texture.destroy();
        }
    }

    fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        stencil: bool,
    ) -> DriverResult<(RawFramebuffer, RawTexture)> {
        self.check_alive()?;
        let color = self.guarded(TextureFormat::Rgba8.image_size(width, height), |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Vellum Offscreen Color"),
                size: extent(width, height),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: OFFSCREEN_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })?;
        let stencil = stencil.then(|| create_stencil(&self.device, width, height));

        let color_id = RawTexture(self.next_id());
        let view = color.create_view(&wgpu::TextureViewDescriptor::default());
        self.textures.insert(
            color_id,
            GpuTexture {
                texture: color,
                view,
                format: TextureFormat::Rgba8,
                width,
                height,
            },
        );
        let id = RawFramebuffer(self.next_id());
        self.framebuffers.insert(
            id,
            GpuFramebuffer {
                color: color_id,
                stencil,
            },
        );
        Ok((id, color_id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        if let Some(fb) = self.framebuffers.remove(&framebuffer) {
            self.destroy_texture(fb.color);
            if let Some((texture, _)) = fb.stencil {
                texture.destroy();
            }
        }
        if self.state.framebuffer == Some(framebuffer) {
            self.state.framebuffer = None;
        }
    }

    fn compile_program(&mut self, vertex: &str, fragment: &str) -> DriverResult<RawProgram> {
        self.check_alive()?;
        for (stage, source, entry) in [("vertex", vertex, "fn vs_main"), ("fragment", fragment, "fn fs_main")] {
            if !source.contains(entry) {
                return Err(DriverError::ShaderCompile(format!(
                    "{} stage has no `{}` entry point",
                    stage,
                    entry.trim_start_matches("fn ")
                )));
            }
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vertex_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vellum Vertex Stage"),
            source: wgpu::ShaderSource::Wgsl(vertex.into()),
        });
        let fragment_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vellum Fragment Stage"),
            source: wgpu::ShaderSource::Wgsl(fragment.into()),
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DriverError::ShaderCompile(error.to_string()));
        }

        let id = RawProgram(self.next_id());
        self.programs.insert(
            id,
            GpuProgram {
                vertex: vertex_module,
                fragment: fragment_module,
                source: format!("{vertex}\n{fragment}"),
                params: HashMap::new(),
                block: UniformBlock::default(),
            },
        );
        debug!(program = id.0, "Compiled wgpu program");
        Ok(id)
    }

    fn uniform_location(&mut self, program: RawProgram, name: &str) -> Option<UniformLocation> {
        match name {
            PROJECTION_UNIFORM => return Some(UniformLocation(0)),
            MODELVIEW_UNIFORM => return Some(UniformLocation(1)),
            COLOR_UNIFORM => return Some(UniformLocation(2)),
            _ => {}
        }
        let program = self.programs.get_mut(&program)?;
        if let Some(location) = program.params.get(name) {
            return Some(*location);
        }
        if !program.source.contains(name) || program.params.len() as u32 >= PARAM_SLOTS {
            return None;
        }
        let location = UniformLocation(FIRST_PARAM + program.params.len() as u32);
        program.params.insert(name.to_string(), location);
        Some(location)
    }

    fn destroy_program(&mut self, program: RawProgram) {
        self.programs.remove(&program);
        self.pipelines.retain(|key, _| key.program != program);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<RawFramebuffer>) {
        if let Some(fb) = framebuffer {
            if !self.framebuffers.contains_key(&fb) {
                return self.latch(DriverError::InvalidResource(format!("framebuffer {}", fb.0)));
            }
        }
        self.state.framebuffer = framebuffer;
        self.state.viewport = None;
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = Some(viewport);
    }

    fn use_program(&mut self, program: RawProgram) {
        if !self.programs.contains_key(&program) {
            return self.latch(DriverError::InvalidResource(format!("program {}", program.0)));
        }
        self.state.program = Some(program);
    }

    fn set_uniform(&mut self, program: RawProgram, location: UniformLocation, value: &UniformValue) {
        match self.programs.get_mut(&program) {
            Some(program) => program.block.set(location, value),
            None => self.latch(DriverError::InvalidResource(format!("program {}", program.0))),
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: RawTexture) {
        if !self.textures.contains_key(&texture) {
            return self.latch(DriverError::InvalidResource(format!("texture {}", texture.0)));
        }
        // The default pipeline layout samples a single texture
        if unit == 0 {
            self.state.texture = Some(texture);
        }
    }

    fn set_blend(&mut self, mode: BlendMode) {
        self.state.blend = mode;
    }

    fn bind_vertex_buffer(&mut self, buffer: RawBuffer, offset: u64) {
        if !self.buffers.contains_key(&buffer) {
            return self.latch(DriverError::InvalidResource(format!("buffer {}", buffer.0)));
        }
        self.state.vertex = Some((buffer, offset));
    }

    fn bind_index_buffer(&mut self, buffer: RawBuffer, offset: u64) {
        if !self.buffers.contains_key(&buffer) {
            return self.latch(DriverError::InvalidResource(format!("buffer {}", buffer.0)));
        }
        self.state.index = Some((buffer, offset));
    }

    fn clear(&mut self, color: Option<Color>, stencil: bool) {
        let target = self.state.framebuffer;
        let fresh = self
            .passes
            .last()
            .map_or(false, |pass| pass.target == target && pass.steps.is_empty());
        if !fresh {
            self.passes.push(RecordedPass {
                target,
                clear_color: None,
                clear_stencil: false,
                steps: Vec::new(),
            });
        }
        let pass = self.current_pass();
        if color.is_some() {
            pass.clear_color = color;
        }
        pass.clear_stencil |= stencil;
    }

    fn set_stencil_ref(&mut self, depth: u32) {
        self.state.stencil_ref = depth;
    }

    fn draw_stencil_quad(&mut self, quad: &[Vec2; 4], op: StencilOp) {
        let (format, stencil) = self.target_format(self.state.framebuffer);
        if !stencil {
            return self.latch(DriverError::InvalidResource(
                "stencil quad on a target without stencil".into(),
            ));
        }
        let viewport = self.current_viewport();
        let ndc = |p: Vec2| {
            [
                p.x / viewport.width.max(1) as f32 * 2.0 - 1.0,
                1.0 - p.y / viewport.height.max(1) as f32 * 2.0,
            ]
        };
        let first_vertex = self.clip_vertices.len() as u32;
        for index in [0, 1, 2, 0, 2, 3] {
            self.clip_vertices.push(ndc(quad[index]));
        }
        let step = ClipStep {
            key: ClipKey { op, format },
            viewport,
            first_vertex,
            stencil_ref: self.state.stencil_ref,
        };
        self.current_pass().steps.push(Step::Clip(step));
    }

    fn draw(&mut self, topology: Topology, first: u32, count: u32) {
        self.record_draw(topology, first, count, false);
    }

    fn draw_indexed(&mut self, topology: Topology, first: u32, count: u32) {
        self.record_draw(topology, first, count, true);
    }

    fn flush(&mut self) -> DriverResult<()> {
        self.submit()
    }

    fn present(&mut self) -> DriverResult<()> {
        self.submit()?;
        // Surface views are single-use; the platform presents the surface texture
        if let ScreenTarget::External(view) = &mut self.screen.target {
            *view = None;
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<DriverError> {
        if let Some(error) = self.error.take() {
            return Some(error);
        }
        if self.is_context_lost() {
            return Some(DriverError::ContextLost);
        }
        self.uncaptured.lock().take().map(DriverError::Backend)
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn test_uniform_block_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<UniformBlock>(), 208);
        assert!(std::mem::size_of::<UniformBlock>() as u64 <= UNIFORM_STRIDE);
    }

    #[test]
    fn test_uniform_block_slots() {
        let mut block = UniformBlock::default();
        let projection = Mat4::orthographic_rh(0.0, 100.0, 50.0, 0.0, -1.0, 1.0);
        block.set(UniformLocation(0), &UniformValue::Mat4(projection));
        block.set(UniformLocation(2), &Color::RED.into());
        block.set(UniformLocation(FIRST_PARAM + 1), &UniformValue::Float(0.5));
        block.set(UniformLocation(FIRST_PARAM + PARAM_SLOTS), &UniformValue::Float(9.0));

        assert_eq!(block.projection, projection.to_cols_array_2d());
        assert_eq!(block.modelview, Mat4::IDENTITY.to_cols_array_2d());
        assert_eq!(block.color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(block.params[1], [0.5, 0.0, 0.0, 0.0]);
        assert_eq!(block.params[0], [0.0; 4]);
    }

    #[test]
    fn test_vector_widening() {
        assert_eq!(vector(&UniformValue::Int(3)), [3.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            vector(&UniformValue::Vec4(Vec4::new(1.0, 2.0, 3.0, 4.0))),
            [1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_padded_writes() {
        assert_eq!(padded(&[1, 2, 3, 4]).len(), 4);
        assert_eq!(&*padded(&[1, 2, 3, 4, 5]), &[1, 2, 3, 4, 5, 0, 0, 0]);
    }
}
