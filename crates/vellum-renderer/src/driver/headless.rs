//! Recording driver without a GPU
//!
//! Every call is appended to a log, resources live in host memory and a
//! memory limit can be imposed to exercise out-of-memory paths. Programs
//! are "compiled" by checking for the `vs_main`/`fs_main` entry points.
//! A [`HeadlessProbe`] shares the driver state so tests can inspect calls,
//! lose the context or inject errors while the driver itself is owned by a
//! [`GpuContext`](crate::context::GpuContext).

use super::*;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// One recorded driver call
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    CreateBuffer { id: RawBuffer, kind: BufferKind, size: u64 },
    WriteBuffer { id: RawBuffer, offset: u64, len: usize },
    DestroyBuffer(RawBuffer),
    CreateTexture { id: RawTexture, width: u32, height: u32 },
    WriteTexture { id: RawTexture, region: TextureRegion },
    DestroyTexture(RawTexture),
    CreateFramebuffer { id: RawFramebuffer, width: u32, height: u32, stencil: bool },
    DestroyFramebuffer(RawFramebuffer),
    CompileProgram { result: Result<RawProgram, String> },
    DestroyProgram(RawProgram),
    BindFramebuffer(Option<RawFramebuffer>),
    SetViewport(Viewport),
    UseProgram(RawProgram),
    SetUniform { program: RawProgram, location: UniformLocation, value: UniformValue },
    BindTexture { unit: u32, texture: RawTexture },
    SetBlend(BlendMode),
    BindVertexBuffer { buffer: RawBuffer, offset: u64 },
    BindIndexBuffer { buffer: RawBuffer, offset: u64 },
    Clear { color: Option<Color>, stencil: bool },
    SetStencilRef(u32),
    StencilQuad { quad: [Vec2; 4], op: StencilOp },
    Draw { topology: Topology, first: u32, count: u32 },
    DrawIndexed { topology: Topology, first: u32, count: u32 },
    Flush,
    Present,
}

impl DriverCall {
    /// Whether the call changes bound state rather than resources or output
    pub fn is_state_change(&self) -> bool {
        matches!(
            self,
            DriverCall::BindFramebuffer(_)
                | DriverCall::SetViewport(_)
                | DriverCall::UseProgram(_)
                | DriverCall::SetUniform { .. }
                | DriverCall::BindTexture { .. }
                | DriverCall::SetBlend(_)
                | DriverCall::BindVertexBuffer { .. }
                | DriverCall::BindIndexBuffer { .. }
                | DriverCall::SetStencilRef(_)
        )
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, DriverCall::Draw { .. } | DriverCall::DrawIndexed { .. })
    }
}

#[derive(Debug)]
struct HostTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
}

#[derive(Debug)]
struct HostProgram {
    vertex: String,
    fragment: String,
    uniforms: HashMap<String, UniformLocation>,
    values: HashMap<UniformLocation, UniformValue>,
}

#[derive(Debug)]
struct HostFramebuffer {
    texture: RawTexture,
    stencil: bool,
}

/// Shared state behind a [`HeadlessDriver`]
#[derive(Debug)]
pub struct HeadlessState {
    screen: (u32, u32),
    next_id: u64,
    calls: Vec<DriverCall>,
    recording: bool,
    buffers: HashMap<RawBuffer, (BufferKind, Vec<u8>)>,
    textures: HashMap<RawTexture, HostTexture>,
    framebuffers: HashMap<RawFramebuffer, HostFramebuffer>,
    programs: HashMap<RawProgram, HostProgram>,
    memory_limit: Option<u64>,
    memory_used: u64,
    context_lost: bool,
    pending_error: Option<DriverError>,
    fail_next_draw: Option<DriverError>,
    bound_program: Option<RawProgram>,
    bound_vertex: Option<(RawBuffer, u64)>,
    bound_index: Option<(RawBuffer, u64)>,
    bound_framebuffer: Option<RawFramebuffer>,
    stencil_depth: u32,
    presents: u64,
}

impl HeadlessState {
    fn new(width: u32, height: u32) -> Self {
        Self {
            screen: (width, height),
            next_id: 1,
            calls: Vec::new(),
            recording: true,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            memory_limit: None,
            memory_used: 0,
            context_lost: false,
            pending_error: None,
            fail_next_draw: None,
            bound_program: None,
            bound_vertex: None,
            bound_index: None,
            bound_framebuffer: None,
            stencil_depth: 0,
            presents: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, call: DriverCall) {
        if self.recording {
            self.calls.push(call);
        }
    }

    fn latch(&mut self, error: DriverError) {
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
    }

    fn check_alive(&self) -> DriverResult<()> {
        if self.context_lost {
            Err(DriverError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn reserve(&mut self, bytes: u64) -> DriverResult<()> {
        if let Some(limit) = self.memory_limit {
            if self.memory_used + bytes > limit {
                return Err(DriverError::OutOfMemory { requested: bytes });
            }
        }
        self.memory_used += bytes;
        Ok(())
    }

    fn free(&mut self, bytes: u64) {
        self.memory_used = self.memory_used.saturating_sub(bytes);
    }

    fn validate_draw(&mut self, indexed: bool, first: u32, count: u32) {
        if let Some(error) = self.fail_next_draw.take() {
            self.latch(error);
            return;
        }
        if self.context_lost {
            self.latch(DriverError::ContextLost);
            return;
        }
        if !self
            .bound_program
            .is_some_and(|program| self.programs.contains_key(&program))
        {
            self.latch(DriverError::InvalidResource(
                "draw without a linked program".to_string(),
            ));
            return;
        }
        if !self
            .bound_vertex
            .is_some_and(|(buffer, _)| self.buffers.contains_key(&buffer))
        {
            self.latch(DriverError::InvalidResource(
                "draw without a vertex buffer".to_string(),
            ));
            return;
        }
        if indexed {
            let in_range = self.bound_index.and_then(|(buffer, offset)| {
                self.buffers.get(&buffer).map(|(_, data)| {
                    offset + (first as u64 + count as u64) * 4 <= data.len() as u64
                })
            });
            if in_range != Some(true) {
                self.latch(DriverError::InvalidResource(format!(
                    "indexed draw of {} indices at {} outside the bound index buffer",
                    count, first
                )));
            }
        }
    }
}

/// Cloneable view into a [`HeadlessDriver`]'s state
#[derive(Debug, Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock()
    }

    /// Copy of the call log
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    /// Return the call log and start a new one
    pub fn take_calls(&self) -> Vec<DriverCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Stop or resume recording calls
    pub fn set_recording(&self, recording: bool) {
        self.lock().recording = recording;
    }

    pub fn count_calls(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn draw_count(&self) -> usize {
        self.count_calls(DriverCall::is_draw)
    }

    pub fn state_change_count(&self) -> usize {
        self.count_calls(DriverCall::is_state_change)
    }

    pub fn presents(&self) -> u64 {
        self.lock().presents
    }

    /// Limit the bytes of buffers and textures the driver will hold
    pub fn set_memory_limit(&self, limit: Option<u64>) {
        self.lock().memory_limit = limit;
    }

    pub fn memory_used(&self) -> u64 {
        self.lock().memory_used
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.lock().textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.lock().framebuffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.lock().programs.len()
    }

    /// Bytes currently stored in a buffer
    pub fn buffer_contents(&self, buffer: RawBuffer) -> Option<Vec<u8>> {
        self.lock().buffers.get(&buffer).map(|(_, data)| data.clone())
    }

    /// Last value set for a uniform of a program
    pub fn uniform_value(&self, program: RawProgram, name: &str) -> Option<UniformValue> {
        let state = self.lock();
        let host = state.programs.get(&program)?;
        let location = host.uniforms.get(name)?;
        host.values.get(location).copied()
    }

    /// Drop every resource and fail all calls until [`restore_context`](Self::restore_context)
    pub fn lose_context(&self) {
        let mut state = self.lock();
        state.context_lost = true;
        state.buffers.clear();
        state.textures.clear();
        state.framebuffers.clear();
        state.programs.clear();
        state.memory_used = 0;
        state.bound_program = None;
        state.bound_vertex = None;
        state.bound_index = None;
        state.bound_framebuffer = None;
    }

    pub fn restore_context(&self) {
        self.lock().context_lost = false;
    }

    /// Latch an error as if the driver had reported it asynchronously
    pub fn inject_error(&self, error: DriverError) {
        self.lock().latch(error);
    }

    /// Make the next draw latch the given error
    pub fn fail_next_draw(&self, error: DriverError) {
        self.lock().fail_next_draw = Some(error);
    }

    pub fn stencil_depth(&self) -> u32 {
        self.lock().stencil_depth
    }

    pub fn bound_framebuffer(&self) -> Option<RawFramebuffer> {
        self.lock().bound_framebuffer
    }

    pub fn set_screen_size(&self, width: u32, height: u32) {
        self.lock().screen = (width, height);
    }
}

/// Driver that records calls instead of talking to hardware
#[derive(Debug)]
pub struct HeadlessDriver {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessDriver {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeadlessState::new(width, height))),
        }
    }

    /// Driver plus a probe into its state
    pub fn with_probe(width: u32, height: u32) -> (Self, HeadlessProbe) {
        let driver = Self::new(width, height);
        let probe = driver.probe();
        (driver, probe)
    }

    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock()
    }
}

fn missing_entry_point(stage: &str, source: &str, entry: &str) -> Option<String> {
    if source.contains(&format!("fn {}", entry)) {
        None
    } else {
        Some(format!("{} shader: missing entry point `{}`", stage, entry))
    }
}

impl GpuDriver for HeadlessDriver {
    fn name(&self) -> &str {
        "headless"
    }

    fn screen_size(&self) -> (u32, u32) {
        self.lock().screen
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DriverResult<RawBuffer> {
        let mut state = self.lock();
        state.check_alive()?;
        state.reserve(size)?;
        let id = RawBuffer(state.next_id());
        state.buffers.insert(id, (kind, vec![0; size as usize]));
        state.record(DriverCall::CreateBuffer { id, kind, size });
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) -> DriverResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        let (_, storage) = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| DriverError::InvalidResource(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            return Err(DriverError::InvalidResource(format!(
                "write of {} bytes at {} past the end of buffer {}",
                data.len(),
                offset,
                buffer.0
            )));
        }
        storage[start..end].copy_from_slice(data);
        state.record(DriverCall::WriteBuffer {
            id: buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        let mut state = self.lock();
        if let Some((_, data)) = state.buffers.remove(&buffer) {
            state.free(data.len() as u64);
        }
        state.record(DriverCall::DestroyBuffer(buffer));
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RawTexture> {
        let mut state = self.lock();
        state.check_alive()?;
        let size = format.image_size(width, height);
        state.reserve(size)?;
        let id = RawTexture(state.next_id());
        state.textures.insert(
            id,
            HostTexture {
                width,
                height,
                format,
                data: vec![0; size as usize],
            },
        );
        state.record(DriverCall::CreateTexture { id, width, height });
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: RawTexture,
        region: TextureRegion,
        data: &[u8],
    ) -> DriverResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        let host = state
            .textures
            .get_mut(&texture)
            .ok_or_else(|| DriverError::InvalidResource(format!("texture {}", texture.0)))?;
        let bpp = host.format.bytes_per_pixel() as usize;
        if region.x + region.width > host.width
            || region.y + region.height > host.height
            || data.len() != region.width as usize * region.height as usize * bpp
        {
            return Err(DriverError::InvalidResource(format!(
                "region {:?} does not fit texture {}",
                region, texture.0
            )));
        }
        let row_bytes = region.width as usize * bpp;
        let stride = host.width as usize * bpp;
        for (row, chunk) in data.chunks_exact(row_bytes).enumerate() {
            let start = (region.y as usize + row) * stride + region.x as usize * bpp;
            host.data[start..start + row_bytes].copy_from_slice(chunk);
        }
        state.record(DriverCall::WriteTexture {
            id: texture,
            region,
        });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: RawTexture) {
        let mut state = self.lock();
        if let Some(host) = state.textures.remove(&texture) {
            state.free(host.data.len() as u64);
        }
        state.record(DriverCall::DestroyTexture(texture));
    }

    fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        stencil: bool,
    ) -> DriverResult<(RawFramebuffer, RawTexture)> {
        let texture = self.create_texture(width, height, TextureFormat::Rgba8)?;
        let mut state = self.lock();
        let id = RawFramebuffer(state.next_id());
        state
            .framebuffers
            .insert(id, HostFramebuffer { texture, stencil });
        state.record(DriverCall::CreateFramebuffer {
            id,
            width,
            height,
            stencil,
        });
        Ok((id, texture))
    }

    fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer) {
        let texture = {
            let mut state = self.lock();
            state.record(DriverCall::DestroyFramebuffer(framebuffer));
            if state.bound_framebuffer == Some(framebuffer) {
                state.bound_framebuffer = None;
            }
            state.framebuffers.remove(&framebuffer).map(|fb| fb.texture)
        };
        if let Some(texture) = texture {
            self.destroy_texture(texture);
        }
    }

    fn compile_program(&mut self, vertex: &str, fragment: &str) -> DriverResult<RawProgram> {
        let mut state = self.lock();
        state.check_alive()?;
        let diagnostic = missing_entry_point("vertex", vertex, "vs_main")
            .or_else(|| missing_entry_point("fragment", fragment, "fs_main"));
        if let Some(diagnostic) = diagnostic {
            state.record(DriverCall::CompileProgram {
                result: Err(diagnostic.clone()),
            });
            return Err(DriverError::ShaderCompile(diagnostic));
        }

        let id = RawProgram(state.next_id());
        state.programs.insert(
            id,
            HostProgram {
                vertex: vertex.to_string(),
                fragment: fragment.to_string(),
                uniforms: HashMap::new(),
                values: HashMap::new(),
            },
        );
        state.record(DriverCall::CompileProgram { result: Ok(id) });
        Ok(id)
    }

    fn uniform_location(&mut self, program: RawProgram, name: &str) -> Option<UniformLocation> {
        let mut state = self.lock();
        let host = state.programs.get_mut(&program)?;
        if let Some(location) = host.uniforms.get(name) {
            return Some(*location);
        }
        if !host.vertex.contains(name) && !host.fragment.contains(name) {
            return None;
        }
        let location = UniformLocation(host.uniforms.len() as u32);
        host.uniforms.insert(name.to_string(), location);
        Some(location)
    }

    fn destroy_program(&mut self, program: RawProgram) {
        let mut state = self.lock();
        state.programs.remove(&program);
        if state.bound_program == Some(program) {
            state.bound_program = None;
        }
        state.record(DriverCall::DestroyProgram(program));
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<RawFramebuffer>) {
        let mut state = self.lock();
        if let Some(fb) = framebuffer {
            if !state.framebuffers.contains_key(&fb) {
                state.latch(DriverError::InvalidResource(format!("framebuffer {}", fb.0)));
            }
        }
        state.bound_framebuffer = framebuffer;
        state.record(DriverCall::BindFramebuffer(framebuffer));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.lock().record(DriverCall::SetViewport(viewport));
    }

    fn use_program(&mut self, program: RawProgram) {
        let mut state = self.lock();
        state.bound_program = Some(program);
        state.record(DriverCall::UseProgram(program));
    }

    fn set_uniform(&mut self, program: RawProgram, location: UniformLocation, value: &UniformValue) {
        let mut state = self.lock();
        match state.programs.get_mut(&program) {
            Some(host) => {
                host.values.insert(location, *value);
            }
            None => state.latch(DriverError::InvalidResource(format!(
                "uniform on program {}",
                program.0
            ))),
        }
        state.record(DriverCall::SetUniform {
            program,
            location,
            value: *value,
        });
    }

    fn bind_texture(&mut self, unit: u32, texture: RawTexture) {
        let mut state = self.lock();
        if !state.textures.contains_key(&texture) {
            state.latch(DriverError::InvalidResource(format!("texture {}", texture.0)));
        }
        state.record(DriverCall::BindTexture { unit, texture });
    }

    fn set_blend(&mut self, mode: BlendMode) {
        self.lock().record(DriverCall::SetBlend(mode));
    }

    fn bind_vertex_buffer(&mut self, buffer: RawBuffer, offset: u64) {
        let mut state = self.lock();
        state.bound_vertex = Some((buffer, offset));
        state.record(DriverCall::BindVertexBuffer { buffer, offset });
    }

    fn bind_index_buffer(&mut self, buffer: RawBuffer, offset: u64) {
        let mut state = self.lock();
        state.bound_index = Some((buffer, offset));
        state.record(DriverCall::BindIndexBuffer { buffer, offset });
    }

    fn clear(&mut self, color: Option<Color>, stencil: bool) {
        self.lock().record(DriverCall::Clear { color, stencil });
    }

    fn set_stencil_ref(&mut self, depth: u32) {
        let mut state = self.lock();
        state.stencil_depth = depth;
        state.record(DriverCall::SetStencilRef(depth));
    }

    fn draw_stencil_quad(&mut self, quad: &[Vec2; 4], op: StencilOp) {
        let mut state = self.lock();
        let has_stencil = match state.bound_framebuffer {
            None => true,
            Some(fb) => state.framebuffers.get(&fb).is_some_and(|fb| fb.stencil),
        };
        if !has_stencil {
            state.latch(DriverError::InvalidResource(
                "clip on a target without stencil".to_string(),
            ));
        }
        state.record(DriverCall::StencilQuad { quad: *quad, op });
    }

    fn draw(&mut self, topology: Topology, first: u32, count: u32) {
        let mut state = self.lock();
        state.validate_draw(false, first, count);
        state.record(DriverCall::Draw {
            topology,
            first,
            count,
        });
    }

    fn draw_indexed(&mut self, topology: Topology, first: u32, count: u32) {
        let mut state = self.lock();
        state.validate_draw(true, first, count);
        state.record(DriverCall::DrawIndexed {
            topology,
            first,
            count,
        });
    }

    fn flush(&mut self) -> DriverResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        state.record(DriverCall::Flush);
        Ok(())
    }

    fn present(&mut self) -> DriverResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        state.presents += 1;
        state.record(DriverCall::Present);
        Ok(())
    }

    fn take_error(&mut self) -> Option<DriverError> {
        self.lock().pending_error.take()
    }

    fn is_context_lost(&self) -> bool {
        self.lock().context_lost
    }
}
