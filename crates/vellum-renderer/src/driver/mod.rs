//! Hardware driver boundary
//!
//! [`GpuDriver`] is an immediate-mode state machine in the style of GL:
//! resources are created and written by raw id, state is set with bind
//! calls and draws consume whatever is bound. State calls don't return
//! errors; failures are latched and collected with [`GpuDriver::take_error`]
//! at the end of a frame.
//!
//! Nothing outside [`GpuContext`](crate::context::GpuContext) talks to a
//! driver directly.

pub mod headless;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use vellum_core::{Color, DriverError, Viewport};

pub use headless::{DriverCall, HeadlessDriver, HeadlessProbe};
#[cfg(feature = "wgpu")]
pub use self::wgpu::WgpuDriver;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Raw driver buffer id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawBuffer(pub u64);

/// Raw driver texture id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawTexture(pub u64);

/// Raw driver program id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawProgram(pub u64);

/// Raw driver framebuffer id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawFramebuffer(pub u64);

/// Location of a uniform inside a linked program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformLocation(pub u32);

/// What a buffer is bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// Pixel formats accepted by the texture path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    R8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => 4,
            TextureFormat::R8 => 1,
        }
    }

    /// Size in bytes of a tightly packed image
    pub fn image_size(&self, width: u32, height: u32) -> u64 {
        width as u64 * height as u64 * self.bytes_per_pixel() as u64
    }
}

/// Rectangle of texels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureRegion {
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Primitive assembly mode of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    Triangles,
    Lines,
    Points,
}

/// Color blending applied to draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Straight alpha, `src * a + dst * (1 - a)`
    #[default]
    Alpha,
    Additive,
    PremultipliedAlpha,
    /// No blending
    Opaque,
}

/// How a clip quad changes the stencil buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Increment,
    Decrement,
}

/// Uniform value as uploaded to a program
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl UniformValue {
    /// Value of the same type a freshly linked program starts with
    pub fn zero(&self) -> Self {
        match self {
            Self::Int(_) => Self::Int(0),
            Self::Float(_) => Self::Float(0.0),
            Self::Vec2(_) => Self::Vec2(Vec2::ZERO),
            Self::Vec3(_) => Self::Vec3(Vec3::ZERO),
            Self::Vec4(_) => Self::Vec4(Vec4::ZERO),
            Self::Mat4(_) => Self::Mat4(Mat4::ZERO),
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        Self::Vec4(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        Self::Mat4(value)
    }
}

impl From<Color> for UniformValue {
    fn from(value: Color) -> Self {
        Self::Vec4(value.to_vec4())
    }
}

/// Immediate-mode GPU driver.
///
/// Raw ids handed out by one driver are only meaningful to that driver.
/// After [`DriverError::ContextLost`] every id it returned is dead.
pub trait GpuDriver: Send {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Size of the default (screen) target in pixels
    fn screen_size(&self) -> (u32, u32);

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DriverResult<RawBuffer>;
    fn write_buffer(&mut self, buffer: RawBuffer, offset: u64, data: &[u8]) -> DriverResult<()>;
    fn destroy_buffer(&mut self, buffer: RawBuffer);

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RawTexture>;
    fn write_texture(
        &mut self,
        texture: RawTexture,
        region: TextureRegion,
        data: &[u8],
    ) -> DriverResult<()>;
    fn destroy_texture(&mut self, texture: RawTexture);

    /// Create an offscreen target and its color texture
    fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        stencil: bool,
    ) -> DriverResult<(RawFramebuffer, RawTexture)>;
    fn destroy_framebuffer(&mut self, framebuffer: RawFramebuffer);

    /// Compile and link a program. A [`DriverError::ShaderCompile`] carries
    /// the driver's diagnostic.
    fn compile_program(&mut self, vertex: &str, fragment: &str) -> DriverResult<RawProgram>;
    fn uniform_location(&mut self, program: RawProgram, name: &str) -> Option<UniformLocation>;
    fn destroy_program(&mut self, program: RawProgram);

    /// Bind an offscreen target, or the screen for `None`
    fn bind_framebuffer(&mut self, framebuffer: Option<RawFramebuffer>);
    fn set_viewport(&mut self, viewport: Viewport);
    fn use_program(&mut self, program: RawProgram);
    fn set_uniform(&mut self, program: RawProgram, location: UniformLocation, value: &UniformValue);
    fn bind_texture(&mut self, unit: u32, texture: RawTexture);
    fn set_blend(&mut self, mode: BlendMode);
    fn bind_vertex_buffer(&mut self, buffer: RawBuffer, offset: u64);
    fn bind_index_buffer(&mut self, buffer: RawBuffer, offset: u64);

    /// Clear the bound target's color (when given) and stencil
    fn clear(&mut self, color: Option<Color>, stencil: bool);
    /// Stencil reference that content draws are tested against
    fn set_stencil_ref(&mut self, depth: u32);
    /// Draw a quad in target pixels into the stencil buffer only
    fn draw_stencil_quad(&mut self, quad: &[Vec2; 4], op: StencilOp);

    fn draw(&mut self, topology: Topology, first: u32, count: u32);
    fn draw_indexed(&mut self, topology: Topology, first: u32, count: u32);

    /// Submit recorded work without presenting
    fn flush(&mut self) -> DriverResult<()>;
    /// Submit recorded work and show the screen target
    fn present(&mut self) -> DriverResult<()>;
    /// Return and clear the first error latched since the last call
    fn take_error(&mut self) -> Option<DriverError>;
    fn is_context_lost(&self) -> bool;
}
