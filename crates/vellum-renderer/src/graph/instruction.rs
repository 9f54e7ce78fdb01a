//! The closed set of canvas instructions

use crate::driver::{BlendMode, Topology, UniformValue};
use crate::handles::{BufferHandle, GpuResourceHandle, TextureHandle};
use crate::vertex::Vertex;
use glam::{Mat4, Vec2};
use smallvec::SmallVec;
use std::sync::Arc;
use vellum_core::{Color, GroupId, Rect};

/// Texture a draw samples from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureRef {
    /// 1x1 white texture, so untextured draws show the plain color
    #[default]
    Default,
    Texture(TextureHandle),
    /// Color texture of an offscreen group
    Target(GroupId),
}

/// Changes to the draw state inherited by later instructions of a group
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Color(Color),
    LineWidth(f32),
    PushTransform,
    PopTransform,
    /// Post-multiplied onto the current transform
    Transform(Mat4),
    LoadIdentity,
    Blend(BlendMode),
    /// Custom program uniform
    Uniform { name: Arc<str>, value: UniformValue },
    PushClip(Rect),
    PopClip,
}

/// Geometry drawn with the current state
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Rectangle {
        rect: Rect,
        tex_rect: Rect,
        texture: Option<TextureRef>,
    },
    Ellipse {
        bounds: Rect,
        segments: u32,
        /// Radians
        angle_start: f32,
        angle_end: f32,
        texture: Option<TextureRef>,
    },
    Mesh {
        vertices: Vec<Vertex>,
        /// Empty means sequential
        indices: Vec<u32>,
        topology: Topology,
        texture: Option<TextureRef>,
    },
    /// Width comes from the line-width state
    Line { points: Vec<Vec2>, close: bool },
    Points { points: Vec<Vec2>, size: f32 },
}

impl Primitive {
    pub fn texture(&self) -> Option<TextureRef> {
        match self {
            Primitive::Rectangle { texture, .. }
            | Primitive::Ellipse { texture, .. }
            | Primitive::Mesh { texture, .. } => *texture,
            Primitive::Line { .. } | Primitive::Points { .. } => None,
        }
    }

    /// Topology of the tessellated geometry
    pub fn topology(&self) -> Topology {
        match self {
            Primitive::Mesh { topology, .. } => *topology,
            _ => Topology::Triangles,
        }
    }
}

/// Vertex and fragment source of a custom program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub vertex: Arc<str>,
    pub fragment: Arc<str>,
}

/// Draw of caller-owned pool buffers
#[derive(Debug, Clone, PartialEq)]
pub struct BufferReference {
    pub vertices: BufferHandle,
    /// Non-indexed draw when absent
    pub indices: Option<BufferHandle>,
    pub first: u32,
    pub count: u32,
    pub topology: Topology,
    pub texture: Option<TextureRef>,
}

/// Canvas instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    State(StateChange),
    Primitive(Primitive),
    /// Current texture for later primitives
    TextureBind(TextureRef),
    /// Custom program, or the default one for `None`
    ShaderUse(Option<ShaderSource>),
    BufferReference(BufferReference),
}

impl Instruction {
    pub fn color(color: Color) -> Self {
        Self::State(StateChange::Color(color))
    }

    pub fn line_width(width: f32) -> Self {
        Self::State(StateChange::LineWidth(width))
    }

    pub fn push_transform() -> Self {
        Self::State(StateChange::PushTransform)
    }

    pub fn pop_transform() -> Self {
        Self::State(StateChange::PopTransform)
    }

    pub fn transform(matrix: Mat4) -> Self {
        Self::State(StateChange::Transform(matrix))
    }

    pub fn translate(x: f32, y: f32) -> Self {
        Self::transform(Mat4::from_translation(glam::Vec3::new(x, y, 0.0)))
    }

    pub fn blend(mode: BlendMode) -> Self {
        Self::State(StateChange::Blend(mode))
    }

    pub fn uniform(name: &str, value: impl Into<UniformValue>) -> Self {
        Self::State(StateChange::Uniform {
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn push_clip(rect: Rect) -> Self {
        Self::State(StateChange::PushClip(rect))
    }

    pub fn pop_clip() -> Self {
        Self::State(StateChange::PopClip)
    }

    pub fn rectangle(rect: Rect) -> Self {
        Self::Primitive(Primitive::Rectangle {
            rect,
            tex_rect: Rect::new(0.0, 0.0, 1.0, 1.0),
            texture: None,
        })
    }

    pub fn textured_rectangle(rect: Rect, texture: TextureRef) -> Self {
        Self::Primitive(Primitive::Rectangle {
            rect,
            tex_rect: Rect::new(0.0, 0.0, 1.0, 1.0),
            texture: Some(texture),
        })
    }

    pub fn ellipse(bounds: Rect, segments: u32) -> Self {
        Self::Primitive(Primitive::Ellipse {
            bounds,
            segments,
            angle_start: 0.0,
            angle_end: std::f32::consts::TAU,
            texture: None,
        })
    }

    pub fn line(points: Vec<Vec2>, close: bool) -> Self {
        Self::Primitive(Primitive::Line { points, close })
    }

    pub fn points(points: Vec<Vec2>, size: f32) -> Self {
        Self::Primitive(Primitive::Points { points, size })
    }

    pub fn shader(vertex: &str, fragment: &str) -> Self {
        Self::ShaderUse(Some(ShaderSource {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }))
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::State(StateChange::Color(_)) => "color",
            Instruction::State(StateChange::LineWidth(_)) => "line-width",
            Instruction::State(StateChange::PushTransform) => "push-transform",
            Instruction::State(StateChange::PopTransform) => "pop-transform",
            Instruction::State(StateChange::Transform(_)) => "transform",
            Instruction::State(StateChange::LoadIdentity) => "load-identity",
            Instruction::State(StateChange::Blend(_)) => "blend",
            Instruction::State(StateChange::Uniform { .. }) => "uniform",
            Instruction::State(StateChange::PushClip(_)) => "push-clip",
            Instruction::State(StateChange::PopClip) => "pop-clip",
            Instruction::Primitive(Primitive::Rectangle { .. }) => "rectangle",
            Instruction::Primitive(Primitive::Ellipse { .. }) => "ellipse",
            Instruction::Primitive(Primitive::Mesh { .. }) => "mesh",
            Instruction::Primitive(Primitive::Line { .. }) => "line",
            Instruction::Primitive(Primitive::Points { .. }) => "points",
            Instruction::TextureBind(_) => "texture-bind",
            Instruction::ShaderUse(_) => "shader-use",
            Instruction::BufferReference(_) => "buffer-reference",
        }
    }

    /// Pool resources this instruction keeps alive
    pub fn resources(&self) -> SmallVec<[GpuResourceHandle; 2]> {
        let mut handles = SmallVec::new();
        let texture = match self {
            Instruction::Primitive(primitive) => primitive.texture(),
            Instruction::TextureBind(texture) => Some(*texture),
            Instruction::BufferReference(reference) => {
                handles.push(reference.vertices.into());
                if let Some(indices) = reference.indices {
                    handles.push(indices.into());
                }
                reference.texture
            }
            Instruction::State(_) | Instruction::ShaderUse(_) => None,
        };
        if let Some(TextureRef::Texture(handle)) = texture {
            handles.push(handle.into());
        }
        handles
    }

    /// Offscreen groups this instruction samples from
    pub fn target_dependency(&self) -> Option<GroupId> {
        let texture = match self {
            Instruction::Primitive(primitive) => primitive.texture(),
            Instruction::TextureBind(texture) => Some(*texture),
            Instruction::BufferReference(reference) => reference.texture,
            Instruction::State(_) | Instruction::ShaderUse(_) => None,
        };
        match texture {
            Some(TextureRef::Target(group)) => Some(group),
            _ => None,
        }
    }
}
