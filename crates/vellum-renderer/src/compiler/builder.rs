//! Compilation of a single group into a segment
//!
//! State changes only update the desired state. Ops are emitted when a
//! primitive consumes the state, as the difference between desired and
//! emitted state. After `Bind(Program)` the emitted state is the base state,
//! and at the start of a segment or after a spliced child it is unknown.

use super::program::{
    BindTarget, CompiledOp, DrawState, Segment, SegmentItem, TaggedOp, VertexSource,
};
use super::{CompileResources, Diagnostic};
use crate::driver::{Topology, UniformValue};
use crate::graph::{Child, Instruction, InstructionGraph, Primitive, StateChange, TextureRef};
use crate::handles::ProgramHandle;
use crate::shader::{COLOR_UNIFORM, MODELVIEW_UNIFORM};
use crate::vertex::{Geometry, IndexSpan};
use glam::{Mat4, Vec2};
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;
use std::sync::Arc;
use vellum_core::{
    CompileError, GraphError, GroupId, InstructionId, LogCategory, ResourceError, VellumError,
    vellum_warn,
};

/// A compiled group before its geometry is uploaded
#[derive(Debug)]
pub(crate) struct BuiltSegment {
    pub segment: Segment,
    pub geometry: Geometry,
    /// Nested groups with the draw state they inherit
    pub children: Vec<(GroupId, DrawState)>,
    pub state_changes: usize,
}

/// Last instruction to set each property of the desired state
#[derive(Debug, Default)]
struct Setters {
    program: Option<InstructionId>,
    color: Option<InstructionId>,
    transform: Option<InstructionId>,
    blend: Option<InstructionId>,
    texture: Option<InstructionId>,
    uniforms: BTreeMap<Arc<str>, InstructionId>,
}

#[derive(Debug)]
struct PendingDraw {
    first: u32,
    count: u32,
    topology: Topology,
    sources: SmallVec<[InstructionId; 4]>,
}

fn tag(setter: Option<InstructionId>, consumer: InstructionId) -> SmallVec<[InstructionId; 4]> {
    match setter {
        Some(setter) if setter != consumer => smallvec![setter, consumer],
        _ => smallvec![consumer],
    }
}

struct GroupCompiler<'r, 'a> {
    group: GroupId,
    default_program: ProgramHandle,
    resources: &'r mut CompileResources<'a>,
    diagnostics: &'r mut Vec<Diagnostic>,
    desired: DrawState,
    emitted: Option<DrawState>,
    setters: Setters,
    transform_stack: Vec<Mat4>,
    clip_stack: Vec<[Vec2; 4]>,
    clip_pushes: usize,
    clip_pops: usize,
    items: Vec<SegmentItem>,
    pending: Option<PendingDraw>,
    geometry: Geometry,
    children: Vec<(GroupId, DrawState)>,
    state_changes: usize,
}

/// Compile `group` as if entered with `entry` state
pub(crate) fn compile_group(
    graph: &InstructionGraph,
    group: GroupId,
    entry: DrawState,
    resources: &mut CompileResources<'_>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<BuiltSegment, VellumError> {
    let node = graph.group(group).ok_or(GraphError::UnknownGroup(group))?;
    let revision = node.revision();
    let target = node.target();

    let mut compiler = GroupCompiler {
        group,
        default_program: resources.shaders.default_program(),
        resources,
        diagnostics,
        desired: entry.clone(),
        emitted: None,
        setters: Setters::default(),
        transform_stack: Vec::new(),
        clip_stack: Vec::new(),
        clip_pushes: 0,
        clip_pops: 0,
        items: Vec::new(),
        pending: None,
        geometry: Geometry::default(),
        children: Vec::new(),
        state_changes: 0,
    };

    if let Some(target) = target {
        compiler.push_op(
            CompiledOp::BeginTarget {
                group,
                width: target.width,
                height: target.height,
                clear: target.clear,
                stencil: target.stencil,
            },
            SmallVec::new(),
        );
    }

    for child in node.children() {
        match *child {
            Child::Instruction(id) => {
                let instruction = graph
                    .instruction(id)
                    .ok_or(GraphError::UnknownInstruction(id))?;
                compiler.visit(id, instruction)?;
            }
            Child::Group(nested) => {
                let offscreen = graph
                    .group(nested)
                    .is_some_and(|node| node.target().is_some());
                compiler.splice(nested, offscreen);
            }
        }
    }
    compiler.flush_pending();

    if !compiler.clip_stack.is_empty() {
        return Err(CompileError::ClipImbalance {
            group,
            pushes: compiler.clip_pushes,
            pops: compiler.clip_pops,
        }
        .into());
    }
    if target.is_some() {
        compiler.push_op(CompiledOp::EndTarget { group }, SmallVec::new());
    }

    Ok(BuiltSegment {
        segment: Segment {
            group,
            revision,
            entry,
            items: compiler.items,
            geometry: None,
        },
        geometry: compiler.geometry,
        children: compiler.children,
        state_changes: compiler.state_changes,
    })
}

impl GroupCompiler<'_, '_> {
    fn push_op(&mut self, op: CompiledOp, sources: SmallVec<[InstructionId; 4]>) {
        self.items.push(SegmentItem::Op(TaggedOp { op, sources }));
    }

    fn flush_pending(&mut self) {
        if let Some(draw) = self.pending.take() {
            self.push_op(
                CompiledOp::DrawCall {
                    source: VertexSource::Group(self.group),
                    first: draw.first,
                    count: draw.count,
                    topology: draw.topology,
                    indexed: true,
                },
                draw.sources,
            );
        }
    }

    fn splice(&mut self, nested: GroupId, offscreen: bool) {
        self.flush_pending();
        self.items.push(SegmentItem::Child(nested));
        let entry = if offscreen {
            DrawState::base(self.default_program)
        } else {
            self.desired.clone()
        };
        self.children.push((nested, entry));
        self.emitted = None;
    }

    fn visit(&mut self, id: InstructionId, instruction: &Instruction) -> Result<(), VellumError> {
        match instruction {
            Instruction::State(change) => {
                self.state_changes += 1;
                self.apply_state(id, change)?;
            }
            Instruction::TextureBind(texture) => {
                self.state_changes += 1;
                self.desired.texture = *texture;
                self.setters.texture = Some(id);
            }
            Instruction::ShaderUse(source) => {
                self.state_changes += 1;
                self.desired.program = match source {
                    None => self.default_program,
                    Some(source) => self.resolve_program(id, &source.vertex, &source.fragment)?,
                };
                self.setters.program = Some(id);
            }
            Instruction::Primitive(primitive) => {
                let texture = primitive.texture().unwrap_or(self.desired.texture);
                let span = self.tessellate(primitive);
                if span.count > 0 {
                    self.draw(id, texture, span, primitive.topology());
                }
            }
            Instruction::BufferReference(reference) => {
                if reference.count == 0 {
                    return Ok(());
                }
                let texture = reference.texture.unwrap_or(self.desired.texture);
                let ops = self.sync(id, texture);
                self.flush_pending();
                self.items.extend(ops.into_iter().map(SegmentItem::Op));
                self.push_op(
                    CompiledOp::DrawCall {
                        source: VertexSource::Buffers {
                            vertices: reference.vertices,
                            indices: reference.indices,
                        },
                        first: reference.first,
                        count: reference.count,
                        topology: reference.topology,
                        indexed: reference.indices.is_some(),
                    },
                    smallvec![id],
                );
            }
        }
        Ok(())
    }

    fn apply_state(&mut self, id: InstructionId, change: &StateChange) -> Result<(), VellumError> {
        match change {
            StateChange::Color(color) => {
                self.desired.color = *color;
                self.setters.color = Some(id);
            }
            StateChange::LineWidth(width) => self.desired.line_width = *width,
            StateChange::PushTransform => self.transform_stack.push(self.desired.transform),
            StateChange::PopTransform => {
                self.desired.transform =
                    self.transform_stack
                        .pop()
                        .ok_or(CompileError::TransformUnderflow {
                            group: self.group,
                            instruction: id,
                        })?;
                self.setters.transform = Some(id);
            }
            StateChange::Transform(matrix) => {
                self.desired.transform *= *matrix;
                self.setters.transform = Some(id);
            }
            StateChange::LoadIdentity => {
                self.desired.transform = Mat4::IDENTITY;
                self.setters.transform = Some(id);
            }
            StateChange::Blend(mode) => {
                self.desired.blend = *mode;
                self.setters.blend = Some(id);
            }
            StateChange::Uniform { name, value } => {
                self.desired.uniforms.insert(name.clone(), *value);
                self.setters.uniforms.insert(name.clone(), id);
            }
            StateChange::PushClip(rect) => {
                let transform = self.desired.transform;
                let quad = rect
                    .corners()
                    .map(|corner| transform.transform_point3(corner.extend(0.0)).truncate());
                self.flush_pending();
                self.push_op(CompiledOp::PushClip { quad }, smallvec![id]);
                self.clip_stack.push(quad);
                self.clip_pushes += 1;
            }
            StateChange::PopClip => {
                self.clip_pops += 1;
                let quad = self
                    .clip_stack
                    .pop()
                    .ok_or(CompileError::ClipImbalance {
                        group: self.group,
                        pushes: self.clip_pushes,
                        pops: self.clip_pops,
                    })?;
                self.flush_pending();
                self.push_op(CompiledOp::PopClip { quad }, smallvec![id]);
            }
        }
        Ok(())
    }

    fn resolve_program(
        &mut self,
        id: InstructionId,
        vertex: &str,
        fragment: &str,
    ) -> Result<ProgramHandle, VellumError> {
        let resources = &mut *self.resources;
        match resources.shaders.get_program(resources.ctx, vertex, fragment) {
            Ok(program) => Ok(program),
            Err(ResourceError::ShaderCompile { diagnostic }) => {
                vellum_warn!(
                    LogCategory::Compiler,
                    "{} at {} falls back to the default program",
                    id,
                    self.group
                );
                self.diagnostics.push(Diagnostic {
                    group: self.group,
                    instruction: id,
                    message: diagnostic,
                });
                Ok(self.default_program)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn tessellate(&mut self, primitive: &Primitive) -> IndexSpan {
        match primitive {
            Primitive::Rectangle { rect, tex_rect, .. } => {
                self.geometry.push_rectangle(*rect, *tex_rect)
            }
            Primitive::Ellipse {
                bounds,
                segments,
                angle_start,
                angle_end,
                ..
            } => self
                .geometry
                .push_ellipse(*bounds, *segments, *angle_start, *angle_end),
            Primitive::Mesh {
                vertices, indices, ..
            } => self.geometry.push_mesh(vertices, indices),
            Primitive::Line { points, close } => {
                self.geometry
                    .push_line(points, *close, self.desired.line_width)
            }
            Primitive::Points { points, size } => self.geometry.push_points(points, *size),
        }
    }

    /// Ops that bring the emitted state to the desired state for a draw
    /// sampling `texture`
    fn sync(&mut self, consumer: InstructionId, texture: TextureRef) -> Vec<TaggedOp> {
        let mut ops = Vec::new();
        let desired = &self.desired;
        let setters = &self.setters;

        let bound = self
            .emitted
            .as_ref()
            .is_some_and(|emitted| emitted.program == desired.program);
        if !bound {
            ops.push(TaggedOp {
                op: CompiledOp::Bind(BindTarget::Program(desired.program)),
                sources: tag(setters.program, consumer),
            });
            self.emitted = Some(DrawState::base(desired.program));
        }
        let Some(emitted) = self.emitted.as_mut() else {
            return ops;
        };

        if emitted.color != desired.color {
            ops.push(TaggedOp {
                op: CompiledOp::SetUniform {
                    name: COLOR_UNIFORM.into(),
                    value: UniformValue::from(desired.color),
                },
                sources: tag(setters.color, consumer),
            });
            emitted.color = desired.color;
        }
        if emitted.transform != desired.transform {
            ops.push(TaggedOp {
                op: CompiledOp::SetUniform {
                    name: MODELVIEW_UNIFORM.into(),
                    value: UniformValue::Mat4(desired.transform),
                },
                sources: tag(setters.transform, consumer),
            });
            emitted.transform = desired.transform;
        }
        if emitted.blend != desired.blend {
            ops.push(TaggedOp {
                op: CompiledOp::SetBlend(desired.blend),
                sources: tag(setters.blend, consumer),
            });
            emitted.blend = desired.blend;
        }
        if emitted.texture != texture {
            ops.push(TaggedOp {
                op: CompiledOp::Bind(BindTarget::Texture { unit: 0, texture }),
                sources: tag(setters.texture, consumer),
            });
            emitted.texture = texture;
        }
        for (name, value) in &desired.uniforms {
            if emitted.uniforms.get(name) != Some(value) {
                ops.push(TaggedOp {
                    op: CompiledOp::SetUniform {
                        name: name.clone(),
                        value: *value,
                    },
                    sources: tag(setters.uniforms.get(name).copied(), consumer),
                });
                emitted.uniforms.insert(name.clone(), *value);
            }
        }
        ops
    }

    /// Emit or extend a draw over `span` of the group's geometry
    fn draw(&mut self, id: InstructionId, texture: TextureRef, span: IndexSpan, topology: Topology) {
        let ops = self.sync(id, texture);
        if ops.is_empty() {
            if let Some(pending) = self.pending.as_mut() {
                if pending.topology == topology && pending.first + pending.count == span.first {
                    pending.count += span.count;
                    pending.sources.push(id);
                    return;
                }
            }
        }

        self.flush_pending();
        self.items.extend(ops.into_iter().map(SegmentItem::Op));
        self.pending = Some(PendingDraw {
            first: span.first,
            count: span.count,
            topology,
            sources: smallvec![id],
        });
    }
}
