//! Compiled output: ops, per-group segments and the program that ties them together

use crate::driver::{BlendMode, Topology, UniformValue};
use crate::graph::TextureRef;
use crate::handles::{BufferHandle, ProgramHandle};
use crossbeam::channel::Sender;
use glam::{Mat4, Vec2};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use vellum_core::{Color, GroupId, InstructionId};

/// Draw state as seen by a primitive
#[derive(Debug, Clone, PartialEq)]
pub struct DrawState {
    pub program: ProgramHandle,
    pub color: Color,
    pub line_width: f32,
    pub transform: Mat4,
    pub blend: BlendMode,
    pub texture: TextureRef,
    pub uniforms: BTreeMap<Arc<str>, UniformValue>,
}

impl DrawState {
    /// State right after `Bind(Program)`
    pub fn base(program: ProgramHandle) -> Self {
        Self {
            program,
            color: Color::WHITE,
            line_width: 1.0,
            transform: Mat4::IDENTITY,
            blend: BlendMode::Alpha,
            texture: TextureRef::Default,
            uniforms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindTarget {
    /// Activates the program and resets the base draw state
    Program(ProgramHandle),
    Texture { unit: u32, texture: TextureRef },
}

/// Where a draw's vertices and indices come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSource {
    /// Geometry buffers of a group's segment
    Group(GroupId),
    /// Caller-owned pool buffers
    Buffers {
        vertices: BufferHandle,
        indices: Option<BufferHandle>,
    },
}

/// One GPU operation
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledOp {
    Bind(BindTarget),
    SetUniform { name: Arc<str>, value: UniformValue },
    SetBlend(BlendMode),
    DrawCall {
        source: VertexSource,
        first: u32,
        count: u32,
        topology: Topology,
        indexed: bool,
    },
    /// Quad in target pixels
    PushClip { quad: [Vec2; 4] },
    PopClip { quad: [Vec2; 4] },
    BeginTarget {
        group: GroupId,
        width: u32,
        height: u32,
        clear: Option<Color>,
        stencil: bool,
    },
    EndTarget { group: GroupId },
}

impl CompiledOp {
    pub fn is_draw(&self) -> bool {
        matches!(self, CompiledOp::DrawCall { .. })
    }
}

/// Op plus the instructions it was compiled from
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedOp {
    pub op: CompiledOp,
    pub sources: SmallVec<[InstructionId; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentItem {
    Op(TaggedOp),
    /// Splice point of a nested group's segment
    Child(GroupId),
}

/// Pool buffers holding a segment's geometry; released when dropped
#[derive(Debug)]
pub struct GeometryBuffers {
    pub vertices: BufferHandle,
    pub indices: BufferHandle,
    release: Sender<BufferHandle>,
}

impl GeometryBuffers {
    /// Takes over one reference to each buffer
    pub fn new(vertices: BufferHandle, indices: BufferHandle, release: Sender<BufferHandle>) -> Self {
        Self {
            vertices,
            indices,
            release,
        }
    }
}

impl Drop for GeometryBuffers {
    fn drop(&mut self) {
        // The pool may already be gone at shutdown
        let _ = self.release.send(self.vertices);
        let _ = self.release.send(self.indices);
    }
}

/// Compiled content of one group
#[derive(Debug)]
pub struct Segment {
    pub group: GroupId,
    /// Group revision this segment was compiled from
    pub revision: u64,
    /// Draw state inherited at the group's position
    pub entry: DrawState,
    pub items: Vec<SegmentItem>,
    pub geometry: Option<GeometryBuffers>,
}

impl Segment {
    pub fn ops(&self) -> impl Iterator<Item = &TaggedOp> {
        self.items.iter().filter_map(|item| match item {
            SegmentItem::Op(op) => Some(op),
            SegmentItem::Child(_) => None,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.items.iter().filter_map(|item| match item {
            SegmentItem::Child(group) => Some(*group),
            SegmentItem::Op(_) => None,
        })
    }

    /// Offscreen target the segment renders into
    pub fn target(&self) -> Option<GroupId> {
        match self.items.first() {
            Some(SegmentItem::Op(TaggedOp {
                op: CompiledOp::BeginTarget { group, .. },
                ..
            })) => Some(*group),
            _ => None,
        }
    }
}

pub type SegmentTable = HashMap<GroupId, Arc<Segment>>;

/// Result of a compile pass, valid against the graph revision it names
#[derive(Debug)]
pub struct CompiledProgram {
    pub root: GroupId,
    pub revision: u64,
    pub(crate) segments: Arc<SegmentTable>,
}

impl CompiledProgram {
    pub fn segment(&self, group: GroupId) -> Option<&Arc<Segment>> {
        self.segments.get(&group)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Ops in execution order with every child segment spliced in
    pub fn flatten(&self) -> Vec<&TaggedOp> {
        let mut out = Vec::new();
        self.flatten_into(self.root, &mut out);
        out
    }

    fn flatten_into<'a>(&'a self, group: GroupId, out: &mut Vec<&'a TaggedOp>) {
        let Some(segment) = self.segments.get(&group) else {
            return;
        };
        for item in &segment.items {
            match item {
                SegmentItem::Op(op) => out.push(op),
                SegmentItem::Child(child) => self.flatten_into(*child, out),
            }
        }
    }

    /// [`flatten`](Self::flatten) without the source tags
    pub fn flatten_ops(&self) -> Vec<CompiledOp> {
        self.flatten().into_iter().map(|tagged| tagged.op.clone()).collect()
    }

    pub fn op_count(&self) -> usize {
        self.flatten().len()
    }

    pub fn draw_count(&self) -> usize {
        self.flatten().iter().filter(|tagged| tagged.op.is_draw()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use slotmap::SlotMap;

    fn tagged(op: CompiledOp) -> SegmentItem {
        SegmentItem::Op(TaggedOp {
            op,
            sources: SmallVec::new(),
        })
    }

    #[test]
    fn test_flatten_splices_children_in_place() {
        let root = GroupId(1);
        let child = GroupId(2);
        let draw = |group| CompiledOp::DrawCall {
            source: VertexSource::Group(group),
            first: 0,
            count: 6,
            topology: Topology::Triangles,
            indexed: true,
        };
        let segment = |group, items| {
            Arc::new(Segment {
                group,
                revision: 1,
                entry: DrawState::base(ProgramHandle::default()),
                items,
                geometry: None,
            })
        };

        let mut segments = SegmentTable::new();
        segments.insert(
            root,
            segment(root, vec![tagged(draw(root)), SegmentItem::Child(child), tagged(draw(root))]),
        );
        segments.insert(child, segment(child, vec![tagged(draw(child))]));
        let program = CompiledProgram {
            root,
            revision: 1,
            segments: Arc::new(segments),
        };

        assert_eq!(program.flatten_ops(), vec![draw(root), draw(child), draw(root)]);
        assert_eq!(program.draw_count(), 3);
    }

    #[test]
    fn test_geometry_buffers_release_on_drop() {
        let mut keys: SlotMap<BufferHandle, ()> = SlotMap::with_key();
        let (tx, rx) = channel::unbounded();
        let vertices = keys.insert(());
        let indices = keys.insert(());

        drop(GeometryBuffers::new(vertices, indices, tx));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![vertices, indices]);
    }
}
