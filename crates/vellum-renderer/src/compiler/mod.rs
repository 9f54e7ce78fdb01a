//! Incremental instruction graph compiler
//!
//! A pass starts from the dirty groups, shallowest first. Each compiled
//! group hands its nested groups the draw state at their position; a clean
//! nested group keeps its segment when both its revision and that entry
//! state are unchanged, otherwise it is compiled in the same pass.
//!
//! Nothing is visible until the whole pass succeeds. Geometry is committed
//! last (allocate every buffer, then upload) and a failure anywhere leaves
//! the previous program in effect.

mod builder;
pub mod program;

pub use program::{
    BindTarget, CompiledOp, CompiledProgram, DrawState, GeometryBuffers, Segment, SegmentItem,
    SegmentTable, TaggedOp, VertexSource,
};

use crate::buffer::BufferPool;
use crate::context::GpuContext;
use crate::driver::BufferKind;
use crate::graph::InstructionGraph;
use crate::handles::BufferHandle;
use crate::shader::ShaderCache;
use builder::BuiltSegment;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use vellum_core::{GroupId, InstructionId, LogCategory, ResourceError, VellumError, vellum_warn};

/// Smallest geometry buffer a segment allocates
const MIN_GEOMETRY_CAPACITY: u64 = 256;

/// GPU-side collaborators of a compile pass
pub struct CompileResources<'a> {
    pub ctx: &'a mut GpuContext,
    pub pool: &'a mut BufferPool,
    pub shaders: &'a mut ShaderCache,
}

/// Non-fatal problem found while compiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub group: GroupId,
    pub instruction: InstructionId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileStats {
    pub groups_compiled: usize,
    pub segments_reused: usize,
    pub state_changes: usize,
    pub ops_emitted: usize,
    pub draws_emitted: usize,
    pub buffers_allocated: usize,
    pub buffers_reused: usize,
    pub bytes_uploaded: u64,
    pub full_rebuild: bool,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct CompileOutcome {
    pub program: Arc<CompiledProgram>,
    pub stats: CompileStats,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy)]
enum GeometryPlan {
    Empty,
    /// Previous segment's buffers, retained once more
    Reuse(BufferHandle, BufferHandle),
    Fresh(BufferHandle, BufferHandle),
}

impl GeometryPlan {
    fn buffers(&self) -> Option<(BufferHandle, BufferHandle)> {
        match *self {
            GeometryPlan::Empty => None,
            GeometryPlan::Reuse(v, i) | GeometryPlan::Fresh(v, i) => Some((v, i)),
        }
    }
}

/// Turns the instruction graph into a [`CompiledProgram`]
#[derive(Debug, Default)]
pub struct Compiler {
    program: Option<Arc<CompiledProgram>>,
    force_full: bool,
    passes: u64,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last successfully compiled program
    pub fn program(&self) -> Option<&Arc<CompiledProgram>> {
        self.program.as_ref()
    }

    /// Forget every segment; the next pass rebuilds the whole graph
    pub fn reset(&mut self) {
        self.program = None;
        self.force_full = true;
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    #[instrument(skip_all, fields(revision = graph.revision()))]
    pub fn compile(
        &mut self,
        graph: &mut InstructionGraph,
        resources: &mut CompileResources<'_>,
    ) -> Result<CompileOutcome, VellumError> {
        let start = Instant::now();
        if let Some(program) = &self.program {
            if !self.force_full && !graph.has_dirty() {
                return Ok(CompileOutcome {
                    program: program.clone(),
                    stats: CompileStats {
                        segments_reused: program.segment_count(),
                        duration: start.elapsed(),
                        ..Default::default()
                    },
                    diagnostics: Vec::new(),
                });
            }
        }

        let full = self.force_full || self.program.is_none();
        let previous: Option<Arc<SegmentTable>> = match (&self.program, full) {
            (Some(program), false) => Some(program.segments.clone()),
            _ => None,
        };
        let old_table = previous.as_deref();
        let old = |group: GroupId| old_table.and_then(|table| table.get(&group));

        let root = graph.root();
        let default_program = resources.shaders.default_program();
        let mut stats = CompileStats {
            full_rebuild: full,
            ..Default::default()
        };
        let mut diagnostics = Vec::new();
        let mut work: BTreeSet<(usize, GroupId)> = BTreeSet::new();
        let mut entries: HashMap<GroupId, DrawState> = HashMap::new();

        if full {
            work.insert((0, root));
        } else {
            work.extend(
                graph
                    .dirty_groups()
                    .filter_map(|group| graph.depth(group).map(|depth| (depth, group))),
            );
        }

        let mut fresh: HashMap<GroupId, BuiltSegment> = HashMap::new();
        while let Some((depth, group)) = work.pop_first() {
            let Some(node) = graph.group(group) else {
                continue;
            };
            let entry = if group == root || node.target().is_some() {
                DrawState::base(default_program)
            } else {
                entries
                    .remove(&group)
                    .or_else(|| old(group).map(|segment| segment.entry.clone()))
                    .unwrap_or_else(|| DrawState::base(default_program))
            };

            let built = builder::compile_group(graph, group, entry, resources, &mut diagnostics)?;
            for (child, child_entry) in &built.children {
                let Some(child_node) = graph.group(*child) else {
                    continue;
                };
                let up_to_date = old(*child).is_some_and(|segment| {
                    segment.revision == child_node.revision() && segment.entry == *child_entry
                });
                if !up_to_date {
                    entries.insert(*child, child_entry.clone());
                    work.insert((depth + 1, *child));
                }
            }
            stats.groups_compiled += 1;
            stats.state_changes += built.state_changes;
            fresh.insert(group, built);
        }

        let committed = self.commit(fresh, old_table, resources, &mut stats)?;

        let mut table: SegmentTable = old_table.cloned().unwrap_or_default();
        for segment in committed {
            stats.ops_emitted += segment.ops().count();
            stats.draws_emitted += segment.ops().filter(|tagged| tagged.op.is_draw()).count();
            table.insert(segment.group, segment);
        }
        if full || graph.topology_changed() {
            let reachable: HashSet<GroupId> = graph.reachable_groups().into_iter().collect();
            table.retain(|group, _| reachable.contains(group));
        }
        stats.segments_reused = table.len().saturating_sub(stats.groups_compiled);

        let program = Arc::new(CompiledProgram {
            root,
            revision: graph.revision(),
            segments: Arc::new(table),
        });
        graph.clear_dirty();
        self.program = Some(program.clone());
        self.force_full = false;
        self.passes += 1;

        stats.duration = start.elapsed();
        debug!(
            "Compiled {} groups ({} reused), {} ops, {} bytes uploaded in {:?}",
            stats.groups_compiled,
            stats.segments_reused,
            stats.ops_emitted,
            stats.bytes_uploaded,
            stats.duration
        );
        Ok(CompileOutcome {
            program,
            stats,
            diagnostics,
        })
    }

    /// Give every built segment its geometry buffers and seal it
    fn commit(
        &mut self,
        mut fresh: HashMap<GroupId, BuiltSegment>,
        previous: Option<&SegmentTable>,
        resources: &mut CompileResources<'_>,
        stats: &mut CompileStats,
    ) -> Result<Vec<Arc<Segment>>, VellumError> {
        let mut order: Vec<GroupId> = fresh.keys().copied().collect();
        order.sort();

        // Allocate (or retain) everything before touching any contents
        let mut plans: Vec<GeometryPlan> = Vec::with_capacity(order.len());
        for group in &order {
            let Some(built) = fresh.get(group) else {
                continue;
            };
            let plan = match self.plan_geometry(*group, built, previous, resources) {
                Ok(plan) => plan,
                Err(e) => {
                    rollback(&plans, resources.pool);
                    return Err(e.into());
                }
            };
            plans.push(plan);
        }

        for (group, plan) in order.iter().zip(&plans) {
            let (Some((vertices, indices)), Some(built)) = (plan.buffers(), fresh.get(group)) else {
                continue;
            };
            let uploaded = resources
                .pool
                .upload_changed(
                    resources.ctx,
                    vertices,
                    bytemuck::cast_slice(&built.geometry.vertices),
                )
                .and_then(|v| {
                    resources
                        .pool
                        .upload_changed(
                            resources.ctx,
                            indices,
                            bytemuck::cast_slice(&built.geometry.indices),
                        )
                        .map(|i| v + i)
                });
            match uploaded {
                Ok(bytes) => stats.bytes_uploaded += bytes,
                Err(e) => {
                    // Reused buffers may hold part of the new geometry now
                    self.force_full = true;
                    rollback(&plans, resources.pool);
                    vellum_warn!(LogCategory::Compiler, "Geometry upload failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        let release = resources.pool.release_sender();
        let mut committed = Vec::with_capacity(order.len());
        for (group, plan) in order.into_iter().zip(plans) {
            let Some(built) = fresh.remove(&group) else {
                continue;
            };
            let geometry = match plan {
                GeometryPlan::Empty => None,
                GeometryPlan::Reuse(v, i) => {
                    stats.buffers_reused += 1;
                    Some(GeometryBuffers::new(v, i, release.clone()))
                }
                GeometryPlan::Fresh(v, i) => {
                    stats.buffers_allocated += 1;
                    Some(GeometryBuffers::new(v, i, release.clone()))
                }
            };
            committed.push(Arc::new(Segment {
                geometry,
                ..built.segment
            }));
        }
        Ok(committed)
    }

    fn plan_geometry(
        &self,
        group: GroupId,
        built: &BuiltSegment,
        previous: Option<&SegmentTable>,
        resources: &mut CompileResources<'_>,
    ) -> Result<GeometryPlan, ResourceError> {
        if built.geometry.is_empty() {
            return Ok(GeometryPlan::Empty);
        }
        let vertex_bytes = built.geometry.vertex_bytes();
        let index_bytes = built.geometry.index_bytes();
        let pool = &mut *resources.pool;

        let reusable = previous
            .and_then(|table| table.get(&group))
            .and_then(|segment| segment.geometry.as_ref())
            .filter(|buffers| {
                pool.size_of(buffers.vertices).is_some_and(|size| size >= vertex_bytes)
                    && pool.size_of(buffers.indices).is_some_and(|size| size >= index_bytes)
            })
            .map(|buffers| (buffers.vertices, buffers.indices));
        if let Some((vertices, indices)) = reusable {
            pool.retain(vertices)?;
            if let Err(e) = pool.retain(indices) {
                pool.release(vertices)?;
                return Err(e);
            }
            return Ok(GeometryPlan::Reuse(vertices, indices));
        }

        let vertices = pool.allocate(resources.ctx, BufferKind::Vertex, capacity(vertex_bytes))?;
        match pool.allocate(resources.ctx, BufferKind::Index, capacity(index_bytes)) {
            Ok(indices) => Ok(GeometryPlan::Fresh(vertices, indices)),
            Err(e) => {
                pool.release(vertices)?;
                Err(e)
            }
        }
    }
}

fn capacity(needed: u64) -> u64 {
    needed.max(MIN_GEOMETRY_CAPACITY).next_power_of_two()
}

/// Undo the references taken by `plans`
fn rollback(plans: &[GeometryPlan], pool: &mut BufferPool) {
    for (vertices, indices) in plans.iter().filter_map(GeometryPlan::buffers) {
        for handle in [vertices, indices] {
            if let Err(e) = pool.release(handle) {
                vellum_warn!(LogCategory::Compiler, "Rollback release failed: {}", e);
            }
        }
    }
}
