//! End-to-end compile and render scenarios

use pretty_assertions::assert_eq;
use vellum_core::config::{BufferPoolConfig, ShaderConfig};
use vellum_core::{Color, CompileError, Rect, VellumConfig, VellumError};
use vellum_renderer::buffer::BufferPool;
use vellum_renderer::compiler::{
    BindTarget, CompileResources, CompiledOp, CompiledProgram, Compiler, VertexSource,
};
use vellum_renderer::context::GpuContext;
use vellum_renderer::driver::{DriverCall, HeadlessDriver, TextureFormat, Topology, UniformValue};
use vellum_renderer::graph::{Instruction, InstructionGraph, TextureRef};
use vellum_renderer::shader::{ShaderCache, COLOR_UNIFORM};
use vellum_renderer::CanvasRenderer;

struct Rig {
    ctx: GpuContext,
    pool: BufferPool,
    shaders: ShaderCache,
    compiler: Compiler,
}

impl Rig {
    fn new() -> Self {
        let mut ctx = GpuContext::new(Box::new(HeadlessDriver::new(256, 256)));
        let shaders = ShaderCache::new(&mut ctx, &ShaderConfig::default()).unwrap();
        Self {
            ctx,
            pool: BufferPool::new(BufferPoolConfig::default()),
            shaders,
            compiler: Compiler::new(),
        }
    }

    fn compile(&mut self, graph: &mut InstructionGraph) -> Result<std::sync::Arc<CompiledProgram>, VellumError> {
        let mut resources = CompileResources {
            ctx: &mut self.ctx,
            pool: &mut self.pool,
            shaders: &mut self.shaders,
        };
        self.compiler.compile(graph, &mut resources).map(|outcome| outcome.program)
    }
}

fn rect(x: f32) -> Instruction {
    Instruction::rectangle(Rect::new(x, 0.0, 10.0, 10.0))
}

fn color(value: Color) -> CompiledOp {
    CompiledOp::SetUniform {
        name: COLOR_UNIFORM.into(),
        value: UniformValue::from(value),
    }
}

fn draw(group: vellum_core::GroupId, first: u32, count: u32) -> CompiledOp {
    CompiledOp::DrawCall {
        source: VertexSource::Group(group),
        first,
        count,
        topology: Topology::Triangles,
        indexed: true,
    }
}

#[test]
fn test_same_color_rects_batch_then_split_on_color_change() {
    let mut rig = Rig::new();
    let mut graph = InstructionGraph::new();
    let root = graph.root();
    let default_program = rig.shaders.default_program();

    graph.add_instruction(root, Instruction::color(Color::RED)).unwrap();
    graph.add_instruction(root, rect(0.0)).unwrap();
    let second = graph.add_instruction(root, Instruction::color(Color::RED)).unwrap();
    graph.add_instruction(root, rect(10.0)).unwrap();

    let program = rig.compile(&mut graph).unwrap();
    assert_eq!(
        program.flatten_ops(),
        vec![
            CompiledOp::Bind(BindTarget::Program(default_program)),
            color(Color::RED),
            draw(root, 0, 12),
        ]
    );

    graph.replace(second, Instruction::color(Color::BLUE)).unwrap();
    let program = rig.compile(&mut graph).unwrap();
    assert_eq!(
        program.flatten_ops(),
        vec![
            CompiledOp::Bind(BindTarget::Program(default_program)),
            color(Color::RED),
            draw(root, 0, 6),
            color(Color::BLUE),
            draw(root, 6, 6),
        ]
    );
}

#[test]
fn test_intervening_primitive_with_other_texture_prevents_batching() {
    let mut rig = Rig::new();
    let texture = rig
        .pool
        .allocate_texture(&mut rig.ctx, &[255; 16], 2, 2, TextureFormat::Rgba8)
        .unwrap();
    let mut graph = InstructionGraph::new();
    let root = graph.root();

    graph.add_instruction(root, rect(0.0)).unwrap();
    graph.add_instruction(root, rect(20.0)).unwrap();
    assert_eq!(rig.compile(&mut graph).unwrap().draw_count(), 1);

    graph
        .insert_instruction(
            root,
            1,
            Instruction::textured_rectangle(Rect::new(10.0, 0.0, 10.0, 10.0), TextureRef::Texture(texture)),
        )
        .unwrap();
    let program = rig.compile(&mut graph).unwrap();
    assert_eq!(program.draw_count(), 3);
    let texture_binds = program
        .flatten_ops()
        .into_iter()
        .filter(|op| matches!(op, CompiledOp::Bind(BindTarget::Texture { .. })))
        .count();
    assert_eq!(texture_binds, 2);
}

#[test]
fn test_unbalanced_clip_keeps_previous_program() {
    let mut rig = Rig::new();
    let mut graph = InstructionGraph::new();
    let root = graph.root();
    graph.add_instruction(root, rect(0.0)).unwrap();
    let good = rig.compile(&mut graph).unwrap();

    let group = graph.create_group();
    graph.attach_group(root, group, None).unwrap();
    graph.add_instruction(group, Instruction::push_clip(Rect::new(0.0, 0.0, 50.0, 50.0))).unwrap();
    graph.add_instruction(group, rect(5.0)).unwrap();

    let err = rig.compile(&mut graph).unwrap_err();
    assert!(matches!(
        err,
        VellumError::Compile(CompileError::ClipImbalance { pushes: 1, pops: 0, .. })
    ));
    let kept = rig.compiler.program().unwrap();
    assert!(std::sync::Arc::ptr_eq(kept, &good));
    assert_eq!(kept.flatten_ops(), good.flatten_ops());
}

#[test]
fn test_canvas_driver_calls_follow_color_mutation() {
    let (driver, probe) = HeadlessDriver::with_probe(64, 64);
    let mut canvas = CanvasRenderer::new(Box::new(driver), VellumConfig::default()).unwrap();
    let root = canvas.root();
    canvas.add_instruction(root, Instruction::color(Color::RED)).unwrap();
    canvas.add_instruction(root, rect(0.0)).unwrap();
    let second = canvas.add_instruction(root, Instruction::color(Color::RED)).unwrap();
    canvas.add_instruction(root, rect(10.0)).unwrap();

    canvas.render_frame().unwrap();
    assert_eq!(probe.draw_count(), 1);

    probe.clear_calls();
    canvas.replace(second, Instruction::color(Color::BLUE)).unwrap();
    canvas.render_frame().unwrap();

    let calls = probe.calls();
    let draws = calls
        .iter()
        .filter(|call| matches!(call, DriverCall::DrawIndexed { .. }))
        .count();
    assert_eq!(draws, 2);
    let blue = UniformValue::from(Color::BLUE);
    assert_eq!(
        calls
            .iter()
            .filter(|call| matches!(call, DriverCall::SetUniform { value, .. } if *value == blue))
            .count(),
        1
    );
}

#[test]
fn test_clipped_group_renders_inside_stencil() {
    let (driver, probe) = HeadlessDriver::with_probe(64, 64);
    let mut canvas = CanvasRenderer::new(Box::new(driver), VellumConfig::default()).unwrap();
    let group = canvas.create_group().unwrap();
    canvas.attach_group(canvas.root(), group, None).unwrap();
    canvas.add_instruction(group, Instruction::push_clip(Rect::new(0.0, 0.0, 32.0, 32.0))).unwrap();
    canvas.add_instruction(group, rect(4.0)).unwrap();
    canvas.add_instruction(group, Instruction::pop_clip()).unwrap();

    let report = canvas.render_frame().unwrap();
    assert!(report.presented);
    assert_eq!(probe.draw_count(), 1);
    assert_eq!(probe.stencil_depth(), 0);
    assert_eq!(
        probe.count_calls(|call| matches!(call, DriverCall::StencilQuad { .. })),
        2
    );
}
