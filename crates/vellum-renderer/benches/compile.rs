// Benchmarks for graph compilation and frame replay

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vellum_core::{Color, GroupId, InstructionId, Rect, VellumConfig};
use vellum_renderer::driver::HeadlessDriver;
use vellum_renderer::graph::Instruction;
use vellum_renderer::CanvasRenderer;

/// Canvas with `groups` child groups of `per_group` rectangles each
fn canvas(groups: usize, per_group: usize) -> (CanvasRenderer, Vec<(GroupId, InstructionId)>) {
    let (driver, probe) = HeadlessDriver::with_probe(1024, 1024);
    probe.set_recording(false);
    let mut canvas = CanvasRenderer::new(Box::new(driver), VellumConfig::default()).unwrap();
    let root = canvas.root();

    let mut colors = Vec::with_capacity(groups);
    for g in 0..groups {
        let group = canvas.create_group().unwrap();
        canvas.attach_group(root, group, None).unwrap();
        let color = canvas.add_instruction(group, Instruction::color(Color::RED)).unwrap();
        for i in 0..per_group {
            let x = (i % 32) as f32 * 16.0;
            let y = (g * 8 + i / 32) as f32 * 16.0;
            canvas
                .add_instruction(group, Instruction::rectangle(Rect::new(x, y, 12.0, 12.0)))
                .unwrap();
        }
        colors.push((group, color));
    }
    canvas.render_frame().unwrap();
    (canvas, colors)
}

fn bench_unchanged_frame(c: &mut Criterion) {
    let (mut canvas, _) = canvas(64, 64);
    c.bench_function("unchanged_frame", |b| {
        b.iter(|| black_box(canvas.render_frame().unwrap()))
    });
}

fn bench_single_group_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_group_edit");
    for groups in [16usize, 64, 256] {
        let (mut canvas, colors) = canvas(groups, 32);
        let (_, color) = colors[groups / 2];
        let mut flip = false;
        group.bench_with_input(BenchmarkId::from_parameter(groups), &groups, |b, _| {
            b.iter(|| {
                flip = !flip;
                let value = if flip { Color::BLUE } else { Color::RED };
                canvas.replace(color, Instruction::color(value)).unwrap();
                black_box(canvas.render_frame().unwrap())
            })
        });
    }
    group.finish();
}

fn bench_full_rebuild(c: &mut Criterion) {
    let (mut canvas, _) = canvas(64, 64);
    c.bench_function("full_rebuild", |b| {
        b.iter(|| {
            canvas.mark_all_dirty();
            black_box(canvas.render_frame().unwrap())
        })
    });
}

criterion_group!(benches, bench_unchanged_frame, bench_single_group_edit, bench_full_rebuild);
criterion_main!(benches);
