//! Resource lifecycle: pooled buffers, textures, framebuffers and context loss

use vellum_core::config::{BufferPoolConfig, FramebufferConfig};
use vellum_core::{Color, Rect, ResourceError, VellumConfig, VellumError};
use vellum_renderer::buffer::BufferPool;
use vellum_renderer::context::GpuContext;
use vellum_renderer::driver::{BufferKind, DriverCall, HeadlessDriver, HeadlessProbe, TextureFormat};
use vellum_renderer::framebuffer::FramebufferManager;
use vellum_renderer::graph::{Instruction, TextureRef};
use vellum_renderer::CanvasRenderer;

fn small_pool() -> BufferPool {
    BufferPool::new(BufferPoolConfig {
        page_size: 4096,
        min_block_size: 256,
        memory_budget: 8192,
        shadow_copies: true,
    })
}

fn context() -> (GpuContext, HeadlessProbe) {
    let (driver, probe) = HeadlessDriver::with_probe(64, 64);
    (GpuContext::new(Box::new(driver)), probe)
}

#[test]
fn test_reallocating_same_size_reuses_block() {
    let (mut ctx, probe) = context();
    let mut pool = small_pool();

    let first = pool.allocate(&mut ctx, BufferKind::Vertex, 300).unwrap();
    let storage = pool.storage(first).unwrap();
    pool.release(first).unwrap();
    let creates = probe.count_calls(|call| matches!(call, DriverCall::CreateBuffer { .. }));

    let second = pool.allocate(&mut ctx, BufferKind::Vertex, 300).unwrap();
    assert_eq!(pool.storage(second).unwrap(), storage);
    assert_eq!(
        probe.count_calls(|call| matches!(call, DriverCall::CreateBuffer { .. })),
        creates
    );
    assert_eq!(pool.stats().blocks_reused, 1);
}

#[test]
fn test_out_of_memory_retries_after_compaction() {
    let (mut ctx, probe) = context();
    let mut pool = small_pool();

    let a = pool.allocate(&mut ctx, BufferKind::Vertex, 4096).unwrap();
    let b = pool.allocate(&mut ctx, BufferKind::Vertex, 4096).unwrap();
    pool.release(a).unwrap();
    pool.release(b).unwrap();

    // Both pages are free but resident; an index page only fits after they go
    let index = pool.allocate(&mut ctx, BufferKind::Index, 4096).unwrap();
    assert!(pool.contains(index));
    assert_eq!(pool.resident_bytes(), 4096);
    assert_eq!(pool.stats().pages_destroyed, 2);
    assert_eq!(probe.live_buffers(), 1);
}

#[test]
fn test_out_of_memory_surfaces_when_compaction_frees_nothing() {
    let (mut ctx, _probe) = context();
    let mut pool = small_pool();

    let _a = pool.allocate(&mut ctx, BufferKind::Vertex, 4096).unwrap();
    let _b = pool.allocate(&mut ctx, BufferKind::Vertex, 4096).unwrap();
    let err = pool.allocate(&mut ctx, BufferKind::Vertex, 16).unwrap_err();
    assert!(matches!(
        err,
        ResourceError::OutOfGpuMemory {
            resident: 8192,
            budget: 8192,
            ..
        }
    ));
}

#[test]
fn test_driver_memory_limit_maps_to_out_of_memory() {
    let (mut ctx, probe) = context();
    let mut pool = BufferPool::new(BufferPoolConfig::default());
    probe.set_memory_limit(Some(1024));

    let err = pool.allocate(&mut ctx, BufferKind::Vertex, 64).unwrap_err();
    assert!(matches!(err, ResourceError::OutOfGpuMemory { .. }));
}

#[test]
fn test_released_textures_are_pooled_by_shape() {
    let (mut ctx, probe) = context();
    let mut pool = small_pool();
    let pixels = vec![0u8; 8 * 8 * 4];

    let first = pool.allocate_texture(&mut ctx, &pixels, 8, 8, TextureFormat::Rgba8).unwrap();
    pool.release_texture(first).unwrap();
    assert_eq!(pool.stats().idle_textures, 1);

    let second = pool.allocate_texture(&mut ctx, &pixels, 8, 8, TextureFormat::Rgba8).unwrap();
    assert_eq!(pool.stats().textures_reused, 1);
    assert_eq!(probe.live_textures(), 1);
    assert_eq!(pool.texture_size(second), Some((8, 8)));

    let err = pool
        .allocate_texture(&mut ctx, &pixels[..10], 8, 8, TextureFormat::Rgba8)
        .unwrap_err();
    assert!(matches!(err, ResourceError::InvalidTextureData { expected: 256, actual: 10 }));
}

#[test]
fn test_framebuffer_pool_reuses_matching_targets() {
    let (mut ctx, probe) = context();
    let mut framebuffers = FramebufferManager::new(FramebufferConfig { max_pooled: 1 });

    let a = framebuffers.acquire(&mut ctx, 32, 32, true).unwrap();
    framebuffers.release(&mut ctx, a).unwrap();
    let b = framebuffers.acquire(&mut ctx, 32, 32, true).unwrap();
    assert_eq!(a, b);
    assert_eq!(framebuffers.stats().reused, 1);

    // Different shape gets its own target
    let c = framebuffers.acquire(&mut ctx, 16, 32, true).unwrap();
    assert_ne!(b, c);
    framebuffers.release(&mut ctx, b).unwrap();
    framebuffers.release(&mut ctx, c).unwrap();

    // Only one stays pooled
    let stats = framebuffers.stats();
    assert_eq!(stats.pooled, 1);
    assert_eq!(stats.destroyed, 1);
    assert_eq!(probe.live_framebuffers(), 1);
}

#[test]
fn test_context_restore_rebuilds_canvas_resources() {
    let (driver, probe) = HeadlessDriver::with_probe(64, 64);
    let mut canvas = CanvasRenderer::new(Box::new(driver), VellumConfig::default()).unwrap();
    let root = canvas.root();
    let texture = canvas
        .upload_texture(&[255; 4 * 4 * 4], 4, 4, TextureFormat::Rgba8)
        .unwrap();
    canvas
        .add_instruction(
            root,
            Instruction::textured_rectangle(Rect::new(0.0, 0.0, 16.0, 16.0), TextureRef::Texture(texture)),
        )
        .unwrap();
    canvas.add_instruction(root, Instruction::color(Color::GREEN)).unwrap();
    canvas.add_instruction(root, Instruction::rectangle(Rect::new(20.0, 0.0, 8.0, 8.0))).unwrap();
    canvas.render_frame().unwrap();
    let draws_before = probe.draw_count();

    probe.lose_context();
    canvas.on_context_lost();
    let report = canvas.render_frame().unwrap();
    assert!(report.skipped);
    assert!(!report.presented);

    probe.restore_context();
    canvas.on_context_restored().unwrap();
    probe.clear_calls();
    let report = canvas.render_frame().unwrap();

    assert!(report.presented);
    assert!(report.compile.is_some_and(|stats| stats.full_rebuild));
    assert_eq!(probe.draw_count(), draws_before);
    // The user texture plus the 1x1 default
    assert_eq!(canvas.pool_stats().live_textures, 2);
    assert_eq!(probe.live_textures(), 2);
    assert_eq!(canvas.stats().context_losses, 1);
}

#[test]
fn test_trim_returns_unused_memory() {
    let (driver, probe) = HeadlessDriver::with_probe(64, 64);
    let mut canvas = CanvasRenderer::new(Box::new(driver), VellumConfig::default()).unwrap();
    let buffer = canvas.allocate_buffer(BufferKind::Vertex, 512).unwrap();
    canvas.upload_buffer(buffer, 0, &[1; 64]).unwrap();
    canvas.release_buffer(buffer).unwrap();
    assert_eq!(probe.live_buffers(), 1);

    let report = canvas.trim();
    assert_eq!(report.pages_destroyed, 1);
    assert_eq!(probe.live_buffers(), 0);

    let err = canvas.upload_buffer(buffer, 0, &[1; 4]).unwrap_err();
    assert!(matches!(
        err,
        VellumError::Resource(ResourceError::InvalidHandle { kind: "buffer" })
    ));
}
