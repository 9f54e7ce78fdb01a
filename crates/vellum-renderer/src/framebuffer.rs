//! Offscreen render targets
//!
//! Framebuffers are pooled by (width, height, stencil). Released targets
//! wait in a capped pool, oldest destroyed first. [`FramebufferManager::with_target`]
//! scopes a target binding and always restores the previous one.

use crate::context::GpuContext;
use crate::driver::{RawFramebuffer, RawTexture};
use crate::handles::FramebufferHandle;
use slotmap::SlotMap;
use std::collections::VecDeque;
use tracing::{debug, instrument};
use vellum_core::config::FramebufferConfig;
use vellum_core::{ResourceError, Viewport};

type Result<T> = std::result::Result<T, ResourceError>;

/// Binding saved by [`FramebufferManager::with_target`], put back on drop
struct TargetScope<'c> {
    ctx: &'c mut GpuContext,
    target: Option<Option<RawFramebuffer>>,
    viewport: Option<Viewport>,
    depth: u32,
}

impl Drop for TargetScope<'_> {
    fn drop(&mut self) {
        let (target, viewport) = match (self.target, self.viewport) {
            (Some(target), Some(viewport)) => (target, viewport),
            _ => (None, self.ctx.screen_viewport()),
        };
        self.ctx.bind_target(target);
        self.ctx.set_viewport(viewport);
        self.ctx.set_clip_depth(self.depth);
    }
}

#[derive(Debug)]
struct FramebufferEntry {
    /// `None` after context loss until the target is used again
    storage: Option<(RawFramebuffer, RawTexture)>,
    width: u32,
    height: u32,
    stencil: bool,
    in_use: bool,
}

impl FramebufferEntry {
    fn matches(&self, width: u32, height: u32, stencil: bool) -> bool {
        self.width == width && self.height == height && self.stencil == stencil
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferStats {
    pub created: u64,
    pub reused: u64,
    pub destroyed: u64,
    pub in_use: usize,
    pub pooled: usize,
}

/// Pool of offscreen targets
#[derive(Debug)]
pub struct FramebufferManager {
    config: FramebufferConfig,
    entries: SlotMap<FramebufferHandle, FramebufferEntry>,
    free: VecDeque<FramebufferHandle>,
    stats: FramebufferStats,
}

impl FramebufferManager {
    pub fn new(config: FramebufferConfig) -> Self {
        Self {
            config,
            entries: SlotMap::with_key(),
            free: VecDeque::new(),
            stats: FramebufferStats::default(),
        }
    }

    /// Target of the given size, reusing a pooled one when possible
    #[instrument(skip(self, ctx))]
    pub fn acquire(
        &mut self,
        ctx: &mut GpuContext,
        width: u32,
        height: u32,
        stencil: bool,
    ) -> Result<FramebufferHandle> {
        let pooled = self.free.iter().position(|handle| {
            self.entries
                .get(*handle)
                .is_some_and(|entry| entry.matches(width, height, stencil))
        });
        if let Some(handle) = pooled.and_then(|index| self.free.remove(index)) {
            if let Some(entry) = self.entries.get_mut(handle) {
                entry.in_use = true;
            }
            self.stats.reused += 1;
            self.ensure_live(ctx, handle)?;
            return Ok(handle);
        }

        let storage = ctx.create_framebuffer(width, height, stencil)?;
        self.stats.created += 1;
        debug!("Created {}x{} framebuffer (stencil: {})", width, height, stencil);
        Ok(self.entries.insert(FramebufferEntry {
            storage: Some(storage),
            width,
            height,
            stencil,
            in_use: true,
        }))
    }

    /// Return a target to the pool
    pub fn release(&mut self, ctx: &mut GpuContext, handle: FramebufferHandle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "framebuffer" })?;
        if !entry.in_use {
            return Ok(());
        }
        entry.in_use = false;
        self.free.push_back(handle);

        while self.free.len() > self.config.max_pooled {
            if let Some(oldest) = self.free.pop_front() {
                self.destroy(ctx, oldest);
            }
        }
        Ok(())
    }

    /// Keep `handle` if it already has this shape, otherwise retire it to
    /// the pool and acquire one that does
    pub fn reacquire(
        &mut self,
        ctx: &mut GpuContext,
        handle: FramebufferHandle,
        width: u32,
        height: u32,
        stencil: bool,
    ) -> Result<FramebufferHandle> {
        let matches = self
            .entries
            .get(handle)
            .is_some_and(|entry| entry.in_use && entry.matches(width, height, stencil));
        if matches {
            self.ensure_live(ctx, handle)?;
            return Ok(handle);
        }

        if self.entries.contains_key(handle) {
            self.release(ctx, handle)?;
        }
        self.acquire(ctx, width, height, stencil)
    }

    /// Color texture of a target, `None` while it has no storage
    pub fn texture_of(&self, handle: FramebufferHandle) -> Option<RawTexture> {
        self.entries
            .get(handle)
            .and_then(|entry| entry.storage)
            .map(|(_, texture)| texture)
    }

    pub fn size_of(&self, handle: FramebufferHandle) -> Option<(u32, u32)> {
        self.entries.get(handle).map(|e| (e.width, e.height))
    }

    /// Destroy every pooled target
    pub fn trim(&mut self, ctx: &mut GpuContext) -> usize {
        let pooled: Vec<_> = self.free.drain(..).collect();
        for handle in &pooled {
            self.destroy(ctx, *handle);
        }
        pooled.len()
    }

    fn destroy(&mut self, ctx: &mut GpuContext, handle: FramebufferHandle) {
        if let Some(entry) = self.entries.remove(handle) {
            if let Some((framebuffer, texture)) = entry.storage {
                ctx.destroy_framebuffer(framebuffer, texture);
            }
            self.stats.destroyed += 1;
        }
    }

    fn ensure_live(
        &mut self,
        ctx: &mut GpuContext,
        handle: FramebufferHandle,
    ) -> Result<(RawFramebuffer, u32, u32)> {
        let entry = self
            .entries
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "framebuffer" })?;
        let (framebuffer, _) = match entry.storage {
            Some(storage) => storage,
            None => {
                let storage = ctx.create_framebuffer(entry.width, entry.height, entry.stencil)?;
                entry.storage = Some(storage);
                self.stats.created += 1;
                storage
            }
        };
        Ok((framebuffer, entry.width, entry.height))
    }

    /// Run `body` with `handle` bound as the target.
    ///
    /// Target, viewport and clip depth are saved first and restored on every
    /// exit from `body`, including errors and panics.
    pub fn with_target<R, E>(
        &mut self,
        ctx: &mut GpuContext,
        handle: FramebufferHandle,
        body: impl FnOnce(&mut Self, &mut GpuContext) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<ResourceError>,
    {
        let (framebuffer, width, height) = self.ensure_live(ctx, handle)?;
        let mut scope = TargetScope {
            target: ctx.target(),
            viewport: ctx.viewport(),
            depth: ctx.clip_depth(),
            ctx,
        };

        scope.ctx.bind_target(Some(framebuffer));
        scope.ctx.set_viewport(Viewport::full(width, height));
        scope.ctx.set_clip_depth(0);
        body(self, &mut *scope.ctx)
    }

    /// Drop every raw id; targets in use are recreated on next use and
    /// pooled ones are forgotten
    pub fn on_context_lost(&mut self) {
        for handle in self.free.drain(..) {
            self.entries.remove(handle);
        }
        for entry in self.entries.values_mut() {
            entry.storage = None;
        }
    }

    pub fn stats(&self) -> FramebufferStats {
        FramebufferStats {
            in_use: self.entries.len() - self.free.len(),
            pooled: self.free.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, HeadlessDriver, HeadlessProbe};

    fn setup(max_pooled: usize) -> (GpuContext, FramebufferManager, HeadlessProbe) {
        let (driver, probe) = HeadlessDriver::with_probe(100, 80);
        (
            GpuContext::new(Box::new(driver)),
            FramebufferManager::new(FramebufferConfig { max_pooled }),
            probe,
        )
    }

    #[test]
    fn test_released_target_is_reused_for_same_shape() {
        let (mut ctx, mut fbos, probe) = setup(4);

        let first = fbos.acquire(&mut ctx, 32, 32, true).unwrap();
        let texture = fbos.texture_of(first);
        fbos.release(&mut ctx, first).unwrap();

        let second = fbos.acquire(&mut ctx, 32, 32, true).unwrap();
        assert_eq!(second, first);
        assert_eq!(fbos.texture_of(second), texture);

        let other = fbos.acquire(&mut ctx, 32, 32, false).unwrap();
        assert_ne!(other, first);
        assert_eq!(probe.live_framebuffers(), 2);
    }

    #[test]
    fn test_pool_is_capped() {
        let (mut ctx, mut fbos, probe) = setup(1);

        let handles: Vec<_> = (1..=3)
            .map(|size| fbos.acquire(&mut ctx, size * 8, 8, false).unwrap())
            .collect();
        for handle in &handles {
            fbos.release(&mut ctx, *handle).unwrap();
        }

        assert_eq!(probe.live_framebuffers(), 1);
        assert_eq!(fbos.stats().pooled, 1);
        assert_eq!(fbos.stats().destroyed, 2);
        assert_eq!(fbos.texture_of(handles[0]), None);
    }

    #[test]
    fn test_reacquire_with_new_shape_retires_old_target() {
        let (mut ctx, mut fbos, _probe) = setup(4);

        let handle = fbos.acquire(&mut ctx, 16, 16, false).unwrap();
        assert_eq!(fbos.reacquire(&mut ctx, handle, 16, 16, false).unwrap(), handle);

        let resized = fbos.reacquire(&mut ctx, handle, 32, 16, false).unwrap();
        assert_ne!(resized, handle);
        assert_eq!(fbos.size_of(resized), Some((32, 16)));
        assert_eq!(fbos.stats().pooled, 1);
    }

    #[test]
    fn test_with_target_restores_state_after_failure() {
        let (mut ctx, mut fbos, probe) = setup(4);
        ctx.bind_target(None);
        ctx.set_viewport(Viewport::full(100, 80));
        ctx.set_clip_depth(2);

        let handle = fbos.acquire(&mut ctx, 16, 16, true).unwrap();
        let result: std::result::Result<(), ResourceError> =
            fbos.with_target(&mut ctx, handle, |_, ctx| {
                assert_eq!(ctx.viewport(), Some(Viewport::full(16, 16)));
                assert_eq!(ctx.clip_depth(), 0);
                Err(ResourceError::InvalidHandle { kind: "buffer" })
            });

        assert!(result.is_err());
        assert_eq!(ctx.target(), Some(None));
        assert_eq!(ctx.viewport(), Some(Viewport::full(100, 80)));
        assert_eq!(ctx.clip_depth(), 2);
        assert_eq!(probe.bound_framebuffer(), None);
    }

    #[test]
    fn test_with_target_restores_state_when_body_panics() {
        let (mut ctx, mut fbos, probe) = setup(4);
        ctx.bind_target(None);
        ctx.set_viewport(Viewport::full(100, 80));
        ctx.set_clip_depth(1);
        let handle = fbos.acquire(&mut ctx, 16, 16, false).unwrap();

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            fbos.with_target(&mut ctx, handle, |_, _| -> std::result::Result<(), ResourceError> {
                panic!("body failed")
            })
        }));

        assert!(unwound.is_err());
        assert_eq!(ctx.target(), Some(None));
        assert_eq!(ctx.viewport(), Some(Viewport::full(100, 80)));
        assert_eq!(ctx.clip_depth(), 1);
        assert_eq!(probe.bound_framebuffer(), None);
    }

    #[test]
    fn test_nested_targets_restore_in_order() {
        let (mut ctx, mut fbos, probe) = setup(4);
        let outer = fbos.acquire(&mut ctx, 20, 20, false).unwrap();
        let inner = fbos.acquire(&mut ctx, 10, 10, false).unwrap();

        let result: std::result::Result<(), ResourceError> =
            fbos.with_target(&mut ctx, outer, |fbos, ctx| {
                let outer_target = ctx.target();
                fbos.with_target(ctx, inner, |_, _| Ok::<(), ResourceError>(()))?;
                assert_eq!(ctx.target(), outer_target);
                assert_eq!(ctx.viewport(), Some(Viewport::full(20, 20)));
                Ok(())
            });

        assert!(result.is_ok());
        // Unknown starting state falls back to the screen
        assert_eq!(ctx.target(), Some(None));
        assert_eq!(ctx.viewport(), Some(Viewport::full(100, 80)));
        let binds = probe.count_calls(|call| matches!(call, DriverCall::BindFramebuffer(_)));
        assert_eq!(binds, 4);
    }

    #[test]
    fn test_context_loss_recreates_targets_in_use() {
        let (mut ctx, mut fbos, probe) = setup(4);
        let kept = fbos.acquire(&mut ctx, 16, 16, false).unwrap();
        let pooled = fbos.acquire(&mut ctx, 8, 8, false).unwrap();
        fbos.release(&mut ctx, pooled).unwrap();

        probe.lose_context();
        fbos.on_context_lost();
        probe.restore_context();
        ctx.invalidate();

        assert_eq!(fbos.texture_of(kept), None);
        let result: std::result::Result<(), ResourceError> =
            fbos.with_target(&mut ctx, kept, |_, _| Ok(()));
        assert!(result.is_ok());
        assert!(fbos.texture_of(kept).is_some());
        assert_eq!(fbos.stats().pooled, 0);
    }
}
