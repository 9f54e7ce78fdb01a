//! Vertex/index buffer pool and texture storage
//!
//! Buffers are carved out of hardware pages with a buddy allocator:
//! - Size classes are powers of two starting at the configured minimum block
//! - Released blocks go back to their class's free list (LIFO) and keep
//!   their hardware storage, so the next request of that class gets the
//!   same block
//! - Requests larger than a page get a dedicated page
//! - When the memory budget or the driver refuses a new page, the pool
//!   compacts once (coalescing free buddies and destroying empty pages)
//!   and retries
//!
//! Uploaded bytes are mirrored in host shadow copies when enabled. The
//! shadows drive partial uploads and refill storage after context loss.

use crate::context::GpuContext;
use crate::driver::{BufferKind, RawBuffer, RawTexture, TextureFormat, TextureRegion};
use crate::handles::{BufferHandle, TextureHandle};
use crossbeam::channel::{self, Receiver, Sender};
use slotmap::{new_key_type, SlotMap};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, info, instrument};
use vellum_core::config::BufferPoolConfig;
use vellum_core::{vellum_warn, DriverError, LogCategory, ResourceError};

type Result<T> = std::result::Result<T, ResourceError>;

/// Granularity of the changed-run diff in [`BufferPool::upload_changed`]
pub const DIFF_CHUNK: usize = 16;

new_key_type! {
    struct PageKey;
}

#[derive(Debug)]
struct Page {
    kind: BufferKind,
    size: u64,
    raw: Option<RawBuffer>,
    shadow: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Block {
    page: PageKey,
    offset: u64,
}

#[derive(Debug)]
struct Allocation {
    kind: BufferKind,
    block: Block,
    order: u32,
    size: u64,
    refs: u32,
}

#[derive(Debug)]
struct TextureEntry {
    raw: Option<RawTexture>,
    width: u32,
    height: u32,
    format: TextureFormat,
    refs: u32,
    shadow: Vec<u8>,
}

/// Where an allocation lives in driver memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStorage {
    pub raw: RawBuffer,
    pub offset: u64,
    pub size: u64,
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub releases: u64,
    pub blocks_reused: u64,
    pub pages_created: u64,
    pub pages_destroyed: u64,
    pub compactions: u64,
    pub bytes_uploaded: u64,
    pub live_allocations: usize,
    pub live_pages: usize,
    pub live_textures: usize,
    pub idle_textures: usize,
    pub textures_reused: u64,
    pub resident_bytes: u64,
}

/// What a compaction pass reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub blocks_merged: usize,
    pub pages_destroyed: usize,
    pub textures_destroyed: usize,
    pub bytes_freed: u64,
}

/// Buffer pool for VBO/IBO storage and textures
pub struct BufferPool {
    config: BufferPoolConfig,
    max_order: u32,
    pages: SlotMap<PageKey, Page>,
    allocations: SlotMap<BufferHandle, Allocation>,
    free_blocks: HashMap<(BufferKind, u32), Vec<Block>>,
    textures: SlotMap<TextureHandle, TextureEntry>,
    idle_textures: HashMap<(u32, u32, TextureFormat), Vec<RawTexture>>,
    resident_bytes: u64,
    release_tx: Sender<BufferHandle>,
    release_rx: Receiver<BufferHandle>,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a new pool. Sizes in `config` must be powers of two.
    pub fn new(config: BufferPoolConfig) -> Self {
        let min_block = config.min_block_size.max(1).next_power_of_two();
        let page_size = config.page_size.max(min_block).next_power_of_two();
        let config = BufferPoolConfig {
            min_block_size: min_block,
            page_size,
            ..config
        };
        let (release_tx, release_rx) = channel::unbounded();

        Self {
            max_order: (page_size / min_block).trailing_zeros(),
            config,
            pages: SlotMap::with_key(),
            allocations: SlotMap::with_key(),
            free_blocks: HashMap::new(),
            textures: SlotMap::with_key(),
            idle_textures: HashMap::new(),
            resident_bytes: 0,
            release_tx,
            release_rx,
            stats: BufferPoolStats::default(),
        }
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    fn block_size(&self, order: u32) -> u64 {
        self.config.min_block_size << order
    }

    /// Size class order for a request
    fn order_for(&self, size: u64) -> u32 {
        let class = size.max(self.config.min_block_size).next_power_of_two();
        (class / self.config.min_block_size).trailing_zeros()
    }

    fn out_of_memory(&self, requested: u64) -> ResourceError {
        ResourceError::OutOfGpuMemory {
            requested,
            resident: self.resident_bytes,
            budget: self.config.memory_budget,
        }
    }

    /// Allocate `size` bytes of `kind` storage
    #[instrument(skip(self, ctx))]
    pub fn allocate(
        &mut self,
        ctx: &mut GpuContext,
        kind: BufferKind,
        size: u64,
    ) -> Result<BufferHandle> {
        let order = self.order_for(size);
        let block = match self.take_block(ctx, kind, order) {
            Ok(block) => block,
            Err(ResourceError::OutOfGpuMemory { .. }) => {
                let report = self.compact(ctx);
                debug!("Compacted before retrying allocation: {:?}", report);
                self.take_block(ctx, kind, order)?
            }
            Err(e) => return Err(e),
        };

        self.stats.allocations += 1;
        Ok(self.allocations.insert(Allocation {
            kind,
            block,
            order,
            size,
            refs: 1,
        }))
    }

    fn pop_free(&mut self, kind: BufferKind, order: u32) -> Option<Block> {
        self.free_blocks.get_mut(&(kind, order)).and_then(Vec::pop)
    }

    fn push_free(&mut self, kind: BufferKind, order: u32, block: Block) {
        self.free_blocks.entry((kind, order)).or_default().push(block);
    }

    fn take_block(&mut self, ctx: &mut GpuContext, kind: BufferKind, order: u32) -> Result<Block> {
        if let Some(block) = self.pop_free(kind, order) {
            self.stats.blocks_reused += 1;
            return Ok(block);
        }

        if order > self.max_order {
            let page = self.create_page(ctx, kind, self.block_size(order))?;
            return Ok(Block { page, offset: 0 });
        }

        let (block, mut from) = match (order + 1..=self.max_order)
            .find_map(|larger| self.pop_free(kind, larger).map(|block| (block, larger)))
        {
            Some(found) => found,
            None => {
                let page = self.create_page(ctx, kind, self.config.page_size)?;
                (Block { page, offset: 0 }, self.max_order)
            }
        };

        // Keep the lower half, free the upper half, until the class fits
        while from > order {
            from -= 1;
            let buddy = Block {
                page: block.page,
                offset: block.offset + self.block_size(from),
            };
            self.push_free(kind, from, buddy);
        }
        Ok(block)
    }

    fn create_page(&mut self, ctx: &mut GpuContext, kind: BufferKind, size: u64) -> Result<PageKey> {
        if self.resident_bytes + size > self.config.memory_budget {
            return Err(self.out_of_memory(size));
        }
        let raw = match ctx.create_buffer(kind, size) {
            Ok(raw) => raw,
            Err(DriverError::OutOfMemory { .. }) => return Err(self.out_of_memory(size)),
            Err(e) => return Err(e.into()),
        };

        self.resident_bytes += size;
        self.stats.pages_created += 1;
        let shadow = if self.config.shadow_copies {
            vec![0; size as usize]
        } else {
            Vec::new()
        };
        debug!("Created {:?} page of {} bytes", kind, size);
        Ok(self.pages.insert(Page {
            kind,
            size,
            raw: Some(raw),
            shadow,
        }))
    }

    /// Add a reference to an allocation
    pub fn retain(&mut self, handle: BufferHandle) -> Result<()> {
        let allocation = self
            .allocations
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "buffer" })?;
        allocation.refs += 1;
        Ok(())
    }

    /// Drop a reference; the last one returns the block to its free list
    pub fn release(&mut self, handle: BufferHandle) -> Result<()> {
        let allocation = self
            .allocations
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "buffer" })?;
        allocation.refs -= 1;
        if allocation.refs > 0 {
            return Ok(());
        }

        if let Some(allocation) = self.allocations.remove(handle) {
            self.push_free(allocation.kind, allocation.order, allocation.block);
            self.stats.releases += 1;
        }
        Ok(())
    }

    /// Sender that segments use to release their buffers when dropped
    pub fn release_sender(&self) -> Sender<BufferHandle> {
        self.release_tx.clone()
    }

    /// Release everything queued through [`release_sender`](Self::release_sender)
    pub fn collect_released(&mut self) -> usize {
        let queued: Vec<BufferHandle> = self.release_rx.try_iter().collect();
        for handle in &queued {
            if let Err(e) = self.release(*handle) {
                vellum_warn!(LogCategory::Buffers, "Queued release failed: {}", e);
            }
        }
        queued.len()
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.allocations.contains_key(handle)
    }

    /// Requested size of an allocation
    pub fn size_of(&self, handle: BufferHandle) -> Option<u64> {
        self.allocations.get(handle).map(|a| a.size)
    }

    pub fn ref_count(&self, handle: BufferHandle) -> Option<u32> {
        self.allocations.get(handle).map(|a| a.refs)
    }

    pub fn storage(&self, handle: BufferHandle) -> Result<BufferStorage> {
        let allocation = self
            .allocations
            .get(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "buffer" })?;
        let raw = self
            .pages
            .get(allocation.block.page)
            .and_then(|page| page.raw)
            .ok_or(ResourceError::Driver(DriverError::ContextLost))?;
        Ok(BufferStorage {
            raw,
            offset: allocation.block.offset,
            size: allocation.size,
        })
    }

    fn checked_target(&self, handle: BufferHandle, offset: u64, len: u64) -> Result<(Block, RawBuffer)> {
        let allocation = self
            .allocations
            .get(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "buffer" })?;
        if !offset.checked_add(len).is_some_and(|end| end <= allocation.size) {
            return Err(ResourceError::UploadOutOfBounds {
                offset,
                len,
                size: allocation.size,
            });
        }
        let raw = self
            .pages
            .get(allocation.block.page)
            .and_then(|page| page.raw)
            .ok_or(ResourceError::Driver(DriverError::ContextLost))?;
        Ok((allocation.block, raw))
    }

    fn write_through(
        &mut self,
        ctx: &mut GpuContext,
        block: Block,
        raw: RawBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        ctx.write_buffer(raw, block.offset + offset, data)?;
        if let Some(page) = self.pages.get_mut(block.page) {
            if !page.shadow.is_empty() {
                let start = (block.offset + offset) as usize;
                page.shadow[start..start + data.len()].copy_from_slice(data);
            }
        }
        self.stats.bytes_uploaded += data.len() as u64;
        Ok(())
    }

    /// Write `data` at `offset` within the allocation
    pub fn upload(
        &mut self,
        ctx: &mut GpuContext,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let (block, raw) = self.checked_target(handle, offset, data.len() as u64)?;
        self.write_through(ctx, block, raw, offset, data)
    }

    /// Write `data` from the start of the allocation, sending only the runs
    /// that differ from the shadow copy. Returns the bytes sent.
    pub fn upload_changed(
        &mut self,
        ctx: &mut GpuContext,
        handle: BufferHandle,
        data: &[u8],
    ) -> Result<u64> {
        let (block, raw) = self.checked_target(handle, 0, data.len() as u64)?;
        let runs = match self.pages.get(block.page) {
            Some(page) if !page.shadow.is_empty() => {
                let start = block.offset as usize;
                changed_runs(&page.shadow[start..start + data.len()], data)
            }
            _ => vec![0..data.len()],
        };

        let mut sent = 0;
        for run in runs {
            sent += run.len() as u64;
            self.write_through(ctx, block, raw, run.start as u64, &data[run])?;
        }
        Ok(sent)
    }

    /// Coalesce free buddies and destroy pages and pooled textures nothing uses
    #[instrument(skip(self, ctx))]
    pub fn compact(&mut self, ctx: &mut GpuContext) -> CompactionReport {
        let mut report = CompactionReport::default();
        self.stats.compactions += 1;

        for order in 0..self.max_order {
            for kind in [BufferKind::Vertex, BufferKind::Index] {
                let list = self.free_blocks.remove(&(kind, order)).unwrap_or_default();
                let free: HashSet<Block> = list.iter().copied().collect();
                let size = self.block_size(order);
                let mut merged: HashSet<Block> = HashSet::new();
                let mut kept = Vec::with_capacity(list.len());

                for block in list {
                    if merged.contains(&block) {
                        continue;
                    }
                    let buddy = Block {
                        page: block.page,
                        offset: block.offset ^ size,
                    };
                    if free.contains(&buddy) && !merged.contains(&buddy) {
                        merged.insert(block);
                        merged.insert(buddy);
                        let parent = Block {
                            page: block.page,
                            offset: block.offset.min(buddy.offset),
                        };
                        self.push_free(kind, order + 1, parent);
                        report.blocks_merged += 1;
                    } else {
                        kept.push(block);
                    }
                }
                if !kept.is_empty() {
                    self.free_blocks.insert((kind, order), kept);
                }
            }
        }

        // Free blocks at page order or above cover whole pages
        let whole_pages: Vec<(BufferKind, u32)> = self
            .free_blocks
            .keys()
            .filter(|(_, order)| *order >= self.max_order)
            .copied()
            .collect();
        for key in whole_pages {
            for block in self.free_blocks.remove(&key).unwrap_or_default() {
                if let Some(page) = self.pages.remove(block.page) {
                    if let Some(raw) = page.raw {
                        ctx.destroy_buffer(raw);
                    }
                    self.resident_bytes -= page.size;
                    report.bytes_freed += page.size;
                    report.pages_destroyed += 1;
                    self.stats.pages_destroyed += 1;
                }
            }
        }

        for ((width, height, format), textures) in self.idle_textures.drain() {
            let bytes = format.image_size(width, height);
            for raw in textures {
                ctx.destroy_texture(raw);
                self.resident_bytes -= bytes;
                report.bytes_freed += bytes;
                report.textures_destroyed += 1;
            }
        }

        if report.pages_destroyed > 0 || report.textures_destroyed > 0 {
            info!(
                "Buffer pool compaction freed {} bytes ({} pages, {} textures)",
                report.bytes_freed, report.pages_destroyed, report.textures_destroyed
            );
        }
        report
    }

    // Textures

    fn create_texture_storage(
        &mut self,
        ctx: &mut GpuContext,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<RawTexture> {
        let bytes = format.image_size(width, height);
        let mut compacted = false;
        loop {
            let attempt = if self.resident_bytes + bytes > self.config.memory_budget {
                Err(self.out_of_memory(bytes))
            } else {
                match ctx.create_texture(width, height, format) {
                    Ok(raw) => Ok(raw),
                    Err(DriverError::OutOfMemory { .. }) => Err(self.out_of_memory(bytes)),
                    Err(e) => return Err(e.into()),
                }
            };
            match attempt {
                Ok(raw) => {
                    self.resident_bytes += bytes;
                    return Ok(raw);
                }
                Err(e) if compacted => return Err(e),
                Err(_) => {
                    self.compact(ctx);
                    compacted = true;
                }
            }
        }
    }

    /// Upload a new texture; the caller holds the first reference
    #[instrument(skip(self, ctx, pixels))]
    pub fn allocate_texture(
        &mut self,
        ctx: &mut GpuContext,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureHandle> {
        let expected = format.image_size(width, height) as usize;
        if pixels.len() != expected || width == 0 || height == 0 {
            return Err(ResourceError::InvalidTextureData {
                expected,
                actual: pixels.len(),
            });
        }

        let pooled = self
            .idle_textures
            .get_mut(&(width, height, format))
            .and_then(Vec::pop);
        let raw = match pooled {
            Some(raw) => {
                self.stats.textures_reused += 1;
                raw
            }
            None => self.create_texture_storage(ctx, width, height, format)?,
        };

        if let Err(e) = ctx.write_texture(raw, TextureRegion::full(width, height), pixels) {
            ctx.destroy_texture(raw);
            self.resident_bytes -= expected as u64;
            return Err(e.into());
        }

        let shadow = if self.config.shadow_copies {
            pixels.to_vec()
        } else {
            Vec::new()
        };
        Ok(self.textures.insert(TextureEntry {
            raw: Some(raw),
            width,
            height,
            format,
            refs: 1,
            shadow,
        }))
    }

    /// Replace a rectangle of texels
    pub fn upload_texture_region(
        &mut self,
        ctx: &mut GpuContext,
        handle: TextureHandle,
        region: TextureRegion,
        pixels: &[u8],
    ) -> Result<()> {
        let entry = self
            .textures
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "texture" })?;
        let bpp = entry.format.bytes_per_pixel() as usize;
        let expected = region.width as usize * region.height as usize * bpp;
        let fits = |start: u32, len: u32, limit: u32| start.checked_add(len).is_some_and(|end| end <= limit);
        if pixels.len() != expected
            || !fits(region.x, region.width, entry.width)
            || !fits(region.y, region.height, entry.height)
        {
            return Err(ResourceError::InvalidTextureData {
                expected,
                actual: pixels.len(),
            });
        }
        let raw = entry
            .raw
            .ok_or(ResourceError::Driver(DriverError::ContextLost))?;
        ctx.write_texture(raw, region, pixels)?;

        if !entry.shadow.is_empty() && expected > 0 {
            let row_bytes = region.width as usize * bpp;
            let stride = entry.width as usize * bpp;
            for (row, chunk) in pixels.chunks_exact(row_bytes).enumerate() {
                let start = (region.y as usize + row) * stride + region.x as usize * bpp;
                entry.shadow[start..start + row_bytes].copy_from_slice(chunk);
            }
        }
        Ok(())
    }

    pub fn retain_texture(&mut self, handle: TextureHandle) -> Result<()> {
        let entry = self
            .textures
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "texture" })?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop a reference; the last one parks the storage for reuse
    pub fn release_texture(&mut self, handle: TextureHandle) -> Result<()> {
        let entry = self
            .textures
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "texture" })?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }

        if let Some(entry) = self.textures.remove(handle) {
            if let Some(raw) = entry.raw {
                self.idle_textures
                    .entry((entry.width, entry.height, entry.format))
                    .or_default()
                    .push(raw);
            }
        }
        Ok(())
    }

    pub fn texture_storage(&self, handle: TextureHandle) -> Result<RawTexture> {
        let entry = self
            .textures
            .get(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "texture" })?;
        entry
            .raw
            .ok_or(ResourceError::Driver(DriverError::ContextLost))
    }

    pub fn texture_size(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(handle).map(|e| (e.width, e.height))
    }

    pub fn texture_ref_count(&self, handle: TextureHandle) -> Option<u32> {
        self.textures.get(handle).map(|e| e.refs)
    }

    // Context lifecycle

    /// Forget every raw id; allocations and page layout are kept
    pub fn on_context_lost(&mut self) {
        for page in self.pages.values_mut() {
            page.raw = None;
        }
        for entry in self.textures.values_mut() {
            entry.raw = None;
        }
        for ((width, height, format), textures) in self.idle_textures.drain() {
            self.resident_bytes -= format.image_size(width, height) * textures.len() as u64;
        }
        info!(
            "Buffer pool lost {} pages and {} textures",
            self.pages.len(),
            self.textures.len()
        );
    }

    /// Recreate pages and textures, refilling them from shadow copies
    #[instrument(skip(self, ctx))]
    pub fn on_context_restored(&mut self, ctx: &mut GpuContext) -> Result<()> {
        for page in self.pages.values_mut() {
            if page.raw.is_some() {
                continue;
            }
            let raw = ctx.create_buffer(page.kind, page.size)?;
            if !page.shadow.is_empty() {
                ctx.write_buffer(raw, 0, &page.shadow)?;
            }
            page.raw = Some(raw);
        }

        for entry in self.textures.values_mut() {
            if entry.raw.is_some() {
                continue;
            }
            let raw = ctx.create_texture(entry.width, entry.height, entry.format)?;
            if !entry.shadow.is_empty() {
                ctx.write_texture(
                    raw,
                    TextureRegion::full(entry.width, entry.height),
                    &entry.shadow,
                )?;
            }
            entry.raw = Some(raw);
        }
        Ok(())
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            live_allocations: self.allocations.len(),
            live_pages: self.pages.len(),
            live_textures: self.textures.len(),
            idle_textures: self.idle_textures.values().map(Vec::len).sum(),
            resident_bytes: self.resident_bytes,
            ..self.stats.clone()
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }
}

/// Byte ranges where `new` differs from `old`, at [`DIFF_CHUNK`] granularity;
/// adjacent changed chunks are merged
fn changed_runs(old: &[u8], new: &[u8]) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for start in (0..new.len()).step_by(DIFF_CHUNK) {
        let end = (start + DIFF_CHUNK).min(new.len());
        if old[start..end] == new[start..end] {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.end == start => run.end = end,
            _ => runs.push(start..end),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, HeadlessDriver, HeadlessProbe};

    fn setup(config: BufferPoolConfig) -> (GpuContext, BufferPool, HeadlessProbe) {
        let (driver, probe) = HeadlessDriver::with_probe(64, 64);
        (GpuContext::new(Box::new(driver)), BufferPool::new(config), probe)
    }

    fn small_pages() -> BufferPoolConfig {
        BufferPoolConfig {
            page_size: 4096,
            min_block_size: 256,
            memory_budget: 16384,
            shadow_copies: true,
        }
    }

    #[test]
    fn test_release_then_allocate_returns_same_block() {
        let (mut ctx, mut pool, _probe) = setup(small_pages());

        let first = pool.allocate(&mut ctx, BufferKind::Vertex, 300).unwrap();
        let storage = pool.storage(first).unwrap();
        pool.release(first).unwrap();

        let second = pool.allocate(&mut ctx, BufferKind::Vertex, 400).unwrap();
        let reused = pool.storage(second).unwrap();

        assert_eq!((reused.raw, reused.offset), (storage.raw, storage.offset));
        assert!(pool.storage(first).is_err());
        assert_eq!(pool.stats().blocks_reused, 1);
    }

    #[test]
    fn test_buddies_share_a_page() {
        let (mut ctx, mut pool, probe) = setup(small_pages());

        let a = pool.allocate(&mut ctx, BufferKind::Index, 256).unwrap();
        let b = pool.allocate(&mut ctx, BufferKind::Index, 256).unwrap();
        let c = pool.allocate(&mut ctx, BufferKind::Index, 1024).unwrap();

        let (a, b, c) = (
            pool.storage(a).unwrap(),
            pool.storage(b).unwrap(),
            pool.storage(c).unwrap(),
        );
        assert_eq!(a.raw, b.raw);
        assert_eq!(a.raw, c.raw);
        assert_eq!([a.offset, b.offset, c.offset], [0, 256, 1024]);
        assert_eq!(probe.live_buffers(), 1);
    }

    #[test]
    fn test_large_request_gets_dedicated_page() {
        let (mut ctx, mut pool, probe) = setup(small_pages());

        let big = pool.allocate(&mut ctx, BufferKind::Vertex, 5000).unwrap();
        let storage = pool.storage(big).unwrap();

        assert_eq!(storage.offset, 0);
        assert_eq!(probe.live_buffers(), 1);
        assert_eq!(pool.resident_bytes(), 8192);
    }

    #[test]
    fn test_budget_exhaustion_compacts_then_fails() {
        let (mut ctx, mut pool, probe) = setup(small_pages());

        let held: Vec<_> = (0..4)
            .map(|_| pool.allocate(&mut ctx, BufferKind::Vertex, 4096).unwrap())
            .collect();
        let err = pool.allocate(&mut ctx, BufferKind::Index, 4096).unwrap_err();
        assert_eq!(
            err,
            ResourceError::OutOfGpuMemory {
                requested: 4096,
                resident: 16384,
                budget: 16384
            }
        );

        pool.release(held[0]).unwrap();
        assert!(pool.allocate(&mut ctx, BufferKind::Index, 4096).is_ok());
        assert_eq!(pool.stats().pages_destroyed, 1);
        assert_eq!(probe.live_buffers(), 4);
    }

    #[test]
    fn test_compaction_coalesces_buddies() {
        let (mut ctx, mut pool, probe) = setup(small_pages());

        let blocks: Vec<_> = (0..16)
            .map(|_| pool.allocate(&mut ctx, BufferKind::Vertex, 256).unwrap())
            .collect();
        for block in blocks {
            pool.release(block).unwrap();
        }

        let report = pool.compact(&mut ctx);
        assert_eq!(report.pages_destroyed, 1);
        assert_eq!(report.blocks_merged, 15);
        assert_eq!(probe.live_buffers(), 0);
        assert_eq!(pool.resident_bytes(), 0);
    }

    #[test]
    fn test_driver_out_of_memory_is_reported() {
        let (mut ctx, mut pool, probe) = setup(BufferPoolConfig::default());
        probe.set_memory_limit(Some(1024));

        assert!(matches!(
            pool.allocate(&mut ctx, BufferKind::Vertex, 64),
            Err(ResourceError::OutOfGpuMemory { .. })
        ));
    }

    #[test]
    fn test_upload_bounds() {
        let (mut ctx, mut pool, _probe) = setup(small_pages());
        let handle = pool.allocate(&mut ctx, BufferKind::Vertex, 32).unwrap();

        assert!(pool.upload(&mut ctx, handle, 16, &[1; 16]).is_ok());
        assert_eq!(
            pool.upload(&mut ctx, handle, 17, &[1; 16]),
            Err(ResourceError::UploadOutOfBounds {
                offset: 17,
                len: 16,
                size: 32
            })
        );
    }

    #[test]
    fn test_upload_offset_overflow_is_out_of_bounds() {
        let (mut ctx, mut pool, _probe) = setup(small_pages());
        let handle = pool.allocate(&mut ctx, BufferKind::Vertex, 32).unwrap();

        assert_eq!(
            pool.upload(&mut ctx, handle, u64::MAX - 4, &[1; 16]),
            Err(ResourceError::UploadOutOfBounds {
                offset: u64::MAX - 4,
                len: 16,
                size: 32
            })
        );
    }

    #[test]
    fn test_texture_region_overflow_is_rejected() {
        let (mut ctx, mut pool, _probe) = setup(small_pages());
        let texture = pool
            .allocate_texture(&mut ctx, &[0; 4 * 4 * 4], 4, 4, TextureFormat::Rgba8)
            .unwrap();
        let region = TextureRegion {
            x: u32::MAX,
            y: 0,
            width: 1,
            height: 1,
        };

        assert_eq!(
            pool.upload_texture_region(&mut ctx, texture, region, &[9; 4]),
            Err(ResourceError::InvalidTextureData {
                expected: 4,
                actual: 4
            })
        );
        let inside = TextureRegion { x: 3, y: 3, ..region };
        assert!(pool.upload_texture_region(&mut ctx, texture, inside, &[9; 4]).is_ok());
    }

    #[test]
    fn test_upload_changed_sends_only_differing_runs() {
        let (mut ctx, mut pool, probe) = setup(small_pages());
        let handle = pool.allocate(&mut ctx, BufferKind::Vertex, 128).unwrap();

        let mut data = vec![7u8; 128];
        assert_eq!(pool.upload_changed(&mut ctx, handle, &data).unwrap(), 128);

        probe.clear_calls();
        data[20] = 1;
        data[40] = 1;
        data[100] = 1;
        assert_eq!(pool.upload_changed(&mut ctx, handle, &data).unwrap(), 48);

        let writes: Vec<_> = probe
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::WriteBuffer { offset, len, .. } => Some((offset, len)),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![(16, 32), (96, 16)]);

        probe.clear_calls();
        assert_eq!(pool.upload_changed(&mut ctx, handle, &data).unwrap(), 0);
        assert_eq!(probe.calls(), vec![]);
    }

    #[test]
    fn test_ref_counting() {
        let (mut ctx, mut pool, _probe) = setup(small_pages());
        let handle = pool.allocate(&mut ctx, BufferKind::Vertex, 64).unwrap();

        pool.retain(handle).unwrap();
        pool.release(handle).unwrap();
        assert!(pool.contains(handle));
        pool.release(handle).unwrap();
        assert!(!pool.contains(handle));
        assert_eq!(
            pool.release(handle),
            Err(ResourceError::InvalidHandle { kind: "buffer" })
        );
    }

    #[test]
    fn test_release_queue() {
        let (mut ctx, mut pool, _probe) = setup(small_pages());
        let handle = pool.allocate(&mut ctx, BufferKind::Vertex, 64).unwrap();

        let sender = pool.release_sender();
        std::thread::spawn(move || sender.send(handle).unwrap())
            .join()
            .unwrap();

        assert_eq!(pool.collect_released(), 1);
        assert!(!pool.contains(handle));
    }

    #[test]
    fn test_released_textures_are_pooled_by_size() {
        let (mut ctx, mut pool, probe) = setup(small_pages());
        let pixels = vec![255u8; 4 * 4 * 4];

        let first = pool
            .allocate_texture(&mut ctx, &pixels, 4, 4, TextureFormat::Rgba8)
            .unwrap();
        let raw = pool.texture_storage(first).unwrap();
        pool.release_texture(first).unwrap();

        let second = pool
            .allocate_texture(&mut ctx, &pixels, 4, 4, TextureFormat::Rgba8)
            .unwrap();
        assert_eq!(pool.texture_storage(second).unwrap(), raw);
        assert_eq!(probe.live_textures(), 1);
        assert_eq!(pool.stats().textures_reused, 1);

        assert!(matches!(
            pool.allocate_texture(&mut ctx, &pixels[1..], 4, 4, TextureFormat::Rgba8),
            Err(ResourceError::InvalidTextureData { .. })
        ));
    }

    #[test]
    fn test_context_restore_refills_from_shadow() {
        let (mut ctx, mut pool, probe) = setup(small_pages());
        let handle = pool.allocate(&mut ctx, BufferKind::Vertex, 16).unwrap();
        pool.upload(&mut ctx, handle, 0, &[3; 16]).unwrap();

        probe.lose_context();
        pool.on_context_lost();
        assert!(pool.storage(handle).is_err());

        probe.restore_context();
        ctx.invalidate();
        pool.on_context_restored(&mut ctx).unwrap();

        let storage = pool.storage(handle).unwrap();
        let contents = probe.buffer_contents(storage.raw).unwrap();
        assert_eq!(&contents[..16], &[3; 16]);
    }

    #[test]
    fn test_changed_runs() {
        let old = [0u8; 40];
        let mut new = old;
        new[39] = 1;
        assert_eq!(changed_runs(&old, &new), vec![32..40]);
        assert!(changed_runs(&old, &old).is_empty());
    }
}
