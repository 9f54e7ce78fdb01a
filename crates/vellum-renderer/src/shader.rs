//! Shader/program cache
//!
//! Programs are memoized by the SHA-256 of their source pair. Compile
//! failures are memoized as well, so a bad `ShaderUse` costs one driver
//! compile no matter how often it is compiled into the graph. After context
//! loss every program is pending and relinks on first use.

use crate::context::GpuContext;
use crate::driver::{RawProgram, UniformLocation};
use crate::handles::ProgramHandle;
use sha2::{Digest, Sha256};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use vellum_core::config::ShaderConfig;
use vellum_core::{vellum_warn, DriverError, LogCategory, ResourceError};

type Result<T> = std::result::Result<T, ResourceError>;

pub const DEFAULT_VERTEX_SHADER: &str = include_str!("shaders/default_vertex.wgsl");
pub const DEFAULT_FRAGMENT_SHADER: &str = include_str!("shaders/default_fragment.wgsl");

/// Projection matrix of the bound target
pub const PROJECTION_UNIFORM: &str = "projection_mat";
/// Current transform
pub const MODELVIEW_UNIFORM: &str = "modelview_mat";
/// Current color
pub const COLOR_UNIFORM: &str = "color";

/// Digest of a (vertex, fragment) source pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey([u8; 32]);

impl SourceKey {
    pub fn new(vertex: &str, fragment: &str) -> Self {
        let mut hasher = Sha256::new();
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart
        hasher.update((vertex.len() as u64).to_le_bytes());
        hasher.update(vertex.as_bytes());
        hasher.update(fragment.as_bytes());
        Self(hasher.finalize().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramState {
    Linked(RawProgram),
    /// Needs a (re)compile before use
    Pending,
}

#[derive(Debug)]
struct ProgramEntry {
    vertex: Arc<str>,
    fragment: Arc<str>,
    state: ProgramState,
    uniforms: HashMap<String, Option<UniformLocation>>,
}

#[derive(Debug, Clone)]
enum CachedCompile {
    Program(ProgramHandle),
    Failed(String),
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    pub compiles: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub memoized_failure_hits: u64,
    pub relinks: u64,
    pub live_programs: usize,
}

/// Owns every linked program
#[derive(Debug)]
pub struct ShaderCache {
    config: ShaderConfig,
    programs: SlotMap<ProgramHandle, ProgramEntry>,
    by_source: HashMap<SourceKey, CachedCompile>,
    default_program: ProgramHandle,
    stats: ShaderCacheStats,
}

impl ShaderCache {
    /// Create the cache and compile the default program. An error here
    /// means the renderer cannot draw at all.
    #[instrument(skip(ctx, config))]
    pub fn new(ctx: &mut GpuContext, config: &ShaderConfig) -> Result<Self> {
        let vertex = config
            .default_vertex_source
            .as_deref()
            .unwrap_or(DEFAULT_VERTEX_SHADER);
        let fragment = config
            .default_fragment_source
            .as_deref()
            .unwrap_or(DEFAULT_FRAGMENT_SHADER);

        let raw = ctx.compile_program(vertex, fragment).map_err(compile_error)?;
        let mut programs = SlotMap::with_key();
        let default_program = programs.insert(ProgramEntry {
            vertex: vertex.into(),
            fragment: fragment.into(),
            state: ProgramState::Linked(raw),
            uniforms: HashMap::new(),
        });
        let mut by_source = HashMap::new();
        by_source.insert(
            SourceKey::new(vertex, fragment),
            CachedCompile::Program(default_program),
        );

        info!("Default program linked on {}", ctx.driver_name());
        Ok(Self {
            config: config.clone(),
            programs,
            by_source,
            default_program,
            stats: ShaderCacheStats {
                compiles: 1,
                ..Default::default()
            },
        })
    }

    pub fn default_program(&self) -> ProgramHandle {
        self.default_program
    }

    /// Program for a source pair, compiling on first request
    pub fn get_program(
        &mut self,
        ctx: &mut GpuContext,
        vertex: &str,
        fragment: &str,
    ) -> Result<ProgramHandle> {
        let key = SourceKey::new(vertex, fragment);
        match self.by_source.get(&key) {
            Some(CachedCompile::Program(handle)) => {
                self.stats.cache_hits += 1;
                return Ok(*handle);
            }
            Some(CachedCompile::Failed(diagnostic)) => {
                self.stats.memoized_failure_hits += 1;
                return Err(ResourceError::ShaderCompile {
                    diagnostic: diagnostic.clone(),
                });
            }
            None => {}
        }

        self.stats.compiles += 1;
        match ctx.compile_program(vertex, fragment) {
            Ok(raw) => {
                let handle = self.programs.insert(ProgramEntry {
                    vertex: vertex.into(),
                    fragment: fragment.into(),
                    state: ProgramState::Linked(raw),
                    uniforms: HashMap::new(),
                });
                self.by_source.insert(key, CachedCompile::Program(handle));
                debug!("Linked program {:?}", handle);
                Ok(handle)
            }
            Err(DriverError::ShaderCompile(diagnostic)) => {
                self.stats.failures += 1;
                vellum_warn!(LogCategory::Shaders, "Program failed to compile: {}", diagnostic);
                if self.config.memoize_failures {
                    self.by_source
                        .insert(key, CachedCompile::Failed(diagnostic.clone()));
                }
                Err(ResourceError::ShaderCompile { diagnostic })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Raw program for a handle, relinking it if the context was lost
    pub fn resolve(&mut self, ctx: &mut GpuContext, handle: ProgramHandle) -> Result<RawProgram> {
        let entry = self
            .programs
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "program" })?;
        match entry.state {
            ProgramState::Linked(raw) => Ok(raw),
            ProgramState::Pending => {
                let raw = ctx
                    .compile_program(&entry.vertex, &entry.fragment)
                    .map_err(compile_error)?;
                entry.state = ProgramState::Linked(raw);
                self.stats.relinks += 1;
                debug!("Relinked program {:?}", handle);
                Ok(raw)
            }
        }
    }

    /// Location of a named uniform, `None` when the program has no such uniform
    pub fn uniform_location(
        &mut self,
        ctx: &mut GpuContext,
        handle: ProgramHandle,
        name: &str,
    ) -> Result<Option<UniformLocation>> {
        let raw = self.resolve(ctx, handle)?;
        let entry = self
            .programs
            .get_mut(handle)
            .ok_or(ResourceError::InvalidHandle { kind: "program" })?;
        if let Some(location) = entry.uniforms.get(name) {
            return Ok(*location);
        }
        let location = ctx.uniform_location(raw, name);
        entry.uniforms.insert(name.to_string(), location);
        Ok(location)
    }

    /// Mark every program pending; raw ids and uniform locations are dead
    pub fn on_context_lost(&mut self) {
        for entry in self.programs.values_mut() {
            entry.state = ProgramState::Pending;
            entry.uniforms.clear();
        }
        info!("{} programs pending relink", self.programs.len());
    }

    pub fn stats(&self) -> ShaderCacheStats {
        ShaderCacheStats {
            live_programs: self.programs.len(),
            ..self.stats
        }
    }
}

fn compile_error(error: DriverError) -> ResourceError {
    match error {
        DriverError::ShaderCompile(diagnostic) => ResourceError::ShaderCompile { diagnostic },
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, HeadlessDriver, HeadlessProbe};

    const VS: &str = "fn vs_main() { tint; }";
    const FS: &str = "fn fs_main() {}";

    fn setup() -> (GpuContext, ShaderCache, HeadlessProbe) {
        let (driver, probe) = HeadlessDriver::with_probe(64, 64);
        let mut ctx = GpuContext::new(Box::new(driver));
        let cache = ShaderCache::new(&mut ctx, &ShaderConfig::default()).unwrap();
        (ctx, cache, probe)
    }

    fn compiles(probe: &HeadlessProbe) -> usize {
        probe.count_calls(|call| matches!(call, DriverCall::CompileProgram { .. }))
    }

    #[test]
    fn test_source_key_is_length_prefixed() {
        assert_ne!(SourceKey::new("ab", "c"), SourceKey::new("a", "bc"));
        assert_eq!(SourceKey::new("a", "b"), SourceKey::new("a", "b"));
    }

    #[test]
    fn test_programs_are_memoized_by_source() {
        let (mut ctx, mut cache, probe) = setup();

        let first = cache.get_program(&mut ctx, VS, FS).unwrap();
        let second = cache.get_program(&mut ctx, VS, FS).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, cache.default_program());
        assert_eq!(compiles(&probe), 2);
        assert_eq!(cache.stats().cache_hits, 1);
    }

    #[test]
    fn test_default_sources_resolve_to_default_program() {
        let (mut ctx, mut cache, _probe) = setup();
        let handle = cache
            .get_program(&mut ctx, DEFAULT_VERTEX_SHADER, DEFAULT_FRAGMENT_SHADER)
            .unwrap();
        assert_eq!(handle, cache.default_program());
    }

    #[test]
    fn test_failures_are_memoized_with_diagnostic() {
        let (mut ctx, mut cache, probe) = setup();

        for _ in 0..3 {
            let err = cache.get_program(&mut ctx, "broken", FS).unwrap_err();
            assert_eq!(
                err,
                ResourceError::ShaderCompile {
                    diagnostic: "vertex shader: missing entry point `vs_main`".to_string()
                }
            );
        }
        assert_eq!(compiles(&probe), 2);
        assert_eq!(cache.stats().memoized_failure_hits, 2);
    }

    #[test]
    fn test_uniform_locations_are_memoized() {
        let (mut ctx, mut cache, _probe) = setup();
        let program = cache.get_program(&mut ctx, VS, FS).unwrap();

        let tint = cache.uniform_location(&mut ctx, program, "tint").unwrap();
        assert!(tint.is_some());
        assert_eq!(cache.uniform_location(&mut ctx, program, "tint").unwrap(), tint);
        assert_eq!(cache.uniform_location(&mut ctx, program, "absent").unwrap(), None);
    }

    #[test]
    fn test_context_loss_relinks_lazily() {
        let (mut ctx, mut cache, probe) = setup();
        let before = cache.resolve(&mut ctx, cache.default_program()).unwrap();

        probe.lose_context();
        cache.on_context_lost();
        probe.restore_context();
        ctx.invalidate();

        let after = cache.resolve(&mut ctx, cache.default_program()).unwrap();
        assert_ne!(before, after);
        assert_eq!(cache.resolve(&mut ctx, cache.default_program()).unwrap(), after);
        assert_eq!(cache.stats().relinks, 1);
    }

    #[test]
    fn test_broken_default_program_is_fatal() {
        let (driver, _probe) = HeadlessDriver::with_probe(64, 64);
        let mut ctx = GpuContext::new(Box::new(driver));
        let config = ShaderConfig {
            default_fragment_source: Some("nothing here".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            ShaderCache::new(&mut ctx, &config),
            Err(ResourceError::ShaderCompile { .. })
        ));
    }
}
