//! Error types for the Vellum renderer

use crate::types::{GroupId, InstructionId};
use std::collections::BTreeMap;
use thiserror::Error;

/// Context information for errors to aid in debugging
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    /// Operation that was being performed when the error occurred
    pub operation: String,
    /// Component or module where the error occurred
    pub component: String,
    /// Additional contextual data
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Format context for logging
    pub fn format_for_log(&self) -> String {
        let mut parts = vec![
            format!("operation={}", self.operation),
            format!("component={}", self.component),
        ];

        if !self.metadata.is_empty() {
            let metadata_str = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("metadata=[{}]", metadata_str));
        }

        parts.join(", ")
    }
}

/// Errors raised by instruction graph mutations.
///
/// A failed mutation leaves the graph unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("Unknown instruction: {0}")]
    UnknownInstruction(InstructionId),

    #[error("{instruction} is not a child of {group}")]
    NotInGroup {
        group: GroupId,
        instruction: InstructionId,
    },

    #[error("{child} is already attached to {parent}")]
    AlreadyAttached { child: GroupId, parent: GroupId },

    #[error("{child} is not attached to {parent}")]
    NotAttached { child: GroupId, parent: GroupId },

    #[error("Attaching {child} under {parent} would create a cycle")]
    Cycle { parent: GroupId, child: GroupId },

    #[error("The root group cannot be {0}")]
    RootGroup(&'static str),

    #[error("Index {index} out of range for {group} with {len} children")]
    IndexOutOfRange {
        group: GroupId,
        index: usize,
        len: usize,
    },

    #[error("{0} does not render offscreen")]
    NotOffscreen(GroupId),

    #[error("Identity {0} is already in use")]
    DuplicateId(u64),

    #[error("Mutation queue is closed")]
    QueueClosed,
}

/// Structural errors detected while compiling a group.
///
/// These are fatal to the compile pass only: the previously compiled
/// program stays in effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("Unbalanced clip nesting in {group}: {pushes} push(es), {pops} pop(s)")]
    ClipImbalance {
        group: GroupId,
        pushes: usize,
        pops: usize,
    },

    #[error("PopTransform at {instruction} has no matching push in {group}")]
    TransformUnderflow {
        group: GroupId,
        instruction: InstructionId,
    },
}

/// Errors reported by a [`GpuDriver`](../../vellum_renderer/driver/trait.GpuDriver.html)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Driver out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("Shader compilation failed: {0}")]
    ShaderCompile(String),

    #[error("GPU context lost")]
    ContextLost,

    #[error("Invalid driver resource: {0}")]
    InvalidResource(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Errors raised by the buffer pool, texture path, shader cache and
/// framebuffer manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Out of GPU memory: requested {requested} bytes with {resident} of {budget} resident")]
    OutOfGpuMemory {
        requested: u64,
        resident: u64,
        budget: u64,
    },

    #[error("Invalid or released {kind} handle")]
    InvalidHandle { kind: &'static str },

    #[error("Upload of {len} bytes at offset {offset} exceeds allocation of {size} bytes")]
    UploadOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Shader compile error: {diagnostic}")]
    ShaderCompile { diagnostic: String },

    #[error("Texture data has {actual} bytes, expected {expected}")]
    InvalidTextureData { expected: usize, actual: usize },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Failures while executing a compiled program.
///
/// A failed frame is never presented.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("driver reported: {0}")]
    Driver(#[from] DriverError),

    #[error("resource lookup failed: {0}")]
    Resource(#[from] ResourceError),

    #[error("no compiled segment for {0}")]
    MissingSegment(GroupId),
}

impl FrameError {
    /// Whether the failure means the GPU context is gone
    pub fn is_context_lost(&self) -> bool {
        matches!(
            self,
            Self::Driver(DriverError::ContextLost)
                | Self::Resource(ResourceError::Driver(DriverError::ContextLost))
        )
    }
}

/// Main error type for Vellum operations
#[derive(Debug, Error)]
pub enum VellumError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("GPU context lost")]
    ContextLost,

    #[error("Frame failed: {source}")]
    Frame {
        source: FrameError,
        context: Option<ErrorContext>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VellumError {
    /// Create a frame error with context
    pub fn frame_with_context(source: FrameError, context: ErrorContext) -> Self {
        Self::Frame {
            source,
            context: Some(context),
        }
    }

    /// Create a configuration error from a string
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Get the error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Frame { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    /// Whether the error came from a compile pass that left the previous
    /// program in effect
    pub fn is_compile_failure(&self) -> bool {
        matches!(self, Self::Compile(_))
    }

    /// Whether the error means the GPU context is gone
    pub fn is_context_lost(&self) -> bool {
        match self {
            Self::ContextLost | Self::Driver(DriverError::ContextLost) => true,
            Self::Resource(ResourceError::Driver(DriverError::ContextLost)) => true,
            Self::Frame { source, .. } => source.is_context_lost(),
            _ => false,
        }
    }

    /// Format error with context for logging
    pub fn format_for_log(&self) -> String {
        let base_msg = self.to_string();
        if let Some(context) = self.context() {
            format!("{} [{}]", base_msg, context.format_for_log())
        } else {
            base_msg
        }
    }
}

/// Result type alias for Vellum operations
pub type Result<T> = std::result::Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_formatting() {
        let context = ErrorContext::new("execute", "executor")
            .with_metadata("op", 12)
            .with_metadata("group", GroupId(3));

        assert_eq!(
            context.format_for_log(),
            "operation=execute, component=executor, metadata=[group=group#3, op=12]"
        );
    }

    #[test]
    fn test_driver_error_converts_through_resource_error() {
        let err: ResourceError = DriverError::OutOfMemory { requested: 64 }.into();
        let err: VellumError = err.into();
        assert!(matches!(
            err,
            VellumError::Resource(ResourceError::Driver(DriverError::OutOfMemory { .. }))
        ));
    }

    #[test]
    fn test_frame_error_context_in_log_line() {
        let err = VellumError::frame_with_context(
            FrameError::MissingSegment(GroupId(4)),
            ErrorContext::new("execute", "executor").with_metadata("frame", 9),
        );
        assert_eq!(
            err.format_for_log(),
            "Frame failed: no compiled segment for group#4 [operation=execute, component=executor, metadata=[frame=9]]"
        );
        assert!(FrameError::Driver(DriverError::ContextLost).is_context_lost());
    }

    #[test]
    fn test_clip_imbalance_message() {
        let err = CompileError::ClipImbalance {
            group: GroupId(7),
            pushes: 2,
            pops: 1,
        };
        assert_eq!(
            err.to_string(),
            "Unbalanced clip nesting in group#7: 2 push(es), 1 pop(s)"
        );
    }
}
