//! Error types for every subsystem.
//!
//! Configuration problems (bad shader source, missing files, unknown ports)
//! come back as `Err` values and are never fatal. Each subsystem owns one
//! enum; wrappers convert with `?` through `#[from]`.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::{AttachmentPoint, FramebufferId, ShaderStage, TextureId};
use crate::network::{PortId, ProcessorId};
use crate::shader::ProgramHandle;

/// Errors raised by a [`GpuBackend`](crate::GpuBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureId),
    #[error("unknown framebuffer {0:?}")]
    UnknownFramebuffer(FramebufferId),
    #[error("unknown shader object {0}")]
    UnknownShader(u64),
    #[error("no render surface is bound")]
    NoFramebufferBound,
    #[error("nothing is attached at {0:?}")]
    NothingAttached(AttachmentPoint),
    #[error("no program is in use")]
    NoProgram,
    #[error("shader binding {0} has no texture bound")]
    MissingBinding(u32),
    #[error("sampling slot {slot} is out of range (capacity {capacity})")]
    SlotOutOfRange { slot: u32, capacity: u32 },
    #[error("size {width}x{height} exceeds the device limit of {limit}")]
    SizeExceeded { width: u32, height: u32, limit: u32 },
    #[error("requested region lies outside the attachment")]
    OutOfBounds,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device error: {0}")]
    Device(String),
}

/// A compiler or linker message, with the line it refers to when known.
///
/// `line` is 1-based and counts lines of the source handed to the backend;
/// the program cache maps it back to the originating file.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ShaderDiagnostic {
    pub message: String,
    pub line: Option<u32>,
}

impl ShaderDiagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }
}

/// Errors claiming a sampling slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("all {capacity} sampling slots are in use")]
    Exhausted { capacity: u32 },
}

/// Errors resolving or preprocessing shader source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("shader source `{name}` not found (searched {searched:?})")]
    NotFound { name: String, searched: Vec<PathBuf> },
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("include cycle: {chain}")]
    IncludeCycle { chain: String },
    #[error("{file}:{line}: malformed #include directive")]
    MalformedInclude { file: String, line: usize },
}

/// Errors loading or rebuilding a program.
///
/// Compile logs have their line numbers mapped back to the
/// originating file.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to compile {stage:?} stage `{file}`:\n{log}")]
    Compile {
        stage: ShaderStage,
        file: String,
        log: String,
    },
    #[error("failed to link program `{label}`:\n{log}")]
    Link { label: String, log: String },
    #[error("a program needs at least one stage")]
    NoStages,
    #[error("unknown program handle {0:?}")]
    UnknownHandle(ProgramHandle),
}

/// Errors from a [`SurfaceContainer`](crate::SurfaceContainer).
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("target {0} is not registered")]
    InvalidTarget(usize),
    #[error("target {0} has no color attachment")]
    NoColor(usize),
    #[error("target {0} has no depth attachment")]
    NoDepth(usize),
    #[error("target {0} is not a cube map")]
    NotCubeMap(usize),
    #[error("container is not attached to a graphics context")]
    NotAttached,
    #[error("{requested} simultaneous targets requested, the device supports {supported}")]
    TooManyTargets { requested: usize, supported: u32 },
    #[error("targets {0:?} cannot be activated together")]
    IncompatibleTargets(Vec<usize>),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Errors setting a processor property.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("unknown property `{0}`")]
    Unknown(String),
    #[error("property `{name}` expects a {expected} value")]
    WrongType { name: String, expected: &'static str },
    /// The property exists but cannot take effect on this processor.
    #[error("property `{name}` cannot be set: {reason}")]
    Unsupported { name: String, reason: &'static str },
}

/// Errors editing the processor network.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("unknown processor {0:?}")]
    UnknownProcessor(ProcessorId),
    #[error("unknown port {0:?}")]
    UnknownPort(PortId),
    #[error("processor `{processor}` has no port `{port}`")]
    NoSuchPort { processor: String, port: String },
    #[error("processor `{processor}` declares port `{port}` twice")]
    DuplicatePort { processor: String, port: String },
    #[error("`{from}` -> `{to}` must connect an outport to an inport")]
    Direction { from: String, to: String },
    #[error("`{from}` and `{to}` carry incompatible data")]
    TypeMismatch { from: String, to: String },
    #[error("private port `{0}` cannot be connected")]
    PrivatePort(String),
    #[error("a processor cannot be connected to itself")]
    SameProcessor,
    #[error("ports are already connected")]
    AlreadyConnected,
    #[error("inport `{0}` already has a producer")]
    InputOccupied(String),
    #[error("connection would create a cycle")]
    Cycle,
    #[error("ports are not connected")]
    NotConnected,
    #[error(transparent)]
    Property(#[from] PropertyError),
}

/// Errors returned from processor hooks.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Message(String),
}

/// Errors from the [`NetworkEvaluator`](crate::NetworkEvaluator) itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EvaluatorError {
    #[error("the network evaluator is locked")]
    Locked,
}
