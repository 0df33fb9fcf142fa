//! # Phalanx
//!
//! **A render-pipeline coordination runtime for processor-network
//! visualization engines.**
//!
//! A visualization is a directed graph of processors connected through typed
//! ports. Phalanx decides which processors have to run each frame, settles
//! the resolution every image port renders at, and manages the GPU resources
//! that make the per-frame pass safe: render surfaces, sampling slots and
//! compiled programs.
//!
//! ## Quick Start
//!
//! ```
//! use glam::{UVec2, Vec4};
//! use phalanx::processors::{Canvas, ImageSource, Passthrough};
//! use phalanx::*;
//!
//! let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
//! let mut network = ProcessorNetwork::new();
//!
//! let source = network.add("source", ImageSource::new(UVec2::new(400, 300), Vec4::ONE)).unwrap();
//! let copy = network.add("copy", Passthrough::new()).unwrap();
//! let canvas = network.add("canvas", Canvas::new()).unwrap();
//! network.connect_ports(source, "image", copy, "input").unwrap();
//! network.connect_ports(copy, "output", canvas, "image").unwrap();
//!
//! let mut evaluator = NetworkEvaluator::new();
//! evaluator.process(&mut network, &mut gfx).unwrap();
//!
//! let sink: &Canvas = network.processor_as(canvas).unwrap();
//! assert_eq!(sink.last_size(), UVec2::new(400, 300));
//! assert_eq!(sink.pixel(10, 10), Some(Vec4::ONE));
//!
//! evaluator.deinitialize_network(&mut network, &mut gfx);
//! assert!(gfx.shutdown().is_clean());
//! ```
//!
//! ## Pieces
//!
//! - [`ProcessorNetwork`] owns processors and ports; [`NetworkEvaluator`]
//!   runs it one frame at a time.
//! - [`InvalidationLevel`] tracks why a processor has to run again.
//! - [`negotiate_sizes`] settles render port sizes from their [`SizePolicy`].
//! - [`GraphicsContext`] owns the [`GpuBackend`], the [`SlotAllocator`] and
//!   the [`ProgramCache`]; it is passed by `&mut` wherever GPU state changes.
//! - [`SurfaceContainer`] holds the render targets of a processor.
//! - [`EventHandler`] dispatches events to ordered listeners.
//!
//! Two backends ship: [`HeadlessBackend`], a CPU reference used by the
//! tests, and [`WgpuBackend`] on a headless wgpu device.

mod backend;
mod config;
mod error;
mod event;
mod gpu;
mod network;
pub mod processors;
mod shader;
mod slots;
mod surface;

pub use backend::{
    Attachment, AttachmentPoint, DrawRecord, FramebufferId, GpuBackend, GpuCapabilities,
    HeadlessBackend, LiveObjects, PixelRegion, ProgramId, ReadSource, ShaderStage, StageId,
    TextureDescriptor, TextureFormat, TextureId, TextureKind, WgpuBackend,
};
pub use config::RuntimeConfig;
pub use error::{
    BackendError, EvaluatorError, NetworkError, ProcessError, ProgramError, PropertyError,
    ShaderDiagnostic, SlotError, SourceError, SurfaceError,
};
pub use event::{
    EventHandler, EventListener, EventResponse, InteractionEvent, ListenerId, MouseButton,
};
pub use gpu::{ContainerId, GraphicsContext, LeakReport};
pub use network::{
    negotiate_sizes, DataValue, FrameReport, InvalidationLevel, NetworkEvaluator, PortDirection,
    PortId, PortImage, PortKind, PortSpec, ProcessContext, ProcessTimer, ProcessWrapper,
    Processor, ProcessorContext, ProcessorId, ProcessorNetwork, PropertyValue, SizePolicy,
};
pub use shader::{
    preprocess, FileSystemResolver, LineMap, LiveProgram, MemoryResolver, Preprocessed,
    ProgramCache, ProgramHandle, SourceFile, SourceResolver, SourceStamp, StageSource,
    HEADER_NAME,
};
pub use slots::{SlotAllocator, SlotClaim};
pub use surface::{SurfaceAttributes, SurfaceContainer};
