//! The processor network: processors, ports, invalidation and render sizes.
//!
//! Processors and ports are entities in a [`hecs::World`]. A processor entity
//! carries its bookkeeping, each port entity carries its declaration, its
//! connections and, for render ports, the negotiated size. The processor
//! behaviors (`Box<dyn Processor>`) and their surface containers live in side
//! tables keyed by the processor id.
//!
//! ```text
//! ImageSource ──▶ Passthrough ──▶ Canvas
//!   (origin)       (receiver)     (receiver, end processor)
//! ```
//!
//! Each frame the [`NetworkEvaluator`] negotiates sizes with
//! [`negotiate_sizes`], resizes surface containers and calls
//! [`Processor::process`] on every processor whose [`InvalidationLevel`] is
//! above [`InvalidationLevel::Valid`].

mod context;
mod evaluator;
mod graph;
mod invalidation;
mod port;
mod processor;
mod size;

pub use context::{PortImage, ProcessContext, ProcessorContext};
pub use evaluator::{FrameReport, NetworkEvaluator, ProcessTimer, ProcessWrapper};
pub use graph::ProcessorNetwork;
pub use invalidation::InvalidationLevel;
pub use port::{DataValue, PortDirection, PortKind, PortSpec, SizePolicy};
pub use processor::{Processor, PropertyValue};
pub use size::negotiate_sizes;

/// Handle to a processor in a [`ProcessorNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(pub(crate) hecs::Entity);

/// Handle to a port in a [`ProcessorNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) hecs::Entity);
