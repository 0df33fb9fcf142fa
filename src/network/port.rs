use std::any::Any;
use std::sync::Arc;

use glam::UVec2;

use crate::network::{InvalidationLevel, PortId, ProcessorId};
use crate::surface::SurfaceAttributes;

/// A value carried by a data port.
pub type DataValue = Arc<dyn Any + Send + Sync>;

/// Which way data flows through a port. Edges always run from an
/// [`Out`](Self::Out) port to an [`In`](Self::In) port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Consumes what a predecessor produced.
    In,
    /// Produces for any number of successors.
    Out,
}

/// What a port carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// An image in a render surface.
    Render,
    /// A value of the named type. Only ports with equal names connect.
    Data(&'static str),
}

/// How a render port arrives at its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SizePolicy {
    /// Fixed by the owner; never dictated by, nor dictating, other ports.
    Static,
    /// Dictates the size of every receiver it reaches.
    Origin,
    /// Takes the size of whichever origin reaches it.
    #[default]
    Receiver,
}

/// A port as a processor declares it.
///
/// Specs are returned from [`Processor::ports`](crate::Processor::ports)
/// once, when the processor is added, and are fixed from then on. Start
/// from one of the constructors and refine with the builder methods.
///
/// Render outports and private ports each own one target in the
/// processor's [`SurfaceContainer`](crate::SurfaceContainer), in
/// declaration order. Render inports only read what their producer wrote.
///
/// # Example
///
/// ```
/// use phalanx::{PortDirection, PortSpec, SizePolicy};
///
/// let out = PortSpec::render_out("image").origin();
/// assert_eq!(out.direction, PortDirection::Out);
/// assert_eq!(out.policy, SizePolicy::Origin);
///
/// let mask = PortSpec::data_in("mask", "Mask").optional();
/// assert!(mask.optional);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    /// Unique among the processor's ports.
    pub name: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    /// Only meaningful for render ports.
    pub policy: SizePolicy,
    /// An unconnected optional inport does not make the processor unready.
    pub optional: bool,
    /// Accepts more than one producer.
    pub multi_input: bool,
    /// An intermediate target that cannot be connected.
    pub private: bool,
    /// Surface role of the port's target. Render ports without one use
    /// [`RuntimeConfig::render_port_attributes`](crate::RuntimeConfig::render_port_attributes).
    pub attributes: Option<SurfaceAttributes>,
}

impl PortSpec {
    fn new(name: impl Into<String>, direction: PortDirection, kind: PortKind) -> Self {
        Self {
            name: name.into(),
            direction,
            kind,
            policy: SizePolicy::Receiver,
            optional: false,
            multi_input: false,
            private: false,
            attributes: None,
        }
    }

    /// A render inport taking its size from upstream.
    pub fn render_in(name: impl Into<String>) -> Self {
        Self::new(name, PortDirection::In, PortKind::Render)
    }

    /// A render outport taking its size from whatever it is connected to.
    pub fn render_out(name: impl Into<String>) -> Self {
        Self::new(name, PortDirection::Out, PortKind::Render)
    }

    /// A render target owned by the processor that is never connected.
    pub fn render_private(name: impl Into<String>) -> Self {
        Self {
            private: true,
            ..Self::new(name, PortDirection::Out, PortKind::Render)
        }
    }

    /// A data inport accepting values published under `type_name`.
    pub fn data_in(name: impl Into<String>, type_name: &'static str) -> Self {
        Self::new(name, PortDirection::In, PortKind::Data(type_name))
    }

    /// A data outport publishing values under `type_name`.
    pub fn data_out(name: impl Into<String>, type_name: &'static str) -> Self {
        Self::new(name, PortDirection::Out, PortKind::Data(type_name))
    }

    /// Makes the port dictate the size of every receiver it reaches. The
    /// size comes from [`Processor::native_size`](crate::Processor::native_size)
    /// or a [`request_size`](crate::ProcessorNetwork::request_size).
    pub fn origin(mut self) -> Self {
        self.policy = SizePolicy::Origin;
        self
    }

    /// Fixes the port's size to what its owner asks for, without
    /// imposing it on anyone else.
    pub fn static_size(mut self) -> Self {
        self.policy = SizePolicy::Static;
        self
    }

    /// Lets the processor run with this inport unconnected.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Allows more than one producer on this inport. Without it, a second
    /// connection is refused.
    pub fn multi_input(mut self) -> Self {
        self.multi_input = true;
        self
    }

    /// Overrides the surface role of the port's target, e.g. to add a
    /// depth texture or ask for a float format.
    pub fn attributes(mut self, attributes: SurfaceAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Whether the port carries images.
    pub fn is_render(&self) -> bool {
        self.kind == PortKind::Render
    }

    /// Whether the port consumes.
    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::In
    }

    /// Whether the port owns a target in the processor's container.
    pub(crate) fn owns_target(&self) -> bool {
        self.is_render() && self.direction == PortDirection::Out
    }
}

/// Processor bookkeeping stored on the processor entity.
#[derive(Debug)]
pub(crate) struct Node {
    pub name: String,
    pub type_name: &'static str,
    /// Insertion order, used for deterministic tie-breaking.
    pub seq: u64,
    pub ports: Vec<PortId>,
    pub level: InvalidationLevel,
    pub initialized: bool,
    /// `initialize` failed and is not retried until a property or the
    /// program changes.
    pub init_failed: bool,
}

#[derive(Debug)]
pub(crate) struct Port {
    pub owner: ProcessorId,
    pub spec: PortSpec,
    pub connections: Vec<PortId>,
}

/// Negotiated state of a render port.
#[derive(Debug, Clone, Default)]
pub(crate) struct RenderState {
    /// Size requested from outside the network.
    pub requested: Option<UVec2>,
    pub size: UVec2,
    pub origin: Option<PortId>,
    pub valid_result: bool,
    /// Target index in the owner's container, for outports and private ports.
    pub target: Option<usize>,
}

#[derive(Default)]
pub(crate) struct DataSlot {
    pub value: Option<DataValue>,
}
