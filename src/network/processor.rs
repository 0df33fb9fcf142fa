use std::any::Any;

use glam::{UVec2, Vec4};

use crate::error::{ProcessError, PropertyError};
use crate::event::{EventResponse, InteractionEvent};
use crate::gpu::GraphicsContext;
use crate::network::{InvalidationLevel, PortSpec, ProcessContext, ProcessorContext};

/// A typed configuration value.
///
/// Properties are how the outside world tunes a processor: a UI writes them
/// through [`ProcessorNetwork::set_property`](crate::ProcessorNetwork::set_property),
/// which invalidates as far as the processor reports.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Size(UVec2),
    Color(Vec4),
    Text(String),
}

impl PropertyValue {
    /// Name of the variant, as used in [`PropertyError::WrongType`].
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Size(_) => "size",
            PropertyValue::Color(_) => "color",
            PropertyValue::Text(_) => "text",
        }
    }

    /// The value if it is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The value if it is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Ints widen to floats.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    /// The value if it is a `Size`.
    pub fn as_size(&self) -> Option<UVec2> {
        match self {
            PropertyValue::Size(v) => Some(*v),
            _ => None,
        }
    }

    /// The value if it is a `Color`.
    pub fn as_color(&self) -> Option<Vec4> {
        match self {
            PropertyValue::Color(v) => Some(*v),
            _ => None,
        }
    }

    /// The value if it is `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Typed accessor helper for [`Processor::set_property`] implementations.
    ///
    /// # Example
    ///
    /// ```
    /// use phalanx::PropertyValue;
    ///
    /// let value = PropertyValue::Float(0.5);
    /// assert_eq!(value.expect_with("gain", PropertyValue::as_float, "float"), Ok(0.5));
    /// assert!(value.expect_with("name", |v| v.as_text().map(str::to_owned), "text").is_err());
    /// ```
    pub fn expect_with<T>(
        &self,
        name: &str,
        get: impl FnOnce(&Self) -> Option<T>,
        expected: &'static str,
    ) -> Result<T, PropertyError> {
        get(self).ok_or_else(|| PropertyError::WrongType {
            name: name.to_owned(),
            expected,
        })
    }
}

/// A node of the processor network.
///
/// A processor declares its ports once through [`ports`](Self::ports). The
/// network owns it and drives it through the hooks below:
///
/// 1. [`initialize`](Self::initialize) once, before the first frame it takes
///    part in. Acquire programs and kept sampling slots here.
/// 2. [`rebuild_programs`](Self::rebuild_programs) when its level reaches
///    [`InvalidationLevel::InvalidProgram`].
/// 3. [`before_process`](Self::before_process), [`process`](Self::process)
///    and [`after_process`](Self::after_process) on every frame its level is
///    above [`InvalidationLevel::Valid`] and it is ready.
/// 4. [`deinitialize`](Self::deinitialize) when removed from the network.
///    Everything acquired in `initialize` must be released here.
///
/// # Implementing a Processor
///
/// ```
/// use std::any::Any;
/// use glam::Vec4;
/// use phalanx::{PortSpec, ProcessContext, ProcessError, Processor};
///
/// struct Fill;
///
/// impl Processor for Fill {
///     fn type_name(&self) -> &'static str {
///         "Fill"
///     }
///
///     fn ports(&self) -> Vec<PortSpec> {
///         vec![PortSpec::render_out("image").origin()]
///     }
///
///     fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
///         ctx.activate_outport("image")?;
///         ctx.clear(Some(Vec4::ONE), Some(1.0))?;
///         Ok(())
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
///
///     fn as_any_mut(&mut self) -> &mut dyn Any {
///         self
///     }
/// }
/// ```
pub trait Processor: 'static {
    /// The processor's type, for logs and leak reports.
    fn type_name(&self) -> &'static str;

    /// Port declarations. Called once when the processor is added.
    fn ports(&self) -> Vec<PortSpec>;

    /// Acquires programs and other per-device resources.
    ///
    /// Runs once before the processor first takes part in a pass, after its
    /// surface container was created. An error leaves the processor
    /// uninitialized and unready; see
    /// [`NetworkEvaluator::initialize_network`](crate::NetworkEvaluator::initialize_network)
    /// for when it is tried again.
    fn initialize(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        let _ = ctx;
        Ok(())
    }

    /// Releases every GPU resource the processor owns privately.
    fn deinitialize(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        let _ = ctx;
        Ok(())
    }

    /// Renders into the outports at the negotiated size.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError>;

    /// Runs right before `process`.
    fn before_process(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs right after a successful `process`.
    fn after_process(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        let _ = ctx;
        Ok(())
    }

    /// Recompiles owned programs.
    fn rebuild_programs(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        let _ = ctx;
        Ok(())
    }

    /// Whether to run `initialize` again after it failed, although nothing
    /// in the network changed. Processors reading external files return
    /// `true` once those files were edited.
    fn retry_initialize(&self, gfx: &GraphicsContext) -> bool {
        let _ = gfx;
        false
    }

    /// An extra readiness condition on top of port readiness.
    fn is_ready(&self) -> bool {
        true
    }

    /// Keeps the processor in the rendering order even though it has
    /// outports, e.g. for side effects such as picking.
    fn is_end_processor(&self) -> bool {
        false
    }

    /// The size the processor wants on an origin or static port.
    fn native_size(&self, port: &str) -> Option<UVec2> {
        let _ = port;
        None
    }

    /// Applies `value` and returns how far the change invalidates the
    /// processor.
    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<InvalidationLevel, PropertyError> {
        let _ = value;
        Err(PropertyError::Unknown(name.to_owned()))
    }

    /// The current value of property `name`.
    fn property(&self, name: &str) -> Option<PropertyValue> {
        let _ = name;
        None
    }

    /// Handles an interaction event travelling upstream from a sink.
    /// Returning [`EventResponse::Accepted`] stops it.
    fn on_event(&mut self, event: &mut InteractionEvent) -> EventResponse {
        let _ = event;
        EventResponse::Continue
    }

    /// Support for [`ProcessorNetwork::processor_as`](crate::ProcessorNetwork::processor_as).
    /// Implement as `self`.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
