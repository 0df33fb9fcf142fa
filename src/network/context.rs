use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use glam::{UVec2, Vec4};

use crate::backend::TextureId;
use crate::error::{NetworkError, ProcessError, SurfaceError};
use crate::gpu::GraphicsContext;
use crate::network::{DataValue, InvalidationLevel, ProcessorId};
use crate::surface::SurfaceContainer;

/// What a processor hook gets outside of `process`.
///
/// Passed to `initialize`, `deinitialize`, `rebuild_programs` and the
/// before/after hooks. It exposes the graphics context for loading programs
/// and claiming kept sampling slots, plus the processor's identity for log
/// messages.
pub struct ProcessorContext<'a> {
    gfx: &'a mut GraphicsContext,
    id: ProcessorId,
    name: &'a str,
}

impl<'a> ProcessorContext<'a> {
    pub(crate) fn new(gfx: &'a mut GraphicsContext, id: ProcessorId, name: &'a str) -> Self {
        Self { gfx, id, name }
    }

    /// The graphics context the network runs on.
    pub fn gfx(&mut self) -> &mut GraphicsContext {
        self.gfx
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// The processor's instance name.
    pub fn name(&self) -> &str {
        self.name
    }
}

/// The surface behind a render port.
///
/// For inports the textures belong to the producer's container and are only
/// valid for reading during the current `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortImage {
    /// The color texture, unless the target has no color aspect.
    pub color: Option<TextureId>,
    /// The depth texture, if the target's attributes ask for one.
    pub depth: Option<TextureId>,
    pub size: UVec2,
    /// Whether the producer wrote it since it was last invalidated.
    pub valid: bool,
}

/// What a processor gets during [`Processor::process`](crate::Processor::process).
///
/// The context resolves port names to surfaces: inports to the producers'
/// targets and outports to targets in the processor's own container. An
/// outport counts as written once it was activated or copied into; only
/// written outports get a valid result after `process` returns.
///
/// A typical filter reads its input, renders into its output and leaves the
/// rest to the network:
///
/// ```
/// use std::any::Any;
/// use glam::Vec4;
/// use phalanx::{PortSpec, ProcessContext, ProcessError, Processor};
///
/// struct Fade;
///
/// impl Processor for Fade {
///     fn type_name(&self) -> &'static str {
///         "Fade"
///     }
///
///     fn ports(&self) -> Vec<PortSpec> {
///         vec![PortSpec::render_in("input"), PortSpec::render_out("output")]
///     }
///
///     fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
///         if !ctx.copy_input("input", "output")? {
///             ctx.activate_outport("output")?;
///             ctx.clear(Some(Vec4::ZERO), None)?;
///         }
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
pub struct ProcessContext<'a> {
    gfx: &'a mut GraphicsContext,
    container: Option<&'a mut SurfaceContainer>,
    id: ProcessorId,
    name: &'a str,
    size: UVec2,
    level: InvalidationLevel,
    outputs: Vec<(String, usize)>,
    inputs: Vec<(String, Vec<PortImage>)>,
    data_in: Vec<(String, Vec<DataValue>)>,
    data_out: Vec<(String, DataValue)>,
    written: Vec<String>,
}

/// Ports a `process` call wrote.
pub(crate) struct ProcessOutcome {
    pub written: Vec<String>,
    pub data: Vec<(String, DataValue)>,
}

impl<'a> ProcessContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        gfx: &'a mut GraphicsContext,
        container: Option<&'a mut SurfaceContainer>,
        id: ProcessorId,
        name: &'a str,
        size: UVec2,
        level: InvalidationLevel,
        outputs: Vec<(String, usize)>,
        inputs: Vec<(String, Vec<PortImage>)>,
        data_in: Vec<(String, Vec<DataValue>)>,
    ) -> Self {
        Self {
            gfx,
            container,
            id,
            name,
            size,
            level,
            outputs,
            inputs,
            data_in,
            data_out: Vec::new(),
            written: Vec::new(),
        }
    }

    /// The graphics context, e.g. for claiming sampling slots and drawing.
    pub fn gfx(&mut self) -> &mut GraphicsContext {
        self.gfx
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// The processor's instance name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// The processor's negotiated render size.
    pub fn size(&self) -> UVec2 {
        self.size
    }

    /// The level the processor had when the pass reached it.
    pub fn level(&self) -> InvalidationLevel {
        self.level
    }

    /// Makes the target of render outport or private port `name` the
    /// render destination.
    pub fn activate_outport(&mut self, name: &str) -> Result<(), ProcessError> {
        self.activate_outports(&[name])
    }

    /// Activates several outports as simultaneous color targets.
    pub fn activate_outports(&mut self, names: &[&str]) -> Result<(), ProcessError> {
        let targets = names
            .iter()
            .map(|name| self.target(name))
            .collect::<Result<Vec<_>, _>>()?;
        let label = names.join("+");
        let container = self.container.as_deref_mut().ok_or(SurfaceError::NotAttached)?;
        container.set_active_targets(self.gfx, &targets, &label)?;
        for name in names {
            self.mark_written(name);
        }
        Ok(())
    }

    /// Releases the render destination. Activating another outport does
    /// this implicitly.
    pub fn deactivate(&mut self) -> Result<(), ProcessError> {
        if let Some(container) = self.container.as_deref_mut() {
            container.deactivate(self.gfx)?;
        }
        Ok(())
    }

    /// Clears the active targets. `None` leaves that aspect untouched.
    pub fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>) -> Result<(), ProcessError> {
        self.gfx.backend_mut().clear(color, depth)?;
        Ok(())
    }

    /// The image of the first producer connected to inport `name`.
    pub fn input(&self, name: &str) -> Option<PortImage> {
        self.inputs(name).first().copied()
    }

    /// Images of every producer connected to inport `name`, in connection
    /// order.
    pub fn inputs(&self, name: &str) -> &[PortImage] {
        self.inputs
            .iter()
            .find(|(port, _)| port == name)
            .map(|(_, images)| images.as_slice())
            .unwrap_or(&[])
    }

    /// The surface of the processor's own outport or private port `name`.
    pub fn output(&self, name: &str) -> Option<PortImage> {
        let target = self.target(name).ok()?;
        let container = self.container.as_deref()?;
        Some(PortImage {
            color: container.color_texture(target),
            depth: container.depth_texture(target),
            size: container.size(),
            valid: self.written.iter().any(|port| port == name),
        })
    }

    /// Copies color and depth of inport `input` into outport `output`.
    ///
    /// Returns `false` without copying when the sizes differ.
    pub fn copy_input(&mut self, input: &str, output: &str) -> Result<bool, ProcessError> {
        let Some(source) = self.input(input) else {
            return Ok(false);
        };
        let destination = self.output(output).ok_or_else(|| self.no_such_port(output))?;
        if source.size != destination.size {
            return Ok(false);
        }
        if let (Some(src), Some(dst)) = (source.color, destination.color) {
            self.gfx.backend_mut().copy_texture(src, dst)?;
        }
        if let (Some(src), Some(dst)) = (source.depth, destination.depth) {
            self.gfx.backend_mut().copy_texture(src, dst)?;
        }
        self.mark_written(output);
        Ok(true)
    }

    /// RGBA floats of outport `name`, rows from the top.
    pub fn read_output(&mut self, name: &str) -> Result<Vec<f32>, ProcessError> {
        let target = self.target(name)?;
        let container = self.container.as_deref_mut().ok_or(SurfaceError::NotAttached)?;
        Ok(container.target_as_floats(self.gfx, target)?)
    }

    /// Writes outport `name` to an image file; the extension picks the
    /// format.
    pub fn save_output(&mut self, name: &str, path: impl AsRef<Path>) -> Result<(), ProcessError> {
        let target = self.target(name)?;
        let container = self.container.as_deref_mut().ok_or(SurfaceError::NotAttached)?;
        container.save_target_image(self.gfx, target, path)?;
        Ok(())
    }

    /// Publishes `value` on data outport `name` once `process` returns.
    pub fn set_output_data<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        let value: DataValue = Arc::new(value);
        self.data_out.retain(|(port, _)| port != name);
        self.data_out.push((name.to_owned(), value));
    }

    /// The value on data inport `name`, if a producer published a `T`.
    pub fn input_data<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.data_in
            .iter()
            .find(|(port, _)| port == name)
            .and_then(|(_, values)| values.first())
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    pub(crate) fn finish(self) -> ProcessOutcome {
        ProcessOutcome {
            written: self.written,
            data: self.data_out,
        }
    }

    fn target(&self, name: &str) -> Result<usize, ProcessError> {
        self.outputs
            .iter()
            .find(|(port, _)| port == name)
            .map(|(_, target)| *target)
            .ok_or_else(|| self.no_such_port(name))
    }

    fn no_such_port(&self, port: &str) -> ProcessError {
        NetworkError::NoSuchPort {
            processor: self.name.to_owned(),
            port: port.to_owned(),
        }
        .into()
    }

    fn mark_written(&mut self, name: &str) {
        if !self.written.iter().any(|port| port == name) {
            self.written.push(name.to_owned());
        }
    }
}
