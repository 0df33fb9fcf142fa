use std::any::Any;

use glam::Vec4;

use crate::error::ProcessError;
use crate::network::{PortSpec, ProcessContext, Processor};

/// Copies its input image to its output.
///
/// When the sizes disagree, which happens for one frame after a producer
/// stops being the size origin, the output is cleared instead.
#[derive(Debug, Default)]
pub struct Passthrough {
    copies: u64,
}

impl Passthrough {
    pub const INPORT: &'static str = "input";
    pub const OUTPORT: &'static str = "output";

    pub fn new() -> Self {
        Self::default()
    }

    /// How many frames were copied rather than cleared.
    pub fn copies(&self) -> u64 {
        self.copies
    }
}

impl Processor for Passthrough {
    fn type_name(&self) -> &'static str {
        "Passthrough"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::render_in(Self::INPORT),
            PortSpec::render_out(Self::OUTPORT),
        ]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        if ctx.copy_input(Self::INPORT, Self::OUTPORT)? {
            self.copies += 1;
            return Ok(());
        }
        log::debug!("`{}`: input and output sizes differ, clearing", ctx.name());
        ctx.activate_outport(Self::OUTPORT)?;
        ctx.clear(Some(Vec4::ZERO), Some(1.0))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
