use std::any::Any;

use glam::{UVec2, Vec4};

use crate::error::{ProcessError, PropertyError};
use crate::network::{InvalidationLevel, PortSpec, ProcessContext, Processor, PropertyValue};

/// Fills its outport with a solid color.
///
/// The outport is a size origin by default, so everything downstream renders
/// at the source's size. [`ImageSource::fixed`] makes it a static port that
/// sizes only its direct receivers without claiming to be their origin.
pub struct ImageSource {
    size: UVec2,
    color: Vec4,
    fixed: bool,
}

impl ImageSource {
    pub const OUTPORT: &'static str = "image";

    pub fn new(size: UVec2, color: Vec4) -> Self {
        Self {
            size,
            color,
            fixed: false,
        }
    }

    /// A source whose outport is a static size, not an origin.
    pub fn fixed(size: UVec2, color: Vec4) -> Self {
        Self {
            fixed: true,
            ..Self::new(size, color)
        }
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn color(&self) -> Vec4 {
        self.color
    }
}

impl Processor for ImageSource {
    fn type_name(&self) -> &'static str {
        "ImageSource"
    }

    fn ports(&self) -> Vec<PortSpec> {
        let port = PortSpec::render_out(Self::OUTPORT);
        vec![if self.fixed { port.static_size() } else { port.origin() }]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        ctx.activate_outport(Self::OUTPORT)?;
        ctx.clear(Some(self.color), Some(1.0))
    }

    fn native_size(&self, port: &str) -> Option<UVec2> {
        (port == Self::OUTPORT).then_some(self.size)
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<InvalidationLevel, PropertyError> {
        match name {
            "size" => self.size = value.expect_with(name, PropertyValue::as_size, "size")?,
            "color" => self.color = value.expect_with(name, PropertyValue::as_color, "color")?,
            _ => return Err(PropertyError::Unknown(name.to_owned())),
        }
        Ok(InvalidationLevel::InvalidResult)
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "size" => Some(PropertyValue::Size(self.size)),
            "color" => Some(PropertyValue::Color(self.color)),
            _ => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
