use std::any::Any;
use std::path::PathBuf;

use glam::{UVec2, Vec4};

use crate::error::{ProcessError, PropertyError};
use crate::event::{EventHandler, EventResponse, InteractionEvent};
use crate::network::{InvalidationLevel, PortSpec, ProcessContext, Processor, PropertyValue};

/// The sink at the end of a network.
///
/// Each frame the input image is copied into a private snapshot target and
/// read back, so [`last_frame`](Self::last_frame) always holds what the
/// canvas last showed. Setting the `snapshot_path` property writes the next
/// frame to that file; the property is cleared once the file is written.
///
/// A canvas made with [`with_size`](Self::with_size) has an origin inport
/// and dictates the size of everything upstream, like a window does. Its
/// `size` property resizes it; a canvas made with [`new`](Self::new) takes
/// its size from upstream and rejects that property.
/// Events sent to the canvas go to its listeners first.
pub struct Canvas {
    size: Option<UVec2>,
    last_frame: Option<Vec<f32>>,
    last_size: UVec2,
    snapshot_path: Option<PathBuf>,
    listeners: EventHandler<InteractionEvent>,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new()
    }
}

impl Canvas {
    pub const INPORT: &'static str = "image";
    pub const SNAPSHOT: &'static str = "snapshot";

    pub fn new() -> Self {
        Self {
            size: None,
            last_frame: None,
            last_size: UVec2::ZERO,
            snapshot_path: None,
            listeners: EventHandler::new(),
        }
    }

    /// A canvas that sizes its upstream, starting at `size`.
    pub fn with_size(size: UVec2) -> Self {
        Self {
            size: Some(size),
            ..Self::new()
        }
    }

    /// RGBA floats of the last frame, rows from the top.
    pub fn last_frame(&self) -> Option<&[f32]> {
        self.last_frame.as_deref()
    }

    /// Zero until the first frame.
    pub fn last_size(&self) -> UVec2 {
        self.last_size
    }

    /// The color at `(x, y)` of the last frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Vec4> {
        if x >= self.last_size.x || y >= self.last_size.y {
            return None;
        }
        let start = ((y * self.last_size.x + x) * 4) as usize;
        self.last_frame
            .as_ref()
            .and_then(|frame| frame.get(start..start + 4))
            .map(Vec4::from_slice)
    }

    pub fn listeners_mut(&mut self) -> &mut EventHandler<InteractionEvent> {
        &mut self.listeners
    }
}

impl Processor for Canvas {
    fn type_name(&self) -> &'static str {
        "Canvas"
    }

    fn ports(&self) -> Vec<PortSpec> {
        let input = PortSpec::render_in(Self::INPORT);
        let input = if self.size.is_some() { input.origin() } else { input };
        vec![input, PortSpec::render_private(Self::SNAPSHOT)]
    }

    fn is_end_processor(&self) -> bool {
        true
    }

    fn native_size(&self, port: &str) -> Option<UVec2> {
        if port == Self::INPORT { self.size } else { None }
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        if !ctx.copy_input(Self::INPORT, Self::SNAPSHOT)? {
            ctx.activate_outport(Self::SNAPSHOT)?;
            ctx.clear(Some(Vec4::ZERO), Some(1.0))?;
        }
        self.last_frame = Some(ctx.read_output(Self::SNAPSHOT)?);
        self.last_size = ctx.size();
        if let Some(path) = self.snapshot_path.take() {
            ctx.save_output(Self::SNAPSHOT, &path)?;
        }
        Ok(())
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<InvalidationLevel, PropertyError> {
        match name {
            "size" => {
                let size = value.expect_with(name, PropertyValue::as_size, "size")?;
                // The inport policy is fixed when the canvas joins a network.
                if self.size.is_none() {
                    return Err(PropertyError::Unsupported {
                        name: name.to_owned(),
                        reason: "the canvas takes its size from upstream; create it with `Canvas::with_size`",
                    });
                }
                self.size = Some(size);
            }
            "snapshot_path" => {
                let path = value.expect_with(name, |v| v.as_text().map(PathBuf::from), "text")?;
                self.snapshot_path = (!path.as_os_str().is_empty()).then_some(path);
            }
            _ => return Err(PropertyError::Unknown(name.to_owned())),
        }
        Ok(InvalidationLevel::InvalidResult)
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "size" => self.size.map(PropertyValue::Size),
            "snapshot_path" => Some(PropertyValue::Text(
                self.snapshot_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            )),
            _ => None,
        }
    }

    fn on_event(&mut self, event: &mut InteractionEvent) -> EventResponse {
        self.listeners.broadcast(event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_indexes_rows_from_the_top() {
        let mut canvas = Canvas::new();
        canvas.last_size = UVec2::new(2, 2);
        canvas.last_frame = Some((0..16).map(|v| v as f32).collect());
        assert_eq!(canvas.pixel(1, 1), Some(Vec4::new(12.0, 13.0, 14.0, 15.0)));
        assert_eq!(canvas.pixel(2, 0), None);
    }

    #[test]
    fn listeners_see_events_first() {
        let mut canvas = Canvas::new();
        canvas
            .listeners_mut()
            .add_listener_back(|_: &mut InteractionEvent| EventResponse::Accepted);
        let mut event = InteractionEvent::Key { code: 0, pressed: false };
        assert!(canvas.on_event(&mut event).is_accepted());
    }

    #[test]
    fn sized_canvas_has_an_origin_inport() {
        use crate::network::SizePolicy;
        let ports = Canvas::with_size(UVec2::new(3, 3)).ports();
        assert_eq!(ports[0].policy, SizePolicy::Origin);
        assert!(ports[1].private);
        assert_eq!(Canvas::new().ports()[0].policy, SizePolicy::Receiver);
    }

    #[test]
    fn only_a_sized_canvas_accepts_a_new_size() {
        let mut receiver = Canvas::new();
        let err = receiver
            .set_property("size", PropertyValue::Size(UVec2::new(4, 4)))
            .unwrap_err();
        assert!(matches!(err, PropertyError::Unsupported { ref name, .. } if name == "size"));
        assert_eq!(receiver.property("size"), None);
        assert_eq!(receiver.native_size(Canvas::INPORT), None);

        let mut sized = Canvas::with_size(UVec2::new(3, 3));
        assert!(matches!(
            sized.set_property("size", PropertyValue::Size(UVec2::new(4, 4))),
            Ok(InvalidationLevel::InvalidResult)
        ));
        assert_eq!(sized.native_size(Canvas::INPORT), Some(UVec2::new(4, 4)));
    }
}
