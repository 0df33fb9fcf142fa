use std::path::Path;

use glam::{UVec2, Vec4};

use crate::backend::{
    Attachment, AttachmentPoint, FramebufferId, PixelRegion, ReadSource, TextureDescriptor,
    TextureId, TextureKind,
};
use crate::error::{BackendError, SurfaceError};
use crate::gpu::{ContainerId, GraphicsContext, SharedBinding};
use crate::surface::SurfaceAttributes;

const CUBE_FACES: u32 = 6;

#[derive(Debug)]
struct Target {
    attributes: SurfaceAttributes,
    color: Option<TextureId>,
    depth: Option<TextureId>,
    bytes: usize,
    debug_label: String,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            attributes: SurfaceAttributes::empty(),
            color: None,
            depth: None,
            bytes: 0,
            debug_label: String::new(),
        }
    }
}

impl Target {
    fn is_allocated(&self) -> bool {
        self.color.is_some() || self.depth.is_some()
    }

    fn wants_textures(&self) -> bool {
        !self.attributes.is_framebuffer()
            && (self.attributes.has_color() || self.attributes.has_depth())
    }
}

/// Targets plus cube face of an activation.
type Activation = (Vec<usize>, u32);

/// A growable set of render targets sharing one size and one framebuffer.
///
/// Target ids are indices. Registering an id past the capacity grows the
/// container by the configured increment. Textures exist only once the
/// container is attached to a context and has a non-zero size.
///
/// A *shared* container takes the render binding away from whichever other
/// shared container held it, detaching that one's attachments first.
///
/// Call [`destroy`](Self::destroy) before dropping; a container dropped with
/// GPU objects still alive logs an error.
///
/// # Lifecycle
///
/// 1. [`new`](Self::new), then [`initialize_target`](Self::initialize_target)
///    for every target.
/// 2. [`attach_context`](Self::attach_context) creates the framebuffer.
/// 3. [`set_size`](Self::set_size) allocates and clears the textures; every
///    later resize reallocates them.
/// 4. [`set_active_target`](Self::set_active_target) and friends route
///    draws; reads go through [`target_as_floats`](Self::target_as_floats).
/// 5. [`destroy`](Self::destroy).
///
/// # Example
///
/// ```
/// use glam::{UVec2, Vec4};
/// use phalanx::{GraphicsContext, HeadlessBackend, RuntimeConfig, SurfaceAttributes, SurfaceContainer};
///
/// let mut ctx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
/// let mut container = SurfaceContainer::new(&mut ctx, 1, false);
/// container.initialize_target(0, SurfaceAttributes::RGBA);
/// container.attach_context(&mut ctx).unwrap();
/// container.set_size(&mut ctx, UVec2::new(4, 2)).unwrap();
///
/// container.set_active_target(&mut ctx, 0, "scene").unwrap();
/// ctx.backend_mut().clear(Some(Vec4::ONE), None).unwrap();
/// assert_eq!(container.target_pixel(&mut ctx, 0, 3, 1).unwrap(), Vec4::ONE);
///
/// container.destroy(&mut ctx);
/// assert!(ctx.shutdown().is_clean());
/// ```
pub struct SurfaceContainer {
    id: ContainerId,
    shared: bool,
    targets: Vec<Target>,
    used: usize,
    increment: usize,
    size: UVec2,
    framebuffer: Option<FramebufferId>,
    current: Vec<usize>,
    face: u32,
    points: Vec<AttachmentPoint>,
    stack: Vec<Option<Activation>>,
}

impl SurfaceContainer {
    /// An empty container with room for `capacity` targets. No GPU object
    /// exists until [`attach_context`](Self::attach_context).
    pub fn new(ctx: &mut GraphicsContext, capacity: usize, shared: bool) -> Self {
        let mut targets = Vec::new();
        targets.resize_with(capacity, Target::default);
        Self {
            id: ctx.next_container_id(),
            shared,
            targets,
            used: 0,
            increment: ctx.config().surface_capacity_increment.max(1),
            size: UVec2::ZERO,
            framebuffer: None,
            current: Vec::new(),
            face: 0,
            points: Vec::new(),
            stack: Vec::new(),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Number of target slots, registered or not.
    pub fn capacity(&self) -> usize {
        self.targets.len()
    }

    /// One past the highest registered id.
    pub fn num_used(&self) -> usize {
        self.used
    }

    /// The size every target shares.
    pub fn size(&self) -> UVec2 {
        self.size
    }

    /// The framebuffer object, once attached.
    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.framebuffer
    }

    /// Registers the role of target `id`.
    ///
    /// Ids past the capacity grow the container. Changing the role of an
    /// allocated target takes effect at the next resize.
    pub fn initialize_target(&mut self, id: usize, attributes: SurfaceAttributes) {
        if id >= self.targets.len() {
            let capacity = id + self.increment;
            log::debug!(
                "surface container {}: capacity {} -> {capacity}",
                self.id.raw(),
                self.targets.len()
            );
            self.targets.resize_with(capacity, Target::default);
        }
        if id >= self.used {
            self.used = id + 1;
        }
        if attributes.is_framebuffer() && attributes != SurfaceAttributes::FRAMEBUFFER {
            log::warn!(
                "surface container {}: FRAMEBUFFER target {id} should not carry other attributes",
                self.id.raw()
            );
        }
        let target = &mut self.targets[id];
        if target.is_allocated() && target.attributes != attributes {
            log::warn!(
                "surface container {}: target {id} changed role while allocated, the new role applies at the next resize",
                self.id.raw()
            );
        }
        target.attributes = attributes;
    }

    /// The role target `id` was registered with.
    pub fn attributes(&self, id: usize) -> Option<SurfaceAttributes> {
        self.registered(id).ok().map(|target| target.attributes)
    }

    /// The color texture of target `id`, while allocated.
    pub fn color_texture(&self, id: usize) -> Option<TextureId> {
        self.targets.get(id).and_then(|target| target.color)
    }

    /// The depth texture of target `id`, while allocated.
    pub fn depth_texture(&self, id: usize) -> Option<TextureId> {
        self.targets.get(id).and_then(|target| target.depth)
    }

    /// The label target `id` was last activated with.
    pub fn debug_label(&self, id: usize) -> Option<&str> {
        self.targets
            .get(id)
            .map(|target| target.debug_label.as_str())
            .filter(|label| !label.is_empty())
    }

    /// Bytes held by allocated attachments.
    pub fn memory_size(&self) -> usize {
        self.targets.iter().map(|target| target.bytes).sum()
    }

    /// Creates the framebuffer object and, if the size is already known,
    /// the textures.
    pub fn attach_context(&mut self, ctx: &mut GraphicsContext) -> Result<(), SurfaceError> {
        if self.framebuffer.is_some() {
            log::warn!("surface container {} attached twice", self.id.raw());
            return Ok(());
        }
        let label = format!("surface container {}", self.id.raw());
        self.framebuffer = Some(ctx.backend_mut().create_framebuffer(&label)?);
        if self.has_area() {
            self.allocate_all(ctx)?;
            self.clear_all_targets(ctx, Vec4::ZERO, 1.0)?;
        }
        Ok(())
    }

    /// Reallocates every target at `size` and clears them.
    ///
    /// A zero size frees the textures. The active targets are restored
    /// afterwards.
    pub fn set_size(&mut self, ctx: &mut GraphicsContext, size: UVec2) -> Result<(), SurfaceError> {
        if size == self.size {
            return Ok(());
        }
        let limit = ctx.capabilities().max_surface_size;
        if size.x > limit || size.y > limit {
            let err = BackendError::SizeExceeded {
                width: size.x,
                height: size.y,
                limit,
            };
            log::error!("surface container {}: {err}", self.id.raw());
            return Err(err.into());
        }

        let previous = self.activation(ctx);
        self.detach(ctx)?;
        self.free_all(ctx);
        self.size = size;

        if !self.has_area() {
            log::warn!(
                "surface container {} resized to {}x{}, attachments freed",
                self.id.raw(),
                size.x,
                size.y
            );
            return self.restore(ctx, None);
        }
        if self.framebuffer.is_none() {
            return Ok(());
        }
        self.allocate_all(ctx)?;
        self.clear_all_targets(ctx, Vec4::ZERO, 1.0)?;
        self.restore(ctx, previous)
    }

    /// Routes draws to target `id`.
    ///
    /// Shared containers take the binding over from any other shared
    /// container first. `debug_label` names the target in logs and GPU
    /// debuggers.
    pub fn set_active_target(
        &mut self,
        ctx: &mut GraphicsContext,
        id: usize,
        debug_label: &str,
    ) -> Result<(), SurfaceError> {
        self.activate(ctx, &[id], 0, debug_label)
    }

    /// Activates one face of a cube-map target.
    pub fn set_active_face(&mut self, ctx: &mut GraphicsContext, id: usize, face: u32) -> Result<(), SurfaceError> {
        if self.registered(id)?.attributes.texture_kind() != TextureKind::CubeMap {
            return Err(SurfaceError::NotCubeMap(id));
        }
        if face >= CUBE_FACES {
            return Err(BackendError::OutOfBounds.into());
        }
        self.activate(ctx, &[id], face, "")
    }

    /// Activates several color targets at once. Depth comes from the first
    /// target that has it.
    pub fn set_active_targets(
        &mut self,
        ctx: &mut GraphicsContext,
        ids: &[usize],
        debug_label: &str,
    ) -> Result<(), SurfaceError> {
        self.activate(ctx, ids, 0, debug_label)
    }

    /// Detaches everything and unbinds the framebuffer.
    pub fn deactivate(&mut self, ctx: &mut GraphicsContext) -> Result<(), SurfaceError> {
        self.detach(ctx)?;
        if let Some(fb) = self.framebuffer {
            if ctx.backend().bound_framebuffer() == Some(fb) {
                ctx.backend_mut().bind_framebuffer(None)?;
            }
        }
        if self.shared && ctx.active_shared_container() == Some(self.id) {
            ctx.set_shared_binding(None);
        }
        Ok(())
    }

    /// The targets draws go to. Empty when another shared container holds
    /// the binding.
    pub fn active_targets(&self, ctx: &GraphicsContext) -> Vec<usize> {
        if self.owns_binding(ctx) {
            self.current.clone()
        } else {
            Vec::new()
        }
    }

    /// The first active target.
    pub fn active_target(&self, ctx: &GraphicsContext) -> Option<usize> {
        self.active_targets(ctx).first().copied()
    }

    /// Whether target `id` currently receives draws.
    pub fn is_attached(&self, ctx: &GraphicsContext, id: usize) -> bool {
        self.owns_binding(ctx) && self.current.contains(&id)
    }

    /// Saves the current activation for
    /// [`pop_active_target`](Self::pop_active_target).
    pub fn push_active_target(&mut self, ctx: &GraphicsContext) {
        let activation = self.activation(ctx);
        self.stack.push(activation);
    }

    /// Restores the activation saved last. Popping an empty stack is logged
    /// and ignored.
    pub fn pop_active_target(&mut self, ctx: &mut GraphicsContext) -> Result<(), SurfaceError> {
        match self.stack.pop() {
            Some(previous) => self.restore(ctx, previous),
            None => {
                log::error!(
                    "surface container {}: pop_active_target on an empty stack",
                    self.id.raw()
                );
                Ok(())
            }
        }
    }

    /// Clears every allocated target, all faces of cube maps included, and
    /// reactivates what was active before.
    pub fn clear_all_targets(&mut self, ctx: &mut GraphicsContext, color: Vec4, depth: f32) -> Result<(), SurfaceError> {
        let previous = self.activation(ctx);
        for id in 0..self.used {
            let target = &self.targets[id];
            if target.attributes.is_framebuffer() || !target.is_allocated() {
                continue;
            }
            let clear_color = target.color.map(|_| color);
            let clear_depth = target.depth.map(|_| depth);
            let faces = match target.attributes.texture_kind() {
                TextureKind::CubeMap => CUBE_FACES,
                _ => 1,
            };
            for face in 0..faces {
                self.activate(ctx, &[id], face, "")?;
                ctx.backend_mut().clear(clear_color, clear_depth)?;
            }
        }
        self.restore(ctx, previous)
    }

    /// RGBA values of target `id`, rows from the top.
    pub fn target_as_floats(&mut self, ctx: &mut GraphicsContext, id: usize) -> Result<Vec<f32>, SurfaceError> {
        let region = PixelRegion::whole(self.size);
        self.read(ctx, id, ReadSource::Color(0), region)
    }

    /// The color at `(x, y)` of target `id`, `y` counted from the top.
    pub fn target_pixel(&mut self, ctx: &mut GraphicsContext, id: usize, x: u32, y: u32) -> Result<Vec4, SurfaceError> {
        let pixel = self.read(ctx, id, ReadSource::Color(0), PixelRegion::pixel(x, y))?;
        Ok(Vec4::from_slice(&pixel))
    }

    /// Depth values of target `id`, rows from the top.
    pub fn depth_target_as_floats(&mut self, ctx: &mut GraphicsContext, id: usize) -> Result<Vec<f32>, SurfaceError> {
        let region = PixelRegion::whole(self.size);
        self.read(ctx, id, ReadSource::Depth, region)
    }

    /// The depth at `(x, y)` of target `id`.
    pub fn depth_pixel(&mut self, ctx: &mut GraphicsContext, id: usize, x: u32, y: u32) -> Result<f32, SurfaceError> {
        let pixel = self.read(ctx, id, ReadSource::Depth, PixelRegion::pixel(x, y))?;
        pixel
            .first()
            .copied()
            .ok_or(SurfaceError::Backend(BackendError::OutOfBounds))
    }

    /// Writes target `id` to an image file, format picked from the extension.
    pub fn save_target_image(
        &mut self,
        ctx: &mut GraphicsContext,
        id: usize,
        path: impl AsRef<Path>,
    ) -> Result<(), SurfaceError> {
        let path = path.as_ref();
        let pixels = self.target_as_floats(ctx, id)?;
        let bytes: Vec<u8> = pixels
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        let image = image::RgbaImage::from_raw(self.size.x, self.size.y, bytes)
            .ok_or(SurfaceError::Backend(BackendError::OutOfBounds))?;
        image.save(path)?;
        log::info!("saved target {id} to {}", path.display());
        Ok(())
    }

    /// Frees every GPU object the container holds.
    pub fn destroy(&mut self, ctx: &mut GraphicsContext) {
        if let Err(e) = self.deactivate(ctx) {
            log::warn!("surface container {}: deactivate on destroy: {e}", self.id.raw());
        }
        self.free_all(ctx);
        if let Some(fb) = self.framebuffer.take() {
            ctx.backend_mut().destroy_framebuffer(fb);
        }
        self.stack.clear();
    }

    fn has_area(&self) -> bool {
        self.size.x > 0 && self.size.y > 0
    }

    fn registered(&self, id: usize) -> Result<&Target, SurfaceError> {
        self.targets
            .get(id)
            .filter(|target| id < self.used && !target.attributes.is_empty())
            .ok_or(SurfaceError::InvalidTarget(id))
    }

    fn owns_binding(&self, ctx: &GraphicsContext) -> bool {
        !self.shared || ctx.active_shared_container() == Some(self.id)
    }

    fn activation(&self, ctx: &GraphicsContext) -> Option<Activation> {
        if self.owns_binding(ctx) && !self.current.is_empty() {
            Some((self.current.clone(), self.face))
        } else {
            None
        }
    }

    fn restore(&mut self, ctx: &mut GraphicsContext, previous: Option<Activation>) -> Result<(), SurfaceError> {
        match previous {
            Some((ids, face)) => self.activate(ctx, &ids, face, ""),
            None => self.deactivate(ctx),
        }
    }

    fn activate(
        &mut self,
        ctx: &mut GraphicsContext,
        ids: &[usize],
        face: u32,
        debug_label: &str,
    ) -> Result<(), SurfaceError> {
        if ids.is_empty() {
            return self.deactivate(ctx);
        }
        for &id in ids {
            self.registered(id)?;
        }
        let fb = self.framebuffer.ok_or(SurfaceError::NotAttached)?;
        let to_window = ids
            .iter()
            .any(|&id| self.targets[id].attributes.is_framebuffer());
        if to_window && ids.len() > 1 {
            return Err(SurfaceError::IncompatibleTargets(ids.to_vec()));
        }
        if ids.len() > 1 {
            let colors = ids
                .iter()
                .filter(|&&id| self.targets[id].attributes.has_color())
                .count();
            let supported = ctx.capabilities().max_color_attachments;
            if colors > supported as usize {
                return Err(SurfaceError::TooManyTargets {
                    requested: colors,
                    supported,
                });
            }
        }

        if self.shared {
            self.take_shared_binding(ctx)?;
        }
        if !debug_label.is_empty() {
            for &id in ids {
                self.targets[id].debug_label = debug_label.to_string();
            }
        }

        if self.current == ids && self.face == face {
            log::trace!("surface container {}: {ids:?} already active", self.id.raw());
            if !to_window && ctx.backend().bound_framebuffer() != Some(fb) {
                ctx.backend_mut().bind_framebuffer(Some(fb))?;
            }
            return Ok(());
        }

        self.detach(ctx)?;
        if to_window {
            if ctx.backend().bound_framebuffer() == Some(fb) {
                ctx.backend_mut().bind_framebuffer(None)?;
            }
        } else {
            self.ensure_allocated(ctx, ids)?;
            ctx.backend_mut().bind_framebuffer(Some(fb))?;
            let mut colors = 0;
            let mut has_depth = false;
            for &id in ids {
                let target = &self.targets[id];
                if let Some(texture) = target.color {
                    let point = AttachmentPoint::Color(colors);
                    ctx.backend_mut()
                        .attach(fb, point, Some(Attachment { texture, layer: face }))?;
                    self.points.push(point);
                    colors += 1;
                }
                if let Some(texture) = target.depth {
                    if !has_depth {
                        let point = if target.attributes.has_stencil() {
                            AttachmentPoint::DepthStencil
                        } else {
                            AttachmentPoint::Depth
                        };
                        ctx.backend_mut().attach(fb, point, Some(Attachment::new(texture)))?;
                        self.points.push(point);
                        has_depth = true;
                    }
                }
            }
            ctx.backend_mut().set_draw_buffers(fb, colors)?;
        }
        self.current = ids.to_vec();
        self.face = face;
        self.publish_binding(ctx, fb);
        Ok(())
    }

    /// Takes the shared binding, detaching the previous owner.
    fn take_shared_binding(&mut self, ctx: &mut GraphicsContext) -> Result<(), SurfaceError> {
        match ctx.shared_binding().cloned() {
            Some(binding) if binding.owner == self.id => return Ok(()),
            Some(binding) => {
                log::trace!(
                    "surface container {} takes over from {}",
                    self.id.raw(),
                    binding.owner.raw()
                );
                for point in &binding.points {
                    ctx.backend_mut().attach(binding.framebuffer, *point, None)?;
                }
                if ctx.backend().bound_framebuffer() == Some(binding.framebuffer) {
                    ctx.backend_mut().bind_framebuffer(None)?;
                }
                ctx.set_shared_binding(None);
            }
            None => {}
        }
        // Whatever we had attached was detached by whoever took over.
        self.current.clear();
        self.points.clear();
        Ok(())
    }

    fn publish_binding(&self, ctx: &mut GraphicsContext, framebuffer: FramebufferId) {
        if self.shared {
            ctx.set_shared_binding(Some(SharedBinding {
                owner: self.id,
                framebuffer,
                points: self.points.clone(),
            }));
        }
    }

    fn detach(&mut self, ctx: &mut GraphicsContext) -> Result<(), SurfaceError> {
        let owns = self.owns_binding(ctx);
        let Some(fb) = self.framebuffer.filter(|_| owns) else {
            self.current.clear();
            self.points.clear();
            return Ok(());
        };
        for point in self.points.drain(..) {
            ctx.backend_mut().attach(fb, point, None)?;
        }
        self.current.clear();
        self.publish_binding(ctx, fb);
        Ok(())
    }

    fn read(
        &mut self,
        ctx: &mut GraphicsContext,
        id: usize,
        source: ReadSource,
        region: PixelRegion,
    ) -> Result<Vec<f32>, SurfaceError> {
        let target = self.registered(id)?;
        match source {
            ReadSource::Color(_) if !target.attributes.has_color() => {
                return Err(SurfaceError::NoColor(id));
            }
            ReadSource::Depth if !target.attributes.has_depth() => {
                return Err(SurfaceError::NoDepth(id));
            }
            _ => {}
        }
        if !region.fits(self.size) {
            return Err(BackendError::OutOfBounds.into());
        }

        self.push_active_target(ctx);
        let pixels = self
            .activate(ctx, &[id], 0, "")
            .and_then(|()| Ok(ctx.backend_mut().read_pixels(source, region)?));
        let restored = self.pop_active_target(ctx);
        let pixels = pixels?;
        restored?;
        Ok(pixels)
    }

    fn ensure_allocated(&mut self, ctx: &mut GraphicsContext, ids: &[usize]) -> Result<(), SurfaceError> {
        if !self.has_area() {
            return Ok(());
        }
        for &id in ids {
            let target = &self.targets[id];
            if target.wants_textures() && !target.is_allocated() {
                self.allocate(ctx, id)?;
            }
        }
        Ok(())
    }

    fn allocate_all(&mut self, ctx: &mut GraphicsContext) -> Result<(), SurfaceError> {
        for id in 0..self.used {
            let target = &self.targets[id];
            if target.wants_textures() && !target.is_allocated() {
                self.allocate(ctx, id)?;
            }
        }
        Ok(())
    }

    fn allocate(&mut self, ctx: &mut GraphicsContext, id: usize) -> Result<(), SurfaceError> {
        let size = self.size;
        let attributes = self.targets[id].attributes;
        let kind = attributes.texture_kind();
        let depth_format = attributes.depth_format(ctx.capabilities());
        if kind == TextureKind::CubeMap && size.x != size.y {
            log::warn!(
                "surface container {}: cube map target {id} needs a square size, got {}x{}",
                self.id.raw(),
                size.x,
                size.y
            );
        }
        log::debug!(
            "surface container {}: create {} target {id} at {}x{}",
            self.id.raw(),
            attributes.describe(),
            size.x,
            size.y
        );

        let mut bytes = 0;
        let color = match attributes.color_format() {
            Some(format) => {
                let desc = TextureDescriptor {
                    label: format!("container {} target {id} color", self.id.raw()),
                    size,
                    format,
                    kind,
                    sampled: true,
                };
                bytes += desc.byte_size();
                Some(ctx.backend_mut().create_texture(&desc)?)
            }
            None => None,
        };
        let depth = match depth_format {
            Some(format) => {
                let desc = TextureDescriptor {
                    label: format!("container {} target {id} depth", self.id.raw()),
                    size,
                    format,
                    kind: match kind {
                        TextureKind::Rectangle => TextureKind::Rectangle,
                        _ => TextureKind::D2,
                    },
                    sampled: attributes.contains(SurfaceAttributes::DEPTH_TEX),
                };
                bytes += desc.byte_size();
                match ctx.backend_mut().create_texture(&desc) {
                    Ok(texture) => Some(texture),
                    Err(e) => {
                        if let Some(texture) = color {
                            ctx.backend_mut().destroy_texture(texture);
                        }
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        let target = &mut self.targets[id];
        target.color = color;
        target.depth = depth;
        target.bytes = bytes;
        Ok(())
    }

    fn free_all(&mut self, ctx: &mut GraphicsContext) {
        for target in &mut self.targets {
            if let Some(texture) = target.color.take() {
                ctx.backend_mut().destroy_texture(texture);
            }
            if let Some(texture) = target.depth.take() {
                ctx.backend_mut().destroy_texture(texture);
            }
            target.bytes = 0;
        }
    }
}

impl Drop for SurfaceContainer {
    fn drop(&mut self) {
        if self.framebuffer.is_some() || self.targets.iter().any(Target::is_allocated) {
            log::error!(
                "surface container {} dropped without destroy(), its GPU objects leak",
                self.id.raw()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuBackend, GpuCapabilities, HeadlessBackend, TextureFormat};
    use crate::config::RuntimeConfig;

    fn context() -> GraphicsContext {
        GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default())
    }

    fn headless(ctx: &GraphicsContext) -> &HeadlessBackend {
        ctx.backend_as().unwrap()
    }

    fn rgba_depth() -> SurfaceAttributes {
        SurfaceAttributes::RGBA | SurfaceAttributes::DEPTH | SurfaceAttributes::DEPTH_TEX
    }

    #[test]
    fn registering_past_capacity_grows_by_increment() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 2, false);
        container.initialize_target(5, SurfaceAttributes::RGBA);
        assert_eq!(container.capacity(), 9);
        assert_eq!(container.num_used(), 6);
        assert!(container.attributes(3).is_none());
        container.destroy(&mut ctx);
    }

    #[test]
    fn textures_wait_for_context_and_size() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 1, false);
        container.initialize_target(0, rgba_depth());
        container.set_size(&mut ctx, UVec2::new(8, 8)).unwrap();
        assert!(container.color_texture(0).is_none());

        container.attach_context(&mut ctx).unwrap();
        let color = container.color_texture(0).unwrap();
        let depth = container.depth_texture(0).unwrap();
        let backend = headless(&ctx);
        assert_eq!(backend.texture_descriptor(color).unwrap().format, TextureFormat::Rgba8Unorm);
        let depth_desc = backend.texture_descriptor(depth).unwrap();
        assert_eq!(depth_desc.format, TextureFormat::Depth24Plus);
        assert!(depth_desc.sampled);
        assert_eq!(container.memory_size(), 8 * 8 * 4 + 8 * 8 * 4);

        container.destroy(&mut ctx);
        assert!(ctx.backend().live_objects().is_empty());
    }

    #[test]
    fn zero_size_frees_and_oversize_is_rejected() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 1, false);
        container.initialize_target(0, SurfaceAttributes::RGBA);
        container.attach_context(&mut ctx).unwrap();
        container.set_size(&mut ctx, UVec2::new(4, 4)).unwrap();
        assert!(container.color_texture(0).is_some());
        container.set_size(&mut ctx, UVec2::ZERO).unwrap();
        assert!(container.color_texture(0).is_none());
        assert_eq!(container.memory_size(), 0);

        let err = container.set_size(&mut ctx, UVec2::new(9000, 16)).unwrap_err();
        assert!(matches!(err, SurfaceError::Backend(BackendError::SizeExceeded { limit: 8192, .. })));
        container.destroy(&mut ctx);
    }

    #[test]
    fn reactivating_the_same_target_keeps_attachments() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 2, false);
        container.initialize_target(0, SurfaceAttributes::RGBA);
        container.initialize_target(1, SurfaceAttributes::RGBA);
        container.attach_context(&mut ctx).unwrap();
        container.set_size(&mut ctx, UVec2::new(4, 4)).unwrap();

        container.set_active_target(&mut ctx, 1, "second").unwrap();
        container.set_active_target(&mut ctx, 1, "").unwrap();
        let fb = container.framebuffer().unwrap();
        let attached = headless(&ctx).attachment(fb, AttachmentPoint::Color(0)).unwrap();
        assert_eq!(Some(attached.texture), container.color_texture(1));
        assert_eq!(container.debug_label(1), Some("second"));
        assert_eq!(container.active_target(&ctx), Some(1));
        container.destroy(&mut ctx);
    }

    #[test]
    fn multiple_targets_respect_device_limit() {
        let caps = GpuCapabilities {
            max_color_attachments: 2,
            ..GpuCapabilities::default()
        };
        let mut ctx = GraphicsContext::new(HeadlessBackend::with_capabilities(caps), RuntimeConfig::default());
        let mut container = SurfaceContainer::new(&mut ctx, 3, false);
        for id in 0..3 {
            container.initialize_target(id, SurfaceAttributes::RGBA);
        }
        container.attach_context(&mut ctx).unwrap();
        container.set_size(&mut ctx, UVec2::new(2, 2)).unwrap();
        container.set_active_targets(&mut ctx, &[0, 2], "").unwrap();
        assert_eq!(container.active_targets(&ctx), vec![0, 2]);
        assert!(matches!(
            container.set_active_targets(&mut ctx, &[0, 1, 2], ""),
            Err(SurfaceError::TooManyTargets { requested: 3, supported: 2 })
        ));
        container.destroy(&mut ctx);
    }

    #[test]
    fn framebuffer_target_unbinds() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 2, false);
        container.initialize_target(0, SurfaceAttributes::RGBA);
        container.initialize_target(1, SurfaceAttributes::FRAMEBUFFER);
        container.attach_context(&mut ctx).unwrap();
        container.set_size(&mut ctx, UVec2::new(2, 2)).unwrap();
        container.set_active_target(&mut ctx, 0, "").unwrap();
        assert_eq!(ctx.backend().bound_framebuffer(), container.framebuffer());
        container.set_active_target(&mut ctx, 1, "").unwrap();
        assert_eq!(ctx.backend().bound_framebuffer(), None);
        assert!(container.color_texture(1).is_none());
        assert!(matches!(
            container.set_active_targets(&mut ctx, &[0, 1], ""),
            Err(SurfaceError::IncompatibleTargets(_))
        ));
        container.destroy(&mut ctx);
    }

    #[test]
    fn cube_faces_clear_and_activate_separately() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 2, false);
        container.initialize_target(0, SurfaceAttributes::RGBA | SurfaceAttributes::CUBE_MAP);
        container.initialize_target(1, SurfaceAttributes::RGBA);
        container.attach_context(&mut ctx).unwrap();
        container.set_size(&mut ctx, UVec2::new(4, 4)).unwrap();
        assert_eq!(container.memory_size(), 4 * 4 * 4 * 6 + 4 * 4 * 4);

        container.set_active_face(&mut ctx, 0, 3).unwrap();
        let fb = container.framebuffer().unwrap();
        assert_eq!(headless(&ctx).attachment(fb, AttachmentPoint::Color(0)).unwrap().layer, 3);
        assert!(matches!(
            container.set_active_face(&mut ctx, 1, 0),
            Err(SurfaceError::NotCubeMap(1))
        ));
        assert!(container.set_active_face(&mut ctx, 0, 6).is_err());
        container.destroy(&mut ctx);
    }

    #[test]
    fn unknown_and_unattached_targets_fail() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 1, false);
        container.initialize_target(0, SurfaceAttributes::RGBA);
        assert!(matches!(
            container.set_active_target(&mut ctx, 0, ""),
            Err(SurfaceError::NotAttached)
        ));
        container.attach_context(&mut ctx).unwrap();
        assert!(matches!(
            container.set_active_target(&mut ctx, 4, ""),
            Err(SurfaceError::InvalidTarget(4))
        ));
        container.set_size(&mut ctx, UVec2::new(2, 2)).unwrap();
        assert!(matches!(
            container.depth_target_as_floats(&mut ctx, 0),
            Err(SurfaceError::NoDepth(0))
        ));
        container.destroy(&mut ctx);
    }

    #[test]
    fn pop_on_empty_stack_is_harmless() {
        let mut ctx = context();
        let mut container = SurfaceContainer::new(&mut ctx, 1, false);
        container.pop_active_target(&mut ctx).unwrap();
    }
}
