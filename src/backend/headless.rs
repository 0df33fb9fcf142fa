use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use glam::{UVec2, Vec4};

use super::wgsl::{self, ParsedStage, ResourceKind, ResourceUse};
use super::{
    Attachment, AttachmentPoint, FramebufferId, GpuBackend, GpuCapabilities, LiveObjects,
    PixelRegion, ProgramId, ReadSource, ShaderStage, StageId, TextureDescriptor, TextureId,
};
use crate::error::{BackendError, ShaderDiagnostic};

/// A fullscreen draw the headless backend recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramId,
    pub framebuffer: FramebufferId,
    /// Textures bound to the active draw buffers, in order.
    pub targets: Vec<TextureId>,
    /// `(binding, texture)` pairs the program sampled.
    pub inputs: Vec<(u32, TextureId)>,
    pub size: UVec2,
}

struct SoftTexture {
    desc: TextureDescriptor,
    /// One pixel array per layer. Depth lives in the first channel.
    layers: Vec<Vec<[f32; 4]>>,
}

#[derive(Default)]
struct SoftFramebuffer {
    color: BTreeMap<u32, Attachment>,
    depth: Option<(AttachmentPoint, Attachment)>,
    draw_buffers: u32,
}

struct SoftProgram {
    resources: Vec<ResourceUse>,
}

/// A CPU reference backend.
///
/// Textures are plain float arrays rounded to their format's precision on
/// every write, so read-back behaves like a real device's. Shaders are parsed
/// and validated but never executed; draws are appended to
/// [`draws`](Self::draws).
pub struct HeadlessBackend {
    caps: GpuCapabilities,
    next_id: u64,
    textures: HashMap<TextureId, SoftTexture>,
    framebuffers: HashMap<FramebufferId, SoftFramebuffer>,
    bound: Option<FramebufferId>,
    stages: HashMap<StageId, ParsedStage>,
    programs: HashMap<ProgramId, SoftProgram>,
    active_slot: u32,
    slot_bindings: BTreeMap<u32, TextureId>,
    current_program: Option<ProgramId>,
    draws: Vec<DrawRecord>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::with_capabilities(GpuCapabilities {
            vendor: "phalanx headless".to_string(),
            ..GpuCapabilities::default()
        })
    }

    /// Reports `caps` instead of the defaults, e.g. to test small devices.
    pub fn with_capabilities(caps: GpuCapabilities) -> Self {
        Self {
            caps,
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            bound: None,
            stages: HashMap::new(),
            programs: HashMap::new(),
            active_slot: 0,
            slot_bindings: BTreeMap::new(),
            current_program: None,
            draws: Vec::new(),
        }
    }

    /// Every fullscreen draw issued, oldest first.
    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn active_sampling_slot(&self) -> u32 {
        self.active_slot
    }

    pub fn bound_texture(&self, slot: u32) -> Option<TextureId> {
        self.slot_bindings.get(&slot).copied()
    }

    pub fn texture_descriptor(&self, texture: TextureId) -> Option<&TextureDescriptor> {
        self.textures.get(&texture).map(|t| &t.desc)
    }

    /// The attachment currently at `point` of `framebuffer`.
    pub fn attachment(&self, framebuffer: FramebufferId, point: AttachmentPoint) -> Option<Attachment> {
        let fb = self.framebuffers.get(&framebuffer)?;
        match point {
            AttachmentPoint::Color(i) => fb.color.get(&i).copied(),
            AttachmentPoint::Depth | AttachmentPoint::DepthStencil => fb
                .depth
                .filter(|(p, _)| *p == point)
                .map(|(_, attachment)| attachment),
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn bound_fb(&self) -> Result<(FramebufferId, &SoftFramebuffer), BackendError> {
        let id = self.bound.ok_or(BackendError::NoFramebufferBound)?;
        let fb = self
            .framebuffers
            .get(&id)
            .ok_or(BackendError::UnknownFramebuffer(id))?;
        Ok((id, fb))
    }

    fn fill(&mut self, attachment: Attachment, value: [f32; 4], depth_only: bool) -> Result<(), BackendError> {
        let texture = self
            .textures
            .get_mut(&attachment.texture)
            .ok_or(BackendError::UnknownTexture(attachment.texture))?;
        let format = texture.desc.format;
        let pixel = if depth_only {
            [format.quantize(value[0]), 0.0, 0.0, 0.0]
        } else {
            value.map(|c| format.quantize(c))
        };
        let layer = texture
            .layers
            .get_mut(attachment.layer as usize)
            .ok_or(BackendError::OutOfBounds)?;
        layer.fill(pixel);
        Ok(())
    }
}

impl GpuBackend for HeadlessBackend {
    fn capabilities(&self) -> GpuCapabilities {
        self.caps.clone()
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureId, BackendError> {
        let limit = self.caps.max_surface_size;
        if desc.size.x > limit || desc.size.y > limit {
            return Err(BackendError::SizeExceeded {
                width: desc.size.x,
                height: desc.size.y,
                limit,
            });
        }
        if desc.size.x == 0 || desc.size.y == 0 {
            return Err(BackendError::Unsupported("zero-sized texture".into()));
        }
        let pixels = desc.size.x as usize * desc.size.y as usize;
        let id = TextureId(self.next());
        self.textures.insert(
            id,
            SoftTexture {
                desc: desc.clone(),
                layers: vec![vec![[0.0; 4]; pixels]; desc.layers() as usize],
            },
        );
        log::trace!("created texture {id:?} `{}` {}x{}", desc.label, desc.size.x, desc.size.y);
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_none() {
            log::warn!("destroying unknown texture {texture:?}");
        }
        self.slot_bindings.retain(|_, bound| *bound != texture);
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId) -> Result<(), BackendError> {
        let source = self.textures.get(&src).ok_or(BackendError::UnknownTexture(src))?;
        let (desc, layers) = (source.desc.clone(), source.layers.clone());
        let target = self.textures.get_mut(&dst).ok_or(BackendError::UnknownTexture(dst))?;
        if target.desc.size != desc.size || target.desc.format != desc.format || target.layers.len() != layers.len() {
            return Err(BackendError::Unsupported(format!(
                "copy between mismatched textures `{}` and `{}`",
                desc.label, target.desc.label
            )));
        }
        target.layers = layers;
        Ok(())
    }

    fn create_framebuffer(&mut self, _label: &str) -> Result<FramebufferId, BackendError> {
        let id = FramebufferId(self.next());
        self.framebuffers.insert(id, SoftFramebuffer::default());
        Ok(id)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.bound == Some(framebuffer) {
            self.bound = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> Result<(), BackendError> {
        if let Some(id) = framebuffer {
            if !self.framebuffers.contains_key(&id) {
                return Err(BackendError::UnknownFramebuffer(id));
            }
        }
        self.bound = framebuffer;
        Ok(())
    }

    fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.bound
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        attachment: Option<Attachment>,
    ) -> Result<(), BackendError> {
        if let Some(attachment) = attachment {
            let texture = self
                .textures
                .get(&attachment.texture)
                .ok_or(BackendError::UnknownTexture(attachment.texture))?;
            let is_depth = texture.desc.format.is_depth();
            let wants_depth = !matches!(point, AttachmentPoint::Color(_));
            if is_depth != wants_depth {
                return Err(BackendError::Unsupported(format!(
                    "texture `{}` cannot be attached at {point:?}",
                    texture.desc.label
                )));
            }
            if attachment.layer >= texture.desc.layers() {
                return Err(BackendError::OutOfBounds);
            }
        }
        let max_color = self.caps.max_color_attachments;
        let fb = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(BackendError::UnknownFramebuffer(framebuffer))?;
        match (point, attachment) {
            (AttachmentPoint::Color(i), _) if i >= max_color => {
                return Err(BackendError::Unsupported(format!(
                    "color attachment {i} exceeds the device limit of {max_color}"
                )));
            }
            (AttachmentPoint::Color(i), Some(a)) => {
                fb.color.insert(i, a);
            }
            (AttachmentPoint::Color(i), None) => {
                fb.color.remove(&i);
            }
            (point, Some(a)) => fb.depth = Some((point, a)),
            (point, None) => {
                if fb.depth.is_some_and(|(p, _)| p == point) {
                    fb.depth = None;
                }
            }
        }
        Ok(())
    }

    fn set_draw_buffers(&mut self, framebuffer: FramebufferId, count: u32) -> Result<(), BackendError> {
        if count > self.caps.max_color_attachments {
            return Err(BackendError::Unsupported(format!(
                "{count} draw buffers exceed the device limit of {}",
                self.caps.max_color_attachments
            )));
        }
        let fb = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(BackendError::UnknownFramebuffer(framebuffer))?;
        fb.draw_buffers = count;
        Ok(())
    }

    fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>) -> Result<(), BackendError> {
        let (_, fb) = self.bound_fb()?;
        let colors: Vec<Attachment> = (0..fb.draw_buffers)
            .filter_map(|i| fb.color.get(&i).copied())
            .collect();
        let depth_attachment = fb.depth.map(|(_, a)| a);
        if let Some(color) = color {
            for attachment in colors {
                self.fill(attachment, color.to_array(), false)?;
            }
        }
        if let (Some(depth), Some(attachment)) = (depth, depth_attachment) {
            self.fill(attachment, [depth, 0.0, 0.0, 0.0], true)?;
        }
        Ok(())
    }

    fn read_pixels(&mut self, source: ReadSource, region: PixelRegion) -> Result<Vec<f32>, BackendError> {
        let (_, fb) = self.bound_fb()?;
        let attachment = match source {
            ReadSource::Color(i) => fb
                .color
                .get(&i)
                .copied()
                .ok_or(BackendError::NothingAttached(AttachmentPoint::Color(i)))?,
            ReadSource::Depth => fb
                .depth
                .map(|(_, a)| a)
                .ok_or(BackendError::NothingAttached(AttachmentPoint::Depth))?,
        };
        let texture = self
            .textures
            .get(&attachment.texture)
            .ok_or(BackendError::UnknownTexture(attachment.texture))?;
        if !region.fits(texture.desc.size) {
            return Err(BackendError::OutOfBounds);
        }
        let width = texture.desc.size.x as usize;
        let layer = &texture.layers[attachment.layer as usize];
        let channels = if matches!(source, ReadSource::Color(_)) { 4 } else { 1 };
        let mut out = Vec::with_capacity(region.size.x as usize * region.size.y as usize * channels);
        for y in region.origin.y..region.origin.y + region.size.y {
            let row = y as usize * width;
            for x in region.origin.x..region.origin.x + region.size.x {
                let pixel = layer[row + x as usize];
                out.extend_from_slice(&pixel[..channels]);
            }
        }
        Ok(out)
    }

    fn select_sampling_slot(&mut self, slot: u32) {
        self.active_slot = slot;
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<TextureId>) -> Result<(), BackendError> {
        if slot >= self.caps.max_sampling_slots {
            return Err(BackendError::SlotOutOfRange {
                slot,
                capacity: self.caps.max_sampling_slots,
            });
        }
        self.active_slot = slot;
        match texture {
            Some(texture) => {
                if !self.textures.contains_key(&texture) {
                    return Err(BackendError::UnknownTexture(texture));
                }
                self.slot_bindings.insert(slot, texture);
            }
            None => {
                self.slot_bindings.remove(&slot);
            }
        }
        Ok(())
    }

    fn compile_stage(
        &mut self,
        stage: ShaderStage,
        _label: &str,
        source: &str,
    ) -> Result<StageId, ShaderDiagnostic> {
        let parsed = wgsl::parse_stage(stage, source)?;
        let id = StageId(self.next());
        self.stages.insert(id, parsed);
        Ok(id)
    }

    fn destroy_stage(&mut self, stage: StageId) {
        self.stages.remove(&stage);
    }

    fn link_program(&mut self, label: &str, stages: &[StageId]) -> Result<ProgramId, ShaderDiagnostic> {
        let parsed = stages
            .iter()
            .map(|id| {
                self.stages
                    .get(id)
                    .ok_or_else(|| ShaderDiagnostic::new(format!("`{label}`: unknown stage {id:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        wgsl::check_link(&parsed)?;
        let resources = parsed.iter().flat_map(|p| p.resources.iter().copied()).collect();
        let id = ProgramId(self.next());
        self.programs.insert(id, SoftProgram { resources });
        Ok(id)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn use_program(&mut self, program: Option<ProgramId>) -> Result<(), BackendError> {
        if let Some(id) = program {
            if !self.programs.contains_key(&id) {
                return Err(BackendError::UnknownShader(id.0));
            }
        }
        self.current_program = program;
        Ok(())
    }

    fn draw_fullscreen(&mut self) -> Result<(), BackendError> {
        let program_id = self.current_program.ok_or(BackendError::NoProgram)?;
        let program = self
            .programs
            .get(&program_id)
            .ok_or(BackendError::UnknownShader(program_id.0))?;
        let (fb_id, fb) = self.bound_fb()?;
        let targets: Vec<TextureId> = (0..fb.draw_buffers)
            .filter_map(|i| fb.color.get(&i).map(|a| a.texture))
            .collect();
        let mut inputs = Vec::new();
        for resource in &program.resources {
            if resource.group == 0 && resource.kind == ResourceKind::Texture {
                let texture = self
                    .slot_bindings
                    .get(&resource.binding)
                    .copied()
                    .ok_or(BackendError::MissingBinding(resource.binding))?;
                inputs.push((resource.binding, texture));
            }
        }
        let size = targets
            .first()
            .and_then(|t| self.textures.get(t))
            .map(|t| t.desc.size)
            .unwrap_or(UVec2::ZERO);
        self.draws.push(DrawRecord {
            program: program_id,
            framebuffer: fb_id,
            targets,
            inputs,
            size,
        });
        Ok(())
    }

    fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            textures: self.textures.len(),
            framebuffers: self.framebuffers.len(),
            stages: self.stages.len(),
            programs: self.programs.len(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
