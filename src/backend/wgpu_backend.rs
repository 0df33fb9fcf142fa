use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;

use glam::Vec4;

use super::wgsl::{self, ParsedStage, ResourceKind, ResourceUse};
use super::{
    Attachment, AttachmentPoint, FramebufferId, GpuBackend, GpuCapabilities, LiveObjects,
    PixelRegion, ProgramId, ReadSource, ShaderStage, StageId, TextureDescriptor, TextureFormat,
    TextureId, TextureKind,
};
use crate::error::{BackendError, ShaderDiagnostic};

struct GpuTexture {
    texture: wgpu::Texture,
    desc: TextureDescriptor,
}

#[derive(Default)]
struct Framebuffer {
    color: BTreeMap<u32, Attachment>,
    depth: Option<(AttachmentPoint, Attachment)>,
    draw_buffers: u32,
}

struct GpuStage {
    parsed: ParsedStage,
    module: wgpu::ShaderModule,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    colors: Vec<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
}

struct GpuProgram {
    label: String,
    stages: Vec<StageId>,
    resources: Vec<ResourceUse>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

/// A backend on a headless wgpu device.
///
/// Framebuffers are bookkeeping only: clears and draws open one render pass
/// over whatever is attached when they run. Pipelines are created on first
/// draw per attachment format set and cached on the program.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: GpuCapabilities,
    next_id: u64,
    textures: HashMap<TextureId, GpuTexture>,
    framebuffers: HashMap<FramebufferId, Framebuffer>,
    bound: Option<FramebufferId>,
    stages: HashMap<StageId, GpuStage>,
    programs: HashMap<ProgramId, GpuProgram>,
    active_slot: u32,
    slot_bindings: BTreeMap<u32, TextureId>,
    current_program: Option<ProgramId>,
    sampler: wgpu::Sampler,
    compare_sampler: wgpu::Sampler,
}

impl WgpuBackend {
    /// Opens the default adapter without a surface.
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| BackendError::Device(e.to_string()))?;

        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Phalanx Device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| BackendError::Device(e.to_string()))?;

        Ok(Self::from_device(device, queue, &adapter.get_info().name, &limits))
    }

    /// Wraps an existing device. `limits` should be the ones it was created with.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, vendor: &str, limits: &wgpu::Limits) -> Self {
        let caps = GpuCapabilities {
            vendor: vendor.to_string(),
            max_sampling_slots: limits.max_sampled_textures_per_shader_stage,
            max_surface_size: limits.max_texture_dimension_2d,
            max_color_attachments: limits.max_color_attachments,
            float_targets: true,
            // Depth24Plus has no copy or read-back path.
            depth24: false,
        };

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Phalanx Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let compare_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Phalanx Compare Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });

        Self {
            device,
            queue,
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
            sampler,
            compare_sampler,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The wgpu texture behind `texture`, for callers that draw themselves.
    pub fn texture(&self, texture: TextureId) -> Option<&wgpu::Texture> {
        self.textures.get(&texture).map(|t| &t.texture)
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn bound_fb(&self) -> Result<&Framebuffer, BackendError> {
        let id = self.bound.ok_or(BackendError::NoFramebufferBound)?;
        self.framebuffers
            .get(&id)
            .ok_or(BackendError::UnknownFramebuffer(id))
    }

    fn gpu_texture(&self, texture: TextureId) -> Result<&GpuTexture, BackendError> {
        self.textures
            .get(&texture)
            .ok_or(BackendError::UnknownTexture(texture))
    }

    fn attachment_view(&self, attachment: &Attachment) -> Result<wgpu::TextureView, BackendError> {
        let texture = self.gpu_texture(attachment.texture)?;
        Ok(texture.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&texture.desc.label),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: attachment.layer,
            array_layer_count: Some(1),
            ..Default::default()
        }))
    }

    fn sampling_view(&self, texture: TextureId) -> Result<wgpu::TextureView, BackendError> {
        let texture = self.gpu_texture(texture)?;
        let dimension = match texture.desc.kind {
            TextureKind::CubeMap => wgpu::TextureViewDimension::Cube,
            TextureKind::D2 | TextureKind::Rectangle => wgpu::TextureViewDimension::D2,
        };
        let aspect = if texture.desc.format.has_stencil() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };
        Ok(texture.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&texture.desc.label),
            dimension: Some(dimension),
            aspect,
            ..Default::default()
        }))
    }

    /// Current attachments of the bound framebuffer: draw-buffer colors and depth.
    fn active_attachments(&self) -> Result<(Vec<Attachment>, Option<Attachment>), BackendError> {
        let fb = self.bound_fb()?;
        let colors = (0..fb.draw_buffers)
            .filter_map(|i| fb.color.get(&i).copied())
            .collect();
        Ok((colors, fb.depth.map(|(_, a)| a)))
    }

    fn map_read(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>, BackendError> {
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        loop {
            self.device
                .poll(wgpu::PollType::Poll)
                .map_err(|e| BackendError::Device(e.to_string()))?;
            match rx.try_recv() {
                Ok(result) => {
                    result.map_err(|e| BackendError::Device(e.to_string()))?;
                    break;
                }
                Err(mpsc::TryRecvError::Empty) => std::thread::yield_now(),
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(BackendError::Device("read-back was cancelled".into()));
                }
            }
        }
        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }

    fn ensure_pipeline(&mut self, program_id: ProgramId, key: &PipelineKey) -> Result<(), BackendError> {
        let program = self
            .programs
            .get(&program_id)
            .ok_or(BackendError::UnknownShader(program_id.0))?;
        if program.pipelines.contains_key(key) {
            return Ok(());
        }

        let stage = |kind: ShaderStage| {
            program
                .stages
                .iter()
                .filter_map(|id| self.stages.get(id))
                .find(|s| s.parsed.stage == kind)
        };
        let vertex = stage(ShaderStage::Vertex).ok_or_else(|| {
            BackendError::Unsupported(format!("program `{}` has no vertex stage", program.label))
        })?;
        let fragment = stage(ShaderStage::Fragment);

        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .colors
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&program.label),
            layout: None,
            vertex: wgpu::VertexState {
                module: &vertex.module,
                entry_point: Some(vertex.parsed.entry_point.as_str()),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: fragment.map(|fs| wgpu::FragmentState {
                module: &fs.module,
                entry_point: Some(fs.parsed.entry_point.as_str()),
                targets: &targets,
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: key.depth.map(|format| wgpu::DepthStencilState {
                format,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Always,
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Device(error.to_string()));
        }

        if let Some(program) = self.programs.get_mut(&program_id) {
            program.pipelines.insert(key.clone(), pipeline);
        }
        Ok(())
    }
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        TextureFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

/// 24-bit depth has no defined memory layout and cannot be copied.
fn copyable(format: TextureFormat) -> bool {
    !matches!(
        format,
        TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8
    )
}

fn decode(format: TextureFormat, bytes: &[u8], out: &mut Vec<f32>) {
    match format {
        TextureFormat::Rgba8Unorm => out.extend(bytes.iter().map(|b| *b as f32 / 255.0)),
        TextureFormat::Rgba16Float => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_bits(bytemuck::pod_read_unaligned::<u16>(c)).to_f32()),
        ),
        TextureFormat::Depth16Unorm => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| bytemuck::pod_read_unaligned::<u16>(c) as f32 / 65_535.0),
        ),
        TextureFormat::Depth32Float => out.extend(
            bytes
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>),
        ),
        TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8 => {}
    }
}

impl GpuBackend for WgpuBackend {
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

        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if copyable(desc.format) {
            usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        }
        if desc.sampled {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.size.x,
                height: desc.size.y,
                depth_or_array_layers: desc.layers(),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(desc.format),
            usage,
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Device(error.to_string()));
        }

        let id = TextureId(self.next());
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                desc: desc.clone(),
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        match self.textures.remove(&texture) {
            Some(gpu) => gpu.texture.destroy(),
            None => log::warn!("destroying unknown texture {texture:?}"),
        }
        self.slot_bindings.retain(|_, bound| *bound != texture);
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId) -> Result<(), BackendError> {
        let source = self.gpu_texture(src)?;
        let target = self.gpu_texture(dst)?;
        if source.desc.size != target.desc.size
            || source.desc.format != target.desc.format
            || source.desc.layers() != target.desc.layers()
            || !copyable(source.desc.format)
        {
            return Err(BackendError::Unsupported(format!(
                "cannot copy `{}` into `{}`",
                source.desc.label, target.desc.label
            )));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Phalanx Copy"),
            });
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: source.desc.size.x,
                height: source.desc.size.y,
                depth_or_array_layers: source.desc.layers(),
            },
        );
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn create_framebuffer(&mut self, _label: &str) -> Result<FramebufferId, BackendError> {
        let id = FramebufferId(self.next());
        self.framebuffers.insert(id, Framebuffer::default());
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
            let texture = self.gpu_texture(attachment.texture)?;
            let wants_depth = !matches!(point, AttachmentPoint::Color(_));
            if texture.desc.format.is_depth() != wants_depth {
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
        let (colors, depth_attachment) = self.active_attachments()?;
        let color_views = match color {
            Some(_) => colors
                .iter()
                .map(|a| self.attachment_view(a))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let depth_view = match (depth, depth_attachment) {
            (Some(_), Some(a)) => {
                let stencil = self.gpu_texture(a.texture)?.desc.format.has_stencil();
                Some((self.attachment_view(&a)?, stencil))
            }
            _ => None,
        };
        if color_views.is_empty() && depth_view.is_none() {
            return Ok(());
        }

        let clear = color.unwrap_or(Vec4::ZERO);
        let clear = wgpu::Color {
            r: clear.x as f64,
            g: clear.y as f64,
            b: clear.z as f64,
            a: clear.w as f64,
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(clear),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Phalanx Clear"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Phalanx Clear Pass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_view.as_ref().map(|(view, stencil)| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(depth.unwrap_or(1.0)),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: stencil.then_some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(0),
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self, source: ReadSource, region: PixelRegion) -> Result<Vec<f32>, BackendError> {
        let fb = self.bound_fb()?;
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
        let texture = self.gpu_texture(attachment.texture)?;
        if !region.fits(texture.desc.size) {
            return Err(BackendError::OutOfBounds);
        }
        let format = texture.desc.format;
        if !copyable(format) {
            return Err(BackendError::Unsupported(format!(
                "read-back of {format:?} is not supported"
            )));
        }

        let row_bytes = region.size.x * format.bytes_per_pixel() as u32;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row_bytes = row_bytes.div_ceil(align) * align;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Phalanx Read-back"),
            size: (padded_row_bytes * region.size.y) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Phalanx Read-back"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: region.origin.x,
                    y: region.origin.y,
                    z: attachment.layer,
                },
                aspect: if format.is_depth() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width: region.size.x,
                height: region.size.y,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.map_read(&buffer)?;
        let mut out = Vec::new();
        for row in bytes.chunks_exact(padded_row_bytes as usize) {
            decode(format, &row[..row_bytes as usize], &mut out);
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
                self.gpu_texture(texture)?;
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
        label: &str,
        source: &str,
    ) -> Result<StageId, ShaderDiagnostic> {
        let parsed = wgsl::parse_stage(stage, source)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ShaderDiagnostic::new(error.to_string()));
        }

        let id = StageId(self.next());
        self.stages.insert(id, GpuStage { parsed, module });
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
                    .map(|s| &s.parsed)
                    .ok_or_else(|| ShaderDiagnostic::new(format!("`{label}`: unknown stage {id:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        wgsl::check_link(&parsed)?;
        let resources = parsed.iter().flat_map(|p| p.resources.iter().copied()).collect();

        let id = ProgramId(self.next());
        self.programs.insert(
            id,
            GpuProgram {
                label: label.to_string(),
                stages: stages.to_vec(),
                resources,
                pipelines: HashMap::new(),
            },
        );
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
        let (colors, depth) = self.active_attachments()?;
        let key = PipelineKey {
            colors: colors
                .iter()
                .map(|a| self.gpu_texture(a.texture).map(|t| wgpu_format(t.desc.format)))
                .collect::<Result<_, _>>()?,
            depth: depth
                .map(|a| self.gpu_texture(a.texture).map(|t| wgpu_format(t.desc.format)))
                .transpose()?,
        };
        self.ensure_pipeline(program_id, &key)?;

        let program = self
            .programs
            .get(&program_id)
            .ok_or(BackendError::UnknownShader(program_id.0))?;
        let pipeline = program
            .pipelines
            .get(&key)
            .ok_or(BackendError::UnknownShader(program_id.0))?;

        let mut views = Vec::new();
        for resource in &program.resources {
            match (resource.group, resource.kind) {
                (0, ResourceKind::Texture) => {
                    let texture = self
                        .slot_bindings
                        .get(&resource.binding)
                        .copied()
                        .ok_or(BackendError::MissingBinding(resource.binding))?;
                    views.push((resource.binding, self.sampling_view(texture)?));
                }
                (0, ResourceKind::Sampler { .. }) => {}
                _ => {
                    return Err(BackendError::Unsupported(format!(
                        "binding {}/{} of `{}` is not a group 0 texture or sampler",
                        resource.group, resource.binding, program.label
                    )));
                }
            }
        }
        let mut entries: Vec<wgpu::BindGroupEntry> = views
            .iter()
            .map(|(binding, view)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect();
        for resource in &program.resources {
            if let ResourceKind::Sampler { comparison } = resource.kind {
                let sampler = if comparison { &self.compare_sampler } else { &self.sampler };
                entries.push(wgpu::BindGroupEntry {
                    binding: resource.binding,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
        }
        let bind_group = (!entries.is_empty()).then(|| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&program.label),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            })
        });

        let color_views = colors
            .iter()
            .map(|a| self.attachment_view(a))
            .collect::<Result<Vec<_>, _>>()?;
        let depth_view = depth.map(|a| self.attachment_view(&a)).transpose()?;
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })
            })
            .collect();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Phalanx Draw"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&program.label),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_view.as_ref().map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            if let Some(bind_group) = &bind_group {
                pass.set_bind_group(0, bind_group, &[]);
            }
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
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

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use super::*;

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn clear_and_read_back_on_device() {
        let Ok(mut backend) = WgpuBackend::new() else {
            return;
        };
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: "target".into(),
                size: UVec2::new(16, 8),
                format: TextureFormat::Rgba8Unorm,
                kind: TextureKind::D2,
                sampled: true,
            })
            .unwrap();
        let fb = backend.create_framebuffer("fb").unwrap();
        backend
            .attach(fb, AttachmentPoint::Color(0), Some(Attachment::new(texture)))
            .unwrap();
        backend.set_draw_buffers(fb, 1).unwrap();
        backend.bind_framebuffer(Some(fb)).unwrap();
        backend.clear(Some(Vec4::new(0.0, 1.0, 0.0, 1.0)), None).unwrap();

        let pixels = backend
            .read_pixels(ReadSource::Color(0), PixelRegion::whole(UVec2::new(16, 8)))
            .unwrap();
        assert_eq!(pixels.len(), 16 * 8 * 4);
        assert!(pixels.chunks(4).all(|p| p == [0.0, 1.0, 0.0, 1.0]));
    }
}
