//! The graphics-driver seam.
//!
//! Everything the runtime needs from a GPU goes through [`GpuBackend`]:
//! textures, framebuffer objects with attachment points, clears, read-back,
//! shader stages and programs, sampling-slot bindings and a fullscreen draw.
//! The model follows a classic framebuffer-object API so
//! that surface containers can reason about "what is attached where".
//!
//! ```text
//!   SurfaceContainer ──┐
//!   ProgramCache ──────┼──► GraphicsContext ──► Box<dyn GpuBackend>
//!   SlotAllocator ─────┘                          ├─ HeadlessBackend (CPU)
//!                                                 └─ WgpuBackend     (GPU)
//! ```
//!
//! Two implementations ship. [`HeadlessBackend`] keeps pixels in memory,
//! quantized to each format's precision, and records draw calls instead of
//! rasterizing them. [`WgpuBackend`] runs on a headless wgpu device.

mod headless;
mod wgpu_backend;
pub(crate) mod wgsl;

pub use headless::{DrawRecord, HeadlessBackend};
pub use wgpu_backend::WgpuBackend;

use std::any::Any;

use glam::{UVec2, Vec4};

use crate::error::{BackendError, ShaderDiagnostic};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// The backend's numeric handle, for logs.
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

object_id!(
    /// A texture or renderbuffer owned by a backend.
    TextureId
);
object_id!(
    /// A framebuffer object: a set of attachment points.
    FramebufferId
);
object_id!(
    /// One compiled shader stage.
    StageId
);
object_id!(
    /// A linked program.
    ProgramId
);

/// Pixel formats render surfaces are allocated with.
///
/// Three-channel color roles are stored as four channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Depth16Unorm,
    Depth24Plus,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    /// Storage size of one pixel of one layer.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Depth16Unorm => 2,
            TextureFormat::Depth24Plus => 4,
            TextureFormat::Depth32Float => 4,
            TextureFormat::Depth24PlusStencil8 => 4,
        }
    }

    /// Depth formats can only be attached at a depth point.
    pub fn is_depth(self) -> bool {
        !matches!(self, TextureFormat::Rgba8Unorm | TextureFormat::Rgba16Float)
    }

    pub fn has_stencil(self) -> bool {
        self == TextureFormat::Depth24PlusStencil8
    }

    /// Rounds a value to what this format can store.
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            TextureFormat::Rgba8Unorm => unorm(value, 255.0),
            TextureFormat::Rgba16Float => half::f16::from_f32(value).to_f32(),
            TextureFormat::Depth16Unorm => unorm(value, 65_535.0),
            TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8 => {
                unorm(value, 16_777_215.0)
            }
            TextureFormat::Depth32Float => value,
        }
    }
}

fn unorm(value: f32, max: f32) -> f32 {
    (value.clamp(0.0, 1.0) * max).round() / max
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    D2,
    /// Non-normalized coordinates; allocated like [`TextureKind::D2`].
    Rectangle,
    /// Six square layers.
    CubeMap,
}

/// Everything needed to allocate a texture.
///
/// ```
/// use glam::UVec2;
/// use phalanx::{TextureDescriptor, TextureFormat, TextureKind};
///
/// let desc = TextureDescriptor {
///     label: "env".to_string(),
///     size: UVec2::splat(4),
///     format: TextureFormat::Rgba8Unorm,
///     kind: TextureKind::CubeMap,
///     sampled: true,
/// };
/// assert_eq!(desc.layers(), 6);
/// assert_eq!(desc.byte_size(), 4 * 4 * 6 * 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDescriptor {
    pub label: String,
    pub size: UVec2,
    pub format: TextureFormat,
    pub kind: TextureKind,
    /// `false` allocates a renderbuffer that can be attached but not sampled.
    pub sampled: bool,
}

impl TextureDescriptor {
    /// Six for cube maps, one otherwise.
    pub fn layers(&self) -> u32 {
        match self.kind {
            TextureKind::CubeMap => 6,
            TextureKind::D2 | TextureKind::Rectangle => 1,
        }
    }

    /// Bytes of storage across every layer.
    pub fn byte_size(&self) -> usize {
        self.size.x as usize
            * self.size.y as usize
            * self.layers() as usize
            * self.format.bytes_per_pixel()
    }
}

/// Where a texture is attached on a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentPoint {
    Color(u32),
    Depth,
    DepthStencil,
}

/// A texture layer attached to a framebuffer. Layer selects a cube face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub texture: TextureId,
    pub layer: u32,
}

impl Attachment {
    /// Attaches the first layer.
    pub fn new(texture: TextureId) -> Self {
        Self { texture, layer: 0 }
    }
}

/// Which attachment of the bound framebuffer a read-back comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Color(u32),
    Depth,
}

/// A rectangle of pixels, rows counted from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub origin: UVec2,
    pub size: UVec2,
}

impl PixelRegion {
    /// A surface of `size` from corner to corner.
    pub fn whole(size: UVec2) -> Self {
        Self {
            origin: UVec2::ZERO,
            size,
        }
    }

    /// A single pixel.
    pub fn pixel(x: u32, y: u32) -> Self {
        Self {
            origin: UVec2::new(x, y),
            size: UVec2::ONE,
        }
    }

    /// Whether the region is non-empty and lies inside a surface of `size`.
    pub fn fits(&self, size: UVec2) -> bool {
        self.size.x > 0
            && self.size.y > 0
            && self.origin.x + self.size.x <= size.x
            && self.origin.y + self.size.y <= size.y
    }
}

/// A programmable pipeline stage. Programs store stages in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        }
    }
}

/// Limits queried once from the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuCapabilities {
    pub vendor: String,
    /// Texture units a program may sample at once.
    pub max_sampling_slots: u32,
    /// Largest edge of a render surface, in pixels.
    pub max_surface_size: u32,
    pub max_color_attachments: u32,
    /// Whether half-float color targets can be rendered to.
    pub float_targets: bool,
    /// Whether 24-bit depth is available; 16-bit is used otherwise.
    pub depth24: bool,
}

impl Default for GpuCapabilities {
    fn default() -> Self {
        Self {
            vendor: "unknown".to_string(),
            max_sampling_slots: 16,
            max_surface_size: 8192,
            max_color_attachments: 8,
            float_targets: true,
            depth24: true,
        }
    }
}

/// Counts of objects a backend still holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub textures: usize,
    pub framebuffers: usize,
    pub stages: usize,
    pub programs: usize,
}

impl LiveObjects {
    /// Nothing left behind.
    pub fn is_empty(&self) -> bool {
        *self == LiveObjects::default()
    }
}

/// A graphics driver.
///
/// Reads, clears and draws act on the bound framebuffer; binding `None`
/// selects the window surface, which headless backends do not have.
pub trait GpuBackend {
    fn capabilities(&self) -> GpuCapabilities;

    /// Allocates storage. The contents start cleared to zero.
    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureId, BackendError>;
    fn destroy_texture(&mut self, texture: TextureId);
    /// Copies every layer. Both textures must agree in size and format.
    fn copy_texture(&mut self, src: TextureId, dst: TextureId) -> Result<(), BackendError>;

    fn create_framebuffer(&mut self, label: &str) -> Result<FramebufferId, BackendError>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId);
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> Result<(), BackendError>;
    /// `None` when the window surface is bound.
    fn bound_framebuffer(&self) -> Option<FramebufferId>;
    /// Attaches or, with `None`, detaches.
    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        attachment: Option<Attachment>,
    ) -> Result<(), BackendError>;
    /// Routes output to color attachments `0..count`.
    fn set_draw_buffers(&mut self, framebuffer: FramebufferId, count: u32) -> Result<(), BackendError>;

    fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>) -> Result<(), BackendError>;
    /// RGBA floats for color, one float per pixel for depth.
    fn read_pixels(&mut self, source: ReadSource, region: PixelRegion) -> Result<Vec<f32>, BackendError>;

    /// Makes `slot` the active texture unit.
    fn select_sampling_slot(&mut self, slot: u32);
    /// Binds `texture` to `slot`, or unbinds with `None`.
    fn bind_texture(&mut self, slot: u32, texture: Option<TextureId>) -> Result<(), BackendError>;

    fn compile_stage(
        &mut self,
        stage: ShaderStage,
        label: &str,
        source: &str,
    ) -> Result<StageId, ShaderDiagnostic>;
    /// Programs linked from the stage must be destroyed first.
    fn destroy_stage(&mut self, stage: StageId);
    fn link_program(&mut self, label: &str, stages: &[StageId]) -> Result<ProgramId, ShaderDiagnostic>;
    fn destroy_program(&mut self, program: ProgramId);
    fn use_program(&mut self, program: Option<ProgramId>) -> Result<(), BackendError>;
    /// Draws one fullscreen triangle with the program in use into the
    /// active draw buffers. Texture binding `n` of group 0 samples slot `n`.
    fn draw_fullscreen(&mut self) -> Result<(), BackendError>;

    /// What would leak if the backend were dropped now.
    fn live_objects(&self) -> LiveObjects;

    /// Reaches backend-specific accessors through a `dyn GpuBackend`.
    fn as_any(&self) -> &dyn Any;
}
