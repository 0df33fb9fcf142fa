use bitflags::bitflags;

use crate::backend::{GpuCapabilities, TextureFormat, TextureKind};

bitflags! {
    /// Role of a surface container slot.
    ///
    /// The color and depth groups are enumerations packed into a nibble each,
    /// so compare [`color`](Self::color) and [`depth`](Self::depth) for
    /// equality instead of using `contains`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SurfaceAttributes: u32 {
        const RGB = 0x1;
        const RGBA = 0x2;
        const RGB_FLOAT16 = 0x3;
        const RGBA_FLOAT16 = 0x4;
        const COLOR_MASK = 0xf;

        /// Depth at whatever precision the device handles best.
        const DEPTH = 0x10;
        const DEPTH16 = 0x20;
        const DEPTH24 = 0x30;
        const DEPTH32 = 0x40;
        const DEPTH_STENCIL = 0x50;
        const DEPTH_MASK = 0xf0;

        const STENCIL = 0x100;
        const STENCIL_MASK = 0xf00;

        /// Depth is allocated as a sampled texture instead of a renderbuffer.
        const DEPTH_TEX = 0x1000;
        const TEX_RECT = 0x2000;
        const CUBE_MAP = 0x4000;

        /// Pseudo-slot standing for the window surface.
        const FRAMEBUFFER = 0x100000;
        const FRAMEBUFFER_MASK = 0xf00000;
    }
}

impl SurfaceAttributes {
    /// The color group alone.
    pub fn color(self) -> SurfaceAttributes {
        self & Self::COLOR_MASK
    }

    pub fn depth(self) -> SurfaceAttributes {
        self & Self::DEPTH_MASK
    }

    pub fn has_color(self) -> bool {
        !self.color().is_empty()
    }

    /// A stencil flag, or the combined depth-stencil format.
    pub fn has_stencil(self) -> bool {
        self.intersects(Self::STENCIL_MASK) || self.depth() == Self::DEPTH_STENCIL
    }

    pub fn has_depth(self) -> bool {
        !self.depth().is_empty() || self.has_stencil()
    }

    pub fn is_framebuffer(self) -> bool {
        self.intersects(Self::FRAMEBUFFER_MASK)
    }

    /// Three-channel roles share the four-channel format.
    pub fn color_format(self) -> Option<TextureFormat> {
        let color = self.color();
        if color == Self::RGB || color == Self::RGBA {
            Some(TextureFormat::Rgba8Unorm)
        } else if color == Self::RGB_FLOAT16 || color == Self::RGBA_FLOAT16 {
            Some(TextureFormat::Rgba16Float)
        } else {
            None
        }
    }

    /// Depth format for this mask. A plain `DEPTH` picks 24 bits when the
    /// device has them and 16 otherwise.
    pub fn depth_format(self, caps: &GpuCapabilities) -> Option<TextureFormat> {
        if self.has_stencil() {
            return Some(TextureFormat::Depth24PlusStencil8);
        }
        let depth = self.depth();
        if depth == Self::DEPTH {
            Some(if caps.depth24 {
                TextureFormat::Depth24Plus
            } else {
                TextureFormat::Depth16Unorm
            })
        } else if depth == Self::DEPTH16 {
            Some(TextureFormat::Depth16Unorm)
        } else if depth == Self::DEPTH24 {
            Some(TextureFormat::Depth24Plus)
        } else if depth == Self::DEPTH32 {
            Some(TextureFormat::Depth32Float)
        } else {
            None
        }
    }

    pub fn texture_kind(self) -> TextureKind {
        if self.contains(Self::CUBE_MAP) {
            TextureKind::CubeMap
        } else if self.contains(Self::TEX_RECT) {
            TextureKind::Rectangle
        } else {
            TextureKind::D2
        }
    }

    /// Short human-readable description, used in debug labels and logs.
    pub fn describe(self) -> String {
        if self.is_framebuffer() {
            return "framebuffer".to_string();
        }
        let mut parts = Vec::new();
        let color = self.color();
        if color == Self::RGB {
            parts.push("rgb8");
        } else if color == Self::RGBA {
            parts.push("rgba8");
        } else if color == Self::RGB_FLOAT16 {
            parts.push("rgb16f");
        } else if color == Self::RGBA_FLOAT16 {
            parts.push("rgba16f");
        }
        let depth = self.depth();
        if depth == Self::DEPTH_STENCIL || (self.has_stencil() && !depth.is_empty()) {
            parts.push("depth24-stencil8");
        } else if depth == Self::DEPTH {
            parts.push("depth");
        } else if depth == Self::DEPTH16 {
            parts.push("depth16");
        } else if depth == Self::DEPTH24 {
            parts.push("depth24");
        } else if depth == Self::DEPTH32 {
            parts.push("depth32");
        } else if self.has_stencil() {
            parts.push("stencil");
        }
        if self.contains(Self::DEPTH_TEX) && self.has_depth() {
            parts.push("depth-texture");
        }
        match self.texture_kind() {
            TextureKind::CubeMap => parts.push("cube"),
            TextureKind::Rectangle => parts.push("rect"),
            TextureKind::D2 => {}
        }
        if parts.is_empty() {
            "empty".to_string()
        } else {
            parts.join(" ")
        }
    }
}
