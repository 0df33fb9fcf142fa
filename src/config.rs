use std::path::PathBuf;

use crate::surface::SurfaceAttributes;

/// Configuration for a [`GraphicsContext`](crate::GraphicsContext).
///
/// # Example
///
/// ```
/// use phalanx::RuntimeConfig;
///
/// let config = RuntimeConfig::new()
///     .shader_search_path("shaders")
///     .shader_search_path("shaders/modules")
///     .include_root("shaders/include")
///     .float_render_targets(true);
/// assert_eq!(config.shader_search_paths.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directories searched in order for shader stage files.
    pub shader_search_paths: Vec<PathBuf>,
    /// Directory `#include` directives resolve against. Falls back to the
    /// search paths when unset.
    pub include_root: Option<PathBuf>,
    /// Reuse compiled programs for identical load requests.
    pub program_caching: bool,
    /// Whether the header text is part of a program's cache key.
    pub key_programs_by_header: bool,
    /// Slots added when a surface container grows past its capacity.
    pub surface_capacity_increment: usize,
    /// Render ports allocate 16-bit float color instead of 8-bit.
    pub float_render_targets: bool,
    /// Render ports carry a depth attachment next to their color.
    pub depth_attachments: bool,
    /// Caps the sampling slots below what the device reports.
    pub max_sampling_slots: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shader_search_paths: Vec::new(),
            include_root: None,
            program_caching: true,
            key_programs_by_header: true,
            surface_capacity_increment: 4,
            float_render_targets: false,
            depth_attachments: true,
            max_sampling_slots: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a directory after those already configured.
    pub fn shader_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shader_search_paths.push(path.into());
        self
    }

    pub fn include_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_root = Some(path.into());
        self
    }

    pub fn program_caching(mut self, enabled: bool) -> Self {
        self.program_caching = enabled;
        self
    }

    /// Setting this to `false` keys programs by their stage files only, so
    /// two loads that differ only in header text share one program.
    pub fn key_programs_by_header(mut self, enabled: bool) -> Self {
        self.key_programs_by_header = enabled;
        self
    }

    pub fn surface_capacity_increment(mut self, increment: usize) -> Self {
        self.surface_capacity_increment = increment.max(1);
        self
    }

    pub fn float_render_targets(mut self, enabled: bool) -> Self {
        self.float_render_targets = enabled;
        self
    }

    pub fn depth_attachments(mut self, enabled: bool) -> Self {
        self.depth_attachments = enabled;
        self
    }

    pub fn max_sampling_slots(mut self, slots: Option<u32>) -> Self {
        self.max_sampling_slots = slots;
        self
    }

    /// Attribute mask used for render port targets.
    pub fn render_port_attributes(&self) -> SurfaceAttributes {
        let color = if self.float_render_targets {
            SurfaceAttributes::RGBA_FLOAT16
        } else {
            SurfaceAttributes::RGBA
        };
        if self.depth_attachments {
            color | SurfaceAttributes::DEPTH | SurfaceAttributes::DEPTH_TEX
        } else {
            color
        }
    }
}
