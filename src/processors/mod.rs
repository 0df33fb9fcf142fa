//! Processors shipped with the runtime.
//!
//! - [`ImageSource`]: a solid color at a chosen size
//! - [`Passthrough`]: copies its input to its output
//! - [`ShaderFilter`]: runs a fragment program over its input
//! - [`Canvas`]: the sink that keeps the last frame
//!
//! [`ProgramHelper`] is what a shading processor embeds to own its program.

mod canvas;
mod helper;
mod image_source;
mod passthrough;
mod shader_filter;

pub use canvas::Canvas;
pub use helper::{default_header, HeaderGenerator, ProgramHelper};
pub use image_source::ImageSource;
pub use passthrough::Passthrough;
pub use shader_filter::{ShaderFilter, COPY_FRAGMENT, FULLSCREEN_VERTEX};
