//! Render surfaces.
//!
//! A [`SurfaceContainer`] owns one framebuffer object and a growable array
//! of targets. Each target has a [`SurfaceAttributes`] role that decides
//! which color and depth textures are created whenever the container is
//! resized.

mod attributes;
mod container;

pub use attributes::SurfaceAttributes;
pub use container::SurfaceContainer;
