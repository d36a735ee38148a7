//! Hardware ray tracing of a small animated scene.
//!
//! Bottom-level structures are built once per mesh. The top-level structure
//! is refit in place whenever an instance transform changes. Frames rotate
//! through a fixed set of slots, each guarded by its own fence.

pub mod accel;
pub mod bounds;
pub mod camera;
pub mod commands;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod memory;
pub mod pipeline;
pub mod renderer;
pub mod sbt;
pub mod scene;
pub mod surface;
pub mod uniforms;

pub use config::RendererConfig;
pub use error::{RenderError, Result};
pub use renderer::Renderer;
