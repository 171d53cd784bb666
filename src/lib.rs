//! Real-time Vulkan frame orchestration with precomputed atmospheric scattering
//!
//! A [`Renderer`] runs the atmosphere precompute once at construction, then drives frames through
//! a fixed sequence of passes: a reduced-resolution background, scene geometry, composition with
//! the atmosphere, tone mapping, post effects, and an overlay. See [`frame`] for the frame loop and
//! [`precompute`] for the scattering solver.

mod config;
mod context;
mod error;
pub mod frame;
mod memory;
pub mod params;
pub mod precompute;
mod renderer;
mod shader;
pub mod vulkan;

pub use config::{Config, PresentMode};
pub use context::{Context, Queue, SamplerKey, Surface};
pub use error::{Error, Result};
pub use frame::{Backend, CloudLayerSettings, Orchestrator, Step, View};
pub use memory::{Buffer, Image, ImageView};
pub use params::{beta_rayleigh, AtmosphereParams};
pub use precompute::{Atmosphere, Precomputer};
pub use renderer::Renderer;
pub use shader::{ShaderLibrary, ShaderModule};
