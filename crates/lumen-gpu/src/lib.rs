//! Command submission and shader resource binding for an explicit-API
//! render backend.
//!
//! Callers work in the immediate style of a classic uniform/program API:
//! load shaders, link programs, set uniforms by name, bind buffers and
//! textures to numbered units, and issue draws. Underneath, shaders are
//! rewritten so loose uniforms live in one block per stage, uniform values
//! are staged per program, and draws are recorded into per-context command
//! rings that are submitted in batches and recycled behind fences.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lumen_gpu::{Backend, BackendConfig, ProgramKind, ShaderStage, VulkanDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackendConfig::default();
//! let device = Arc::new(VulkanDevice::new(&config)?);
//! let backend = Backend::new(device, config)?;
//!
//! let vs = backend.load_shader(ShaderStage::Vertex, "shaders", "sprite.vert", "")?;
//! let fs = backend.load_shader(ShaderStage::Fragment, "shaders", "sprite.frag", "")?;
//! let program = backend.create_program("sprite", ProgramKind::Objects);
//! backend.attach_shader(program, vs);
//! backend.attach_shader(program, fs);
//! backend.link(program)?;
//!
//! backend.begin_frame()?;
//! backend.use_program(0, Some(program))?;
//! if let Some(tint) = backend.get_uniform_location(program, "tint") {
//!     backend.set_uniform_vec4(0, tint, [1.0, 0.5, 0.5, 1.0]);
//! }
//! backend.draw_triangles(0, 6, 0, 1)?;
//! backend.end_frame()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod program;
pub mod resources;
pub mod shader;
pub mod stats;
pub mod vulkan;
pub mod workers;

pub use backend::Backend;
pub use config::BackendConfig;
pub use context::batch::DrawCall;
pub use context::RenderState;
pub use device::{CullMode, DepthFunction, DeviceError, FrontFace, GpuDevice, HeadlessDevice};
pub use error::{ConfigError, RenderError, RenderResult};
pub use program::uniforms::UniformData;
pub use program::{ProgramId, ProgramKind, UniformLocation};
pub use resources::buffer::BufferId;
pub use resources::texture::{RenderTargetId, TextureId};
pub use shader::{ShaderId, ShaderStage};
pub use stats::FrameStatistics;
pub use vulkan::VulkanDevice;
pub use workers::RenderWorkers;
