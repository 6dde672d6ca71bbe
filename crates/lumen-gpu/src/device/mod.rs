//! Device seam.
//!
//! Everything above this module talks to the GPU through [`GpuDevice`].
//! Handles are opaque `u64` values so the same engine code drives the Vulkan
//! device and the in-memory [`HeadlessDevice`].
//!
//! Recording calls (`cmd_*`) on different command buffers may run
//! concurrently as long as each buffer comes from a pool owned by the
//! calling thread. `submit` is serialized by the caller.

pub mod headless;

pub use gpu_allocator::MemoryLocation;
pub use headless::{HeadlessDevice, RecordedCommand};

use bitflags::bitflags;

pub use crate::error::DeviceError;
use crate::shader::ShaderStage;

pub type DeviceResult<T> = Result<T, DeviceError>;

macro_rules! gpu_handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

gpu_handles! {
    /// GPU buffer with bound memory.
    BufferHandle,
    /// Image together with its default view.
    ImageHandle,
    SamplerHandle,
    /// Descriptor set layout plus the pipeline layout built from it.
    BindingLayoutHandle,
    PipelineHandle,
    DescriptorSetHandle,
    CommandPoolHandle,
    CommandBufferHandle,
    FenceHandle,
}

bitflags! {
    /// Shader stages that can see a binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StageMask: u8 {
        const VERTEX = 1;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }

    /// How a buffer will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u8 {
        const VERTEX = 1;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }

    /// How an image will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u8 {
        const SAMPLED = 1;
        const TRANSFER_DST = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const STORAGE = 1 << 4;
    }
}

impl From<ShaderStage> for StageMask {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => StageMask::VERTEX,
            ShaderStage::Fragment => StageMask::FRAGMENT,
            ShaderStage::Compute => StageMask::COMPUTE,
        }
    }
}

// ============================================================================
// Fixed-function state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthFunction {
    Never,
    Less,
    Equal,
    #[default]
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    PointList,
    LineList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

/// Layout an image is in (or is transitioned to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    TransferDst,
    ShaderRead,
    ColorAttachment,
    DepthAttachment,
    General,
}

impl ImageLayout {
    /// Layouts in which the image is being written by the device.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ImageLayout::TransferDst
                | ImageLayout::ColorAttachment
                | ImageLayout::DepthAttachment
                | ImageLayout::General
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float => 4,
            VertexFormat::Float2 => 8,
            VertexFormat::Float3 => 12,
            VertexFormat::Float4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Fixed-function state baked into a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub blend: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_function: DepthFunction,
}

// ============================================================================
// Object descriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Uniform buffer addressed with a dynamic offset at bind time.
    UniformBufferDynamic,
    CombinedImageSampler,
    StorageBuffer,
    StorageImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: StageMask,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub name: &'a str,
    pub layout: BindingLayoutHandle,
    pub vertex_code: &'a [u32],
    pub fragment_code: &'a [u32],
    pub vertex_bindings: &'a [VertexBinding],
    pub vertex_attributes: &'a [VertexAttribute],
    pub topology: Topology,
    pub raster: RasterState,
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDesc<'a> {
    pub name: &'a str,
    pub layout: BindingLayoutHandle,
    pub code: &'a [u32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer { buffer: BufferHandle, range: u64 },
    ImageSampler { image: ImageHandle, sampler: SamplerHandle },
    StorageBuffer { buffer: BufferHandle, range: u64 },
    StorageImage { image: ImageHandle },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

/// Attachments for a dynamic-rendering scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderingInfo {
    pub color: Option<ImageHandle>,
    pub depth: Option<ImageHandle>,
    pub width: u32,
    pub height: u32,
}

/// Device properties the engine depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLimits {
    pub name: String,
    /// Required alignment of dynamic uniform buffer offsets.
    pub min_uniform_offset_alignment: u64,
    /// Device-local memory is also host-visible (integrated GPUs).
    pub unified_memory: bool,
}

// ============================================================================
// Device trait
// ============================================================================

/// The operations the engine needs from a GPU device.
pub trait GpuDevice: Send + Sync {
    fn limits(&self) -> DeviceLimits;

    /// Compile one rewritten shader stage to SPIR-V.
    fn compile_glsl(&self, stage: ShaderStage, name: &str, source: &str) -> DeviceResult<Vec<u32>>;

    // ---- Pipelines and layouts ----

    fn create_binding_layout(&self, bindings: &[LayoutBinding]) -> DeviceResult<BindingLayoutHandle>;
    fn destroy_binding_layout(&self, layout: BindingLayoutHandle);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<PipelineHandle>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> DeviceResult<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);
    fn allocate_descriptor_sets(
        &self,
        layout: BindingLayoutHandle,
        count: u32,
    ) -> DeviceResult<Vec<DescriptorSetHandle>>;
    fn write_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]);

    // ---- Memory ----

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
        name: &str,
    ) -> DeviceResult<BufferHandle>;
    /// Copy into a host-visible buffer and flush the written range.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn create_image(&self, desc: &ImageDesc, name: &str) -> DeviceResult<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);
    fn create_sampler(&self, filter: SamplerFilter, repeat: bool) -> DeviceResult<SamplerHandle>;
    fn destroy_sampler(&self, sampler: SamplerHandle);

    // ---- Command buffers ----

    fn create_command_pool(&self) -> DeviceResult<CommandPoolHandle>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> DeviceResult<CommandBufferHandle>;
    fn begin_commands(&self, cmd: CommandBufferHandle) -> DeviceResult<()>;
    fn end_commands(&self, cmd: CommandBufferHandle) -> DeviceResult<()>;

    fn cmd_begin_rendering(&self, cmd: CommandBufferHandle, info: &RenderingInfo);
    fn cmd_end_rendering(&self, cmd: CommandBufferHandle);
    fn cmd_clear(&self, cmd: CommandBufferHandle, color: Option<[f32; 4]>, depth: Option<f32>, width: u32, height: u32);
    fn cmd_bind_pipeline(&self, cmd: CommandBufferHandle, bind_point: BindPoint, pipeline: PipelineHandle);
    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: BindPoint,
        layout: BindingLayoutHandle,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_vertex_buffers(&self, cmd: CommandBufferHandle, first_binding: u32, buffers: &[BufferHandle]);
    fn cmd_bind_index_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle);
    fn cmd_draw(&self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32, first_vertex: u32);
    fn cmd_draw_indexed(&self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32, first_index: u32);
    fn cmd_dispatch(&self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64);
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        image: ImageHandle,
        width: u32,
        height: u32,
    );
    fn cmd_image_barrier(&self, cmd: CommandBufferHandle, image: ImageHandle, old: ImageLayout, new: ImageLayout);
    /// Full memory dependency between everything before and after.
    fn cmd_memory_barrier(&self, cmd: CommandBufferHandle);

    // ---- Synchronization ----

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);
    /// Returns `Ok(false)` if the timeout expired.
    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> DeviceResult<bool>;
    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()>;
    /// Submit command buffers in order, signaling `fence` on completion.
    fn submit(&self, buffers: &[CommandBufferHandle], fence: FenceHandle) -> DeviceResult<()>;
    fn wait_idle(&self) -> DeviceResult<()>;
}
