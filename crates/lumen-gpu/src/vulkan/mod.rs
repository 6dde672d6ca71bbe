//! Vulkan 1.3 implementation of the device seam.
//!
//! Offscreen only: rendering uses dynamic rendering into images owned by
//! the backend, and synchronization uses plain fences.

pub mod context;
pub mod device;
pub mod glslc;
pub mod memory;

pub use context::VulkanContext;
pub use device::VulkanDevice;
pub use memory::{Buffer, Image, MemoryManager};

use ash::vk;
use std::ffi::CStr;

use crate::device::{
    BindPoint, BindingKind, BufferUsage, CullMode, DepthFunction, DeviceError, FrontFace, ImageLayout, ImageUsage,
    SamplerFilter, StageMask, TextureFormat, Topology, VertexFormat,
};

/// Required Vulkan version.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Application name for the Vulkan instance.
pub const APP_NAME: &CStr = c"lumen";

/// Engine name for the Vulkan instance.
pub const ENGINE_NAME: &CStr = c"lumen-gpu";

pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

/// Map a failed Vulkan call onto the device error taxonomy.
pub fn device_error(result: vk::Result) -> DeviceError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => DeviceError::Lost(format!("{:?}", result)),
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => DeviceError::Allocation(format!("{:?}", result)),
        _ => DeviceError::Lost(format!("Vulkan error: {:?}", result)),
    }
}

// ============================================================================
// Conversions
// ============================================================================

pub fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn aspect_for(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageLayout::General => vk::ImageLayout::GENERAL,
    }
}

pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float => vk::Format::R32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (ours, theirs) in [
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (ImageUsage::DEPTH_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn stage_flags(stages: StageMask) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(StageMask::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(StageMask::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(StageMask::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn compare_op(function: DepthFunction) -> vk::CompareOp {
    match function {
        DepthFunction::Never => vk::CompareOp::NEVER,
        DepthFunction::Less => vk::CompareOp::LESS,
        DepthFunction::Equal => vk::CompareOp::EQUAL,
        DepthFunction::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        DepthFunction::Greater => vk::CompareOp::GREATER,
        DepthFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        DepthFunction::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        DepthFunction::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
    }
}

pub fn bind_point(point: BindPoint) -> vk::PipelineBindPoint {
    match point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

pub fn filter(filter: SamplerFilter) -> vk::Filter {
    match filter {
        SamplerFilter::Nearest => vk::Filter::NEAREST,
        SamplerFilter::Linear => vk::Filter::LINEAR,
    }
}

/// Access masks and stages for a layout transition.
pub fn transition_masks(
    old: ImageLayout,
    new: ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    use ImageLayout::*;

    let shader_stages = vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;

    match (old, new) {
        (Undefined, TransferDst) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (TransferDst, ShaderRead) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            shader_stages,
        ),
        (Undefined, DepthAttachment) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        (Undefined, ColorAttachment) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (ColorAttachment, ShaderRead) => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            shader_stages,
        ),
        (ShaderRead, ColorAttachment) => (
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            shader_stages,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (DepthAttachment, ShaderRead) => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            shader_stages,
        ),
        (Undefined, General) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        (General, ShaderRead) => (
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            shader_stages,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats_use_depth_aspect() {
        assert_eq!(texture_format(TextureFormat::Depth32Float), vk::Format::D32_SFLOAT);
        assert_eq!(aspect_for(TextureFormat::Depth32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect_for(TextureFormat::Rgba16Float), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_usage_flags_translate() {
        let flags = buffer_usage(BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST);
        assert_eq!(flags, vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST);
        let flags = image_usage(ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED);
        assert!(flags.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert_eq!(
            stage_flags(StageMask::VERTEX | StageMask::FRAGMENT),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_known_transitions_are_narrow() {
        let (src, dst, src_stage, dst_stage) = transition_masks(ImageLayout::Undefined, ImageLayout::TransferDst);
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (_, dst, _, _) = transition_masks(ImageLayout::ColorAttachment, ImageLayout::ShaderRead);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_unknown_transition_uses_full_barrier() {
        let (_, _, src_stage, dst_stage) = transition_masks(ImageLayout::ShaderRead, ImageLayout::General);
        assert_eq!(src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }

    #[test]
    fn test_device_lost_is_lost() {
        assert!(matches!(device_error(vk::Result::ERROR_DEVICE_LOST), DeviceError::Lost(_)));
        assert!(matches!(device_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), DeviceError::Allocation(_)));
    }
}
