//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use parking_lot::Mutex;

use super::context::VulkanContext;
use crate::device::{DeviceError, DeviceResult};

/// Buffer with its bound allocation.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

/// Image with its default view.
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent2D,
}

/// Memory manager wrapping gpu-allocator. Must be dropped before the
/// device it was created from.
pub struct MemoryManager {
    allocator: Mutex<Allocator>,
    device: ash::Device,
}

/// Allocation logging: leaks always, the memory report only in debug builds.
fn debug_settings() -> AllocatorDebugSettings {
    let mut settings = AllocatorDebugSettings::default();
    settings.log_memory_information = cfg!(debug_assertions);
    settings.log_leaks_on_shutdown = true;
    settings
}

impl MemoryManager {
    pub fn new(ctx: &VulkanContext) -> DeviceResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings: debug_settings(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| DeviceError::Allocation(format!("failed to create allocator: {:?}", e)))?;

        Ok(Self {
            allocator: Mutex::new(allocator),
            device: ctx.device.clone(),
        })
    }

    /// # Safety
    /// The device must be valid for the lifetime of the returned buffer.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> DeviceResult<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| DeviceError::Allocation(format!("failed to create buffer {}: {:?}", name, e)))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(DeviceError::Allocation(format!("failed to allocate memory for {}: {:?}", name, e)));
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.free(allocation);
            self.device.destroy_buffer(handle, None);
            return Err(DeviceError::Allocation(format!("failed to bind memory for {}: {:?}", name, e)));
        }

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
        })
    }

    /// Create a 2D image in device-local memory together with its view.
    ///
    /// # Safety
    /// The device must be valid for the lifetime of the returned image.
    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        name: &str,
    ) -> DeviceResult<Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let handle = self
            .device
            .create_image(&image_info, None)
            .map_err(|e| DeviceError::Allocation(format!("failed to create image {}: {:?}", name, e)))?;

        let requirements = self.device.get_image_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(DeviceError::Allocation(format!("failed to allocate memory for {}: {:?}", name, e)));
            }
        };

        if let Err(e) = self.device.bind_image_memory(handle, allocation.memory(), allocation.offset()) {
            self.free(allocation);
            self.device.destroy_image(handle, None);
            return Err(DeviceError::Allocation(format!("failed to bind memory for {}: {:?}", name, e)));
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match self.device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                self.free(allocation);
                self.device.destroy_image(handle, None);
                return Err(DeviceError::Allocation(format!("failed to create view for {}: {:?}", name, e)));
            }
        };

        Ok(Image {
            handle,
            view,
            allocation: Some(allocation),
            format,
            aspect,
            extent,
        })
    }

    /// Copy `data` into a host-visible buffer at `offset`. CpuToGpu memory
    /// is host-coherent, so no explicit flush is needed.
    pub fn write(&self, buffer: &mut Buffer, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= buffer.size)
            .ok_or_else(|| {
                DeviceError::Allocation(format!(
                    "write of {} bytes at {} overruns a {} byte buffer",
                    data.len(),
                    offset,
                    buffer.size
                ))
            })?;
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| DeviceError::Allocation("buffer is not host-visible".to_string()))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// # Safety
    /// The buffer must no longer be referenced by pending GPU work.
    pub unsafe fn destroy_buffer(&self, mut buffer: Buffer) {
        if let Some(allocation) = buffer.allocation.take() {
            self.free(allocation);
        }
        self.device.destroy_buffer(buffer.handle, None);
    }

    /// # Safety
    /// The image must no longer be referenced by pending GPU work.
    pub unsafe fn destroy_image(&self, mut image: Image) {
        self.device.destroy_image_view(image.view, None);
        if let Some(allocation) = image.allocation.take() {
            self.free(allocation);
        }
        self.device.destroy_image(image.handle, None);
    }

    fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Vulkan: failed to free allocation: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_settings_report_leaks() {
        let settings = debug_settings();
        assert!(settings.log_leaks_on_shutdown);
        assert_eq!(settings.log_memory_information, cfg!(debug_assertions));
        assert!(!settings.log_allocations);
    }
}
