//! [`GpuDevice`] on top of a Vulkan 1.3 logical device.
//!
//! Engine handles carry the raw Vulkan handle. Objects that own memory or
//! companion objects (buffers, images, binding layouts) are also tracked in
//! tables so they can be found again from the raw value.

use std::collections::HashMap;
use std::path::PathBuf;

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::context::VulkanContext;
use super::memory::{Buffer, Image, MemoryManager};
use super::{
    aspect_for, bind_point, buffer_usage, compare_op, cull_mode, descriptor_type, device_error, front_face, glslc,
    image_layout, image_usage, stage_flags, texture_format, topology, transition_masks, vertex_format,
};
use crate::config::BackendConfig;
use crate::device::{
    BindPoint, BindingLayoutHandle, BufferHandle, BufferUsage, CommandBufferHandle, CommandPoolHandle,
    ComputePipelineDesc, DescriptorResource, DescriptorSetHandle, DescriptorWrite, DeviceError, DeviceLimits,
    DeviceResult, FenceHandle, GpuDevice, GraphicsPipelineDesc, ImageDesc, ImageHandle, ImageLayout, LayoutBinding,
    PipelineHandle, RenderingInfo, SamplerFilter, SamplerHandle,
};
use crate::shader::ShaderStage;

/// Descriptor set layout, the pipeline layout built from it, and every pool
/// sets were allocated from.
struct BindingLayout {
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    pools: Vec<vk::DescriptorPool>,
}

pub struct VulkanDevice {
    // Field order matters: tables and the allocator go before the context
    // that owns the device.
    buffers: RwLock<HashMap<u64, Buffer>>,
    images: RwLock<HashMap<u64, Image>>,
    layouts: RwLock<HashMap<u64, BindingLayout>>,
    memory: MemoryManager,
    glslc: Option<PathBuf>,
    context: VulkanContext,
}

impl VulkanDevice {
    pub fn new(config: &BackendConfig) -> DeviceResult<Self> {
        let context = unsafe { VulkanContext::new(config.validation)? };
        let memory = MemoryManager::new(&context)?;

        let glslc = glslc::find_glslc(config.glslc.as_deref());
        match &glslc {
            Some(path) => log::info!("Vulkan: compiling shaders with {}", path.display()),
            None => log::warn!("Vulkan: glslc not found, programs will fail to link"),
        }

        Ok(Self {
            buffers: RwLock::new(HashMap::new()),
            images: RwLock::new(HashMap::new()),
            layouts: RwLock::new(HashMap::new()),
            memory,
            glslc,
            context,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    fn device(&self) -> &ash::Device {
        &self.context.device
    }

    fn image_view(&self, image: ImageHandle) -> Option<vk::ImageView> {
        self.images.read().get(&image.0).map(|i| i.view)
    }

    fn pipeline_layout(&self, layout: BindingLayoutHandle) -> Option<vk::PipelineLayout> {
        self.layouts.read().get(&layout.0).map(|l| l.pipeline_layout)
    }

    unsafe fn shader_module(&self, code: &[u32]) -> DeviceResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        self.device()
            .create_shader_module(&info, None)
            .map_err(|e| DeviceError::Pipeline(format!("failed to create shader module: {:?}", e)))
    }
}

fn cmd(handle: CommandBufferHandle) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(handle.0)
}

impl GpuDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            name: self.context.device_name(),
            min_uniform_offset_alignment: self.context.properties.limits.min_uniform_buffer_offset_alignment,
            unified_memory: self.context.unified_memory(),
        }
    }

    fn compile_glsl(&self, stage: ShaderStage, name: &str, source: &str) -> DeviceResult<Vec<u32>> {
        let compiler = self
            .glslc
            .as_deref()
            .ok_or_else(|| DeviceError::Compile(format!("{}: glslc not available", name)))?;
        glslc::compile(compiler, stage, name, source)
    }

    // ---- Pipelines and layouts ----

    fn create_binding_layout(&self, bindings: &[LayoutBinding]) -> DeviceResult<BindingLayoutHandle> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(descriptor_type(b.kind))
                    .descriptor_count(1)
                    .stage_flags(stage_flags(b.stages))
            })
            .collect();

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for b in bindings {
            let ty = descriptor_type(b.kind);
            match pool_sizes.iter_mut().find(|s| s.ty == ty) {
                Some(size) => size.descriptor_count += 1,
                None => pool_sizes.push(vk::DescriptorPoolSize { ty, descriptor_count: 1 }),
            }
        }

        unsafe {
            let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
            let set_layout = self
                .device()
                .create_descriptor_set_layout(&info, None)
                .map_err(|e| DeviceError::Pipeline(format!("failed to create descriptor set layout: {:?}", e)))?;

            let set_layouts = [set_layout];
            let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
            let pipeline_layout = match self.device().create_pipeline_layout(&info, None) {
                Ok(layout) => layout,
                Err(e) => {
                    self.device().destroy_descriptor_set_layout(set_layout, None);
                    return Err(DeviceError::Pipeline(format!("failed to create pipeline layout: {:?}", e)));
                }
            };

            self.layouts.write().insert(
                set_layout.as_raw(),
                BindingLayout {
                    set_layout,
                    pipeline_layout,
                    pool_sizes,
                    pools: Vec::new(),
                },
            );
            Ok(BindingLayoutHandle(set_layout.as_raw()))
        }
    }

    fn destroy_binding_layout(&self, layout: BindingLayoutHandle) {
        let Some(entry) = self.layouts.write().remove(&layout.0) else {
            return;
        };
        unsafe {
            for pool in entry.pools {
                self.device().destroy_descriptor_pool(pool, None);
            }
            self.device().destroy_pipeline_layout(entry.pipeline_layout, None);
            self.device().destroy_descriptor_set_layout(entry.set_layout, None);
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<PipelineHandle> {
        let layout = self
            .pipeline_layout(desc.layout)
            .ok_or_else(|| DeviceError::Pipeline(format!("{}: unknown binding layout", desc.name)))?;

        unsafe {
            let vertex = self.shader_module(desc.vertex_code)?;
            let fragment = match self.shader_module(desc.fragment_code) {
                Ok(module) => module,
                Err(e) => {
                    self.device().destroy_shader_module(vertex, None);
                    return Err(e);
                }
            };

            let stages = [
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::VERTEX)
                    .module(vertex)
                    .name(c"main"),
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(fragment)
                    .name(c"main"),
            ];

            let bindings: Vec<vk::VertexInputBindingDescription> = desc
                .vertex_bindings
                .iter()
                .map(|b| vk::VertexInputBindingDescription {
                    binding: b.binding,
                    stride: b.stride,
                    input_rate: if b.per_instance {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    },
                })
                .collect();
            let attributes: Vec<vk::VertexInputAttributeDescription> = desc
                .vertex_attributes
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: a.binding,
                    format: vertex_format(a.format),
                    offset: a.offset,
                })
                .collect();
            let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes);

            let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(topology(desc.topology))
                .primitive_restart_enable(false);

            let viewport_state = vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1);

            let raster = desc.raster;
            let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(cull_mode(raster.cull_mode))
                .front_face(front_face(raster.front_face))
                .line_width(1.0);

            let multisample =
                vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);

            let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(raster.depth_test && desc.depth_format.is_some())
                .depth_write_enable(raster.depth_write && desc.depth_format.is_some())
                .depth_compare_op(compare_op(raster.depth_function));

            let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 1]> = desc
                .color_format
                .map(|_| {
                    vk::PipelineColorBlendAttachmentState::default()
                        .blend_enable(raster.blend)
                        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                        .color_blend_op(vk::BlendOp::ADD)
                        .src_alpha_blend_factor(vk::BlendFactor::ONE)
                        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                        .alpha_blend_op(vk::BlendOp::ADD)
                        .color_write_mask(vk::ColorComponentFlags::RGBA)
                })
                .into_iter()
                .collect();
            let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

            let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
            let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

            let color_formats: SmallVec<[vk::Format; 1]> =
                desc.color_format.map(texture_format).into_iter().collect();
            let mut rendering = vk::PipelineRenderingCreateInfo::default()
                .color_attachment_formats(&color_formats)
                .depth_attachment_format(desc.depth_format.map(texture_format).unwrap_or(vk::Format::UNDEFINED));

            let create_info = vk::GraphicsPipelineCreateInfo::default()
                .stages(&stages)
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterization)
                .multisample_state(&multisample)
                .depth_stencil_state(&depth_stencil)
                .color_blend_state(&color_blend)
                .dynamic_state(&dynamic_state)
                .layout(layout)
                .push_next(&mut rendering);

            let result = self
                .device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None);

            self.device().destroy_shader_module(vertex, None);
            self.device().destroy_shader_module(fragment, None);

            let pipeline = result
                .map_err(|(_, e)| DeviceError::Pipeline(format!("{}: {:?}", desc.name, e)))?
                .into_iter()
                .next()
                .ok_or_else(|| DeviceError::Pipeline(format!("{}: no pipeline returned", desc.name)))?;
            log::debug!("Vulkan: built graphics pipeline for {}", desc.name);
            Ok(PipelineHandle(pipeline.as_raw()))
        }
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> DeviceResult<PipelineHandle> {
        let layout = self
            .pipeline_layout(desc.layout)
            .ok_or_else(|| DeviceError::Pipeline(format!("{}: unknown binding layout", desc.name)))?;

        unsafe {
            let module = self.shader_module(desc.code)?;
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(c"main");
            let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

            let result = self
                .device()
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None);
            self.device().destroy_shader_module(module, None);

            let pipeline = result
                .map_err(|(_, e)| DeviceError::Pipeline(format!("{}: {:?}", desc.name, e)))?
                .into_iter()
                .next()
                .ok_or_else(|| DeviceError::Pipeline(format!("{}: no pipeline returned", desc.name)))?;
            log::debug!("Vulkan: built compute pipeline for {}", desc.name);
            Ok(PipelineHandle(pipeline.as_raw()))
        }
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if pipeline.is_null() {
            return;
        }
        unsafe { self.device().destroy_pipeline(vk::Pipeline::from_raw(pipeline.0), None) }
    }

    fn allocate_descriptor_sets(
        &self,
        layout: BindingLayoutHandle,
        count: u32,
    ) -> DeviceResult<Vec<DescriptorSetHandle>> {
        let mut layouts = self.layouts.write();
        let entry = layouts
            .get_mut(&layout.0)
            .ok_or_else(|| DeviceError::Allocation("descriptor sets for unknown layout".to_string()))?;

        let pool_sizes: Vec<vk::DescriptorPoolSize> = entry
            .pool_sizes
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: s.ty,
                descriptor_count: s.descriptor_count * count,
            })
            .collect();

        unsafe {
            let info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(count)
                .pool_sizes(&pool_sizes);
            let pool = self
                .device()
                .create_descriptor_pool(&info, None)
                .map_err(device_error)?;

            let set_layouts = vec![entry.set_layout; count as usize];
            let info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&set_layouts);
            let sets = match self.device().allocate_descriptor_sets(&info) {
                Ok(sets) => sets,
                Err(e) => {
                    self.device().destroy_descriptor_pool(pool, None);
                    return Err(device_error(e));
                }
            };
            entry.pools.push(pool);

            Ok(sets.into_iter().map(|s| DescriptorSetHandle(s.as_raw())).collect())
        }
    }

    fn write_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer(usize, vk::DescriptorType),
            Image(usize, vk::DescriptorType),
        }

        let images = self.images.read();
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut image_infos = Vec::with_capacity(writes.len());
        let mut planned = Vec::with_capacity(writes.len());

        for write in writes {
            let info = match write.resource {
                DescriptorResource::UniformBuffer { buffer, range } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.0),
                        offset: 0,
                        range,
                    });
                    Info::Buffer(buffer_infos.len() - 1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                }
                DescriptorResource::StorageBuffer { buffer, range } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.0),
                        offset: 0,
                        range,
                    });
                    Info::Buffer(buffer_infos.len() - 1, vk::DescriptorType::STORAGE_BUFFER)
                }
                DescriptorResource::ImageSampler { image, sampler } => {
                    let Some(view) = images.get(&image.0).map(|i| i.view) else {
                        log::warn!("Vulkan: descriptor write references unknown image");
                        continue;
                    };
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::from_raw(sampler.0),
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                    Info::Image(image_infos.len() - 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                }
                DescriptorResource::StorageImage { image } => {
                    let Some(view) = images.get(&image.0).map(|i| i.view) else {
                        log::warn!("Vulkan: descriptor write references unknown image");
                        continue;
                    };
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: vk::ImageLayout::GENERAL,
                    });
                    Info::Image(image_infos.len() - 1, vk::DescriptorType::STORAGE_IMAGE)
                }
            };
            planned.push((write.binding, info));
        }

        let target = vk::DescriptorSet::from_raw(set.0);
        let vk_writes: Vec<vk::WriteDescriptorSet> = planned
            .iter()
            .map(|(binding, info)| {
                let write = vk::WriteDescriptorSet::default().dst_set(target).dst_binding(*binding);
                match *info {
                    Info::Buffer(i, ty) => write
                        .descriptor_type(ty)
                        .buffer_info(std::slice::from_ref(&buffer_infos[i])),
                    Info::Image(i, ty) => write
                        .descriptor_type(ty)
                        .image_info(std::slice::from_ref(&image_infos[i])),
                }
            })
            .collect();

        unsafe { self.device().update_descriptor_sets(&vk_writes, &[]) }
    }

    // ---- Memory ----

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
        name: &str,
    ) -> DeviceResult<BufferHandle> {
        let buffer = unsafe { self.memory.create_buffer(size, buffer_usage(usage), location, name)? };
        let handle = BufferHandle(buffer.handle.as_raw());
        self.buffers.write().insert(handle.0, buffer);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut buffers = self.buffers.write();
        let entry = buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| DeviceError::Allocation("write to unknown buffer".to_string()))?;
        self.memory.write(entry, offset, data)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(entry) = self.buffers.write().remove(&buffer.0) {
            unsafe { self.memory.destroy_buffer(entry) }
        }
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> DeviceResult<ImageHandle> {
        let image = unsafe {
            self.memory.create_image(
                vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
                texture_format(desc.format),
                image_usage(desc.usage),
                aspect_for(desc.format),
                name,
            )?
        };
        let handle = ImageHandle(image.handle.as_raw());
        self.images.write().insert(handle.0, image);
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        if let Some(entry) = self.images.write().remove(&image.0) {
            unsafe { self.memory.destroy_image(entry) }
        }
    }

    fn create_sampler(&self, filter: SamplerFilter, repeat: bool) -> DeviceResult<SamplerHandle> {
        let address = if repeat {
            vk::SamplerAddressMode::REPEAT
        } else {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        };
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(super::filter(filter))
            .min_filter(super::filter(filter))
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device().create_sampler(&info, None) }.map_err(device_error)?;
        Ok(SamplerHandle(sampler.as_raw()))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        if sampler.is_null() {
            return;
        }
        unsafe { self.device().destroy_sampler(vk::Sampler::from_raw(sampler.0), None) }
    }

    // ---- Command buffers ----

    fn create_command_pool(&self) -> DeviceResult<CommandPoolHandle> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.context.queue_family);
        let pool = unsafe { self.device().create_command_pool(&info, None) }.map_err(device_error)?;
        Ok(CommandPoolHandle(pool.as_raw()))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        if pool.is_null() {
            return;
        }
        unsafe { self.device().destroy_command_pool(vk::CommandPool::from_raw(pool.0), None) }
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> DeviceResult<CommandBufferHandle> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool.0))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device().allocate_command_buffers(&info) }.map_err(device_error)?;
        buffers
            .first()
            .map(|b| CommandBufferHandle(b.as_raw()))
            .ok_or_else(|| DeviceError::Allocation("no command buffer returned".to_string()))
    }

    fn begin_commands(&self, handle: CommandBufferHandle) -> DeviceResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(cmd(handle), &info) }.map_err(device_error)
    }

    fn end_commands(&self, handle: CommandBufferHandle) -> DeviceResult<()> {
        unsafe { self.device().end_command_buffer(cmd(handle)) }.map_err(device_error)
    }

    fn cmd_begin_rendering(&self, handle: CommandBufferHandle, info: &RenderingInfo) {
        let extent = vk::Extent2D {
            width: info.width,
            height: info.height,
        };

        let color: SmallVec<[vk::RenderingAttachmentInfo; 1]> = info
            .color
            .and_then(|image| self.image_view(image))
            .map(|view| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
            })
            .into_iter()
            .collect();
        let depth = info.depth.and_then(|image| self.image_view(image)).map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        let mut rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: info.width as f32,
            height: info.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        unsafe {
            self.device().cmd_begin_rendering(cmd(handle), &rendering);
            self.device().cmd_set_viewport(cmd(handle), 0, &[viewport]);
            self.device().cmd_set_scissor(cmd(handle), 0, &[scissor]);
        }
    }

    fn cmd_end_rendering(&self, handle: CommandBufferHandle) {
        unsafe { self.device().cmd_end_rendering(cmd(handle)) }
    }

    fn cmd_clear(&self, handle: CommandBufferHandle, color: Option<[f32; 4]>, depth: Option<f32>, width: u32, height: u32) {
        let mut attachments: SmallVec<[vk::ClearAttachment; 2]> = SmallVec::new();
        if let Some(float32) = color {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue { float32 },
                },
            });
        }
        if let Some(depth) = depth {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                },
            });
        }
        if attachments.is_empty() {
            return;
        }
        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D { width, height },
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe { self.device().cmd_clear_attachments(cmd(handle), &attachments, &[rect]) }
    }

    fn cmd_bind_pipeline(&self, handle: CommandBufferHandle, point: BindPoint, pipeline: PipelineHandle) {
        unsafe {
            self.device()
                .cmd_bind_pipeline(cmd(handle), bind_point(point), vk::Pipeline::from_raw(pipeline.0))
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        handle: CommandBufferHandle,
        point: BindPoint,
        layout: BindingLayoutHandle,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    ) {
        let Some(pipeline_layout) = self.pipeline_layout(layout) else {
            log::error!("Vulkan: bind of descriptor set with unknown layout");
            return;
        };
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                cmd(handle),
                bind_point(point),
                pipeline_layout,
                0,
                &[vk::DescriptorSet::from_raw(set.0)],
                dynamic_offsets,
            )
        }
    }

    fn cmd_bind_vertex_buffers(&self, handle: CommandBufferHandle, first_binding: u32, buffers: &[BufferHandle]) {
        if buffers.is_empty() {
            return;
        }
        let vk_buffers: SmallVec<[vk::Buffer; 8]> = buffers.iter().map(|b| vk::Buffer::from_raw(b.0)).collect();
        let offsets: SmallVec<[vk::DeviceSize; 8]> = buffers.iter().map(|_| 0).collect();
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(cmd(handle), first_binding, &vk_buffers, &offsets)
        }
    }

    fn cmd_bind_index_buffer(&self, handle: CommandBufferHandle, buffer: BufferHandle) {
        unsafe {
            self.device().cmd_bind_index_buffer(
                cmd(handle),
                vk::Buffer::from_raw(buffer.0),
                0,
                vk::IndexType::UINT32,
            )
        }
    }

    fn cmd_draw(&self, handle: CommandBufferHandle, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        unsafe { self.device().cmd_draw(cmd(handle), vertex_count, instance_count, first_vertex, 0) }
    }

    fn cmd_draw_indexed(&self, handle: CommandBufferHandle, index_count: u32, instance_count: u32, first_index: u32) {
        unsafe {
            self.device()
                .cmd_draw_indexed(cmd(handle), index_count, instance_count, first_index, 0, 0)
        }
    }

    fn cmd_dispatch(&self, handle: CommandBufferHandle, x: u32, y: u32, z: u32) {
        unsafe { self.device().cmd_dispatch(cmd(handle), x, y, z) }
    }

    fn cmd_copy_buffer(&self, handle: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device().cmd_copy_buffer(
                cmd(handle),
                vk::Buffer::from_raw(src.0),
                vk::Buffer::from_raw(dst.0),
                &[region],
            )
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        handle: CommandBufferHandle,
        src: BufferHandle,
        image: ImageHandle,
        width: u32,
        height: u32,
    ) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D { width, height, depth: 1 },
        };
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                cmd(handle),
                vk::Buffer::from_raw(src.0),
                vk::Image::from_raw(image.0),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        }
    }

    fn cmd_image_barrier(&self, handle: CommandBufferHandle, image: ImageHandle, old: ImageLayout, new: ImageLayout) {
        let aspect_mask = self
            .images
            .read()
            .get(&image.0)
            .map(|i| i.aspect)
            .unwrap_or(vk::ImageAspectFlags::COLOR);
        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old, new);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(image_layout(old))
            .new_layout(image_layout(new))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk::Image::from_raw(image.0))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd(handle),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        }
    }

    fn cmd_memory_barrier(&self, handle: CommandBufferHandle) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd(handle),
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        }
    }

    // ---- Synchronization ----

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device().create_fence(&info, None) }.map_err(device_error)?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if fence.is_null() {
            return;
        }
        unsafe { self.device().destroy_fence(vk::Fence::from_raw(fence.0), None) }
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> DeviceResult<bool> {
        match unsafe {
            self.device()
                .wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, timeout_ns)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(device_error(e)),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()> {
        unsafe { self.device().reset_fences(&[vk::Fence::from_raw(fence.0)]) }.map_err(device_error)
    }

    fn submit(&self, buffers: &[CommandBufferHandle], fence: FenceHandle) -> DeviceResult<()> {
        let command_buffers: SmallVec<[vk::CommandBuffer; 4]> = buffers.iter().map(|&b| cmd(b)).collect();
        let info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let queue = self.context.queue.lock();
        unsafe {
            self.device()
                .queue_submit(*queue, &[info], vk::Fence::from_raw(fence.0))
        }
        .map_err(device_error)
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        self.context.wait_idle()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Vulkan: wait idle before release: {}", e);
        }

        let buffers: Vec<Buffer> = self.buffers.get_mut().drain().map(|(_, b)| b).collect();
        let images: Vec<Image> = self.images.get_mut().drain().map(|(_, i)| i).collect();
        if !buffers.is_empty() || !images.is_empty() {
            log::warn!(
                "Vulkan: releasing {} buffers and {} images still alive at shutdown",
                buffers.len(),
                images.len()
            );
        }
        unsafe {
            for buffer in buffers {
                self.memory.destroy_buffer(buffer);
            }
            for image in images {
                self.memory.destroy_image(image);
            }
        }

        let layouts: Vec<BindingLayoutHandle> = self.layouts.get_mut().keys().map(|&k| BindingLayoutHandle(k)).collect();
        for layout in layouts {
            self.destroy_binding_layout(layout);
        }
    }
}
