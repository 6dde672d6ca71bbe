//! In-memory device.
//!
//! Implements the whole device seam without a GPU: buffers hold real bytes,
//! command buffers keep a log of what was recorded, copies execute at submit
//! time and fences signal immediately unless the device is told to hang.
//! Counters make the engine's batching decisions observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::*;

/// A command as recorded into a headless command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRendering(RenderingInfo),
    EndRendering,
    Clear { color: Option<[f32; 4]>, depth: Option<f32> },
    BindPipeline(BindPoint, PipelineHandle),
    BindDescriptorSet { set: DescriptorSetHandle, dynamic_offsets: Vec<u32> },
    BindVertexBuffers { first_binding: u32, buffers: Vec<BufferHandle> },
    BindIndexBuffer(BufferHandle),
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32 },
    Dispatch(u32, u32, u32),
    CopyBuffer { src: BufferHandle, dst: BufferHandle, size: u64 },
    CopyBufferToImage { src: BufferHandle, image: ImageHandle },
    ImageBarrier { image: ImageHandle, old: ImageLayout, new: ImageLayout },
    MemoryBarrier,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    recording: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct BufferState {
    data: Vec<u8>,
    location: MemoryLocation,
}

/// Call counters, readable at any time.
#[derive(Debug, Default)]
pub struct HeadlessCounters {
    pub pipeline_binds: AtomicU64,
    pub pipelines_created: AtomicU64,
    pub draws: AtomicU64,
    pub dispatches: AtomicU64,
    pub submissions: AtomicU64,
    pub fence_waits: AtomicU64,
    pub descriptor_writes: AtomicU64,
    pub buffers_created: AtomicU64,
    pub buffers_destroyed: AtomicU64,
    pub compiles: AtomicU64,
}

/// GPU-less implementation of [`GpuDevice`].
pub struct HeadlessDevice {
    next_handle: AtomicU64,
    limits: DeviceLimits,
    buffers: Mutex<HashMap<u64, BufferState>>,
    images: Mutex<HashMap<u64, ImageDesc>>,
    command_buffers: Mutex<HashMap<u64, CommandBufferState>>,
    fences: Mutex<HashMap<u64, bool>>,
    pipelines: Mutex<HashMap<u64, String>>,
    submitted: Mutex<Vec<Vec<CommandBufferHandle>>>,
    compiled: Mutex<Vec<(ShaderStage, String, String)>>,
    hang: AtomicBool,
    fail_allocations: AtomicBool,
    compile_failure_marker: Mutex<Option<String>>,
    pub counters: HeadlessCounters,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            limits: DeviceLimits {
                name: "headless".to_string(),
                min_uniform_offset_alignment: 256,
                unified_memory: false,
            },
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            command_buffers: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            compiled: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
            fail_allocations: AtomicBool::new(false),
            compile_failure_marker: Mutex::new(None),
            counters: HeadlessCounters::default(),
        }
    }

    /// Report device-local memory as host-visible.
    pub fn with_unified_memory(mut self) -> Self {
        self.limits.unified_memory = true;
        self
    }

    /// Stop signaling fences on submit (simulates a stuck queue).
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Make every subsequent buffer and image allocation fail.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Reject any shader whose source contains `marker`.
    pub fn fail_compiles_containing(&self, marker: &str) {
        *self.compile_failure_marker.lock() = Some(marker.to_string());
    }

    pub fn count(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    pub fn pipeline_binds(&self) -> u64 {
        Self::count(&self.counters.pipeline_binds)
    }

    pub fn submissions(&self) -> u64 {
        Self::count(&self.counters.submissions)
    }

    pub fn draws(&self) -> u64 {
        Self::count(&self.counters.draws)
    }

    /// Bytes currently stored in a buffer.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.buffers.lock().get(&buffer.0).map(|b| b.data.clone())
    }

    pub fn buffer_location(&self, buffer: BufferHandle) -> Option<MemoryLocation> {
        self.buffers.lock().get(&buffer.0).map(|b| b.location)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn live_images(&self) -> usize {
        self.images.lock().len()
    }

    /// Commands recorded into a command buffer since its last begin.
    pub fn command_log(&self, cmd: CommandBufferHandle) -> Vec<RecordedCommand> {
        self.command_buffers
            .lock()
            .get(&cmd.0)
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    pub fn is_recording(&self, cmd: CommandBufferHandle) -> bool {
        self.command_buffers
            .lock()
            .get(&cmd.0)
            .is_some_and(|s| s.recording)
    }

    /// Every submission in order, as lists of command buffers.
    pub fn submitted(&self) -> Vec<Vec<CommandBufferHandle>> {
        self.submitted.lock().clone()
    }

    /// Sources handed to the compiler, in order.
    pub fn compiled_sources(&self) -> Vec<(ShaderStage, String, String)> {
        self.compiled.lock().clone()
    }

    pub fn fence_signaled(&self, fence: FenceHandle) -> bool {
        self.fences.lock().get(&fence.0).copied().unwrap_or(false)
    }

    /// Signal every outstanding fence.
    pub fn complete_all(&self) {
        for signaled in self.fences.lock().values_mut() {
            *signaled = true;
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, cmd: CommandBufferHandle, command: RecordedCommand) {
        let mut buffers = self.command_buffers.lock();
        match buffers.get_mut(&cmd.0) {
            Some(state) if state.recording => state.commands.push(command),
            _ => log::error!("headless: command recorded outside begin/end on {:?}", cmd),
        }
    }

    fn check_allocation(&self, what: &str) -> DeviceResult<()> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(DeviceError::Allocation(format!("{} (injected failure)", what)));
        }
        Ok(())
    }
}

impl GpuDevice for HeadlessDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn compile_glsl(&self, stage: ShaderStage, name: &str, source: &str) -> DeviceResult<Vec<u32>> {
        self.counters.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.compile_failure_marker.lock().as_deref() {
            if source.contains(marker) {
                return Err(DeviceError::Compile(format!("{}: rejected", name)));
            }
        }
        self.compiled
            .lock()
            .push((stage, name.to_string(), source.to_string()));

        // SPIR-V magic followed by the source length, enough to be distinct.
        Ok(vec![0x0723_0203, 0x0001_0600, source.len() as u32])
    }

    fn create_binding_layout(&self, _bindings: &[LayoutBinding]) -> DeviceResult<BindingLayoutHandle> {
        Ok(BindingLayoutHandle(self.handle()))
    }

    fn destroy_binding_layout(&self, _layout: BindingLayoutHandle) {}

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<PipelineHandle> {
        if desc.vertex_code.is_empty() || desc.fragment_code.is_empty() {
            return Err(DeviceError::Pipeline(format!("{}: missing stage code", desc.name)));
        }
        let handle = self.handle();
        self.pipelines.lock().insert(handle, desc.name.to_string());
        self.counters.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(PipelineHandle(handle))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> DeviceResult<PipelineHandle> {
        if desc.code.is_empty() {
            return Err(DeviceError::Pipeline(format!("{}: missing stage code", desc.name)));
        }
        let handle = self.handle();
        self.pipelines.lock().insert(handle, desc.name.to_string());
        self.counters.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(PipelineHandle(handle))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.pipelines.lock().remove(&pipeline.0);
    }

    fn allocate_descriptor_sets(
        &self,
        _layout: BindingLayoutHandle,
        count: u32,
    ) -> DeviceResult<Vec<DescriptorSetHandle>> {
        Ok((0..count).map(|_| DescriptorSetHandle(self.handle())).collect())
    }

    fn write_descriptor_set(&self, _set: DescriptorSetHandle, _writes: &[DescriptorWrite]) {
        self.counters.descriptor_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: BufferUsage,
        location: MemoryLocation,
        name: &str,
    ) -> DeviceResult<BufferHandle> {
        self.check_allocation(name)?;
        let handle = self.handle();
        self.buffers.lock().insert(
            handle,
            BufferState {
                data: vec![0; size as usize],
                location,
            },
        );
        self.counters.buffers_created.fetch_add(1, Ordering::SeqCst);
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut buffers = self.buffers.lock();
        let state = buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| DeviceError::Lost(format!("write to unknown buffer {:?}", buffer)))?;
        if state.location == MemoryLocation::GpuOnly && !self.limits.unified_memory {
            return Err(DeviceError::Allocation(format!("{:?} is not host-visible", buffer)));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > state.data.len() {
            return Err(DeviceError::Allocation(format!(
                "write of {} bytes at {} overflows {:?}",
                data.len(),
                offset,
                buffer
            )));
        }
        state.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if self.buffers.lock().remove(&buffer.0).is_some() {
            self.counters.buffers_destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> DeviceResult<ImageHandle> {
        self.check_allocation(name)?;
        let handle = self.handle();
        self.images.lock().insert(handle, *desc);
        Ok(ImageHandle(handle))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.images.lock().remove(&image.0);
    }

    fn create_sampler(&self, _filter: SamplerFilter, _repeat: bool) -> DeviceResult<SamplerHandle> {
        Ok(SamplerHandle(self.handle()))
    }

    fn destroy_sampler(&self, _sampler: SamplerHandle) {}

    fn create_command_pool(&self) -> DeviceResult<CommandPoolHandle> {
        Ok(CommandPoolHandle(self.handle()))
    }

    fn destroy_command_pool(&self, _pool: CommandPoolHandle) {}

    fn allocate_command_buffer(&self, _pool: CommandPoolHandle) -> DeviceResult<CommandBufferHandle> {
        let handle = self.handle();
        self.command_buffers
            .lock()
            .insert(handle, CommandBufferState::default());
        Ok(CommandBufferHandle(handle))
    }

    fn begin_commands(&self, cmd: CommandBufferHandle) -> DeviceResult<()> {
        let mut buffers = self.command_buffers.lock();
        let state = buffers
            .get_mut(&cmd.0)
            .ok_or_else(|| DeviceError::Lost(format!("unknown command buffer {:?}", cmd)))?;
        if state.recording {
            return Err(DeviceError::Lost(format!("{:?} is already recording", cmd)));
        }
        state.recording = true;
        state.commands.clear();
        Ok(())
    }

    fn end_commands(&self, cmd: CommandBufferHandle) -> DeviceResult<()> {
        let mut buffers = self.command_buffers.lock();
        let state = buffers
            .get_mut(&cmd.0)
            .ok_or_else(|| DeviceError::Lost(format!("unknown command buffer {:?}", cmd)))?;
        if !state.recording {
            return Err(DeviceError::Lost(format!("{:?} is not recording", cmd)));
        }
        state.recording = false;
        Ok(())
    }

    fn cmd_begin_rendering(&self, cmd: CommandBufferHandle, info: &RenderingInfo) {
        self.record(cmd, RecordedCommand::BeginRendering(*info));
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferHandle) {
        self.record(cmd, RecordedCommand::EndRendering);
    }

    fn cmd_clear(&self, cmd: CommandBufferHandle, color: Option<[f32; 4]>, depth: Option<f32>, _width: u32, _height: u32) {
        self.record(cmd, RecordedCommand::Clear { color, depth });
    }

    fn cmd_bind_pipeline(&self, cmd: CommandBufferHandle, bind_point: BindPoint, pipeline: PipelineHandle) {
        self.counters.pipeline_binds.fetch_add(1, Ordering::SeqCst);
        self.record(cmd, RecordedCommand::BindPipeline(bind_point, pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        _bind_point: BindPoint,
        _layout: BindingLayoutHandle,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            cmd,
            RecordedCommand::BindDescriptorSet {
                set,
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffers(&self, cmd: CommandBufferHandle, first_binding: u32, buffers: &[BufferHandle]) {
        self.record(
            cmd,
            RecordedCommand::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
            },
        );
    }

    fn cmd_bind_index_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle) {
        self.record(cmd, RecordedCommand::BindIndexBuffer(buffer));
    }

    fn cmd_draw(&self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        self.counters.draws.fetch_add(1, Ordering::SeqCst);
        self.record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
            },
        );
    }

    fn cmd_draw_indexed(&self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32, first_index: u32) {
        self.counters.draws.fetch_add(1, Ordering::SeqCst);
        self.record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
            },
        );
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32) {
        self.counters.dispatches.fetch_add(1, Ordering::SeqCst);
        self.record(cmd, RecordedCommand::Dispatch(x, y, z));
    }

    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64) {
        self.record(cmd, RecordedCommand::CopyBuffer { src, dst, size });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        image: ImageHandle,
        _width: u32,
        _height: u32,
    ) {
        self.record(cmd, RecordedCommand::CopyBufferToImage { src, image });
    }

    fn cmd_image_barrier(&self, cmd: CommandBufferHandle, image: ImageHandle, old: ImageLayout, new: ImageLayout) {
        self.record(cmd, RecordedCommand::ImageBarrier { image, old, new });
    }

    fn cmd_memory_barrier(&self, cmd: CommandBufferHandle) {
        self.record(cmd, RecordedCommand::MemoryBarrier);
    }

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle> {
        let handle = self.handle();
        self.fences.lock().insert(handle, signaled);
        Ok(FenceHandle(handle))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.fences.lock().remove(&fence.0);
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> DeviceResult<bool> {
        self.counters.fence_waits.fetch_add(1, Ordering::SeqCst);
        self.fences
            .lock()
            .get(&fence.0)
            .copied()
            .ok_or_else(|| DeviceError::Lost(format!("unknown fence {:?}", fence)))
    }

    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()> {
        match self.fences.lock().get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(DeviceError::Lost(format!("unknown fence {:?}", fence))),
        }
    }

    fn submit(&self, buffers: &[CommandBufferHandle], fence: FenceHandle) -> DeviceResult<()> {
        // Execute copies in submission order so uploads are observable.
        let copies: Vec<(BufferHandle, BufferHandle, u64)> = {
            let command_buffers = self.command_buffers.lock();
            let mut copies = Vec::new();
            for cmd in buffers {
                let state = command_buffers
                    .get(&cmd.0)
                    .ok_or_else(|| DeviceError::Lost(format!("unknown command buffer {:?}", cmd)))?;
                if state.recording {
                    return Err(DeviceError::Lost(format!("{:?} submitted while recording", cmd)));
                }
                for command in &state.commands {
                    if let RecordedCommand::CopyBuffer { src, dst, size } = command {
                        copies.push((*src, *dst, *size));
                    }
                }
            }
            copies
        };
        {
            let mut memory = self.buffers.lock();
            for (src, dst, size) in copies {
                let bytes = memory
                    .get(&src.0)
                    .map(|b| b.data[..size as usize].to_vec())
                    .ok_or_else(|| DeviceError::Lost(format!("copy from unknown buffer {:?}", src)))?;
                let target = memory
                    .get_mut(&dst.0)
                    .ok_or_else(|| DeviceError::Lost(format!("copy to unknown buffer {:?}", dst)))?;
                target.data[..size as usize].copy_from_slice(&bytes);
            }
        }

        if !fence.is_null() {
            let signaled = !self.hang.load(Ordering::SeqCst);
            self.fences.lock().insert(fence.0, signaled);
        }
        self.submitted.lock().push(buffers.to_vec());
        self.counters.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        if self.hang.load(Ordering::SeqCst) {
            return Err(DeviceError::Lost("queue never drained".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copies_execute_on_submit() {
        let device = HeadlessDevice::new();
        let src = device
            .create_buffer(8, BufferUsage::TRANSFER_SRC, MemoryLocation::CpuToGpu, "src")
            .unwrap();
        let dst = device
            .create_buffer(8, BufferUsage::TRANSFER_DST, MemoryLocation::GpuOnly, "dst")
            .unwrap();
        device.write_buffer(src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.begin_commands(cmd).unwrap();
        device.cmd_copy_buffer(cmd, src, dst, 8);
        device.end_commands(cmd).unwrap();

        assert_eq!(device.buffer_contents(dst).unwrap(), vec![0; 8]);
        device.submit(&[cmd], fence).unwrap();
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(device.fence_signaled(fence));
    }

    #[test]
    fn test_device_local_memory_is_not_mappable() {
        let device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(4, BufferUsage::VERTEX, MemoryLocation::GpuOnly, "vb")
            .unwrap();
        assert!(device.write_buffer(buffer, 0, &[0; 4]).is_err());

        let unified = HeadlessDevice::new().with_unified_memory();
        let buffer = unified
            .create_buffer(4, BufferUsage::VERTEX, MemoryLocation::GpuOnly, "vb")
            .unwrap();
        assert!(unified.write_buffer(buffer, 0, &[0; 4]).is_ok());
    }

    #[test]
    fn test_hung_device_leaves_fences_unsignaled() {
        let device = HeadlessDevice::new();
        device.set_hang(true);
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence(true).unwrap();
        device.begin_commands(cmd).unwrap();
        device.end_commands(cmd).unwrap();
        device.submit(&[cmd], fence).unwrap();
        assert!(!device.wait_fence(fence, 1_000).unwrap());
    }

    #[test]
    fn test_double_begin_is_rejected() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_commands(cmd).unwrap();
        assert!(device.begin_commands(cmd).is_err());
    }
}
