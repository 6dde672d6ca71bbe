//! Caller-facing backend.
//!
//! A [`Backend`] owns the device, the shader registry, program and resource
//! pools, the deferred-destruction queue and one [`RenderContext`] per worker
//! thread. Every recording call names the context it records on; callers on
//! different threads use different contexts and never block each other
//! except at submission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rayon::prelude::*;
use slotmap::SlotMap;

use crate::config::BackendConfig;
use crate::context::batch::DrawCall;
use crate::context::{RenderContext, RenderState, MAX_STORAGE_UNITS, MAX_TEXTURE_UNITS};
use crate::device::{
    BufferHandle, BufferUsage, CullMode, DepthFunction, DeviceLimits, FrontFace, GpuDevice, MemoryLocation,
};
use crate::error::{RenderError, RenderResult};
use crate::program::pipeline::OutputTarget;
use crate::program::uniforms::UniformData;
use crate::program::vertex_layout::MAX_VERTEX_SLOTS;
use crate::program::{LinkedProgram, Program, ProgramId, ProgramKind, UniformLocation};
use crate::resources::buffer::{BufferId, BufferPool};
use crate::resources::reclaim::{ReclaimQueue, Retired};
use crate::resources::texture::{RenderTargetId, TextureId, TexturePool};
use crate::shader::{ShaderId, ShaderRegistry, ShaderStage};
use crate::stats::{Counter, FrameStatistics, Statistics};

/// Size of the buffer substituted for unbound vertex and storage slots.
pub(crate) const EMPTY_BUFFER_SIZE: u64 = 256;

/// State every context reads while recording.
pub(crate) struct Shared {
    pub device: Arc<dyn GpuDevice>,
    pub config: BackendConfig,
    pub limits: DeviceLimits,
    pub stats: Statistics,
    pub shaders: ShaderRegistry,
    pub programs: RwLock<SlotMap<ProgramId, Arc<Program>>>,
    pub buffers: BufferPool,
    pub textures: TexturePool,
    pub reclaim: ReclaimQueue,
    /// Serializes queue submission across contexts.
    pub submit_lock: Mutex<()>,
    frame: AtomicU64,
    link_serial: AtomicU64,
    pub empty_buffer: BufferHandle,
    pub default_texture: TextureId,
    pub frame_target: RenderTargetId,
}

impl Shared {
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn program(&self, id: ProgramId) -> Option<Arc<Program>> {
        self.programs.read().get(id).cloned()
    }

    /// Queue a replaced link's device objects for destruction.
    fn retire_link(&self, linked: Arc<LinkedProgram>) {
        let frame = self.frame();
        self.reclaim
            .retire_all(frame, linked.pipelines.drain().into_iter().map(Retired::Pipeline));
        self.reclaim.retire(frame, Retired::BindingLayout(linked.layout));
    }
}

pub struct Backend {
    shared: Shared,
    contexts: Vec<Mutex<RenderContext>>,
    torn_down: AtomicBool,
}

impl Backend {
    /// Create the backend on `device`: contexts, the frame target, the
    /// default texture and the empty buffer.
    pub fn new(device: Arc<dyn GpuDevice>, config: BackendConfig) -> RenderResult<Self> {
        let config = config.validated();
        let limits = device.limits();
        log::info!(
            "Backend: {} with {} contexts, {} ring slots, {} frames in flight",
            limits.name,
            config.contexts,
            config.ring_slots,
            config.frames_in_flight
        );

        let textures = TexturePool::new(device.as_ref())?;
        let empty_buffer = device.create_buffer(
            EMPTY_BUFFER_SIZE,
            BufferUsage::VERTEX | BufferUsage::INDEX | BufferUsage::STORAGE,
            MemoryLocation::CpuToGpu,
            "lumen empty buffer",
        )?;
        device.write_buffer(empty_buffer, 0, &[0; EMPTY_BUFFER_SIZE as usize])?;
        let frame_target = textures.create_render_target(
            device.as_ref(),
            "lumen frame",
            config.frame_width,
            config.frame_height,
            true,
            true,
        )?;
        let default_texture = textures.create("lumen default");

        let contexts = (0..config.contexts)
            .map(|index| RenderContext::new(index, device.as_ref(), &config, &limits).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        let shared = Shared {
            buffers: BufferPool::new(config.frames_in_flight, config.gc_interval_frames, limits.unified_memory),
            device,
            config,
            limits,
            stats: Statistics::new(),
            shaders: ShaderRegistry::new(),
            programs: RwLock::new(SlotMap::with_key()),
            textures,
            reclaim: ReclaimQueue::new(),
            submit_lock: Mutex::new(()),
            frame: AtomicU64::new(0),
            link_serial: AtomicU64::new(0),
            empty_buffer,
            default_texture,
            frame_target,
        };

        {
            let mut guard = contexts[0].lock();
            let ctx = &mut *guard;
            shared.textures.upload(
                shared.device.as_ref(),
                default_texture,
                1,
                1,
                &[255; 4],
                0,
                &mut ctx.ring,
                &shared.reclaim,
            )?;
            ctx.flush(&shared)?;
        }

        Ok(Self {
            shared,
            contexts,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.shared.device
    }

    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.shared.limits
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn context(&self, index: usize) -> RenderResult<MutexGuard<'_, RenderContext>> {
        match self.contexts.get(index) {
            Some(ctx) => Ok(ctx.lock()),
            None => {
                log::warn!("Backend: render context {} does not exist", index);
                Err(RenderError::ResourceNotFound(format!("render context {}", index)))
            }
        }
    }

    /// Run `f` on a context. Used by workers and diagnostics.
    pub fn with_context<R>(&self, index: usize, f: impl FnOnce(&RenderContext) -> R) -> Option<R> {
        self.contexts.get(index).map(|ctx| f(&ctx.lock()))
    }

    // ========================================================================
    // Shaders and programs
    // ========================================================================

    /// Load and transpile `path/file` for `stage`. The same tuple always
    /// returns the same id.
    pub fn load_shader(&self, stage: ShaderStage, path: &str, file: &str, definitions: &str) -> RenderResult<ShaderId> {
        self.shared.shaders.load(stage, path, file, definitions)
    }

    /// Transpile in-memory source.
    pub fn load_shader_source(
        &self,
        stage: ShaderStage,
        name: &str,
        source: &str,
        definitions: &str,
    ) -> RenderResult<ShaderId> {
        self.shared.shaders.load_source(stage, name, source, definitions)
    }

    pub fn create_program(&self, name: &str, kind: ProgramKind) -> ProgramId {
        self.shared.programs.write().insert(Arc::new(Program::new(name, kind)))
    }

    pub fn attach_shader(&self, program: ProgramId, shader: ShaderId) -> bool {
        let Some(program) = self.shared.program(program) else {
            log::warn!("Backend: attach to unknown program {:?}", program);
            return false;
        };
        if self.shared.shaders.get(shader).is_none() {
            log::warn!("Backend: attach of unknown shader {:?} to {}", shader, program.name);
            return false;
        }
        program.attach(shader);
        true
    }

    /// Link the attached stages. `Ok(false)` means the program failed to
    /// link and stays unusable; draws with it are skipped.
    pub fn link(&self, program: ProgramId) -> RenderResult<bool> {
        let Some(program) = self.shared.program(program) else {
            log::warn!("Backend: link of unknown program {:?}", program);
            return Ok(false);
        };
        let serial = self.shared.link_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let (result, previous) = program.link(self.shared.device.as_ref(), &self.shared.shaders, serial);
        if let Some(previous) = previous {
            self.shared.retire_link(previous);
        }
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::warn!("Backend: {}", e);
                Ok(false)
            }
        }
    }

    /// The current link of `program`, if it linked.
    pub fn linked_program(&self, program: ProgramId) -> Option<Arc<LinkedProgram>> {
        self.shared.program(program)?.linked()
    }

    /// Remove a program. Its pipelines are retired.
    pub fn dispose_program(&self, program: ProgramId) -> bool {
        let Some(removed) = self.shared.programs.write().remove(program) else {
            log::warn!("Backend: dispose of unknown program {:?}", program);
            return false;
        };
        if let Some(linked) = removed.unlink() {
            self.shared.retire_link(linked);
        }
        true
    }

    /// Select the program for subsequent draws on `context`. Switching
    /// programs flushes the context's open buffers.
    pub fn use_program(&self, context: usize, program: Option<ProgramId>) -> RenderResult<()> {
        let program = program.filter(|id| {
            let known = self.shared.programs.read().contains_key(*id);
            if !known {
                log::warn!("Backend: use of unknown program {:?}", id);
            }
            known
        });
        self.context(context)?.use_program(&self.shared, program)
    }

    /// Location of `name` in `program`, or `None` (logged) if the program
    /// has no such uniform or is not linked.
    pub fn get_uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        let Some(linked) = self.linked_program(program) else {
            log::warn!("Backend: uniform {} looked up on unlinked program {:?}", name, program);
            return None;
        };
        match linked.uniform_index(name) {
            Some(index) => Some(UniformLocation { program, index }),
            None => {
                log::debug!("Backend: program {} has no uniform {}", linked.name, name);
                None
            }
        }
    }

    // ========================================================================
    // Uniforms
    // ========================================================================

    /// Write a uniform into the context's staging for the location's
    /// program. Integer writes to an opaque resource select its unit.
    pub fn set_uniform(&self, context: usize, location: UniformLocation, data: UniformData<'_>) -> bool {
        let Some(linked) = self.linked_program(location.program) else {
            log::warn!("Backend: uniform set on unlinked program {:?}", location.program);
            return false;
        };
        let Some(info) = linked.uniform(location.index) else {
            log::warn!("Backend: stale uniform location {:?}", location);
            return false;
        };
        let Ok(mut ctx) = self.context(context) else {
            return false;
        };
        let state = ctx.program_state(location.program, &linked);

        if let Some(binding_index) = info.resource {
            let unit = match data {
                UniformData::Int([unit, ..]) => u32::try_from(*unit).ok(),
                UniformData::UInt([unit, ..]) => Some(*unit),
                _ => None,
            };
            return match unit {
                Some(unit) => {
                    state.set_unit(binding_index, unit);
                    true
                }
                None => {
                    log::warn!("Backend: {} takes a unit index, not {:?}", info.name, data);
                    false
                }
            };
        }
        state.set_uniform(&linked, location.index, data)
    }

    pub fn set_uniform_float(&self, context: usize, location: UniformLocation, value: f32) -> bool {
        self.set_uniform(context, location, UniformData::Float(&[value]))
    }

    pub fn set_uniform_int(&self, context: usize, location: UniformLocation, value: i32) -> bool {
        self.set_uniform(context, location, UniformData::Int(&[value]))
    }

    pub fn set_uniform_uint(&self, context: usize, location: UniformLocation, value: u32) -> bool {
        self.set_uniform(context, location, UniformData::UInt(&[value]))
    }

    pub fn set_uniform_vec2(&self, context: usize, location: UniformLocation, value: [f32; 2]) -> bool {
        self.set_uniform(context, location, UniformData::Float(&value))
    }

    pub fn set_uniform_vec3(&self, context: usize, location: UniformLocation, value: [f32; 3]) -> bool {
        self.set_uniform(context, location, UniformData::Float(&value))
    }

    pub fn set_uniform_vec4(&self, context: usize, location: UniformLocation, value: [f32; 4]) -> bool {
        self.set_uniform(context, location, UniformData::Float(&value))
    }

    /// Column-major 3x3 matrix.
    pub fn set_uniform_mat3(&self, context: usize, location: UniformLocation, value: &[f32; 9]) -> bool {
        self.set_uniform(context, location, UniformData::Float(value))
    }

    /// Column-major 4x4 matrix.
    pub fn set_uniform_mat4(&self, context: usize, location: UniformLocation, value: &[f32; 16]) -> bool {
        self.set_uniform(context, location, UniformData::Float(value))
    }

    /// Consecutive elements starting at the location (arrays, vec4 arrays).
    pub fn set_uniform_floats(&self, context: usize, location: UniformLocation, values: &[f32]) -> bool {
        self.set_uniform(context, location, UniformData::Float(values))
    }

    /// Staging bytes of `stage`'s uniform block as last written on `context`.
    pub fn uniform_staging(&self, context: usize, program: ProgramId, stage: ShaderStage) -> Option<Vec<u8>> {
        let linked = self.linked_program(program)?;
        let stage_index = linked.stages.iter().position(|s| s.stage == stage)?;
        let mut ctx = self.contexts.get(context)?.lock();
        ctx.program_state(program, &linked);
        ctx.staging(program, stage_index).map(<[u8]>::to_vec)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    pub fn create_buffers(&self, count: usize, gpu_resident: bool, shared: bool) -> Vec<BufferId> {
        self.shared.buffers.create(count, gpu_resident, shared)
    }

    /// Replace the contents of `id`. `Ok(false)` if the buffer does not
    /// exist.
    pub fn upload_buffer(&self, context: usize, id: BufferId, bytes: &[u8]) -> RenderResult<bool> {
        let mut guard = self.context(context)?;
        let ctx = &mut *guard;
        let result = self.shared.buffers.upload(
            self.shared.device.as_ref(),
            id,
            bytes,
            self.shared.frame(),
            ctx.index,
            &mut ctx.ring,
            &self.shared.reclaim,
        );
        match result {
            Ok(_) => {
                self.shared.stats.add(Counter::Uploads, 1);
                Ok(true)
            }
            Err(RenderError::ResourceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn upload_buffer_slice<T: Pod>(&self, context: usize, id: BufferId, data: &[T]) -> RenderResult<bool> {
        self.upload_buffer(context, id, bytemuck::cast_slice(data))
    }

    pub fn dispose_buffers(&self, ids: &[BufferId]) -> usize {
        self.shared.buffers.dispose(ids, self.shared.frame(), &self.shared.reclaim)
    }

    pub fn bind_vertex_buffer(&self, context: usize, slot: usize, id: Option<BufferId>) -> bool {
        if slot >= MAX_VERTEX_SLOTS {
            log::warn!("Backend: vertex slot {} out of range", slot);
            return false;
        }
        self.bind(context, |ctx| ctx.bound.vertex[slot] = id)
    }

    pub fn bind_index_buffer(&self, context: usize, id: Option<BufferId>) -> bool {
        self.bind(context, |ctx| ctx.bound.index = id)
    }

    pub fn bind_storage_buffer(&self, context: usize, unit: usize, id: Option<BufferId>) -> bool {
        if unit >= MAX_STORAGE_UNITS {
            log::warn!("Backend: storage unit {} out of range", unit);
            return false;
        }
        self.bind(context, |ctx| ctx.bound.storage_buffers[unit] = id)
    }

    fn bind(&self, context: usize, f: impl FnOnce(&mut RenderContext)) -> bool {
        match self.context(context) {
            Ok(mut ctx) => {
                f(&mut ctx);
                true
            }
            Err(_) => false,
        }
    }

    // ========================================================================
    // Textures and render targets
    // ========================================================================

    pub fn create_texture(&self, name: &str) -> TextureId {
        self.shared.textures.create(name)
    }

    /// Replace a texture's pixels with RGBA8 data. Work already recorded on
    /// the context is flushed first so it keeps reading the old contents.
    pub fn upload_texture(
        &self,
        context: usize,
        id: TextureId,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> RenderResult<bool> {
        let mut guard = self.context(context)?;
        let ctx = &mut *guard;
        ctx.flush(&self.shared)?;
        let result = self.shared.textures.upload(
            self.shared.device.as_ref(),
            id,
            width,
            height,
            rgba,
            self.shared.frame(),
            &mut ctx.ring,
            &self.shared.reclaim,
        );
        match result {
            Ok(uploaded) => {
                if uploaded {
                    self.shared.stats.add(Counter::Uploads, 1);
                }
                Ok(uploaded)
            }
            Err(RenderError::ResourceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn bind_texture(&self, context: usize, unit: usize, id: Option<TextureId>) -> bool {
        if unit >= MAX_TEXTURE_UNITS {
            log::warn!("Backend: texture unit {} out of range", unit);
            return false;
        }
        self.bind(context, |ctx| ctx.bound.textures[unit] = id)
    }

    pub fn bind_storage_image(&self, context: usize, unit: usize, id: Option<TextureId>) -> bool {
        if unit >= MAX_STORAGE_UNITS {
            log::warn!("Backend: storage image unit {} out of range", unit);
            return false;
        }
        self.bind(context, |ctx| ctx.bound.storage_images[unit] = id)
    }

    pub fn dispose_texture(&self, id: TextureId) -> bool {
        self.shared.textures.dispose(id, self.shared.frame(), &self.shared.reclaim)
    }

    pub fn create_render_target(&self, width: u32, height: u32, color: bool, depth: bool) -> RenderResult<RenderTargetId> {
        self.shared.textures.create_render_target(
            self.shared.device.as_ref(),
            "lumen target",
            width.max(1),
            height.max(1),
            color,
            depth,
        )
    }

    /// Sampleable color texture of a render target.
    pub fn render_target_color(&self, target: RenderTargetId) -> Option<TextureId> {
        self.shared.textures.target(target)?.color
    }

    /// Select where graphics draws on `context` render to. `None` selects
    /// the frame target.
    pub fn bind_output_target(&self, context: usize, target: Option<RenderTargetId>) -> bool {
        if let Some(id) = target {
            if self.shared.textures.target(id).is_none() {
                log::warn!("Backend: bind of unknown render target {:?}", id);
                return false;
            }
        }
        self.bind(context, |ctx| {
            ctx.state.target = target.map_or(OutputTarget::Frame, OutputTarget::Target);
        })
    }

    pub fn dispose_render_target(&self, target: RenderTargetId) -> bool {
        self.shared
            .textures
            .dispose_render_target(target, self.shared.frame(), &self.shared.reclaim)
    }

    pub fn frame_target(&self) -> RenderTargetId {
        self.shared.frame_target
    }

    // ========================================================================
    // Render state
    // ========================================================================

    pub fn render_state(&self, context: usize) -> Option<RenderState> {
        self.with_context(context, |ctx| ctx.state)
    }

    pub fn set_cull_mode(&self, context: usize, mode: CullMode) -> bool {
        self.bind(context, |ctx| ctx.state.cull_mode = mode)
    }

    pub fn set_front_face(&self, context: usize, face: FrontFace) -> bool {
        self.bind(context, |ctx| ctx.state.front_face = face)
    }

    pub fn set_blend(&self, context: usize, enabled: bool) -> bool {
        self.bind(context, |ctx| ctx.state.blend = enabled)
    }

    pub fn set_depth_test(&self, context: usize, enabled: bool) -> bool {
        self.bind(context, |ctx| ctx.state.depth_test = enabled)
    }

    pub fn set_depth_write(&self, context: usize, enabled: bool) -> bool {
        self.bind(context, |ctx| ctx.state.depth_write = enabled)
    }

    pub fn set_depth_function(&self, context: usize, function: DepthFunction) -> bool {
        self.bind(context, |ctx| ctx.state.depth_function = function)
    }

    // ========================================================================
    // Drawing
    // ========================================================================

    /// Draw `count` vertices (or indices, with an index buffer bound) of
    /// triangles. Returns `Ok(false)` if the draw was skipped.
    pub fn draw_triangles(&self, context: usize, count: u32, offset: u32, instances: u32) -> RenderResult<bool> {
        self.execute(
            context,
            DrawCall::Triangles {
                count,
                offset,
                instances: instances.max(1),
            },
        )
    }

    pub fn draw_points(&self, context: usize, count: u32, offset: u32) -> RenderResult<bool> {
        self.execute(context, DrawCall::Points { count, offset })
    }

    pub fn draw_lines(&self, context: usize, count: u32, offset: u32) -> RenderResult<bool> {
        self.execute(context, DrawCall::Lines { count, offset })
    }

    pub fn dispatch_compute(&self, context: usize, x: u32, y: u32, z: u32) -> RenderResult<bool> {
        self.execute(context, DrawCall::Dispatch { x, y, z })
    }

    pub fn execute(&self, context: usize, call: DrawCall) -> RenderResult<bool> {
        self.context(context)?.execute(&self.shared, call)
    }

    /// Clear the context's output target. `None` leaves that aspect alone.
    pub fn clear(&self, context: usize, color: Option<[f32; 4]>, depth: Option<f32>) -> RenderResult<bool> {
        self.context(context)?.clear(&self.shared, color, depth)
    }

    /// Submit what `context` has recorded so far.
    pub fn flush(&self, context: usize) -> RenderResult<bool> {
        self.context(context)?.flush(&self.shared)
    }

    // ========================================================================
    // Synchronization and frames
    // ========================================================================

    /// Flush every context and wait for all of their submissions. On return
    /// every face buffer of every slot is idle and every counter is zero.
    pub fn memory_barrier(&self) -> RenderResult<()> {
        let device = self.shared.device.as_ref();
        let mut guards: Vec<_> = self.contexts.iter().map(|ctx| ctx.lock()).collect();
        for ctx in guards.iter_mut() {
            ctx.flush(&self.shared)?;
        }
        for ctx in guards.iter_mut() {
            ctx.ring.wait_all(device)?;
        }
        // Contexts stay locked so nothing new can reference what is drained.
        let destroyed = self.shared.reclaim.drain_all(device);
        drop(guards);
        log::trace!("Backend: memory barrier, {} objects destroyed", destroyed);
        Ok(())
    }

    /// Start a new frame: submit leftovers of the previous one, wait for the
    /// submissions that fell out of the in-flight window and destroy what
    /// they were the last users of. Returns the new frame index.
    pub fn begin_frame(&self) -> RenderResult<u64> {
        let device = self.shared.device.as_ref();
        let previous = self.shared.frame();
        for ctx in &self.contexts {
            ctx.lock().flush(&self.shared)?;
        }
        let finished = self.shared.stats.roll(previous);
        log::trace!("Backend: frame {} done: {:?}", previous, finished);

        let frame = previous + 1;
        self.shared.frame.store(frame, Ordering::Release);
        let margin = self.shared.config.frames_in_flight;
        if let Some(retired) = frame.checked_sub(margin) {
            for ctx in &self.contexts {
                ctx.lock().ring.wait_through(device, retired)?;
            }
        }
        self.shared.reclaim.drain_ready(device, frame, margin);
        Ok(frame)
    }

    /// Submit everything recorded this frame, contexts in parallel.
    pub fn end_frame(&self) -> RenderResult<()> {
        self.contexts
            .par_iter()
            .try_for_each(|ctx| ctx.lock().flush(&self.shared).map(|_| ()))
    }

    pub fn frame(&self) -> u64 {
        self.shared.frame()
    }

    /// Counters of the frame being recorded.
    pub fn statistics(&self) -> FrameStatistics {
        self.shared.stats.snapshot(self.shared.frame())
    }

    /// Counters of the last completed frame.
    pub fn previous_statistics(&self) -> FrameStatistics {
        self.shared.stats.previous()
    }

    /// Objects waiting for deferred destruction.
    pub fn pending_destruction(&self) -> usize {
        self.shared.reclaim.len()
    }

    /// Wait for the device and destroy everything. Safe to call twice.
    pub fn teardown(&self) -> RenderResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Backend: teardown");
        let device = self.shared.device.as_ref();
        let mut guards: Vec<_> = self.contexts.iter().map(|ctx| ctx.lock()).collect();
        let mut result = Ok(());
        for ctx in guards.iter_mut() {
            if let Err(e) = ctx.flush(&self.shared) {
                result = Err(e);
            }
        }
        if let Err(e) = device.wait_idle() {
            log::error!("Backend: device did not go idle: {}", e);
            result = result.and(Err(e.into()));
        }

        for ctx in guards.iter_mut() {
            ctx.destroy(device);
        }
        drop(guards);
        let programs = std::mem::take(&mut *self.shared.programs.write());
        for (_, program) in programs {
            if let Some(linked) = program.unlink() {
                self.shared.retire_link(linked);
            }
        }
        self.shared.reclaim.drain_all(device);
        self.shared.buffers.destroy_all(device);
        self.shared.textures.destroy_all(device);
        device.destroy_buffer(self.shared.empty_buffer);
        self.shared.shaders.clear();
        result
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("Backend: teardown failed: {}", e);
        }
    }
}
