//! Command batching and execution.
//!
//! Turns draw and dispatch calls into recorded commands on the context's
//! open face buffer. The open buffers are flushed when the program changes,
//! on a memory barrier, when the recorded command counts cross the
//! configured water marks, and when a call on one face would otherwise
//! execute ahead of conflicting work issued earlier on another.

use std::sync::Arc;

use smallvec::SmallVec;

use super::ring::{Access, AccessList, Face, Resource, FACE_COUNT};
use super::{ActivePass, ProgramBindingState, RenderContext};
use crate::backend::Shared;
use crate::config::BackendConfig;
use crate::device::{
    BufferHandle, CommandBufferHandle, DescriptorResource, DescriptorWrite, DeviceError, GpuDevice, ImageHandle,
    ImageLayout, RenderingInfo,
};
use crate::error::RenderResult;
use crate::program::pipeline::{build_compute, build_graphics, Fingerprint, GraphicsBuild, OutputTarget, TargetFormats};
use crate::program::{BindingSource, LinkedProgram, ProgramId, ProgramKind};
use crate::resources::texture::{RenderTarget, Texture};
use crate::shader::{ResourceKind, ShaderStage};
use crate::stats::Counter;

/// A draw or dispatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    Triangles { count: u32, offset: u32, instances: u32 },
    Points { count: u32, offset: u32 },
    Lines { count: u32, offset: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
}

impl DrawCall {
    /// Program kind the call must be issued with.
    pub fn kind(&self) -> ProgramKind {
        match self {
            DrawCall::Triangles { .. } => ProgramKind::Objects,
            DrawCall::Points { .. } => ProgramKind::Points,
            DrawCall::Lines { .. } => ProgramKind::Lines,
            DrawCall::Dispatch { .. } => ProgramKind::Compute,
        }
    }
}

/// Output target with its attachments looked up.
struct ResolvedTarget {
    target: RenderTarget,
    color: Option<Arc<Texture>>,
    depth: Option<Arc<Texture>>,
}

impl ResolvedTarget {
    fn formats(&self) -> TargetFormats {
        TargetFormats {
            color: self.color.as_ref().map(|t| t.format),
            depth: self.depth.as_ref().map(|t| t.format),
        }
    }

    /// Attachment accesses of drawing into (or clearing) the target.
    fn accesses(&self, clearing: bool, out: &mut AccessList) {
        let attachments = [
            (self.color.as_ref(), ImageLayout::ColorAttachment),
            (self.depth.as_ref(), ImageLayout::DepthAttachment),
        ];
        for (texture, layout) in attachments {
            let Some(texture) = texture else {
                continue;
            };
            let access = if clearing || texture.needs_transition(layout) {
                Access::Write
            } else {
                Access::Attachment
            };
            out.push((Resource::Image(texture.state().image), access));
        }
    }
}

/// An opaque resource binding resolved before recording starts.
enum Resolved {
    Block { stage_index: usize },
    Texture { texture: Arc<Texture>, layout: ImageLayout, storage: bool },
    Buffer { handle: BufferHandle, range: u64 },
}

impl RenderContext {
    /// Flush policy for draw-count growth: flush once the busiest recording
    /// face reaches the high-water mark while every recording face has at
    /// least the low-water mark, or once any face reaches the hard limit.
    pub fn should_flush(&self, config: &BackendConfig) -> bool {
        let counts = self.ring.recording_counts();
        let (Some(max), Some(min)) = (counts.iter().max(), counts.iter().min()) else {
            return false;
        };
        *max >= config.hard_command_limit || (*max >= config.high_water_mark && *min >= config.low_water_mark)
    }

    /// End and submit all open buffers of this context.
    pub(crate) fn flush(&mut self, shared: &Shared) -> RenderResult<bool> {
        if !self.ring.is_recording() {
            return Ok(false);
        }
        let device = shared.device.as_ref();
        for face in Face::ALL {
            self.end_pass(device, face);
        }
        let submissions = self.ring.flush(device, &shared.submit_lock, shared.frame())?;
        self.arena.reset(self.ring.slot());
        self.bound_pipelines = [None; FACE_COUNT];
        shared.stats.add(Counter::Submissions, submissions as u64);
        Ok(true)
    }

    /// Select the program for subsequent calls. Changing programs flushes.
    pub(crate) fn use_program(&mut self, shared: &Shared, program: Option<ProgramId>) -> RenderResult<()> {
        if self.active == program {
            return Ok(());
        }
        if self.active.is_some() {
            self.flush(shared)?;
        }
        self.active = program;
        Ok(())
    }

    /// Record a draw or dispatch with the active program. Returns `false`
    /// when the call was skipped (no usable program, missing target or
    /// storage image).
    pub(crate) fn execute(&mut self, shared: &Shared, call: DrawCall) -> RenderResult<bool> {
        let kind = call.kind();
        let Some(id) = self.active else {
            log::warn!("Context {}: {:?} call with no program in use", self.index, kind);
            return Ok(false);
        };
        let Some(program) = shared.program(id) else {
            log::warn!("Context {}: program {:?} no longer exists", self.index, id);
            return Ok(false);
        };
        if program.kind != kind {
            log::warn!(
                "Context {}: {:?} call issued with {:?} program {}",
                self.index,
                kind,
                program.kind,
                program.name
            );
            return Ok(false);
        }
        let Some(linked) = program.linked() else {
            log::debug!("Context {}: program {} is not linked, call skipped", self.index, program.name);
            return Ok(false);
        };

        if self.should_flush(&shared.config) {
            self.flush(shared)?;
        }

        let slots = self.ring.slot_count();
        let mut binding = self
            .programs
            .remove(&id)
            .filter(|state| state.serial == linked.serial)
            .unwrap_or_else(|| ProgramBindingState::new(&linked, slots));
        let result = self.record(shared, &linked, &mut binding, call);
        self.programs.insert(id, binding);
        result
    }

    fn record(
        &mut self,
        shared: &Shared,
        linked: &LinkedProgram,
        binding: &mut ProgramBindingState,
        call: DrawCall,
    ) -> RenderResult<bool> {
        let device = shared.device.as_ref();
        let kind = linked.kind;
        let compute = kind.is_compute();
        let face = if compute {
            Face::Compute
        } else {
            Face::for_winding(self.state.front_face)
        };
        let frame = shared.frame();

        // Everything that can skip the call is looked up before anything is
        // written to the arena or recorded.
        let target = if compute {
            None
        } else {
            match self.resolve_target(shared) {
                Some(target) => Some(target),
                None => return Ok(false),
            }
        };
        let Some(resolved) = self.resolve_bindings(shared, linked, binding, frame) else {
            return Ok(false);
        };
        let vertex: SmallVec<[BufferHandle; 8]> = (0..linked.vertex_layout.slot_count())
            .map(|slot| {
                self.bound
                    .vertex
                    .get(slot)
                    .copied()
                    .flatten()
                    .and_then(|id| shared.buffers.resolve(id, frame, self.index))
                    .map_or(shared.empty_buffer, |b| b.handle)
            })
            .collect();
        let index = match call {
            DrawCall::Triangles { .. } => self
                .bound
                .index
                .and_then(|id| shared.buffers.resolve(id, frame, self.index)),
            _ => None,
        };

        let mut accesses = AccessList::new();
        for item in &resolved {
            match item {
                Resolved::Texture {
                    texture,
                    layout,
                    storage,
                } => {
                    let access = if *storage || texture.needs_transition(*layout) {
                        Access::Write
                    } else {
                        Access::Read
                    };
                    accesses.push((Resource::Image(texture.state().image), access));
                }
                Resolved::Buffer { handle, .. } if *handle != shared.empty_buffer => {
                    accesses.push((Resource::Buffer(*handle), Access::Write));
                }
                Resolved::Buffer { .. } | Resolved::Block { .. } => {}
            }
        }
        let fetched = vertex.iter().copied().chain(index.map(|b| b.handle));
        for buffer in fetched.filter(|b| *b != shared.empty_buffer) {
            accesses.push((Resource::Buffer(buffer), Access::Read));
        }
        if let Some(target) = &target {
            target.accesses(false, &mut accesses);
        }
        if self.ring.out_of_order(face, &accesses) {
            log::trace!("Context {}: {:?} call depends on a later face, flushing", self.index, kind);
            self.flush(shared)?;
        }

        let offsets = match binding.upload_blocks(device, &mut self.arena, self.ring.epoch())? {
            Some(offsets) => offsets,
            None => {
                self.flush(shared)?;
                binding
                    .upload_blocks(device, &mut self.arena, self.ring.epoch())?
                    .ok_or_else(|| {
                        DeviceError::Allocation(format!("uniform blocks of {} exceed the uniform arena", linked.name))
                    })?
            }
        };

        let (cmd, fresh) = self.ring.begin(device, face)?;
        if fresh {
            self.passes[face.index()] = None;
            self.bound_pipelines[face.index()] = None;
        }
        self.ring.note_accesses(face, &accesses);

        // Layout transitions cannot be recorded inside a render pass.
        let transitions_needed = resolved.iter().any(|r| match r {
            Resolved::Texture { texture, layout, .. } => texture.needs_transition(*layout),
            _ => false,
        });
        if transitions_needed {
            self.end_pass(device, face);
        }
        let mut writes = Vec::with_capacity(resolved.len());
        for (resource, program_binding) in resolved.iter().zip(&linked.bindings) {
            let resource = match resource {
                Resolved::Block { stage_index } => DescriptorResource::UniformBuffer {
                    buffer: self.arena.buffer(),
                    range: u64::from(linked.stages[*stage_index].block_size),
                },
                Resolved::Texture {
                    texture,
                    layout,
                    storage,
                } => {
                    let image = self.transition(shared, cmd, texture, *layout);
                    if *storage {
                        DescriptorResource::StorageImage { image }
                    } else {
                        DescriptorResource::ImageSampler {
                            image,
                            sampler: shared.textures.sampler(),
                        }
                    }
                }
                Resolved::Buffer { handle, range } => DescriptorResource::StorageBuffer {
                    buffer: *handle,
                    range: *range,
                },
            };
            writes.push(DescriptorWrite {
                binding: program_binding.binding,
                resource,
            });
        }

        if let Some(target) = &target {
            let output = self.state.target;
            let keep = matches!(
                self.passes[face.index()],
                Some(pass) if pass.target == output && pass.category.map_or(true, |c| c == kind)
            );
            if keep {
                self.passes[face.index()] = Some(ActivePass {
                    target: output,
                    category: Some(kind),
                });
            } else {
                self.end_pass(device, face);
                self.begin_pass(shared, cmd, face, target, Some(kind));
            }
        }

        let fingerprint = if compute {
            Fingerprint::COMPUTE
        } else {
            self.state.fingerprint()
        };
        let formats = target.as_ref().map(ResolvedTarget::formats);
        let (pipeline, built) = linked.pipelines.get_or_build(fingerprint, || {
            let code = |stage| linked.stage(stage).map_or(&[][..], |s| s.spirv.as_slice());
            if compute {
                build_compute(device, &linked.name, linked.layout, code(ShaderStage::Compute))
            } else {
                let build = GraphicsBuild {
                    name: &linked.name,
                    layout: linked.layout,
                    vertex_code: code(ShaderStage::Vertex),
                    fragment_code: code(ShaderStage::Fragment),
                    vertex_layout: &linked.vertex_layout,
                    formats: formats.unwrap_or(TargetFormats {
                        color: None,
                        depth: None,
                    }),
                };
                build_graphics(device, &build, &fingerprint)
            }
        })?;
        if built {
            shared.stats.add(Counter::PipelinesBuilt, 1);
        }
        if self.bound_pipelines[face.index()] != Some(pipeline) {
            device.cmd_bind_pipeline(cmd, kind.bind_point(), pipeline);
            self.bound_pipelines[face.index()] = Some(pipeline);
            shared.stats.add(Counter::PipelineBinds, 1);
        }

        if !writes.is_empty() {
            let (set, _) = binding.descriptor_set(
                device,
                linked.layout,
                writes,
                self.ring.slot(),
                self.ring.epoch(),
                shared.config.descriptor_sets_per_block,
            )?;
            device.cmd_bind_descriptor_set(cmd, kind.bind_point(), linked.layout, set, &offsets);
        }
        if !vertex.is_empty() {
            device.cmd_bind_vertex_buffers(cmd, 0, &vertex);
        }

        match call {
            DrawCall::Triangles {
                count,
                offset,
                instances,
            } => match index {
                Some(index) => {
                    device.cmd_bind_index_buffer(cmd, index.handle);
                    device.cmd_draw_indexed(cmd, count, instances, offset);
                }
                None => device.cmd_draw(cmd, count, instances, offset),
            },
            DrawCall::Points { count, offset } | DrawCall::Lines { count, offset } => {
                device.cmd_draw(cmd, count, 1, offset)
            }
            DrawCall::Dispatch { x, y, z } => device.cmd_dispatch(cmd, x, y, z),
        }
        self.ring.add_commands(face, 1);
        shared.stats.add(
            if compute {
                Counter::Dispatches
            } else {
                Counter::DrawCalls
            },
            1,
        );
        Ok(true)
    }

    /// Clear the bound output target, opening a render pass that the next
    /// draw to the same target adopts.
    pub(crate) fn clear(&mut self, shared: &Shared, color: Option<[f32; 4]>, depth: Option<f32>) -> RenderResult<bool> {
        let Some(target) = self.resolve_target(shared) else {
            return Ok(false);
        };
        if self.should_flush(&shared.config) {
            self.flush(shared)?;
        }
        let device = shared.device.as_ref();
        let face = Face::for_winding(self.state.front_face);
        let mut accesses = AccessList::new();
        target.accesses(true, &mut accesses);
        if self.ring.out_of_order(face, &accesses) {
            self.flush(shared)?;
        }
        let (cmd, fresh) = self.ring.begin(device, face)?;
        if fresh {
            self.passes[face.index()] = None;
            self.bound_pipelines[face.index()] = None;
        }
        self.ring.note_accesses(face, &accesses);
        let output = self.state.target;
        if !matches!(self.passes[face.index()], Some(pass) if pass.target == output) {
            self.end_pass(device, face);
            self.begin_pass(shared, cmd, face, &target, None);
        }
        let color = color.filter(|_| target.color.is_some());
        let depth = depth.filter(|_| target.depth.is_some());
        device.cmd_clear(cmd, color, depth, target.target.width, target.target.height);
        self.ring.add_commands(face, 1);
        Ok(true)
    }

    fn resolve_target(&self, shared: &Shared) -> Option<ResolvedTarget> {
        let id = match self.state.target {
            OutputTarget::Frame => shared.frame_target,
            OutputTarget::Target(id) => id,
        };
        let Some(target) = shared.textures.target(id) else {
            log::warn!("Context {}: output target {:?} does not exist", self.index, id);
            return None;
        };
        Some(ResolvedTarget {
            color: target.color.and_then(|t| shared.textures.get(t)),
            depth: target.depth.and_then(|t| shared.textures.get(t)),
            target,
        })
    }

    /// Look up what every binding of `linked` reads. `None` if a storage
    /// image is unbound.
    fn resolve_bindings(
        &self,
        shared: &Shared,
        linked: &LinkedProgram,
        binding: &ProgramBindingState,
        frame: u64,
    ) -> Option<Vec<Resolved>> {
        let mut resolved = Vec::with_capacity(linked.bindings.len());
        for (index, program_binding) in linked.bindings.iter().enumerate() {
            let unit = binding.units[index] as usize;
            let item = match &program_binding.source {
                BindingSource::UniformBlock { stage_index } => Resolved::Block {
                    stage_index: *stage_index,
                },
                BindingSource::Resource {
                    kind: ResourceKind::Sampler,
                    ..
                } => {
                    let texture = self
                        .bound
                        .textures
                        .get(unit)
                        .copied()
                        .flatten()
                        .and_then(|id| shared.textures.get(id))
                        .filter(|t| !t.state().image.is_null())
                        .or_else(|| shared.textures.get(shared.default_texture))?;
                    Resolved::Texture {
                        texture,
                        layout: ImageLayout::ShaderRead,
                        storage: false,
                    }
                }
                BindingSource::Resource {
                    kind: ResourceKind::StorageImage,
                    name,
                    ..
                } => {
                    let Some(texture) = self
                        .bound
                        .storage_images
                        .get(unit)
                        .copied()
                        .flatten()
                        .and_then(|id| shared.textures.get(id))
                        .filter(|t| !t.state().image.is_null())
                    else {
                        log::warn!(
                            "Context {}: storage image {} of {} has nothing bound at unit {}",
                            self.index,
                            name,
                            linked.name,
                            unit
                        );
                        return None;
                    };
                    Resolved::Texture {
                        texture,
                        layout: ImageLayout::General,
                        storage: true,
                    }
                }
                BindingSource::Resource {
                    kind: ResourceKind::StorageBuffer,
                    ..
                } => {
                    match self
                        .bound
                        .storage_buffers
                        .get(unit)
                        .copied()
                        .flatten()
                        .and_then(|id| shared.buffers.resolve(id, frame, self.index))
                        .filter(|b| b.len > 0)
                    {
                        Some(buffer) => Resolved::Buffer {
                            handle: buffer.handle,
                            range: buffer.len,
                        },
                        None => Resolved::Buffer {
                            handle: shared.empty_buffer,
                            range: crate::backend::EMPTY_BUFFER_SIZE,
                        },
                    }
                }
            };
            resolved.push(item);
        }
        Some(resolved)
    }

    fn transition(&self, shared: &Shared, cmd: CommandBufferHandle, texture: &Texture, layout: ImageLayout) -> ImageHandle {
        match texture.transition(shared.device.as_ref(), cmd, layout) {
            Some((image, changed)) => {
                if changed {
                    shared.stats.add(Counter::Transitions, 1);
                }
                image
            }
            None => ImageHandle::NULL,
        }
    }

    fn begin_pass(
        &mut self,
        shared: &Shared,
        cmd: CommandBufferHandle,
        face: Face,
        target: &ResolvedTarget,
        category: Option<ProgramKind>,
    ) {
        let color = target
            .color
            .as_ref()
            .map(|t| self.transition(shared, cmd, t, ImageLayout::ColorAttachment));
        let depth = target
            .depth
            .as_ref()
            .map(|t| self.transition(shared, cmd, t, ImageLayout::DepthAttachment));
        shared.device.cmd_begin_rendering(
            cmd,
            &RenderingInfo {
                color,
                depth,
                width: target.target.width,
                height: target.target.height,
            },
        );
        self.passes[face.index()] = Some(ActivePass {
            target: self.state.target,
            category,
        });
    }

    fn end_pass(&mut self, device: &dyn GpuDevice, face: Face) {
        if self.passes[face.index()].take().is_some() {
            device.cmd_end_rendering(self.ring.command_buffer(self.ring.slot(), face));
        }
    }
}
