//! Per-thread render contexts.
//!
//! A context owns everything one worker thread records with: its command
//! ring and uniform arena, the render state that forms pipeline
//! fingerprints, the table of bound resources, and for every program it has
//! touched the uniform staging bytes and descriptor sets of that program.
//! Nothing here is shared between contexts.

pub mod batch;
pub mod ring;
pub mod uniform_arena;

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::config::BackendConfig;
use crate::device::{
    BindingLayoutHandle, CullMode, DepthFunction, DescriptorSetHandle, DescriptorWrite, DeviceLimits, DeviceResult, FrontFace,
    GpuDevice, PipelineHandle,
};
use crate::program::pipeline::{Fingerprint, OutputTarget};
use crate::program::uniforms::{write_slot, UniformData};
use crate::program::vertex_layout::MAX_VERTEX_SLOTS;
use crate::program::{BindingSource, LinkedProgram, ProgramId, ProgramKind};
use crate::resources::buffer::BufferId;
use crate::resources::texture::TextureId;

use ring::{CommandRing, FACE_COUNT};
use uniform_arena::UniformArena;

pub const MAX_TEXTURE_UNITS: usize = 16;
pub const MAX_STORAGE_UNITS: usize = 8;

/// Fixed-function state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderState {
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub blend: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_function: DepthFunction,
    pub target: OutputTarget,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            front_face: FrontFace::CounterClockwise,
            cull_mode: CullMode::Back,
            blend: false,
            depth_test: true,
            depth_write: true,
            depth_function: DepthFunction::LessOrEqual,
            target: OutputTarget::Frame,
        }
    }
}

impl RenderState {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            front_face: self.front_face,
            cull_mode: self.cull_mode,
            blend: self.blend,
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            depth_function: self.depth_function,
            target: self.target,
        }
    }
}

/// Handles bound by the caller, resolved to device objects at draw time.
#[derive(Debug, Clone, Default)]
pub struct BoundResources {
    pub vertex: [Option<BufferId>; MAX_VERTEX_SLOTS],
    pub index: Option<BufferId>,
    pub textures: [Option<TextureId>; MAX_TEXTURE_UNITS],
    pub storage_buffers: [Option<BufferId>; MAX_STORAGE_UNITS],
    pub storage_images: [Option<TextureId>; MAX_STORAGE_UNITS],
}

/// Staging bytes of one stage's uniform block.
#[derive(Debug, Clone)]
pub struct StageStaging {
    pub bytes: Vec<u8>,
    pub dirty: bool,
    /// Arena offset of the last upload, valid for one ring epoch.
    uploaded: Option<(u64, u32)>,
}

#[derive(Debug, Default)]
struct SetRotation {
    sets: Vec<DescriptorSetHandle>,
    next: usize,
    epoch: u64,
}

/// What one context keeps for one linked program.
#[derive(Debug)]
pub struct ProgramBindingState {
    pub serial: u64,
    /// Indexed like the linked program's stages.
    pub blocks: Vec<Option<StageStaging>>,
    /// Unit of each binding; only meaningful for opaque resources.
    pub units: Vec<u32>,
    rotations: Vec<SetRotation>,
    current: Option<(u64, Vec<DescriptorWrite>, DescriptorSetHandle)>,
}

impl ProgramBindingState {
    pub fn new(linked: &LinkedProgram, slots: usize) -> Self {
        Self {
            serial: linked.serial,
            blocks: linked
                .stages
                .iter()
                .map(|stage| {
                    stage.block_binding.map(|_| StageStaging {
                        bytes: vec![0; stage.block_size as usize],
                        dirty: true,
                        uploaded: None,
                    })
                })
                .collect(),
            units: linked
                .bindings
                .iter()
                .map(|binding| match binding.source {
                    BindingSource::Resource { unit, .. } => unit,
                    BindingSource::UniformBlock { .. } => 0,
                })
                .collect(),
            rotations: (0..slots).map(|_| SetRotation::default()).collect(),
            current: None,
        }
    }

    /// Write a uniform value into every stage that declares it. Returns
    /// `false` if `index` names no block entry.
    pub fn set_uniform(&mut self, linked: &LinkedProgram, index: u32, data: UniformData<'_>) -> bool {
        let Some(info) = linked.uniform(index) else {
            return false;
        };
        if info.targets.is_empty() {
            return false;
        }
        for target in &info.targets {
            if let Some(Some(block)) = self.blocks.get_mut(target.stage_index) {
                if write_slot(&target.slot, &mut block.bytes, data) {
                    block.dirty = true;
                }
            }
        }
        true
    }

    /// Point an opaque resource at another unit.
    pub fn set_unit(&mut self, binding_index: usize, unit: u32) {
        if let Some(slot) = self.units.get_mut(binding_index) {
            *slot = unit;
        }
    }

    /// Copy dirty blocks (and every block after a ring epoch change) into
    /// the arena. Returns the dynamic offsets in binding order, or `None`
    /// when the arena slot is full.
    pub fn upload_blocks(
        &mut self,
        device: &dyn GpuDevice,
        arena: &mut UniformArena,
        epoch: u64,
    ) -> DeviceResult<Option<SmallVec<[u32; 3]>>> {
        let mut offsets = SmallVec::new();
        for block in self.blocks.iter_mut().flatten() {
            let offset = match block.uploaded {
                Some((uploaded_epoch, offset)) if uploaded_epoch == epoch && !block.dirty => offset,
                _ => match arena.push(device, &block.bytes)? {
                    Some(offset) => {
                        block.uploaded = Some((epoch, offset));
                        block.dirty = false;
                        offset
                    }
                    None => return Ok(None),
                },
            };
            offsets.push(offset);
        }
        Ok(Some(offsets))
    }

    /// A descriptor set holding `writes`. The current set is reused while
    /// its contents and ring epoch are unchanged; otherwise the next set of
    /// this slot's rotation is written. Returns the set and whether it was
    /// written.
    pub fn descriptor_set(
        &mut self,
        device: &dyn GpuDevice,
        layout: BindingLayoutHandle,
        writes: Vec<DescriptorWrite>,
        slot: usize,
        epoch: u64,
        growth: u32,
    ) -> DeviceResult<(DescriptorSetHandle, bool)> {
        if let Some((current_epoch, current_writes, set)) = &self.current {
            if *current_epoch == epoch && *current_writes == writes {
                return Ok((*set, false));
            }
        }

        let rotation = &mut self.rotations[slot];
        if rotation.epoch != epoch {
            rotation.epoch = epoch;
            rotation.next = 0;
        }
        if rotation.next == rotation.sets.len() {
            rotation.sets.extend(device.allocate_descriptor_sets(layout, growth)?);
        }
        let set = rotation.sets[rotation.next];
        rotation.next += 1;
        device.write_descriptor_set(set, &writes);
        self.current = Some((epoch, writes, set));
        Ok((set, true))
    }
}

/// Render-pass scope open on one face buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePass {
    pub target: OutputTarget,
    /// Kind of draws recorded so far; `None` for a scope opened by a clear.
    pub category: Option<ProgramKind>,
}

pub struct RenderContext {
    pub index: usize,
    pub state: RenderState,
    pub bound: BoundResources,
    pub(crate) ring: CommandRing,
    pub(crate) arena: UniformArena,
    pub(crate) active: Option<ProgramId>,
    pub(crate) programs: HashMap<ProgramId, ProgramBindingState>,
    pub(crate) passes: [Option<ActivePass>; FACE_COUNT],
    pub(crate) bound_pipelines: [Option<PipelineHandle>; FACE_COUNT],
}

impl RenderContext {
    pub fn new(
        index: usize,
        device: &dyn GpuDevice,
        config: &BackendConfig,
        limits: &DeviceLimits,
    ) -> DeviceResult<Self> {
        Ok(Self {
            index,
            state: RenderState::default(),
            bound: BoundResources::default(),
            ring: CommandRing::new(device, config.ring_slots, config.fence_timeout_ns)?,
            arena: UniformArena::new(
                device,
                config.ring_slots,
                config.uniform_arena_bytes,
                limits.min_uniform_offset_alignment,
            )?,
            active: None,
            programs: HashMap::new(),
            passes: [None; FACE_COUNT],
            bound_pipelines: [None; FACE_COUNT],
        })
    }

    pub fn ring(&self) -> &CommandRing {
        &self.ring
    }

    pub fn active_program(&self) -> Option<ProgramId> {
        self.active
    }

    /// Binding state of `linked`, rebuilt if the program was relinked.
    pub fn program_state(&mut self, id: ProgramId, linked: &LinkedProgram) -> &mut ProgramBindingState {
        let slots = self.ring.slot_count();
        let state = self
            .programs
            .entry(id)
            .or_insert_with(|| ProgramBindingState::new(linked, slots));
        if state.serial != linked.serial {
            *state = ProgramBindingState::new(linked, slots);
        }
        state
    }

    pub fn staging(&self, id: ProgramId, stage_index: usize) -> Option<&[u8]> {
        self.programs
            .get(&id)?
            .blocks
            .get(stage_index)?
            .as_ref()
            .map(|block| block.bytes.as_slice())
    }

    /// Release device objects. The device must be idle.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.programs.clear();
        self.ring.destroy(device);
        self.arena.destroy(device);
    }
}
