//! Command-buffer ring of one render context.
//!
//! Each ring slot holds one command buffer and fence per face variant plus a
//! transfer command buffer. A face buffer moves through
//! `Waiting -> Recording -> Submitted -> Waiting`: it is begun on first use,
//! ended and submitted when the context flushes, and waited on before the
//! ring comes back around to its slot. Fence waits are bounded; expiry is
//! fatal.
//!
//! Face buffers of a slot are submitted in the order they began recording.
//! Each face keeps the resources its commands touched, so a caller can tell
//! when new work on an earlier face would run ahead of conflicting work
//! already recorded on a later one.

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::device::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DeviceError, DeviceResult, FenceHandle, FrontFace, GpuDevice,
    ImageHandle,
};
use crate::resources::TransferSink;

pub const FACE_COUNT: usize = 3;

/// Face variant of a ring slot. Compute work and the two triangle windings
/// record into separate command buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    Compute = 0,
    CounterClockwise = 1,
    Clockwise = 2,
}

impl Face {
    pub const ALL: [Face; FACE_COUNT] = [Face::Compute, Face::CounterClockwise, Face::Clockwise];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn for_winding(front_face: FrontFace) -> Face {
        match front_face {
            FrontFace::CounterClockwise => Face::CounterClockwise,
            FrontFace::Clockwise => Face::Clockwise,
        }
    }
}

/// A device object touched by recorded commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Image(ImageHandle),
    Buffer(BufferHandle),
}

/// How recorded commands touch a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Sampled, or fetched as vertex or index data.
    Read,
    /// Drawn into as an attachment already in attachment layout.
    Attachment,
    /// Storage writes, clears and layout transitions.
    Write,
}

impl Access {
    /// Whether the two must execute in the order they were issued. Draws
    /// into the same attachments may run in either order.
    pub fn conflicts(self, other: Access) -> bool {
        !matches!(
            (self, other),
            (Access::Read, Access::Read) | (Access::Attachment, Access::Attachment)
        )
    }

    fn merge(self, other: Access) -> Access {
        if self == other {
            self
        } else {
            Access::Write
        }
    }
}

pub type AccessList = SmallVec<[(Resource, Access); 8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceState {
    /// Fence observed signaled; free to begin.
    Waiting,
    Recording,
    /// Ended and submitted; the fence has not been waited yet.
    Submitted,
}

#[derive(Debug)]
struct FaceBuffer {
    cmd: CommandBufferHandle,
    fence: FenceHandle,
    state: FaceState,
    commands: u32,
    accesses: Vec<(Resource, Access)>,
}

#[derive(Debug)]
struct RingSlot {
    faces: [FaceBuffer; FACE_COUNT],
    transfer: CommandBufferHandle,
    transfer_recording: bool,
    submitted_frame: Option<u64>,
    /// Recording faces in the order they were begun.
    order: SmallVec<[Face; FACE_COUNT]>,
}

pub struct CommandRing {
    pool: CommandPoolHandle,
    slots: Vec<RingSlot>,
    current: usize,
    epoch: u64,
    fence_timeout_ns: u64,
}

impl CommandRing {
    pub fn new(device: &dyn GpuDevice, slot_count: usize, fence_timeout_ns: u64) -> DeviceResult<Self> {
        let pool = device.create_command_pool()?;
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let face = || -> DeviceResult<FaceBuffer> {
                Ok(FaceBuffer {
                    cmd: device.allocate_command_buffer(pool)?,
                    fence: device.create_fence(true)?,
                    state: FaceState::Waiting,
                    commands: 0,
                    accesses: Vec::new(),
                })
            };
            slots.push(RingSlot {
                faces: [face()?, face()?, face()?],
                transfer: device.allocate_command_buffer(pool)?,
                transfer_recording: false,
                submitted_frame: None,
                order: SmallVec::new(),
            });
        }
        Ok(Self {
            pool,
            slots,
            current: 0,
            epoch: 0,
            fence_timeout_ns,
        })
    }

    /// Index of the slot being recorded.
    pub fn slot(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Incremented every time the ring moves to a new slot.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self, face: Face) -> FaceState {
        self.slots[self.current].faces[face.index()].state
    }

    pub fn state_at(&self, slot: usize, face: Face) -> FaceState {
        self.slots[slot].faces[face.index()].state
    }

    pub fn commands(&self, face: Face) -> u32 {
        self.slots[self.current].faces[face.index()].commands
    }

    pub fn command_buffer(&self, slot: usize, face: Face) -> CommandBufferHandle {
        self.slots[slot].faces[face.index()].cmd
    }

    /// Command counts of the face buffers currently recording.
    pub fn recording_counts(&self) -> SmallVec<[u32; FACE_COUNT]> {
        self.slots[self.current]
            .faces
            .iter()
            .filter(|f| f.state == FaceState::Recording)
            .map(|f| f.commands)
            .collect()
    }

    /// Faces of the current slot in the order they will be submitted.
    pub fn submission_order(&self) -> &[Face] {
        &self.slots[self.current].order
    }

    pub fn is_recording(&self) -> bool {
        let slot = &self.slots[self.current];
        slot.transfer_recording || slot.faces.iter().any(|f| f.state == FaceState::Recording)
    }

    /// The face buffer to record into, begun if needed. The flag is true
    /// when the buffer was begun by this call and holds no prior state.
    pub fn begin(&mut self, device: &dyn GpuDevice, face: Face) -> DeviceResult<(CommandBufferHandle, bool)> {
        let timeout = self.fence_timeout_ns;
        let slot = &mut self.slots[self.current];
        let buffer = &mut slot.faces[face.index()];
        match buffer.state {
            FaceState::Recording => return Ok((buffer.cmd, false)),
            FaceState::Submitted => wait_face(device, buffer, timeout)?,
            FaceState::Waiting => {}
        }
        device.begin_commands(buffer.cmd)?;
        // Order against whatever the previous submission of this context did.
        device.cmd_memory_barrier(buffer.cmd);
        buffer.state = FaceState::Recording;
        buffer.commands = 0;
        buffer.accesses.clear();
        let cmd = buffer.cmd;
        slot.order.push(face);
        Ok((cmd, true))
    }

    /// Whether recording `accesses` on `face` would run them ahead of
    /// conflicting work already recorded on a face submitted after it. A
    /// face that is not recording yet goes last and never conflicts.
    pub fn out_of_order(&self, face: Face, accesses: &[(Resource, Access)]) -> bool {
        let slot = &self.slots[self.current];
        let Some(position) = slot.order.iter().position(|f| *f == face) else {
            return false;
        };
        slot.order[position + 1..].iter().any(|later| {
            let recorded = &slot.faces[later.index()].accesses;
            accesses
                .iter()
                .any(|(resource, access)| recorded.iter().any(|(r, a)| r == resource && access.conflicts(*a)))
        })
    }

    /// Remember what `face` has touched since it was begun.
    pub fn note_accesses(&mut self, face: Face, accesses: &[(Resource, Access)]) {
        let recorded = &mut self.slots[self.current].faces[face.index()].accesses;
        for &(resource, access) in accesses {
            match recorded.iter_mut().find(|(r, _)| *r == resource) {
                Some(entry) => entry.1 = entry.1.merge(access),
                None => recorded.push((resource, access)),
            }
        }
    }

    pub fn add_commands(&mut self, face: Face, count: u32) {
        let buffer = &mut self.slots[self.current].faces[face.index()];
        buffer.commands = buffer.commands.saturating_add(count);
    }

    /// End and submit everything recorded in the current slot, then move to
    /// the next slot, waiting for its previous submissions. Returns the
    /// number of device submissions made.
    pub fn flush(&mut self, device: &dyn GpuDevice, submit_lock: &Mutex<()>, frame: u64) -> DeviceResult<usize> {
        if !self.is_recording() {
            return Ok(0);
        }
        let submissions = self.submit(device, submit_lock, frame)?;
        self.current = (self.current + 1) % self.slots.len();
        self.epoch += 1;
        self.wait_slot(device, self.current)?;
        Ok(submissions)
    }

    fn submit(&mut self, device: &dyn GpuDevice, submit_lock: &Mutex<()>, frame: u64) -> DeviceResult<usize> {
        let slot = &mut self.slots[self.current];

        let mut transfer = None;
        if slot.transfer_recording {
            device.cmd_memory_barrier(slot.transfer);
            device.end_commands(slot.transfer)?;
            slot.transfer_recording = false;
            transfer = Some(slot.transfer);
        }
        for face in slot.faces.iter().filter(|f| f.state == FaceState::Recording) {
            device.end_commands(face.cmd)?;
        }

        // Transfer work rides with the first face so it executes before any
        // draw of this slot.
        let _guard = submit_lock.lock();
        let mut submissions = 0;
        for face in std::mem::take(&mut slot.order) {
            let face = &mut slot.faces[face.index()];
            let mut buffers: SmallVec<[CommandBufferHandle; 2]> = SmallVec::new();
            buffers.extend(transfer.take());
            buffers.push(face.cmd);
            device.reset_fence(face.fence)?;
            device.submit(&buffers, face.fence)?;
            face.state = FaceState::Submitted;
            face.commands = 0;
            face.accesses.clear();
            submissions += 1;
        }
        if let Some(transfer) = transfer {
            let face = &mut slot.faces[Face::Compute.index()];
            device.reset_fence(face.fence)?;
            device.submit(&[transfer], face.fence)?;
            face.state = FaceState::Submitted;
            submissions += 1;
        }
        slot.submitted_frame = Some(frame);
        Ok(submissions)
    }

    fn wait_slot(&mut self, device: &dyn GpuDevice, index: usize) -> DeviceResult<()> {
        let timeout = self.fence_timeout_ns;
        let slot = &mut self.slots[index];
        for face in slot.faces.iter_mut().filter(|f| f.state == FaceState::Submitted) {
            wait_face(device, face, timeout)?;
        }
        slot.submitted_frame = None;
        Ok(())
    }

    /// Wait for every slot submitted at or before `frame`.
    pub fn wait_through(&mut self, device: &dyn GpuDevice, frame: u64) -> DeviceResult<()> {
        for index in 0..self.slots.len() {
            if self.slots[index].submitted_frame.is_some_and(|f| f <= frame) {
                self.wait_slot(device, index)?;
            }
        }
        Ok(())
    }

    /// Wait for every outstanding submission.
    pub fn wait_all(&mut self, device: &dyn GpuDevice) -> DeviceResult<()> {
        for index in 0..self.slots.len() {
            self.wait_slot(device, index)?;
        }
        Ok(())
    }

    /// Release fences and the command pool. The device must be idle.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for slot in self.slots.drain(..) {
            for face in slot.faces {
                device.destroy_fence(face.fence);
            }
        }
        device.destroy_command_pool(self.pool);
    }
}

fn wait_face(device: &dyn GpuDevice, face: &mut FaceBuffer, timeout_ns: u64) -> DeviceResult<()> {
    if !device.wait_fence(face.fence, timeout_ns)? {
        log::error!("Ring: fence {:?} not signaled after {} ns", face.fence, timeout_ns);
        return Err(DeviceError::FenceTimeout(timeout_ns));
    }
    face.state = FaceState::Waiting;
    Ok(())
}

impl TransferSink for CommandRing {
    fn transfer_commands(&mut self, device: &dyn GpuDevice) -> DeviceResult<CommandBufferHandle> {
        let slot = &mut self.slots[self.current];
        if !slot.transfer_recording {
            device.begin_commands(slot.transfer)?;
            slot.transfer_recording = true;
        }
        Ok(slot.transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferHandle, HeadlessDevice, ImageHandle, RecordedCommand};

    const TIMEOUT: u64 = 1_000_000;

    fn ring(device: &HeadlessDevice, slots: usize) -> CommandRing {
        CommandRing::new(device, slots, TIMEOUT).unwrap()
    }

    // ========================================================================
    // State machine
    // ========================================================================

    #[test]
    fn test_face_lifecycle() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 2);
        assert_eq!(ring.state(Face::CounterClockwise), FaceState::Waiting);

        let (cmd, fresh) = ring.begin(&device, Face::CounterClockwise).unwrap();
        assert!(fresh);
        assert_eq!(device.command_log(cmd), vec![RecordedCommand::MemoryBarrier]);
        assert_eq!(ring.state(Face::CounterClockwise), FaceState::Recording);
        let (again, fresh) = ring.begin(&device, Face::CounterClockwise).unwrap();
        assert_eq!(again, cmd);
        assert!(!fresh);

        ring.add_commands(Face::CounterClockwise, 5);
        assert_eq!(ring.recording_counts().as_slice(), &[5]);
        assert_eq!(ring.flush(&device, &lock, 1).unwrap(), 1);

        assert_eq!(ring.slot(), 1);
        assert_eq!(ring.epoch(), 1);
        assert_eq!(ring.state_at(0, Face::CounterClockwise), FaceState::Submitted);
        assert!(!ring.is_recording());
        assert_eq!(ring.flush(&device, &lock, 1).unwrap(), 0);
    }

    #[test]
    fn test_faces_submit_in_begin_order_with_transfer_first() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 2);
        let (cw, _) = ring.begin(&device, Face::Clockwise).unwrap();
        let (ccw, _) = ring.begin(&device, Face::CounterClockwise).unwrap();
        let (compute, _) = ring.begin(&device, Face::Compute).unwrap();
        let transfer = ring.transfer_commands(&device).unwrap();
        assert_eq!(
            ring.submission_order(),
            &[Face::Clockwise, Face::CounterClockwise, Face::Compute]
        );

        assert_eq!(ring.flush(&device, &lock, 1).unwrap(), 3);
        assert_eq!(device.submitted(), vec![vec![transfer, cw], vec![ccw], vec![compute]]);
        assert_eq!(device.command_log(transfer), vec![RecordedCommand::MemoryBarrier]);
        assert!(ring.submission_order().is_empty());
    }

    #[test]
    fn test_transfer_only_flush_uses_compute_fence() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 2);
        let transfer = ring.transfer_commands(&device).unwrap();
        assert!(ring.is_recording());
        assert_eq!(ring.flush(&device, &lock, 1).unwrap(), 1);
        assert_eq!(device.submitted(), vec![vec![transfer]]);
        assert_eq!(ring.state_at(0, Face::Compute), FaceState::Submitted);
    }

    #[test]
    fn test_returning_to_slot_waits_fences() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 2);
        for _ in 0..2 {
            ring.begin(&device, Face::Compute).unwrap();
            ring.flush(&device, &lock, 1).unwrap();
        }
        assert_eq!(ring.slot(), 0);
        assert_eq!(ring.state(Face::Compute), FaceState::Waiting);
        assert_eq!(ring.state_at(1, Face::Compute), FaceState::Submitted);

        ring.wait_all(&device).unwrap();
        assert_eq!(ring.state_at(1, Face::Compute), FaceState::Waiting);
    }

    #[test]
    fn test_wait_through_only_touches_old_frames() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 3);
        ring.begin(&device, Face::Compute).unwrap();
        ring.flush(&device, &lock, 1).unwrap();
        ring.begin(&device, Face::Compute).unwrap();
        ring.flush(&device, &lock, 2).unwrap();

        ring.wait_through(&device, 1).unwrap();
        assert_eq!(ring.state_at(0, Face::Compute), FaceState::Waiting);
        assert_eq!(ring.state_at(1, Face::Compute), FaceState::Submitted);
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    #[test]
    fn test_fence_timeout_is_fatal() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 2);
        device.set_hang(true);

        ring.begin(&device, Face::CounterClockwise).unwrap();
        ring.flush(&device, &lock, 1).unwrap();
        ring.begin(&device, Face::CounterClockwise).unwrap();
        let result = ring.flush(&device, &lock, 1);
        assert_eq!(result, Err(DeviceError::FenceTimeout(TIMEOUT)));
    }

    // ========================================================================
    // Issue order across faces
    // ========================================================================

    const IMAGE: Resource = Resource::Image(ImageHandle(40));

    #[test]
    fn test_access_conflicts() {
        assert!(!Access::Read.conflicts(Access::Read));
        assert!(!Access::Attachment.conflicts(Access::Attachment));
        assert!(Access::Read.conflicts(Access::Attachment));
        assert!(Access::Attachment.conflicts(Access::Read));
        assert!(Access::Write.conflicts(Access::Read));
        assert!(Access::Write.conflicts(Access::Write));
    }

    #[test]
    fn test_new_face_goes_last_without_conflict() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        ring.begin(&device, Face::Clockwise).unwrap();
        ring.note_accesses(Face::Clockwise, &[(IMAGE, Access::Write)]);
        assert!(!ring.out_of_order(Face::CounterClockwise, &[(IMAGE, Access::Read)]));
    }

    #[test]
    fn test_earlier_face_conflicts_with_later_work() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        ring.begin(&device, Face::Clockwise).unwrap();
        ring.note_accesses(Face::Clockwise, &[(IMAGE, Access::Attachment)]);
        ring.begin(&device, Face::CounterClockwise).unwrap();
        ring.note_accesses(Face::CounterClockwise, &[(IMAGE, Access::Read)]);

        assert!(ring.out_of_order(Face::Clockwise, &[(IMAGE, Access::Write)]));
        assert!(!ring.out_of_order(Face::Clockwise, &[(IMAGE, Access::Read)]));
        assert!(!ring.out_of_order(Face::Clockwise, &[(Resource::Buffer(BufferHandle(40)), Access::Write)]));
        // The last face in the order has nothing after it.
        assert!(!ring.out_of_order(Face::CounterClockwise, &[(IMAGE, Access::Write)]));
    }

    #[test]
    fn test_mixed_accesses_merge_to_write() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        ring.begin(&device, Face::Clockwise).unwrap();
        ring.begin(&device, Face::CounterClockwise).unwrap();
        ring.note_accesses(Face::CounterClockwise, &[(IMAGE, Access::Attachment)]);
        assert!(!ring.out_of_order(Face::Clockwise, &[(IMAGE, Access::Attachment)]));
        ring.note_accesses(Face::CounterClockwise, &[(IMAGE, Access::Read)]);
        assert!(ring.out_of_order(Face::Clockwise, &[(IMAGE, Access::Attachment)]));
    }

    #[test]
    fn test_submission_forgets_accesses() {
        let device = HeadlessDevice::new();
        let lock = Mutex::new(());
        let mut ring = ring(&device, 2);
        ring.begin(&device, Face::Clockwise).unwrap();
        ring.begin(&device, Face::CounterClockwise).unwrap();
        ring.note_accesses(Face::CounterClockwise, &[(IMAGE, Access::Write)]);
        ring.flush(&device, &lock, 1).unwrap();
        ring.begin(&device, Face::Compute).unwrap();
        ring.flush(&device, &lock, 1).unwrap();
        assert_eq!(ring.slot(), 0);

        ring.begin(&device, Face::Clockwise).unwrap();
        ring.begin(&device, Face::CounterClockwise).unwrap();
        assert!(!ring.out_of_order(Face::Clockwise, &[(IMAGE, Access::Write)]));
    }

    #[test]
    fn test_winding_selects_face() {
        assert_eq!(Face::for_winding(FrontFace::CounterClockwise), Face::CounterClockwise);
        assert_eq!(Face::for_winding(FrontFace::Clockwise).index(), 2);
    }
}
