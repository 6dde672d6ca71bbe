//! Logical buffers backed by pools of physical allocations.
//!
//! Each upload picks the smallest idle allocation that fits the data,
//! searching upward from its power-of-two bucket and skipping any allocation
//! touched within the in-flight margin, so work already recorded against
//! older contents is never overwritten. Host
//! memory is written in place; device-local memory is filled through a
//! staging buffer and a copy recorded on the context's transfer commands.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use slotmap::{new_key_type, SlotMap};

use super::reclaim::{ReclaimQueue, Retired};
use super::{bucket_size, TransferSink};
use crate::device::{BufferHandle, BufferUsage, GpuDevice, MemoryLocation};
use crate::error::{RenderError, RenderResult};

new_key_type! {
    pub struct BufferId;
}

/// Every physical allocation can serve as any kind of buffer.
const ALLOCATION_USAGE: BufferUsage = BufferUsage::VERTEX
    .union(BufferUsage::INDEX)
    .union(BufferUsage::STORAGE)
    .union(BufferUsage::TRANSFER_DST);

#[derive(Debug, Clone, Copy)]
struct Allocation {
    handle: BufferHandle,
    last_used: u64,
}

/// A physical allocation resolved for recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBuffer {
    pub handle: BufferHandle,
    /// Bytes written by the last upload.
    pub len: u64,
}

#[derive(Debug)]
struct LogicalBuffer {
    gpu_resident: bool,
    shared: bool,
    buckets: BTreeMap<u64, Vec<Allocation>>,
    current: Option<BufferHandle>,
    len: u64,
    owner: Option<usize>,
    warned: bool,
    last_gc: u64,
}

impl LogicalBuffer {
    fn new(gpu_resident: bool, shared: bool) -> Self {
        Self {
            gpu_resident,
            shared,
            buckets: BTreeMap::new(),
            current: None,
            len: 0,
            owner: None,
            warned: false,
            last_gc: 0,
        }
    }

    fn allocation_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn touch(&mut self, handle: BufferHandle, frame: u64) {
        if let Some(allocation) = self
            .buckets
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|a| a.handle == handle)
        {
            allocation.last_used = allocation.last_used.max(frame);
        }
    }

    fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.buckets.values().flatten().map(|a| a.handle)
    }

    /// Free allocations unused for `interval` frames. Runs at most once per
    /// interval and only when there is something besides the current one.
    fn collect(&mut self, frame: u64, interval: u64) -> Vec<Retired> {
        if self.allocation_count() <= 1 || frame < self.last_gc + interval {
            return Vec::new();
        }
        self.last_gc = frame;

        let current = self.current;
        let mut freed = Vec::new();
        for list in self.buckets.values_mut() {
            list.retain(|a| {
                let stale = Some(a.handle) != current && a.last_used + interval <= frame;
                if stale {
                    freed.push(Retired::Buffer(a.handle));
                }
                !stale
            });
        }
        self.buckets.retain(|_, list| !list.is_empty());
        freed
    }
}

/// Pool of logical buffers shared by every render context.
pub struct BufferPool {
    buffers: RwLock<SlotMap<BufferId, Mutex<LogicalBuffer>>>,
    frames_in_flight: u64,
    gc_interval: u64,
    unified_memory: bool,
}

impl BufferPool {
    pub fn new(frames_in_flight: u64, gc_interval: u64, unified_memory: bool) -> Self {
        Self {
            buffers: RwLock::new(SlotMap::with_key()),
            frames_in_flight,
            gc_interval,
            unified_memory,
        }
    }

    /// Create `count` logical buffers. No memory is allocated until upload.
    pub fn create(&self, count: usize, gpu_resident: bool, shared: bool) -> Vec<BufferId> {
        let mut buffers = self.buffers.write();
        (0..count)
            .map(|_| buffers.insert(Mutex::new(LogicalBuffer::new(gpu_resident, shared))))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical allocations currently owned by `id`.
    pub fn allocation_count(&self, id: BufferId) -> usize {
        self.buffers
            .read()
            .get(id)
            .map_or(0, |b| b.lock().allocation_count())
    }

    /// Replace the contents of `id` with `bytes`. Returns the allocation
    /// that now holds them.
    #[allow(clippy::too_many_arguments)]
    pub fn upload(
        &self,
        device: &dyn GpuDevice,
        id: BufferId,
        bytes: &[u8],
        frame: u64,
        context: usize,
        sink: &mut dyn TransferSink,
        reclaim: &ReclaimQueue,
    ) -> RenderResult<BufferHandle> {
        let buffers = self.buffers.read();
        let Some(cell) = buffers.get(id) else {
            log::warn!("Buffer: upload to unknown buffer {:?}", id);
            return Err(RenderError::ResourceNotFound(format!("buffer {:?}", id)));
        };
        let mut buffer = cell.lock();

        let size = bytes.len() as u64;
        let bucket = bucket_size(size);
        let margin = self.frames_in_flight;
        let reusable = buffer
            .buckets
            .range(bucket..)
            .find_map(|(_, list)| list.iter().find(|a| a.last_used + margin <= frame))
            .map(|a| a.handle);

        let handle = match reusable {
            Some(handle) => handle,
            None => {
                let location = if buffer.gpu_resident {
                    MemoryLocation::GpuOnly
                } else {
                    MemoryLocation::CpuToGpu
                };
                let handle = device.create_buffer(bucket, ALLOCATION_USAGE, location, "lumen buffer")?;
                buffer.buckets.entry(bucket).or_default().push(Allocation {
                    handle,
                    last_used: frame,
                });
                handle
            }
        };

        if !bytes.is_empty() {
            if !buffer.gpu_resident || self.unified_memory {
                device.write_buffer(handle, 0, bytes)?;
            } else {
                let staging =
                    device.create_buffer(size, BufferUsage::TRANSFER_SRC, MemoryLocation::CpuToGpu, "lumen staging")?;
                reclaim.retire(frame, Retired::Buffer(staging));
                device.write_buffer(staging, 0, bytes)?;
                let cmd = sink.transfer_commands(device)?;
                device.cmd_copy_buffer(cmd, staging, handle, size);
            }
        }

        buffer.touch(handle, frame);
        buffer.current = Some(handle);
        buffer.len = size;
        buffer.owner = Some(context);

        let freed = buffer.collect(frame, self.gc_interval);
        if !freed.is_empty() {
            log::debug!("Buffer: freed {} stale allocations of {:?}", freed.len(), id);
            reclaim.retire_all(frame, freed);
        }
        Ok(handle)
    }

    /// The allocation holding the latest contents of `id`, marked as used
    /// this frame. `None` if the buffer does not exist or was never uploaded.
    pub fn resolve(&self, id: BufferId, frame: u64, context: usize) -> Option<ResolvedBuffer> {
        let buffers = self.buffers.read();
        let mut buffer = buffers.get(id)?.lock();
        let handle = buffer.current?;
        if !buffer.shared && !buffer.warned && buffer.owner.is_some_and(|owner| owner != context) {
            log::warn!(
                "Buffer: {:?} uploaded on context {:?} is read on context {} without being shared",
                id,
                buffer.owner,
                context
            );
            buffer.warned = true;
        }
        buffer.touch(handle, frame);
        Some(ResolvedBuffer {
            handle,
            len: buffer.len,
        })
    }

    /// Remove buffers and retire all their allocations. Returns how many of
    /// `ids` existed.
    pub fn dispose(&self, ids: &[BufferId], frame: u64, reclaim: &ReclaimQueue) -> usize {
        let mut buffers = self.buffers.write();
        let mut removed = 0;
        for id in ids {
            match buffers.remove(*id) {
                Some(cell) => {
                    let buffer = cell.into_inner();
                    reclaim.retire_all(frame, buffer.handles().map(Retired::Buffer).collect::<Vec<_>>());
                    removed += 1;
                }
                None => log::warn!("Buffer: dispose of unknown buffer {:?}", id),
            }
        }
        removed
    }

    /// Destroy every allocation immediately. Only valid after a full sync.
    pub fn destroy_all(&self, device: &dyn GpuDevice) {
        let buffers = std::mem::take(&mut *self.buffers.write());
        for (_, cell) in buffers {
            for handle in cell.into_inner().handles() {
                device.destroy_buffer(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HeadlessDevice, RecordedCommand};
    use crate::resources::testing::RecordingSink;

    fn pool() -> BufferPool {
        BufferPool::new(2, 60, false)
    }

    // ========================================================================
    // Upload paths
    // ========================================================================

    #[test]
    fn test_host_visible_upload_writes_in_place() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();

        let handle = pool
            .upload(&device, id, &[1, 2, 3, 4], 1, 0, &mut sink, &reclaim)
            .unwrap();
        assert!(sink.cmd.is_none());
        assert_eq!(&device.buffer_contents(handle).unwrap()[..4], &[1, 2, 3, 4]);
        assert_eq!(device.buffer_contents(handle).unwrap().len(), 256);
        assert_eq!(pool.resolve(id, 1, 0).unwrap().len, 4);
    }

    #[test]
    fn test_device_local_upload_is_staged() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, true, false)[0];
        let mut sink = RecordingSink::new();

        let handle = pool.upload(&device, id, &[9; 300], 1, 0, &mut sink, &reclaim).unwrap();
        assert_eq!(device.buffer_location(handle), Some(MemoryLocation::GpuOnly));
        let cmd = sink.cmd.unwrap();
        let log = device.command_log(cmd);
        assert!(matches!(log[0], RecordedCommand::CopyBuffer { dst, size: 300, .. } if dst == handle));
        assert_eq!(reclaim.len(), 1);

        device.end_commands(cmd).unwrap();
        device.submit(&[cmd], crate::device::FenceHandle::NULL).unwrap();
        assert_eq!(&device.buffer_contents(handle).unwrap()[..300], &[9; 300][..]);
    }

    #[test]
    fn test_unified_memory_skips_staging() {
        let device = HeadlessDevice::new().with_unified_memory();
        let reclaim = ReclaimQueue::new();
        let pool = BufferPool::new(2, 60, true);
        let id = pool.create(1, true, false)[0];
        let mut sink = RecordingSink::new();
        pool.upload(&device, id, &[5; 8], 1, 0, &mut sink, &reclaim).unwrap();
        assert!(sink.cmd.is_none());
        assert!(reclaim.is_empty());
    }

    #[test]
    fn test_unknown_buffer_is_not_found() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        pool.dispose(&[id], 1, &reclaim);
        let result = pool.upload(&device, id, &[1], 1, 0, &mut RecordingSink::new(), &reclaim);
        assert!(matches!(result, Err(RenderError::ResourceNotFound(_))));
        assert!(pool.resolve(id, 1, 0).is_none());
    }

    // ========================================================================
    // Reuse safety
    // ========================================================================

    #[test]
    fn test_allocation_not_reused_within_margin() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();

        let a = pool.upload(&device, id, &[1; 16], 1, 0, &mut sink, &reclaim).unwrap();
        let b = pool.upload(&device, id, &[2; 16], 1, 0, &mut sink, &reclaim).unwrap();
        let c = pool.upload(&device, id, &[3; 16], 2, 0, &mut sink, &reclaim).unwrap();
        assert_ne!(a, b);
        assert_ne!(c, a);
        assert_ne!(c, b);

        // `a` was last used in frame 1; with a margin of 2 it is free at frame 3.
        let d = pool.upload(&device, id, &[4; 16], 3, 0, &mut sink, &reclaim).unwrap();
        assert_eq!(d, a);
        assert_eq!(pool.allocation_count(id), 3);
    }

    #[test]
    fn test_draw_use_extends_lifetime() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();

        let a = pool.upload(&device, id, &[1; 16], 1, 0, &mut sink, &reclaim).unwrap();
        pool.resolve(id, 4, 0);
        let b = pool.upload(&device, id, &[2; 16], 5, 0, &mut sink, &reclaim).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_smaller_upload_reuses_larger_idle_allocation() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();

        let large = pool.upload(&device, id, &[1; 1024], 1, 0, &mut sink, &reclaim).unwrap();
        let created = HeadlessDevice::count(&device.counters.buffers_created);
        let small = pool.upload(&device, id, &[2; 512], 3, 0, &mut sink, &reclaim).unwrap();
        assert_eq!(small, large);
        assert_eq!(HeadlessDevice::count(&device.counters.buffers_created), created);
        assert_eq!(pool.resolve(id, 3, 0).unwrap().len, 512);
        assert_eq!(&device.buffer_contents(small).unwrap()[..512], &[2; 512][..]);
    }

    #[test]
    fn test_busy_larger_allocation_is_not_reused() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();

        let large = pool.upload(&device, id, &[1; 1024], 1, 0, &mut sink, &reclaim).unwrap();
        let small = pool.upload(&device, id, &[2; 512], 2, 0, &mut sink, &reclaim).unwrap();
        assert_ne!(small, large);
        assert_eq!(device.buffer_contents(small).unwrap().len(), 512);
    }

    #[test]
    fn test_sizes_use_separate_buckets() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();
        pool.upload(&device, id, &[0; 100], 1, 0, &mut sink, &reclaim).unwrap();
        let big = pool.upload(&device, id, &[0; 1000], 10, 0, &mut sink, &reclaim).unwrap();
        assert_eq!(device.buffer_contents(big).unwrap().len(), 1024);
        assert_eq!(pool.allocation_count(id), 2);
    }

    // ========================================================================
    // Collection and disposal
    // ========================================================================

    #[test]
    fn test_stale_allocations_are_collected() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = BufferPool::new(2, 10, false);
        let id = pool.create(1, false, false)[0];
        let mut sink = RecordingSink::new();

        pool.upload(&device, id, &[0; 16], 1, 0, &mut sink, &reclaim).unwrap();
        pool.upload(&device, id, &[0; 16], 1, 0, &mut sink, &reclaim).unwrap();
        assert_eq!(pool.allocation_count(id), 2);

        let current = pool.upload(&device, id, &[0; 2000], 20, 0, &mut sink, &reclaim).unwrap();
        assert_eq!(pool.allocation_count(id), 1);
        assert_eq!(reclaim.len(), 2);
        assert_eq!(pool.resolve(id, 20, 0).unwrap().handle, current);
    }

    #[test]
    fn test_dispose_retires_every_allocation() {
        let device = HeadlessDevice::new();
        let reclaim = ReclaimQueue::new();
        let pool = pool();
        let ids = pool.create(2, false, true);
        let mut sink = RecordingSink::new();
        pool.upload(&device, ids[0], &[0; 16], 1, 0, &mut sink, &reclaim).unwrap();
        pool.upload(&device, ids[0], &[0; 16], 1, 0, &mut sink, &reclaim).unwrap();

        assert_eq!(pool.dispose(&ids, 1, &reclaim), 2);
        assert_eq!(reclaim.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(device.live_buffers(), 2);
        reclaim.drain_all(&device);
        assert_eq!(device.live_buffers(), 0);
    }
}
