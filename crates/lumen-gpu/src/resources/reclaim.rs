//! Deferred destruction of GPU objects.
//!
//! Objects are retired with the frame index at which they were last
//! referenced. They are destroyed once every submission from that frame is
//! known to have completed: either the in-flight margin has passed (the
//! frame start waits on those fences) or a full sync point has drained the
//! queue.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::device::{BindingLayoutHandle, BufferHandle, GpuDevice, ImageHandle, PipelineHandle};

/// A GPU object waiting for destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retired {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Pipeline(PipelineHandle),
    BindingLayout(BindingLayoutHandle),
}

impl Retired {
    fn destroy(self, device: &dyn GpuDevice) {
        match self {
            Retired::Buffer(buffer) => device.destroy_buffer(buffer),
            Retired::Image(image) => device.destroy_image(image),
            Retired::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
            Retired::BindingLayout(layout) => device.destroy_binding_layout(layout),
        }
    }
}

/// Retired objects keyed by retirement frame.
#[derive(Default)]
pub struct ReclaimQueue {
    entries: Mutex<BTreeMap<u64, Vec<Retired>>>,
}

impl ReclaimQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&self, frame: u64, item: Retired) {
        self.entries.lock().entry(frame).or_default().push(item);
    }

    pub fn retire_all(&self, frame: u64, items: impl IntoIterator<Item = Retired>) {
        let mut entries = self.entries.lock();
        let list = entries.entry(frame).or_default();
        list.extend(items);
        if list.is_empty() {
            entries.remove(&frame);
        }
    }

    /// Destroy everything retired at or before `current - frames_in_flight`.
    /// Returns the number of objects destroyed.
    pub fn drain_ready(&self, device: &dyn GpuDevice, current: u64, frames_in_flight: u64) -> usize {
        let Some(limit) = current.checked_sub(frames_in_flight) else {
            return 0;
        };
        let ready: Vec<Retired> = {
            let mut entries = self.entries.lock();
            let later = entries.split_off(&(limit + 1));
            std::mem::replace(&mut *entries, later)
                .into_values()
                .flatten()
                .collect()
        };
        destroy_all(device, ready)
    }

    /// Destroy everything. Only valid after a full device sync.
    pub fn drain_all(&self, device: &dyn GpuDevice) -> usize {
        let ready: Vec<Retired> = std::mem::take(&mut *self.entries.lock())
            .into_values()
            .flatten()
            .collect();
        destroy_all(device, ready)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn destroy_all(device: &dyn GpuDevice, items: Vec<Retired>) -> usize {
    let count = items.len();
    for item in items {
        item.destroy(device);
    }
    if count > 0 {
        log::debug!("Reclaim: destroyed {} objects", count);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferUsage, HeadlessDevice, MemoryLocation};

    fn buffer(device: &HeadlessDevice) -> BufferHandle {
        device
            .create_buffer(16, BufferUsage::VERTEX, MemoryLocation::CpuToGpu, "test")
            .unwrap()
    }

    #[test]
    fn test_drain_respects_in_flight_margin() {
        let device = HeadlessDevice::new();
        let queue = ReclaimQueue::new();
        queue.retire(5, Retired::Buffer(buffer(&device)));
        queue.retire(6, Retired::Buffer(buffer(&device)));

        assert_eq!(queue.drain_ready(&device, 6, 2), 0);
        assert_eq!(queue.drain_ready(&device, 7, 2), 1);
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain_ready(&device, 8, 2), 1);
        assert!(queue.is_empty());
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_early_frames_never_underflow() {
        let device = HeadlessDevice::new();
        let queue = ReclaimQueue::new();
        queue.retire(0, Retired::Buffer(buffer(&device)));
        assert_eq!(queue.drain_ready(&device, 1, 2), 0);
        assert_eq!(queue.drain_ready(&device, 2, 2), 1);
    }

    #[test]
    fn test_drain_all_after_sync() {
        let device = HeadlessDevice::new();
        let queue = ReclaimQueue::new();
        queue.retire_all(10, [Retired::Buffer(buffer(&device)), Retired::Buffer(buffer(&device))]);
        queue.retire_all(11, []);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_all(&device), 2);
        assert_eq!(device.live_buffers(), 0);
    }
}
