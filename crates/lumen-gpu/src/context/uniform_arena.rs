//! Linear uniform arena, one host-visible buffer per ring slot.
//!
//! Uniform blocks are appended at aligned offsets and bound through dynamic
//! offsets. A slot's buffer is only rewound after the ring has waited for
//! that slot's fences.

use crate::device::{BufferHandle, BufferUsage, DeviceResult, GpuDevice, MemoryLocation};

pub struct UniformArena {
    buffers: Vec<BufferHandle>,
    size: u64,
    alignment: u64,
    slot: usize,
    cursor: u64,
}

impl UniformArena {
    pub fn new(device: &dyn GpuDevice, slots: usize, size: u64, alignment: u64) -> DeviceResult<Self> {
        let buffers = (0..slots)
            .map(|slot| {
                device.create_buffer(
                    size,
                    BufferUsage::UNIFORM,
                    MemoryLocation::CpuToGpu,
                    &format!("lumen uniform arena {}", slot),
                )
            })
            .collect::<DeviceResult<Vec<_>>>()?;
        Ok(Self {
            buffers,
            size,
            alignment: alignment.max(16),
            slot: 0,
            cursor: 0,
        })
    }

    /// Start allocating from the beginning of `slot`'s buffer.
    pub fn reset(&mut self, slot: usize) {
        self.slot = slot;
        self.cursor = 0;
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffers[self.slot]
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Copy `bytes` into the arena. Returns the offset, or `None` when the
    /// current slot is full.
    pub fn push(&mut self, device: &dyn GpuDevice, bytes: &[u8]) -> DeviceResult<Option<u32>> {
        let offset = self.cursor.div_ceil(self.alignment) * self.alignment;
        let end = offset + bytes.len() as u64;
        if end > self.size {
            return Ok(None);
        }
        device.write_buffer(self.buffers[self.slot], offset, bytes)?;
        self.cursor = end;
        Ok(Some(offset as u32))
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for buffer in self.buffers.drain(..) {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;

    #[test]
    fn test_offsets_are_aligned() {
        let device = HeadlessDevice::new();
        let mut arena = UniformArena::new(&device, 2, 1024, 256).unwrap();
        assert_eq!(arena.push(&device, &[1; 32]).unwrap(), Some(0));
        assert_eq!(arena.push(&device, &[2; 16]).unwrap(), Some(256));
        assert_eq!(arena.used(), 272);
        let contents = device.buffer_contents(arena.buffer()).unwrap();
        assert_eq!(contents[256], 2);
    }

    #[test]
    fn test_full_slot_reports_none() {
        let device = HeadlessDevice::new();
        let mut arena = UniformArena::new(&device, 2, 512, 256).unwrap();
        assert!(arena.push(&device, &[0; 256]).unwrap().is_some());
        assert!(arena.push(&device, &[0; 256]).unwrap().is_some());
        assert_eq!(arena.push(&device, &[0; 16]).unwrap(), None);

        let first = arena.buffer();
        arena.reset(1);
        assert_ne!(arena.buffer(), first);
        assert_eq!(arena.push(&device, &[0; 16]).unwrap(), Some(0));
    }
}
