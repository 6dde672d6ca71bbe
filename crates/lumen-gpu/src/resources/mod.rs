//! GPU resource pools: buffers, textures and render targets, and the
//! deferred-destruction queue they retire into.

pub mod buffer;
pub mod reclaim;
pub mod texture;

use crate::device::{CommandBufferHandle, DeviceResult, GpuDevice};

/// Destination for device-side copies that must run before the next batch
/// of recorded work.
pub trait TransferSink {
    /// The command buffer transfer work is appended to, begun on first use.
    fn transfer_commands(&mut self, device: &dyn GpuDevice) -> DeviceResult<CommandBufferHandle>;
}

/// Power-of-two allocation size with a 256-byte floor.
pub fn bucket_size(size: u64) -> u64 {
    size.max(256).next_power_of_two()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A transfer sink that records into one command buffer.
    pub struct RecordingSink {
        pub cmd: Option<CommandBufferHandle>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self { cmd: None }
        }
    }

    impl TransferSink for RecordingSink {
        fn transfer_commands(&mut self, device: &dyn GpuDevice) -> DeviceResult<CommandBufferHandle> {
            if let Some(cmd) = self.cmd {
                return Ok(cmd);
            }
            let pool = device.create_command_pool()?;
            let cmd = device.allocate_command_buffer(pool)?;
            device.begin_commands(cmd)?;
            self.cmd = Some(cmd);
            Ok(cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_sizes() {
        assert_eq!(bucket_size(0), 256);
        assert_eq!(bucket_size(256), 256);
        assert_eq!(bucket_size(257), 512);
        assert_eq!(bucket_size(5000), 8192);
    }
}
