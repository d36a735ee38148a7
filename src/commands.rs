use crate::device::{RenderDevice, Submission};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// A command buffer for blocking, out-of-frame work such as structure builds
/// and layout transitions. Each submission waits on its own fence before
/// returning, so the buffer is always free for the next one.
pub struct OneTimeCommands<D: RenderDevice> {
    device: Arc<D>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    timeout_ns: u64,
}

impl<D: RenderDevice> OneTimeCommands<D> {
    pub fn new(device: &Arc<D>, timeout_ns: u64) -> Result<Self> {
        let pool = device.create_command_pool()?;
        let command_buffer = match device.allocate_command_buffers(pool, 1) {
            Ok(buffers) => buffers[0],
            Err(err) => {
                device.destroy_command_pool(pool);
                return Err(err);
            }
        };
        let fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(err) => {
                device.destroy_command_pool(pool);
                return Err(err);
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            pool,
            command_buffer,
            fence,
            timeout_ns,
        })
    }

    /// Record with `record`, submit, and block until the queue has run it.
    pub fn submit_and_wait<R>(&self, record: impl FnOnce(&D, vk::CommandBuffer) -> R) -> Result<R> {
        let device = self.device.as_ref();
        device.reset_command_buffer(self.command_buffer)?;
        device.begin_command_buffer(self.command_buffer)?;
        let output = record(device, self.command_buffer);
        device.end_command_buffer(self.command_buffer)?;

        device.reset_fence(self.fence)?;
        device.queue_submit(&Submission {
            command_buffer: self.command_buffer,
            wait: None,
            signal: None,
            fence: self.fence,
        })?;
        device.wait_for_fence(self.fence, self.timeout_ns)?;

        Ok(output)
    }
}

impl<D: RenderDevice> Drop for OneTimeCommands<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
        // Frees the command buffer with it
        self.device.destroy_command_pool(self.pool);
    }
}
