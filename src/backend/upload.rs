// Upload context - synchronous one-shot GPU work
//
// One command pool + one fence on the shared graphics queue. Only one immediate
// submission is ever in flight: callers are serialised by `lock`, and the queue
// itself is guarded by the shared submit mutex.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

struct UploadState {
    command_pool: vk::CommandPool,
    fence: vk::Fence,
}

pub struct UploadContext {
    state: Mutex<UploadState>,
    queue: vk::Queue,
    queue_lock: Arc<Mutex<()>>,
}

impl UploadContext {
    pub fn new(
        device: &ash::Device,
        queue_family: u32,
        queue: vk::Queue,
        queue_lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create upload command pool")?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }
            .context("Failed to create upload fence")?;

        Ok(Self {
            state: Mutex::new(UploadState { command_pool, fence }),
            queue,
            queue_lock,
        })
    }

    /// Record with `record` and block until the GPU has executed it.
    ///
    /// Safe to call from worker threads; concurrent callers run one after another.
    pub fn immediate_submit<F>(&self, device: &ash::Device, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let state = self.state.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(state.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate upload command buffer")?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let command_buffers = [cmd];
        // Every failure falls through to the free below
        let submitted = unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|_| {
                    record(device, cmd);
                    device.end_command_buffer(cmd)
                })
                .and_then(|_| {
                    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                    let _queue_guard = self.queue_lock.lock();
                    device.queue_submit(self.queue, &[submit_info.build()], state.fence)
                })
                .and_then(|_| device.wait_for_fences(&[state.fence], true, u64::MAX))
                .and_then(|_| device.reset_fences(&[state.fence]))
        };

        unsafe { device.free_command_buffers(state.command_pool, &[cmd]) };

        submitted.context("Immediate submit failed")
    }

    pub fn destroy(&self, device: &ash::Device) {
        let state = self.state.lock();
        unsafe {
            device.destroy_fence(state.fence, None);
            device.destroy_command_pool(state.command_pool, None);
        }
    }
}
