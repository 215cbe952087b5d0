// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, plus the frame-in-flight
// counter that picks which slot a frame uses.

use anyhow::Result;
use ash::vk;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.create_fence(&fence_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Which frame-in-flight slot is current
#[derive(Debug, Clone, Copy)]
pub struct FrameCounter {
    index: usize,
    depth: usize,
}

impl FrameCounter {
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "frames in flight must be at least 1");
        Self { index: 0, depth }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.depth;
    }
}
