// GPU buffers and images backed by gpu-allocator
//
// Owners destroy these explicitly (no Drop) because destruction needs the device,
// and the device must outlive every allocation.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use super::device::GraphicsDevice;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Allocation,
}

impl GpuBuffer {
    pub fn new(
        device: &GraphicsDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.logical.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;
        let requirements = unsafe { device.logical.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .logical
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .with_context(|| format!("Failed to bind memory for buffer '{}'", name))?;
        }

        Ok(Self {
            buffer,
            size,
            allocation,
        })
    }

    /// Device-local buffer filled through a staging copy and an immediate submit
    pub fn upload(
        device: &GraphicsDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let size = bytes.len() as vk::DeviceSize;
        let mut staging = Self::new(
            device,
            "staging",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write(0, bytes);

        let target = Self::new(
            device,
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let copied = device.immediate_submit(|logical, cmd| unsafe {
            let region = vk::BufferCopy::builder().size(size).build();
            logical.cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
        });
        staging.destroy(device);
        copied?;

        Ok(target)
    }

    /// Copy `bytes` into a host-visible buffer
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        let mapped = self
            .allocation
            .mapped_slice_mut()
            .expect("buffer is not host visible");
        mapped[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn destroy(self, device: &GraphicsDevice) {
        unsafe { device.logical.destroy_buffer(self.buffer, None) };
        device.free(self.allocation);
    }
}

pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Allocation,
}

impl GpuImage {
    /// 2D single-mip image plus a view over it
    pub fn new(
        device: &GraphicsDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.logical.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;
        let requirements = unsafe { device.logical.get_image_memory_requirements(image) };

        let allocation = device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .logical
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .with_context(|| format!("Failed to bind memory for image '{}'", name))?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.logical.create_image_view(&view_info, None) }
            .with_context(|| format!("Failed to create view for image '{}'", name))?;

        Ok(Self {
            image,
            view,
            format,
            extent,
            allocation,
        })
    }

    pub fn new_depth(device: &GraphicsDevice, extent: vk::Extent2D) -> Result<Self> {
        Self::new(
            device,
            "depth",
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
    }

    pub fn destroy(self, device: &GraphicsDevice) {
        unsafe {
            device.logical.destroy_image_view(self.view, None);
            device.logical.destroy_image(self.image, None);
        }
        device.free(self.allocation);
    }
}
