// Swapchain - Window presentation
//
// The chain of images a surface cycles through. Recreated wholesale on resize
// or when acquire/present reports it stale; the old handle is passed along so
// the driver can recycle its images.

use anyhow::{Context, Result};
use ash::vk;

use super::queue::QueueFamilyIndices;
use crate::config::GraphicsSettings;

/// Outcome of acquire/present that the caller must react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Still usable this frame, recreate afterwards
    Suboptimal,
    /// Unusable, recreate before the next frame
    OutOfDate,
}

impl PresentStatus {
    fn from_suboptimal(suboptimal: bool) -> Self {
        if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Optimal
        }
    }
}

/// Surface queries the swapchain is configured from
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        surface_loader: &ash::extensions::khr::Surface,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical, surface)
                    .context("Failed to query surface capabilities")?,
                formats: surface_loader.get_physical_device_surface_formats(physical, surface)?,
                present_modes: surface_loader.get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    /// BGRA8 sRGB when offered, otherwise whatever the surface lists first
    pub fn choose_format(&self) -> Option<vk::SurfaceFormatKHR> {
        self.formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| self.formats.first())
            .copied()
    }

    /// The surface's fixed extent, or the window size clamped to the allowed range
    pub fn choose_extent(&self, width: u32, height: u32) -> vk::Extent2D {
        let caps = &self.capabilities;
        if caps.current_extent.width != u32::MAX {
            return caps.current_extent;
        }
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }

    /// One more than the minimum so acquire rarely blocks; 0 max means unbounded
    pub fn choose_image_count(&self) -> u32 {
        let caps = &self.capabilities;
        let wanted = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            wanted.min(caps.max_image_count)
        } else {
            wanted
        }
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// `old_swapchain` is null on first creation. The caller still destroys the old one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        families: QueueFamilyIndices,
        settings: &GraphicsSettings,
        width: u32,
        height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let support = SurfaceSupport::query(surface_loader, physical_device, surface)?;

        let surface_format = support.choose_format().context("Surface reports no formats")?;
        let present_mode = settings.choose_present_mode(&support.present_modes);
        let extent = support.choose_extent(width, height);
        let image_count = support.choose_image_count();
        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        // Separate present family: share images instead of transferring ownership
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, shared_families): (_, &[u32]) = if families.is_unified() {
            (vk::SharingMode::EXCLUSIVE, &[])
        } else {
            (vk::SharingMode::CONCURRENT, &family_indices)
        };

        let swapchain_loader = ash::extensions::khr::Swapchain::new(instance, device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let mut chain = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
        };
        if let Err(e) = chain.create_views(device) {
            chain.destroy(device);
            return Err(e);
        }
        Ok(chain)
    }

    fn create_views(&mut self, device: &ash::Device) -> Result<()> {
        self.images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }?;
        for &image in &self.images {
            self.image_views.push(create_color_view(device, image, self.format)?);
        }
        Ok(())
    }

    /// Acquire next image for rendering; `None` when the swapchain is out of date
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Option<(u32, PresentStatus)>> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(Some((index, PresentStatus::from_suboptimal(suboptimal)))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(PresentStatus::from_suboptimal(suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn create_color_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }.context("Failed to create swapchain image view")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn support(current: (u32, u32), min_images: u32, max_images: u32) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                current_extent: vk::Extent2D {
                    width: current.0,
                    height: current.1,
                },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                min_image_count: min_images,
                max_image_count: max_images,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    #[test]
    fn prefers_srgb_format() {
        let s = support((1280, 720), 2, 3);
        assert_eq!(s.choose_format().unwrap().format, vk::Format::B8G8R8A8_SRGB);

        let only_unorm = SurfaceSupport {
            formats: vec![s.formats[0]],
            ..s
        };
        assert_eq!(only_unorm.choose_format().unwrap().format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn no_formats_is_none() {
        let s = SurfaceSupport {
            formats: Vec::new(),
            ..support((1280, 720), 2, 3)
        };
        assert!(s.choose_format().is_none());
    }

    #[test]
    fn fixed_extent_wins_over_window_size() {
        let s = support((1280, 720), 2, 3);
        assert_eq!(s.choose_extent(800, 600), vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn free_extent_is_clamped() {
        let s = support((u32::MAX, u32::MAX), 2, 3);
        assert_eq!(s.choose_extent(800, 600), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(s.choose_extent(9000, 0), vk::Extent2D { width: 4096, height: 1 });
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(support((1, 1), 2, 0).choose_image_count(), 3);
        assert_eq!(support((1, 1), 2, 8).choose_image_count(), 3);
        assert_eq!(support((1, 1), 3, 3).choose_image_count(), 3);
    }
}
