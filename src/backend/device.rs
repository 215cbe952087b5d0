// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - DeviceManager: instance ownership and the device state machine
// - Physical device selection (deferred until the first surface exists)
// - Logical device + per-family queue pools
// - Upload context, memory allocator, standard samplers, pipeline cache
//
// Exactly one logical device is created per manager, chosen for the first
// surface. Later surfaces must agree on queue families (asserted).

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::CStr;
use std::path::PathBuf;
use std::sync::Arc;

use super::instance::VulkanInstance;
use super::pipeline::{create_globals_set_layout, create_pipeline_layout};
use super::pipeline_cache::{DeviceIdentity, PipelineCacheBlob};
use super::queue::{QueueFamilyIndices, QueueLease, QueuePool};
use super::upload::UploadContext;
use crate::config::{Config, TextureFilter};

enum DeviceState {
    /// Instance exists, no physical device picked yet
    Initialized,
    /// Device created for the first surface
    Ready(Arc<GraphicsDevice>),
    Destroyed,
}

/// Owns the Vulkan instance and, after the first lease, the one logical device.
///
/// Constructed once by the application and passed to every surface.
pub struct DeviceManager {
    state: DeviceState,
    queues_per_family: u32,
    pipeline_cache_dir: PathBuf,
    instance: Arc<VulkanInstance>,
}

impl DeviceManager {
    /// Create the instance; the device itself waits for `acquire_queue_lease`
    pub fn init(config: &Config, display: RawDisplayHandle) -> Result<Self> {
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let instance = VulkanInstance::new(&config.window.title, display, enable_validation)?;

        Ok(Self {
            state: DeviceState::Initialized,
            queues_per_family: config.graphics.queues_per_family.max(1),
            pipeline_cache_dir: config.cache.pipeline_dir(),
            instance,
        })
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    /// The logical device. Panics before the first lease.
    pub fn device(&self) -> &Arc<GraphicsDevice> {
        match &self.state {
            DeviceState::Ready(device) => device,
            DeviceState::Initialized => panic!("no device yet: acquire a queue lease first"),
            DeviceState::Destroyed => panic!("device manager has been shut down"),
        }
    }

    /// Lease queues for `surface`, creating the device on the first call.
    ///
    /// Panics if `surface` needs different queue families than the device was built with.
    pub fn acquire_queue_lease(&mut self, surface: vk::SurfaceKHR) -> Result<QueueLease> {
        if let DeviceState::Initialized = self.state {
            let device = GraphicsDevice::new(
                self.instance.clone(),
                surface,
                self.queues_per_family,
                &self.pipeline_cache_dir,
            )?;
            self.state = DeviceState::Ready(Arc::new(device));
        }

        let device = match &self.state {
            DeviceState::Ready(device) => device,
            DeviceState::Initialized => unreachable!(),
            DeviceState::Destroyed => panic!("acquire_queue_lease after shutdown"),
        };

        let derived = derive_queue_families(&self.instance, device.physical, surface)?
            .context("Surface cannot be presented from this device")?;
        QueueFamilyIndices::assert_compatible(&device.families, &derived);

        let lease = device.queue_pool.lock().acquire();
        log::info!("Leased queues for surface: {:?}", lease);
        Ok(lease)
    }

    pub fn release_queue_lease(&self, lease: QueueLease) {
        self.device().release_queue_lease(lease);
    }

    /// Tear the device down. Every surface must be dropped first.
    pub fn shutdown(&mut self) {
        match std::mem::replace(&mut self.state, DeviceState::Destroyed) {
            DeviceState::Ready(device) => {
                let device = Arc::try_unwrap(device)
                    .unwrap_or_else(|_| panic!("device shutdown while surfaces still hold it"));
                drop(device);
            }
            DeviceState::Initialized => {}
            DeviceState::Destroyed => panic!("device manager shut down twice"),
        }
        log::info!("Device manager shut down");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if !matches!(self.state, DeviceState::Destroyed) {
            if std::thread::panicking() {
                return;
            }
            self.shutdown();
        }
    }
}

struct StandardSamplers {
    nearest: vk::Sampler,
    linear: vk::Sampler,
    anisotropic: vk::Sampler,
}

/// The logical device and everything hanging off it
pub struct GraphicsDevice {
    pub logical: ash::Device,
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub families: QueueFamilyIndices,

    queue_pool: Mutex<QueuePool>,
    upload: UploadContext,
    allocator: Mutex<Option<Allocator>>,
    samplers: StandardSamplers,
    ui_descriptor_pool: vk::DescriptorPool,
    globals_set_layout: vk::DescriptorSetLayout,
    /// Layout every pipeline is compatible with, for binding globals and push constants
    pipeline_layout: vk::PipelineLayout,
    pipeline_cache: vk::PipelineCache,
    pipeline_cache_blob: PipelineCacheBlob,

    pub instance: Arc<VulkanInstance>,
}

impl GraphicsDevice {
    fn new(
        instance: Arc<VulkanInstance>,
        surface: vk::SurfaceKHR,
        queues_per_family: u32,
        pipeline_cache_dir: &std::path::Path,
    ) -> Result<Self> {
        let (physical, families) = pick_physical_device(&instance, surface)?;

        let properties = unsafe { instance.instance.get_physical_device_properties(physical) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Queue families: graphics={} present={}", families.graphics, families.present);

        let (logical, pool) = create_logical_device(&instance, physical, families, queues_per_family)?;

        let (upload_queue, upload_lock) = pool.shared_graphics();
        let upload = UploadContext::new(&logical, families.graphics, upload_queue, upload_lock)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: logical.clone(),
            physical_device: physical,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        let features = unsafe { instance.instance.get_physical_device_features(physical) };
        let samplers = create_samplers(&logical, &properties, features.sampler_anisotropy == vk::TRUE)?;
        let ui_descriptor_pool = create_ui_descriptor_pool(&logical)?;
        let globals_set_layout = create_globals_set_layout(&logical)?;
        let pipeline_layout = create_pipeline_layout(&logical, globals_set_layout)?;

        let pipeline_cache_blob =
            PipelineCacheBlob::load(pipeline_cache_dir, DeviceIdentity::from_properties(&properties));
        let pipeline_cache = pipeline_cache_blob.create_cache(&logical)?;

        Ok(Self {
            logical,
            physical,
            properties,
            families,
            queue_pool: Mutex::new(pool),
            upload,
            allocator: Mutex::new(Some(allocator)),
            samplers,
            ui_descriptor_pool,
            globals_set_layout,
            pipeline_layout,
            pipeline_cache,
            pipeline_cache_blob,
            instance,
        })
    }

    pub fn release_queue_lease(&self, lease: QueueLease) {
        self.queue_pool.lock().release(lease);
    }

    /// Synchronous one-shot GPU work; callable from any thread
    pub fn immediate_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.upload.immediate_submit(&self.logical, record)
    }

    pub fn allocate(&self, desc: &AllocationCreateDesc) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().expect("allocator used after teardown");
        allocator
            .allocate(desc)
            .with_context(|| format!("Failed to allocate memory for '{}'", desc.name))
    }

    pub fn free(&self, allocation: Allocation) {
        let mut allocator = self.allocator.lock();
        if let Some(allocator) = allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free allocation: {}", e);
            }
        }
    }

    pub fn sampler(&self, filter: TextureFilter) -> vk::Sampler {
        match filter {
            TextureFilter::Nearest => self.samplers.nearest,
            TextureFilter::Linear => self.samplers.linear,
            TextureFilter::Anisotropic => self.samplers.anisotropic,
        }
    }

    /// Descriptor pool reserved for an overlay UI integration
    pub fn ui_descriptor_pool(&self) -> vk::DescriptorPool {
        self.ui_descriptor_pool
    }

    pub fn globals_set_layout(&self) -> vk::DescriptorSetLayout {
        self.globals_set_layout
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    pub fn pipeline_cache_blob(&self) -> &PipelineCacheBlob {
        &self.pipeline_cache_blob
    }

    pub fn min_uniform_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.logical.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        if let Err(e) = self.pipeline_cache_blob.save(&self.logical, self.pipeline_cache) {
            log::error!("Failed to save pipeline cache: {:?}", e);
        }

        // Reverse order of construction
        unsafe {
            self.logical.destroy_pipeline_cache(self.pipeline_cache, None);
            self.logical.destroy_pipeline_layout(self.pipeline_layout, None);
            self.logical.destroy_descriptor_set_layout(self.globals_set_layout, None);
            self.logical.destroy_descriptor_pool(self.ui_descriptor_pool, None);
            self.logical.destroy_sampler(self.samplers.anisotropic, None);
            self.logical.destroy_sampler(self.samplers.linear, None);
            self.logical.destroy_sampler(self.samplers.nearest, None);
        }
        drop(self.allocator.lock().take());
        self.upload.destroy(&self.logical);
        unsafe { self.logical.destroy_device(None) };
    }
}

/// Graphics + present families `surface` would use on `physical`, if it can present at all
fn derive_queue_families(
    instance: &VulkanInstance,
    physical: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<Option<QueueFamilyIndices>> {
    let families = unsafe {
        instance
            .instance
            .get_physical_device_queue_family_properties(physical)
    };

    let Some(graphics) = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
    else {
        return Ok(None);
    };

    let supports_present = |index: u32| unsafe {
        instance
            .surface_loader
            .get_physical_device_surface_support(physical, index, surface)
    };

    // Prefer presenting from the graphics family
    let present = if supports_present(graphics)? {
        Some(graphics)
    } else {
        let mut found = None;
        for index in 0..families.len() as u32 {
            if supports_present(index)? {
                found = Some(index);
                break;
            }
        }
        found
    };

    Ok(present.map(|present| QueueFamilyIndices { graphics, present }))
}

fn supports_swapchain(instance: &ash::Instance, physical: vk::PhysicalDevice) -> Result<bool> {
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical) }?;
    let required = ash::extensions::khr::Swapchain::name();
    Ok(extensions
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == required))
}

fn supports_partially_bound(instance: &ash::Instance, physical: vk::PhysicalDevice) -> bool {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(physical, &mut features) };
    features12.descriptor_binding_partially_bound == vk::TRUE
}

fn pick_physical_device(
    instance: &VulkanInstance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
    let devices = unsafe { instance.instance.enumerate_physical_devices() }?;

    if devices.is_empty() {
        anyhow::bail!("No Vulkan-capable GPU found");
    }

    let mut best_device = None;
    let mut best_score = 0;

    for device in devices {
        if !supports_swapchain(&instance.instance, device)?
            || !supports_partially_bound(&instance.instance, device)
        {
            continue;
        }

        let Some(families) = derive_queue_families(instance, device, surface)? else {
            continue;
        };

        let props = unsafe { instance.instance.get_physical_device_properties(device) };
        let score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };

        if score > best_score {
            best_score = score;
            best_device = Some((device, families));
        }
    }

    best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
}

fn create_logical_device(
    instance: &VulkanInstance,
    physical: vk::PhysicalDevice,
    families: QueueFamilyIndices,
    queues_per_family: u32,
) -> Result<(ash::Device, QueuePool)> {
    let family_props = unsafe {
        instance
            .instance
            .get_physical_device_queue_family_properties(physical)
    };
    let queue_count = |family: u32| queues_per_family.min(family_props[family as usize].queue_count).max(1);

    let graphics_count = queue_count(families.graphics);
    let present_count = queue_count(families.present);
    log::info!(
        "Creating {} graphics queue(s){}",
        graphics_count,
        if families.is_unified() {
            String::new()
        } else {
            format!(" and {} present queue(s)", present_count)
        }
    );

    let graphics_priorities = vec![1.0f32; graphics_count as usize];
    let present_priorities = vec![1.0f32; present_count as usize];

    let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(families.graphics)
        .queue_priorities(&graphics_priorities)
        .build()];
    if !families.is_unified() {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(families.present)
                .queue_priorities(&present_priorities)
                .build(),
        );
    }

    let supported = unsafe { instance.instance.get_physical_device_features(physical) };
    let features = vk::PhysicalDeviceFeatures::builder()
        .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
        .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);
    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder().descriptor_binding_partially_bound(true);

    let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features12);

    let device = unsafe { instance.instance.create_device(physical, &create_info, None) }
        .context("Failed to create logical device")?;

    let fetch = |family: u32, count: u32| -> Vec<vk::Queue> {
        (0..count)
            .map(|i| unsafe { device.get_device_queue(family, i) })
            .collect()
    };
    let graphics_queues = fetch(families.graphics, graphics_count);
    let present_queues = if families.is_unified() {
        Vec::new()
    } else {
        fetch(families.present, present_count)
    };

    Ok((device, QueuePool::new(families, graphics_queues, present_queues)))
}

fn create_samplers(
    device: &ash::Device,
    props: &vk::PhysicalDeviceProperties,
    anisotropy_supported: bool,
) -> Result<StandardSamplers> {
    let make = |filter: vk::Filter, mipmap: vk::SamplerMipmapMode, anisotropy: Option<f32>| {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        unsafe { device.create_sampler(&info, None) }.context("Failed to create sampler")
    };

    Ok(StandardSamplers {
        nearest: make(vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST, None)?,
        linear: make(vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR, None)?,
        anisotropic: make(
            vk::Filter::LINEAR,
            vk::SamplerMipmapMode::LINEAR,
            anisotropy_supported.then(|| props.limits.max_sampler_anisotropy.min(16.0)),
        )?,
    })
}

fn create_ui_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 256,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 64,
        },
    ];
    let info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(256)
        .pool_sizes(&pool_sizes);
    unsafe { device.create_descriptor_pool(&info, None) }.context("Failed to create UI descriptor pool")
}
