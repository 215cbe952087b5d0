// Vulkan instance and window surfaces
//
// Responsibilities:
// - Load the Vulkan library and create the instance
// - Optional validation layer + debug messenger routed into `log`
// - Presentation surfaces from raw window/display handles
//
// Physical device selection lives in device.rs; it needs a surface first.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

/// Instance-level Vulkan state shared by the device and every surface
pub struct VulkanInstance {
    // Field order matters for Drop: debug messenger before instance, entry last.
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: ash::extensions::khr::Surface,
    pub instance: ash::Instance,
    pub entry: Entry,
}

impl VulkanInstance {
    /// Create the Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `display` - Display the surfaces will be created on; selects the surface extensions
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(app_name: &str, display: RawDisplayHandle, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("render-core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = required_surface_extensions(display)?;
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if enable_validation {
            Some(setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        Ok(Arc::new(Self {
            debug_utils,
            surface_loader,
            instance,
            entry,
        }))
    }

    /// Create a presentation surface for a native window
    pub fn create_surface<W>(&self, window: &W) -> Result<vk::SurfaceKHR>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();

        let surface = unsafe {
            match (display_handle, window_handle) {
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                    let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                    let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance)
                        .hwnd(hwnd);
                    ash::extensions::khr::Win32Surface::new(&self.entry, &self.instance)
                        .create_win32_surface(&create_info, None)?
                }
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                    let dpy = display
                        .display
                        .context("Xlib display handle has no display")?
                        .as_ptr();
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy as *mut vk::Display)
                        .window(handle.window);
                    ash::extensions::khr::XlibSurface::new(&self.entry, &self.instance)
                        .create_xlib_surface(&create_info, None)?
                }
                (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                    let connection = display
                        .connection
                        .context("XCB display handle has no connection")?
                        .as_ptr();
                    let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection as *mut vk::xcb_connection_t)
                        .window(handle.window.get());
                    ash::extensions::khr::XcbSurface::new(&self.entry, &self.instance)
                        .create_xcb_surface(&create_info, None)?
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr() as *mut vk::wl_display)
                        .surface(handle.surface.as_ptr() as *mut vk::wl_surface);
                    ash::extensions::khr::WaylandSurface::new(&self.entry, &self.instance)
                        .create_wayland_surface(&create_info, None)?
                }
                _ => anyhow::bail!("Unsupported window handle type"),
            }
        };

        Ok(surface)
    }

    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance extensions needed to create surfaces on `display`
pub fn required_surface_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => ash::extensions::khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => ash::extensions::khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => ash::extensions::khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => ash::extensions::khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };

    Ok(vec![
        ash::extensions::khr::Surface::name().as_ptr(),
        platform.as_ptr(),
    ])
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok((debug_utils, messenger))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
