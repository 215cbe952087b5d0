// Backend module - Vulkan abstraction layer
//
// Device/queue ownership, per-window presentation, the frame packet that
// decouples scene code from command recording, and the shader/pipeline caches.

pub mod buffer;
pub mod device;
pub mod frame_packet;
pub mod instance;
pub mod offscreen;
pub mod pipeline;
pub mod pipeline_cache;
pub mod queue;
pub mod reflect;
pub mod shader;
pub mod surface_context;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use device::{DeviceManager, GraphicsDevice};
pub use frame_packet::FramePacket;
pub use surface_context::SurfaceContext;
pub use swapchain::Swapchain;
