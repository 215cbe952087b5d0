// Surface context - one window's presentation and frame loop
//
// Owns the surface, swapchain, depth buffer, render pass, framebuffers, the
// frame-in-flight slots and the frame packet. Frames are driven as:
//
//   begin_frame -> record into frame_packet() -> end_frame
//
// FRAME TIMELINE:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait_fence ─> acquire_image ─> record packet ─> submit ─> present   │
// │  (slot free)   (image ready)    (replay)         (GPU)     (display) │
// └──────────────────────────────────────────────────────────────────────┘
//
// Out-of-date and suboptimal results rebuild the swapchain in place; every
// other Vulkan failure propagates to the caller as fatal.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use smallvec::SmallVec;
use std::sync::Arc;

use super::buffer::{GpuBuffer, GpuImage};
use super::device::{DeviceManager, GraphicsDevice};
use super::frame_packet::{
    record_frame, CommandEncoder, DrawIndexed, FrameGlobals, FramePacket, FrameStats, PassTarget,
    MAX_BOUND_TEXTURES, MAX_VERTEX_BUFFERS,
};
use super::pipeline::{create_framebuffers, create_render_pass};
use super::queue::QueueLease;
use super::swapchain::{PresentStatus, Swapchain};
use super::sync::{FrameCounter, FrameSync};
use crate::config::GraphicsSettings;

/// `BindGlobals` commands one frame can hold
pub const MAX_GLOBALS_PER_FRAME: usize = 64;

const GLOBALS_SIZE: vk::DeviceSize = std::mem::size_of::<glam::Mat4>() as vk::DeviceSize;

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Camera uniforms + descriptor sets for one frame slot, consumed front to back
struct GlobalsRing {
    buffer: GpuBuffer,
    sets: Vec<vk::DescriptorSet>,
    stride: vk::DeviceSize,
    next: usize,
}

impl GlobalsRing {
    fn new(device: &GraphicsDevice, pool: vk::DescriptorPool) -> Result<Self> {
        let stride = align_up(GLOBALS_SIZE, device.min_uniform_alignment());
        let buffer = GpuBuffer::new(
            device,
            "frame globals",
            stride * MAX_GLOBALS_PER_FRAME as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        let layouts = vec![device.globals_set_layout(); MAX_GLOBALS_PER_FRAME];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { device.logical.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate globals descriptor sets")?;

        // Binding 0 of set i always points at uniform slot i
        let buffer_infos: Vec<_> = (0..MAX_GLOBALS_PER_FRAME)
            .map(|i| vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: stride * i as vk::DeviceSize,
                range: GLOBALS_SIZE,
            })
            .collect();
        let writes: Vec<_> = sets
            .iter()
            .zip(&buffer_infos)
            .map(|(&set, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe { device.logical.update_descriptor_sets(&writes, &[]) };

        Ok(Self {
            buffer,
            sets,
            stride,
            next: 0,
        })
    }

    fn reset(&mut self) {
        self.next = 0;
    }

    /// Write `globals` into the next slot and return its descriptor set
    fn push(&mut self, device: &ash::Device, globals: &FrameGlobals, sampler: vk::Sampler) -> vk::DescriptorSet {
        assert!(
            self.next < MAX_GLOBALS_PER_FRAME,
            "more than {} BindGlobals in one frame",
            MAX_GLOBALS_PER_FRAME
        );
        debug_assert!(globals.textures.len() <= MAX_BOUND_TEXTURES);

        let slot = self.next;
        self.next += 1;

        self.buffer.write(
            slot * self.stride as usize,
            bytemuck::bytes_of(&globals.view_projection),
        );

        let set = self.sets[slot];
        if !globals.textures.is_empty() {
            let image_infos: SmallVec<[vk::DescriptorImageInfo; 4]> = globals
                .textures
                .iter()
                .map(|&view| vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect();
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_infos)
                .build();
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }
        set
    }

    fn destroy(self, device: &GraphicsDevice) {
        // Sets go with the descriptor pool
        self.buffer.destroy(device);
    }
}

struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
    globals: GlobalsRing,
}

#[derive(Debug, Clone, Copy)]
struct AcquiredImage {
    index: u32,
    suboptimal: bool,
}

/// Records a frame packet into a Vulkan command buffer
struct VulkanEncoder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    layout: vk::PipelineLayout,
    swapchain_pass: (vk::RenderPass, vk::Framebuffer, vk::Extent2D),
    globals: &'a mut GlobalsRing,
    sampler: vk::Sampler,
}

impl CommandEncoder for VulkanEncoder<'_> {
    fn begin_pass(&mut self, target: &PassTarget, clear_color: [f32; 4]) {
        let (render_pass, framebuffer, extent) = match target {
            PassTarget::Swapchain => self.swapchain_pass,
            PassTarget::Offscreen(view) => (view.render_pass, view.framebuffer, view.extent),
        };

        let mut clear_values: SmallVec<[vk::ClearValue; 3]> = SmallVec::new();
        clear_values.push(vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        });
        if target.kind().has_entity_id() {
            // -1 marks "no entity"
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue { int32: [-1, 0, 0, 0] },
            });
        }
        clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            self.device
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd, 0, &[render_area]);
        }
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    fn bind_globals(&mut self, globals: &FrameGlobals) {
        let set = self.globals.push(self.device, globals, self.sampler);
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn push_constants(&mut self, data: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(
                self.cmd,
                self.layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                data,
            );
        }
    }

    fn draw_indexed(&mut self, draw: &DrawIndexed) {
        let buffers: SmallVec<[vk::Buffer; MAX_VERTEX_BUFFERS]> =
            draw.vertex_buffers.iter().map(|b| b.buffer).collect();
        let offsets: SmallVec<[vk::DeviceSize; MAX_VERTEX_BUFFERS]> =
            draw.vertex_buffers.iter().map(|b| b.offset).collect();

        unsafe {
            if !buffers.is_empty() {
                self.device
                    .cmd_bind_vertex_buffers(self.cmd, 0, &buffers, &offsets);
            }
            self.device.cmd_bind_index_buffer(
                self.cmd,
                draw.vertex_array.index_buffer,
                draw.vertex_array.index_offset,
                draw.vertex_array.index_type,
            );
            self.device
                .cmd_draw_indexed(self.cmd, draw.index_count, draw.instance_count, 0, 0, 0);
        }
    }

    fn end_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.cmd) };
    }
}

/// One window surface and everything needed to present to it
pub struct SurfaceContext {
    device: Arc<GraphicsDevice>,
    surface: vk::SurfaceKHR,
    lease: Option<QueueLease>,
    settings: GraphicsSettings,

    swapchain: Swapchain,
    depth: Option<GpuImage>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    frames: Vec<FrameSlot>,
    counter: FrameCounter,

    packet: FramePacket,
    current: Option<AcquiredImage>,
    requested_extent: vk::Extent2D,
    needs_recreate: bool,
}

impl SurfaceContext {
    /// Create the surface for `window`, lease queues and build the swapchain resources
    pub fn init<W>(
        manager: &mut DeviceManager,
        window: &W,
        width: u32,
        height: u32,
        settings: &GraphicsSettings,
    ) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let surface = manager.instance().create_surface(window)?;
        let lease = match manager.acquire_queue_lease(surface) {
            Ok(lease) => lease,
            Err(e) => {
                manager.instance().destroy_surface(surface);
                return Err(e);
            }
        };
        let device = manager.device().clone();
        let logical = &device.logical;

        let swapchain = match Swapchain::new(
            &device.instance.instance,
            logical,
            device.physical,
            surface,
            &device.instance.surface_loader,
            device.families,
            settings,
            width,
            height,
            vk::SwapchainKHR::null(),
        ) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                device.release_queue_lease(lease);
                device.instance.destroy_surface(surface);
                return Err(e);
            }
        };

        let frames_in_flight = settings.frames_in_flight.max(1);

        // From here on, Drop tears down whatever was built if a later step fails
        let mut context = Self {
            device: device.clone(),
            surface,
            lease: Some(lease),
            settings: settings.clone(),
            swapchain,
            depth: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            command_pool: vk::CommandPool::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            frames: Vec::with_capacity(frames_in_flight),
            counter: FrameCounter::new(frames_in_flight),
            packet: FramePacket::new(),
            current: None,
            requested_extent: vk::Extent2D { width, height },
            needs_recreate: false,
        };

        let extent = context.swapchain.extent;
        let depth = GpuImage::new_depth(&device, extent)?;
        let depth_view = depth.view;
        context.depth = Some(depth);
        context.render_pass =
            create_render_pass(logical, context.swapchain.format, vk::ImageLayout::PRESENT_SRC_KHR, false)?;
        context.framebuffers = create_framebuffers(
            logical,
            &context.swapchain.image_views,
            depth_view,
            context.render_pass,
            extent,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        context.command_pool = unsafe { logical.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(context.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        let command_buffers = unsafe { logical.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        context.descriptor_pool = create_globals_pool(logical, frames_in_flight)?;

        for command_buffer in command_buffers {
            let sync = FrameSync::new(logical)?;
            let globals = match GlobalsRing::new(&device, context.descriptor_pool) {
                Ok(globals) => globals,
                Err(e) => {
                    sync.destroy(logical);
                    return Err(e);
                }
            };
            context.frames.push(FrameSlot {
                sync,
                command_buffer,
                globals,
            });
        }

        log::info!(
            "Surface ready: {}x{}, {} frames in flight, {:?}",
            extent.width,
            extent.height,
            frames_in_flight,
            context.lease
        );

        Ok(context)
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format
    }

    /// Render pass of the swapchain target; pipelines drawing to it are built against this
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn frame_index(&self) -> usize {
        self.counter.index()
    }

    pub fn is_minimized(&self) -> bool {
        self.requested_extent.width == 0 || self.requested_extent.height == 0
    }

    /// Commands for the frame in progress
    pub fn frame_packet(&mut self) -> &mut FramePacket {
        &mut self.packet
    }

    /// The window was resized; the swapchain is rebuilt before the next frame
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        self.requested_extent = vk::Extent2D { width, height };
        self.needs_recreate = true;
    }

    /// Start a frame. Returns `false` when there is nothing to render into
    /// (minimised, or the swapchain had to be rebuilt); skip `end_frame` then.
    pub fn begin_frame(&mut self) -> Result<bool> {
        assert!(self.current.is_none(), "begin_frame called twice without end_frame");

        if self.is_minimized() {
            return Ok(false);
        }
        if self.needs_recreate {
            self.recreate()?;
        }

        let logical = &self.device.logical;
        let frame = &mut self.frames[self.counter.index()];

        // ─────────────────────────────────────────────────────────────────
        // STEP 1: Wait until this slot's previous submission has finished
        // ─────────────────────────────────────────────────────────────────
        unsafe { logical.wait_for_fences(&[frame.sync.in_flight_fence], true, u64::MAX) }
            .context("Failed to wait for frame fence")?;

        // ─────────────────────────────────────────────────────────────────
        // STEP 2: Acquire the next swapchain image
        // ─────────────────────────────────────────────────────────────────
        let Some((index, status)) = self.swapchain.acquire_next_image(frame.sync.image_available)? else {
            log::info!("Swapchain out of date on acquire");
            self.recreate()?;
            return Ok(false);
        };

        // ─────────────────────────────────────────────────────────────────
        // STEP 3: Reset the slot and start recording
        // ─────────────────────────────────────────────────────────────────
        unsafe {
            logical.reset_fences(&[frame.sync.in_flight_fence])?;
            logical.reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())?;
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            logical
                .begin_command_buffer(frame.command_buffer, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        frame.globals.reset();
        self.packet.reset();
        self.current = Some(AcquiredImage {
            index,
            suboptimal: status == PresentStatus::Suboptimal,
        });
        Ok(true)
    }

    /// Replay the frame packet, submit and present
    pub fn end_frame(&mut self) -> Result<FrameStats> {
        let Some(acquired) = self.current.take() else {
            panic!("end_frame called without a successful begin_frame");
        };

        let device = self.device.clone();
        let logical = &device.logical;
        let frame = &mut self.frames[self.counter.index()];

        // ─────────────────────────────────────────────────────────────────
        // STEP 1: Translate the packet into native commands
        // ─────────────────────────────────────────────────────────────────
        let mut encoder = VulkanEncoder {
            device: logical,
            cmd: frame.command_buffer,
            layout: device.pipeline_layout(),
            swapchain_pass: (
                self.render_pass,
                self.framebuffers[acquired.index as usize],
                self.swapchain.extent,
            ),
            globals: &mut frame.globals,
            sampler: device.sampler(self.settings.texture_filter),
        };
        let stats = record_frame(&mut self.packet, &mut encoder, self.settings.clear_color);

        unsafe { logical.end_command_buffer(frame.command_buffer) }
            .context("Failed to end command buffer")?;

        // ─────────────────────────────────────────────────────────────────
        // STEP 2: Submit and present
        // ─────────────────────────────────────────────────────────────────
        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.sync.render_finished];
        let command_buffers = [frame.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)      // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages)      // Which stage waits
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores) // Signal when done
            .build();

        let fence = frame.sync.in_flight_fence;
        let swapchain = &self.swapchain;
        let lease = self.lease.as_ref().expect("surface lost its queue lease");
        let present_status = lease.with_queues(|graphics, present| {
            unsafe { logical.queue_submit(graphics, &[submit_info], fence) }
                .context("Failed to submit frame")?;
            swapchain.present(present, acquired.index, &signal_semaphores)
        })?;

        // ─────────────────────────────────────────────────────────────────
        // STEP 3: Advance to next frame
        // ─────────────────────────────────────────────────────────────────
        self.counter.advance();

        if acquired.suboptimal || present_status != PresentStatus::Optimal {
            log::info!("Swapchain stale after present ({:?})", present_status);
            self.recreate()?;
        }

        Ok(stats)
    }

    /// Rebuild swapchain, depth buffer, framebuffers and sync objects.
    ///
    /// The render pass is kept unless the surface format changed.
    pub fn recreate(&mut self) -> Result<()> {
        if self.is_minimized() {
            self.needs_recreate = true;
            return Ok(());
        }
        self.needs_recreate = false;

        // Wait for GPU to finish all work before destroying resources
        self.device.wait_idle()?;

        let device = self.device.clone();
        let logical = &device.logical;

        let swapchain = Swapchain::new(
            &device.instance.instance,
            logical,
            device.physical,
            self.surface,
            &device.instance.surface_loader,
            device.families,
            &self.settings,
            self.requested_extent.width,
            self.requested_extent.height,
            self.swapchain.swapchain,
        )?;
        let old_swapchain = std::mem::replace(&mut self.swapchain, swapchain);
        old_swapchain.destroy(logical);

        if self.swapchain.format != old_swapchain.format {
            log::info!("Surface format changed to {:?}, rebuilding render pass", self.swapchain.format);
            let render_pass =
                create_render_pass(logical, self.swapchain.format, vk::ImageLayout::PRESENT_SRC_KHR, false)?;
            let old = std::mem::replace(&mut self.render_pass, render_pass);
            unsafe { logical.destroy_render_pass(old, None) };
        }

        let depth = GpuImage::new_depth(&device, self.swapchain.extent)?;
        let framebuffers = create_framebuffers(
            logical,
            &self.swapchain.image_views,
            depth.view,
            self.render_pass,
            self.swapchain.extent,
        )?;

        for framebuffer in std::mem::replace(&mut self.framebuffers, framebuffers) {
            unsafe { logical.destroy_framebuffer(framebuffer, None) };
        }
        if let Some(old) = self.depth.replace(depth) {
            old.destroy(&device);
        }

        for frame in &mut self.frames {
            let sync = FrameSync::new(logical)?;
            std::mem::replace(&mut frame.sync, sync).destroy(logical);
        }

        log::info!(
            "Recreated swapchain: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }
}

impl Drop for SurfaceContext {
    fn drop(&mut self) {
        log::info!("Destroying surface context...");
        let _ = self.device.wait_idle();

        let device = self.device.clone();
        let logical = &device.logical;

        for frame in self.frames.drain(..) {
            frame.sync.destroy(logical);
            frame.globals.destroy(&device);
        }

        unsafe {
            logical.destroy_descriptor_pool(self.descriptor_pool, None);
            logical.destroy_command_pool(self.command_pool, None);
            for &framebuffer in &self.framebuffers {
                logical.destroy_framebuffer(framebuffer, None);
            }
            logical.destroy_render_pass(self.render_pass, None);
        }
        if let Some(depth) = self.depth.take() {
            depth.destroy(&device);
        }
        self.swapchain.destroy(logical);

        if let Some(lease) = self.lease.take() {
            device.release_queue_lease(lease);
        }
        device.instance.destroy_surface(self.surface);
    }
}

fn create_globals_pool(device: &ash::Device, frames_in_flight: usize) -> Result<vk::DescriptorPool> {
    let sets = (frames_in_flight * MAX_GLOBALS_PER_FRAME) as u32;
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: sets * MAX_BOUND_TEXTURES as u32,
        },
    ];
    let info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(sets)
        .pool_sizes(&pool_sizes);
    unsafe { device.create_descriptor_pool(&info, None) }.context("Failed to create globals descriptor pool")
}
