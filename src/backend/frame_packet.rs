// Frame packet - deferred per-frame command list
//
// Renderer code records high-level intents (passes, pipeline binds, globals,
// push constants, indexed draws) as data. At the end of the frame the packet is
// drained in order and replayed into a `CommandEncoder`, which for real frames
// records Vulkan commands into the frame's command buffer.

use ash::vk;
use glam::Mat4;
use smallvec::SmallVec;

use super::pipeline::RenderTargetKind;

/// Size of the push-constant scratch region shared by vertex and fragment stages
pub const PUSH_CONSTANT_SIZE: usize = 128;
pub const MAX_VERTEX_BUFFERS: usize = 4;
/// Texture slots in the globals descriptor set
pub const MAX_BOUND_TEXTURES: usize = 16;

/// Everything needed to begin a pass on an offscreen target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffscreenView {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub kind: RenderTargetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    /// The image acquired for this frame
    Swapchain,
    Offscreen(OffscreenView),
}

impl PassTarget {
    pub fn kind(&self) -> RenderTargetKind {
        match self {
            PassTarget::Swapchain => RenderTargetKind::Swapchain,
            PassTarget::Offscreen(view) => view.kind,
        }
    }
}

/// Which renderer subsystem produced a globals binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalsSource {
    Renderer2D,
    Renderer3D,
    Editor,
}

/// Camera matrix plus the textures bound for following draws
#[derive(Debug, Clone, PartialEq)]
pub struct FrameGlobals {
    pub view_projection: Mat4,
    /// Views in `SHADER_READ_ONLY_OPTIMAL`, bound at array slots `0..len`
    pub textures: SmallVec<[vk::ImageView; 4]>,
    pub source: GlobalsSource,
}

impl FrameGlobals {
    pub fn camera(view_projection: Mat4, source: GlobalsSource) -> Self {
        Self {
            view_projection,
            textures: SmallVec::new(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushConstants {
    Bytes(SmallVec<[u8; PUSH_CONSTANT_SIZE]>),
    Matrix(Mat4),
}

impl PushConstants {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PushConstants::Bytes(bytes) => bytes.as_slice(),
            PushConstants::Matrix(matrix) => bytemuck::bytes_of(matrix),
        }
    }
}

/// Index buffer of a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexArray {
    pub index_buffer: vk::Buffer,
    pub index_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawIndexed {
    pub vertex_array: VertexArray,
    /// Bound at binding numbers `0..len`
    pub vertex_buffers: SmallVec<[VertexBufferBinding; MAX_VERTEX_BUFFERS]>,
    pub index_count: u32,
    pub instance_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameCommand {
    BeginPass { target: PassTarget, clear_color: [f32; 4] },
    BindPipeline(vk::Pipeline),
    BindGlobals(FrameGlobals),
    PushConstants(PushConstants),
    DrawIndexed(DrawIndexed),
    EndPass,
}

/// Ordered per-frame command list; reset by `begin_frame`, drained by `end_frame`
#[derive(Debug, Default)]
pub struct FramePacket {
    commands: Vec<FrameCommand>,
}

impl FramePacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn commands(&self) -> &[FrameCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn begin_pass(&mut self, target: PassTarget, clear_color: [f32; 4]) {
        self.commands.push(FrameCommand::BeginPass { target, clear_color });
    }

    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.commands.push(FrameCommand::BindPipeline(pipeline));
    }

    pub fn bind_globals(&mut self, globals: FrameGlobals) {
        assert!(
            globals.textures.len() <= MAX_BOUND_TEXTURES,
            "{} textures bound, at most {} supported",
            globals.textures.len(),
            MAX_BOUND_TEXTURES
        );
        self.commands.push(FrameCommand::BindGlobals(globals));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= PUSH_CONSTANT_SIZE,
            "push constant payload of {} bytes exceeds {}",
            bytes.len(),
            PUSH_CONSTANT_SIZE
        );
        // Push ranges are sized in whole words
        let mut payload: SmallVec<[u8; PUSH_CONSTANT_SIZE]> = SmallVec::from_slice(bytes);
        payload.resize(bytes.len().next_multiple_of(4), 0);
        self.commands.push(FrameCommand::PushConstants(PushConstants::Bytes(payload)));
    }

    pub fn push_matrix(&mut self, matrix: Mat4) {
        self.commands.push(FrameCommand::PushConstants(PushConstants::Matrix(matrix)));
    }

    pub fn draw_indexed(
        &mut self,
        vertex_array: VertexArray,
        vertex_buffers: &[VertexBufferBinding],
        index_count: u32,
        instance_count: u32,
    ) {
        assert!(
            vertex_buffers.len() <= MAX_VERTEX_BUFFERS,
            "{} vertex buffers bound, at most {} supported",
            vertex_buffers.len(),
            MAX_VERTEX_BUFFERS
        );
        self.commands.push(FrameCommand::DrawIndexed(DrawIndexed {
            vertex_array,
            vertex_buffers: SmallVec::from_slice(vertex_buffers),
            index_count,
            instance_count,
        }));
    }

    pub fn end_pass(&mut self) {
        self.commands.push(FrameCommand::EndPass);
    }

    fn has_swapchain_pass(&self) -> bool {
        self.commands.iter().any(|cmd| {
            matches!(
                cmd,
                FrameCommand::BeginPass {
                    target: PassTarget::Swapchain,
                    ..
                }
            )
        })
    }
}

/// Native-command sink a packet is replayed into
pub trait CommandEncoder {
    fn begin_pass(&mut self, target: &PassTarget, clear_color: [f32; 4]);
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_globals(&mut self, globals: &FrameGlobals);
    fn push_constants(&mut self, data: &[u8]);
    fn draw_indexed(&mut self, draw: &DrawIndexed);
    fn end_pass(&mut self);
}

/// What a replayed frame recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub passes: u32,
    pub draws: u32,
}

/// Translate `commands` in order
pub fn replay<E: CommandEncoder>(commands: &[FrameCommand], encoder: &mut E) -> FrameStats {
    let mut stats = FrameStats::default();
    for command in commands {
        match command {
            FrameCommand::BeginPass { target, clear_color } => {
                encoder.begin_pass(target, *clear_color);
                stats.passes += 1;
            }
            FrameCommand::BindPipeline(pipeline) => encoder.bind_pipeline(*pipeline),
            FrameCommand::BindGlobals(globals) => encoder.bind_globals(globals),
            FrameCommand::PushConstants(push) => encoder.push_constants(push.as_bytes()),
            FrameCommand::DrawIndexed(draw) => {
                encoder.draw_indexed(draw);
                stats.draws += 1;
            }
            FrameCommand::EndPass => encoder.end_pass(),
        }
    }
    stats
}

/// Drain `packet` into `encoder`.
///
/// The swapchain image must reach the present layout, so a packet that never
/// opened a swapchain pass gets a clear-only one appended.
pub fn record_frame<E: CommandEncoder>(
    packet: &mut FramePacket,
    encoder: &mut E,
    clear_color: [f32; 4],
) -> FrameStats {
    if !packet.has_swapchain_pass() {
        packet.begin_pass(PassTarget::Swapchain, clear_color);
        packet.end_pass();
    }
    let stats = replay(&packet.commands, encoder);
    packet.reset();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Begin(RenderTargetKind),
        Pipeline(u64),
        Globals(GlobalsSource, usize),
        Push(usize),
        Draw(u32, usize),
        End,
    }

    #[derive(Default)]
    struct RecordingEncoder {
        calls: Vec<Recorded>,
    }

    impl CommandEncoder for RecordingEncoder {
        fn begin_pass(&mut self, target: &PassTarget, _clear_color: [f32; 4]) {
            self.calls.push(Recorded::Begin(target.kind()));
        }
        fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
            self.calls.push(Recorded::Pipeline(pipeline.as_raw()));
        }
        fn bind_globals(&mut self, globals: &FrameGlobals) {
            self.calls.push(Recorded::Globals(globals.source, globals.textures.len()));
        }
        fn push_constants(&mut self, data: &[u8]) {
            self.calls.push(Recorded::Push(data.len()));
        }
        fn draw_indexed(&mut self, draw: &DrawIndexed) {
            self.calls.push(Recorded::Draw(draw.index_count, draw.vertex_buffers.len()));
        }
        fn end_pass(&mut self) {
            self.calls.push(Recorded::End);
        }
    }

    fn mesh() -> (VertexArray, [VertexBufferBinding; 2]) {
        let vertex_array = VertexArray {
            index_buffer: vk::Buffer::from_raw(1),
            index_offset: 0,
            index_type: vk::IndexType::UINT32,
        };
        let buffers = [
            VertexBufferBinding { buffer: vk::Buffer::from_raw(2), offset: 0 },
            VertexBufferBinding { buffer: vk::Buffer::from_raw(3), offset: 256 },
        ];
        (vertex_array, buffers)
    }

    #[test]
    fn empty_frame_still_clears_and_presents() {
        let mut packet = FramePacket::new();
        let mut encoder = RecordingEncoder::default();

        let stats = record_frame(&mut packet, &mut encoder, [0.0; 4]);

        assert_eq!(encoder.calls, [Recorded::Begin(RenderTargetKind::Swapchain), Recorded::End]);
        assert_eq!(stats, FrameStats { passes: 1, draws: 0 });
        assert!(packet.is_empty());
    }

    #[test]
    fn commands_replay_in_recorded_order() {
        let (vertex_array, buffers) = mesh();
        let mut packet = FramePacket::new();
        packet.begin_pass(PassTarget::Swapchain, [0.2, 0.2, 0.2, 1.0]);
        packet.bind_pipeline(vk::Pipeline::from_raw(42));
        packet.bind_globals(FrameGlobals::camera(Mat4::IDENTITY, GlobalsSource::Renderer3D));
        packet.push_matrix(Mat4::from_scale(glam::Vec3::splat(2.0)));
        packet.draw_indexed(vertex_array, &buffers, 36, 1);
        packet.push_bytes(&[1, 2, 3, 4]);
        packet.draw_indexed(vertex_array, &buffers[..1], 6, 10);
        packet.end_pass();

        let mut encoder = RecordingEncoder::default();
        let stats = record_frame(&mut packet, &mut encoder, [0.0; 4]);

        assert_eq!(
            encoder.calls,
            [
                Recorded::Begin(RenderTargetKind::Swapchain),
                Recorded::Pipeline(42),
                Recorded::Globals(GlobalsSource::Renderer3D, 0),
                Recorded::Push(64),
                Recorded::Draw(36, 2),
                Recorded::Push(4),
                Recorded::Draw(6, 1),
                Recorded::End,
            ]
        );
        assert_eq!(stats, FrameStats { passes: 1, draws: 2 });
    }

    #[test]
    fn offscreen_only_frame_gets_trailing_swapchain_pass() {
        let view = OffscreenView {
            render_pass: vk::RenderPass::from_raw(7),
            framebuffer: vk::Framebuffer::from_raw(8),
            extent: vk::Extent2D { width: 64, height: 64 },
            kind: RenderTargetKind::EditorOffscreen,
        };
        let mut packet = FramePacket::new();
        packet.begin_pass(PassTarget::Offscreen(view), [0.0; 4]);
        packet.end_pass();

        let mut encoder = RecordingEncoder::default();
        let stats = record_frame(&mut packet, &mut encoder, [0.0; 4]);

        assert_eq!(
            encoder.calls,
            [
                Recorded::Begin(RenderTargetKind::EditorOffscreen),
                Recorded::End,
                Recorded::Begin(RenderTargetKind::Swapchain),
                Recorded::End,
            ]
        );
        assert_eq!(stats.passes, 2);
    }

    #[test]
    fn packet_is_restartable_after_reset() {
        let mut packet = FramePacket::new();
        packet.begin_pass(PassTarget::Swapchain, [0.0; 4]);
        packet.bind_pipeline(vk::Pipeline::from_raw(1));
        packet.reset();
        assert!(packet.is_empty());

        packet.begin_pass(PassTarget::Swapchain, [1.0; 4]);
        packet.end_pass();
        assert_eq!(packet.commands().len(), 2);
    }

    #[test]
    fn globals_keep_bound_textures() {
        let mut globals = FrameGlobals::camera(Mat4::IDENTITY, GlobalsSource::Renderer2D);
        globals.textures.extend((1..=3).map(vk::ImageView::from_raw));

        let mut packet = FramePacket::new();
        packet.begin_pass(PassTarget::Swapchain, [0.0; 4]);
        packet.bind_globals(globals);
        packet.end_pass();

        let mut encoder = RecordingEncoder::default();
        record_frame(&mut packet, &mut encoder, [0.0; 4]);
        assert_eq!(encoder.calls[1], Recorded::Globals(GlobalsSource::Renderer2D, 3));
    }

    #[test]
    fn matrix_push_is_column_major_bytes() {
        let matrix = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let push = PushConstants::Matrix(matrix);
        let floats: &[f32] = bytemuck::cast_slice(push.as_bytes());
        assert_eq!(floats.len(), 16);
        assert_eq!(&floats[12..15], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn odd_sized_push_is_padded_to_words() {
        let mut packet = FramePacket::new();
        packet.begin_pass(PassTarget::Swapchain, [0.0; 4]);
        packet.push_bytes(&[1, 2, 3]);
        packet.push_bytes(&[9; 8]);
        packet.end_pass();

        match &packet.commands()[1] {
            FrameCommand::PushConstants(push) => assert_eq!(push.as_bytes(), &[1, 2, 3, 0]),
            other => panic!("expected push constants, got {:?}", other),
        }

        let mut encoder = RecordingEncoder::default();
        record_frame(&mut packet, &mut encoder, [0.0; 4]);
        assert_eq!(
            encoder.calls,
            vec![
                Recorded::Begin(RenderTargetKind::Swapchain),
                Recorded::Push(4),
                Recorded::Push(8),
                Recorded::End,
            ]
        );
    }

    #[test]
    #[should_panic(expected = "exceeds 128")]
    fn oversized_push_is_rejected() {
        FramePacket::new().push_bytes(&[0; PUSH_CONSTANT_SIZE + 1]);
    }

    #[test]
    #[should_panic(expected = "vertex buffers bound")]
    fn too_many_vertex_buffers_are_rejected() {
        let (vertex_array, buffers) = mesh();
        let five = [buffers[0]; MAX_VERTEX_BUFFERS + 1];
        FramePacket::new().draw_indexed(vertex_array, &five, 3, 1);
    }

    #[test]
    #[should_panic(expected = "textures bound")]
    fn too_many_textures_are_rejected() {
        let mut globals = FrameGlobals::camera(Mat4::IDENTITY, GlobalsSource::Editor);
        globals
            .textures
            .extend((1..=MAX_BOUND_TEXTURES as u64 + 1).map(vk::ImageView::from_raw));
        FramePacket::new().bind_globals(globals);
    }
}
