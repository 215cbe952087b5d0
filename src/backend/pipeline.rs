// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Pipelines are described declaratively by a `PipelineSpec` (derived from the
// shader, the graphics settings and the render target) and built into a
// `PipelineObject`. Every pipeline shares the same layout shape: one globals
// descriptor set plus a 128-byte push-constant range, so globals and push
// constants can be bound through any compatible layout.

use anyhow::{Context, Result};
use ash::vk;
use smallvec::{smallvec, SmallVec};
use std::path::{Path, PathBuf};

use super::buffer::DEPTH_FORMAT;
use super::device::GraphicsDevice;
use super::frame_packet::{MAX_BOUND_TEXTURES, PUSH_CONSTANT_SIZE};
use super::reflect::{reflect_vertex_input_bindings, spirv_words, VertexInputBinding};
use super::shader::{create_shader_module, ShaderCache, ShaderCompiler, ShaderStage, SpirvPaths};
use crate::config::{BlendMode, CullMode, FrontFace, GraphicsSettings};

/// Format of the editor's per-pixel entity id attachment
pub const ENTITY_ID_FORMAT: vk::Format = vk::Format::R32_SINT;

/// What kind of target a pipeline will render into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTargetKind {
    Swapchain,
    Offscreen,
    /// Offscreen colour plus an integer entity-id attachment
    EditorOffscreen,
}

impl RenderTargetKind {
    pub fn has_entity_id(self) -> bool {
        matches!(self, RenderTargetKind::EditorOffscreen)
    }
}

/// Create a render pass with a colour attachment, an optional entity-id
/// attachment and depth.
///
/// `final_layout` is PRESENT_SRC for the swapchain and SHADER_READ_ONLY for
/// offscreen targets that get sampled later.
pub fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    final_layout: vk::ImageLayout,
    entity_id: bool,
) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(final_layout)
        .build();

    let id_attachment = vk::AttachmentDescription::builder()
        .format(ENTITY_ID_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL) // read back for picking
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let mut attachments: SmallVec<[vk::AttachmentDescription; 3]> = smallvec![color_attachment];
    let mut color_refs: SmallVec<[vk::AttachmentReference; 2]> = smallvec![vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    if entity_id {
        color_refs.push(vk::AttachmentReference {
            attachment: attachments.len() as u32,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
        attachments.push(id_attachment);
    }
    let depth_ref = vk::AttachmentReference {
        attachment: attachments.len() as u32,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    attachments.push(depth_attachment);

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .build();

    let subpasses = [subpass];
    let dependencies = [dependency];
    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Create framebuffers for each swapchain image (with depth attachment)
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: &[vk::ImageView],
    depth_image_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&image_view| create_framebuffer(device, &[image_view, depth_image_view], render_pass, extent))
        .collect()
}

pub fn create_framebuffer(
    device: &ash::Device,
    attachments: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    unsafe {
        device
            .create_framebuffer(&framebuffer_info, None)
            .context("Failed to create framebuffer")
    }
}

/// Set 0: camera uniform at binding 0, texture array at binding 1
pub fn create_globals_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_BOUND_TEXTURES as u32)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];
    // Draws rarely bind every texture slot
    let binding_flags = [
        vk::DescriptorBindingFlags::empty(),
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
    ];
    let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

    let info = vk::DescriptorSetLayoutCreateInfo::builder()
        .bindings(&bindings)
        .push_next(&mut flags_info);

    unsafe { device.create_descriptor_set_layout(&info, None) }.context("Failed to create globals set layout")
}

/// Globals set + one push-constant range visible to vertex and fragment stages
pub fn create_pipeline_layout(
    device: &ash::Device,
    globals_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: PUSH_CONSTANT_SIZE as u32,
    }];
    let set_layouts = [globals_layout];

    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);

    unsafe { device.create_pipeline_layout(&layout_info, None) }.context("Failed to create pipeline layout")
}

/// Blend state of one colour attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub format: Option<vk::Format>,
    /// `None` disables blending (required for integer attachments)
    pub blend: Option<BlendMode>,
}

impl AttachmentSpec {
    fn state(&self) -> vk::PipelineColorBlendAttachmentState {
        let base = vk::PipelineColorBlendAttachmentState::builder().color_write_mask(vk::ColorComponentFlags::RGBA);
        let state = match self.blend {
            None | Some(BlendMode::Opaque) => base.blend_enable(false),
            Some(BlendMode::Alpha) => base
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD),
            Some(BlendMode::Additive) => base
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
        };
        state.build()
    }
}

/// Declarative description of a graphics pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub shader: PathBuf,
    pub spirv: SpirvPaths,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub wireframe: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub color_attachments: SmallVec<[AttachmentSpec; 2]>,
    pub vertex_bindings: Vec<VertexInputBinding>,
    pub target: RenderTargetKind,
}

impl PipelineSpec {
    /// Derive a spec from the shader's reflected inputs, the graphics settings and the target.
    ///
    /// Editor targets get an extra non-blended entity-id attachment. That special
    /// case goes away once passes declare their own attachments.
    pub fn from_shader<C: ShaderCompiler>(
        path: &Path,
        shaders: &mut ShaderCache<C>,
        settings: &GraphicsSettings,
        target: RenderTargetKind,
    ) -> Result<Self> {
        let spirv = shaders.get_or_compile_spirv_paths(path)?;

        let bytes = std::fs::read(&spirv.vertex)
            .with_context(|| format!("Failed to read vertex bytecode {:?}", spirv.vertex))?;
        let words = spirv_words(&bytes).with_context(|| format!("{:?}", spirv.vertex))?;
        let vertex_bindings = reflect_vertex_input_bindings(&words)
            .with_context(|| format!("Failed to reflect vertex inputs of {:?}", path))?;

        let mut color_attachments: SmallVec<[AttachmentSpec; 2]> = smallvec![AttachmentSpec {
            format: None,
            blend: Some(settings.blend),
        }];
        if target.has_entity_id() {
            color_attachments.push(AttachmentSpec {
                format: Some(ENTITY_ID_FORMAT),
                blend: None,
            });
        }

        Ok(Self {
            shader: path.to_path_buf(),
            spirv,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: settings.cull_mode,
            front_face: settings.front_face,
            wireframe: settings.wireframe,
            depth_test: settings.depth_test,
            depth_write: settings.depth_write,
            color_attachments,
            vertex_bindings,
            target,
        })
    }
}

/// A built pipeline and the layout it was built with
pub struct PipelineObject {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl PipelineObject {
    /// Build `spec` for `render_pass`, seeded from the device pipeline cache
    pub fn build(device: &GraphicsDevice, spec: &PipelineSpec, render_pass: vk::RenderPass) -> Result<Self> {
        let logical = &device.logical;

        let vert_module = create_shader_module(logical, spec.spirv.get(ShaderStage::Vertex))?;
        let frag_module = match create_shader_module(logical, spec.spirv.get(ShaderStage::Fragment)) {
            Ok(module) => module,
            Err(e) => {
                unsafe { logical.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

        let result = Self::build_with_modules(device, spec, render_pass, vert_module, frag_module);

        // Modules are only needed during creation
        unsafe {
            logical.destroy_shader_module(vert_module, None);
            logical.destroy_shader_module(frag_module, None);
        }

        if result.is_ok() {
            log::info!("Built pipeline for {:?} ({:?})", spec.shader, spec.target);
        }
        result
    }

    fn build_with_modules(
        device: &GraphicsDevice,
        spec: &PipelineSpec,
        render_pass: vk::RenderPass,
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<Self> {
        let logical = &device.logical;
        let entry_point = c"main";

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(ShaderStage::Vertex.to_vk())
                .module(vert_module)
                .name(entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(ShaderStage::Fragment.to_vk())
                .module(frag_module)
                .name(entry_point)
                .build(),
        ];

        // Vertex input from reflection
        let bindings: Vec<_> = spec.vertex_bindings.iter().map(|b| b.description()).collect();
        let attributes: Vec<_> = spec
            .vertex_bindings
            .iter()
            .flat_map(|b| b.attribute_descriptions())
            .collect();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(spec.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are set per pass
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(if spec.wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            })
            .line_width(1.0)
            .cull_mode(spec.cull_mode.to_vk())
            .front_face(spec.front_face.to_vk())
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(spec.depth_test)
            .depth_write_enable(spec.depth_write)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 2]> =
            spec.color_attachments.iter().map(AttachmentSpec::state).collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let layout = create_pipeline_layout(logical, device.globals_set_layout())?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            logical.create_graphics_pipelines(device.pipeline_cache(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { logical.destroy_pipeline_layout(layout, None) };
                Err(e).with_context(|| format!("Failed to create graphics pipeline for {:?}", spec.shader))
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reflect::test_spirv::{input, vertex_module, InputType};

    struct FixedCompiler;

    impl ShaderCompiler for FixedCompiler {
        fn target(&self) -> &str {
            "fixed"
        }

        fn compile(&self, _stage: ShaderStage, _source: &str, _path: &Path) -> Result<Vec<u32>> {
            Ok(vertex_module(&[
                input("a_position", 0, InputType::Float(3)),
                input("a_uv", 1, InputType::Float(2)),
                input("i_model", 2, InputType::Mat4),
            ]))
        }
    }

    fn spec_for(settings: &GraphicsSettings, target: RenderTargetKind) -> PipelineSpec {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("sprite.glsl");
        std::fs::write(&source, "#type vertex\nv\n#type fragment\nf\n").unwrap();
        let mut shaders = ShaderCache::with_compiler(dir.path().join("cache"), FixedCompiler);
        PipelineSpec::from_shader(&source, &mut shaders, settings, target).unwrap()
    }

    #[test]
    fn spec_follows_settings_and_reflection() {
        let settings = GraphicsSettings {
            cull_mode: CullMode::None,
            blend: BlendMode::Additive,
            wireframe: true,
            depth_write: false,
            ..Default::default()
        };
        let spec = spec_for(&settings, RenderTargetKind::Swapchain);

        assert_eq!(spec.cull_mode, CullMode::None);
        assert!(spec.wireframe);
        assert!(spec.depth_test);
        assert!(!spec.depth_write);
        assert_eq!(spec.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(spec.color_attachments.len(), 1);
        assert_eq!(spec.color_attachments[0].blend, Some(BlendMode::Additive));

        assert_eq!(spec.vertex_bindings.len(), 2);
        assert_eq!(spec.vertex_bindings[0].stride, 20);
        assert_eq!(spec.vertex_bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(spec.vertex_bindings[1].stride, 64);
    }

    #[test]
    fn editor_target_adds_unblended_id_attachment() {
        let spec = spec_for(&GraphicsSettings::default(), RenderTargetKind::EditorOffscreen);

        assert_eq!(spec.color_attachments.len(), 2);
        let id = spec.color_attachments[1];
        assert_eq!(id.format, Some(ENTITY_ID_FORMAT));
        assert_eq!(id.blend, None);
        assert_eq!(id.state().blend_enable, vk::FALSE);
        assert_eq!(spec.color_attachments[0].state().blend_enable, vk::TRUE);
    }

    #[test]
    fn plain_offscreen_has_one_attachment() {
        let spec = spec_for(&GraphicsSettings::default(), RenderTargetKind::Offscreen);
        assert_eq!(spec.color_attachments.len(), 1);
    }

    #[test]
    fn opaque_blend_is_disabled() {
        let attachment = AttachmentSpec {
            format: None,
            blend: Some(BlendMode::Opaque),
        };
        assert_eq!(attachment.state().blend_enable, vk::FALSE);
        assert_eq!(attachment.state().color_write_mask, vk::ColorComponentFlags::RGBA);
    }
}
