//! Pipeline creation and management.

use crate::error::{GpuError, Result};
use crate::model::ModelVertex;
use ash::vk;

/// Compute pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct ComputePipelineDesc {
    pub shader: Vec<u32>,
}

/// Graphics pipeline configuration.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    /// Colour attachments written by the subpass.
    pub colour_attachment_count: u32,
    pub subpass: u32,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: vec![ModelVertex::binding_description(0)],
            vertex_attributes: ModelVertex::attribute_descriptions(0).to_vec(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            colour_attachment_count: 1,
            subpass: 0,
        }
    }
}

/// What kind of pipeline to build.
#[derive(Debug, Clone)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDesc),
    Compute(ComputePipelineDesc),
}

impl PipelineDesc {
    /// Bind point implied by the variant.
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute(_) => vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::Graphics(g) if g.vertex_shader.is_empty() => Some("vertex"),
            Self::Graphics(g) if g.fragment_shader.is_empty() => Some("fragment"),
            Self::Compute(c) if c.shader.is_empty() => Some("compute"),
            _ => None,
        };
        match empty {
            Some(stage) => Err(GpuError::PipelineCreation(format!(
                "{stage} shader code is empty"
            ))),
            None => Ok(()),
        }
    }
}

/// A pipeline and its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// Build the pipeline described by `desc`.
    ///
    /// Graphics pipelines are built against subpass `desc.subpass` of `render_pass`;
    /// compute pipelines ignore `render_pass`.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        desc: &PipelineDesc,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        desc.validate()?;

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let pipeline = match desc {
            PipelineDesc::Graphics(graphics) => {
                create_graphics(device, graphics, layout, render_pass)
            }
            PipelineDesc::Compute(compute) => create_compute(device, compute, layout),
        };

        match pipeline {
            Ok(pipeline) => {
                tracing::debug!(bind_point = ?desc.bind_point(), "Created pipeline");
                Ok(Self {
                    pipeline,
                    layout,
                    bind_point: desc.bind_point(),
                })
            }
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }

    /// Bind point to use with `vkCmdBindPipeline`.
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
    stage: &str,
) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::PipelineCreation(format!("{stage} shader module: {e}")))
}

unsafe fn create_compute(
    device: &ash::Device,
    desc: &ComputePipelineDesc,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let shader_module = create_shader_module(device, &desc.shader, "Compute")?;

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader_module)
        .name(c"main");

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);

    let pipelines =
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

    // Shader module is no longer needed once the pipeline exists
    device.destroy_shader_module(shader_module, None);

    first_pipeline(pipelines)
}

unsafe fn create_graphics(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> Result<vk::Pipeline> {
    if render_pass == vk::RenderPass::null() {
        return Err(GpuError::PipelineCreation(
            "graphics pipeline needs a render pass".into(),
        ));
    }

    let vert_module = create_shader_module(device, &desc.vertex_shader, "Vertex")?;
    let frag_module = match create_shader_module(device, &desc.fragment_shader, "Fragment") {
        Ok(module) => module,
        Err(e) => {
            device.destroy_shader_module(vert_module, None);
            return Err(e);
        }
    };

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&desc.vertex_bindings)
        .vertex_attribute_descriptions(&desc.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let colour_blend_attachments: Vec<_> = (0..desc.colour_attachment_count)
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();

    let colour_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&colour_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&colour_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(desc.subpass);

    let pipelines =
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

    device.destroy_shader_module(vert_module, None);
    device.destroy_shader_module(frag_module, None);

    first_pipeline(pipelines)
}

fn first_pipeline(
    created: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
) -> Result<vk::Pipeline> {
    let pipelines = created.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
    pipelines
        .first()
        .copied()
        .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_point_follows_variant() {
        let graphics = PipelineDesc::Graphics(GraphicsPipelineDesc::default());
        assert_eq!(graphics.bind_point(), vk::PipelineBindPoint::GRAPHICS);
        let compute = PipelineDesc::Compute(ComputePipelineDesc::default());
        assert_eq!(compute.bind_point(), vk::PipelineBindPoint::COMPUTE);
    }

    #[test]
    fn empty_shaders_are_rejected() {
        let compute = PipelineDesc::Compute(ComputePipelineDesc::default());
        assert!(matches!(
            compute.validate(),
            Err(GpuError::PipelineCreation(ref m)) if m.starts_with("compute")
        ));

        let graphics = PipelineDesc::Graphics(GraphicsPipelineDesc {
            vertex_shader: vec![0x0723_0203],
            ..Default::default()
        });
        assert!(matches!(
            graphics.validate(),
            Err(GpuError::PipelineCreation(ref m)) if m.starts_with("fragment")
        ));
    }

    #[test]
    fn default_graphics_desc_uses_model_vertices() {
        let desc = GraphicsPipelineDesc::default();
        assert_eq!(desc.vertex_bindings.len(), 1);
        assert_eq!(desc.vertex_attributes.len(), 5);
        assert_eq!(desc.colour_attachment_count, 1);
    }
}
