//! WGSL to SPIR-V translation and graphics pipeline creation
//!
//! Pipelines render through dynamic rendering, so no render pass objects exist.
//! Viewport, scissor and stencil reference are dynamic state.

use super::conversion;
use crate::backend::traits::*;
use ash::vk;

/// Translate a WGSL module with naga. Both entry points end up in one SPIR-V module.
pub(super) fn compile_wgsl(source: &str) -> BackendResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| BackendError::ShaderCreationFailed(e.emit_to_string(source)))?;
    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::empty())
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(e.emit_to_string(source)))?;
    let options = naga::back::spv::Options::default();
    naga::back::spv::write_vec(&module, &info, &options, None)
        .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))
}

/// Create the layout and pipeline for `desc`. The caller owns both on success.
pub(super) fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &RenderPipelineDescriptor,
    set_layouts: &[vk::DescriptorSetLayout],
    depth_stencil_format: vk::Format,
) -> BackendResult<(vk::Pipeline, vk::PipelineLayout)> {
    let code = compile_wgsl(&desc.shader)?;

    unsafe {
        let module = device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&code), None)
            .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?;

        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_shader_module(module, None);
                return Err(BackendError::PipelineCreationFailed(e.to_string()));
            }
        };

        let result = build(device, desc, module, layout, depth_stencil_format);
        device.destroy_shader_module(module, None);
        match result {
            Ok(pipeline) => Ok((pipeline, layout)),
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }
}

unsafe fn build(
    device: &ash::Device,
    desc: &RenderPipelineDescriptor,
    module: vk::ShaderModule,
    layout: vk::PipelineLayout,
    depth_stencil_format: vk::Format,
) -> BackendResult<vk::Pipeline> {
    let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(module)
        .name(c"vs_main")];
    if !desc.color_targets.is_empty() {
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(c"fs_main"),
        );
    }

    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_layouts
        .iter()
        .enumerate()
        .map(|(slot, layout)| vk::VertexInputBindingDescription {
            binding: slot as u32,
            stride: layout.array_stride as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_layouts
        .iter()
        .enumerate()
        .flat_map(|(slot, layout)| {
            layout.attributes.iter().map(move |attr| vk::VertexInputAttributeDescription {
                location: attr.location,
                binding: slot as u32,
                format: conversion::vertex_format(attr.format),
                offset: attr.offset as u32,
            })
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(conversion::topology(desc.primitive_topology));

    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let bias = desc.depth_stencil.as_ref().map(|ds| ds.bias).unwrap_or_default();
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(conversion::cull_mode(desc.cull_mode))
        .front_face(conversion::front_face(desc.front_face))
        .depth_bias_enable(bias.constant != 0 || bias.slope_scale != 0.0)
        .depth_bias_constant_factor(bias.constant as f32)
        .depth_bias_slope_factor(bias.slope_scale)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(conversion::sample_count(desc.sample_count))
        .alpha_to_coverage_enable(desc.alpha_to_coverage);

    let mut depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();
    let mut depth_format = vk::Format::UNDEFINED;
    let mut stencil_format = vk::Format::UNDEFINED;
    if let Some(ds) = &desc.depth_stencil {
        depth_format = conversion::format(ds.format, depth_stencil_format);
        if ds.format.has_stencil() {
            stencil_format = depth_format;
        }
        depth_stencil = depth_stencil
            .depth_test_enable(true)
            .depth_write_enable(ds.depth_write_enabled)
            .depth_compare_op(conversion::compare_op(ds.depth_compare));
        if let Some(face) = ds.stencil {
            let state = vk::StencilOpState {
                fail_op: conversion::stencil_op(face.fail_op),
                pass_op: conversion::stencil_op(face.pass_op),
                depth_fail_op: conversion::stencil_op(face.depth_fail_op),
                compare_op: conversion::compare_op(face.compare),
                compare_mask: face.read_mask,
                write_mask: face.write_mask,
                reference: 0,
            };
            depth_stencil = depth_stencil.stencil_test_enable(true).front(state).back(state);
        }
    }

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_targets
        .iter()
        .map(|target| {
            let mut state = vk::PipelineColorBlendAttachmentState {
                color_write_mask: conversion::color_writes(target.write_mask),
                ..Default::default()
            };
            if let Some(blend) = target.blend {
                state.blend_enable = vk::TRUE;
                state.src_color_blend_factor = conversion::blend_factor(blend.color.src_factor);
                state.dst_color_blend_factor = conversion::blend_factor(blend.color.dst_factor);
                state.color_blend_op = conversion::blend_op(blend.color.operation);
                state.src_alpha_blend_factor = conversion::blend_factor(blend.alpha.src_factor);
                state.dst_alpha_blend_factor = conversion::blend_factor(blend.alpha.dst_factor);
                state.alpha_blend_op = conversion::blend_op(blend.alpha.operation);
            }
            state
        })
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::STENCIL_REFERENCE,
    ];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc
        .color_targets
        .iter()
        .map(|target| conversion::format(target.format, depth_stencil_format))
        .collect();
    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .push_next(&mut rendering);

    device
        .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
        .map(|pipelines| pipelines[0])
        .map_err(|(_, e)| {
            BackendError::PipelineCreationFailed(format!(
                "{}: {}",
                desc.label.as_deref().unwrap_or("pipeline"),
                e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIANGLE: &str = r#"
        @vertex
        fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
            return vec4<f32>(position, 1.0);
        }

        @fragment
        fn fs_main() -> @location(0) vec4<f32> {
            return vec4<f32>(1.0, 0.0, 0.0, 1.0);
        }
    "#;

    #[test]
    fn wgsl_compiles_to_spirv() {
        let words = compile_wgsl(TRIANGLE).unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn wgsl_errors_are_shader_errors() {
        let err = compile_wgsl("fn vs_main( {").unwrap_err();
        assert!(matches!(err, BackendError::ShaderCreationFailed(_)));
    }
}
