//! Vulkan command pool creation and deferred command replay.

use ash::vk;

use crate::deferred::DeferredCommand;
use crate::error::GraphicsError;
use crate::types::{CommandBufferSlot, Rect2D, Viewport};

/// Create a transient command pool with one primary command buffer.
pub fn create_command_buffer_slot(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<CommandBufferSlot, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);

    let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        GraphicsError::ResourceCreationFailed(format!("Failed to create command pool: {:?}", e))
    })?;

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
        Ok(buffers) => buffers.first().copied(),
        Err(e) => {
            unsafe { device.destroy_command_pool(pool, None) };
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "Failed to allocate command buffer: {:?}",
                e
            )));
        }
    };

    match buffer {
        Some(buffer) => Ok(CommandBufferSlot { pool, buffer }),
        None => {
            unsafe { device.destroy_command_pool(pool, None) };
            Err(GraphicsError::ResourceCreationFailed(
                "command buffer allocation returned nothing".to_string(),
            ))
        }
    }
}

fn to_vk_rect(rect: Rect2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: rect.x,
            y: rect.y,
        },
        extent: vk::Extent2D {
            width: rect.width,
            height: rect.height,
        },
    }
}

fn to_vk_viewport(viewport: Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y,
        width: viewport.width,
        height: viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

/// Begin `command_buffer`, replay `commands` into it and end it.
///
/// # Safety
///
/// The command buffer's pool must have been reset and must not be in use
/// by the GPU.
pub unsafe fn record_commands(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    commands: &[DeferredCommand],
) -> Result<(), GraphicsError> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(|e| GraphicsError::from_vk("vkBeginCommandBuffer", e))?;

        for command in commands {
            match command {
                DeferredCommand::BeginRenderPass(binding) => {
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(binding.render_pass)
                        .framebuffer(binding.framebuffer)
                        .render_area(to_vk_rect(binding.render_area));
                    device.cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);
                }
                DeferredCommand::EndRenderPass => device.cmd_end_render_pass(command_buffer),
                DeferredCommand::BindPipeline(pipeline) => device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    *pipeline,
                ),
                DeferredCommand::BindDescriptorSets {
                    layout,
                    first_set,
                    sets,
                } => device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    *layout,
                    *first_set,
                    sets,
                    &[],
                ),
                DeferredCommand::SetViewport(viewport) => {
                    device.cmd_set_viewport(command_buffer, 0, &[to_vk_viewport(*viewport)])
                }
                DeferredCommand::SetScissor(scissor) => {
                    device.cmd_set_scissor(command_buffer, 0, &[to_vk_rect(*scissor)])
                }
                DeferredCommand::SetDepthBias {
                    constant_factor,
                    clamp,
                    slope_factor,
                } => device.cmd_set_depth_bias(command_buffer, *constant_factor, *clamp, *slope_factor),
                DeferredCommand::SetBlendConstants(constants) => {
                    device.cmd_set_blend_constants(command_buffer, constants)
                }
                DeferredCommand::SetStencilCompareMask { face_mask, mask } => {
                    device.cmd_set_stencil_compare_mask(command_buffer, *face_mask, *mask)
                }
                DeferredCommand::SetStencilWriteMask { face_mask, mask } => {
                    device.cmd_set_stencil_write_mask(command_buffer, *face_mask, *mask)
                }
                DeferredCommand::SetStencilReference {
                    face_mask,
                    reference,
                } => device.cmd_set_stencil_reference(command_buffer, *face_mask, *reference),
                DeferredCommand::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(command_buffer, *buffer, *offset, index_type.to_vk()),
                DeferredCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(
                    command_buffer,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                ),
                DeferredCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    command_buffer,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
                DeferredCommand::CopyBuffer { src, dst, regions } => {
                    let regions: Vec<vk::BufferCopy> = regions
                        .iter()
                        .map(|region| vk::BufferCopy {
                            src_offset: region.src_offset,
                            dst_offset: region.dst_offset,
                            size: region.size,
                        })
                        .collect();
                    device.cmd_copy_buffer(command_buffer, *src, *dst, &regions);
                }
            }
        }

        device
            .end_command_buffer(command_buffer)
            .map_err(|e| GraphicsError::from_vk("vkEndCommandBuffer", e))?;
    }

    Ok(())
}
