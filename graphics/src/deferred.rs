//! Host-side command recording.
//!
//! While a submission is open, every command is appended to a
//! [`DeferredCommandBuffer`] instead of a real `vk::CommandBuffer`. The
//! command buffer that will actually carry the work is only acquired when the
//! submission closes, so a pooled command buffer never has to stay reserved
//! for an open submission:
//!
//! ```text
//!   begin_submission          draws, state, binds            end_submission
//!  ┌────────────────┐      ┌───────────────────────┐      ┌──────────────────┐
//!  │ reset() list   │ ───► │ push DeferredCommand  │ ───► │ replay into slot │
//!  └────────────────┘      └───────────────────────┘      │ then queue submit│
//!                                                          └──────────────────┘
//! ```

use ash::vk;

use crate::types::{BufferCopy, IndexType, Rect2D, RenderPassBinding, Viewport};

/// A recorded command, replayed by the backend at submission time.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredCommand {
    BeginRenderPass(RenderPassBinding),
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    SetViewport(Viewport),
    SetScissor(Rect2D),
    SetDepthBias {
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    },
    SetBlendConstants([f32; 4]),
    SetStencilCompareMask {
        face_mask: vk::StencilFaceFlags,
        mask: u32,
    },
    SetStencilWriteMask {
        face_mask: vk::StencilFaceFlags,
        mask: u32,
    },
    SetStencilReference {
        face_mask: vk::StencilFaceFlags,
        reference: u32,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<BufferCopy>,
    },
}

/// Command list of the open submission.
#[derive(Debug, Default)]
pub struct DeferredCommandBuffer {
    commands: Vec<DeferredCommand>,
}

impl DeferredCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all recorded commands, keeping the allocation.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn commands(&self) -> &[DeferredCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: DeferredCommand) {
        log::trace!("DeferredCommandBuffer: {:?}", command);
        self.commands.push(command);
    }

    pub fn cmd_begin_render_pass(&mut self, binding: RenderPassBinding) {
        self.push(DeferredCommand::BeginRenderPass(binding));
    }

    pub fn cmd_end_render_pass(&mut self) {
        self.push(DeferredCommand::EndRenderPass);
    }

    pub fn cmd_bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.push(DeferredCommand::BindPipeline(pipeline));
    }

    pub fn cmd_bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.push(DeferredCommand::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    pub fn cmd_set_viewport(&mut self, viewport: Viewport) {
        self.push(DeferredCommand::SetViewport(viewport));
    }

    pub fn cmd_set_scissor(&mut self, scissor: Rect2D) {
        self.push(DeferredCommand::SetScissor(scissor));
    }

    pub fn cmd_set_depth_bias(&mut self, constant_factor: f32, clamp: f32, slope_factor: f32) {
        self.push(DeferredCommand::SetDepthBias {
            constant_factor,
            clamp,
            slope_factor,
        });
    }

    pub fn cmd_set_blend_constants(&mut self, constants: [f32; 4]) {
        self.push(DeferredCommand::SetBlendConstants(constants));
    }

    pub fn cmd_set_stencil_compare_mask(&mut self, face_mask: vk::StencilFaceFlags, mask: u32) {
        self.push(DeferredCommand::SetStencilCompareMask { face_mask, mask });
    }

    pub fn cmd_set_stencil_write_mask(&mut self, face_mask: vk::StencilFaceFlags, mask: u32) {
        self.push(DeferredCommand::SetStencilWriteMask { face_mask, mask });
    }

    pub fn cmd_set_stencil_reference(&mut self, face_mask: vk::StencilFaceFlags, reference: u32) {
        self.push(DeferredCommand::SetStencilReference {
            face_mask,
            reference,
        });
    }

    pub fn cmd_bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: IndexType) {
        self.push(DeferredCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    pub fn cmd_draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.push(DeferredCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn cmd_draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.push(DeferredCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    pub fn cmd_copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[BufferCopy]) {
        self.push(DeferredCommand::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_recorded_in_order() {
        let mut buffer = DeferredCommandBuffer::new();
        buffer.cmd_set_scissor(Rect2D::new(0, 0, 64, 64));
        buffer.cmd_draw(3, 1, 0, 0);

        assert_eq!(buffer.len(), 2);
        assert_eq!(
            buffer.commands()[0],
            DeferredCommand::SetScissor(Rect2D::new(0, 0, 64, 64))
        );
        assert!(matches!(
            buffer.commands()[1],
            DeferredCommand::Draw {
                vertex_count: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut buffer = DeferredCommandBuffer::new();
        for _ in 0..16 {
            buffer.cmd_end_render_pass();
        }
        let capacity = buffer.commands.capacity();
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.commands.capacity(), capacity);
    }
}
