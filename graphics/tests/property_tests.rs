//! Property tests for submission bookkeeping and sparse bind validation.

mod common;

use ash::vk;
use ash::vk::Handle;
use proptest::prelude::*;

use common::{TestContext, draw, guest_output, textures};
use xegpu_graphics::submission::SparseBindBatcher;
use xegpu_graphics::types::SparseMemoryBind;
use xegpu_graphics::{MAX_FRAMES_IN_FLIGHT, TranslatedShader};

#[derive(Debug, Clone)]
enum Op {
    Draw { textures: u32 },
    Split,
    Swap { slot: u32, version: u64 },
    GpuProgress(usize),
    Poll,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..4).prop_map(|textures| Op::Draw { textures }),
        Just(Op::Split),
        (0u32..3, 0u64..3).prop_map(|(slot, version)| Op::Swap { slot, version }),
        (0usize..3).prop_map(Op::GpuProgress),
        Just(Op::Poll),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_submission_counters_stay_consistent(ops in prop::collection::vec(op(), 1..40)) {
        let mut ctx = TestContext::new();
        let vs = TranslatedShader::vertex().with_float_constants(&[0, 5]);

        for op in &ops {
            match *op {
                Op::Draw { textures: count } => {
                    let ps = TranslatedShader::pixel().with_textures(textures(count));
                    ctx.processor.issue_draw(&draw(&vs, Some(&ps))).unwrap();
                }
                Op::Split => {
                    ctx.processor.begin_submission(false).unwrap();
                    ctx.processor.end_submission(false).unwrap();
                }
                Op::Swap { slot, version } => {
                    ctx.processor.issue_swap(&guest_output(slot, version)).unwrap();
                    let frames_ahead =
                        ctx.processor.current_frame() - ctx.processor.completed_frame();
                    prop_assert!(frames_ahead <= MAX_FRAMES_IN_FLIGHT as u64 + 1);
                }
                Op::GpuProgress(count) => {
                    ctx.backend().complete_submissions(count);
                }
                Op::Poll => {
                    ctx.processor.check_submission_fence_and_device_loss(0).unwrap();
                }
            }

            let current = ctx.processor.current_submission();
            let completed = ctx.processor.completed_submission();
            prop_assert!(completed < current);
            prop_assert!(ctx.backend().pending_submissions() as u64 <= current - 1 - completed);
        }

        prop_assert!(ctx.processor.await_all_queue_operations_completion().unwrap());
        prop_assert_eq!(
            ctx.processor.completed_submission(),
            ctx.processor.current_submission() - 1
        );
        prop_assert_eq!(ctx.backend().pending_submissions(), 0);
    }

    #[test]
    fn prop_sparse_validation_rejects_exactly_overlaps(
        ranges in prop::collection::vec((0u64..64, 1u64..8), 1..24)
    ) {
        let buffer = vk::Buffer::from_raw(0x5000);
        let mut batcher = SparseBindBatcher::new(true);
        let mut accepted: Vec<(u64, u64)> = Vec::new();

        for (start, size) in ranges {
            let end = start + size;
            let bind = SparseMemoryBind {
                resource_offset: start,
                size,
                memory: vk::DeviceMemory::from_raw(0x6000),
                memory_offset: 0,
            };
            let overlaps = accepted.iter().any(|&(s, e)| start < e && s < end);
            let result = batcher.bind_buffer(1, buffer, &[bind], vk::PipelineStageFlags::VERTEX_SHADER);
            prop_assert_eq!(result.is_err(), overlaps);
            if !overlaps {
                accepted.push((start, end));
            }
        }

        prop_assert_eq!(batcher.tracked_range_count(), accepted.len());
        batcher.flushed();
        batcher.retire(1);
        prop_assert_eq!(batcher.tracked_range_count(), 0);
    }
}
