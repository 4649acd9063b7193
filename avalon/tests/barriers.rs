//! Barrier emission from the buffer access tracker and the image layout
//! tracker.

mod common;

use avalon::vk::Handle;
use avalon::{vk, BufferResource, GarbageList, ImageLayout, SubmissionTimeline};
use common::{color_image, release_weak_image, Command, RecordingEncoder};

#[test]
fn first_buffer_access_emits_no_barrier() {
    let mut encoder = RecordingEncoder::new();
    let mut buffer = BufferResource::from_raw(vk::Buffer::from_raw(1), 256);
    buffer.record_access(
        &mut encoder,
        vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        vk::AccessFlags::empty(),
    );
    assert!(encoder.commands.is_empty());

    let timeline = SubmissionTimeline::new();
    let mut garbage = GarbageList::new();
    buffer.release(&timeline, &mut garbage);
    assert!(garbage.is_empty());
}

#[test]
fn write_after_read_needs_execution_ordering_only() {
    let mut encoder = RecordingEncoder::new();
    let mut buffer = BufferResource::from_raw(vk::Buffer::from_raw(1), 256);
    buffer.record_access(
        &mut encoder,
        vk::AccessFlags::INDEX_READ,
        vk::AccessFlags::empty(),
    );
    buffer.record_access(
        &mut encoder,
        vk::AccessFlags::empty(),
        vk::AccessFlags::TRANSFER_WRITE,
    );

    assert_eq!(encoder.commands.len(), 1);
    match &encoder.commands[0] {
        Command::MemoryBarrier {
            src_stage_mask,
            dst_stage_mask,
            barrier,
        } => {
            assert_eq!(*src_stage_mask, vk::PipelineStageFlags::ALL_COMMANDS);
            assert_eq!(*dst_stage_mask, vk::PipelineStageFlags::ALL_COMMANDS);
            // The previous access was a pure read: nothing to make available.
            assert_eq!(barrier.src_access_mask, vk::AccessFlags::empty());
            assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        }
        other => panic!("expected a memory barrier, got {:?}", other),
    }

    let timeline = SubmissionTimeline::new();
    let mut garbage = GarbageList::new();
    buffer.release(&timeline, &mut garbage);
}

#[test]
fn buffer_copy_merges_both_trackers_into_one_barrier() {
    let mut encoder = RecordingEncoder::new();
    let mut src = BufferResource::from_raw(vk::Buffer::from_raw(1), 256);
    let mut dst = BufferResource::from_raw(vk::Buffer::from_raw(2), 256);

    // Both buffers carry prior accesses the copy must order against.
    src.record_access(
        &mut encoder,
        vk::AccessFlags::empty(),
        vk::AccessFlags::SHADER_WRITE,
    );
    dst.record_access(
        &mut encoder,
        vk::AccessFlags::SHADER_READ,
        vk::AccessFlags::empty(),
    );
    encoder.take();

    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: 256,
    };
    dst.copy_from(&mut encoder, &mut src, &[region]);

    assert_eq!(encoder.commands.len(), 2);
    match &encoder.commands[0] {
        Command::MemoryBarrier {
            dst_stage_mask,
            barrier,
            ..
        } => {
            assert_eq!(*dst_stage_mask, vk::PipelineStageFlags::TRANSFER);
            assert_eq!(barrier.src_access_mask, vk::AccessFlags::SHADER_WRITE);
            assert_eq!(
                barrier.dst_access_mask,
                vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE
            );
        }
        other => panic!("expected a memory barrier, got {:?}", other),
    }
    match &encoder.commands[1] {
        Command::CopyBuffer {
            src: copy_src,
            dst: copy_dst,
            regions,
        } => {
            assert_eq!(*copy_src, src.buffer());
            assert_eq!(*copy_dst, dst.buffer());
            assert_eq!(regions.len(), 1);
            assert_eq!(regions[0].size, 256);
        }
        other => panic!("expected a copy, got {:?}", other),
    }

    let timeline = SubmissionTimeline::new();
    let mut garbage = GarbageList::new();
    src.release(&timeline, &mut garbage);
    dst.release(&timeline, &mut garbage);
}

#[test]
fn first_layout_transition_is_a_full_barrier() {
    let mut encoder = RecordingEncoder::new();
    let mut image = color_image(1, 1);
    image.transition(&mut encoder, ImageLayout::TransferDst, vk::QUEUE_FAMILY_IGNORED);

    assert_eq!(encoder.commands.len(), 1);
    match &encoder.commands[0] {
        Command::ImageBarrier {
            src_stage_mask,
            dst_stage_mask,
            barrier,
        } => {
            assert_eq!(*src_stage_mask, vk::PipelineStageFlags::TOP_OF_PIPE);
            assert_eq!(*dst_stage_mask, vk::PipelineStageFlags::TRANSFER);
            assert_eq!(barrier.src_access_mask, vk::AccessFlags::empty());
            assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
            assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
            assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(barrier.image, image.image());
            assert_eq!(barrier.subresource_range.level_count, 1);
            assert_eq!(barrier.subresource_range.layer_count, 1);
        }
        other => panic!("expected an image barrier, got {:?}", other),
    }
    assert_eq!(image.current_layout(), ImageLayout::TransferDst);
    release_weak_image(image);
}

#[test]
fn repeated_transfer_dst_needs_only_an_execution_barrier() {
    let mut encoder = RecordingEncoder::new();
    let mut image = color_image(1, 1);
    image.change_layout(&mut encoder, ImageLayout::TransferDst);
    encoder.take();

    image.change_layout(&mut encoder, ImageLayout::TransferDst);
    assert_eq!(encoder.commands.len(), 1);
    match &encoder.commands[0] {
        Command::ExecutionBarrier {
            src_stage_mask,
            dst_stage_mask,
        } => {
            assert_eq!(*src_stage_mask, vk::PipelineStageFlags::TRANSFER);
            assert_eq!(*dst_stage_mask, vk::PipelineStageFlags::TRANSFER);
        }
        other => panic!("expected an execution barrier, got {:?}", other),
    }
    release_weak_image(image);
}

#[test]
fn read_only_layout_reuse_emits_nothing() {
    let mut encoder = RecordingEncoder::new();
    let mut image = color_image(1, 1);
    image.change_layout(&mut encoder, ImageLayout::AllGraphicsShadersReadOnly);
    encoder.take();

    image.change_layout(&mut encoder, ImageLayout::AllGraphicsShadersReadOnly);
    assert!(encoder.commands.is_empty());
    release_weak_image(image);
}

#[test]
fn queue_family_transfer_forces_a_full_barrier() {
    let mut encoder = RecordingEncoder::new();
    let mut image = color_image(1, 1);
    image.transition(&mut encoder, ImageLayout::TransferDst, 0);
    encoder.take();

    // Same layout, different family: ownership transfer.
    image.transition(&mut encoder, ImageLayout::TransferDst, 1);
    assert_eq!(encoder.commands.len(), 1);
    match &encoder.commands[0] {
        Command::ImageBarrier { barrier, .. } => {
            assert_eq!(barrier.src_queue_family_index, 0);
            assert_eq!(barrier.dst_queue_family_index, 1);
            assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        }
        other => panic!("expected an image barrier, got {:?}", other),
    }
    assert_eq!(image.current_queue_family(), 1);
    release_weak_image(image);
}

#[test]
fn present_transition_drains_attachment_writes() {
    let mut encoder = RecordingEncoder::new();
    let mut image = color_image(1, 1);
    image.change_layout(&mut encoder, ImageLayout::ColorAttachment);
    encoder.take();

    image.change_layout(&mut encoder, ImageLayout::Present);
    assert_eq!(encoder.commands.len(), 1);
    match &encoder.commands[0] {
        Command::ImageBarrier {
            src_stage_mask,
            dst_stage_mask,
            barrier,
        } => {
            assert_eq!(
                *src_stage_mask,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            );
            assert_eq!(*dst_stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
            assert_eq!(
                barrier.src_access_mask,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            );
            assert_eq!(barrier.dst_access_mask, vk::AccessFlags::empty());
            assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        }
        other => panic!("expected an image barrier, got {:?}", other),
    }
    release_weak_image(image);
}

#[test]
fn generate_mipmaps_barriers_each_level_and_ends_transfer_src() {
    let mut encoder = RecordingEncoder::new();
    let mut image = color_image(4, 1);
    image.change_layout(&mut encoder, ImageLayout::TransferDst);
    encoder.take();

    image.generate_mipmaps(&mut encoder, 3, vk::Filter::LINEAR);

    // Re-entering TransferDst costs one execution barrier, then each level
    // gets a transfer barrier and a blit, then the last level is brought in
    // line with the rest.
    assert_eq!(encoder.commands.len(), 8);
    assert!(matches!(
        encoder.commands[0],
        Command::ExecutionBarrier { .. }
    ));
    for level in 1..=3u32 {
        let barrier_index = (level as usize - 1) * 2 + 1;
        match &encoder.commands[barrier_index] {
            Command::ImageBarrier { barrier, .. } => {
                assert_eq!(barrier.subresource_range.base_mip_level, level - 1);
                assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
                assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_READ);
            }
            other => panic!("level {}: expected a barrier, got {:?}", level, other),
        }
        match &encoder.commands[barrier_index + 1] {
            Command::BlitImage {
                src_layout,
                dst_layout,
                regions,
                filter,
                ..
            } => {
                assert_eq!(*src_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                assert_eq!(*dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(*filter, vk::Filter::LINEAR);
                assert_eq!(regions.len(), 1);
                let blit = &regions[0];
                assert_eq!(blit.src_subresource.mip_level, level - 1);
                assert_eq!(blit.dst_subresource.mip_level, level);
                let size: i32 = 64 >> (level - 1);
                assert_eq!(blit.src_offsets[1].x, size);
                assert_eq!(blit.src_offsets[1].y, size);
                assert_eq!(blit.dst_offsets[1].x, size / 2);
                assert_eq!(blit.dst_offsets[1].y, size / 2);
            }
            other => panic!("level {}: expected a blit, got {:?}", level, other),
        }
    }
    match &encoder.commands[7] {
        Command::ImageBarrier { barrier, .. } => {
            assert_eq!(barrier.subresource_range.base_mip_level, 3);
            assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        }
        other => panic!("expected the final barrier, got {:?}", other),
    }
    assert_eq!(image.current_layout(), ImageLayout::TransferSrc);
    release_weak_image(image);
}
