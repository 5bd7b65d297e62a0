//! End-to-end tests of the RHI core on the headless device.

use std::sync::Arc;

use ember_core::RhiConfig;
use ember_rhi::barrier::BarrierBatch;
use ember_rhi::binding::{AllocationScope, ShaderBinding, ShaderBindingArray};
use ember_rhi::frame::FramePhase;
use ember_rhi::headless::{DeviceEvent, DeviceFault, HeadlessDevice, SwapchainFault};
use ember_rhi::render_pass::{
    Attachment, LoadStorePolicy, RenderPassDesc, Subpass, SubpassOrdering, SubpassRef,
};
use ember_rhi::resource::{BufferState, ResourceState};
use ember_rhi::state::sampler::SamplerStateDesc;
use ember_rhi::types::{ClearValue, QueueType, TextureDesc};
use ember_rhi::{RhiContext, RhiError, vk};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

fn context(config: RhiConfig) -> (Arc<HeadlessDevice>, RhiContext) {
    let device = Arc::new(HeadlessDevice::new());
    let rhi = RhiContext::new(device.clone(), config).expect("Failed to create RHI context");
    (device, rhi)
}

fn barrier_count(device: &HeadlessDevice) -> usize {
    device
        .events()
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Barrier { .. }))
        .count()
}

fn blocked_waits(device: &HeadlessDevice) -> usize {
    device
        .events()
        .iter()
        .filter(|e| matches!(e, DeviceEvent::FenceWait { blocked: true, .. }))
        .count()
}

#[test]
fn test_single_pass_frame_at_800x600() {
    let (device, mut rhi) = context(RhiConfig::default());
    let depth = rhi
        .create_render_target("depth", vk::Format::D32_SFLOAT, 1)
        .expect("Failed to create depth target");
    device.clear_events();

    let mut frame = rhi
        .begin_render_frame()
        .expect("Failed to begin frame")
        .expect("Frame was skipped");
    assert_eq!(frame.extent(), EXTENT);

    let desc = RenderPassDesc::new(EXTENT)
        .attachment(Attachment::present(
            frame.backbuffer(),
            LoadStorePolicy::ClearStore,
            ClearValue::BLACK,
        ))
        .attachment(Attachment::depth(
            &depth,
            LoadStorePolicy::ClearDontCare,
            ClearValue::DEPTH_ONE,
        ))
        .subpass(Subpass::new().color(0).depth(1));
    let pass = rhi.get_or_create_render_pass(&desc).expect("Failed to build render pass");
    let created = device.stats().render_passes_created;
    let again = rhi.get_or_create_render_pass(&desc).expect("Cached lookup failed");
    assert!(Arc::ptr_eq(&pass, &again));
    assert_eq!(device.stats().render_passes_created, created);

    let cmd = frame.command_buffer_mut();
    pass.begin_render_pass(cmd).expect("Failed to begin render pass");
    cmd.draw(3, 1, 0, 0);
    pass.end_render_pass(cmd);
    assert_eq!(frame.backbuffer().current_state(), ResourceState::Present);

    let available = frame.image_available();
    let finished = frame.render_finished();
    rhi.end_render_frame(frame).expect("Failed to end frame");

    let events = device.events();
    let submits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Submit {
                queue,
                waits,
                signals,
                ..
            } => Some((*queue, waits.clone(), signals.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(submits.len(), 1);
    let (queue, waits, signals) = &submits[0];
    assert_eq!(*queue, QueueType::Graphics);
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].semaphore, available);
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].semaphore, finished);

    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::Present { wait, .. } if *wait == finished)));
    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::Draw { vertex_count: 3, .. })));
}

#[test]
fn test_get_or_create_is_idempotent() {
    let (_device, rhi) = context(RhiConfig::default());

    let linear = rhi
        .get_or_create_sampler(&SamplerStateDesc::linear_repeat())
        .expect("Failed to create sampler");
    let linear_again = rhi
        .get_or_create_sampler(&SamplerStateDesc::linear_repeat())
        .expect("Failed to look up sampler");
    let nearest = rhi
        .get_or_create_sampler(&SamplerStateDesc::nearest_clamp())
        .expect("Failed to create sampler");
    assert!(Arc::ptr_eq(&linear, &linear_again));
    assert!(!Arc::ptr_eq(&linear, &nearest));

    // Layouts are keyed on shape; the bound resources do not matter.
    let a = rhi.create_uniform_buffer("a", 256).expect("Failed to create buffer");
    let b = rhi.create_uniform_buffer("b", 256).expect("Failed to create buffer");
    let stages = vk::ShaderStageFlags::VERTEX;
    let layout_a = rhi
        .get_or_create_binding_layout(&ShaderBindingArray::new().with(ShaderBinding::uniform_buffer(0, stages, &a)))
        .expect("Failed to create layout");
    let layout_b = rhi
        .get_or_create_binding_layout(&ShaderBindingArray::new().with(ShaderBinding::uniform_buffer(0, stages, &b)))
        .expect("Failed to create layout");
    let layout_c = rhi
        .get_or_create_binding_layout(&ShaderBindingArray::new().with(ShaderBinding::uniform_buffer(1, stages, &b)))
        .expect("Failed to create layout");
    assert!(Arc::ptr_eq(&layout_a, &layout_b));
    assert!(!Arc::ptr_eq(&layout_a, &layout_c));

    let stats = rhi.stats().registry;
    assert_eq!(stats.samplers, 2);
    assert_eq!(stats.binding_layouts, 2);
}

#[test]
fn test_transition_no_op_and_round_trip() {
    let (device, rhi) = context(RhiConfig::default());
    let texture = rhi
        .create_texture(
            TextureDesc::sampled("albedo", vk::Extent2D { width: 4, height: 4 }, vk::Format::R8G8B8A8_UNORM),
            Some(&[0xff; 64]),
        )
        .expect("Failed to create texture");
    assert_eq!(texture.current_state(), ResourceState::ShaderReadOnly);

    let mut commands = rhi.command_buffers(QueueType::Graphics);
    let mut cmd = commands
        .get_or_create_command_buffer()
        .expect("Failed to get command buffer");
    device.clear_events();

    assert!(!rhi.transition_layout(&mut cmd, &texture, ResourceState::ShaderReadOnly));
    assert_eq!(barrier_count(&device), 0);
    assert_eq!(texture.current_state(), ResourceState::ShaderReadOnly);

    assert!(rhi.transition_layout(&mut cmd, &texture, ResourceState::TransferDst));
    assert!(rhi.transition_layout(&mut cmd, &texture, ResourceState::ShaderReadOnly));
    assert_eq!(barrier_count(&device), 2);
    assert_eq!(texture.current_state(), ResourceState::ShaderReadOnly);

    commands.submit_and_wait(&mut cmd).expect("Submit failed");
    commands.return_command_buffer(cmd);
}

#[test]
fn test_batched_transitions_record_one_barrier() {
    let (device, mut rhi) = context(RhiConfig::default());
    let color = rhi
        .create_render_target("color", vk::Format::R8G8B8A8_UNORM, 1)
        .expect("Failed to create target");
    let depth = rhi
        .create_render_target("depth", vk::Format::D32_SFLOAT, 1)
        .expect("Failed to create target");
    let buffer = rhi.create_uniform_buffer("ubo", 256).expect("Failed to create buffer");

    let mut commands = rhi.command_buffers(QueueType::Graphics);
    let mut cmd = commands
        .get_or_create_command_buffer()
        .expect("Failed to get command buffer");
    device.clear_events();

    let mut batch = BarrierBatch::new();
    batch.add_texture(&color, ResourceState::ColorAttachment);
    batch.add_texture(&depth, ResourceState::DepthStencilAttachment);
    batch.add_buffer(&buffer, BufferState::ShaderRead);
    assert!(batch.flush(&mut cmd));
    assert!(!batch.flush(&mut cmd));

    assert_eq!(barrier_count(&device), 1);
    assert_eq!(color.current_state(), ResourceState::ColorAttachment);
    assert_eq!(depth.current_state(), ResourceState::DepthStencilAttachment);

    commands.submit_and_wait(&mut cmd).expect("Submit failed");
    commands.return_command_buffer(cmd);
}

#[test]
fn test_render_pass_invalidated_by_attachment_changes() {
    let (_device, mut rhi) = context(RhiConfig::default());
    let color = rhi
        .create_render_target("color", vk::Format::R8G8B8A8_UNORM, 1)
        .expect("Failed to create target");
    let desc = |texture| {
        RenderPassDesc::new(EXTENT)
            .attachment(Attachment::color(texture, LoadStorePolicy::ClearStore, ClearValue::BLACK))
            .subpass(Subpass::new().color(0))
    };

    let pass = rhi.get_or_create_render_pass(&desc(&color)).expect("Failed to build pass");
    assert!(!pass.is_invalidated());

    color
        .resize(vk::Extent2D {
            width: 1024,
            height: 768,
        })
        .expect("Failed to resize");
    assert!(pass.is_invalidated());

    let rebuilt = rhi.get_or_create_render_pass(&desc(&color)).expect("Failed to rebuild pass");
    assert!(!Arc::ptr_eq(&pass, &rebuilt));
    assert!(!rebuilt.is_invalidated());

    color.destroy();
    assert!(rebuilt.is_invalidated());
}

#[test]
fn test_command_buffer_not_reused_before_fence() {
    let (device, rhi) = context(RhiConfig::default());
    device.set_auto_complete(false);

    let mut commands = rhi.command_buffers(QueueType::Graphics);
    let mut first = commands
        .get_or_create_command_buffer()
        .expect("Failed to get command buffer");
    let first_handle = first.handle();
    commands.submit(&mut first, &[], &[]).expect("Submit failed");
    commands.return_command_buffer(first);

    let second = commands
        .get_or_create_command_buffer()
        .expect("Failed to get command buffer");
    assert_ne!(second.handle(), first_handle);
    commands.return_command_buffer(second);

    assert!(device.complete_next());
    let third = commands
        .get_or_create_command_buffer()
        .expect("Failed to get command buffer");
    assert_eq!(third.handle(), first_handle);
    commands.return_command_buffer(third);
}

#[test]
fn test_frame_pacing_waits_for_slot_reuse() {
    let (device, mut rhi) = context(RhiConfig::default());
    let depth = rhi.frames().frames_in_flight();
    assert_eq!(depth, 3);
    device.set_auto_complete(false);
    device.clear_events();

    for _ in 0..depth {
        let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
        rhi.end_render_frame(frame).expect("End failed");
    }
    assert_eq!(blocked_waits(&device), 0);
    assert_eq!(device.pending_submissions(), depth);

    for reused in 1..=2 {
        let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
        assert_eq!(blocked_waits(&device), reused);
        assert_eq!(rhi.frames().completed_serial(), reused as u64);
        rhi.end_render_frame(frame).expect("End failed");
    }
}

#[test]
fn test_single_frame_pool_exhaustion() {
    let config = RhiConfig {
        max_descriptor_sets_per_frame: 2,
        ..Default::default()
    };
    let (_device, mut rhi) = context(config);
    let buffer = rhi.create_uniform_buffer("ubo", 256).expect("Failed to create buffer");
    let bindings = ShaderBindingArray::new().with(ShaderBinding::uniform_buffer(
        0,
        vk::ShaderStageFlags::FRAGMENT,
        &buffer,
    ));
    let layout = rhi.get_or_create_binding_layout(&bindings).expect("Failed to create layout");

    for _ in 0..4 {
        let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
        let first = rhi.create_shader_binding_instance(&layout, &bindings, AllocationScope::Frame(&frame));
        let second = rhi.create_shader_binding_instance(&layout, &bindings, AllocationScope::Frame(&frame));
        let third = rhi.create_shader_binding_instance(&layout, &bindings, AllocationScope::Frame(&frame));
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(matches!(third, Err(RhiError::DescriptorPoolExhausted(_))));
        drop((first, second, third));
        rhi.end_render_frame(frame).expect("End failed");
    }
}

#[test]
fn test_persistent_binding_freed_after_its_frame_completes() {
    let (device, mut rhi) = context(RhiConfig::default());
    let buffer = rhi.create_uniform_buffer("ubo", 256).expect("Failed to create buffer");
    let bindings = ShaderBindingArray::new().with(ShaderBinding::uniform_buffer(
        0,
        vk::ShaderStageFlags::VERTEX,
        &buffer,
    ));
    let layout = rhi.get_or_create_binding_layout(&bindings).expect("Failed to create layout");
    let instance = rhi
        .create_shader_binding_instance(&layout, &bindings, AllocationScope::Persistent)
        .expect("Failed to allocate");
    assert_eq!(rhi.stats().persistent_descriptor_sets, 1);
    device.set_auto_complete(false);

    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
    instance.free();
    rhi.end_render_frame(frame).expect("End failed");
    assert_eq!(rhi.stats().persistent_descriptor_sets, 1);

    // Slots 1 and 2 have no earlier submissions to wait on.
    for _ in 0..2 {
        let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
        rhi.end_render_frame(frame).expect("End failed");
    }
    assert_eq!(rhi.stats().persistent_descriptor_sets, 1);

    // Reusing slot 0 waits for the frame the set was freed in.
    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
    assert_eq!(rhi.stats().persistent_descriptor_sets, 0);
    rhi.end_render_frame(frame).expect("End failed");
}

#[test]
fn test_resize_invalidates_swapchain_sized_passes() {
    let (device, mut rhi) = context(RhiConfig::default());
    let depth = rhi
        .create_render_target("depth", vk::Format::D32_SFLOAT, 1)
        .expect("Failed to create depth target");
    let pass = rhi
        .get_or_create_render_pass(
            &RenderPassDesc::new(EXTENT)
                .attachment(Attachment::depth(&depth, LoadStorePolicy::ClearStore, ClearValue::DEPTH_ONE))
                .subpass(Subpass::new().depth(0)),
        )
        .expect("Failed to build pass");
    assert_eq!(rhi.stats().registry.render_passes, 1);

    let resized = vk::Extent2D {
        width: 1280,
        height: 720,
    };
    rhi.request_resize(resized);
    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Resize skipped the frame");
    assert_eq!(frame.extent(), resized);
    assert_eq!(depth.extent(), resized);
    assert!(pass.is_invalidated());
    assert_eq!(rhi.stats().registry.render_passes, 0);
    rhi.end_render_frame(frame).expect("End failed");

    assert!(device
        .events()
        .iter()
        .any(|e| matches!(e, DeviceEvent::SwapchainRecreated { width: 1280, height: 720 })));
}

fn run_frame(rhi: &mut RhiContext) {
    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
    rhi.end_render_frame(frame).expect("End failed");
}

#[test]
fn test_passes_of_destroyed_targets_are_evicted_each_frame() {
    let (_device, mut rhi) = context(RhiConfig::default());

    for _ in 0..8 {
        let color = rhi
            .create_render_target("scratch", vk::Format::R8G8B8A8_UNORM, 1)
            .expect("Failed to create target");
        rhi.get_or_create_render_pass(
            &RenderPassDesc::new(EXTENT)
                .attachment(Attachment::color(&color, LoadStorePolicy::ClearStore, ClearValue::BLACK))
                .subpass(Subpass::new().color(0)),
        )
        .expect("Failed to build pass");
        assert_eq!(rhi.stats().registry.render_passes, 1);

        color.destroy();
        run_frame(&mut rhi);
        assert_eq!(rhi.stats().registry.render_passes, 0);
    }
    assert_eq!(rhi.stats().frame.swapchain_recreations, 0);
}

#[test]
fn test_offscreen_pass_survives_resize() {
    let (_device, mut rhi) = context(RhiConfig::default());
    let shadow = rhi
        .create_texture(
            TextureDesc::render_target("shadow map", EXTENT, vk::Format::D32_SFLOAT, 1),
            None,
        )
        .expect("Failed to create texture");
    let pass = rhi
        .get_or_create_render_pass(
            &RenderPassDesc::new(EXTENT)
                .attachment(Attachment::depth(&shadow, LoadStorePolicy::ClearStore, ClearValue::DEPTH_ONE))
                .subpass(Subpass::new().depth(0)),
        )
        .expect("Failed to build pass");

    rhi.request_resize(vk::Extent2D {
        width: 1024,
        height: 768,
    });
    run_frame(&mut rhi);

    assert_eq!(rhi.stats().frame.swapchain_recreations, 1);
    assert!(!pass.is_invalidated());
    assert_eq!(shadow.extent(), EXTENT);
    assert_eq!(rhi.stats().registry.render_passes, 1);
}

#[test]
fn test_failed_submit_leaves_frame_loop_usable() {
    let (device, mut rhi) = context(RhiConfig::default());
    run_frame(&mut rhi);

    device.inject_device_fault(DeviceFault::SubmitFails);
    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
    assert!(matches!(rhi.end_render_frame(frame), Err(RhiError::VulkanError(_))));
    assert_eq!(rhi.frames().phase(), FramePhase::Idle);
    assert_eq!(rhi.command_buffers(QueueType::Graphics).in_use_count(), 0);

    let frame = rhi.begin_render_frame().expect("Begin after failure failed").expect("Skipped");
    assert_eq!(frame.serial(), 2);
    rhi.end_render_frame(frame).expect("End after failure failed");

    let stats = rhi.stats().frame;
    assert_eq!(stats.failed_frames, 1);
    assert_eq!(stats.frames_presented, 2);
    assert_eq!(stats.swapchain_recreations, 1);
    assert_eq!(rhi.command_buffers(QueueType::Graphics).allocated_count(), 1);
}

#[test]
fn test_failed_present_leaves_frame_loop_usable() {
    let (device, mut rhi) = context(RhiConfig::default());

    device.inject_device_fault(DeviceFault::PresentFails);
    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
    assert!(rhi.end_render_frame(frame).is_err());
    assert_eq!(rhi.frames().phase(), FramePhase::Idle);
    rhi.finish().expect("Finish after failed present failed");

    let frame = rhi.begin_render_frame().expect("Begin after failure failed").expect("Skipped");
    assert_eq!(frame.serial(), 2);
    rhi.end_render_frame(frame).expect("End after failure failed");

    let stats = rhi.stats().frame;
    assert_eq!(stats.failed_frames, 1);
    assert_eq!(stats.frames_presented, 1);
    assert_eq!(stats.swapchain_recreations, 1);
}

#[test]
fn test_out_of_date_present_recreates_after_the_frame() {
    let (device, mut rhi) = context(RhiConfig::default());
    run_frame(&mut rhi);

    device.inject_swapchain_fault(SwapchainFault::OutOfDateOnPresent);
    device.clear_events();
    run_frame(&mut rhi);

    let events = device.events();
    let present = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::Present { .. }))
        .expect("No present");
    let recreated = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::SwapchainRecreated { .. }))
        .expect("No recreation");
    assert!(present < recreated);

    let stats = rhi.stats().frame;
    assert_eq!(stats.frames_presented, 2);
    assert_eq!(stats.skipped_frames, 0);
    assert_eq!(stats.swapchain_recreations, 1);

    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");
    assert_eq!(frame.serial(), 3);
    rhi.end_render_frame(frame).expect("End failed");
}

#[test]
fn test_explicit_ordering_rejects_bad_edges() {
    let (_device, mut rhi) = context(RhiConfig::default());
    let albedo = rhi
        .create_render_target("albedo", vk::Format::R8G8B8A8_UNORM, 1)
        .expect("Failed to create target");
    let lit = rhi
        .create_render_target("lit", vk::Format::R8G8B8A8_UNORM, 1)
        .expect("Failed to create target");
    let desc = |edges: Vec<(u32, u32)>| {
        RenderPassDesc::new(EXTENT)
            .attachment(Attachment::color(&albedo, LoadStorePolicy::ClearDontCare, ClearValue::BLACK))
            .attachment(Attachment::color(&lit, LoadStorePolicy::ClearStore, ClearValue::BLACK))
            .subpass(Subpass::new().color(0))
            .subpass(Subpass::new().input(0).color(1))
            .ordering(SubpassOrdering::Explicit(edges))
    };

    for edges in [vec![(1, 0)], vec![(1, 1)], vec![(0, 2)]] {
        assert!(
            matches!(rhi.get_or_create_render_pass(&desc(edges.clone())), Err(RhiError::RenderPassError(_))),
            "{:?}",
            edges
        );
    }
    assert_eq!(rhi.stats().registry.render_passes, 0);
    rhi.get_or_create_render_pass(&desc(vec![(0, 1)]))
        .expect("Valid edge was rejected");
}

#[test]
fn test_dependencies_include_external_boundaries() {
    let (_device, mut rhi) = context(RhiConfig::default());
    let targets: Vec<_> = (0..3)
        .map(|i| {
            rhi.create_render_target(&format!("target {}", i), vk::Format::R8G8B8A8_UNORM, 1)
                .expect("Failed to create target")
        })
        .collect();
    let mut desc = RenderPassDesc::new(EXTENT);
    for (i, target) in targets.iter().enumerate() {
        desc = desc
            .attachment(Attachment::color(target, LoadStorePolicy::ClearStore, ClearValue::BLACK))
            .subpass(Subpass::new().color(i as u32));
    }

    let edges = |deps: &[ember_rhi::render_pass::SubpassDependency]| {
        deps.iter().map(|d| (d.src, d.dst)).collect::<Vec<_>>()
    };
    use SubpassRef::{External, Index};

    let linear = rhi.get_or_create_render_pass(&desc).expect("Failed to build pass");
    assert_eq!(
        edges(&linear.layout().dependencies),
        vec![
            (External, Index(0)),
            (Index(0), Index(1)),
            (Index(1), Index(2)),
            (Index(2), External),
        ]
    );

    let explicit = desc.ordering(SubpassOrdering::Explicit(vec![(0, 2)]));
    assert_eq!(
        edges(&explicit.dependencies()),
        vec![(External, Index(0)), (Index(0), Index(2)), (Index(2), External)]
    );
}

#[test]
fn test_multisampled_presentation_requires_resolve() {
    let (_device, mut rhi) = context(RhiConfig::default());
    let msaa = rhi
        .create_render_target("msaa color", vk::Format::B8G8R8A8_SRGB, 4)
        .expect("Failed to create target");
    let frame = rhi.begin_render_frame().expect("Begin failed").expect("Skipped");

    let unresolved = RenderPassDesc::new(EXTENT)
        .attachment(Attachment::color(&msaa, LoadStorePolicy::ClearStore, ClearValue::BLACK))
        .attachment(Attachment::present(
            frame.backbuffer(),
            LoadStorePolicy::DontCareStore,
            ClearValue::BLACK,
        ))
        .subpass(Subpass::new().color(0))
        .subpass(Subpass::new().input(0).color(1));
    assert!(matches!(
        rhi.get_or_create_render_pass(&unresolved),
        Err(RhiError::RenderPassError(_))
    ));

    let never_written = RenderPassDesc::new(EXTENT)
        .attachment(Attachment::present(
            frame.backbuffer(),
            LoadStorePolicy::LoadStore,
            ClearValue::BLACK,
        ))
        .subpass(Subpass::new().input(0));
    assert!(matches!(
        rhi.get_or_create_render_pass(&never_written),
        Err(RhiError::RenderPassError(_))
    ));

    let resolved = RenderPassDesc::new(EXTENT)
        .attachment(Attachment::color(&msaa, LoadStorePolicy::ClearDontCare, ClearValue::BLACK))
        .attachment(Attachment::present(
            frame.backbuffer(),
            LoadStorePolicy::DontCareStore,
            ClearValue::BLACK,
        ))
        .subpass(Subpass::new().color(0).resolve(1));
    rhi.get_or_create_render_pass(&resolved)
        .expect("Resolved MSAA pass was rejected");
    rhi.end_render_frame(frame).expect("End failed");
}

#[test]
fn test_barriers_use_stages_of_the_recording_queue() {
    let (device, rhi) = context(RhiConfig::default());
    let texture = rhi
        .create_texture(
            TextureDesc::sampled("lut", vk::Extent2D { width: 4, height: 4 }, vk::Format::R8G8B8A8_UNORM),
            Some(&[0; 64]),
        )
        .expect("Failed to create texture");
    let last_barrier = |device: &HeadlessDevice| {
        device.events().iter().rev().find_map(|e| match e {
            DeviceEvent::Barrier { barrier, .. } => Some((barrier.src_stage, barrier.dst_stage)),
            _ => None,
        })
    };

    {
        let mut copies = rhi.command_buffers(QueueType::Copy);
        let mut cmd = copies.get_or_create_command_buffer().expect("Failed to get command buffer");
        assert!(rhi.transition_layout(&mut cmd, &texture, ResourceState::TransferDst));
        assert_eq!(
            last_barrier(&device),
            Some((vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER))
        );
        copies.submit_and_wait(&mut cmd).expect("Submit failed");
        copies.return_command_buffer(cmd);
    }

    let mut compute = rhi.command_buffers(QueueType::Compute);
    let mut cmd = compute.get_or_create_command_buffer().expect("Failed to get command buffer");
    assert!(rhi.transition_layout(&mut cmd, &texture, ResourceState::ShaderReadOnly));
    assert_eq!(
        last_barrier(&device),
        Some((vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::COMPUTE_SHADER))
    );
    compute.submit_and_wait(&mut cmd).expect("Submit failed");
    compute.return_command_buffer(cmd);
}
