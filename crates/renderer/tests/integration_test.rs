//! Integration tests for the render pipelines on the headless device.

use std::sync::Arc;

use ember_core::RhiConfig;
use ember_renderer::uniforms::Vertex;
use ember_renderer::{Mesh, PipelineKind, Renderer, Scene, ShaderSet};
use ember_rhi::RhiError;
use ember_rhi::headless::{DeviceEvent, HeadlessDevice, SwapchainFault};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Placeholder modules; the headless device only checks they are non-empty.
fn shaders() -> ShaderSet {
    let module = |id: u32| vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, id];
    ShaderSet {
        mesh_vertex: module(1),
        mesh_fragment: module(2),
        gbuffer_fragment: module(3),
        fullscreen_vertex: module(4),
        lighting_fragment: module(5),
    }
}

fn headless_renderer(kind: PipelineKind, config: RhiConfig) -> (Arc<HeadlessDevice>, Renderer) {
    let device = Arc::new(HeadlessDevice::new());
    let renderer = Renderer::new(device.clone(), config, kind, shaders())
        .expect("Failed to create renderer");
    (device, renderer)
}

fn cube_scene(renderer: &Renderer) -> Scene {
    let mut scene = Scene::new();
    scene.add_mesh(Mesh::cube(renderer.rhi()).expect("Failed to upload cube"));
    scene
}

fn count(events: &[DeviceEvent], pred: impl Fn(&DeviceEvent) -> bool) -> usize {
    events.iter().filter(|event| pred(event)).count()
}

fn last_pass_size(events: &[DeviceEvent]) -> Option<(u32, u32)> {
    events.iter().rev().find_map(|event| match event {
        DeviceEvent::BeginRenderPass { width, height, .. } => Some((*width, *height)),
        _ => None,
    })
}

#[test]
fn test_forward_pipeline_draws_every_mesh() {
    let (device, mut renderer) = headless_renderer(PipelineKind::Forward, RhiConfig::default());
    let scene = cube_scene(&renderer);
    device.clear_events();

    for _ in 0..3 {
        assert!(renderer.render_frame(&scene).expect("Frame failed"));
    }

    let events = device.events();
    assert_eq!(count(&events, |e| matches!(e, DeviceEvent::BeginRenderPass { .. })), 3);
    assert_eq!(count(&events, |e| matches!(e, DeviceEvent::NextSubpass { .. })), 0);
    assert_eq!(
        count(&events, |e| matches!(
            e,
            DeviceEvent::DrawIndexed { index_count: 36, instance_count: 1, .. }
        )),
        3
    );
    assert_eq!(count(&events, |e| matches!(e, DeviceEvent::Present { .. })), 3);
    assert_eq!(last_pass_size(&events), Some((800, 600)));
}

#[test]
fn test_deferred_pipeline_runs_geometry_then_lighting() {
    let (device, mut renderer) = headless_renderer(PipelineKind::Deferred, RhiConfig::default());
    let scene = cube_scene(&renderer);
    device.clear_events();

    assert!(renderer.render_frame(&scene).expect("Frame failed"));

    let events = device.events();
    let begin = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::BeginRenderPass { .. }))
        .expect("No render pass begun");
    let next = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::NextSubpass { .. }))
        .expect("No subpass transition");
    let geometry = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::DrawIndexed { .. }))
        .expect("No geometry draw");
    let lighting = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::Draw { vertex_count: 3, .. }))
        .expect("No fullscreen draw");
    let end = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::EndRenderPass { .. }))
        .expect("No render pass ended");

    assert!(begin < geometry && geometry < next && next < lighting && lighting < end);
}

#[test]
fn test_deferred_lighting_runs_without_meshes() {
    let (device, mut renderer) = headless_renderer(PipelineKind::Deferred, RhiConfig::default());
    let scene = Scene::new();
    device.clear_events();

    assert!(renderer.render_frame(&scene).expect("Frame failed"));

    let events = device.events();
    assert_eq!(count(&events, |e| matches!(e, DeviceEvent::DrawIndexed { .. })), 0);
    assert_eq!(count(&events, |e| matches!(e, DeviceEvent::Draw { vertex_count: 3, .. })), 1);
}

#[test]
fn test_render_passes_are_cached_per_swapchain_image() {
    let (_device, mut renderer) = headless_renderer(PipelineKind::Forward, RhiConfig::default());
    let scene = cube_scene(&renderer);

    for _ in 0..6 {
        assert!(renderer.render_frame(&scene).expect("Frame failed"));
    }

    let stats = renderer.rhi().stats().registry;
    assert_eq!(stats.render_passes, 3);
    assert_eq!(stats.graphics_pipelines, 3);
    assert_eq!(stats.binding_layouts, 1);
}

#[test]
fn test_resize_rebuilds_targets_before_next_frame() {
    let (device, mut renderer) = headless_renderer(PipelineKind::Deferred, RhiConfig::default());
    let scene = cube_scene(&renderer);
    assert!(renderer.render_frame(&scene).expect("Frame failed"));

    renderer.resize(1024, 768);
    device.clear_events();
    assert!(renderer.render_frame(&scene).expect("Frame after resize failed"));

    let events = device.events();
    assert_eq!(
        count(&events, |e| matches!(
            e,
            DeviceEvent::SwapchainRecreated { width: 1024, height: 768 }
        )),
        1
    );
    assert_eq!(last_pass_size(&events), Some((1024, 768)));
}

#[test]
fn test_out_of_date_acquire_skips_one_frame() {
    let (device, mut renderer) = headless_renderer(PipelineKind::Forward, RhiConfig::default());
    let scene = cube_scene(&renderer);

    device.inject_swapchain_fault(SwapchainFault::OutOfDateOnAcquire);
    assert!(!renderer.render_frame(&scene).expect("Skipped frame errored"));
    assert!(renderer.render_frame(&scene).expect("Frame after recreation failed"));
}

#[test]
fn test_switch_pipeline() {
    let (device, mut renderer) = headless_renderer(PipelineKind::Forward, RhiConfig::default());
    let scene = cube_scene(&renderer);
    assert!(renderer.render_frame(&scene).expect("Forward frame failed"));

    renderer
        .switch_pipeline(PipelineKind::Forward)
        .expect("Switching to the active pipeline failed");
    assert_eq!(renderer.kind(), PipelineKind::Forward);

    renderer
        .switch_pipeline(PipelineKind::Deferred)
        .expect("Switching to deferred failed");
    assert_eq!(renderer.kind(), PipelineKind::Deferred);

    device.clear_events();
    assert!(renderer.render_frame(&scene).expect("Deferred frame failed"));
    assert_eq!(
        count(&device.events(), |e| matches!(e, DeviceEvent::NextSubpass { .. })),
        1
    );
}

#[test]
fn test_forward_msaa_resolves_into_backbuffer() {
    let config = RhiConfig {
        sample_count: 4,
        ..Default::default()
    };
    let (device, mut renderer) = headless_renderer(PipelineKind::Forward, config);
    let scene = cube_scene(&renderer);
    device.clear_events();

    assert!(renderer.render_frame(&scene).expect("MSAA frame failed"));
    assert_eq!(last_pass_size(&device.events()), Some((800, 600)));
}

#[test]
fn test_empty_shaders_fail_setup() {
    let device = Arc::new(HeadlessDevice::new());
    let result = Renderer::new(
        device,
        RhiConfig::default(),
        PipelineKind::Forward,
        ShaderSet::default(),
    );
    assert!(matches!(result, Err(RhiError::ShaderError(_))));
}

#[test]
fn test_mesh_rejects_out_of_range_indices() {
    let (_device, renderer) = headless_renderer(PipelineKind::Forward, RhiConfig::default());
    let vertices = [Vertex::default(); 3];

    assert!(Mesh::upload(renderer.rhi(), "bad", &vertices, &[0, 1, 3]).is_err());
    assert!(Mesh::upload(renderer.rhi(), "empty", &vertices, &[]).is_err());
    let mesh = Mesh::upload(renderer.rhi(), "triangle", &vertices, &[0, 1, 2])
        .expect("Failed to upload triangle");
    assert_eq!(mesh.index_count(), 3);
}
