// Frame pipeline and multi-collection coordinator tests

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use rfs_gsplat_composite::{
    create_test_asset, CommandEncoder, FrameRenderPipeline, GpuCommand, GpuDevice,
    RenderCoordinator, SplatCamera, SplatCollection, SplatCoordinatorConfig, SplatError,
    SplatPoint, SplatRenderMode, SplatRenderSettings, SplatShaderSet,
};
use rfs_gsplat_composite::splat_asset::SplatAssetBuilder;

fn camera_at_origin() -> SplatCamera {
    SplatCamera::new(
        Mat4::IDENTITY,
        Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0),
        Vec2::splat(256.0),
    )
}

fn loaded_collection(device: &GpuDevice, count: usize) -> SplatCollection {
    let mut collection = SplatCollection::new(device, &SplatShaderSet::default())
        .with_asset(Arc::new(create_test_asset(count)));
    assert!(collection.sync_asset());
    collection
}

fn command_labels(commands: &[GpuCommand]) -> Vec<&str> {
    commands.iter().map(GpuCommand::label).collect()
}

#[test]
fn test_pipeline_runs_passes_in_order() {
    let device = GpuDevice::new();
    let mut collection = loaded_collection(&device, 64)
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)));
    let mut encoder = CommandEncoder::new("frame");

    let uniforms = FrameRenderPipeline
        .render(&mut collection, &camera_at_origin(), &mut encoder)
        .unwrap();

    let labels = encoder.labels();
    let distances = labels.iter().position(|l| *l == "gaussian_splat_calc_distances").unwrap();
    let sort = labels.iter().position(|l| l.starts_with("radix_upsweep")).unwrap();
    let view = labels.iter().position(|l| *l == "gaussian_splat_calc_view_data").unwrap();
    let draw = labels.iter().position(|l| *l == "gaussian_splat_draw").unwrap();
    assert!(distances < sort && sort < view && view < draw);

    assert_eq!(uniforms.splat_count, 64);
    assert_eq!(uniforms.sorted_this_frame, 1);
    assert_eq!(uniforms.bits_valid, 0);
    match encoder.commands().last() {
        Some(GpuCommand::Draw { index_count, instance_count, .. }) => {
            assert_eq!(*index_count, 6);
            assert_eq!(*instance_count, 64);
        }
        other => panic!("expected draw, got {:?}", other),
    }
}

#[test]
fn test_sort_runs_every_nth_frame() {
    let device = GpuDevice::new();
    let mut collection = loaded_collection(&device, 16).with_settings(SplatRenderSettings {
        sort_every_nth_frame: 3,
        ..Default::default()
    });
    let camera = camera_at_origin();

    let sorted: Vec<u32> = (0..7)
        .map(|_| {
            let mut encoder = CommandEncoder::new("frame");
            let uniforms = FrameRenderPipeline
                .render(&mut collection, &camera, &mut encoder)
                .unwrap();
            let has_distances = encoder.labels().contains(&"gaussian_splat_calc_distances");
            assert_eq!(has_distances, uniforms.sorted_this_frame == 1);
            uniforms.sorted_this_frame
        })
        .collect();

    assert_eq!(sorted, vec![1, 0, 0, 1, 0, 0, 1]);
    assert_eq!(collection.frame_counter(), 7);
}

#[test]
fn test_sorted_permutation_runs_front_to_back() {
    let device = GpuDevice::new();
    let depths = [7.0f32, 2.0, 9.0, 4.0];
    let points: Vec<SplatPoint> = depths
        .iter()
        .map(|&d| SplatPoint {
            position: Vec3::new(0.0, 0.0, -d),
            ..Default::default()
        })
        .collect();
    let mut collection = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(Arc::new(SplatAssetBuilder::new().build(&points)));
    assert!(collection.sync_asset());

    let mut encoder = CommandEncoder::new("frame");
    FrameRenderPipeline
        .render(&mut collection, &camera_at_origin(), &mut encoder)
        .unwrap();

    let order = &collection.store().buffers().unwrap().work.sort_values.words()[..4];
    assert_eq!(order, &[1, 3, 0, 2]);
}

#[test]
fn test_repeated_sorts_keep_front_to_back_order() {
    let device = GpuDevice::new();
    let depths = [3.0f32, 8.0, 1.0, 6.0, 5.0];
    let points: Vec<SplatPoint> = depths
        .iter()
        .map(|&d| SplatPoint {
            position: Vec3::new(0.0, 0.0, -d),
            ..Default::default()
        })
        .collect();
    let mut collection = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(Arc::new(SplatAssetBuilder::new().build(&points)));
    assert!(collection.sync_asset());
    let camera = camera_at_origin();

    for _ in 0..3 {
        let mut encoder = CommandEncoder::new("frame");
        let uniforms = FrameRenderPipeline
            .render(&mut collection, &camera, &mut encoder)
            .unwrap();
        assert_eq!(uniforms.sorted_this_frame, 1);
        let order = &collection.store().buffers().unwrap().work.sort_values.words()[..5];
        assert_eq!(order, &[2, 0, 4, 3, 1]);
    }
}

#[test]
fn test_debug_chunk_bounds_without_chunks_draws_nothing() {
    let device = GpuDevice::new();
    let mut collection = loaded_collection(&device, 32).with_settings(SplatRenderSettings {
        render_mode: SplatRenderMode::DebugChunkBounds,
        ..Default::default()
    });
    let mut encoder = CommandEncoder::new("frame");
    let uniforms = FrameRenderPipeline
        .render(&mut collection, &camera_at_origin(), &mut encoder)
        .unwrap();
    assert_eq!(uniforms.chunk_count, 0);
    assert!(matches!(
        encoder.commands().last(),
        Some(GpuCommand::Draw { instance_count: 0, index_count: 36, .. })
    ));
}

#[test]
fn test_pipeline_rejects_unloaded_collection() {
    let device = GpuDevice::new();
    let mut collection = SplatCollection::new(&device, &SplatShaderSet::default());
    let mut encoder = CommandEncoder::new("frame");
    let result = FrameRenderPipeline.render(&mut collection, &camera_at_origin(), &mut encoder);
    assert_eq!(result, Err(SplatError::NotLoaded));
    assert!(encoder.commands().is_empty());
}

#[test]
fn test_gather_orders_by_render_order_then_depth() {
    let device = GpuDevice::new();
    let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
    let setups = [(2, 5.0f32), (2, 1.0), (1, 9.0)];
    let mut collections: Vec<SplatCollection> = setups
        .iter()
        .map(|&(order, depth)| {
            SplatCollection::new(&device, &SplatShaderSet::default())
                .with_asset(Arc::new(create_test_asset(8)))
                .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, -depth)))
                .with_settings(SplatRenderSettings {
                    render_order: order,
                    ..Default::default()
                })
        })
        .collect();
    for c in &collections {
        coordinator.register(c);
    }

    let camera = camera_at_origin();
    let refs: Vec<&mut SplatCollection> = collections.iter_mut().collect();
    assert_eq!(coordinator.gather_for_camera(&camera, &refs), vec![1, 0, 2]);
    assert!(coordinator.gather_for_camera(&camera.preview(), &refs).is_empty());
}

#[test]
fn test_gather_skips_inactive_unregistered_and_assetless() {
    let device = GpuDevice::new();
    let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
    let shaders = SplatShaderSet::default();
    let asset = Arc::new(create_test_asset(8));

    let mut inactive = SplatCollection::new(&device, &shaders).with_asset(asset.clone());
    inactive.active = false;
    let unregistered = SplatCollection::new(&device, &shaders).with_asset(asset.clone());
    let assetless = SplatCollection::new(&device, &shaders);
    let visible = SplatCollection::new(&device, &shaders).with_asset(asset);
    coordinator.register(&inactive);
    coordinator.register(&assetless);
    coordinator.register(&visible);

    let mut collections = [inactive, unregistered, assetless, visible];
    let refs: Vec<&mut SplatCollection> = collections.iter_mut().collect();
    assert_eq!(coordinator.gather_for_camera(&camera_at_origin(), &refs), vec![3]);
}

#[test]
fn test_render_all_with_nothing_visible_allocates_nothing() {
    let device = GpuDevice::new();
    let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
    let mut collection = SplatCollection::new(&device, &SplatShaderSet::default());
    coordinator.register(&collection);

    let allocations = device.total_allocations();
    let mut refs = vec![&mut collection];
    assert!(coordinator.render_all(&camera_at_origin(), &mut refs).is_none());
    assert_eq!(device.total_allocations(), allocations);
}

#[test]
fn test_render_all_composites_and_releases_target() {
    let device = GpuDevice::new();
    let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
    let asset = Arc::new(create_test_asset(27));
    let mut near = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(asset.clone())
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0)));
    let mut far = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(asset)
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, -8.0)));
    coordinator.register(&near);
    coordinator.register(&far);

    let output = {
        let mut refs = vec![&mut far, &mut near];
        coordinator.render_all(&camera_at_origin(), &mut refs).unwrap()
    };
    let textures_after_frame = device.live_texture_count();

    let labels = command_labels(&output.commands);
    assert_eq!(labels.first(), Some(&"gaussian_splat_composite_target"));
    assert_eq!(labels.last(), Some(&"gaussian_splat_composite_target"));
    assert!(matches!(output.commands[0], GpuCommand::AcquireTarget { width: 256, height: 256, .. }));
    assert!(matches!(output.commands[1], GpuCommand::ClearTarget { .. }));
    assert!(matches!(output.commands.last(), Some(GpuCommand::ReleaseTarget { .. })));

    let draws = labels.iter().filter(|l| **l == "gaussian_splat_draw").count();
    let composites: Vec<usize> = output
        .commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, GpuCommand::Composite { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(draws, 2);
    assert_eq!(composites, vec![output.commands.len() - 2]);

    assert_eq!(output.drawn, vec![near.id(), far.id()]);
    assert_eq!(
        output.composite_material,
        SplatShaderSet::default().composite
    );
    assert!(output.frame.is_empty());
    assert_eq!(coordinator.draw_uniforms(near.id()).unwrap().splat_count, 27);

    // Only the two collections' color textures outlive the frame
    assert_eq!(textures_after_frame, 2);
}

#[test]
fn test_failed_asset_is_filtered_from_frame() {
    let device = GpuDevice::new();
    let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
    let mut broken_asset = create_test_asset(8);
    broken_asset.sh_data.clear();
    let mut broken = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(Arc::new(broken_asset));
    let mut good = loaded_collection(&device, 8);
    coordinator.register(&broken);
    coordinator.register(&good);

    let mut refs = vec![&mut broken, &mut good];
    let output = coordinator.render_all(&camera_at_origin(), &mut refs).unwrap();
    assert_eq!(output.drawn.len(), 1);
    assert!(!broken.has_valid_asset());
}

#[test]
fn test_render_all_with_only_broken_assets_allocates_nothing() {
    let device = GpuDevice::new();
    let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
    let mut broken_asset = create_test_asset(8);
    broken_asset.sh_data.clear();
    let mut broken = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(Arc::new(broken_asset));
    coordinator.register(&broken);

    let allocations = device.total_allocations();
    let mut refs = vec![&mut broken];
    assert!(coordinator.render_all(&camera_at_origin(), &mut refs).is_none());
    assert_eq!(device.total_allocations(), allocations);
    assert_eq!(device.live_texture_count(), 0);
}
