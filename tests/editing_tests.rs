// Selection, deletion and transform editing tests

use std::sync::Arc;

use glam::{Mat4, Quat, Vec2, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rfs_gsplat_composite::{
    create_test_asset, create_test_points, state_bits, CutoutShape, ExportedSplat, GpuDevice,
    SplatAssetBuilder, SplatCamera, SplatCollection, SplatCounts, SplatCutout, SplatError,
    SplatPoint, SplatShaderSet,
};
use rfs_gsplat_composite::splat_asset::SplatFormats;

const SIDE: usize = 10;
const SPACING: f32 = 0.1;

/// `SIDE`^3 splats on a grid from -0.5 to 0.4 along each axis
fn grid_points() -> Vec<SplatPoint> {
    (0..SIDE * SIDE * SIDE)
        .map(|i| SplatPoint {
            position: Vec3::new(
                (i % SIDE) as f32 * SPACING - 0.5,
                ((i / SIDE) % SIDE) as f32 * SPACING - 0.5,
                (i / (SIDE * SIDE)) as f32 * SPACING - 0.5,
            ),
            ..Default::default()
        })
        .collect()
}

fn collection_from(device: &GpuDevice, points: &[SplatPoint]) -> SplatCollection {
    let asset = SplatAssetBuilder::new().build(points);
    let mut collection =
        SplatCollection::new(device, &SplatShaderSet::default()).with_asset(Arc::new(asset));
    assert!(collection.sync_asset());
    collection
}

fn grid_collection(device: &GpuDevice) -> SplatCollection {
    collection_from(device, &grid_points())
}

/// Orthographic camera on +Z looking at the origin; world x = -1..1 maps to pixels 0..1000
fn ortho_camera() -> SplatCamera {
    SplatCamera::new(
        Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y),
        Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 100.0),
        Vec2::splat(1000.0),
    )
}

/// Pixel rectangle covering exactly the x = -0.5 column of the grid
fn first_column_rect() -> (Vec2, Vec2) {
    (Vec2::ZERO, Vec2::new(275.0, 1000.0))
}

fn select_first_column(collection: &mut SplatCollection) -> SplatCounts {
    collection.store_selection_snapshot().unwrap();
    let (min, max) = first_column_rect();
    collection.update_selection(min, max, &ortho_camera(), false).unwrap()
}

fn export(collection: &SplatCollection) -> Vec<ExportedSplat> {
    let mut buffer = collection.create_export_buffer();
    collection.export_data(&mut buffer, false).unwrap();
    collection.read_exported(&buffer).unwrap()
}

fn assert_vec3_near(a: Vec3, b: Vec3) {
    assert!((a - b).length() < 1e-4, "{:?} != {:?}", a, b);
}

#[test]
fn test_select_and_delete_end_to_end() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);

    let counts = select_first_column(&mut collection);
    assert_eq!(counts.selected, 100);
    assert_eq!(counts.deleted, 0);
    assert!(!collection.is_modified());

    let counts = collection.delete_selected().unwrap();
    assert_eq!(counts.deleted, 100);
    assert_eq!(counts.selected, 0);
    assert!(collection.is_modified());
    assert_eq!(collection.deleted_count(), 100);

    let records = export(&collection);
    let deleted = records.iter().filter(|r| r.state & state_bits::DELETED != 0).count();
    assert_eq!(deleted, 100);
    assert!(records
        .iter()
        .filter(|r| r.state & state_bits::DELETED != 0)
        .all(|r| (r.pos[0] + 0.5).abs() < 1e-6));

    let counts = collection.undelete_all().unwrap();
    assert_eq!(counts.deleted, 0);
}

#[test]
fn test_selection_update_recomputes_from_snapshot() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);
    let camera = ortho_camera();
    collection.store_selection_snapshot().unwrap();

    // Growing then shrinking the rectangle within one gesture never accumulates
    let wide = collection
        .update_selection(Vec2::ZERO, Vec2::new(325.0, 1000.0), &camera, false)
        .unwrap();
    assert_eq!(wide.selected, 200);
    let (min, max) = first_column_rect();
    let narrow = collection.update_selection(min, max, &camera, false).unwrap();
    assert_eq!(narrow.selected, 100);
    let again = collection.update_selection(min, max, &camera, false).unwrap();
    assert_eq!(again, narrow);

    // New gesture subtracting the same rectangle empties the selection
    collection.store_selection_snapshot().unwrap();
    let counts = collection.update_selection(max, min, &camera, true).unwrap();
    assert_eq!(counts.selected, 0);
}

#[test]
fn test_selection_requires_snapshot() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);
    let (min, max) = first_column_rect();
    assert!(matches!(
        collection.update_selection(min, max, &ortho_camera(), false),
        Err(SplatError::MissingSnapshot(_))
    ));
    assert!(collection.translate_selection(Vec3::X).is_err());
}

#[test]
fn test_deleted_splats_are_never_selected_or_moved() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);
    select_first_column(&mut collection);
    collection.delete_selected().unwrap();

    let counts = collection.select_all().unwrap();
    assert_eq!(counts.selected, 900);

    collection.store_position_snapshot().unwrap();
    collection.translate_selection(Vec3::new(0.0, 0.0, 2.0)).unwrap();
    collection.translate_selection(Vec3::new(0.0, 0.0, 1.0)).unwrap();

    let points = grid_points();
    for (record, point) in export(&collection).iter().zip(&points) {
        let expected = if record.state & state_bits::DELETED != 0 {
            point.position
        } else {
            point.position + Vec3::Z
        };
        assert_vec3_near(Vec3::from(record.pos), expected);
    }

    // Selecting over deleted splats leaves them unselected
    collection.deselect_all().unwrap();
    let counts = select_first_column(&mut collection);
    assert_eq!(counts.selected, 0);
}

#[test]
fn test_counts_and_bounds_cover_visible_selection() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);

    let counts = select_first_column(&mut collection);
    assert_eq!(counts.selected, 100);
    let bounds = collection.selection_bounds();
    assert_vec3_near(bounds.min(), Vec3::new(-0.5, -0.5, -0.5));
    assert_vec3_near(bounds.max(), Vec3::new(-0.5, 0.4, 0.4));

    // Cut splats stay selected but leave the bounds
    let cut_top_layers = Mat4::from_scale_rotation_translation(
        Vec3::new(4.0, 4.0, 0.26),
        Quat::IDENTITY,
        Vec3::new(0.0, 0.0, 0.5),
    );
    collection
        .cutouts
        .push(SplatCutout::new(CutoutShape::Box, cut_top_layers).inverted());
    let counts = collection.recompute_counts_and_bounds().unwrap();
    assert_eq!(counts.selected, 100);
    assert_eq!(counts.cut, 200);
    assert_vec3_near(collection.selection_bounds().max(), Vec3::new(-0.5, 0.4, 0.2));
}

#[test]
fn test_single_splat_selection_gets_minimum_extent() {
    let device = GpuDevice::new();
    let row: Vec<SplatPoint> = grid_points().into_iter().take(SIDE).collect();
    let mut collection = collection_from(&device, &row);

    let counts = select_first_column(&mut collection);
    assert_eq!(counts.selected, 1);
    let bounds = collection.selection_bounds();
    assert_vec3_near(bounds.center, Vec3::splat(-0.5));
    assert_eq!(bounds.extents, Vec3::splat(0.1));

    let counts = collection.deselect_all().unwrap();
    assert_eq!(counts.selected, 0);
    assert_eq!(collection.selection_bounds(), Default::default());
}

#[test]
fn test_invert_masks_tail_bits() {
    let device = GpuDevice::new();
    let points: Vec<SplatPoint> = grid_points().into_iter().take(10).collect();
    let mut collection = collection_from(&device, &points);

    let counts = collection.invert_selection().unwrap();
    assert_eq!(counts.selected, 10);
    let edit = collection.edit_state().buffers().unwrap();
    assert_eq!(edit.selected_words(), &[0x3FF]);

    let counts = collection.invert_selection().unwrap();
    assert_eq!(counts.selected, 0);
    let edit = collection.edit_state().buffers().unwrap();
    assert_eq!(edit.selected_words(), &[0]);
}

#[test]
fn test_rotate_and_scale_use_gesture_start_state() {
    let device = GpuDevice::new();
    let points = vec![
        SplatPoint {
            position: Vec3::new(1.0, 0.0, 0.0),
            ..Default::default()
        },
        SplatPoint {
            position: Vec3::new(0.0, 1.0, 0.0),
            ..Default::default()
        },
    ];
    let mut collection = collection_from(&device, &points);
    collection.select_all().unwrap();

    // Rotation needs both snapshots
    collection.store_position_snapshot().unwrap();
    let rotation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
    assert!(matches!(
        collection.rotate_selection(Vec3::ZERO, Mat4::IDENTITY, Mat4::IDENTITY, rotation),
        Err(SplatError::MissingSnapshot(_))
    ));
    collection.store_other_snapshot().unwrap();
    for _ in 0..3 {
        collection
            .rotate_selection(Vec3::ZERO, Mat4::IDENTITY, Mat4::IDENTITY, rotation)
            .unwrap();
    }
    let records = export(&collection);
    assert_vec3_near(Vec3::from(records[0].pos), Vec3::new(0.0, 1.0, 0.0));
    assert_vec3_near(Vec3::from(records[1].pos), Vec3::new(-1.0, 0.0, 0.0));

    // Scale about a pivot, relative to the new gesture start
    collection.store_position_snapshot().unwrap();
    collection.store_other_snapshot().unwrap();
    collection
        .scale_selection(Vec3::new(0.0, 1.0, 0.0), Mat4::IDENTITY, Mat4::IDENTITY, Vec3::splat(2.0))
        .unwrap();
    let records = export(&collection);
    assert_vec3_near(Vec3::from(records[0].pos), Vec3::new(0.0, 1.0, 0.0));
    assert_vec3_near(Vec3::from(records[1].pos), Vec3::new(-2.0, -1.0, 0.0));
    assert!(collection.is_modified());
}

#[test]
fn test_resize_to_same_count_is_bit_identical() {
    let device = GpuDevice::new();
    let mut rng = StdRng::seed_from_u64(99);
    let points: Vec<SplatPoint> = (0..300)
        .map(|_| SplatPoint {
            position: Vec3::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0)),
            rotation: Quat::from_euler(glam::EulerRot::XYZ, rng.gen(), rng.gen(), rng.gen()),
            scale: Vec3::splat(rng.gen_range(0.001..0.1)),
            ..Default::default()
        })
        .collect();
    let mut collection = collection_from(&device, &points);

    let snapshot = |c: &SplatCollection| {
        let s = &c.store().buffers().unwrap().splats;
        (
            s.pos.words().to_vec(),
            s.other.words().to_vec(),
            s.sh.words().to_vec(),
            s.color.texels().to_vec(),
        )
    };
    let before = snapshot(&collection);
    collection.resize(300).unwrap();
    assert_eq!(snapshot(&collection), before);
}

#[test]
fn test_resize_keeps_prefix_and_resets_edit_bits() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);
    select_first_column(&mut collection);
    collection.delete_selected().unwrap();
    collection.clear_modified();

    collection.resize(50).unwrap();
    assert_eq!(collection.splat_count(), 50);
    assert_eq!(collection.counts(), SplatCounts::default());
    assert!(collection.is_modified());
    let records = export(&collection);
    assert_vec3_near(Vec3::from(records[49].pos), grid_points()[49].position);

    collection.resize(80).unwrap();
    let records = export(&collection);
    assert_vec3_near(Vec3::from(records[49].pos), grid_points()[49].position);
    assert_eq!(records[79].pos, [0.0; 3]);

    assert!(matches!(collection.resize(0), Err(SplatError::InvalidCount { .. })));
}

#[test]
fn test_copy_range_bakes_relative_transform() {
    let device = GpuDevice::new();
    let points = grid_points();
    let mut src = collection_from(&device, &points);
    src.local_to_world = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
    let mut dst = collection_from(&device, &points);
    dst.local_to_world = Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0));

    // Mark the destination range deleted first
    dst.select_all().unwrap();
    dst.delete_selected().unwrap();
    dst.clear_modified();

    src.copy_range_into(&mut dst, 0, 100, 10).unwrap();
    let records = export(&dst);
    for k in 0..10 {
        assert_vec3_near(
            Vec3::from(records[100 + k].pos),
            points[k].position + Vec3::new(6.0, 0.0, 0.0),
        );
        assert_eq!(records[100 + k].state & state_bits::DELETED, 0);
    }
    assert_eq!(records[99].state & state_bits::DELETED, state_bits::DELETED);
    assert!(dst.is_modified());

    assert!(matches!(
        src.copy_range_into(&mut dst, 995, 0, 10),
        Err(SplatError::RangeOutOfBounds { .. })
    ));
}

#[test]
fn test_copy_over_deleted_splats_refreshes_counts() {
    let device = GpuDevice::new();
    let src = collection_from(&device, &create_test_points(64));
    let mut dst = collection_from(&device, &create_test_points(64));

    dst.select_all().unwrap();
    assert_eq!(dst.delete_selected().unwrap().deleted, 64);
    dst.clear_modified();

    src.copy_range_into(&mut dst, 0, 0, 64).unwrap();
    assert_eq!(dst.deleted_count(), 0);
    assert_eq!(dst.selected_count(), 0);
    assert!(dst.is_modified());

    // Nothing selected: deleting changes nothing and leaves the flag alone
    dst.clear_modified();
    let counts = dst.delete_selected().unwrap();
    assert_eq!(counts, SplatCounts::default());
    assert!(!dst.is_modified());
}

#[test]
fn test_chunked_assets_reject_transforms_and_resize() {
    let device = GpuDevice::new();
    let asset = SplatAssetBuilder::new()
        .formats(SplatFormats::default())
        .chunked(true)
        .build(&grid_points());
    let mut collection =
        SplatCollection::new(&device, &SplatShaderSet::default()).with_asset(Arc::new(asset));
    assert!(collection.sync_asset());

    collection.select_all().unwrap();
    collection.store_position_snapshot().unwrap();
    assert_eq!(collection.translate_selection(Vec3::X), Err(SplatError::ChunkedAsset));
    assert_eq!(collection.resize(10), Err(SplatError::ChunkedResize));
}

#[test]
fn test_export_bakes_world_transform() {
    let device = GpuDevice::new();
    let mut collection = SplatCollection::new(&device, &SplatShaderSet::default())
        .with_asset(Arc::new(create_test_asset(8)))
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0)));
    assert!(collection.sync_asset());

    let local = export(&collection);
    let mut buffer = collection.create_export_buffer();
    collection.export_data(&mut buffer, true).unwrap();
    let world = collection.read_exported(&buffer).unwrap();
    assert_eq!(world.len(), 8);
    for (l, w) in local.iter().zip(&world) {
        assert_vec3_near(Vec3::from(w.pos), Vec3::from(l.pos) + Vec3::new(0.0, 3.0, 0.0));
        assert_eq!(w.state, 0);
    }

    let mut small = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("small_export"),
        size: 4,
        usage: wgpu::BufferUsages::STORAGE,
        mapped_at_creation: false,
    });
    assert!(matches!(
        collection.export_data(&mut small, false),
        Err(SplatError::DestinationTooSmall { .. })
    ));
}

#[test]
fn test_asset_swap_drops_edit_state() {
    let device = GpuDevice::new();
    let mut collection = grid_collection(&device);
    collection.select_all().unwrap();
    assert!(collection.edit_state().is_active());

    collection.set_asset(Some(Arc::new(create_test_asset(20))));
    assert!(collection.sync_asset());
    assert!(!collection.edit_state().is_active());
    assert_eq!(collection.counts(), SplatCounts::default());
}

#[test]
fn test_edits_on_unloaded_collection_fail() {
    let device = GpuDevice::new();
    let mut collection = SplatCollection::new(&device, &SplatShaderSet::default());
    assert_eq!(collection.select_all(), Err(SplatError::NotLoaded));
    assert_eq!(collection.delete_selected(), Err(SplatError::NotLoaded));
    assert!(!collection.edit_state().is_active());
}
