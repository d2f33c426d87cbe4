// GPU-resident selection and editing for splat collections
//
// Selection and deletion live in per-collection bitsets. Interactive gestures
// (rectangle selection, move/rotate/scale) always recompute from snapshots taken
// when the gesture started, so repeated updates within one gesture never
// accumulate. Counts and the selection bounds come from a 9-word reduction that
// is read back synchronously once per discrete edit action.

use glam::{Mat4, Quat, Vec2, Vec3};
use tracing::{debug, info, warn};
use wgpu::BufferUsages;

use crate::collection::SplatCollection;
use crate::cutout::CutoutBuffer;
use crate::error::{SnapshotKind, SplatError, SplatResult};
use crate::gpu::{CommandEncoder, GpuBuffer, GpuDevice};
use crate::radix_sort::sortable_uint_to_float;
use crate::render_pipeline::SplatCamera;
use crate::splat_buffers::SplatGpuBuffers;
use crate::splat_asset::SplatFormats;
use crate::splat_kernels::{
    self, ExportedSplat, SplatBindings, TransformSources, EXPORT_WORDS, REDUCTION_WORDS,
};
use crate::splat_state::{self, SelectionOp, SelectionRect};

/// Selection / deletion / cut counts from the last reduction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplatCounts {
    pub selected: u32,
    pub deleted: u32,
    pub cut: u32,
}

/// Splat-local bounds of the visible selection
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SelectionBounds {
    pub center: Vec3,
    /// Half size along each axis
    pub extents: Vec3,
}

impl SelectionBounds {
    pub fn min(&self) -> Vec3 {
        self.center - self.extents
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.extents
    }

    fn from_min_max(min: Vec3, max: Vec3) -> Self {
        let mut extents = (max - min) * 0.5;
        if extents.length_squared() < 0.01 {
            extents = Vec3::splat(0.1);
        }
        Self {
            center: (min + max) * 0.5,
            extents,
        }
    }
}

/// Decode the reduction words: counts plus bounds when anything visible is selected
pub fn decode_reduction(words: &[u32]) -> (SplatCounts, SelectionBounds) {
    let counts = SplatCounts {
        selected: words[0],
        deleted: words[1],
        cut: words[2],
    };
    let min_keys = &words[3..6];
    let max_keys = &words[6..9];
    let has_bounds = min_keys.iter().zip(max_keys).all(|(lo, hi)| lo <= hi);
    let bounds = if has_bounds {
        let decode = |k: &[u32]| {
            Vec3::new(
                sortable_uint_to_float(k[0]),
                sortable_uint_to_float(k[1]),
                sortable_uint_to_float(k[2]),
            )
        };
        SelectionBounds::from_min_max(decode(min_keys), decode(max_keys))
    } else {
        SelectionBounds::default()
    };
    (counts, bounds)
}

/// Edit buffers of a collection that has been edited at least once
#[derive(Debug)]
pub struct EditBuffers {
    pub(crate) selected: GpuBuffer,
    pub(crate) deleted: GpuBuffer,
    selected_at_gesture_start: Option<GpuBuffer>,
    pos_at_gesture_start: Option<GpuBuffer>,
    other_at_gesture_start: Option<GpuBuffer>,
    reduction: GpuBuffer,
    readback: GpuBuffer,
    modified: bool,
    counts: SplatCounts,
    bounds: SelectionBounds,
}

fn bitset_buffer(device: &GpuDevice, label: &'static str, count: u32) -> GpuBuffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: splat_state::bitset_words(count).max(1) as u64 * 4,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

/// Create `slot` on first use with the size of `src`, then copy `src` into it
fn snapshot_into(
    device: &GpuDevice,
    encoder: &mut CommandEncoder,
    slot: &mut Option<GpuBuffer>,
    label: &'static str,
    src: &GpuBuffer,
) -> SplatResult<()> {
    let reuse = slot.as_ref().is_some_and(|b| b.len_words() == src.len_words());
    if !reuse {
        *slot = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: src.size(),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
    }
    match slot.as_mut() {
        Some(dst) => encoder.copy_buffer_to_buffer(src, dst),
        None => Ok(()),
    }
}

impl EditBuffers {
    fn new(device: &GpuDevice, count: u32) -> Self {
        Self {
            selected: bitset_buffer(device, "gaussian_splat_selected_bits", count),
            deleted: bitset_buffer(device, "gaussian_splat_deleted_bits", count),
            selected_at_gesture_start: None,
            pos_at_gesture_start: None,
            other_at_gesture_start: None,
            reduction: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("gaussian_splat_counts_and_bounds"),
                size: REDUCTION_WORDS as u64 * 4,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("gaussian_splat_counts_readback"),
                size: REDUCTION_WORDS as u64 * 4,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            modified: false,
            counts: SplatCounts::default(),
            bounds: SelectionBounds::default(),
        }
    }

    /// New splat count: fresh bitsets, snapshots dropped
    fn reallocate(&mut self, device: &GpuDevice, count: u32) {
        self.selected = bitset_buffer(device, "gaussian_splat_selected_bits", count);
        self.deleted = bitset_buffer(device, "gaussian_splat_deleted_bits", count);
        self.selected_at_gesture_start = None;
        self.pos_at_gesture_start = None;
        self.other_at_gesture_start = None;
    }

    /// Host words of the selection bitset (empty on a device backend)
    pub fn selected_words(&self) -> &[u32] {
        self.selected.words()
    }

    pub fn deleted_words(&self) -> &[u32] {
        self.deleted.words()
    }
}

/// Edit state of a collection; absent until the first edit
#[derive(Debug, Default)]
pub enum EditState {
    #[default]
    NoEditState,
    Active(Box<EditBuffers>),
}

impl EditState {
    pub fn is_active(&self) -> bool {
        matches!(self, EditState::Active(_))
    }

    pub fn buffers(&self) -> Option<&EditBuffers> {
        match self {
            EditState::Active(buffers) => Some(buffers),
            EditState::NoEditState => None,
        }
    }

    fn activate(&mut self, device: &GpuDevice, count: u32) -> &mut EditBuffers {
        match self {
            EditState::Active(buffers) => buffers,
            EditState::NoEditState => {
                debug!("Creating splat edit buffers for {} splats", count);
                *self = EditState::Active(Box::new(EditBuffers::new(device, count)));
                self.activate(device, count)
            }
        }
    }
}

/// Mutable view of everything an edit pass touches
struct EditContext<'a> {
    device: GpuDevice,
    buffers: &'a mut SplatGpuBuffers,
    edit: &'a mut EditBuffers,
    cutouts: CutoutBuffer,
    local_to_world: Mat4,
}

impl EditContext<'_> {
    /// Reduce counts and bounds, submit everything recorded so far and read
    /// the reduction back
    fn recompute(&mut self, encoder: &mut CommandEncoder) -> SplatResult<SplatCounts> {
        let splats = SplatBindings::new(
            &self.buffers.splats,
            &self.cutouts,
            Some((&self.edit.selected, &self.edit.deleted)),
        );
        splat_kernels::reduce_counts_and_bounds(encoder, &splats, &mut self.edit.reduction)?;
        encoder.copy_buffer_to_buffer(&self.edit.reduction, &mut self.edit.readback)?;
        self.device.submit(encoder)?;
        let words = self.device.map_read(&self.edit.readback)?;
        let (counts, bounds) = decode_reduction(&words);
        self.edit.counts = counts;
        self.edit.bounds = bounds;
        Ok(counts)
    }

    fn encoder(&self, label: &str) -> CommandEncoder {
        self.device.create_command_encoder(label)
    }

    fn require_unchunked(&self) -> SplatResult<()> {
        if self.buffers.splats.chunks_valid {
            return Err(SplatError::ChunkedAsset);
        }
        Ok(())
    }
}

/// Gesture-start snapshots and bitsets for the transform kernels
fn transform_sources(
    edit: &EditBuffers,
    formats: SplatFormats,
    count: u32,
) -> SplatResult<TransformSources<'_>> {
    let pos_snapshot = edit
        .pos_at_gesture_start
        .as_ref()
        .ok_or(SplatError::MissingSnapshot(SnapshotKind::Position))?;
    Ok(TransformSources {
        formats,
        count,
        pos_snapshot,
        other_snapshot: edit.other_at_gesture_start.as_ref(),
        selected: &edit.selected,
        deleted: &edit.deleted,
    })
}

fn rejected<T>(op: &str, result: SplatResult<T>) -> SplatResult<T> {
    if let Err(e) = &result {
        debug!("Splat edit '{}' rejected: {}", op, e);
    }
    result
}

impl SplatCollection {
    fn check_editable(&self) -> SplatResult<()> {
        if self.materials.is_none() {
            return Err(SplatError::InvalidRenderSetup);
        }
        if !self.store.is_loaded() {
            return Err(SplatError::NotLoaded);
        }
        Ok(())
    }

    fn edit_context(&mut self) -> SplatResult<EditContext<'_>> {
        self.check_editable()?;
        let device = self.store.device().clone();
        let cutouts = CutoutBuffer::build(&device, &self.cutouts, self.local_to_world);
        let local_to_world = self.local_to_world;
        let buffers = self.store.buffers_mut().ok_or(SplatError::NotLoaded)?;
        let edit = self.edit.activate(&device, buffers.count());
        Ok(EditContext {
            device,
            buffers,
            edit,
            cutouts,
            local_to_world,
        })
    }

    pub fn store_selection_snapshot(&mut self) -> SplatResult<()> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_snapshot_selection");
            snapshot_into(
                &ctx.device,
                &mut encoder,
                &mut ctx.edit.selected_at_gesture_start,
                "gaussian_splat_selected_at_gesture_start",
                &ctx.edit.selected,
            )?;
            ctx.device.submit(&mut encoder)
        });
        rejected("store_selection_snapshot", result)
    }

    pub fn store_position_snapshot(&mut self) -> SplatResult<()> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_snapshot_positions");
            snapshot_into(
                &ctx.device,
                &mut encoder,
                &mut ctx.edit.pos_at_gesture_start,
                "gaussian_splat_pos_at_gesture_start",
                &ctx.buffers.splats.pos,
            )?;
            ctx.device.submit(&mut encoder)
        });
        rejected("store_position_snapshot", result)
    }

    pub fn store_other_snapshot(&mut self) -> SplatResult<()> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_snapshot_other");
            snapshot_into(
                &ctx.device,
                &mut encoder,
                &mut ctx.edit.other_at_gesture_start,
                "gaussian_splat_other_at_gesture_start",
                &ctx.buffers.splats.other,
            )?;
            ctx.device.submit(&mut encoder)
        });
        rejected("store_other_snapshot", result)
    }

    /// Recompute the selection as gesture-start selection combined with a pixel
    /// rectangle (origin top-left, +Y down). Deleted, cut and behind-camera
    /// splats are not affected.
    pub fn update_selection(
        &mut self,
        rect_min: Vec2,
        rect_max: Vec2,
        camera: &SplatCamera,
        subtract: bool,
    ) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_update_selection");
            let EditBuffers {
                selected,
                deleted,
                selected_at_gesture_start,
                ..
            } = &mut *ctx.edit;
            let snapshot = selected_at_gesture_start
                .as_ref()
                .ok_or(SplatError::MissingSnapshot(SnapshotKind::Selection))?;
            let splats = SplatBindings::new(&ctx.buffers.splats, &ctx.cutouts, Some((snapshot, deleted)));
            splat_kernels::update_selection(
                &mut encoder,
                &splats,
                camera.projection * camera.view * ctx.local_to_world,
                camera.viewport,
                SelectionRect::from_corners(rect_min, rect_max),
                SelectionOp::from_subtract(subtract),
                selected,
            )?;
            ctx.recompute(&mut encoder)
        });
        rejected("update_selection", result)
    }

    /// Move the selection by `delta` in splat-local space from the gesture-start positions
    pub fn translate_selection(&mut self, delta: Vec3) -> SplatResult<()> {
        let result = self.edit_context().and_then(|mut ctx| {
            ctx.require_unchunked()?;
            let mut encoder = ctx.encoder("gaussian_splat_translate_selection");
            let (formats, count) = (ctx.buffers.splats.formats, ctx.buffers.count());
            let sources = transform_sources(ctx.edit, formats, count)?;
            let splats = &mut ctx.buffers.splats;
            splat_kernels::translate_selection(
                &mut encoder,
                &sources,
                &mut splats.pos,
                &mut splats.other,
                delta,
            )?;
            ctx.edit.modified = true;
            ctx.recompute(&mut encoder)?;
            Ok(())
        });
        rejected("translate_selection", result)
    }

    /// Rotate the selection around `center` (splat-local) by a world-space rotation
    pub fn rotate_selection(
        &mut self,
        center: Vec3,
        local_to_world: Mat4,
        world_to_local: Mat4,
        rotation: Quat,
    ) -> SplatResult<()> {
        let result = self.edit_context().and_then(|mut ctx| {
            ctx.require_unchunked()?;
            if ctx.edit.other_at_gesture_start.is_none() {
                return Err(SplatError::MissingSnapshot(SnapshotKind::Other));
            }
            let mut encoder = ctx.encoder("gaussian_splat_rotate_selection");
            let (formats, count) = (ctx.buffers.splats.formats, ctx.buffers.count());
            let sources = transform_sources(ctx.edit, formats, count)?;
            let splats = &mut ctx.buffers.splats;
            splat_kernels::rotate_selection(
                &mut encoder,
                &sources,
                &mut splats.pos,
                &mut splats.other,
                center,
                local_to_world,
                world_to_local,
                rotation,
            )?;
            ctx.edit.modified = true;
            ctx.recompute(&mut encoder)?;
            Ok(())
        });
        rejected("rotate_selection", result)
    }

    /// Scale the selection around `center` (splat-local) by a world-space factor
    pub fn scale_selection(
        &mut self,
        center: Vec3,
        local_to_world: Mat4,
        world_to_local: Mat4,
        scale: Vec3,
    ) -> SplatResult<()> {
        let result = self.edit_context().and_then(|mut ctx| {
            ctx.require_unchunked()?;
            let mut encoder = ctx.encoder("gaussian_splat_scale_selection");
            let (formats, count) = (ctx.buffers.splats.formats, ctx.buffers.count());
            let sources = transform_sources(ctx.edit, formats, count)?;
            let splats = &mut ctx.buffers.splats;
            splat_kernels::scale_selection(
                &mut encoder,
                &sources,
                &mut splats.pos,
                &mut splats.other,
                center,
                local_to_world,
                world_to_local,
                scale,
            )?;
            ctx.edit.modified = true;
            ctx.recompute(&mut encoder)?;
            Ok(())
        });
        rejected("scale_selection", result)
    }

    /// Mark every selected splat deleted and clear the selection
    pub fn delete_selected(&mut self) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_delete_selected");
            let count = ctx.buffers.count();
            let before = ctx.edit.counts.deleted;
            let EditBuffers { selected, deleted, .. } = &mut *ctx.edit;
            splat_kernels::or_selected_into_deleted(&mut encoder, selected, deleted, count)?;
            encoder.clear_buffer(selected)?;
            let counts = ctx.recompute(&mut encoder)?;
            if counts.deleted != before {
                ctx.edit.modified = true;
            }
            Ok(counts)
        });
        rejected("delete_selected", result)
    }

    /// Bring every deleted splat back
    pub fn undelete_all(&mut self) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_undelete_all");
            let before = ctx.edit.counts.deleted;
            encoder.clear_buffer(&mut ctx.edit.deleted)?;
            let counts = ctx.recompute(&mut encoder)?;
            if counts.deleted != before {
                ctx.edit.modified = true;
            }
            Ok(counts)
        });
        rejected("undelete_all", result)
    }

    pub fn select_all(&mut self) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_select_all");
            let count = ctx.buffers.count();
            splat_kernels::set_selection(&mut encoder, &mut ctx.edit.selected, count)?;
            ctx.recompute(&mut encoder)
        });
        rejected("select_all", result)
    }

    pub fn deselect_all(&mut self) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_deselect_all");
            encoder.clear_buffer(&mut ctx.edit.selected)?;
            ctx.recompute(&mut encoder)
        });
        rejected("deselect_all", result)
    }

    pub fn invert_selection(&mut self) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_invert_selection");
            let count = ctx.buffers.count();
            splat_kernels::invert_selection(&mut encoder, &mut ctx.edit.selected, count)?;
            ctx.recompute(&mut encoder)
        });
        rejected("invert_selection", result)
    }

    /// Run the counts/bounds reduction and read it back
    pub fn recompute_counts_and_bounds(&mut self) -> SplatResult<SplatCounts> {
        let result = self.edit_context().and_then(|mut ctx| {
            let mut encoder = ctx.encoder("gaussian_splat_counts_and_bounds");
            ctx.recompute(&mut encoder)
        });
        rejected("recompute_counts_and_bounds", result)
    }

    /// Write every splat into `dst` as [`ExportedSplat`] records, optionally in world space
    pub fn export_data(&self, dst: &mut GpuBuffer, bake_transform: bool) -> SplatResult<()> {
        let result = self.check_editable().and_then(|()| {
            let buffers = self.store.buffers().ok_or(SplatError::NotLoaded)?;
            let count = buffers.count();
            let capacity = dst.element_count(EXPORT_WORDS) as u32;
            if capacity < count {
                return Err(SplatError::DestinationTooSmall {
                    capacity,
                    required: count,
                });
            }
            let device = self.store.device();
            let cutouts = CutoutBuffer::build(device, &self.cutouts, self.local_to_world);
            let edit = self.edit.buffers().map(|e| (&e.selected, &e.deleted));
            let splats = SplatBindings::new(&buffers.splats, &cutouts, edit);
            let mut encoder = device.create_command_encoder("gaussian_splat_export");
            splat_kernels::export_splats(
                &mut encoder,
                &splats,
                bake_transform.then_some(self.local_to_world),
                dst,
            )?;
            device.submit(&mut encoder)
        });
        rejected("export_data", result)
    }

    /// Buffer large enough for [`SplatCollection::export_data`]
    pub fn create_export_buffer(&self) -> GpuBuffer {
        self.store.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("gaussian_splat_export"),
            size: (self.splat_count().max(1) as usize * EXPORT_WORDS * 4) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Read the records of an export buffer back, one per live splat
    pub fn read_exported(&self, buffer: &GpuBuffer) -> SplatResult<Vec<ExportedSplat>> {
        let words = self.store.device().read_buffer(buffer)?;
        let count = (self.splat_count() as usize).min(words.len() / EXPORT_WORDS);
        Ok(bytemuck::cast_slice(&words[..count * EXPORT_WORDS]).to_vec())
    }

    /// Copy `count` splats starting at `src_start` into `dst` at `dst_start`,
    /// baking the relative transform between the two collections. Copied
    /// destination splats are marked not deleted.
    pub fn copy_range_into(
        &self,
        dst: &mut SplatCollection,
        src_start: u32,
        dst_start: u32,
        count: u32,
    ) -> SplatResult<()> {
        let result = self.check_editable().and_then(|()| {
            if count == 0 {
                warn!("Splat range copy with zero count ignored");
                return Ok(());
            }
            let src_buffers = self.store.buffers().ok_or(SplatError::NotLoaded)?;
            let src_count = src_buffers.count();
            let src_end = src_start.saturating_add(count);
            if src_end > src_count {
                return Err(SplatError::RangeOutOfBounds {
                    start: src_start,
                    end: src_end,
                    count: src_count,
                });
            }

            dst.check_editable()?;
            let transform = dst.world_to_local() * self.local_to_world;
            let device = dst.store.device().clone();
            let dst_buffers = dst.store.buffers_mut().ok_or(SplatError::NotLoaded)?;
            if dst_buffers.splats.chunks_valid {
                return Err(SplatError::ChunkedAsset);
            }
            let dst_count = dst_buffers.count();
            let dst_end = dst_start.saturating_add(count);
            if dst_end > dst_count {
                return Err(SplatError::RangeOutOfBounds {
                    start: dst_start,
                    end: dst_end,
                    count: dst_count,
                });
            }

            let mut encoder = device.create_command_encoder("gaussian_splat_copy_range");
            splat_kernels::copy_splats(
                &device,
                &mut encoder,
                &src_buffers.splats,
                &mut dst_buffers.splats,
                src_start,
                dst_start,
                count,
                transform,
            )?;
            if let EditState::Active(edit) = &mut dst.edit {
                splat_kernels::clear_bit_range(
                    &mut encoder,
                    &mut edit.deleted,
                    dst_count,
                    dst_start,
                    dst_end,
                )?;
                edit.modified = true;
            }
            device.submit(&mut encoder)?;
            if dst.edit.is_active() {
                dst.recompute_counts_and_bounds()?;
            }
            Ok(())
        });
        rejected("copy_range_into", result)
    }

    /// Change the splat count, keeping the first `min(old, new)` splats.
    ///
    /// Edit bitsets are reallocated: nothing is selected or deleted afterwards.
    pub fn resize(&mut self, new_count: u32) -> SplatResult<()> {
        let result = self.check_editable().and_then(|()| {
            let old_count = self.store.splat_count();
            self.store.resize(new_count)?;
            let device = self.store.device().clone();
            if let EditState::Active(edit) = &mut self.edit {
                edit.reallocate(&device, new_count);
                edit.modified = true;
            }
            if self.edit.is_active() {
                self.recompute_counts_and_bounds()?;
            }
            info!("Splat collection {:?} resized {} -> {}", self.id(), old_count, new_count);
            Ok(())
        });
        rejected("resize", result)
    }

    pub fn counts(&self) -> SplatCounts {
        self.edit.buffers().map_or_else(SplatCounts::default, |e| e.counts)
    }

    pub fn selection_bounds(&self) -> SelectionBounds {
        self.edit.buffers().map_or_else(SelectionBounds::default, |e| e.bounds)
    }

    /// Whether any edit changed splat data or deletion since the last reset
    pub fn is_modified(&self) -> bool {
        self.edit.buffers().is_some_and(|e| e.modified)
    }

    pub fn clear_modified(&mut self) {
        if let EditState::Active(edit) = &mut self.edit {
            edit.modified = false;
        }
    }

    pub fn selected_count(&self) -> u32 {
        self.counts().selected
    }

    pub fn deleted_count(&self) -> u32 {
        self.counts().deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radix_sort::float_to_sortable_uint;

    fn reduction(counts: [u32; 3], min: Vec3, max: Vec3) -> Vec<u32> {
        let mut words = counts.to_vec();
        words.extend(min.to_array().map(float_to_sortable_uint));
        words.extend(max.to_array().map(float_to_sortable_uint));
        words
    }

    #[test]
    fn empty_selection_decodes_to_default_bounds() {
        let mut words = vec![0, 3, 0];
        words.extend([u32::MAX; 3]);
        words.extend([0; 3]);
        let (counts, bounds) = decode_reduction(&words);
        assert_eq!(counts.deleted, 3);
        assert_eq!(bounds, SelectionBounds::default());
    }

    #[test]
    fn degenerate_bounds_expand_to_minimum_extent() {
        let words = reduction([1, 0, 0], Vec3::splat(2.0), Vec3::splat(2.0));
        let (_, bounds) = decode_reduction(&words);
        assert_eq!(bounds.center, Vec3::splat(2.0));
        assert_eq!(bounds.extents, Vec3::splat(0.1));
    }

    #[test]
    fn bounds_decode_through_sortable_keys() {
        let words = reduction([5, 0, 0], Vec3::new(-1.0, -2.0, -3.0), Vec3::new(1.0, 2.0, 3.0));
        let (counts, bounds) = decode_reduction(&words);
        assert_eq!(counts.selected, 5);
        assert_eq!(bounds.min(), Vec3::new(-1.0, -2.0, -3.0));
        assert_eq!(bounds.max(), Vec3::new(1.0, 2.0, 3.0));
    }
}
