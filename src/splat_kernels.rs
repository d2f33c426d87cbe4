// Data-parallel splat kernels
//
// Each function here is one compute pass. It records the dispatch with its
// uniform block and bindings; on a device-backed encoder that is all, on a host
// encoder the per-element body then runs on the rayon pool. Bodies never read
// what another element of the same pass writes.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Quat, Vec2, Vec3, Vec4};
use rayon::prelude::*;

use crate::cutout::{is_splat_cut, CutoutBuffer, CutoutShaderData};
use crate::error::{SplatError, SplatResult};
use crate::gpu::{CommandEncoder, GpuBuffer, GpuDevice, KernelPass, KernelTarget};
use crate::gpu_pipelines::{kernel_flags, KernelParams, SplatKernel};
use crate::radix_sort::float_to_sortable_uint;
use crate::splat_asset::{
    decode_vector, encode_vector, pack_half2, pack_rotation, unpack_rotation, SplatFormats,
    SplatPoint, ROTATION_WORDS, SH_COEFFS,
};
use crate::splat_buffers::{SplatDataBuffers, SplatDataView, COLOR_TEXTURE_WIDTH};
use crate::splat_math::{
    clip_to_pixels, covariance_2d, covariance_3d, decompose_covariance, matrix_rotation, shade_sh,
};
use crate::splat_state::{
    self, bitset_words, set_bit, state_bits, test_bit, word_mask, SelectionOp, SelectionRect,
    BITS_PER_WORD,
};

/// Per-splat projected data consumed by the draw shaders (48 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SplatViewData {
    /// Clip-space center; w = 0 marks the splat as not drawn
    pub pos: [f32; 4],
    /// First screen-space ellipse axis in pixels
    pub axis1: [f32; 2],
    pub axis2: [f32; 2],
    /// Half-packed rgb + opacity
    pub color: [u32; 2],
    pub state: u32,
    pub _padding: u32,
}

pub const VIEW_DATA_WORDS: usize = std::mem::size_of::<SplatViewData>() / 4;

/// Words in the counts/bounds reduction buffer
pub const REDUCTION_WORDS: usize = 9;

/// Reduction contents before any splat is accumulated
pub const REDUCTION_RESET: [u32; REDUCTION_WORDS] =
    [0, 0, 0, u32::MAX, u32::MAX, u32::MAX, 0, 0, 0];

/// Exported record of one splat (decoded, optionally world-space)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ExportedSplat {
    pub pos: [f32; 3],
    pub rot: [f32; 4],
    pub scale: [f32; 3],
    /// rgb = base color, a = opacity
    pub color: [f32; 4],
    pub sh: [[f32; 3]; SH_COEFFS],
    pub state: u32,
}

pub const EXPORT_WORDS: usize = std::mem::size_of::<ExportedSplat>() / 4;

/// Selection and deletion bitsets as seen by a host kernel body.
///
/// Collections without edit state bind some other buffer in both slots and
/// clear `valid`; kernels then never read the words.
#[derive(Clone, Copy)]
pub struct SelectionBits<'a> {
    pub selected: &'a [u32],
    pub deleted: &'a [u32],
    pub valid: bool,
}

impl<'a> SelectionBits<'a> {
    pub fn new(selected: &'a [u32], deleted: &'a [u32]) -> Self {
        Self {
            selected,
            deleted,
            valid: true,
        }
    }

    pub fn placeholder(words: &'a [u32]) -> Self {
        Self {
            selected: words,
            deleted: words,
            valid: false,
        }
    }

    #[inline]
    pub fn is_selected(&self, index: u32) -> bool {
        self.valid && test_bit(self.selected, index)
    }

    #[inline]
    pub fn is_deleted(&self, index: u32) -> bool {
        self.valid && test_bit(self.deleted, index)
    }
}

/// Splat arrays, cutouts and edit bitsets bound by the splat-data kernels
#[derive(Clone, Copy)]
pub struct SplatBindings<'a> {
    pub splats: &'a SplatDataBuffers,
    pub cutouts: &'a CutoutBuffer,
    pub selected: &'a GpuBuffer,
    pub deleted: &'a GpuBuffer,
    pub bits_valid: bool,
}

/// Host-side inputs of a splat-data kernel body
struct HostSplats<'a> {
    data: SplatDataView<'a>,
    cutouts: &'a [CutoutShaderData],
    bits: SelectionBits<'a>,
}

impl<'a> SplatBindings<'a> {
    /// `edit` holds the selected and deleted bitsets when the collection has them
    pub fn new(
        splats: &'a SplatDataBuffers,
        cutouts: &'a CutoutBuffer,
        edit: Option<(&'a GpuBuffer, &'a GpuBuffer)>,
    ) -> Self {
        match edit {
            Some((selected, deleted)) => Self {
                splats,
                cutouts,
                selected,
                deleted,
                bits_valid: true,
            },
            None => Self {
                splats,
                cutouts,
                selected: &splats.chunks,
                deleted: &splats.chunks,
                bits_valid: false,
            },
        }
    }

    /// Same bindings with another buffer in the selection slot
    pub fn with_selection(mut self, selected: &'a GpuBuffer) -> Self {
        self.selected = selected;
        self
    }

    pub fn count(&self) -> u32 {
        self.splats.count
    }

    fn params(&self) -> KernelParams {
        let mut flags = 0;
        if self.splats.chunks_valid {
            flags |= kernel_flags::CHUNKS_VALID;
        }
        if self.bits_valid {
            flags |= kernel_flags::BITS_VALID;
        }
        KernelParams {
            count: self.splats.count,
            formats: self.splats.formats.packed(),
            flags,
            cutout_count: self.cutouts.count,
            ..Default::default()
        }
    }

    fn pass(&self, kernel: SplatKernel, invocations: u32, params: KernelParams) -> KernelPass {
        KernelPass::new(kernel, invocations)
            .uniform(params)
            .buffer(&self.splats.pos)
            .buffer(&self.splats.other)
            .buffer(&self.splats.sh)
            .texture(&self.splats.color)
            .buffer(&self.splats.chunks)
            .buffer(&self.cutouts.buffer)
            .buffer(self.selected)
            .buffer(self.deleted)
    }

    fn host(&self) -> SplatResult<HostSplats<'a>> {
        let data = self
            .splats
            .view()
            .ok_or_else(|| SplatError::BackendMismatch(self.splats.pos.label().to_string()))?;
        let bits = if self.bits_valid {
            SelectionBits::new(self.selected.words(), self.deleted.words())
        } else {
            SelectionBits::placeholder(self.selected.words())
        };
        Ok(HostSplats {
            data,
            cutouts: self.cutouts.records(),
            bits,
        })
    }
}

/// Inputs of the view-data pass
#[derive(Debug, Clone, Copy)]
pub struct ViewParams {
    /// Splat-local to view space (right-handed, -Z forward)
    pub model_view: Mat4,
    pub projection: Mat4,
    pub viewport: Vec2,
    /// Camera position in splat-local space
    pub camera_local: Vec3,
    pub scale_factor: f32,
    pub opacity_factor: f32,
    pub sh_order: u32,
    pub sh_only: bool,
}

/// Seed sort values with the identity permutation
pub fn init_sort_values(
    encoder: &mut CommandEncoder,
    values: &mut GpuBuffer,
    count: u32,
) -> SplatResult<()> {
    let count = count.min(values.len_words() as u32);
    let pass = KernelPass::new(SplatKernel::InitSortValues, count)
        .uniform(KernelParams {
            count,
            ..Default::default()
        })
        .buffer(values);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }
    values.words_mut()[..count as usize]
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, v)| *v = i as u32);
    Ok(())
}

/// Camera depth of every splat as a sortable key.
///
/// `depth_view` is the model-view matrix with Z flipped, so in-front depth is
/// positive and ascending keys run near to far.
pub fn calc_distances(
    encoder: &mut CommandEncoder,
    splats: &SplatBindings,
    depth_view: Mat4,
    keys: &mut GpuBuffer,
) -> SplatResult<()> {
    let count = splats.count();
    let params = splats.params().with_matrix_a(depth_view);
    let pass = splats
        .pass(SplatKernel::CalcDistances, count, params)
        .buffer(keys);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    let host = splats.host()?;
    keys.words_mut()[..count as usize]
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, key)| {
            let depth = depth_view.transform_point3(host.data.position(i as u32)).z;
            *key = float_to_sortable_uint(depth);
        });
    Ok(())
}

/// Project every splat and resolve its color and state
pub fn calc_view_data(
    encoder: &mut CommandEncoder,
    splats: &SplatBindings,
    params: &ViewParams,
    view: &mut GpuBuffer,
) -> SplatResult<()> {
    let count = splats.count();
    let mut uniform = splats
        .params()
        .with_matrix_a(params.model_view)
        .with_matrix_b(params.projection)
        .with_vec_a(Vec4::new(
            params.viewport.x,
            params.viewport.y,
            params.scale_factor,
            params.opacity_factor,
        ))
        .with_vec_b(params.camera_local.extend(0.0));
    uniform.arg0 = params.sh_order;
    if params.sh_only {
        uniform.flags |= kernel_flags::SH_ONLY;
    }
    let pass = splats
        .pass(SplatKernel::CalcViewData, count, uniform)
        .buffer(view);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    let HostSplats { data, cutouts, bits } = splats.host()?;
    let mvp = params.projection * params.model_view;
    let views: &mut [SplatViewData] = bytemuck::cast_slice_mut(view.words_mut());

    views[..count as usize]
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, out)| {
            let idx = i as u32;
            let pos = data.position(idx);

            let mut state = 0;
            if bits.is_selected(idx) {
                state |= state_bits::SELECTED;
            }
            if bits.is_deleted(idx) {
                state |= state_bits::DELETED;
            }
            if is_splat_cut(pos, cutouts) {
                state |= state_bits::CUT;
            }

            *out = SplatViewData {
                state,
                ..Default::default()
            };
            if state & (state_bits::DELETED | state_bits::CUT) != 0 {
                return;
            }

            let clip = mvp * pos.extend(1.0);
            if clip.w <= 0.0 {
                return;
            }

            let cov3d = covariance_3d(data.rotation(idx), data.scale(idx) * params.scale_factor);
            let Some(cov2d) =
                covariance_2d(pos, cov3d, params.model_view, params.projection, params.viewport)
            else {
                return;
            };
            let (axis1, axis2) = decompose_covariance(cov2d);

            let base = data.color(idx);
            let dir = (pos - params.camera_local).normalize_or_zero();
            let rgb = shade_sh(
                base.truncate(),
                &data.sh(idx),
                dir,
                params.sh_order,
                params.sh_only,
            );
            let opacity = (base.w * params.opacity_factor).clamp(0.0, 1.0);

            out.pos = clip.to_array();
            out.axis1 = axis1.to_array();
            out.axis2 = axis2.to_array();
            out.color = [pack_half2(rgb.x, rgb.y), pack_half2(rgb.z, opacity)];
        });
    Ok(())
}

/// Rebuild the selection from the gesture-start snapshot plus a screen rectangle.
///
/// `splats` binds the snapshot in its selection slot. Deleted, cut and
/// behind-camera splats are never touched by the rectangle.
pub fn update_selection(
    encoder: &mut CommandEncoder,
    splats: &SplatBindings,
    model_view_projection: Mat4,
    viewport: Vec2,
    rect: SelectionRect,
    op: SelectionOp,
    selected: &mut GpuBuffer,
) -> SplatResult<()> {
    let count = splats.count();
    let mut params = splats
        .params()
        .with_matrix_a(model_view_projection)
        .with_vec_a(Vec4::new(viewport.x, viewport.y, 0.0, 0.0))
        .with_vec_b(Vec4::new(rect.min.x, rect.min.y, rect.max.x, rect.max.y));
    params.arg0 = match op {
        SelectionOp::Set => 0,
        SelectionOp::Add => 1,
        SelectionOp::Remove => 2,
    };
    let words = bitset_words(count) as u32;
    let pass = splats
        .pass(SplatKernel::UpdateSelection, words, params)
        .buffer(selected);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    let HostSplats { data, cutouts, .. } = splats.host()?;
    let snapshot = splats.selected.words();
    let deleted = splats.deleted.words();
    selected.words_mut()[..words as usize]
        .par_iter_mut()
        .enumerate()
        .for_each(|(w, word)| {
            let mut bits = match op {
                SelectionOp::Set => 0,
                SelectionOp::Add | SelectionOp::Remove => snapshot[w],
            };
            let first = w as u32 * BITS_PER_WORD;
            for b in 0..BITS_PER_WORD {
                let idx = first + b;
                if idx >= count {
                    break;
                }
                if test_bit(deleted, idx) {
                    continue;
                }
                let pos = data.position(idx);
                if is_splat_cut(pos, cutouts) {
                    continue;
                }
                let Some(pixel) = clip_to_pixels(model_view_projection * pos.extend(1.0), viewport)
                else {
                    continue;
                };
                if rect.contains(pixel) {
                    match op {
                        SelectionOp::Set | SelectionOp::Add => bits |= 1 << b,
                        SelectionOp::Remove => bits &= !(1 << b),
                    }
                }
            }
            *word = bits & word_mask(w, count);
        });
    Ok(())
}

#[derive(Clone, Copy)]
struct Reduction {
    selected: u32,
    deleted: u32,
    cut: u32,
    min: [u32; 3],
    max: [u32; 3],
}

impl Default for Reduction {
    fn default() -> Self {
        Self {
            selected: 0,
            deleted: 0,
            cut: 0,
            min: [u32::MAX; 3],
            max: [0; 3],
        }
    }
}

impl Reduction {
    fn merge(mut self, other: Self) -> Self {
        self.selected += other.selected;
        self.deleted += other.deleted;
        self.cut += other.cut;
        for k in 0..3 {
            self.min[k] = self.min[k].min(other.min[k]);
            self.max[k] = self.max[k].max(other.max[k]);
        }
        self
    }
}

/// Count selected / deleted / cut splats and bound the visible selection.
///
/// Output layout: selectedCount, deletedCount, cutCount, min xyz, max xyz with
/// bounds stored as sortable uints. An empty selection leaves min at u32::MAX.
pub fn reduce_counts_and_bounds(
    encoder: &mut CommandEncoder,
    splats: &SplatBindings,
    out: &mut GpuBuffer,
) -> SplatResult<()> {
    encoder.upload(out, &REDUCTION_RESET)?;
    let count = splats.count();
    let pass = splats
        .pass(SplatKernel::CountsAndBounds, count, splats.params())
        .buffer(out);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    let HostSplats { data, cutouts, .. } = splats.host()?;
    let selected = splats.selected.words();
    let deleted = splats.deleted.words();
    let total = (0..count)
        .into_par_iter()
        .fold(Reduction::default, |mut acc, idx| {
            if test_bit(deleted, idx) {
                acc.deleted += 1;
                return acc;
            }
            let pos = data.position(idx);
            let cut = is_splat_cut(pos, cutouts);
            if cut {
                acc.cut += 1;
            }
            if test_bit(selected, idx) {
                acc.selected += 1;
                if !cut {
                    let keys = pos.to_array().map(float_to_sortable_uint);
                    for k in 0..3 {
                        acc.min[k] = acc.min[k].min(keys[k]);
                        acc.max[k] = acc.max[k].max(keys[k]);
                    }
                }
            }
            acc
        })
        .reduce(Reduction::default, Reduction::merge);

    let words = out.words_mut();
    words[0] = total.selected;
    words[1] = total.deleted;
    words[2] = total.cut;
    words[3..6].copy_from_slice(&total.min);
    words[6..9].copy_from_slice(&total.max);
    Ok(())
}

/// Gesture-start snapshots and edit bitsets read by the transform kernels
#[derive(Clone, Copy)]
pub struct TransformSources<'a> {
    pub formats: SplatFormats,
    pub count: u32,
    pub pos_snapshot: &'a GpuBuffer,
    pub other_snapshot: Option<&'a GpuBuffer>,
    pub selected: &'a GpuBuffer,
    pub deleted: &'a GpuBuffer,
}

impl TransformSources<'_> {
    fn params(&self) -> KernelParams {
        KernelParams {
            count: self.count,
            formats: self.formats.packed(),
            flags: if self.other_snapshot.is_some() {
                kernel_flags::HAS_OTHER
            } else {
                0
            },
            ..Default::default()
        }
    }

    fn pass(
        &self,
        kernel: SplatKernel,
        params: KernelParams,
        pos: &GpuBuffer,
        other: &GpuBuffer,
    ) -> KernelPass {
        KernelPass::new(kernel, self.count)
            .uniform(params)
            .buffer(self.pos_snapshot)
            .buffer(self.other_snapshot.unwrap_or(self.pos_snapshot))
            .buffer(self.selected)
            .buffer(self.deleted)
            .buffer(pos)
            .buffer(other)
    }

    /// Selected, non-deleted mask for splat `idx`
    #[inline]
    fn is_editable(&self, idx: u32) -> bool {
        test_bit(self.selected.words(), idx) && !test_bit(self.deleted.words(), idx)
    }
}

/// Move selected splats by `delta` (splat-local) from their gesture-start positions
pub fn translate_selection(
    encoder: &mut CommandEncoder,
    sources: &TransformSources,
    pos: &mut GpuBuffer,
    other: &mut GpuBuffer,
    delta: Vec3,
) -> SplatResult<()> {
    let params = sources.params().with_vec_a(delta.extend(0.0));
    let pass = sources.pass(SplatKernel::TranslateSelection, params, pos, other);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    let format = sources.formats.pos;
    let stride = format.stride_words();
    pos.words_mut()[..sources.count as usize * stride]
        .par_chunks_mut(stride)
        .zip(sources.pos_snapshot.words().par_chunks(stride))
        .enumerate()
        .for_each(|(i, (out, snap))| {
            if sources.is_editable(i as u32) {
                let p = decode_vector(format, snap, None) + delta;
                encode_vector(format, p, None, out);
            }
        });
    Ok(())
}

/// Pivot transform shared by the rotate and scale passes. `to_local_op` already
/// includes the local->world and world->local changes of basis.
fn transform_positions_about(
    sources: &TransformSources,
    pos: &mut GpuBuffer,
    center: Vec3,
    to_local_op: Mat3,
) {
    let format = sources.formats.pos;
    let stride = format.stride_words();
    pos.words_mut()[..sources.count as usize * stride]
        .par_chunks_mut(stride)
        .zip(sources.pos_snapshot.words().par_chunks(stride))
        .enumerate()
        .for_each(|(i, (out, snap))| {
            if sources.is_editable(i as u32) {
                let p = decode_vector(format, snap, None);
                let p = to_local_op * (p - center) + center;
                encode_vector(format, p, None, out);
            }
        });
}

/// Rotate selected splats around `center` (splat-local) by a world-space rotation.
///
/// Splat orientations follow when an other-data snapshot is bound.
#[allow(clippy::too_many_arguments)]
pub fn rotate_selection(
    encoder: &mut CommandEncoder,
    sources: &TransformSources,
    pos: &mut GpuBuffer,
    other: &mut GpuBuffer,
    center: Vec3,
    local_to_world: Mat4,
    world_to_local: Mat4,
    rotation: Quat,
) -> SplatResult<()> {
    let op = Mat3::from_mat4(world_to_local) * Mat3::from_quat(rotation) * Mat3::from_mat4(local_to_world);
    let local_rotation =
        (matrix_rotation(world_to_local) * rotation * matrix_rotation(local_to_world)).normalize();
    let params = sources
        .params()
        .with_matrix_a(Mat4::from_mat3(op))
        .with_vec_a(center.extend(0.0))
        .with_vec_b(Vec4::from(local_rotation.to_array()));
    let pass = sources.pass(SplatKernel::RotateSelection, params, pos, other);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    transform_positions_about(sources, pos, center, op);
    let Some(other_snapshot) = sources.other_snapshot else {
        return Ok(());
    };
    let stride = sources.formats.other_stride_words();
    other.words_mut()[..sources.count as usize * stride]
        .par_chunks_mut(stride)
        .zip(other_snapshot.words().par_chunks(stride))
        .enumerate()
        .for_each(|(i, (out, snap))| {
            if sources.is_editable(i as u32) {
                let q = (local_rotation * unpack_rotation(&snap[..ROTATION_WORDS])).normalize();
                out[..ROTATION_WORDS].copy_from_slice(&pack_rotation(q));
                out[ROTATION_WORDS..].copy_from_slice(&snap[ROTATION_WORDS..]);
            }
        });
    Ok(())
}

/// Scale selected splats around `center` (splat-local) by a world-space factor.
///
/// Splat sizes follow the geometric mean of `scale` when an other-data snapshot
/// is bound; otherwise only positions move.
#[allow(clippy::too_many_arguments)]
pub fn scale_selection(
    encoder: &mut CommandEncoder,
    sources: &TransformSources,
    pos: &mut GpuBuffer,
    other: &mut GpuBuffer,
    center: Vec3,
    local_to_world: Mat4,
    world_to_local: Mat4,
    scale: Vec3,
) -> SplatResult<()> {
    let op = Mat3::from_mat4(world_to_local) * Mat3::from_diagonal(scale) * Mat3::from_mat4(local_to_world);
    let size_factor = (scale.x * scale.y * scale.z).abs().cbrt();
    let mut params = sources
        .params()
        .with_matrix_a(Mat4::from_mat3(op))
        .with_vec_a(center.extend(0.0));
    params.factor_a = size_factor;
    let pass = sources.pass(SplatKernel::ScaleSelection, params, pos, other);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    transform_positions_about(sources, pos, center, op);
    let Some(other_snapshot) = sources.other_snapshot else {
        return Ok(());
    };
    let format = sources.formats.scale;
    let stride = sources.formats.other_stride_words();
    other.words_mut()[..sources.count as usize * stride]
        .par_chunks_mut(stride)
        .zip(other_snapshot.words().par_chunks(stride))
        .enumerate()
        .for_each(|(i, (out, snap))| {
            if sources.is_editable(i as u32) {
                let s = decode_vector(format, &snap[ROTATION_WORDS..], None) * size_factor;
                out[..ROTATION_WORDS].copy_from_slice(&snap[..ROTATION_WORDS]);
                encode_vector(format, s, None, &mut out[ROTATION_WORDS..]);
            }
        });
    Ok(())
}

/// Copy `count` splats from `src[src_start..]` into `dst[dst_start..]`, applying
/// `transform` (source local to destination local).
///
/// Matching non-quantized formats under an identity transform copy words
/// verbatim. The destination must not be chunk-quantized. On a device the
/// destination color rows are staged through a scratch buffer.
#[allow(clippy::too_many_arguments)]
pub fn copy_splats(
    device: &GpuDevice,
    encoder: &mut CommandEncoder,
    src: &SplatDataBuffers,
    dst: &mut SplatDataBuffers,
    src_start: u32,
    dst_start: u32,
    count: u32,
    transform: Mat4,
) -> SplatResult<()> {
    if count == 0 {
        return Ok(());
    }
    let verbatim =
        src.formats == dst.formats && !src.formats.needs_chunks() && transform == Mat4::IDENTITY;
    let (scale, rotation, _) = transform.to_scale_rotation_translation();

    let first_row = dst_start / COLOR_TEXTURE_WIDTH;
    let rows = (dst_start + count - 1) / COLOR_TEXTURE_WIDTH - first_row + 1;
    let mut scratch = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("gaussian_splat_copy_color_scratch"),
        size: if encoder.is_device() {
            (rows * COLOR_TEXTURE_WIDTH) as u64 * dst.formats.color.stride_words() as u64 * 4
        } else {
            4
        },
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut flags = kernel_flags::TRANSFORM;
    if src.chunks_valid {
        flags |= kernel_flags::CHUNKS_VALID;
    }
    if verbatim {
        flags |= kernel_flags::VERBATIM;
    }
    let params = KernelParams {
        count,
        formats: src.formats.packed(),
        dst_formats: dst.formats.packed(),
        flags,
        arg0: src_start,
        arg1: dst_start,
        arg2: first_row * COLOR_TEXTURE_WIDTH,
        ..Default::default()
    }
    .with_matrix_a(transform)
    .with_vec_a(scale.abs().extend(0.0))
    .with_vec_b(Vec4::from(rotation.to_array()));

    if encoder.is_device() {
        encoder.copy_texture_rows_to_buffer(&dst.color, first_row, rows, &mut scratch)?;
    }
    let pass = KernelPass::new(SplatKernel::CopySplats, count)
        .uniform(params)
        .buffer(&src.pos)
        .buffer(&src.other)
        .buffer(&src.sh)
        .texture(&src.color)
        .buffer(&src.chunks)
        .buffer(&dst.pos)
        .buffer(&dst.other)
        .buffer(&dst.sh)
        .buffer(&scratch);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return encoder.copy_buffer_to_texture_rows(&scratch, &mut dst.color, first_row, rows);
    }

    let src_view = src
        .view()
        .ok_or_else(|| SplatError::BackendMismatch(src.pos.label().to_string()))?;
    let mut dst_view = dst.view_mut();
    if verbatim {
        let f = src.formats;
        let copy = |stride: usize, from: &[u32], to: &mut [u32]| {
            let (s, d, n) = (
                src_start as usize * stride,
                dst_start as usize * stride,
                count as usize * stride,
            );
            to[d..d + n].copy_from_slice(&from[s..s + n]);
        };
        copy(f.pos.stride_words(), src_view.pos, dst_view.pos);
        copy(f.other_stride_words(), src_view.other, dst_view.other);
        copy(f.sh.stride_words(), src_view.sh, dst_view.sh);
        copy(f.color.stride_words(), src_view.color, dst_view.color);
        return Ok(());
    }

    let points: Vec<SplatPoint> = (0..count)
        .into_par_iter()
        .map(|k| {
            let mut p = src_view.point(src_start + k);
            p.position = transform.transform_point3(p.position);
            p.rotation = (rotation * p.rotation).normalize();
            p.scale *= scale.abs();
            p
        })
        .collect();

    for (k, point) in points.iter().enumerate() {
        dst_view.write_point(dst_start + k as u32, point);
    }
    Ok(())
}

/// Decode every splat into an [`ExportedSplat`] record of `out`, optionally
/// baking `transform`
pub fn export_splats(
    encoder: &mut CommandEncoder,
    splats: &SplatBindings,
    transform: Option<Mat4>,
    out: &mut GpuBuffer,
) -> SplatResult<()> {
    let count = splats.count();
    let decomposed = transform.map(|m| {
        let (scale, rotation, _) = m.to_scale_rotation_translation();
        (m, scale.abs(), rotation)
    });
    let mut params = splats.params();
    if let Some((m, scale, rotation)) = decomposed {
        params = params
            .with_matrix_a(m)
            .with_vec_a(scale.extend(0.0))
            .with_vec_b(Vec4::from(rotation.to_array()));
        params.flags |= kernel_flags::TRANSFORM;
    }
    let pass = splats
        .pass(SplatKernel::ExportData, count, params)
        .buffer(out);
    if encoder.dispatch(pass)? == KernelTarget::Device {
        return Ok(());
    }

    let HostSplats { data, cutouts, bits } = splats.host()?;
    let records: &mut [ExportedSplat] =
        bytemuck::cast_slice_mut(&mut out.words_mut()[..count as usize * EXPORT_WORDS]);
    records.par_iter_mut().enumerate().for_each(|(i, record)| {
        let idx = i as u32;
        let mut p = data.point(idx);
        let local_pos = p.position;
        if let Some((m, scale, rotation)) = decomposed {
            p.position = m.transform_point3(p.position);
            p.rotation = (rotation * p.rotation).normalize();
            p.scale *= scale;
        }

        let mut state = 0;
        if bits.is_selected(idx) {
            state |= state_bits::SELECTED;
        }
        if bits.is_deleted(idx) {
            state |= state_bits::DELETED;
        }
        if is_splat_cut(local_pos, cutouts) {
            state |= state_bits::CUT;
        }

        *record = ExportedSplat {
            pos: p.position.to_array(),
            rot: p.rotation.to_array(),
            scale: p.scale.to_array(),
            color: p.color.to_array(),
            sh: p.sh.map(|c| c.to_array()),
            state,
        };
    });
    Ok(())
}

fn bitset_pass(kernel: SplatKernel, bits: &GpuBuffer, count: u32) -> KernelPass {
    KernelPass::new(kernel, bits.len_words() as u32).uniform(KernelParams {
        count,
        ..Default::default()
    })
}

/// Select every live splat
pub fn set_selection(
    encoder: &mut CommandEncoder,
    selected: &mut GpuBuffer,
    count: u32,
) -> SplatResult<()> {
    let pass = bitset_pass(SplatKernel::SetSelection, selected, count).buffer(selected);
    if encoder.dispatch(pass)? == KernelTarget::Host {
        splat_state::set_all(selected.words_mut(), count);
    }
    Ok(())
}

/// Complement the selection of every live splat
pub fn invert_selection(
    encoder: &mut CommandEncoder,
    selected: &mut GpuBuffer,
    count: u32,
) -> SplatResult<()> {
    let pass = bitset_pass(SplatKernel::InvertSelection, selected, count).buffer(selected);
    if encoder.dispatch(pass)? == KernelTarget::Host {
        splat_state::invert(selected.words_mut(), count);
    }
    Ok(())
}

/// deleted |= selected
pub fn or_selected_into_deleted(
    encoder: &mut CommandEncoder,
    selected: &GpuBuffer,
    deleted: &mut GpuBuffer,
    count: u32,
) -> SplatResult<()> {
    let pass = bitset_pass(SplatKernel::OrSelectedIntoDeleted, deleted, count)
        .buffer(selected)
        .buffer(deleted);
    if encoder.dispatch(pass)? == KernelTarget::Host {
        splat_state::or_into(deleted.words_mut(), selected.words());
    }
    Ok(())
}

/// Clear bits `start..end`
pub fn clear_bit_range(
    encoder: &mut CommandEncoder,
    bits: &mut GpuBuffer,
    count: u32,
    start: u32,
    end: u32,
) -> SplatResult<()> {
    let mut pass = bitset_pass(SplatKernel::ClearBitRange, bits, count);
    pass = pass
        .uniform(KernelParams {
            count,
            arg0: start,
            arg1: end,
            ..Default::default()
        })
        .buffer(bits);
    if encoder.dispatch(pass)? == KernelTarget::Host {
        let words = bits.words_mut();
        for i in start..end.min(count) {
            set_bit(words, i, false);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_data_is_48_bytes() {
        assert_eq!(std::mem::size_of::<SplatViewData>(), 48);
        assert_eq!(VIEW_DATA_WORDS, 12);
        assert_eq!(EXPORT_WORDS, 60);
    }

    #[test]
    fn placeholder_bits_read_as_clear() {
        let words = [u32::MAX; 4];
        let bits = SelectionBits::placeholder(&words);
        assert!(!bits.is_selected(3));
        assert!(!bits.is_deleted(3));
        let bits = SelectionBits::new(&words, &words);
        assert!(bits.is_selected(3));
    }

    #[test]
    fn clear_bit_range_spans_word_boundaries() {
        let device = GpuDevice::new();
        let mut bits = device.create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
            label: Some("bits"),
            contents: bytemuck::cast_slice(&[u32::MAX, u32::MAX, 0xf]),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let mut encoder = CommandEncoder::new("test");
        clear_bit_range(&mut encoder, &mut bits, 68, 30, 66).unwrap();
        assert_eq!(bits.words(), &[0x3fff_ffff, 0, 0xc]);
        assert_eq!(encoder.labels(), vec!["gaussian_splat_clear_bit_range"]);
    }
}
