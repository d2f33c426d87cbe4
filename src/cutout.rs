// Cutout volumes that mask a spatial region of a splat collection
//
// Cutouts live in world space. Every frame their transforms are re-expressed
// relative to the collection's local space and packed into a small GPU buffer
// (count + records). With no cutouts the buffer holds one zeroed record and the
// count is zero, which makes the mask a no-op in every kernel.

use bevy::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use wgpu::BufferUsages;

use crate::gpu::{GpuBuffer, GpuDevice};

const SHAPE_MASK: u32 = 0xff;
const INVERT_FLAG: u32 = 0x100;

/// Shape of a cutout volume in its local space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Reflect)]
pub enum CutoutShape {
    /// Unit sphere, scaled by the transform into an ellipsoid
    #[default]
    Ellipsoid,
    /// Cube spanning [-1, 1] on every axis
    Box,
}

impl CutoutShape {
    fn code(self) -> u32 {
        match self {
            CutoutShape::Ellipsoid => 0,
            CutoutShape::Box => 1,
        }
    }
}

/// A cutout attached to a splat collection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatCutout {
    pub shape: CutoutShape,
    /// Inverted cutouts hide what is inside instead of what is outside
    pub invert: bool,
    /// Cutout-local to world transform
    pub transform: Mat4,
}

impl SplatCutout {
    pub fn new(shape: CutoutShape, transform: Mat4) -> Self {
        Self {
            shape,
            invert: false,
            transform,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

/// Shader-ready cutout record
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CutoutShaderData {
    /// Splat-local space to cutout-local space
    pub matrix: [[f32; 4]; 4],
    pub type_and_flags: u32,
    pub _padding: [u32; 3],
}

impl CutoutShaderData {
    pub fn new(cutout: &SplatCutout, splat_local_to_world: Mat4) -> Self {
        let matrix = cutout.transform.inverse() * splat_local_to_world;
        let mut type_and_flags = cutout.shape.code();
        if cutout.invert {
            type_and_flags |= INVERT_FLAG;
        }
        Self {
            matrix: matrix.to_cols_array_2d(),
            type_and_flags,
            _padding: [0; 3],
        }
    }
}

/// Per-frame packed cutout data for one collection
#[derive(Debug)]
pub struct CutoutBuffer {
    pub count: u32,
    pub buffer: GpuBuffer,
}

impl CutoutBuffer {
    pub fn build(device: &GpuDevice, cutouts: &[SplatCutout], splat_local_to_world: Mat4) -> Self {
        let mut records: Vec<CutoutShaderData> = cutouts
            .iter()
            .map(|c| CutoutShaderData::new(c, splat_local_to_world))
            .collect();
        let count = records.len() as u32;
        if records.is_empty() {
            records.push(CutoutShaderData::default());
        }
        let buffer = device.create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
            label: Some("gaussian_splat_cutouts"),
            contents: bytemuck::cast_slice(&records),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        });
        Self { count, buffer }
    }

    /// The live records (empty when there are no cutouts or the buffer is device-backed)
    pub fn records(&self) -> &[CutoutShaderData] {
        let all: &[CutoutShaderData] = bytemuck::cast_slice(self.buffer.words());
        all.get(..self.count as usize).unwrap_or(&[])
    }
}

/// Whether a splat at `local_pos` is masked out by the cutouts.
///
/// Inside any inverted cutout: cut. Otherwise, if at least one regular cutout
/// exists the splat must be inside one of them to stay visible.
pub fn is_splat_cut(local_pos: Vec3, cutouts: &[CutoutShaderData]) -> bool {
    let mut final_cut = false;
    for data in cutouts {
        let invert = data.type_and_flags & INVERT_FLAG != 0;
        let p = Mat4::from_cols_array_2d(&data.matrix).transform_point3(local_pos);
        let inside = match data.type_and_flags & SHAPE_MASK {
            0 => p.length_squared() <= 1.0,
            1 => p.abs().max_element() <= 1.0,
            _ => continue,
        };
        if inside {
            return invert;
        }
        final_cut = !invert;
    }
    final_cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(cutouts: &[SplatCutout]) -> Vec<CutoutShaderData> {
        cutouts
            .iter()
            .map(|c| CutoutShaderData::new(c, Mat4::IDENTITY))
            .collect()
    }

    #[test]
    fn no_cutouts_cut_nothing() {
        assert!(!is_splat_cut(Vec3::splat(100.0), &[]));
    }

    #[test]
    fn box_cutout_keeps_inside_only() {
        let data = records(&[SplatCutout::new(CutoutShape::Box, Mat4::from_scale(Vec3::splat(2.0)))]);
        assert!(!is_splat_cut(Vec3::new(1.5, 0.0, 0.0), &data));
        assert!(is_splat_cut(Vec3::new(2.5, 0.0, 0.0), &data));
    }

    #[test]
    fn inverted_ellipsoid_hides_inside() {
        let data = records(&[SplatCutout::new(CutoutShape::Ellipsoid, Mat4::IDENTITY).inverted()]);
        assert!(is_splat_cut(Vec3::ZERO, &data));
        assert!(!is_splat_cut(Vec3::new(0.0, 3.0, 0.0), &data));
    }

    #[test]
    fn empty_buffer_has_one_record_and_zero_count() {
        let device = GpuDevice::new();
        let buffer = CutoutBuffer::build(&device, &[], Mat4::IDENTITY);
        assert_eq!(buffer.count, 0);
        assert!(buffer.records().is_empty());
        assert_eq!(buffer.buffer.size() as usize, std::mem::size_of::<CutoutShaderData>());
    }
}
