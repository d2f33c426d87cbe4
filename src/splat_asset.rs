// Splat asset boundary: immutable per-dataset arrays produced by an importer
//
// All element arrays are stored as 32-bit words in the packed formats below and
// are uploaded to the GPU verbatim. Chunk-relative formats (Norm11) are
// dequantized against per-chunk min/max metadata.

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3, Vec4};
use half::f16;
use std::hash::{Hash, Hasher};

use crate::error::{SplatError, SplatResult};
use crate::splat_buffers::MAX_SPLAT_COUNT;

/// Asset layout version understood by this crate
pub const SPLAT_ASSET_VERSION: u32 = 2024_01_00;

/// Number of splats covered by one chunk metadata record
pub const CHUNK_SIZE: u32 = 256;

/// Words per ChunkInfo record
pub const CHUNK_WORDS: usize = 12;

/// Number of higher-order SH coefficients (bands 1-3) stored per splat
pub const SH_COEFFS: usize = 15;

/// Words used by the packed rotation quaternion inside "other" data
pub const ROTATION_WORDS: usize = 2;

/// Storage format for positions and scales
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VectorFormat {
    /// Three f32 values
    #[default]
    Float32,
    /// Three f16 values packed in two words
    Float16,
    /// 11-10-11 bit unorm relative to the owning chunk's min/max
    Norm11,
}

impl VectorFormat {
    pub const fn stride_words(self) -> usize {
        match self {
            VectorFormat::Float32 => 3,
            VectorFormat::Float16 => 2,
            VectorFormat::Norm11 => 1,
        }
    }

    pub const fn is_chunk_relative(self) -> bool {
        matches!(self, VectorFormat::Norm11)
    }

    /// Tag used by the shader decoders
    pub const fn code(self) -> u32 {
        match self {
            VectorFormat::Float32 => 0,
            VectorFormat::Float16 => 1,
            VectorFormat::Norm11 => 2,
        }
    }
}

/// Storage format for the 15 higher-order SH coefficients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShFormat {
    #[default]
    Float32,
    Float16,
}

impl ShFormat {
    pub const fn stride_words(self) -> usize {
        match self {
            ShFormat::Float32 => SH_COEFFS * 3,
            // 45 halves, last word half-empty
            ShFormat::Float16 => (SH_COEFFS * 3).div_ceil(2),
        }
    }

    pub const fn code(self) -> u32 {
        match self {
            ShFormat::Float32 => 0,
            ShFormat::Float16 => 1,
        }
    }
}

/// Storage format of the packed color (rgb base color, a = opacity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorFormat {
    Float32x4,
    #[default]
    Float16x4,
    Norm8x4,
}

impl ColorFormat {
    pub const fn stride_words(self) -> usize {
        match self {
            ColorFormat::Float32x4 => 4,
            ColorFormat::Float16x4 => 2,
            ColorFormat::Norm8x4 => 1,
        }
    }

    pub const fn code(self) -> u32 {
        match self {
            ColorFormat::Float32x4 => 0,
            ColorFormat::Float16x4 => 1,
            ColorFormat::Norm8x4 => 2,
        }
    }

    /// Texture format the color data is encoded into on upload
    pub fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            ColorFormat::Float32x4 => wgpu::TextureFormat::Rgba32Float,
            ColorFormat::Float16x4 => wgpu::TextureFormat::Rgba16Float,
            ColorFormat::Norm8x4 => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// Format tags of one splat dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SplatFormats {
    pub pos: VectorFormat,
    pub scale: VectorFormat,
    pub color: ColorFormat,
    pub sh: ShFormat,
}

impl SplatFormats {
    pub const fn other_stride_words(&self) -> usize {
        ROTATION_WORDS + self.scale.stride_words()
    }

    pub const fn needs_chunks(&self) -> bool {
        self.pos.is_chunk_relative() || self.scale.is_chunk_relative()
    }

    /// All four tags packed as pos | scale << 4 | sh << 8 | color << 12
    pub const fn packed(&self) -> u32 {
        self.pos.code() | self.scale.code() << 4 | self.sh.code() << 8 | self.color.code() << 12
    }
}

/// Per-chunk bounding metadata (matches the GPU ChunkInfo struct)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ChunkInfo {
    pub pos_min: [f32; 3],
    pub pos_max: [f32; 3],
    pub scale_min: [f32; 3],
    pub scale_max: [f32; 3],
}

impl ChunkInfo {
    pub fn pos_range(&self) -> (Vec3, Vec3) {
        (Vec3::from(self.pos_min), Vec3::from(self.pos_max))
    }

    pub fn scale_range(&self) -> (Vec3, Vec3) {
        (Vec3::from(self.scale_min), Vec3::from(self.scale_max))
    }
}

/// A camera pose stored alongside the dataset (e.g. from capture)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraPose {
    pub position: Vec3,
    pub axis_x: Vec3,
    pub axis_y: Vec3,
    pub axis_z: Vec3,
    pub fov: f32,
}

/// Immutable splat dataset as produced by the importer
#[derive(Debug, Clone, Default)]
pub struct SplatAsset {
    pub count: u32,
    pub formats: SplatFormats,
    pub pos_data: Vec<u32>,
    pub other_data: Vec<u32>,
    pub sh_data: Vec<u32>,
    pub color_data: Vec<u32>,
    pub chunk_data: Option<Vec<u32>>,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
    pub camera_poses: Vec<CameraPose>,
    pub format_version: u32,
    pub content_hash: u64,
}

impl SplatAsset {
    /// Check that the asset is complete and consistent with its declared formats
    pub fn validate(&self) -> SplatResult<()> {
        if self.count == 0 {
            return Err(SplatError::EmptyAsset);
        }
        if self.count > MAX_SPLAT_COUNT {
            return Err(SplatError::InvalidCount {
                requested: self.count,
                max: MAX_SPLAT_COUNT,
            });
        }
        if self.format_version != SPLAT_ASSET_VERSION {
            return Err(SplatError::VersionMismatch {
                expected: SPLAT_ASSET_VERSION,
                found: self.format_version,
            });
        }
        let n = self.count as usize;
        let arrays: [(&'static str, &[u32], usize); 4] = [
            ("position", &self.pos_data, self.formats.pos.stride_words()),
            ("other", &self.other_data, self.formats.other_stride_words()),
            ("sh", &self.sh_data, self.formats.sh.stride_words()),
            ("color", &self.color_data, self.formats.color.stride_words()),
        ];
        for (name, data, stride) in arrays {
            if data.is_empty() {
                return Err(SplatError::MissingData(name));
            }
            if data.len() != n * stride {
                return Err(SplatError::DataSizeMismatch {
                    name,
                    expected: n * stride,
                    found: data.len(),
                });
            }
        }
        match &self.chunk_data {
            Some(chunks) => {
                let expected = self.chunk_count() as usize * CHUNK_WORDS;
                if chunks.len() != expected {
                    return Err(SplatError::DataSizeMismatch {
                        name: "chunk",
                        expected,
                        found: chunks.len(),
                    });
                }
            }
            None => {
                if self.formats.pos.is_chunk_relative() {
                    return Err(SplatError::MissingChunks("position"));
                }
                if self.formats.scale.is_chunk_relative() {
                    return Err(SplatError::MissingChunks("scale"));
                }
            }
        }
        Ok(())
    }

    /// Number of chunk records this asset's element count implies
    pub fn chunk_count(&self) -> u32 {
        self.count.div_ceil(CHUNK_SIZE)
    }

    pub fn has_chunks(&self) -> bool {
        self.chunk_data.is_some()
    }

    pub fn chunks(&self) -> Option<&[ChunkInfo]> {
        self.chunk_data
            .as_deref()
            .and_then(|words| bytemuck::try_cast_slice(words).ok())
    }

    /// Recompute `content_hash` from the element arrays
    pub fn rehash(&mut self) {
        self.content_hash = hash_asset_content(self);
    }
}

fn hash_asset_content(asset: &SplatAsset) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    asset.count.hash(&mut hasher);
    asset.formats.hash(&mut hasher);
    asset.pos_data.hash(&mut hasher);
    asset.other_data.hash(&mut hasher);
    asset.sh_data.hash(&mut hasher);
    asset.color_data.hash(&mut hasher);
    asset.chunk_data.hash(&mut hasher);
    hasher.finish()
}

/// Inverse sigmoid function
pub fn inverse_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

/// Sigmoid function (raw opacity -> opacity)
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ============================================================================
// Packing helpers (shared by the asset encoder and the GPU kernels)
// ============================================================================

/// Pack two f32 values into f16 format and store in u32
pub fn pack_half2(a: f32, b: f32) -> u32 {
    let a_u16 = f16::from_f32(a).to_bits();
    let b_u16 = f16::from_f32(b).to_bits();
    (a_u16 as u32) | ((b_u16 as u32) << 16)
}

pub fn unpack_half2(v: u32) -> (f32, f32) {
    (
        f16::from_bits((v & 0xffff) as u16).to_f32(),
        f16::from_bits((v >> 16) as u16).to_f32(),
    )
}

/// Pack a [0,1]^3 vector in 11_10_11 format:
///   x = bits 0-10, y = bits 11-20, z = bits 21-31
pub fn pack_unorm_11_10_11(v: Vec3) -> u32 {
    let x = (v.x.clamp(0.0, 1.0) * 2047.0).round() as u32;
    let y = (v.y.clamp(0.0, 1.0) * 1023.0).round() as u32;
    let z = (v.z.clamp(0.0, 1.0) * 2047.0).round() as u32;
    (z << 21) | (y << 11) | x
}

pub fn unpack_unorm_11_10_11(v: u32) -> Vec3 {
    Vec3::new(
        (v & 2047) as f32 / 2047.0,
        ((v >> 11) & 1023) as f32 / 1023.0,
        ((v >> 21) & 2047) as f32 / 2047.0,
    )
}

/// Decode a position/scale vector. `range` is the chunk min/max for chunk-relative formats.
pub fn decode_vector(format: VectorFormat, words: &[u32], range: Option<(Vec3, Vec3)>) -> Vec3 {
    match format {
        VectorFormat::Float32 => Vec3::new(
            f32::from_bits(words[0]),
            f32::from_bits(words[1]),
            f32::from_bits(words[2]),
        ),
        VectorFormat::Float16 => {
            let (x, y) = unpack_half2(words[0]);
            let (z, _) = unpack_half2(words[1]);
            Vec3::new(x, y, z)
        }
        VectorFormat::Norm11 => {
            let t = unpack_unorm_11_10_11(words[0]);
            let (min, max) = range.unwrap_or((Vec3::ZERO, Vec3::ONE));
            min + (max - min) * t
        }
    }
}

/// Encode a position/scale vector into `out` (length = `format.stride_words()`)
pub fn encode_vector(format: VectorFormat, v: Vec3, range: Option<(Vec3, Vec3)>, out: &mut [u32]) {
    match format {
        VectorFormat::Float32 => {
            out[0] = v.x.to_bits();
            out[1] = v.y.to_bits();
            out[2] = v.z.to_bits();
        }
        VectorFormat::Float16 => {
            out[0] = pack_half2(v.x, v.y);
            out[1] = pack_half2(v.z, 0.0);
        }
        VectorFormat::Norm11 => {
            let (min, max) = range.unwrap_or((Vec3::ZERO, Vec3::ONE));
            let extent = (max - min).max(Vec3::splat(1e-10));
            out[0] = pack_unorm_11_10_11((v - min) / extent);
        }
    }
}

/// Rotation quaternion as four f16 values (x, y, z, w)
pub fn pack_rotation(q: Quat) -> [u32; 2] {
    [pack_half2(q.x, q.y), pack_half2(q.z, q.w)]
}

pub fn unpack_rotation(words: &[u32]) -> Quat {
    let (x, y) = unpack_half2(words[0]);
    let (z, w) = unpack_half2(words[1]);
    Quat::from_xyzw(x, y, z, w)
}

pub fn decode_sh(format: ShFormat, words: &[u32]) -> [Vec3; SH_COEFFS] {
    let mut sh = [Vec3::ZERO; SH_COEFFS];
    match format {
        ShFormat::Float32 => {
            for (i, c) in sh.iter_mut().enumerate() {
                *c = Vec3::new(
                    f32::from_bits(words[i * 3]),
                    f32::from_bits(words[i * 3 + 1]),
                    f32::from_bits(words[i * 3 + 2]),
                );
            }
        }
        ShFormat::Float16 => {
            let mut flat = [0.0f32; SH_COEFFS * 3 + 1];
            for (i, &w) in words.iter().enumerate().take(flat.len() / 2) {
                let (a, b) = unpack_half2(w);
                flat[i * 2] = a;
                flat[i * 2 + 1] = b;
            }
            for (i, c) in sh.iter_mut().enumerate() {
                *c = Vec3::new(flat[i * 3], flat[i * 3 + 1], flat[i * 3 + 2]);
            }
        }
    }
    sh
}

pub fn encode_sh(format: ShFormat, sh: &[Vec3; SH_COEFFS], out: &mut [u32]) {
    match format {
        ShFormat::Float32 => {
            for (i, c) in sh.iter().enumerate() {
                out[i * 3] = c.x.to_bits();
                out[i * 3 + 1] = c.y.to_bits();
                out[i * 3 + 2] = c.z.to_bits();
            }
        }
        ShFormat::Float16 => {
            let mut flat = [0.0f32; SH_COEFFS * 3 + 1];
            for (i, c) in sh.iter().enumerate() {
                flat[i * 3] = c.x;
                flat[i * 3 + 1] = c.y;
                flat[i * 3 + 2] = c.z;
            }
            for (i, w) in out.iter_mut().enumerate() {
                *w = pack_half2(flat[i * 2], flat[i * 2 + 1]);
            }
        }
    }
}

pub fn decode_color(format: ColorFormat, words: &[u32]) -> Vec4 {
    match format {
        ColorFormat::Float32x4 => Vec4::new(
            f32::from_bits(words[0]),
            f32::from_bits(words[1]),
            f32::from_bits(words[2]),
            f32::from_bits(words[3]),
        ),
        ColorFormat::Float16x4 => {
            let (r, g) = unpack_half2(words[0]);
            let (b, a) = unpack_half2(words[1]);
            Vec4::new(r, g, b, a)
        }
        ColorFormat::Norm8x4 => {
            let w = words[0];
            Vec4::new(
                (w & 0xff) as f32 / 255.0,
                ((w >> 8) & 0xff) as f32 / 255.0,
                ((w >> 16) & 0xff) as f32 / 255.0,
                ((w >> 24) & 0xff) as f32 / 255.0,
            )
        }
    }
}

pub fn encode_color(format: ColorFormat, c: Vec4, out: &mut [u32]) {
    match format {
        ColorFormat::Float32x4 => {
            out[0] = c.x.to_bits();
            out[1] = c.y.to_bits();
            out[2] = c.z.to_bits();
            out[3] = c.w.to_bits();
        }
        ColorFormat::Float16x4 => {
            out[0] = pack_half2(c.x, c.y);
            out[1] = pack_half2(c.z, c.w);
        }
        ColorFormat::Norm8x4 => {
            let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
            out[0] = q(c.x) | (q(c.y) << 8) | (q(c.z) << 16) | (q(c.w) << 24);
        }
    }
}

// ============================================================================
// Asset encoding (used by importers and tests)
// ============================================================================

/// One splat in decoded form
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatPoint {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// rgb = base color, a = opacity
    pub color: Vec4,
    pub sh: [Vec3; SH_COEFFS],
}

impl Default for SplatPoint {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::splat(0.01),
            color: Vec4::new(1.0, 1.0, 1.0, 1.0),
            sh: [Vec3::ZERO; SH_COEFFS],
        }
    }
}

/// Encodes decoded splats into a [`SplatAsset`]
#[derive(Debug, Clone, Default)]
pub struct SplatAssetBuilder {
    formats: SplatFormats,
    chunked: bool,
    camera_poses: Vec<CameraPose>,
}

impl SplatAssetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn formats(mut self, formats: SplatFormats) -> Self {
        self.formats = formats;
        self
    }

    /// Emit per-chunk metadata even for non-quantized formats
    pub fn chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn camera_poses(mut self, poses: Vec<CameraPose>) -> Self {
        self.camera_poses = poses;
        self
    }

    pub fn build(&self, points: &[SplatPoint]) -> SplatAsset {
        let formats = self.formats;
        let n = points.len();
        let chunked = self.chunked || formats.needs_chunks();

        let chunks: Vec<ChunkInfo> = if chunked {
            points
                .chunks(CHUNK_SIZE as usize)
                .map(|chunk| {
                    let mut info = ChunkInfo {
                        pos_min: [f32::MAX; 3],
                        pos_max: [f32::MIN; 3],
                        scale_min: [f32::MAX; 3],
                        scale_max: [f32::MIN; 3],
                    };
                    for p in chunk {
                        info.pos_min = Vec3::from(info.pos_min).min(p.position).into();
                        info.pos_max = Vec3::from(info.pos_max).max(p.position).into();
                        info.scale_min = Vec3::from(info.scale_min).min(p.scale).into();
                        info.scale_max = Vec3::from(info.scale_max).max(p.scale).into();
                    }
                    info
                })
                .collect()
        } else {
            Vec::new()
        };

        let pos_stride = formats.pos.stride_words();
        let other_stride = formats.other_stride_words();
        let sh_stride = formats.sh.stride_words();
        let color_stride = formats.color.stride_words();

        let mut pos_data = vec![0u32; n * pos_stride];
        let mut other_data = vec![0u32; n * other_stride];
        let mut sh_data = vec![0u32; n * sh_stride];
        let mut color_data = vec![0u32; n * color_stride];

        let mut bounds_min = Vec3::splat(f32::MAX);
        let mut bounds_max = Vec3::splat(f32::MIN);

        for (i, p) in points.iter().enumerate() {
            let chunk = chunks.get(i / CHUNK_SIZE as usize);
            encode_vector(
                formats.pos,
                p.position,
                chunk.map(ChunkInfo::pos_range),
                &mut pos_data[i * pos_stride..(i + 1) * pos_stride],
            );
            let other = &mut other_data[i * other_stride..(i + 1) * other_stride];
            other[..ROTATION_WORDS].copy_from_slice(&pack_rotation(p.rotation.normalize()));
            encode_vector(
                formats.scale,
                p.scale,
                chunk.map(ChunkInfo::scale_range),
                &mut other[ROTATION_WORDS..],
            );
            encode_sh(formats.sh, &p.sh, &mut sh_data[i * sh_stride..(i + 1) * sh_stride]);
            encode_color(
                formats.color,
                p.color,
                &mut color_data[i * color_stride..(i + 1) * color_stride],
            );
            bounds_min = bounds_min.min(p.position);
            bounds_max = bounds_max.max(p.position);
        }

        if n == 0 {
            bounds_min = Vec3::ZERO;
            bounds_max = Vec3::ZERO;
        }

        let mut asset = SplatAsset {
            count: n as u32,
            formats,
            pos_data,
            other_data,
            sh_data,
            color_data,
            chunk_data: chunked.then(|| bytemuck::cast_slice::<ChunkInfo, u32>(&chunks).to_vec()),
            bounds_min,
            bounds_max,
            camera_poses: self.camera_poses.clone(),
            format_version: SPLAT_ASSET_VERSION,
            content_hash: 0,
        };
        asset.rehash();
        asset
    }
}

/// Create example/test splats laid out on a dense 3D grid
pub fn create_test_points(count: usize) -> Vec<SplatPoint> {
    let grid_size = ((count as f32).cbrt().ceil() as usize).max(1);
    let spacing = 0.1;
    let offset = -(grid_size as f32 * spacing) / 2.0;
    let extent = grid_size as f32 * spacing;

    (0..count)
        .map(|i| {
            let x = (i % grid_size) as f32 * spacing + offset;
            let y = ((i / grid_size) % grid_size) as f32 * spacing + offset;
            let z = (i / (grid_size * grid_size)) as f32 * spacing + offset;

            // Random-ish rotation based on position
            let angle = (x + y + z) * 0.5;
            let axis = Vec3::new(x, y, z).normalize_or(Vec3::Y);
            let rotation = Quat::from_axis_angle(axis, angle);

            // Color gradient based on position
            let color = Vec3::new(
                (x - offset) / extent,
                (y - offset) / extent,
                (z - offset) / extent,
            );
            let mut sh = [Vec3::ZERO; SH_COEFFS];
            sh[0] = color * 0.1;

            SplatPoint {
                position: Vec3::new(x, y, z),
                rotation,
                scale: Vec3::splat((-4.0f32).exp()),
                color: color.extend(0.9),
                sh,
            }
        })
        .collect()
}

/// Create a full-precision test asset with `count` grid splats
pub fn create_test_asset(count: usize) -> SplatAsset {
    SplatAssetBuilder::new()
        .formats(SplatFormats {
            pos: VectorFormat::Float32,
            scale: VectorFormat::Float32,
            color: ColorFormat::Float32x4,
            sh: ShFormat::Float32,
        })
        .build(&create_test_points(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_vectors_round_trip_through_encoding() {
        let v = Vec3::new(0.5, -2.25, 100.0);
        let mut words = [0u32; 2];
        encode_vector(VectorFormat::Float16, v, None, &mut words);
        assert_eq!(decode_vector(VectorFormat::Float16, &words, None), v);
    }

    #[test]
    fn norm11_is_relative_to_chunk_range() {
        let range = (Vec3::splat(-1.0), Vec3::splat(1.0));
        let mut words = [0u32; 1];
        encode_vector(VectorFormat::Norm11, Vec3::new(1.0, -1.0, 0.0), Some(range), &mut words);
        let v = decode_vector(VectorFormat::Norm11, &words, Some(range));
        assert!((v - Vec3::new(1.0, -1.0, 0.0)).abs().max_element() < 1e-3);
    }

    #[test]
    fn validate_rejects_version_mismatch_and_missing_arrays() {
        let mut asset = create_test_asset(8);
        assert!(asset.validate().is_ok());

        asset.format_version += 1;
        assert!(matches!(asset.validate(), Err(SplatError::VersionMismatch { .. })));

        let mut asset = create_test_asset(8);
        asset.sh_data.clear();
        assert_eq!(asset.validate(), Err(SplatError::MissingData("sh")));

        let asset = SplatAsset::default();
        assert_eq!(asset.validate(), Err(SplatError::EmptyAsset));
    }

    #[test]
    fn validate_rejects_count_above_maximum() {
        let mut asset = create_test_asset(4);
        asset.count = MAX_SPLAT_COUNT + 1;
        assert_eq!(
            asset.validate(),
            Err(SplatError::InvalidCount {
                requested: MAX_SPLAT_COUNT + 1,
                max: MAX_SPLAT_COUNT,
            })
        );
    }

    #[test]
    fn quantized_formats_require_chunks() {
        let formats = SplatFormats {
            pos: VectorFormat::Norm11,
            ..Default::default()
        };
        let mut asset = SplatAssetBuilder::new().formats(formats).build(&create_test_points(300));
        assert_eq!(asset.chunks().map(<[ChunkInfo]>::len), Some(2));
        assert!(asset.validate().is_ok());
        asset.chunk_data = None;
        assert_eq!(asset.validate(), Err(SplatError::MissingChunks("position")));
    }
}
