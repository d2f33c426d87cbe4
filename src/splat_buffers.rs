// GPU-side storage for one splat collection
//
// The store owns the uploaded asset arrays (positions, other, SH, color texture,
// chunk metadata) and the per-frame working buffers (view data, sort keys/values,
// cube index buffer). Every buffer except SH/color is sized exactly to the live
// splat count. Buffer identity only changes through load/unload/resize.

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3, Vec4};
use tracing::{debug, error, info};
use wgpu::{BufferUsages, TextureUsages};

use crate::error::{SplatError, SplatResult};
use crate::gpu::{GpuBuffer, GpuDevice, GpuTexture};
use crate::radix_sort::{RadixSortEngine, SortEngine, SortResources};
use crate::splat_asset::{
    decode_color, decode_sh, decode_vector, encode_color, encode_sh, encode_vector, pack_rotation,
    unpack_rotation, ChunkInfo, SplatAsset, SplatFormats, SplatPoint, CHUNK_SIZE, CHUNK_WORDS,
    ROTATION_WORDS, SH_COEFFS,
};
use crate::splat_kernels::{self, VIEW_DATA_WORDS};

/// Largest splat count a collection may hold
pub const MAX_SPLAT_COUNT: u32 = 1 << 25;

/// Width in texels of the packed color texture
pub const COLOR_TEXTURE_WIDTH: u32 = 2048;

/// Triangle list for a unit cube, used by box-like debug draws
pub const CUBE_INDICES: [u32; 36] = [
    0, 1, 2, 1, 3, 2, //
    4, 6, 5, 5, 6, 7, //
    0, 2, 4, 4, 2, 6, //
    1, 5, 3, 5, 7, 3, //
    0, 4, 1, 4, 5, 1, //
    2, 3, 6, 3, 7, 6,
];

/// Identity of a loaded asset: allocation address plus content hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetKey {
    ptr: usize,
    hash: u64,
}

impl AssetKey {
    pub fn of(asset: &Arc<SplatAsset>) -> Self {
        Self {
            ptr: Arc::as_ptr(asset) as usize,
            hash: asset.content_hash,
        }
    }
}

/// Color texture height for `count` splats
pub fn color_texture_height(count: u32) -> u32 {
    count.div_ceil(COLOR_TEXTURE_WIDTH).max(1)
}

/// Uploaded splat arrays of a collection
#[derive(Debug)]
pub struct SplatDataBuffers {
    pub count: u32,
    pub formats: SplatFormats,
    pub pos: GpuBuffer,
    pub other: GpuBuffer,
    pub sh: GpuBuffer,
    pub color: GpuTexture,
    /// Chunk metadata, or a single zeroed record when `chunks_valid` is false
    pub chunks: GpuBuffer,
    pub chunks_valid: bool,
}

impl SplatDataBuffers {
    pub fn chunk_count(&self) -> u32 {
        if self.chunks_valid {
            (self.chunks.len_words() / CHUNK_WORDS) as u32
        } else {
            0
        }
    }

    pub fn chunks(&self) -> Option<&[ChunkInfo]> {
        if !self.chunks_valid {
            return None;
        }
        bytemuck::try_cast_slice(self.chunks.words()).ok()
    }

    /// Read-only decoding view over host-backed splat arrays. Device-backed
    /// arrays have no host copy and return None.
    pub fn view(&self) -> Option<SplatDataView<'_>> {
        if self.pos.is_device() {
            return None;
        }
        Some(SplatDataView {
            formats: self.formats,
            count: self.count,
            pos: self.pos.words(),
            other: self.other.words(),
            sh: self.sh.words(),
            color: self.color.texels(),
            chunks: self.chunks(),
        })
    }

    /// Writable view over the splat arrays. Chunk-relative formats are written
    /// against the current chunk ranges.
    pub(crate) fn view_mut(&mut self) -> SplatDataMut<'_> {
        let chunks = if self.chunks_valid {
            bytemuck::try_cast_slice::<u32, ChunkInfo>(self.chunks.words()).ok()
        } else {
            None
        };
        SplatDataMut {
            formats: self.formats,
            count: self.count,
            pos: self.pos.words_mut(),
            other: self.other.words_mut(),
            sh: self.sh.words_mut(),
            color: self.color.texels_mut(),
            chunks,
        }
    }
}

/// Per-frame working buffers, all sized to the splat count
#[derive(Debug)]
pub struct SplatWorkBuffers {
    pub view: GpuBuffer,
    pub sort_keys: GpuBuffer,
    pub sort_values: GpuBuffer,
    pub index: GpuBuffer,
    pub sort_resources: SortResources,
}

/// Every GPU resource of a loaded collection
#[derive(Debug)]
pub struct SplatGpuBuffers {
    pub splats: SplatDataBuffers,
    pub work: SplatWorkBuffers,
}

impl SplatGpuBuffers {
    /// Allocate zeroed buffers for `count` splats. `chunk_words` is uploaded as-is.
    fn allocate(
        device: &GpuDevice,
        sorter: &dyn SortEngine,
        count: u32,
        formats: SplatFormats,
        chunk_words: Option<&[u32]>,
    ) -> Self {
        let n = count as u64;
        let storage = |label: &'static str, words: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: words.max(1) * 4,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        let pos = storage("gaussian_splat_pos", n * formats.pos.stride_words() as u64);
        let other = storage("gaussian_splat_other", n * formats.other_stride_words() as u64);
        let sh = storage("gaussian_splat_sh", n * formats.sh.stride_words() as u64);

        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("gaussian_splat_color"),
            size: wgpu::Extent3d {
                width: COLOR_TEXTURE_WIDTH,
                height: color_texture_height(count),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: formats.color.texture_format(),
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST | TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let (chunks, chunks_valid) = match chunk_words {
            Some(words) if !words.is_empty() => (
                device.create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
                    label: Some("gaussian_splat_chunks"),
                    contents: bytemuck::cast_slice(words),
                    usage: BufferUsages::STORAGE,
                }),
                true,
            ),
            _ => (storage("gaussian_splat_chunks_dummy", CHUNK_WORDS as u64), false),
        };

        let work = SplatWorkBuffers {
            view: storage("gaussian_splat_view_data", n * VIEW_DATA_WORDS as u64),
            sort_keys: storage("gaussian_splat_sort_keys", n),
            sort_values: storage("gaussian_splat_sort_values", n),
            index: device.create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
                label: Some("gaussian_splat_cube_indices"),
                contents: bytemuck::cast_slice(&CUBE_INDICES),
                usage: BufferUsages::INDEX,
            }),
            sort_resources: sorter.prepare(device, count),
        };

        Self {
            splats: SplatDataBuffers {
                count,
                formats,
                pos,
                other,
                sh,
                color,
                chunks,
                chunks_valid,
            },
            work,
        }
    }

    pub fn count(&self) -> u32 {
        self.splats.count
    }
}

/// Decoding accessors over the raw splat words
#[derive(Clone, Copy)]
pub struct SplatDataView<'a> {
    pub formats: SplatFormats,
    pub count: u32,
    pub pos: &'a [u32],
    pub other: &'a [u32],
    pub sh: &'a [u32],
    pub color: &'a [u32],
    pub chunks: Option<&'a [ChunkInfo]>,
}

impl<'a> SplatDataView<'a> {
    fn chunk(&self, index: u32) -> Option<&'a ChunkInfo> {
        self.chunks.and_then(|c| c.get((index / CHUNK_SIZE) as usize))
    }

    #[inline]
    pub fn position(&self, index: u32) -> Vec3 {
        let stride = self.formats.pos.stride_words();
        let i = index as usize * stride;
        decode_vector(
            self.formats.pos,
            &self.pos[i..i + stride],
            self.chunk(index).map(ChunkInfo::pos_range),
        )
    }

    #[inline]
    pub fn rotation(&self, index: u32) -> Quat {
        let i = index as usize * self.formats.other_stride_words();
        unpack_rotation(&self.other[i..i + ROTATION_WORDS])
    }

    #[inline]
    pub fn scale(&self, index: u32) -> Vec3 {
        let stride = self.formats.other_stride_words();
        let i = index as usize * stride;
        decode_vector(
            self.formats.scale,
            &self.other[i + ROTATION_WORDS..i + stride],
            self.chunk(index).map(ChunkInfo::scale_range),
        )
    }

    #[inline]
    pub fn color(&self, index: u32) -> Vec4 {
        let stride = self.formats.color.stride_words();
        let i = index as usize * stride;
        decode_color(self.formats.color, &self.color[i..i + stride])
    }

    #[inline]
    pub fn sh(&self, index: u32) -> [Vec3; SH_COEFFS] {
        let stride = self.formats.sh.stride_words();
        let i = index as usize * stride;
        decode_sh(self.formats.sh, &self.sh[i..i + stride])
    }

    pub fn point(&self, index: u32) -> SplatPoint {
        SplatPoint {
            position: self.position(index),
            rotation: self.rotation(index),
            scale: self.scale(index),
            color: self.color(index),
            sh: self.sh(index),
        }
    }
}

/// Mutable splat arrays of a collection
pub struct SplatDataMut<'a> {
    pub formats: SplatFormats,
    pub count: u32,
    pub pos: &'a mut [u32],
    pub other: &'a mut [u32],
    pub sh: &'a mut [u32],
    pub color: &'a mut [u32],
    chunks: Option<&'a [ChunkInfo]>,
}

impl SplatDataMut<'_> {
    /// Encode one splat into slot `index`
    pub fn write_point(&mut self, index: u32, point: &SplatPoint) {
        let chunk = self
            .chunks
            .and_then(|c| c.get((index / CHUNK_SIZE) as usize))
            .copied();
        let i = index as usize;
        let f = self.formats;

        let ps = f.pos.stride_words();
        encode_vector(
            f.pos,
            point.position,
            chunk.as_ref().map(ChunkInfo::pos_range),
            &mut self.pos[i * ps..(i + 1) * ps],
        );
        let os = f.other_stride_words();
        let other = &mut self.other[i * os..(i + 1) * os];
        other[..ROTATION_WORDS].copy_from_slice(&pack_rotation(point.rotation.normalize()));
        encode_vector(
            f.scale,
            point.scale,
            chunk.as_ref().map(ChunkInfo::scale_range),
            &mut other[ROTATION_WORDS..],
        );
        let ss = f.sh.stride_words();
        encode_sh(f.sh, &point.sh, &mut self.sh[i * ss..(i + 1) * ss]);
        let cs = f.color.stride_words();
        encode_color(f.color, point.color, &mut self.color[i * cs..(i + 1) * cs]);
    }
}

/// Per-collection GPU buffer owner
pub struct SplatBufferStore {
    device: GpuDevice,
    sorter: Arc<dyn SortEngine>,
    buffers: Option<SplatGpuBuffers>,
    asset_key: Option<AssetKey>,
    /// Last asset that failed to load; errors are logged once per key
    failed_key: Option<AssetKey>,
}

impl std::fmt::Debug for SplatBufferStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplatBufferStore")
            .field("buffers", &self.buffers)
            .field("asset_key", &self.asset_key)
            .finish()
    }
}

impl SplatBufferStore {
    pub fn new(device: GpuDevice) -> Self {
        Self::with_sort_engine(device, Arc::new(RadixSortEngine))
    }

    pub fn with_sort_engine(device: GpuDevice, sorter: Arc<dyn SortEngine>) -> Self {
        Self {
            device,
            sorter,
            buffers: None,
            asset_key: None,
            failed_key: None,
        }
    }

    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    pub fn sort_engine(&self) -> &Arc<dyn SortEngine> {
        &self.sorter
    }

    pub fn is_loaded(&self) -> bool {
        self.buffers.is_some()
    }

    /// Live splat count (0 when unloaded)
    pub fn splat_count(&self) -> u32 {
        self.buffers.as_ref().map_or(0, SplatGpuBuffers::count)
    }

    pub fn buffers(&self) -> Option<&SplatGpuBuffers> {
        self.buffers.as_ref()
    }

    pub fn buffers_mut(&mut self) -> Option<&mut SplatGpuBuffers> {
        self.buffers.as_mut()
    }

    pub fn asset_key(&self) -> Option<AssetKey> {
        self.asset_key
    }

    /// Upload `asset`, replacing anything currently loaded
    pub fn load(&mut self, asset: &SplatAsset) -> SplatResult<()> {
        self.unload();
        asset.validate()?;

        let mut buffers = SplatGpuBuffers::allocate(
            &self.device,
            self.sorter.as_ref(),
            asset.count,
            asset.formats,
            asset.chunk_data.as_deref(),
        );
        let splats = &mut buffers.splats;
        self.device.write_buffer(&mut splats.pos, 0, &asset.pos_data);
        self.device.write_buffer(&mut splats.other, 0, &asset.other_data);
        self.device.write_buffer(&mut splats.sh, 0, &asset.sh_data);
        self.device.write_texture(&mut splats.color, &asset.color_data);

        // Identity permutation goes through the queue so a load never waits on
        // kernel pipelines
        let identity: Vec<u32> = (0..asset.count).collect();
        self.device.write_buffer(&mut buffers.work.sort_values, 0, &identity);

        info!(
            "Loaded splat asset: {} splats, formats {:?}, chunks: {}",
            asset.count,
            asset.formats,
            buffers.splats.chunk_count()
        );
        self.buffers = Some(buffers);
        Ok(())
    }

    /// Release every buffer. Safe to call repeatedly.
    pub fn unload(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            debug!("Unloading splat buffers ({} splats)", buffers.count());
        }
        self.asset_key = None;
    }

    /// Reallocate for `new_count` splats, keeping the first `min(old, new)` splats
    pub fn resize(&mut self, new_count: u32) -> SplatResult<()> {
        if new_count == 0 || new_count > MAX_SPLAT_COUNT {
            return Err(SplatError::InvalidCount {
                requested: new_count,
                max: MAX_SPLAT_COUNT,
            });
        }
        let old = self.buffers.as_ref().ok_or(SplatError::NotLoaded)?;
        if old.splats.chunks_valid {
            return Err(SplatError::ChunkedResize);
        }
        let old_count = old.count();

        let mut resized = SplatGpuBuffers::allocate(
            &self.device,
            self.sorter.as_ref(),
            new_count,
            old.splats.formats,
            None,
        );
        let mut encoder = self.device.create_command_encoder("gaussian_splat_resize");
        let keep = old_count.min(new_count);
        splat_kernels::copy_splats(
            &self.device,
            &mut encoder,
            &old.splats,
            &mut resized.splats,
            0,
            0,
            keep,
            Mat4::IDENTITY,
        )?;
        splat_kernels::init_sort_values(&mut encoder, &mut resized.work.sort_values, new_count)?;
        self.device.submit(&mut encoder)?;

        info!("Resized splat buffers {} -> {}", old_count, new_count);
        self.buffers = Some(resized);
        Ok(())
    }

    /// Reconcile with the collection's current asset. Reloads only when the asset
    /// identity or content hash changed. Returns whether data is loaded afterwards.
    pub fn sync_asset(&mut self, asset: Option<&Arc<SplatAsset>>) -> bool {
        let Some(asset) = asset else {
            if self.is_loaded() {
                self.unload();
            }
            self.failed_key = None;
            return false;
        };

        let key = AssetKey::of(asset);
        if self.asset_key == Some(key) && self.is_loaded() {
            return true;
        }
        if self.failed_key == Some(key) {
            return false;
        }

        debug!("Splat asset changed, rebuilding buffers");
        match self.load(asset) {
            Ok(()) => {
                self.asset_key = Some(key);
                self.failed_key = None;
                true
            }
            Err(e) => {
                error!("Failed to load splat asset: {}", e);
                self.failed_key = Some(key);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat_asset::create_test_asset;

    #[test]
    fn load_sizes_buffers_to_count() {
        let device = GpuDevice::new();
        let mut store = SplatBufferStore::new(device.clone());
        let asset = create_test_asset(100);
        store.load(&asset).unwrap();

        let b = store.buffers().unwrap();
        assert_eq!(b.count(), 100);
        assert_eq!(b.work.sort_keys.len_words(), 100);
        assert_eq!(b.work.view.len_words(), 100 * VIEW_DATA_WORDS);
        assert_eq!(b.splats.color.width(), COLOR_TEXTURE_WIDTH);
        assert!(!b.splats.chunks_valid);
        assert_eq!(b.splats.chunks.len_words(), CHUNK_WORDS);
        assert_eq!(b.work.sort_values.words()[..5], [0, 1, 2, 3, 4]);
        assert_eq!(b.splats.view().unwrap().position(7), asset_position(&asset, 7));
    }

    fn asset_position(asset: &SplatAsset, i: usize) -> Vec3 {
        Vec3::new(
            f32::from_bits(asset.pos_data[i * 3]),
            f32::from_bits(asset.pos_data[i * 3 + 1]),
            f32::from_bits(asset.pos_data[i * 3 + 2]),
        )
    }

    #[test]
    fn failed_load_leaves_nothing_live() {
        let device = GpuDevice::new();
        let mut store = SplatBufferStore::new(device.clone());
        let mut asset = create_test_asset(10);
        asset.other_data.pop();
        assert!(store.load(&asset).is_err());
        assert!(!store.is_loaded());
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn sync_reloads_only_on_identity_change() {
        let device = GpuDevice::new();
        let mut store = SplatBufferStore::new(device.clone());
        let asset = Arc::new(create_test_asset(16));
        assert!(store.sync_asset(Some(&asset)));
        let allocations = device.total_allocations();
        assert!(store.sync_asset(Some(&asset)));
        assert_eq!(device.total_allocations(), allocations);

        let other = Arc::new(create_test_asset(32));
        assert!(store.sync_asset(Some(&other)));
        assert_eq!(store.splat_count(), 32);

        assert!(!store.sync_asset(None));
        assert_eq!(device.live_buffer_count(), 0);
    }
}
