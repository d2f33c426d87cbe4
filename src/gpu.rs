// GPU resource allocation and command recording for splat passes
//
// GpuDevice allocates buffers and textures either on the app's RenderDevice or,
// without one, as host memory for the rayon reference kernels. Every allocation
// is tracked so tests and diagnostics can verify that unload/resize/frame-scoped
// targets release exactly what they acquired.
//
// Passes are recorded into a CommandEncoder. On a device-backed encoder each
// pass becomes a DeviceCommand holding its bind group; the command list is later
// replayed onto a wgpu::CommandEncoder, either by GpuDevice::submit (edit
// actions, with synchronous readback) or by the composite render node (frames).
// The GpuCommand log is kept for both backends so the per-frame sequence stays
// observable.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bevy::render::render_resource::{
    BindGroup, BindGroupEntry, BindingResource, Buffer, RenderPipeline, Texture, TextureView,
};
use bevy::render::renderer::{RenderDevice, RenderQueue};
use tracing::{debug, trace, warn};
use wgpu::{BufferUsages, TextureFormat, TextureUsages};

use crate::error::{SplatError, SplatResult};
use crate::gpu_pipelines::{
    KernelParams, KernelPipelineSource, PublishedKernelPipelines, SplatGpuLayouts, SplatKernel,
};
use crate::render_pipeline::SplatMaterialKind;

/// Threads per workgroup used by all splat compute kernels
pub const WORKGROUP_SIZE: u32 = 256;

/// Largest workgroup count of one dispatch dimension
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65535;

/// Split a workgroup count into a 2D grid within the per-dimension limit.
/// Kernels recover the linear id as `wid.y * num_workgroups.x + wid.x`.
pub fn dispatch_size(workgroups: u32) -> (u32, u32) {
    if workgroups <= MAX_WORKGROUPS_PER_DIMENSION {
        (workgroups, 1)
    } else {
        (
            MAX_WORKGROUPS_PER_DIMENSION,
            workgroups.div_ceil(MAX_WORKGROUPS_PER_DIMENSION),
        )
    }
}

#[derive(Default, Debug)]
struct AllocationStats {
    live_buffers: AtomicUsize,
    live_textures: AtomicUsize,
    live_bytes: AtomicU64,
    total_allocations: AtomicU64,
}

impl AllocationStats {
    fn acquire(&self, bytes: u64, texture: bool) {
        if texture {
            self.live_textures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.live_buffers.fetch_add(1, Ordering::Relaxed);
        }
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, bytes: u64, texture: bool) {
        if texture {
            self.live_textures.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.live_buffers.fetch_sub(1, Ordering::Relaxed);
        }
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Render device, queue and the shared pipeline state of a device backend
struct DeviceBackend {
    render_device: RenderDevice,
    render_queue: RenderQueue,
    layouts: Arc<SplatGpuLayouts>,
    pipelines: PublishedKernelPipelines,
}

/// Device handle used to allocate splat buffers and textures
///
/// Cloning is cheap; clones share allocation accounting.
#[derive(Clone)]
pub struct GpuDevice {
    stats: Arc<AllocationStats>,
    compute_supported: bool,
    backend: Option<Arc<DeviceBackend>>,
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("device_backed", &self.backend.is_some())
            .field("compute_supported", &self.compute_supported)
            .field("live_buffers", &self.live_buffer_count())
            .field("live_textures", &self.live_texture_count())
            .finish()
    }
}

impl Default for GpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice {
    /// Host-memory device running the reference kernels
    pub fn new() -> Self {
        Self {
            stats: Arc::new(AllocationStats::default()),
            compute_supported: true,
            backend: None,
        }
    }

    /// Host device reporting no compute support (e.g. WebGL2 class adapters)
    pub fn without_compute() -> Self {
        Self {
            compute_supported: false,
            ..Self::new()
        }
    }

    /// Device allocating on `render_device`. Compute passes use the kernel
    /// pipelines published by the render world.
    pub fn with_render_device(
        render_device: RenderDevice,
        render_queue: RenderQueue,
        layouts: Arc<SplatGpuLayouts>,
        pipelines: PublishedKernelPipelines,
    ) -> Self {
        let compute_supported =
            render_device.limits().max_compute_invocations_per_workgroup >= WORKGROUP_SIZE;
        Self {
            stats: Arc::new(AllocationStats::default()),
            compute_supported,
            backend: Some(Arc::new(DeviceBackend {
                render_device,
                render_queue,
                layouts,
                pipelines,
            })),
        }
    }

    pub fn supports_compute(&self) -> bool {
        self.compute_supported
    }

    pub fn is_device_backed(&self) -> bool {
        self.backend.is_some()
    }

    pub fn render_device(&self) -> Option<&RenderDevice> {
        self.backend.as_ref().map(|b| &b.render_device)
    }

    /// Create a zero-initialized buffer. Size is rounded up to whole 32-bit words.
    pub fn create_buffer(&self, desc: &wgpu::BufferDescriptor) -> GpuBuffer {
        let len_words = desc.size.div_ceil(4).max(1) as usize;
        let storage = match &self.backend {
            Some(backend) => BufferStorage::Device(backend.render_device.create_buffer(
                &wgpu::BufferDescriptor {
                    label: desc.label,
                    size: len_words as u64 * 4,
                    usage: desc.usage,
                    mapped_at_creation: false,
                },
            )),
            None => BufferStorage::Host(vec![0u32; len_words]),
        };
        self.track_buffer(desc.label, desc.usage, len_words, storage)
    }

    /// Create a buffer with initial contents (little-endian words)
    pub fn create_buffer_with_data(&self, desc: &wgpu::util::BufferInitDescriptor) -> GpuBuffer {
        let mut words: Vec<u32> = desc
            .contents
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let tail = desc.contents.chunks_exact(4).remainder();
        if !tail.is_empty() {
            let mut last = [0u8; 4];
            last[..tail.len()].copy_from_slice(tail);
            words.push(u32::from_le_bytes(last));
        }
        if words.is_empty() {
            words.push(0);
        }
        let len_words = words.len();
        let storage = match &self.backend {
            Some(backend) => BufferStorage::Device(backend.render_device.create_buffer_with_data(
                &wgpu::util::BufferInitDescriptor {
                    label: desc.label,
                    contents: bytemuck::cast_slice(&words),
                    usage: desc.usage,
                },
            )),
            None => BufferStorage::Host(words),
        };
        self.track_buffer(desc.label, desc.usage, len_words, storage)
    }

    fn track_buffer(
        &self,
        label: Option<&str>,
        usage: BufferUsages,
        len_words: usize,
        storage: BufferStorage,
    ) -> GpuBuffer {
        self.stats.acquire(len_words as u64 * 4, false);
        GpuBuffer {
            label: label.unwrap_or("unlabeled_buffer").to_string(),
            usage,
            len_words,
            storage,
            stats: self.stats.clone(),
        }
    }

    /// Create a 2D texture with zeroed texels
    pub fn create_texture(&self, desc: &wgpu::TextureDescriptor) -> GpuTexture {
        let width = desc.size.width.max(1);
        let height = desc.size.height.max(1);
        let words = width as usize * height as usize * texel_words(desc.format);
        let storage = match &self.backend {
            Some(backend) => {
                let texture = backend.render_device.create_texture(&wgpu::TextureDescriptor {
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    ..desc.clone()
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                TextureStorage::Device { texture, view }
            }
            None => TextureStorage::Host(vec![0u32; words]),
        };
        let bytes = words as u64 * 4;
        self.stats.acquire(bytes, true);
        GpuTexture {
            label: desc.label.unwrap_or("unlabeled_texture").to_string(),
            format: desc.format,
            usage: desc.usage,
            width,
            height,
            bytes,
            storage,
            stats: self.stats.clone(),
        }
    }

    /// Queue write of `data` into `buffer` at `offset_words`, clipped to the buffer
    pub fn write_buffer(&self, buffer: &mut GpuBuffer, offset_words: usize, data: &[u32]) {
        let end = (offset_words + data.len()).min(buffer.len_words);
        if offset_words >= end {
            return;
        }
        let data = &data[..end - offset_words];
        match (&mut buffer.storage, &self.backend) {
            (BufferStorage::Host(words), _) => words[offset_words..end].copy_from_slice(data),
            (BufferStorage::Device(device_buffer), Some(backend)) => backend.render_queue.write_buffer(
                device_buffer,
                offset_words as u64 * 4,
                bytemuck::cast_slice(data),
            ),
            (BufferStorage::Device(_), None) => {
                warn!("Buffer '{}' written through a host device, ignoring", buffer.label)
            }
        }
    }

    /// Queue write of row-major texels starting at texel 0. Missing texels are zero.
    pub fn write_texture(&self, texture: &mut GpuTexture, texels: &[u32]) {
        let (width, height) = (texture.width, texture.height);
        let row_bytes = texture.row_bytes();
        let total = width as usize * height as usize * texture.texel_words();
        let n = texels.len().min(total);
        match (&mut texture.storage, &self.backend) {
            (TextureStorage::Host(words), _) => words[..n].copy_from_slice(&texels[..n]),
            (TextureStorage::Device { texture: device_texture, .. }, Some(backend)) => {
                let mut padded = texels[..n].to_vec();
                padded.resize(total, 0);
                backend.render_queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: device_texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    bytemuck::cast_slice(&padded),
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(row_bytes),
                        rows_per_image: Some(height),
                    },
                    wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            (TextureStorage::Device { .. }, None) => {
                warn!("Texture '{}' written through a host device, ignoring", texture.label)
            }
        }
    }

    /// Encoder recording for this device's backend
    pub fn create_command_encoder(&self, label: impl Into<String>) -> CommandEncoder {
        let mut encoder = CommandEncoder::new(label);
        if let Some(backend) = &self.backend {
            encoder.recorder = Some(DeviceRecorder {
                render_device: backend.render_device.clone(),
                layouts: backend.layouts.clone(),
                commands: Vec::new(),
                target: None,
            });
        }
        encoder
    }

    /// Submit everything recorded on a device-backed encoder to the queue.
    ///
    /// Host encoders have already executed their passes; this is a no-op for them.
    pub fn submit(&self, encoder: &mut CommandEncoder) -> SplatResult<()> {
        let commands = encoder.take_device_commands();
        let Some(backend) = &self.backend else {
            if commands.is_empty() {
                return Ok(());
            }
            return Err(SplatError::BackendMismatch(encoder.label().to_string()));
        };
        if commands.is_empty() {
            return Ok(());
        }
        let pipelines = backend.pipelines.snapshot();
        check_pipelines_ready(&commands, &pipelines, None)?;

        let mut wgpu_encoder =
            backend
                .render_device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(encoder.label()),
                });
        record_device_commands(&mut wgpu_encoder, &commands, &pipelines, None, None)?;
        backend.render_queue.submit([wgpu_encoder.finish()]);
        trace!("Submitted '{}' ({} commands)", encoder.label(), commands.len());
        Ok(())
    }

    /// Map a MAP_READ buffer and copy its words out. Blocking here is the only
    /// point where the control thread waits on device work.
    pub fn map_read(&self, buffer: &GpuBuffer) -> SplatResult<Vec<u32>> {
        if !buffer.usage.contains(BufferUsages::MAP_READ) {
            return Err(SplatError::NotMappable(buffer.label.clone()));
        }
        let device_buffer = match &buffer.storage {
            BufferStorage::Host(words) => return Ok(words.clone()),
            BufferStorage::Device(device_buffer) => device_buffer,
        };
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| SplatError::BackendMismatch(buffer.label.clone()))?;

        let slice = device_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        backend
            .render_device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| {
                warn!("Device poll failed while reading '{}': {}", buffer.label, e);
                SplatError::ReadbackFailed(buffer.label.clone())
            })?;
        match pollster::block_on(receiver) {
            Ok(Ok(())) => {}
            _ => return Err(SplatError::ReadbackFailed(buffer.label.clone())),
        }

        let data = slice.get_mapped_range();
        let words: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        device_buffer.unmap();
        Ok(words)
    }

    /// Read any COPY_SRC buffer back through a MAP_READ staging buffer
    pub fn read_buffer(&self, buffer: &GpuBuffer) -> SplatResult<Vec<u32>> {
        if let BufferStorage::Host(words) = &buffer.storage {
            return Ok(words.clone());
        }
        let mut staging = self.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gaussian_splat_readback_staging"),
            size: buffer.size(),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.create_command_encoder("gaussian_splat_readback");
        encoder.copy_buffer_to_buffer(buffer, &mut staging)?;
        self.submit(&mut encoder)?;
        self.map_read(&staging)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.stats.live_buffers.load(Ordering::Relaxed)
    }

    pub fn live_texture_count(&self) -> usize {
        self.stats.live_textures.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> u64 {
        self.stats.live_bytes.load(Ordering::Relaxed)
    }

    pub fn total_allocations(&self) -> u64 {
        self.stats.total_allocations.load(Ordering::Relaxed)
    }
}

/// Words per texel for the texture formats used by splat rendering
pub fn texel_words(format: TextureFormat) -> usize {
    match format {
        TextureFormat::Rgba32Float | TextureFormat::Rgba32Uint => 4,
        TextureFormat::Rgba16Float | TextureFormat::Rgba16Uint => 2,
        _ => 1,
    }
}

enum BufferStorage {
    Host(Vec<u32>),
    Device(Buffer),
}

/// Buffer of 32-bit words
pub struct GpuBuffer {
    label: String,
    usage: BufferUsages,
    len_words: usize,
    storage: BufferStorage,
    stats: Arc<AllocationStats>,
}

impl GpuBuffer {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn usage(&self) -> BufferUsages {
        self.usage
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.len_words as u64 * 4
    }

    pub fn len_words(&self) -> usize {
        self.len_words
    }

    pub fn is_device(&self) -> bool {
        matches!(self.storage, BufferStorage::Device(_))
    }

    /// Host contents. Device buffers have none; read them with [`GpuDevice::read_buffer`].
    pub fn words(&self) -> &[u32] {
        match &self.storage {
            BufferStorage::Host(words) => words,
            BufferStorage::Device(_) => &[],
        }
    }

    pub(crate) fn words_mut(&mut self) -> &mut [u32] {
        match &mut self.storage {
            BufferStorage::Host(words) => words,
            BufferStorage::Device(_) => &mut [],
        }
    }

    pub fn device_buffer(&self) -> Option<&Buffer> {
        match &self.storage {
            BufferStorage::Device(buffer) => Some(buffer),
            BufferStorage::Host(_) => None,
        }
    }

    /// Number of whole records of `stride_words` held by the buffer
    pub fn element_count(&self, stride_words: usize) -> usize {
        if stride_words == 0 {
            0
        } else {
            self.len_words / stride_words
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.stats.release(self.size(), false);
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.label)
            .field("usage", &self.usage)
            .field("size", &self.size())
            .field("device", &self.is_device())
            .finish()
    }
}

enum TextureStorage {
    Host(Vec<u32>),
    Device { texture: Texture, view: TextureView },
}

/// 2D texture, texels stored row-major
pub struct GpuTexture {
    label: String,
    format: TextureFormat,
    usage: TextureUsages,
    width: u32,
    height: u32,
    bytes: u64,
    storage: TextureStorage,
    stats: Arc<AllocationStats>,
}

impl GpuTexture {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn usage(&self) -> TextureUsages {
        self.usage
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texel_words(&self) -> usize {
        texel_words(self.format)
    }

    fn row_bytes(&self) -> u32 {
        self.width * self.texel_words() as u32 * 4
    }

    /// Words of texel `index` in row-major order (host textures only)
    pub fn texel(&self, index: usize) -> &[u32] {
        let w = self.texel_words();
        self.texels().get(index * w..(index + 1) * w).unwrap_or(&[])
    }

    pub fn texels(&self) -> &[u32] {
        match &self.storage {
            TextureStorage::Host(texels) => texels,
            TextureStorage::Device { .. } => &[],
        }
    }

    pub(crate) fn texels_mut(&mut self) -> &mut [u32] {
        match &mut self.storage {
            TextureStorage::Host(texels) => texels,
            TextureStorage::Device { .. } => &mut [],
        }
    }

    pub fn device_view(&self) -> Option<&TextureView> {
        match &self.storage {
            TextureStorage::Device { view, .. } => Some(view),
            TextureStorage::Host(_) => None,
        }
    }

    fn device_texture(&self) -> Option<&Texture> {
        match &self.storage {
            TextureStorage::Device { texture, .. } => Some(texture),
            TextureStorage::Host(_) => None,
        }
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        self.stats.release(self.bytes, true);
    }
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTexture")
            .field("label", &self.label)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// One recorded command of a frame's command sequence
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    Compute { label: String, workgroups: u32 },
    CopyBuffer { label: String, words: u64 },
    CopyTexture { label: String, texels: u64 },
    ClearBuffer { label: String },
    AcquireTarget { label: String, width: u32, height: u32, format: TextureFormat },
    ClearTarget { label: String },
    Draw { label: String, material: String, index_count: u32, instance_count: u32 },
    Composite { label: String, material: String },
    ReleaseTarget { label: String },
}

impl GpuCommand {
    pub fn label(&self) -> &str {
        match self {
            GpuCommand::Compute { label, .. }
            | GpuCommand::CopyBuffer { label, .. }
            | GpuCommand::CopyTexture { label, .. }
            | GpuCommand::ClearBuffer { label }
            | GpuCommand::AcquireTarget { label, .. }
            | GpuCommand::ClearTarget { label }
            | GpuCommand::Draw { label, .. }
            | GpuCommand::Composite { label, .. }
            | GpuCommand::ReleaseTarget { label } => label,
        }
    }
}

/// A recorded device command, replayed onto a wgpu::CommandEncoder
#[derive(Clone)]
pub enum DeviceCommand {
    Dispatch {
        kernel: SplatKernel,
        label: String,
        bind_group: BindGroup,
        workgroups: (u32, u32),
    },
    CopyBuffer {
        src: Buffer,
        dst: Buffer,
        size: u64,
    },
    ClearBuffer {
        buffer: Buffer,
    },
    CopyTextureToBuffer {
        texture: Texture,
        first_row: u32,
        rows: u32,
        buffer: Buffer,
    },
    CopyBufferToTexture {
        buffer: Buffer,
        texture: Texture,
        first_row: u32,
        rows: u32,
    },
    ClearTarget {
        view: TextureView,
    },
    Draw {
        kind: SplatMaterialKind,
        label: String,
        bind_group: BindGroup,
        index: Buffer,
        index_count: u32,
        instance_count: u32,
        target: TextureView,
    },
    Composite {
        source: TextureView,
    },
}

impl std::fmt::Debug for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceCommand::Dispatch { label, workgroups, .. } => f
                .debug_struct("Dispatch")
                .field("label", label)
                .field("workgroups", workgroups)
                .finish(),
            DeviceCommand::CopyBuffer { size, .. } => {
                f.debug_struct("CopyBuffer").field("size", size).finish()
            }
            DeviceCommand::ClearBuffer { .. } => f.write_str("ClearBuffer"),
            DeviceCommand::CopyTextureToBuffer { first_row, rows, .. }
            | DeviceCommand::CopyBufferToTexture { first_row, rows, .. } => f
                .debug_struct("CopyTextureRows")
                .field("first_row", first_row)
                .field("rows", rows)
                .finish(),
            DeviceCommand::ClearTarget { .. } => f.write_str("ClearTarget"),
            DeviceCommand::Draw { label, instance_count, .. } => f
                .debug_struct("Draw")
                .field("label", label)
                .field("instance_count", instance_count)
                .finish(),
            DeviceCommand::Composite { .. } => f.write_str("Composite"),
        }
    }
}

/// Lookup of compiled draw pipelines by material
pub trait DrawPipelineSource {
    fn draw_pipeline(&self, kind: SplatMaterialKind) -> Option<&RenderPipeline>;
}

/// Blends the offscreen target onto a camera's output
pub trait FrameCompositor {
    fn composite(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        source: &TextureView,
    ) -> SplatResult<()>;
}

/// Fail with [`SplatError::PipelinesNotReady`] unless every pipeline `commands` use is compiled
pub fn check_pipelines_ready(
    commands: &[DeviceCommand],
    kernels: &dyn KernelPipelineSource,
    draws: Option<&dyn DrawPipelineSource>,
) -> SplatResult<()> {
    for command in commands {
        let ready = match command {
            DeviceCommand::Dispatch { kernel, .. } => kernels.compute_pipeline(*kernel).is_some(),
            DeviceCommand::Draw { kind, .. } => {
                draws.is_some_and(|d| d.draw_pipeline(*kind).is_some())
            }
            _ => true,
        };
        if !ready {
            return Err(SplatError::PipelinesNotReady);
        }
    }
    Ok(())
}

/// Replay device commands in order onto `encoder`
pub fn record_device_commands(
    encoder: &mut wgpu::CommandEncoder,
    commands: &[DeviceCommand],
    kernels: &dyn KernelPipelineSource,
    draws: Option<&dyn DrawPipelineSource>,
    mut compositor: Option<&mut dyn FrameCompositor>,
) -> SplatResult<()> {
    for command in commands {
        match command {
            DeviceCommand::Dispatch {
                kernel,
                label,
                bind_group,
                workgroups,
            } => {
                let pipeline = kernels
                    .compute_pipeline(*kernel)
                    .ok_or(SplatError::PipelinesNotReady)?;
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(label),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(workgroups.0, workgroups.1, 1);
            }
            DeviceCommand::CopyBuffer { src, dst, size } => {
                encoder.copy_buffer_to_buffer(src, 0, dst, 0, *size);
            }
            DeviceCommand::ClearBuffer { buffer } => {
                encoder.clear_buffer(buffer, 0, None);
            }
            DeviceCommand::CopyTextureToBuffer {
                texture,
                first_row,
                rows,
                buffer,
            } => {
                let (texture_info, buffer_info, extent) =
                    texture_row_copy(texture, *first_row, *rows, buffer);
                encoder.copy_texture_to_buffer(texture_info, buffer_info, extent);
            }
            DeviceCommand::CopyBufferToTexture {
                buffer,
                texture,
                first_row,
                rows,
            } => {
                let (texture_info, buffer_info, extent) =
                    texture_row_copy(texture, *first_row, *rows, buffer);
                encoder.copy_buffer_to_texture(buffer_info, texture_info, extent);
            }
            DeviceCommand::ClearTarget { view } => {
                encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("gaussian_splat_clear_target"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
            DeviceCommand::Draw {
                kind,
                label,
                bind_group,
                index,
                index_count,
                instance_count,
                target,
            } => {
                let pipeline = draws
                    .and_then(|d| d.draw_pipeline(*kind))
                    .ok_or(SplatError::PipelinesNotReady)?;
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(label),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: target,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.set_index_buffer(*index.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..*index_count, 0, 0..*instance_count);
            }
            DeviceCommand::Composite { source } => match compositor.as_deref_mut() {
                Some(compositor) => compositor.composite(encoder, source)?,
                None => return Err(SplatError::NoRenderTarget),
            },
        }
    }
    Ok(())
}

fn texture_row_copy<'a>(
    texture: &'a Texture,
    first_row: u32,
    rows: u32,
    buffer: &'a Buffer,
) -> (
    wgpu::TexelCopyTextureInfo<'a>,
    wgpu::TexelCopyBufferInfo<'a>,
    wgpu::Extent3d,
) {
    let width = texture.width();
    let bytes_per_row = width * texel_words(texture.format()) as u32 * 4;
    (
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d {
                x: 0,
                y: first_row,
                z: 0,
            },
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(rows),
            },
        },
        wgpu::Extent3d {
            width,
            height: rows,
            depth_or_array_layers: 1,
        },
    )
}

/// Where a recorded pass executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelTarget {
    /// Recorded for the device; the caller must not run the host body
    Device,
    /// Host encoder; the caller runs the reference body now
    Host,
}

enum PassResource {
    Buffer(Buffer),
    Texture(TextureView),
}

/// One compute dispatch: kernel, uniform block and bindings in binding order
pub struct KernelPass {
    kernel: SplatKernel,
    label: String,
    workgroups: u32,
    params: KernelParams,
    resources: Vec<PassResource>,
    host_bound: bool,
}

impl KernelPass {
    /// Pass covering `invocations` threads
    pub fn new(kernel: SplatKernel, invocations: u32) -> Self {
        Self {
            kernel,
            label: kernel.label(),
            workgroups: invocations.div_ceil(WORKGROUP_SIZE),
            params: KernelParams::default(),
            resources: Vec::with_capacity(kernel.bindings().len()),
            host_bound: false,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Override the workgroup count (e.g. one group per sort partition)
    pub fn workgroups(mut self, workgroups: u32) -> Self {
        self.workgroups = workgroups;
        self
    }

    pub fn uniform(mut self, params: KernelParams) -> Self {
        self.params = params;
        self
    }

    pub fn buffer(mut self, buffer: &GpuBuffer) -> Self {
        match buffer.device_buffer() {
            Some(device_buffer) => self.resources.push(PassResource::Buffer(device_buffer.clone())),
            None => self.host_bound = true,
        }
        self
    }

    pub fn texture(mut self, texture: &GpuTexture) -> Self {
        match texture.device_view() {
            Some(view) => self.resources.push(PassResource::Texture(view.clone())),
            None => self.host_bound = true,
        }
        self
    }
}

/// Parameters of one indexed draw into the composite target
pub struct DrawPass<'a> {
    pub label: &'a str,
    pub material: &'a str,
    pub kind: SplatMaterialKind,
    pub index_count: u32,
    pub instance_count: u32,
    /// Draw uniform block bytes
    pub uniform: &'a [u8],
    /// View data, sort values, chunks, positions, other data
    pub storage: [&'a GpuBuffer; 5],
    pub index: &'a GpuBuffer,
}

struct DeviceRecorder {
    render_device: RenderDevice,
    layouts: Arc<SplatGpuLayouts>,
    commands: Vec<DeviceCommand>,
    target: Option<TextureView>,
}

fn device_pair<'a>(
    label: &str,
    src: &'a GpuBuffer,
    dst: &'a GpuBuffer,
) -> SplatResult<Option<(&'a Buffer, &'a Buffer)>> {
    match (src.device_buffer(), dst.device_buffer()) {
        (Some(s), Some(d)) => Ok(Some((s, d))),
        (None, None) => Ok(None),
        _ => Err(SplatError::BackendMismatch(label.to_string())),
    }
}

/// Ordered command sequence for one frame or one edit action
#[derive(Default)]
pub struct CommandEncoder {
    label: String,
    commands: Vec<GpuCommand>,
    recorder: Option<DeviceRecorder>,
}

impl std::fmt::Debug for CommandEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEncoder")
            .field("label", &self.label)
            .field("commands", &self.commands.len())
            .field("device", &self.recorder.is_some())
            .finish()
    }
}

impl CommandEncoder {
    /// Host encoder; use [`GpuDevice::create_command_encoder`] for a device's backend
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
            recorder: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_device(&self) -> bool {
        self.recorder.is_some()
    }

    /// Record a compute pass. On a host encoder the caller runs the kernel body
    /// after this returns [`KernelTarget::Host`].
    pub fn dispatch(&mut self, pass: KernelPass) -> SplatResult<KernelTarget> {
        let target = match self.recorder.as_mut() {
            None => {
                if !pass.resources.is_empty() {
                    return Err(SplatError::BackendMismatch(pass.label));
                }
                KernelTarget::Host
            }
            Some(recorder) => {
                if pass.host_bound || pass.resources.len() != pass.kernel.bindings().len() {
                    return Err(SplatError::BackendMismatch(pass.label));
                }
                if pass.workgroups > 0 {
                    let layout = recorder
                        .layouts
                        .kernel(pass.kernel)
                        .ok_or(SplatError::PipelinesNotReady)?;
                    let uniform =
                        recorder
                            .render_device
                            .create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
                                label: Some("gaussian_splat_kernel_params"),
                                contents: bytemuck::bytes_of(&pass.params),
                                usage: BufferUsages::UNIFORM,
                            });
                    let mut entries = vec![BindGroupEntry {
                        binding: 0,
                        resource: uniform.as_entire_binding(),
                    }];
                    for (i, resource) in pass.resources.iter().enumerate() {
                        let resource = match resource {
                            PassResource::Buffer(buffer) => buffer.as_entire_binding(),
                            PassResource::Texture(view) => BindingResource::TextureView(view),
                        };
                        entries.push(BindGroupEntry {
                            binding: i as u32 + 1,
                            resource,
                        });
                    }
                    let bind_group =
                        recorder
                            .render_device
                            .create_bind_group(pass.label.as_str(), layout, &entries);
                    recorder.commands.push(DeviceCommand::Dispatch {
                        kernel: pass.kernel,
                        label: pass.label.clone(),
                        bind_group,
                        workgroups: dispatch_size(pass.workgroups),
                    });
                }
                KernelTarget::Device
            }
        };
        self.commands.push(GpuCommand::Compute {
            label: pass.label,
            workgroups: pass.workgroups,
        });
        Ok(target)
    }

    /// Copy `src` into the front of `dst` (truncated to the shorter buffer)
    pub fn copy_buffer_to_buffer(&mut self, src: &GpuBuffer, dst: &mut GpuBuffer) -> SplatResult<()> {
        let label = format!("{}->{}", src.label, dst.label);
        let n = src.len_words.min(dst.len_words);
        match device_pair(&label, src, dst)? {
            Some((s, d)) => {
                let recorder = self
                    .recorder
                    .as_mut()
                    .ok_or_else(|| SplatError::BackendMismatch(label.clone()))?;
                recorder.commands.push(DeviceCommand::CopyBuffer {
                    src: s.clone(),
                    dst: d.clone(),
                    size: n as u64 * 4,
                });
            }
            None => dst.words_mut()[..n].copy_from_slice(&src.words()[..n]),
        }
        self.commands.push(GpuCommand::CopyBuffer {
            label,
            words: n as u64,
        });
        Ok(())
    }

    /// Zero-fill a buffer
    pub fn clear_buffer(&mut self, buffer: &mut GpuBuffer) -> SplatResult<()> {
        match (buffer.device_buffer(), self.recorder.as_mut()) {
            (Some(device_buffer), Some(recorder)) => {
                recorder.commands.push(DeviceCommand::ClearBuffer {
                    buffer: device_buffer.clone(),
                });
            }
            (None, None) => buffer.words_mut().fill(0),
            _ => return Err(SplatError::BackendMismatch(buffer.label.clone())),
        }
        self.commands.push(GpuCommand::ClearBuffer {
            label: buffer.label.clone(),
        });
        Ok(())
    }

    /// Write `data` at the front of `buffer`, ordered with the surrounding passes
    pub fn upload(&mut self, buffer: &mut GpuBuffer, data: &[u32]) -> SplatResult<()> {
        let n = data.len().min(buffer.len_words);
        match (buffer.device_buffer(), self.recorder.as_mut()) {
            (Some(device_buffer), Some(recorder)) => {
                let staging =
                    recorder
                        .render_device
                        .create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
                            label: Some("gaussian_splat_upload"),
                            contents: bytemuck::cast_slice(&data[..n]),
                            usage: BufferUsages::COPY_SRC,
                        });
                recorder.commands.push(DeviceCommand::CopyBuffer {
                    src: staging,
                    dst: device_buffer.clone(),
                    size: n as u64 * 4,
                });
            }
            (None, None) => buffer.words_mut()[..n].copy_from_slice(&data[..n]),
            _ => return Err(SplatError::BackendMismatch(buffer.label.clone())),
        }
        self.commands.push(GpuCommand::CopyBuffer {
            label: format!("upload->{}", buffer.label),
            words: n as u64,
        });
        Ok(())
    }

    /// Copy whole texture rows `first_row..first_row + rows` into the front of `dst`
    pub fn copy_texture_rows_to_buffer(
        &mut self,
        src: &GpuTexture,
        first_row: u32,
        rows: u32,
        dst: &mut GpuBuffer,
    ) -> SplatResult<()> {
        let label = format!("{}->{}", src.label, dst.label);
        let row_words = src.width as usize * src.texel_words();
        let start = first_row as usize * row_words;
        let n = (rows as usize * row_words).min(dst.len_words);
        match (src.device_texture(), dst.device_buffer(), self.recorder.as_mut()) {
            (Some(texture), Some(buffer), Some(recorder)) => {
                recorder.commands.push(DeviceCommand::CopyTextureToBuffer {
                    texture: texture.clone(),
                    first_row,
                    rows,
                    buffer: buffer.clone(),
                });
            }
            (None, None, None) => {
                let n = n.min(src.texels().len().saturating_sub(start));
                dst.words_mut()[..n].copy_from_slice(&src.texels()[start..start + n]);
            }
            _ => return Err(SplatError::BackendMismatch(label)),
        }
        self.commands.push(GpuCommand::CopyTexture {
            label,
            texels: (n / src.texel_words().max(1)) as u64,
        });
        Ok(())
    }

    /// Copy the front of `src` into whole texture rows starting at `first_row`
    pub fn copy_buffer_to_texture_rows(
        &mut self,
        src: &GpuBuffer,
        dst: &mut GpuTexture,
        first_row: u32,
        rows: u32,
    ) -> SplatResult<()> {
        let label = format!("{}->{}", src.label, dst.label);
        let row_words = dst.width as usize * dst.texel_words();
        let start = first_row as usize * row_words;
        let n = (rows as usize * row_words).min(src.len_words);
        match (src.device_buffer(), dst.device_texture(), self.recorder.as_mut()) {
            (Some(buffer), Some(texture), Some(recorder)) => {
                recorder.commands.push(DeviceCommand::CopyBufferToTexture {
                    buffer: buffer.clone(),
                    texture: texture.clone(),
                    first_row,
                    rows,
                });
            }
            (None, None, None) => {
                let texels = dst.texels_mut();
                let n = n.min(texels.len().saturating_sub(start));
                texels[start..start + n].copy_from_slice(&src.words()[..n]);
            }
            _ => return Err(SplatError::BackendMismatch(label)),
        }
        self.commands.push(GpuCommand::CopyTexture {
            label,
            texels: (n / dst.texel_words().max(1)) as u64,
        });
        Ok(())
    }

    /// Make `target` the draw target and clear it to transparent black
    pub fn begin_target(&mut self, target: &GpuTexture) -> SplatResult<()> {
        if let Some(recorder) = self.recorder.as_mut() {
            let view = target
                .device_view()
                .ok_or_else(|| SplatError::BackendMismatch(target.label.clone()))?;
            recorder.commands.push(DeviceCommand::ClearTarget { view: view.clone() });
            recorder.target = Some(view.clone());
        }
        self.commands.push(GpuCommand::AcquireTarget {
            label: target.label.clone(),
            width: target.width,
            height: target.height,
            format: target.format,
        });
        self.commands.push(GpuCommand::ClearTarget {
            label: target.label.clone(),
        });
        Ok(())
    }

    /// Record an indexed, instanced draw into the current target
    pub fn draw(&mut self, pass: DrawPass) -> SplatResult<()> {
        if let Some(recorder) = self.recorder.as_mut() {
            let target = recorder.target.clone().ok_or(SplatError::NoRenderTarget)?;
            let mut bindings = Vec::with_capacity(pass.storage.len());
            for buffer in pass.storage {
                let device_buffer = buffer
                    .device_buffer()
                    .ok_or_else(|| SplatError::BackendMismatch(buffer.label.clone()))?;
                bindings.push(device_buffer);
            }
            let index = pass
                .index
                .device_buffer()
                .ok_or_else(|| SplatError::BackendMismatch(pass.index.label.clone()))?;
            let uniform =
                recorder
                    .render_device
                    .create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
                        label: Some("gaussian_splat_draw_uniforms"),
                        contents: pass.uniform,
                        usage: BufferUsages::UNIFORM,
                    });
            let mut entries = vec![BindGroupEntry {
                binding: 0,
                resource: uniform.as_entire_binding(),
            }];
            for (i, buffer) in bindings.iter().enumerate() {
                entries.push(BindGroupEntry {
                    binding: i as u32 + 1,
                    resource: buffer.as_entire_binding(),
                });
            }
            let bind_group =
                recorder
                    .render_device
                    .create_bind_group(pass.label, &recorder.layouts.draw, &entries);
            recorder.commands.push(DeviceCommand::Draw {
                kind: pass.kind,
                label: pass.label.to_string(),
                bind_group,
                index: index.clone(),
                index_count: pass.index_count,
                instance_count: pass.instance_count,
                target,
            });
        }
        self.commands.push(GpuCommand::Draw {
            label: pass.label.to_string(),
            material: pass.material.to_string(),
            index_count: pass.index_count,
            instance_count: pass.instance_count,
        });
        Ok(())
    }

    /// Composite the current target onto the camera output
    pub fn composite(&mut self, label: &str, material: &str) -> SplatResult<()> {
        if let Some(recorder) = self.recorder.as_mut() {
            let source = recorder.target.clone().ok_or(SplatError::NoRenderTarget)?;
            recorder.commands.push(DeviceCommand::Composite { source });
        }
        self.commands.push(GpuCommand::Composite {
            label: label.to_string(),
            material: material.to_string(),
        });
        Ok(())
    }

    /// End use of the frame target; the texture is released here
    pub fn release_target(&mut self, target: GpuTexture) {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.target = None;
        }
        self.commands.push(GpuCommand::ReleaseTarget {
            label: target.label.clone(),
        });
        debug!("Released '{}'", target.label);
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn labels(&self) -> Vec<&str> {
        self.commands.iter().map(GpuCommand::label).collect()
    }

    /// Device commands recorded so far, leaving the encoder empty of them
    pub fn take_device_commands(&mut self) -> Vec<DeviceCommand> {
        self.recorder
            .as_mut()
            .map(|r| std::mem::take(&mut r.commands))
            .unwrap_or_default()
    }

    /// Drop recorded commands, keeping the encoder for reuse
    pub fn reset(&mut self) {
        self.commands.clear();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.commands.clear();
            recorder.target = None;
        }
    }

    pub fn finish(self) -> Vec<GpuCommand> {
        self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_tracked_until_dropped() {
        let device = GpuDevice::new();
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("test_buffer"),
            size: 10,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        assert_eq!(buffer.len_words(), 3);
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(device.live_bytes(), 12);
        drop(buffer);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_bytes(), 0);
    }

    #[test]
    fn init_data_is_read_little_endian() {
        let device = GpuDevice::new();
        let data = [1u32, 0xdead_beef, 7];
        let buffer = device.create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
            label: Some("init"),
            contents: bytemuck::cast_slice(&data),
            usage: BufferUsages::STORAGE,
        });
        assert_eq!(buffer.words(), &data);
        assert!(!buffer.is_device());
    }

    #[test]
    fn dispatch_rounds_up_workgroups() {
        let mut encoder = CommandEncoder::new("test");
        let target = encoder
            .dispatch(KernelPass::new(SplatKernel::InitSortValues, 257).label("k"))
            .unwrap();
        assert_eq!(target, KernelTarget::Host);
        assert_eq!(
            encoder.commands()[0],
            GpuCommand::Compute { label: "k".into(), workgroups: 2 }
        );
    }

    #[test]
    fn large_dispatches_split_into_two_dimensions() {
        assert_eq!(dispatch_size(12), (12, 1));
        assert_eq!(dispatch_size(65535), (65535, 1));
        let (x, y) = dispatch_size(131072);
        assert_eq!((x, y), (65535, 3));
        assert!(x * y >= 131072);
    }

    #[test]
    fn map_read_requires_mappable_usage() {
        let device = GpuDevice::new();
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("storage_only"),
            size: 16,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        assert_eq!(
            device.map_read(&buffer),
            Err(SplatError::NotMappable("storage_only".to_string()))
        );
        assert_eq!(device.read_buffer(&buffer).unwrap(), vec![0; 4]);
    }

    #[test]
    fn host_submit_is_a_no_op() {
        let device = GpuDevice::new();
        let mut encoder = device.create_command_encoder("host");
        assert!(!encoder.is_device());
        assert!(device.submit(&mut encoder).is_ok());
    }

    #[test]
    fn texture_rows_copy_through_a_buffer() {
        let device = GpuDevice::new();
        let mut texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("rows"),
            size: wgpu::Extent3d {
                width: 4,
                height: 3,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::COPY_SRC | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        device.write_texture(&mut texture, &(0..12).collect::<Vec<u32>>());
        let mut scratch = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scratch"),
            size: 32,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let mut encoder = CommandEncoder::new("rows");
        encoder.copy_texture_rows_to_buffer(&texture, 1, 2, &mut scratch).unwrap();
        assert_eq!(scratch.words(), &[4, 5, 6, 7, 8, 9, 10, 11]);

        scratch.words_mut()[0] = 99;
        encoder.copy_buffer_to_texture_rows(&scratch, &mut texture, 0, 1).unwrap();
        assert_eq!(texture.texel(0), &[99]);
        assert_eq!(texture.texel(4), &[4]);
    }
}
