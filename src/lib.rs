// GPU-resident Gaussian splat rendering and editing for Bevy
// Multiple splat collections per camera, composited through one offscreen target

pub mod collection;
pub mod coordinator;
pub mod cutout;
pub mod error;
pub mod gpu;
pub mod gpu_pipelines;
pub mod plugin;
pub mod radix_sort;
pub mod render_node;
pub mod render_pipeline;
pub mod splat_asset;
pub mod splat_buffers;
pub mod splat_edit;
pub mod splat_kernels;
pub mod splat_math;
pub mod splat_state;

// Re-exports
pub use collection::{
    CollectionId, SplatCollection, SplatMaterials, SplatRenderSettings, SplatShaderSet,
    EMBEDDED_SHADER_ROOT,
};
pub use coordinator::{
    RenderCoordinator, SplatCameraOutput, SplatCoordinatorConfig, SplatFrameCommands,
};
pub use cutout::{CutoutShape, SplatCutout};
pub use error::{SnapshotKind, SplatError, SplatErrorKind, SplatResult};
pub use gpu::{
    CommandEncoder, DeviceCommand, GpuBuffer, GpuCommand, GpuDevice, GpuTexture, KernelPass,
    KernelTarget,
};
pub use gpu_pipelines::{KernelParams, SplatKernel};
pub use plugin::{SplatCoordinator, SplatGpu, SplatPreviewCamera, SplatRenderPlugin, SplatSource};
pub use radix_sort::{float_to_sortable_uint, sortable_uint_to_float, RadixSortEngine, SortEngine};
pub use render_node::{SplatCompositeLabel, SplatCompositeNode};
pub use render_pipeline::{FrameRenderPipeline, SplatCamera, SplatDrawUniforms, SplatRenderMode};
pub use splat_asset::{
    create_test_asset, create_test_points, ChunkInfo, ColorFormat, ShFormat, SplatAsset,
    SplatAssetBuilder, SplatFormats, SplatPoint, VectorFormat,
};
pub use splat_buffers::{SplatBufferStore, COLOR_TEXTURE_WIDTH, MAX_SPLAT_COUNT};
pub use splat_edit::{EditState, SelectionBounds, SplatCounts};
pub use splat_kernels::{ExportedSplat, EXPORT_WORDS};
pub use splat_state::{state_bits, SelectionOp, SelectionRect};
