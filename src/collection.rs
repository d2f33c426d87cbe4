// A renderable, editable splat collection and its configuration
//
// A collection ties together the asset it shows, the GPU store holding that
// asset's buffers, the per-collection render settings and the edit state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bevy::prelude::*;
use glam::Mat4;
use tracing::{debug, error};

use crate::cutout::SplatCutout;
use crate::error::{SplatError, SplatResult};
use crate::gpu::GpuDevice;
use crate::radix_sort::{RadixSortEngine, SortEngine};
use crate::render_pipeline::{SplatMaterialKind, SplatRenderMode};
use crate::splat_asset::SplatAsset;
use crate::splat_buffers::SplatBufferStore;
use crate::splat_edit::EditState;

static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier of a collection for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Reflect)]
pub struct CollectionId(u64);

impl CollectionId {
    fn next() -> Self {
        Self(NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Per-collection render configuration
/// Values are clamped to their supported ranges when used
#[derive(Component, Clone, Copy, Debug, PartialEq, Reflect)]
#[reflect(Component)]
pub struct SplatRenderSettings {
    /// Higher orders draw first; depth only orders collections of equal order
    pub render_order: i32,
    /// Splat size multiplier (0.1 - 2.0, default: 1.0)
    pub scale: f32,
    /// Opacity multiplier (0.05 - 20.0, default: 1.0)
    pub opacity: f32,
    /// Spherical harmonics order (0-3, default: 3)
    pub sh_order: u32,
    /// Show only the view-dependent SH contribution
    pub sh_only: bool,
    /// Re-sort every Nth frame (1-30, default: 1)
    pub sort_every_nth_frame: u32,
    pub render_mode: SplatRenderMode,
    /// Point size in pixels for debug point modes (1.0 - 15.0, default: 3.0)
    pub point_display_size: f32,
}

impl Default for SplatRenderSettings {
    fn default() -> Self {
        Self {
            render_order: 0,
            scale: 1.0,
            opacity: 1.0,
            sh_order: 3,
            sh_only: false,
            sort_every_nth_frame: 1,
            render_mode: SplatRenderMode::Splats,
            point_display_size: 3.0,
        }
    }
}

impl SplatRenderSettings {
    /// Copy with every value inside its supported range
    pub fn clamped(&self) -> Self {
        Self {
            render_order: self.render_order,
            scale: self.scale.clamp(0.1, 2.0),
            opacity: self.opacity.clamp(0.05, 20.0),
            sh_order: self.sh_order.min(3),
            sh_only: self.sh_only,
            sort_every_nth_frame: self.sort_every_nth_frame.clamp(1, 30),
            render_mode: self.render_mode,
            point_display_size: self.point_display_size.clamp(1.0, 15.0),
        }
    }
}

/// Shader resources a collection needs to render and edit
#[derive(Resource, Clone, Debug, PartialEq, Eq)]
pub struct SplatShaderSet {
    pub splats: Option<String>,
    pub composite: Option<String>,
    pub debug_points: Option<String>,
    pub debug_boxes: Option<String>,
    pub compute: Option<String>,
}

/// Asset path prefix of the shaders embedded by the plugin
pub const EMBEDDED_SHADER_ROOT: &str = "embedded://rfs_gsplat_composite/shaders";

impl Default for SplatShaderSet {
    fn default() -> Self {
        let embedded = |name: &str| Some(format!("{}/{}", EMBEDDED_SHADER_ROOT, name));
        Self {
            splats: embedded("gaussian_splat.wgsl"),
            composite: embedded("gaussian_splat_composite.wgsl"),
            debug_points: embedded("gaussian_splat_debug_points.wgsl"),
            debug_boxes: embedded("gaussian_splat_debug_boxes.wgsl"),
            compute: embedded("gaussian_splat_utilities.wgsl"),
        }
    }
}

/// Materials created from a complete [`SplatShaderSet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplatMaterials {
    pub splats: String,
    pub composite: String,
    pub debug_points: String,
    pub debug_boxes: String,
    pub compute: String,
}

impl SplatMaterials {
    pub fn create(shaders: &SplatShaderSet, device: &GpuDevice) -> SplatResult<Self> {
        fn require(shader: &Option<String>, name: &'static str) -> SplatResult<String> {
            shader.clone().ok_or(SplatError::MissingShader(name))
        }
        let materials = Self {
            splats: require(&shaders.splats, "splats")?,
            composite: require(&shaders.composite, "composite")?,
            debug_points: require(&shaders.debug_points, "debug_points")?,
            debug_boxes: require(&shaders.debug_boxes, "debug_boxes")?,
            compute: require(&shaders.compute, "compute")?,
        };
        if !device.supports_compute() {
            return Err(SplatError::ComputeUnsupported);
        }
        Ok(materials)
    }

    pub fn material(&self, kind: SplatMaterialKind) -> &str {
        match kind {
            SplatMaterialKind::Splats => &self.splats,
            SplatMaterialKind::DebugPoints => &self.debug_points,
            SplatMaterialKind::DebugBoxes => &self.debug_boxes,
        }
    }
}

/// One splat dataset placed in the world
#[derive(Component)]
pub struct SplatCollection {
    id: CollectionId,
    pub settings: SplatRenderSettings,
    pub local_to_world: Mat4,
    /// Inactive collections are skipped by every camera
    pub active: bool,
    pub cutouts: Vec<SplatCutout>,
    asset: Option<Arc<SplatAsset>>,
    pub(crate) store: SplatBufferStore,
    pub(crate) edit: EditState,
    pub(crate) materials: Option<SplatMaterials>,
    config_error: Option<SplatError>,
    frame_counter: u32,
}

impl std::fmt::Debug for SplatCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplatCollection")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("active", &self.active)
            .field("splat_count", &self.splat_count())
            .field("config_error", &self.config_error)
            .finish()
    }
}

impl SplatCollection {
    pub fn new(device: &GpuDevice, shaders: &SplatShaderSet) -> Self {
        Self::with_sort_engine(device, shaders, Arc::new(RadixSortEngine))
    }

    pub fn with_sort_engine(
        device: &GpuDevice,
        shaders: &SplatShaderSet,
        sorter: Arc<dyn SortEngine>,
    ) -> Self {
        let id = CollectionId::next();
        let (materials, config_error) = match SplatMaterials::create(shaders, device) {
            Ok(materials) => (Some(materials), None),
            Err(e) => {
                error!("Splat collection {:?} cannot render: {}", id, e);
                (None, Some(e))
            }
        };
        Self {
            id,
            settings: SplatRenderSettings::default(),
            local_to_world: Mat4::IDENTITY,
            active: true,
            cutouts: Vec::new(),
            asset: None,
            store: SplatBufferStore::with_sort_engine(device.clone(), sorter),
            edit: EditState::NoEditState,
            materials,
            config_error,
            frame_counter: 0,
        }
    }

    pub fn with_asset(mut self, asset: Arc<SplatAsset>) -> Self {
        self.asset = Some(asset);
        self
    }

    pub fn with_settings(mut self, settings: SplatRenderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_transform(mut self, local_to_world: Mat4) -> Self {
        self.local_to_world = local_to_world;
        self
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn asset(&self) -> Option<&Arc<SplatAsset>> {
        self.asset.as_ref()
    }

    /// Assign a new asset. Buffers are rebuilt on the next sync.
    pub fn set_asset(&mut self, asset: Option<Arc<SplatAsset>>) {
        self.asset = asset;
    }

    /// Reconcile GPU buffers with the assigned asset.
    ///
    /// A rebuild discards the edit state since its bitsets no longer describe
    /// the new data.
    pub fn sync_asset(&mut self) -> bool {
        let before = self.store.asset_key();
        let loaded = self.store.sync_asset(self.asset.as_ref());
        if self.store.asset_key() != before && self.edit.is_active() {
            debug!("Splat collection {:?} reloaded, dropping edit state", self.id);
            self.edit = EditState::NoEditState;
        }
        loaded
    }

    /// Configuration error detected when the collection was created
    pub fn config_error(&self) -> Option<&SplatError> {
        self.config_error.as_ref()
    }

    pub fn materials(&self) -> Option<&SplatMaterials> {
        self.materials.as_ref()
    }

    /// Materials exist and an asset is assigned (it may not be uploaded yet)
    pub fn has_render_setup(&self) -> bool {
        self.materials.is_some() && self.asset.is_some()
    }

    /// Materials exist and splat data is uploaded
    pub fn has_valid_render_setup(&self) -> bool {
        self.materials.is_some() && self.store.is_loaded()
    }

    pub fn has_valid_asset(&self) -> bool {
        self.store.is_loaded()
    }

    pub fn splat_count(&self) -> u32 {
        self.store.splat_count()
    }

    pub fn store(&self) -> &SplatBufferStore {
        &self.store
    }

    pub fn edit_state(&self) -> &EditState {
        &self.edit
    }

    pub fn world_to_local(&self) -> Mat4 {
        self.local_to_world.inverse()
    }

    /// Frames rendered so far
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Advance the frame counter; returns whether this frame sorts
    pub(crate) fn advance_frame(&mut self, sort_every_nth_frame: u32) -> bool {
        let sort_now = self.frame_counter % sort_every_nth_frame.max(1) == 0;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        sort_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_clamp_to_supported_ranges() {
        let settings = SplatRenderSettings {
            scale: 5.0,
            opacity: 0.0,
            sh_order: 7,
            sort_every_nth_frame: 0,
            point_display_size: 40.0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(settings.scale, 2.0);
        assert_eq!(settings.opacity, 0.05);
        assert_eq!(settings.sh_order, 3);
        assert_eq!(settings.sort_every_nth_frame, 1);
        assert_eq!(settings.point_display_size, 15.0);
    }

    #[test]
    fn missing_shader_disables_collection() {
        let device = GpuDevice::new();
        let shaders = SplatShaderSet {
            composite: None,
            ..Default::default()
        };
        let collection = SplatCollection::new(&device, &shaders);
        assert_eq!(collection.config_error(), Some(&SplatError::MissingShader("composite")));
        assert!(!collection.has_render_setup());
    }

    #[test]
    fn collection_ids_are_unique() {
        let device = GpuDevice::new();
        let a = SplatCollection::new(&device, &SplatShaderSet::default());
        let b = SplatCollection::new(&device, &SplatShaderSet::default());
        assert_ne!(a.id(), b.id());
    }
}
