// Bevy integration: collections as components, coordinator as a resource
//
// Collections register when their component is added and unregister when it is
// removed. World transforms, render settings and asset swaps are pushed into the
// collections every frame before each active camera renders.
//
// With a renderer present, `finish` moves every splat allocation onto the
// RenderDevice and sets up the render world: kernel, draw and composite
// pipelines plus the graph node replaying each camera's recorded frame.

use std::collections::HashMap;
use std::sync::Arc;

use bevy::{
    asset::{embedded_asset, io::embedded::EmbeddedAssetRegistry},
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    prelude::*,
    render::{
        extract_component::ExtractComponentPlugin,
        render_graph::{RenderGraphExt, ViewNodeRunner},
        renderer::{RenderDevice, RenderQueue},
        Render, RenderApp, RenderSystems,
    },
};

use crate::collection::{CollectionId, SplatCollection, SplatRenderSettings, SplatShaderSet};
use crate::coordinator::{RenderCoordinator, SplatCameraOutput, SplatCoordinatorConfig};
use crate::gpu::GpuDevice;
use crate::gpu_pipelines::{
    prepare_composite_pipelines, publish_kernel_pipelines, PublishedKernelPipelines,
    SharedSplatLayouts, SplatCompositePipeline, SplatDrawPipelines, SplatGpuLayouts,
    SplatKernelPipelines,
};
use crate::render_node::{SplatCompositeLabel, SplatCompositeNode};
use crate::render_pipeline::SplatCamera;
use crate::splat_asset::SplatAsset;

/// Device used for every splat allocation of the app
#[derive(Resource, Clone, Debug, Default)]
pub struct SplatGpu(pub GpuDevice);

/// Asset shown by the collection on the same entity
#[derive(Component, Clone, Debug, Default)]
pub struct SplatSource(pub Option<Arc<SplatAsset>>);

/// Marks cameras that never draw splats (thumbnails, previews)
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct SplatPreviewCamera;

/// Render coordinator plus the entity -> collection mapping for removals
#[derive(Resource)]
pub struct SplatCoordinator {
    pub coordinator: RenderCoordinator,
    entities: HashMap<Entity, CollectionId>,
}

impl SplatCoordinator {
    pub fn new(device: GpuDevice, config: SplatCoordinatorConfig) -> Self {
        Self {
            coordinator: RenderCoordinator::new(device, config),
            entities: HashMap::new(),
        }
    }
}

pub struct SplatRenderPlugin;

impl Plugin for SplatRenderPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<SplatGpu>();
        app.init_resource::<SplatShaderSet>();
        app.init_resource::<SplatCoordinatorConfig>();
        app.register_type::<SplatRenderSettings>();

        let device = app.world().resource::<SplatGpu>().0.clone();
        let config = app.world().resource::<SplatCoordinatorConfig>().clone();
        app.insert_resource(SplatCoordinator::new(device, config.clone()));

        // Headless apps without an asset plugin load shaders from user paths only
        if app.world().contains_resource::<EmbeddedAssetRegistry>() {
            embedded_asset!(app, "shaders/gaussian_splat.wgsl");
            embedded_asset!(app, "shaders/gaussian_splat_composite.wgsl");
            embedded_asset!(app, "shaders/gaussian_splat_debug_points.wgsl");
            embedded_asset!(app, "shaders/gaussian_splat_debug_boxes.wgsl");
            embedded_asset!(app, "shaders/gaussian_splat_utilities.wgsl");
        }

        // Runs after transform propagation so world matrices are current
        app.add_systems(
            Last,
            (
                unregister_removed_collections,
                register_new_collections,
                sync_collection_sources,
                sync_collection_settings,
                sync_collection_transforms,
                render_splat_cameras,
            )
                .chain(),
        );

        app.add_plugins(ExtractComponentPlugin::<SplatCameraOutput>::default());
        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };
        render_app.add_systems(
            Render,
            (publish_kernel_pipelines, prepare_composite_pipelines)
                .in_set(RenderSystems::Prepare),
        );
        if !config.external_pipeline {
            render_app
                .add_render_graph_node::<ViewNodeRunner<SplatCompositeNode>>(
                    Core3d,
                    SplatCompositeLabel,
                )
                .add_render_graph_edges(
                    Core3d,
                    (Node3d::EndMainPass, SplatCompositeLabel, Node3d::StartMainPassPostProcessing),
                );
        }
    }

    fn finish(&self, app: &mut App) {
        let (Some(render_device), Some(render_queue)) = (
            app.world().get_resource::<RenderDevice>().cloned(),
            app.world().get_resource::<RenderQueue>().cloned(),
        ) else {
            info!("No render device, splat buffers stay in host memory");
            return;
        };

        let layouts = Arc::new(SplatGpuLayouts::new(&render_device));
        let published = PublishedKernelPipelines::default();
        let device =
            GpuDevice::with_render_device(render_device, render_queue, layouts.clone(), published.clone());
        if !device.supports_compute() {
            warn!("Render device lacks compute support, splat collections will not render");
        }
        let config = app.world().resource::<SplatCoordinatorConfig>().clone();
        let shaders = app.world().resource::<SplatShaderSet>().clone();
        app.insert_resource(SplatGpu(device.clone()));
        app.insert_resource(SplatCoordinator::new(device, config.clone()));

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };
        render_app
            .insert_resource(SharedSplatLayouts(layouts))
            .insert_resource(published)
            .insert_resource(shaders)
            .insert_resource(config)
            .init_resource::<SplatKernelPipelines>()
            .init_resource::<SplatDrawPipelines>()
            .init_resource::<SplatCompositePipeline>();
    }
}

fn register_new_collections(
    mut splats: ResMut<SplatCoordinator>,
    query: Query<(Entity, &SplatCollection), Added<SplatCollection>>,
) {
    for (entity, collection) in &query {
        if splats.coordinator.register(collection) {
            debug!("Registered splat collection {:?} on {:?}", collection.id(), entity);
        }
        splats.entities.insert(entity, collection.id());
    }
}

fn unregister_removed_collections(
    mut splats: ResMut<SplatCoordinator>,
    mut removed: RemovedComponents<SplatCollection>,
) {
    for entity in removed.read() {
        if let Some(id) = splats.entities.remove(&entity) {
            splats.coordinator.unregister(id);
            debug!("Unregistered splat collection {:?}", id);
        }
    }
}

fn sync_collection_sources(
    mut query: Query<(&SplatSource, &mut SplatCollection), Changed<SplatSource>>,
) {
    for (source, mut collection) in &mut query {
        collection.set_asset(source.0.clone());
    }
}

fn sync_collection_settings(
    mut query: Query<(&SplatRenderSettings, &mut SplatCollection), Changed<SplatRenderSettings>>,
) {
    for (settings, mut collection) in &mut query {
        collection.settings = *settings;
    }
}

fn sync_collection_transforms(
    mut query: Query<(&GlobalTransform, &mut SplatCollection), Changed<GlobalTransform>>,
) {
    for (transform, mut collection) in &mut query {
        collection.local_to_world = Mat4::from(transform.affine());
    }
}

fn render_splat_cameras(
    mut commands: Commands,
    mut splats: ResMut<SplatCoordinator>,
    cameras: Query<(Entity, &Camera, &GlobalTransform, Has<SplatPreviewCamera>)>,
    mut collections: Query<&mut SplatCollection>,
) {
    for (entity, camera, transform, is_preview) in &cameras {
        if !camera.is_active {
            continue;
        }
        let Some(viewport) = camera.physical_viewport_size() else {
            continue;
        };
        let mut splat_camera = SplatCamera::new(
            Mat4::from(transform.affine()).inverse(),
            camera.clip_from_view(),
            viewport.as_vec2(),
        );
        splat_camera.is_preview = is_preview;

        let mut refs: Vec<&mut SplatCollection> =
            collections.iter_mut().map(Mut::into_inner).collect();
        match splats.coordinator.render_all(&splat_camera, &mut refs) {
            Some(output) => {
                commands.entity(entity).insert(output);
            }
            None => {
                commands.entity(entity).remove::<SplatCameraOutput>();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_tracks_collection_lifecycle() {
        let mut app = App::new();
        app.add_plugins(SplatRenderPlugin);

        let device = app.world().resource::<SplatGpu>().0.clone();
        let shaders = app.world().resource::<SplatShaderSet>().clone();
        let entity = app
            .world_mut()
            .spawn(SplatCollection::new(&device, &shaders))
            .id();
        app.update();

        let splats = app.world().resource::<SplatCoordinator>();
        assert_eq!(splats.coordinator.registered_count(), 1);
        assert!(splats.coordinator.hook_installed());

        app.world_mut().despawn(entity);
        app.update();

        let splats = app.world().resource::<SplatCoordinator>();
        assert_eq!(splats.coordinator.registered_count(), 0);
        assert!(!splats.coordinator.hook_installed());
    }
}
