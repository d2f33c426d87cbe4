// Multi-collection render coordinator
//
// Owns the registered set of collections and, per camera frame, gathers the
// visible ones, orders them, runs each through the frame pipeline into one
// offscreen HDR target and composites that target onto the camera output.
// The target and the frame's command sequence never outlive the frame.

use std::collections::HashMap;
use std::sync::Arc;

use bevy::prelude::*;
use bevy::render::extract_component::ExtractComponent;
use tracing::{debug, info, warn};
use wgpu::{TextureFormat, TextureUsages};

use crate::collection::{CollectionId, SplatCollection};
use crate::gpu::{CommandEncoder, DeviceCommand, GpuCommand, GpuDevice};
use crate::render_pipeline::{FrameRenderPipeline, SplatCamera, SplatDrawUniforms};

/// Coordinator configuration
#[derive(Resource, Clone, Debug, PartialEq)]
pub struct SplatCoordinatorConfig {
    /// Another frame pipeline drives rendering; no per-camera hook is installed
    pub external_pipeline: bool,
    /// Format of the offscreen composite target (default: Rgba16Float)
    pub target_format: TextureFormat,
}

impl Default for SplatCoordinatorConfig {
    fn default() -> Self {
        Self {
            external_pipeline: false,
            target_format: TextureFormat::Rgba16Float,
        }
    }
}

/// Device commands of one camera frame, replayed by the render graph node
#[derive(Clone, Default)]
pub struct SplatFrameCommands(pub Arc<Vec<DeviceCommand>>);

impl SplatFrameCommands {
    pub fn commands(&self) -> &[DeviceCommand] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SplatFrameCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SplatFrameCommands({})", self.0.len())
    }
}

/// Result of rendering all splat collections for one camera
#[derive(Component, Clone, Debug, Default, ExtractComponent)]
pub struct SplatCameraOutput {
    /// Command sequence of the frame, in submission order
    pub commands: Vec<GpuCommand>,
    /// Device side of `commands`; empty on a host device
    pub frame: SplatFrameCommands,
    /// Collections drawn, in draw order
    pub drawn: Vec<CollectionId>,
    /// Material of the fullscreen composite pass
    pub composite_material: Option<String>,
}

/// Per-camera pre-render hook and the command resources it owns
#[derive(Debug)]
struct CameraHook {
    encoder: CommandEncoder,
}

pub struct RenderCoordinator {
    device: GpuDevice,
    config: SplatCoordinatorConfig,
    registered: HashMap<CollectionId, SplatDrawUniforms>,
    hook: Option<CameraHook>,
    pipeline: FrameRenderPipeline,
}

impl RenderCoordinator {
    pub fn new(device: GpuDevice, config: SplatCoordinatorConfig) -> Self {
        Self {
            device,
            config,
            registered: HashMap::new(),
            hook: None,
            pipeline: FrameRenderPipeline,
        }
    }

    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    pub fn config(&self) -> &SplatCoordinatorConfig {
        &self.config
    }

    /// Add a collection; returns false if it was already registered
    pub fn register(&mut self, collection: &SplatCollection) -> bool {
        if self.registered.contains_key(&collection.id()) {
            return false;
        }
        self.registered.insert(collection.id(), SplatDrawUniforms::default());
        if self.hook.is_none() && !self.config.external_pipeline {
            info!("Installing splat camera hook");
            self.hook = Some(CameraHook {
                encoder: self.device.create_command_encoder("gaussian_splat_frame"),
            });
        }
        true
    }

    /// Remove a collection; the hook and its command resources go with the last one
    pub fn unregister(&mut self, id: CollectionId) -> bool {
        if self.registered.remove(&id).is_none() {
            return false;
        }
        if self.registered.is_empty() && self.hook.take().is_some() {
            info!("Removing splat camera hook");
        }
        true
    }

    pub fn is_registered(&self, id: CollectionId) -> bool {
        self.registered.contains_key(&id)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn hook_installed(&self) -> bool {
        self.hook.is_some()
    }

    /// Last per-draw parameter block of a registered collection
    pub fn draw_uniforms(&self, id: CollectionId) -> Option<&SplatDrawUniforms> {
        self.registered.get(&id)
    }

    /// Indices into `collections` of what `camera` should draw, in draw order:
    /// render order descending, then camera-space depth ascending.
    pub fn gather_for_camera(
        &self,
        camera: &SplatCamera,
        collections: &[&mut SplatCollection],
    ) -> Vec<usize> {
        if camera.is_preview {
            return Vec::new();
        }
        let mut gathered: Vec<(usize, i32, f32)> = collections
            .iter()
            .enumerate()
            .filter(|(_, c)| self.is_registered(c.id()) && c.active && c.has_render_setup())
            .map(|(i, c)| {
                let origin = c.local_to_world.w_axis.truncate();
                (i, c.settings.render_order, camera.view_depth(origin))
            })
            .collect();
        gathered.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.total_cmp(&b.2)));
        gathered.into_iter().map(|(i, _, _)| i).collect()
    }

    /// Render every gathered collection for `camera` and composite the result.
    ///
    /// Returns `None` without allocating anything when nothing is visible.
    pub fn render_all(
        &mut self,
        camera: &SplatCamera,
        collections: &mut [&mut SplatCollection],
    ) -> Option<SplatCameraOutput> {
        let order = self.gather_for_camera(camera, collections);
        if order.is_empty() {
            return None;
        }

        // Asset swaps finish before any pass of this frame reads the buffers
        let order: Vec<usize> = order
            .into_iter()
            .filter(|&i| collections[i].sync_asset())
            .collect();
        if order.is_empty() {
            debug!("No splat collection survived asset sync");
            return None;
        }

        let mut frame_encoder = match self.hook.as_mut() {
            Some(hook) => {
                hook.encoder.reset();
                std::mem::take(&mut hook.encoder)
            }
            None => self.device.create_command_encoder("gaussian_splat_frame"),
        };

        let width = (camera.viewport.x.max(1.0)) as u32;
        let height = (camera.viewport.y.max(1.0)) as u32;
        let target = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("gaussian_splat_composite_target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.config.target_format,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        if let Err(e) = frame_encoder.begin_target(&target) {
            warn!("Splat composite target unusable: {}", e);
            return None;
        }

        let mut drawn = Vec::with_capacity(order.len());
        let mut composite_material = None;
        for i in order {
            let collection = &mut *collections[i];
            let id = collection.id();
            match self.pipeline.render(collection, camera, &mut frame_encoder) {
                Ok(uniforms) => {
                    self.registered.insert(id, uniforms);
                    drawn.push(id);
                    composite_material = collection.materials().map(|m| m.composite.clone());
                }
                Err(e) => warn!("Splat collection {:?} skipped this frame: {}", id, e),
            }
        }

        if let Some(material) = &composite_material {
            if let Err(e) = frame_encoder.composite("gaussian_splat_composite", material) {
                warn!("Splat composite skipped: {}", e);
            }
        }
        frame_encoder.release_target(target);

        debug!("Rendered {} splat collections", drawn.len());
        let commands = frame_encoder.commands().to_vec();
        let frame = SplatFrameCommands(Arc::new(frame_encoder.take_device_commands()));
        if let Some(hook) = self.hook.as_mut() {
            hook.encoder = frame_encoder;
        }

        Some(SplatCameraOutput {
            commands,
            frame,
            drawn,
            composite_material,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SplatShaderSet;

    #[test]
    fn hook_follows_registration() {
        let device = GpuDevice::new();
        let mut coordinator = RenderCoordinator::new(device.clone(), SplatCoordinatorConfig::default());
        let a = SplatCollection::new(&device, &SplatShaderSet::default());
        let b = SplatCollection::new(&device, &SplatShaderSet::default());

        assert!(coordinator.register(&a));
        assert!(!coordinator.register(&a));
        assert!(coordinator.register(&b));
        assert!(coordinator.hook_installed());

        assert!(coordinator.unregister(a.id()));
        assert!(coordinator.hook_installed());
        assert!(coordinator.unregister(b.id()));
        assert!(!coordinator.hook_installed());
    }

    #[test]
    fn external_pipeline_never_installs_hook() {
        let device = GpuDevice::new();
        let config = SplatCoordinatorConfig {
            external_pipeline: true,
            ..Default::default()
        };
        let mut coordinator = RenderCoordinator::new(device.clone(), config);
        let a = SplatCollection::new(&device, &SplatShaderSet::default());
        coordinator.register(&a);
        assert!(!coordinator.hook_installed());
    }
}
