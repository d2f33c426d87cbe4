// Per-collection frame pipeline: distances -> sort -> view data -> draw
//
// The sort only runs every Nth frame (per collection cadence). Skipped frames
// draw with the previous permutation, which lags behind fast camera motion by
// up to N-1 frames.

use bevy::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use tracing::trace;

use crate::collection::SplatCollection;
use crate::cutout::CutoutBuffer;
use crate::error::{SplatError, SplatResult};
use crate::gpu::{CommandEncoder, DrawPass};
use crate::splat_kernels::{self, SplatBindings, ViewParams};
use crate::splat_math::flip_view_z;

/// How a collection is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Reflect)]
pub enum SplatRenderMode {
    /// Regular alpha-blended gaussians
    #[default]
    Splats,
    /// One point per splat center
    DebugPoints,
    /// Points colored by splat index
    DebugPointIndices,
    /// Oriented box per splat
    DebugBoxes,
    /// One box per chunk bounds record
    DebugChunkBounds,
}

/// Material a draw is issued with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplatMaterialKind {
    Splats,
    DebugPoints,
    DebugBoxes,
}

/// What a draw instance stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceRule {
    LiveSplats,
    ChunkCount,
}

/// Draw recipe of a render mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderRecipe {
    pub material: SplatMaterialKind,
    pub index_count: u32,
    pub instances: InstanceRule,
}

impl SplatRenderMode {
    pub const fn recipe(self) -> RenderRecipe {
        match self {
            SplatRenderMode::Splats => RenderRecipe {
                material: SplatMaterialKind::Splats,
                index_count: 6,
                instances: InstanceRule::LiveSplats,
            },
            SplatRenderMode::DebugPoints | SplatRenderMode::DebugPointIndices => RenderRecipe {
                material: SplatMaterialKind::DebugPoints,
                index_count: 6,
                instances: InstanceRule::LiveSplats,
            },
            SplatRenderMode::DebugBoxes => RenderRecipe {
                material: SplatMaterialKind::DebugBoxes,
                index_count: 36,
                instances: InstanceRule::LiveSplats,
            },
            SplatRenderMode::DebugChunkBounds => RenderRecipe {
                material: SplatMaterialKind::DebugBoxes,
                index_count: 36,
                instances: InstanceRule::ChunkCount,
            },
        }
    }

    /// Instances to draw for `splats` live splats and `chunks` valid chunks
    pub fn instance_count(self, splats: u32, chunks: u32) -> u32 {
        match self.recipe().instances {
            InstanceRule::LiveSplats => splats,
            InstanceRule::ChunkCount => chunks,
        }
    }

    fn shader_code(self) -> u32 {
        match self {
            SplatRenderMode::Splats => 0,
            SplatRenderMode::DebugPoints => 1,
            SplatRenderMode::DebugPointIndices => 2,
            SplatRenderMode::DebugBoxes => 3,
            SplatRenderMode::DebugChunkBounds => 4,
        }
    }
}

/// Camera inputs for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatCamera {
    /// World to view (right-handed, -Z forward)
    pub view: Mat4,
    pub projection: Mat4,
    /// Viewport size in pixels
    pub viewport: Vec2,
    pub world_position: Vec3,
    /// Preview cameras (asset thumbnails, material previews) never draw splats
    pub is_preview: bool,
}

impl SplatCamera {
    pub fn new(view: Mat4, projection: Mat4, viewport: Vec2) -> Self {
        Self {
            view,
            projection,
            viewport,
            world_position: view.inverse().w_axis.truncate(),
            is_preview: false,
        }
    }

    /// Perspective camera at `eye` looking at `target`
    pub fn look_at(eye: Vec3, target: Vec3, fov_y_radians: f32, viewport: Vec2) -> Self {
        let aspect = viewport.x / viewport.y.max(1.0);
        Self::new(
            Mat4::look_at_rh(eye, target, Vec3::Y),
            Mat4::perspective_rh(fov_y_radians, aspect, 0.1, 1000.0),
            viewport,
        )
    }

    pub fn preview(mut self) -> Self {
        self.is_preview = true;
        self
    }

    /// Forward distance of a world-space point from the camera
    pub fn view_depth(&self, world_point: Vec3) -> f32 {
        -self.view.transform_point3(world_point).z
    }
}

/// Per-draw parameter block of a registered collection
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SplatDrawUniforms {
    pub splat_count: u32,
    pub chunk_count: u32,
    pub chunks_valid: u32,
    pub bits_valid: u32,
    pub sh_order: u32,
    pub sh_only: u32,
    pub render_mode: u32,
    pub cutout_count: u32,
    pub scale: f32,
    pub opacity: f32,
    pub point_size: f32,
    pub sorted_this_frame: u32,
    pub viewport: [f32; 2],
    pub _padding: [u32; 2],
}

/// Uniform block of one draw: the collection's parameters plus its clip transform
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SplatDrawBlock {
    /// Splat-local to clip space
    pub clip_from_local: [[f32; 4]; 4],
    pub uniforms: SplatDrawUniforms,
    /// Position / scale format tags, packed as in the compute kernels
    pub formats: u32,
    pub _padding: [u32; 3],
}

/// Drives one collection through its per-frame passes
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameRenderPipeline;

impl FrameRenderPipeline {
    pub fn render(
        &self,
        collection: &mut SplatCollection,
        camera: &SplatCamera,
        encoder: &mut CommandEncoder,
    ) -> SplatResult<SplatDrawUniforms> {
        let settings = collection.settings.clamped();
        let sort_now = collection.advance_frame(settings.sort_every_nth_frame);

        let local_to_world = collection.local_to_world;
        let Some(materials) = collection.materials.as_ref() else {
            return Err(SplatError::InvalidRenderSetup);
        };
        let recipe = settings.render_mode.recipe();
        let material = materials.material(recipe.material).to_string();
        let device = collection.store.device().clone();
        let sorter = collection.store.sort_engine().clone();
        let cutouts = CutoutBuffer::build(&device, &collection.cutouts, local_to_world);

        let buffers = collection.store.buffers_mut().ok_or(SplatError::NotLoaded)?;
        let edit = collection.edit.buffers().map(|e| (&e.selected, &e.deleted));
        let splats = SplatBindings::new(&buffers.splats, &cutouts, edit);
        let work = &mut buffers.work;
        let count = splats.count();
        let model_view = camera.view * local_to_world;

        if sort_now {
            // Keys are written per splat index, so the values restart as the identity
            splat_kernels::init_sort_values(encoder, &mut work.sort_values, count)?;
            splat_kernels::calc_distances(
                encoder,
                &splats,
                flip_view_z(model_view),
                &mut work.sort_keys,
            )?;
            sorter.dispatch(
                encoder,
                &mut work.sort_resources,
                &mut work.sort_keys,
                &mut work.sort_values,
                count,
            )?;
        }

        let params = ViewParams {
            model_view,
            projection: camera.projection,
            viewport: camera.viewport,
            camera_local: local_to_world.inverse().transform_point3(camera.world_position),
            scale_factor: settings.scale,
            opacity_factor: settings.opacity,
            sh_order: settings.sh_order,
            sh_only: settings.sh_only,
        };
        splat_kernels::calc_view_data(encoder, &splats, &params, &mut work.view)?;

        let chunk_count = splats.splats.chunk_count();
        let instance_count = settings.render_mode.instance_count(count, chunk_count);
        let uniforms = SplatDrawUniforms {
            splat_count: count,
            chunk_count,
            chunks_valid: splats.splats.chunks_valid as u32,
            bits_valid: splats.bits_valid as u32,
            sh_order: settings.sh_order,
            sh_only: settings.sh_only as u32,
            render_mode: settings.render_mode.shader_code(),
            cutout_count: cutouts.count,
            scale: settings.scale,
            opacity: settings.opacity,
            point_size: settings.point_display_size,
            sorted_this_frame: sort_now as u32,
            viewport: camera.viewport.to_array(),
            _padding: [0; 2],
        };
        let block = SplatDrawBlock {
            clip_from_local: (camera.projection * model_view).to_cols_array_2d(),
            uniforms,
            formats: splats.splats.formats.packed(),
            _padding: [0; 3],
        };
        encoder.draw(DrawPass {
            label: "gaussian_splat_draw",
            material: &material,
            kind: recipe.material,
            index_count: recipe.index_count,
            instance_count,
            uniform: bytemuck::bytes_of(&block),
            storage: [
                &work.view,
                &work.sort_values,
                &splats.splats.chunks,
                &splats.splats.pos,
                &splats.splats.other,
            ],
            index: &work.index,
        })?;
        trace!(
            "Splat draw: mode {:?}, {} instances, sorted: {}",
            settings.render_mode,
            instance_count,
            sort_now
        );

        Ok(uniforms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_table_matches_modes() {
        assert_eq!(SplatRenderMode::Splats.recipe().index_count, 6);
        assert_eq!(
            SplatRenderMode::DebugPointIndices.recipe().material,
            SplatMaterialKind::DebugPoints
        );
        assert_eq!(SplatRenderMode::DebugBoxes.recipe().index_count, 36);
        assert_eq!(SplatRenderMode::DebugChunkBounds.instance_count(1000, 4), 4);
        assert_eq!(SplatRenderMode::DebugChunkBounds.instance_count(1000, 0), 0);
        assert_eq!(SplatRenderMode::DebugBoxes.instance_count(1000, 4), 1000);
    }

    #[test]
    fn draw_block_fills_whole_uniform_rows() {
        assert_eq!(std::mem::size_of::<SplatDrawUniforms>(), 64);
        assert_eq!(std::mem::size_of::<SplatDrawBlock>(), 144);
    }

    #[test]
    fn camera_depth_is_forward_distance() {
        let camera = SplatCamera::look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0, Vec2::splat(64.0));
        assert!((camera.view_depth(Vec3::ZERO) - 10.0).abs() < 1e-4);
        assert!((camera.world_position - Vec3::new(0.0, 0.0, 10.0)).length() < 1e-4);
    }
}
