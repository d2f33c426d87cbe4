// Pipelines and bind group layouts for device-backed splat passes
//
// Every compute kernel is one entry point of the utilities shader. Each kernel
// is compiled with its own shader defs so an entry point only declares the
// bindings it uses. Binding 0 of every kernel is the shared KernelParams
// uniform; the remaining bindings follow `SplatKernel::bindings` in order.
//
// Layouts are created once from the main-world RenderDevice and shared with the
// render world, so bind groups recorded in either world fit the pipelines queued
// in the render world. Compiled compute pipelines are published back to the main
// world for edit actions, which submit and read back synchronously.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bevy::prelude::*;
use bevy::render::{
    render_resource::{binding_types::*, *},
    renderer::RenderDevice,
    view::{Msaa, ViewTarget},
};
use bevy::shader::ShaderDefVal;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::collection::SplatShaderSet;
use crate::coordinator::{SplatCameraOutput, SplatCoordinatorConfig};
use crate::render_pipeline::SplatMaterialKind;

/// Uniform block bound at binding 0 of every compute kernel (208 bytes)
///
/// Field meaning depends on the kernel; see the constructors in
/// `splat_kernels` and `radix_sort`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    pub matrix_a: [[f32; 4]; 4],
    pub matrix_b: [[f32; 4]; 4],
    pub vec_a: [f32; 4],
    pub vec_b: [f32; 4],
    pub count: u32,
    /// Source formats: pos | scale << 4 | sh << 8 | color << 12
    pub formats: u32,
    /// Destination formats for the copy kernel, same packing
    pub dst_formats: u32,
    pub flags: u32,
    pub cutout_count: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub factor_a: f32,
    pub factor_b: f32,
    pub _padding: [u32; 2],
}

impl Default for KernelParams {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl KernelParams {
    pub fn with_matrix_a(mut self, m: Mat4) -> Self {
        self.matrix_a = m.to_cols_array_2d();
        self
    }

    pub fn with_matrix_b(mut self, m: Mat4) -> Self {
        self.matrix_b = m.to_cols_array_2d();
        self
    }

    pub fn with_vec_a(mut self, v: Vec4) -> Self {
        self.vec_a = v.to_array();
        self
    }

    pub fn with_vec_b(mut self, v: Vec4) -> Self {
        self.vec_b = v.to_array();
        self
    }
}

/// Bits of [`KernelParams::flags`]
pub mod kernel_flags {
    /// Source chunk metadata is valid
    pub const CHUNKS_VALID: u32 = 1;
    /// Selection / deletion bitsets are bound (otherwise placeholders)
    pub const BITS_VALID: u32 = 2;
    /// Destination chunk metadata is valid (copy kernel)
    pub const DST_CHUNKS_VALID: u32 = 4;
    /// View data: show only the SH contribution
    pub const SH_ONLY: u32 = 8;
    /// Copy words verbatim instead of decoding
    pub const VERBATIM: u32 = 16;
    /// Export / copy: apply the transform in matrix_a
    pub const TRANSFORM: u32 = 32;
    /// Rotate / scale: the other-data snapshot is bound
    pub const HAS_OTHER: u32 = 64;
}

/// How a kernel binding is declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelBinding {
    Read,
    ReadWrite,
    Texture,
}

use KernelBinding::{Read, ReadWrite, Texture};

/// pos, other, sh, color, chunks, cutouts, selected, deleted
const SPLAT_DATA: [KernelBinding; 8] = [Read, Read, Read, Texture, Read, Read, Read, Read];

/// Bindings shared by the translate, rotate and scale kernels:
/// pos snapshot, other snapshot, selected, deleted, pos, other
const SPLAT_TRANSFORM: [KernelBinding; 6] = [Read, Read, Read, Read, ReadWrite, ReadWrite];

const DATA_PLUS_OUT: [KernelBinding; 9] = [Read, Read, Read, Texture, Read, Read, Read, Read, ReadWrite];

/// src pos, other, sh, color, chunks, then dst pos, other, sh and the color
/// scratch buffer the destination texture rows are staged through
const COPY_SPLATS: [KernelBinding; 9] = [
    Read, Read, Read, Texture, Read, // source data
    ReadWrite, ReadWrite, ReadWrite, ReadWrite,
];

/// One compute entry point of the utilities shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplatKernel {
    InitSortValues,
    CalcDistances,
    CalcViewData,
    UpdateSelection,
    CountsAndBounds,
    TranslateSelection,
    RotateSelection,
    ScaleSelection,
    CopySplats,
    ExportData,
    SetSelection,
    InvertSelection,
    OrSelectedIntoDeleted,
    ClearBitRange,
    RadixUpsweep,
    RadixSpine,
    RadixDownsweep,
}

impl SplatKernel {
    pub const ALL: [SplatKernel; 17] = [
        SplatKernel::InitSortValues,
        SplatKernel::CalcDistances,
        SplatKernel::CalcViewData,
        SplatKernel::UpdateSelection,
        SplatKernel::CountsAndBounds,
        SplatKernel::TranslateSelection,
        SplatKernel::RotateSelection,
        SplatKernel::ScaleSelection,
        SplatKernel::CopySplats,
        SplatKernel::ExportData,
        SplatKernel::SetSelection,
        SplatKernel::InvertSelection,
        SplatKernel::OrSelectedIntoDeleted,
        SplatKernel::ClearBitRange,
        SplatKernel::RadixUpsweep,
        SplatKernel::RadixSpine,
        SplatKernel::RadixDownsweep,
    ];

    pub const fn entry_point(self) -> &'static str {
        match self {
            SplatKernel::InitSortValues => "init_sort_values",
            SplatKernel::CalcDistances => "calc_distances",
            SplatKernel::CalcViewData => "calc_view_data",
            SplatKernel::UpdateSelection => "update_selection",
            SplatKernel::CountsAndBounds => "counts_and_bounds",
            SplatKernel::TranslateSelection => "translate_selection",
            SplatKernel::RotateSelection => "rotate_selection",
            SplatKernel::ScaleSelection => "scale_selection",
            SplatKernel::CopySplats => "copy_splats",
            SplatKernel::ExportData => "export_data",
            SplatKernel::SetSelection => "set_selection",
            SplatKernel::InvertSelection => "invert_selection",
            SplatKernel::OrSelectedIntoDeleted => "or_selected_into_deleted",
            SplatKernel::ClearBitRange => "clear_bit_range",
            SplatKernel::RadixUpsweep => "radix_upsweep",
            SplatKernel::RadixSpine => "radix_spine",
            SplatKernel::RadixDownsweep => "radix_downsweep",
        }
    }

    /// Default pass label
    pub fn label(self) -> String {
        match self {
            SplatKernel::RadixUpsweep | SplatKernel::RadixSpine | SplatKernel::RadixDownsweep => {
                self.entry_point().to_string()
            }
            _ => format!("gaussian_splat_{}", self.entry_point()),
        }
    }

    /// Storage and texture bindings after the uniform, in binding order
    pub fn bindings(self) -> &'static [KernelBinding] {
        match self {
            SplatKernel::InitSortValues
            | SplatKernel::SetSelection
            | SplatKernel::InvertSelection
            | SplatKernel::ClearBitRange => &[ReadWrite],
            SplatKernel::CalcDistances
            | SplatKernel::CalcViewData
            | SplatKernel::UpdateSelection
            | SplatKernel::CountsAndBounds
            | SplatKernel::ExportData => &DATA_PLUS_OUT,
            SplatKernel::TranslateSelection
            | SplatKernel::RotateSelection
            | SplatKernel::ScaleSelection => &SPLAT_TRANSFORM,
            SplatKernel::CopySplats => &COPY_SPLATS,
            SplatKernel::OrSelectedIntoDeleted => &[Read, ReadWrite],
            SplatKernel::RadixUpsweep => &[Read, ReadWrite],
            SplatKernel::RadixSpine => &[ReadWrite, ReadWrite],
            SplatKernel::RadixDownsweep => &[Read, Read, Read, ReadWrite, ReadWrite],
        }
    }

    /// Shader defs selecting this kernel's declarations
    pub fn shader_defs(self) -> Vec<ShaderDefVal> {
        let mut defs: Vec<ShaderDefVal> = Vec::with_capacity(2);
        let bindings = self.bindings();
        if bindings.starts_with(&SPLAT_DATA) {
            defs.push("SPLAT_DATA".into());
        } else if bindings == SPLAT_TRANSFORM {
            defs.push("SPLAT_TRANSFORM".into());
        }
        defs.push(ShaderDefVal::Bool(self.entry_point().to_uppercase(), true));
        defs
    }
}

fn kernel_layout_entries(kernel: SplatKernel) -> Vec<BindGroupLayoutEntry> {
    let params_size = BufferSize::new(std::mem::size_of::<KernelParams>() as u64);
    let mut entries = vec![uniform_buffer_sized(false, params_size).build(0, ShaderStages::COMPUTE)];
    for (i, binding) in kernel.bindings().iter().enumerate() {
        let builder = match binding {
            Read => storage_buffer_read_only_sized(false, None),
            ReadWrite => storage_buffer_sized(false, None),
            Texture => texture_2d(TextureSampleType::Float { filterable: false }),
        };
        entries.push(builder.build(i as u32 + 1, ShaderStages::COMPUTE));
    }
    entries
}

/// Bind group layouts of every splat pipeline
pub struct SplatGpuLayouts {
    kernels: HashMap<SplatKernel, BindGroupLayout>,
    /// Draw: uniform, view data, sort values, chunks, pos, other
    pub draw: BindGroupLayout,
    /// Composite: offscreen target texture + sampler
    pub composite: BindGroupLayout,
}

impl SplatGpuLayouts {
    pub fn new(render_device: &RenderDevice) -> Self {
        let kernels = SplatKernel::ALL
            .iter()
            .map(|&kernel| {
                let label = format!("{}_layout", kernel.label());
                let layout = render_device
                    .create_bind_group_layout(label.as_str(), &kernel_layout_entries(kernel));
                (kernel, layout)
            })
            .collect();

        let draw = render_device.create_bind_group_layout(
            Some("gaussian_splat_draw_layout"),
            &BindGroupLayoutEntries::sequential(
                ShaderStages::VERTEX_FRAGMENT,
                (
                    uniform_buffer_sized(false, None),
                    storage_buffer_read_only_sized(false, None),
                    storage_buffer_read_only_sized(false, None),
                    storage_buffer_read_only_sized(false, None),
                    storage_buffer_read_only_sized(false, None),
                    storage_buffer_read_only_sized(false, None),
                ),
            ),
        );

        let composite = render_device.create_bind_group_layout(
            Some("gaussian_splat_composite_layout"),
            &BindGroupLayoutEntries::sequential(
                ShaderStages::FRAGMENT,
                (
                    texture_2d(TextureSampleType::Float { filterable: true }),
                    sampler(SamplerBindingType::Filtering),
                ),
            ),
        );

        Self {
            kernels,
            draw,
            composite,
        }
    }

    pub fn kernel(&self, kernel: SplatKernel) -> Option<&BindGroupLayout> {
        self.kernels.get(&kernel)
    }
}

/// Layouts shared between the main and render worlds
#[derive(Resource, Clone)]
pub struct SharedSplatLayouts(pub Arc<SplatGpuLayouts>);

/// Compiled compute pipelines, filled by the render world as they become ready
#[derive(Resource, Clone, Default)]
pub struct PublishedKernelPipelines(pub Arc<RwLock<HashMap<SplatKernel, ComputePipeline>>>);

impl PublishedKernelPipelines {
    /// Current set of compiled pipelines
    pub fn snapshot(&self) -> HashMap<SplatKernel, ComputePipeline> {
        self.0.read().map(|map| map.clone()).unwrap_or_default()
    }

    pub fn ready_count(&self) -> usize {
        self.0.read().map_or(0, |map| map.len())
    }
}

/// Lookup of compiled compute pipelines by kernel
pub trait KernelPipelineSource {
    fn compute_pipeline(&self, kernel: SplatKernel) -> Option<&ComputePipeline>;
}

impl KernelPipelineSource for HashMap<SplatKernel, ComputePipeline> {
    fn compute_pipeline(&self, kernel: SplatKernel) -> Option<&ComputePipeline> {
        self.get(&kernel)
    }
}

/// Render-world compute pipeline ids, one per kernel
#[derive(Resource)]
pub struct SplatKernelPipelines {
    pub ids: HashMap<SplatKernel, CachedComputePipelineId>,
}

impl FromWorld for SplatKernelPipelines {
    fn from_world(world: &mut World) -> Self {
        let Some(path) = world.resource::<SplatShaderSet>().compute.clone() else {
            warn!("No splat compute shader configured, compute pipelines are disabled");
            return Self { ids: HashMap::new() };
        };
        let shader: Handle<Shader> = world.resource::<AssetServer>().load(path);
        let layouts = world.resource::<SharedSplatLayouts>().0.clone();
        let pipeline_cache = world.resource::<PipelineCache>();

        let ids = SplatKernel::ALL
            .iter()
            .filter_map(|&kernel| {
                let layout = layouts.kernel(kernel)?.clone();
                let id = pipeline_cache.queue_compute_pipeline(ComputePipelineDescriptor {
                    label: Some(Cow::from(kernel.label())),
                    layout: vec![layout],
                    push_constant_ranges: vec![],
                    shader: shader.clone(),
                    shader_defs: kernel.shader_defs(),
                    entry_point: Some(Cow::from(kernel.entry_point())),
                    zero_initialize_workgroup_memory: true,
                });
                Some((kernel, id))
            })
            .collect();
        Self { ids }
    }
}

/// Render-world view of the kernel pipelines through the pipeline cache
pub struct CachedKernels<'a> {
    pub pipelines: &'a SplatKernelPipelines,
    pub cache: &'a PipelineCache,
}

impl KernelPipelineSource for CachedKernels<'_> {
    fn compute_pipeline(&self, kernel: SplatKernel) -> Option<&ComputePipeline> {
        let id = *self.pipelines.ids.get(&kernel)?;
        self.cache.get_compute_pipeline(id)
    }
}

/// Copy every compiled kernel pipeline into the main-world table
pub fn publish_kernel_pipelines(
    kernels: Res<SplatKernelPipelines>,
    pipeline_cache: Res<PipelineCache>,
    published: Res<PublishedKernelPipelines>,
) {
    if published.ready_count() == kernels.ids.len() {
        return;
    }
    let Ok(mut table) = published.0.write() else {
        return;
    };
    for (kernel, id) in &kernels.ids {
        if table.contains_key(kernel) {
            continue;
        }
        if let Some(pipeline) = pipeline_cache.get_compute_pipeline(*id) {
            debug!("Splat kernel '{}' ready", kernel.entry_point());
            table.insert(*kernel, pipeline.clone());
        }
    }
}

/// Premultiplied color accumulated front to back ("under" blending)
fn front_to_back_blend() -> BlendState {
    let under = BlendComponent {
        src_factor: BlendFactor::OneMinusDstAlpha,
        dst_factor: BlendFactor::One,
        operation: BlendOperation::Add,
    };
    BlendState {
        color: under,
        alpha: under,
    }
}

/// Draw pipelines into the offscreen composite target, one per material
#[derive(Resource)]
pub struct SplatDrawPipelines {
    pub ids: HashMap<SplatMaterialKind, CachedRenderPipelineId>,
}

impl FromWorld for SplatDrawPipelines {
    fn from_world(world: &mut World) -> Self {
        let shaders = world.resource::<SplatShaderSet>().clone();
        let format = world.resource::<SplatCoordinatorConfig>().target_format;
        let layout = world.resource::<SharedSplatLayouts>().0.draw.clone();
        let asset_server = world.resource::<AssetServer>().clone();
        let pipeline_cache = world.resource::<PipelineCache>();

        let materials = [
            (SplatMaterialKind::Splats, shaders.splats),
            (SplatMaterialKind::DebugPoints, shaders.debug_points),
            (SplatMaterialKind::DebugBoxes, shaders.debug_boxes),
        ];
        let ids = materials
            .into_iter()
            .filter_map(|(kind, path)| {
                let shader: Handle<Shader> = asset_server.load(path?);
                let id = pipeline_cache.queue_render_pipeline(RenderPipelineDescriptor {
                    label: Some(format!("gaussian_splat_draw_{:?}", kind).into()),
                    layout: vec![layout.clone()],
                    push_constant_ranges: vec![],
                    vertex: VertexState {
                        shader: shader.clone(),
                        shader_defs: vec![],
                        entry_point: Some("vertex".into()),
                        buffers: vec![],
                    },
                    primitive: PrimitiveState {
                        topology: PrimitiveTopology::TriangleList,
                        cull_mode: None,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: MultisampleState::default(),
                    fragment: Some(FragmentState {
                        shader,
                        shader_defs: vec![],
                        entry_point: Some("fragment".into()),
                        targets: vec![Some(ColorTargetState {
                            format,
                            blend: Some(front_to_back_blend()),
                            write_mask: ColorWrites::ALL,
                        })],
                    }),
                    zero_initialize_workgroup_memory: false,
                });
                Some((kind, id))
            })
            .collect();
        Self { ids }
    }
}

/// Fullscreen composite of the offscreen target onto a camera's view target
#[derive(Resource)]
pub struct SplatCompositePipeline {
    pub layout: BindGroupLayout,
    pub sampler: Sampler,
    pub shader: Option<Handle<Shader>>,
    /// Specialized per view target format and sample count
    pub ids: HashMap<(TextureFormat, u32), CachedRenderPipelineId>,
}

impl FromWorld for SplatCompositePipeline {
    fn from_world(world: &mut World) -> Self {
        let shader = world
            .resource::<SplatShaderSet>()
            .composite
            .clone()
            .map(|path| world.resource::<AssetServer>().load(path));
        let layout = world.resource::<SharedSplatLayouts>().0.composite.clone();
        let sampler = world.resource::<RenderDevice>().create_sampler(&SamplerDescriptor {
            label: Some("gaussian_splat_composite_sampler"),
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });
        Self {
            layout,
            sampler,
            shader,
            ids: HashMap::new(),
        }
    }
}

impl SplatCompositePipeline {
    /// Get or queue the pipeline for a view target
    pub fn specialize(
        &mut self,
        pipeline_cache: &PipelineCache,
        format: TextureFormat,
        samples: u32,
    ) -> Option<CachedRenderPipelineId> {
        if let Some(id) = self.ids.get(&(format, samples)) {
            return Some(*id);
        }
        let shader = self.shader.clone()?;
        let id = pipeline_cache.queue_render_pipeline(RenderPipelineDescriptor {
            label: Some("gaussian_splat_composite_pipeline".into()),
            layout: vec![self.layout.clone()],
            push_constant_ranges: vec![],
            vertex: VertexState {
                shader: shader.clone(),
                shader_defs: vec![],
                entry_point: Some("vertex".into()),
                buffers: vec![], // Fullscreen triangle, no vertex buffer
            },
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: samples,
                ..Default::default()
            },
            fragment: Some(FragmentState {
                shader,
                shader_defs: vec![],
                entry_point: Some("fragment".into()),
                targets: vec![Some(ColorTargetState {
                    format,
                    // The offscreen target holds premultiplied color
                    blend: Some(BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            zero_initialize_workgroup_memory: false,
        });
        self.ids.insert((format, samples), id);
        Some(id)
    }
}

/// Queue composite pipelines for every camera that draws splats this frame
pub fn prepare_composite_pipelines(
    mut composite: ResMut<SplatCompositePipeline>,
    pipeline_cache: Res<PipelineCache>,
    views: Query<(&ViewTarget, &Msaa), With<SplatCameraOutput>>,
) {
    for (target, msaa) in &views {
        composite.specialize(&pipeline_cache, target.main_texture_format(), msaa.samples());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_params_fill_whole_uniform_rows() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 208);
        assert_eq!(std::mem::size_of::<KernelParams>() % 16, 0);
    }

    #[test]
    fn kernel_entry_points_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for kernel in SplatKernel::ALL {
            assert!(seen.insert(kernel.entry_point()), "{:?}", kernel);
        }
    }

    #[test]
    fn data_kernels_share_the_splat_data_prefix() {
        let defs = SplatKernel::CalcViewData.shader_defs();
        assert_eq!(defs.len(), 2);
        assert!(matches!(&defs[0], ShaderDefVal::Bool(name, true) if name == "SPLAT_DATA"));
        assert!(matches!(&defs[1], ShaderDefVal::Bool(name, true) if name == "CALC_VIEW_DATA"));
        assert!(matches!(
            &SplatKernel::ScaleSelection.shader_defs()[0],
            ShaderDefVal::Bool(name, true) if name == "SPLAT_TRANSFORM"
        ));
        assert_eq!(SplatKernel::RadixSpine.shader_defs().len(), 1);
        assert_eq!(SplatKernel::CopySplats.bindings().len(), 9);
        assert!(!SplatKernel::CopySplats.bindings().starts_with(&SPLAT_DATA));
    }

    #[test]
    fn radix_labels_have_no_prefix() {
        assert_eq!(SplatKernel::RadixUpsweep.label(), "radix_upsweep");
        assert_eq!(SplatKernel::CalcDistances.label(), "gaussian_splat_calc_distances");
    }
}
