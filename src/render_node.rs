// Render graph node replaying each camera's splat frame
//
// The coordinator records a camera's compute dispatches, draws into the
// offscreen target and the final composite in the main world. This node runs
// between the main pass and post processing, replays those commands onto the
// render context's encoder and blends the offscreen target onto the view
// target with the composite pipeline.

use bevy::prelude::*;
use bevy::render::{
    render_graph::{NodeRunError, RenderGraphContext, RenderLabel, ViewNode},
    render_resource::*,
    renderer::{RenderContext, RenderDevice},
    view::{Msaa, ViewTarget},
};

use crate::coordinator::SplatCameraOutput;
use crate::error::SplatResult;
use crate::gpu::{self, DrawPipelineSource, FrameCompositor};
use crate::gpu_pipelines::{CachedKernels, SplatCompositePipeline, SplatDrawPipelines, SplatKernelPipelines};
use crate::render_pipeline::SplatMaterialKind;

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct SplatCompositeLabel;

/// Draw pipelines looked up through the pipeline cache
pub struct CachedDraws<'a> {
    pub pipelines: &'a SplatDrawPipelines,
    pub cache: &'a PipelineCache,
}

impl DrawPipelineSource for CachedDraws<'_> {
    fn draw_pipeline(&self, kind: SplatMaterialKind) -> Option<&RenderPipeline> {
        let id = *self.pipelines.ids.get(&kind)?;
        self.cache.get_render_pipeline(id)
    }
}

/// Fullscreen blend of the offscreen target onto one view target
struct ViewCompositor<'a> {
    render_device: &'a RenderDevice,
    composite: &'a SplatCompositePipeline,
    pipeline: &'a RenderPipeline,
    target: &'a ViewTarget,
}

impl FrameCompositor for ViewCompositor<'_> {
    fn composite(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        source: &TextureView,
    ) -> SplatResult<()> {
        let bind_group = self.render_device.create_bind_group(
            "gaussian_splat_composite_bind_group",
            &self.composite.layout,
            &BindGroupEntries::sequential((source, &self.composite.sampler)),
        );

        let mut color_attachment = self.target.get_color_attachment();
        color_attachment.ops = Operations {
            load: LoadOp::Load,
            store: StoreOp::Store,
        };
        let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("gaussian_splat_composite_pass"),
            color_attachments: &[Some(color_attachment)],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1); // Fullscreen triangle
        Ok(())
    }
}

#[derive(Default)]
pub struct SplatCompositeNode;

impl ViewNode for SplatCompositeNode {
    type ViewQuery = (
        &'static ViewTarget,
        &'static Msaa,
        &'static SplatCameraOutput,
    );

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (target, msaa, output): bevy::ecs::query::QueryItem<'w, 'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let commands = output.frame.commands();
        if commands.is_empty() {
            return Ok(());
        }

        let Some(pipeline_cache) = world.get_resource::<PipelineCache>() else {
            warn!("SplatCompositeNode: PipelineCache not found");
            return Ok(());
        };
        let (Some(kernels), Some(draws), Some(composite)) = (
            world.get_resource::<SplatKernelPipelines>(),
            world.get_resource::<SplatDrawPipelines>(),
            world.get_resource::<SplatCompositePipeline>(),
        ) else {
            warn!("SplatCompositeNode: splat pipelines not initialized");
            return Ok(());
        };

        let kernels = CachedKernels {
            pipelines: kernels,
            cache: pipeline_cache,
        };
        let draws = CachedDraws {
            pipelines: draws,
            cache: pipeline_cache,
        };
        if let Err(e) = gpu::check_pipelines_ready(commands, &kernels, Some(&draws)) {
            debug!("Skipping splat frame: {}", e);
            return Ok(());
        }

        let format = target.main_texture_format();
        let Some(pipeline) = composite
            .ids
            .get(&(format, msaa.samples()))
            .and_then(|id| pipeline_cache.get_render_pipeline(*id))
        else {
            debug!("Splat composite pipeline for {:?} not ready", format);
            return Ok(());
        };

        let mut compositor = ViewCompositor {
            render_device: world.resource::<RenderDevice>(),
            composite,
            pipeline,
            target,
        };
        if let Err(e) = gpu::record_device_commands(
            render_context.command_encoder(),
            commands,
            &kernels,
            Some(&draws),
            Some(&mut compositor),
        ) {
            warn!("Splat frame replay failed: {}", e);
        }
        Ok(())
    }
}
