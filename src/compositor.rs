//! Residual refinement: add a rescaled residual image onto one reconstructed
//! Z-layer of the volume, in place.

use std::sync::Arc;

use log::trace;
use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use crate::decoder::SampleImage;
use crate::enums::Phase;
use crate::error::StreamError;
use crate::gpu::{GpuContext, SAMPLE_FORMAT, StagingSlot, dispatch_size};
use crate::reconstructor::layer_samples;
use crate::volume::{GpuVolume, SliceOrder, VolumeStorage, VolumeTexture};

const SHADER: &str = include_str!("shaders/composite_slice.wgsl");

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    low: f32,
    high: f32,
    slice_coord: f32,
    _pad0: f32,
    width: u32,
    height: u32,
    _pad1: [u32; 2],
}

pub struct ResidualSliceCompositor {
    volume: VolumeTexture,
    order: SliceOrder,
    pass: Option<CompositePass>,
}

impl ResidualSliceCompositor {
    /// Fails unless every base layer of `volume` has been reconstructed.
    pub fn new(volume: &VolumeTexture) -> Result<Self, StreamError> {
        let depth = volume.descriptor().depth();
        if !volume.is_base_complete() {
            return Err(StreamError::BaseIncomplete {
                completed: volume.progress().base_completed(),
                depth,
            });
        }

        let pass = match &volume.storage {
            VolumeStorage::Cpu(_) => None,
            VolumeStorage::Gpu(gpu) => {
                Some(CompositePass::new(gpu, volume.descriptor().layer_size()))
            }
        };
        Ok(Self {
            volume: volume.clone(),
            order: SliceOrder::new(Phase::Residual, depth),
            pass,
        })
    }

    pub fn next_slice(&self) -> u32 {
        self.order.next()
    }

    /// Replace layer `slice` with `volume + residual * (high - low) + low`.
    ///
    /// The volume is sampled at the slice's normalized depth
    /// `(slice + 0.5) / depth`. Slices must arrive as 0, 1, 2, ...
    pub fn composite(
        &mut self,
        residual: &SampleImage,
        slice: u32,
        low: f32,
        high: f32,
    ) -> Result<(), StreamError> {
        let samples = layer_samples(&self.volume, residual)?;
        self.order.check(slice)?;
        let slice_coord = self.volume.descriptor().slice_coord(slice);

        match &mut self.pass {
            None => {
                self.volume
                    .with_cpu_layer_mut(slice, |layer| accumulate_into(layer, samples, low, high));
            }
            Some(pass) => pass.run(residual, slice, slice_coord, low, high)?,
        }
        trace!("residual slice {slice} submitted (range {low}..{high}, depth {slice_coord})");

        self.volume.mark_refined_layer(slice);
        self.order.advance();
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<(), StreamError> {
        match &self.pass {
            Some(pass) => pass.staging.wait(&pass.ctx),
            None => Ok(()),
        }
    }
}

pub(crate) fn accumulate_into(
    mut layer: ArrayViewMut2<'_, f32>,
    residual: ArrayView2<'_, f32>,
    low: f32,
    high: f32,
) {
    let scale = high - low;
    Zip::from(&mut layer)
        .and(&residual)
        .par_for_each(|out, &r| *out += r * scale + low);
}

struct CompositePass {
    ctx: Arc<GpuContext>,
    volume_texture: wgpu::Texture,
    residual: wgpu::Texture,
    output: wgpu::Texture,
    uniforms: wgpu::Buffer,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    staging: StagingSlot,
    size: (u32, u32),
}

impl CompositePass {
    fn new(gpu: &GpuVolume, (width, height): (u32, u32)) -> Self {
        let ctx = gpu.ctx.clone();

        let residual = ctx.create_slice_texture(
            "Residual Slice Texture",
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let output = ctx.create_slice_texture(
            "Residual Output Texture",
            width,
            height,
            wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
        );
        let uniforms = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Residual Slice Uniforms"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampled = |binding: u32, view_dimension: wgpu::TextureViewDimension| {
            wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension,
                    multisampled: false,
                },
                count: None,
            }
        };
        let layout = ctx.bind_group_layout(
            "composite_slice",
            &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
                sampled(2, wgpu::TextureViewDimension::D2),
                sampled(3, wgpu::TextureViewDimension::D3),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: SAMPLE_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        );
        let pipeline = ctx.compute_pipeline("composite_slice", SHADER, &layout);

        let sampler = ctx.nearest_sampler();
        let residual_view = residual.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Residual Slice Bind Group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&residual_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&gpu.view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
            ],
        });

        Self {
            ctx,
            volume_texture: gpu.texture.clone(),
            residual,
            output,
            uniforms,
            pipeline,
            bind_group,
            staging: StagingSlot::new("residual slice staging"),
            size: (width, height),
        }
    }

    fn run(
        &mut self,
        residual: &SampleImage,
        slice: u32,
        slice_coord: f32,
        low: f32,
        high: f32,
    ) -> Result<(), StreamError> {
        let (width, height) = self.size;
        self.staging.begin_write()?;

        let uniforms = Uniforms {
            low,
            high,
            slice_coord,
            _pad0: 0.0,
            width,
            height,
            _pad1: [0; 2],
        };
        self.ctx
            .queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));
        self.ctx.write_samples(&self.residual, residual);

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Residual Slice Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Residual Slice Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &self.bind_group, &[]);
            let (dispatch_x, dispatch_y) = dispatch_size(width, height);
            compute_pass.dispatch_workgroups(dispatch_x, dispatch_y, 1);
        }
        // the pass above reads this layer; the copy is ordered after it
        encoder.copy_texture_to_texture(
            self.output.as_image_copy(),
            wgpu::TexelCopyTextureInfo {
                texture: &self.volume_texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: slice,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        let submission = self.ctx.queue.submit(Some(encoder.finish()));
        self.staging.mark_submitted(submission);
        Ok(())
    }
}
