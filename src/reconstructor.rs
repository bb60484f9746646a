//! Base layer reconstruction: rescale a decoded picture by its slice range
//! and write it into one Z-layer of the volume.

use std::sync::Arc;

use log::trace;
use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use crate::decoder::SampleImage;
use crate::enums::Phase;
use crate::error::StreamError;
use crate::gpu::{GpuContext, SAMPLE_FORMAT, StagingSlot, dispatch_size};
use crate::volume::{GpuVolume, SliceOrder, VolumeStorage, VolumeTexture};

const SHADER: &str = include_str!("shaders/reconstruct_slice.wgsl");

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    low: f32,
    high: f32,
    width: u32,
    height: u32,
}

pub struct BaseSliceReconstructor {
    volume: VolumeTexture,
    order: SliceOrder,
    pass: Option<ReconstructPass>,
}

impl BaseSliceReconstructor {
    pub fn new(volume: &VolumeTexture) -> Self {
        let pass = match &volume.storage {
            VolumeStorage::Cpu(_) => None,
            VolumeStorage::Gpu(gpu) => {
                Some(ReconstructPass::new(gpu, volume.descriptor().layer_size()))
            }
        };
        Self {
            volume: volume.clone(),
            order: SliceOrder::new(Phase::Base, volume.descriptor().depth()),
            pass,
        }
    }

    /// Slice the next call must target.
    pub fn next_slice(&self) -> u32 {
        self.order.next()
    }

    /// Write `picture * (high - low) + low` into layer `slice`.
    ///
    /// Slices must arrive as 0, 1, 2, ... On the GPU path the work is
    /// submitted, not necessarily finished, when this returns.
    pub fn reconstruct(
        &mut self,
        picture: &SampleImage,
        slice: u32,
        low: f32,
        high: f32,
    ) -> Result<(), StreamError> {
        let samples = layer_samples(&self.volume, picture)?;
        self.order.check(slice)?;

        match &mut self.pass {
            None => {
                self.volume
                    .with_cpu_layer_mut(slice, |layer| rescale_into(layer, samples, low, high));
            }
            Some(pass) => pass.run(picture, slice, low, high)?,
        }
        trace!("base slice {slice} submitted (range {low}..{high})");

        self.volume.mark_base_layer(slice);
        self.order.advance();
        Ok(())
    }

    /// Wait until the GPU has executed every submitted slice.
    pub fn wait_idle(&self) -> Result<(), StreamError> {
        match &self.pass {
            Some(pass) => pass.staging.wait(&pass.ctx),
            None => Ok(()),
        }
    }
}

/// View `image` as a volume layer, checking its size.
pub(crate) fn layer_samples<'a>(
    volume: &VolumeTexture,
    image: &'a SampleImage,
) -> Result<ArrayView2<'a, f32>, StreamError> {
    let expected = volume.descriptor().layer_size();
    let got = image.dimensions();
    if got != expected {
        return Err(StreamError::PictureSize { expected, got });
    }
    ArrayView2::from_shape((got.1 as usize, got.0 as usize), image.as_raw().as_slice())
        .map_err(|e| StreamError::Decode(format!("picture buffer: {e}")))
}

pub(crate) fn rescale_into(
    mut layer: ArrayViewMut2<'_, f32>,
    samples: ArrayView2<'_, f32>,
    low: f32,
    high: f32,
) {
    let scale = high - low;
    Zip::from(&mut layer)
        .and(&samples)
        .par_for_each(|out, &v| *out = v * scale + low);
}

struct ReconstructPass {
    ctx: Arc<GpuContext>,
    volume_texture: wgpu::Texture,
    picture: wgpu::Texture,
    output: wgpu::Texture,
    uniforms: wgpu::Buffer,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    staging: StagingSlot,
    size: (u32, u32),
}

impl ReconstructPass {
    fn new(gpu: &GpuVolume, (width, height): (u32, u32)) -> Self {
        let ctx = gpu.ctx.clone();
        let volume_texture = gpu.texture.clone();

        let picture = ctx.create_slice_texture(
            "Base Picture Texture",
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let output = ctx.create_slice_texture(
            "Base Slice Output Texture",
            width,
            height,
            wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
        );
        let uniforms = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Base Slice Uniforms"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let layout = ctx.bind_group_layout(
            "reconstruct_slice",
            &[
                // Uniforms
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
                // Decoded picture
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Rescaled slice
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
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
        let pipeline = ctx.compute_pipeline("reconstruct_slice", SHADER, &layout);

        let picture_view = picture.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Base Slice Bind Group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&picture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
            ],
        });

        Self {
            ctx,
            volume_texture,
            picture,
            output,
            uniforms,
            pipeline,
            bind_group,
            staging: StagingSlot::new("base slice staging"),
            size: (width, height),
        }
    }

    fn run(
        &mut self,
        picture: &SampleImage,
        slice: u32,
        low: f32,
        high: f32,
    ) -> Result<(), StreamError> {
        let (width, height) = self.size;
        self.staging.begin_write()?;

        let uniforms = Uniforms {
            low,
            high,
            width,
            height,
        };
        self.ctx
            .queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));
        self.ctx.write_samples(&self.picture, picture);

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Base Slice Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Base Slice Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &self.bind_group, &[]);
            let (dispatch_x, dispatch_y) = dispatch_size(width, height);
            compute_pass.dispatch_workgroups(dispatch_x, dispatch_y, 1);
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Processor;
    use crate::volume::VolumeDescriptor;
    use image::{ImageBuffer, Luma};

    fn volume() -> VolumeTexture {
        VolumeTexture::new(
            &Processor::CPU,
            VolumeDescriptor {
                dims: (3, 2, 3),
                spacing: (1.0, 1.0, 1.0),
                base_range: (-1000.0, 3000.0),
            },
        )
        .unwrap()
    }

    fn picture(value: f32) -> SampleImage {
        ImageBuffer::from_pixel(3, 2, Luma([value]))
    }

    #[tokio::test]
    async fn boundary_samples_map_to_range_ends() {
        let volume = volume();
        let mut reconstructor = BaseSliceReconstructor::new(&volume);
        reconstructor
            .reconstruct(&picture(0.0), 0, -1000.0, 3000.0)
            .unwrap();
        reconstructor
            .reconstruct(&picture(1.0), 1, -1000.0, 3000.0)
            .unwrap();
        reconstructor
            .reconstruct(&picture(0.25), 2, -1000.0, 3000.0)
            .unwrap();

        let expected = [-1000.0, 3000.0, 0.0];
        for (slice, want) in expected.into_iter().enumerate() {
            let layer = volume.read_layer(slice as u32).await.unwrap().unwrap();
            assert!(layer.iter().all(|&v| (v - want).abs() < 1e-3), "{layer}");
        }
        assert!(volume.is_base_complete());
    }

    #[test]
    fn reconstruction_is_pointwise_linear() {
        let volume = volume();
        let mut reconstructor = BaseSliceReconstructor::new(&volume);
        let gradient = ImageBuffer::from_fn(3, 2, |x, y| Luma([(x + 3 * y) as f32 / 5.0]));
        reconstructor.reconstruct(&gradient, 0, 10.0, 20.0).unwrap();

        volume.with_cpu_layer_mut(0, |layer| {
            for ((y, x), &v) in layer.indexed_iter() {
                let input = (x + 3 * y) as f32 / 5.0;
                assert!((v - (input * 10.0 + 10.0)).abs() < 1e-5);
            }
        });
    }

    #[test]
    fn out_of_order_slice_is_rejected() {
        let volume = volume();
        let mut reconstructor = BaseSliceReconstructor::new(&volume);
        let err = reconstructor
            .reconstruct(&picture(0.5), 1, 0.0, 1.0)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::OutOfOrder {
                phase: Phase::Base,
                expected: 0,
                got: 1
            }
        ));
        assert_eq!(volume.progress().base_completed(), 0);
        assert_eq!(reconstructor.next_slice(), 0);
    }

    #[test]
    fn wrong_picture_size_is_rejected() {
        let volume = volume();
        let mut reconstructor = BaseSliceReconstructor::new(&volume);
        let small = ImageBuffer::from_pixel(2, 2, Luma([0.0f32]));
        assert!(matches!(
            reconstructor.reconstruct(&small, 0, 0.0, 1.0),
            Err(StreamError::PictureSize {
                expected: (3, 2),
                got: (2, 2)
            })
        ));
    }
}
