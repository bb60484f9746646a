//! GPU context shared by every pass.
//!
//! The context is created once and handed to each component explicitly.
//! Derived objects that are identical across passes (bind group layouts,
//! samplers, pipelines) are cached on it under a stable key.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::info;
use wgpu::PollType;

use crate::decoder::SampleImage;
use crate::error::StreamError;

pub const WORKGROUP_SIZE: u32 = 8;

/// Format of the volume and of every staging texture.
pub const SAMPLE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    adapter_name: String,
    layouts: Mutex<HashMap<&'static str, wgpu::BindGroupLayout>>,
    samplers: Mutex<HashMap<&'static str, wgpu::Sampler>>,
    pipelines: Mutex<HashMap<&'static str, wgpu::ComputePipeline>>,
}

fn cached<T: Clone>(
    cache: &Mutex<HashMap<&'static str, T>>,
    key: &'static str,
    create: impl FnOnce() -> T,
) -> T {
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    cache.entry(key).or_insert_with(create).clone()
}

impl GpuContext {
    pub async fn new() -> Result<Self, StreamError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await?;
        let adapter_name = adapter.get_info().name;
        info!("GPU adapter: {adapter_name}");

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("volume-stream device"),
                ..Default::default()
            })
            .await?;

        Ok(Self::from_device(device, queue, adapter_name))
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, adapter_name: String) -> Self {
        Self {
            device,
            queue,
            adapter_name,
            layouts: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn bind_group_layout(
        &self,
        key: &'static str,
        entries: &[wgpu::BindGroupLayoutEntry],
    ) -> wgpu::BindGroupLayout {
        cached(&self.layouts, key, || {
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(key),
                    entries,
                })
        })
    }

    /// Nearest, clamped sampler; sample textures here are not filterable.
    pub fn nearest_sampler(&self) -> wgpu::Sampler {
        cached(&self.samplers, "nearest", || {
            self.device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("Nearest Sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Nearest,
                min_filter: wgpu::FilterMode::Nearest,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        })
    }

    pub fn compute_pipeline(
        &self,
        key: &'static str,
        shader_source: &'static str,
        layout: &wgpu::BindGroupLayout,
    ) -> wgpu::ComputePipeline {
        cached(&self.pipelines, key, || {
            let shader = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(key),
                    source: wgpu::ShaderSource::Wgsl(shader_source.into()),
                });
            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some(key),
                        bind_group_layouts: &[layout],
                        push_constant_ranges: &[],
                    });
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(key),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some("main"),
                    compilation_options: Default::default(),
                    cache: None,
                })
        })
    }

    /// A single-layer texture matching one volume slice.
    pub fn create_slice_texture(
        &self,
        label: &'static str,
        width: u32,
        height: u32,
        usage: wgpu::TextureUsages,
    ) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SAMPLE_FORMAT,
            usage,
            view_formats: &[],
        })
    }

    /// Queue an upload of `image` into a slice texture of the same size.
    pub fn write_samples(&self, texture: &wgpu::Texture, image: &SampleImage) {
        let (width, height) = image.dimensions();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(image.as_raw()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * std::mem::size_of::<f32>() as u32),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    pub fn wait_for(&self, submission: wgpu::SubmissionIndex) -> Result<(), StreamError> {
        self.device.poll(PollType::Wait {
            submission_index: Some(submission),
            timeout: None,
        })?;
        Ok(())
    }

    /// Block until every submitted command buffer has executed.
    pub fn drain(&self) -> Result<(), StreamError> {
        self.device.poll(PollType::Wait {
            submission_index: None,
            timeout: None,
        })?;
        Ok(())
    }
}

pub fn dispatch_size(width: u32, height: u32) -> (u32, u32) {
    (
        width.div_ceil(WORKGROUP_SIZE),
        height.div_ceil(WORKGROUP_SIZE),
    )
}

/// Row pitch for texture-to-buffer copies.
pub fn aligned_bytes_per_row(width: u32) -> u32 {
    let unaligned = width * std::mem::size_of::<f32>() as u32;
    unaligned.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

#[derive(Debug)]
enum StagingState {
    Idle,
    Written,
    Submitted(wgpu::SubmissionIndex),
}

/// Reuse marker for a single-buffered staging resource.
///
/// Staging textures are overwritten once per slice. Writes go through the
/// queue, so a write for slice `n + 1` is safe once the commands reading
/// slice `n` have been submitted. The slot refuses a second write while the
/// previous one has not been submitted yet.
#[derive(Debug)]
pub struct StagingSlot {
    label: &'static str,
    state: StagingState,
}

impl StagingSlot {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: StagingState::Idle,
        }
    }

    pub fn begin_write(&mut self) -> Result<(), StreamError> {
        if self.is_pending() {
            return Err(StreamError::StagingBusy(self.label));
        }
        self.state = StagingState::Written;
        Ok(())
    }

    pub fn mark_submitted(&mut self, submission: wgpu::SubmissionIndex) {
        self.state = StagingState::Submitted(submission);
    }

    /// Forget a write that never reached the queue.
    pub fn abandon(&mut self) {
        if let StagingState::Written = self.state {
            self.state = StagingState::Idle;
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, StagingState::Written)
    }

    /// Wait for the last submission that used this slot.
    pub fn wait(&self, ctx: &GpuContext) -> Result<(), StreamError> {
        match &self.state {
            StagingState::Submitted(submission) => ctx.wait_for(submission.clone()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_write_before_submit_is_refused() {
        let mut slot = StagingSlot::new("test staging");
        slot.begin_write().unwrap();
        assert!(slot.is_pending());
        assert!(matches!(
            slot.begin_write(),
            Err(StreamError::StagingBusy("test staging"))
        ));
        slot.abandon();
        slot.begin_write().unwrap();
    }

    #[test]
    fn row_pitch_is_copy_aligned() {
        assert_eq!(aligned_bytes_per_row(1), 256);
        assert_eq!(aligned_bytes_per_row(64), 256);
        assert_eq!(aligned_bytes_per_row(65), 512);
    }

    #[test]
    fn dispatch_covers_partial_workgroups() {
        assert_eq!(dispatch_size(8, 8), (1, 1));
        assert_eq!(dispatch_size(9, 17), (2, 3));
    }
}
