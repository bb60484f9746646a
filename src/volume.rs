use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::{Array2, Array3, ArrayViewMut2, Axis, s};

use crate::enums::{Phase, Processor};
use crate::error::StreamError;
use crate::gpu::{GpuContext, SAMPLE_FORMAT, aligned_bytes_per_row};
use crate::snapshot::VolumeSnapshot;

/// Volume geometry and base value range, parsed from the base stream header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeDescriptor {
    /// Voxel counts (x, y, z).
    pub dims: (u32, u32, u32),
    /// Physical voxel size (x, y, z).
    pub spacing: (f32, f32, f32),
    /// Global (low, high) of the base layer.
    pub base_range: (f32, f32),
}

impl VolumeDescriptor {
    pub fn depth(&self) -> u32 {
        self.dims.2
    }

    pub fn layer_size(&self) -> (u32, u32) {
        (self.dims.0, self.dims.1)
    }

    /// Normalized depth coordinate of the centre of `slice`.
    pub fn slice_coord(&self, slice: u32) -> f32 {
        (slice as f32 + 0.5) / self.dims.2 as f32
    }
}

/// Counts of layers that passes have been submitted for.
#[derive(Debug, Default)]
pub struct LayerProgress {
    base: AtomicU32,
    refined: AtomicU32,
}

impl LayerProgress {
    pub fn base_completed(&self) -> u32 {
        self.base.load(Ordering::Acquire)
    }

    pub fn refined(&self) -> u32 {
        self.refined.load(Ordering::Acquire)
    }
}

/// Rejects slices that are out of range or not in strictly increasing order
/// starting at 0.
#[derive(Debug)]
pub struct SliceOrder {
    phase: Phase,
    next: u32,
    depth: u32,
}

impl SliceOrder {
    pub fn new(phase: Phase, depth: u32) -> Self {
        Self {
            phase,
            next: 0,
            depth,
        }
    }

    pub fn check(&self, slice: u32) -> Result<(), StreamError> {
        if slice >= self.depth {
            return Err(StreamError::SliceOutOfRange {
                slice,
                depth: self.depth,
            });
        }
        if slice != self.next {
            return Err(StreamError::OutOfOrder {
                phase: self.phase,
                expected: self.next,
                got: slice,
            });
        }
        Ok(())
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }

    pub fn next(&self) -> u32 {
        self.next
    }
}

#[derive(Clone)]
pub struct GpuVolume {
    pub(crate) ctx: Arc<GpuContext>,
    pub(crate) texture: wgpu::Texture,
    pub(crate) view: wgpu::TextureView,
}

#[derive(Clone)]
pub(crate) enum VolumeStorage {
    Cpu(Arc<RwLock<Array3<f32>>>),
    Gpu(GpuVolume),
}

/// The 3D scalar field being assembled.
///
/// Clones share the same storage. Only the reconstructor and the compositor
/// write to it, one layer at a time; everything public here is read-only and
/// limited to layers covered by reported progress.
#[derive(Clone)]
pub struct VolumeTexture {
    descriptor: VolumeDescriptor,
    pub(crate) storage: VolumeStorage,
    progress: Arc<LayerProgress>,
}

impl VolumeTexture {
    pub fn new(processor: &Processor, descriptor: VolumeDescriptor) -> Result<Self, StreamError> {
        let (width, height, depth) = descriptor.dims;
        let storage = match processor {
            Processor::CPU => VolumeStorage::Cpu(Arc::new(RwLock::new(Array3::zeros((
                depth as usize,
                height as usize,
                width as usize,
            ))))),
            Processor::GPU(ctx) => {
                let max = ctx.device.limits().max_texture_dimension_3d;
                if width.max(height).max(depth) > max {
                    return Err(StreamError::Gpu(format!(
                        "volume {width}x{height}x{depth} exceeds the 3D texture limit of {max}"
                    )));
                }
                let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("Volume 3D Texture"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: depth,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D3,
                    format: SAMPLE_FORMAT,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                VolumeStorage::Gpu(GpuVolume {
                    ctx: ctx.clone(),
                    texture,
                    view,
                })
            }
        };

        Ok(Self {
            descriptor,
            storage,
            progress: Arc::new(LayerProgress::default()),
        })
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    pub fn progress(&self) -> &LayerProgress {
        &self.progress
    }

    pub fn is_base_complete(&self) -> bool {
        self.progress.base_completed() == self.descriptor.depth()
    }

    /// The 3D texture, for viewers sampling on the GPU.
    pub fn gpu_view(&self) -> Option<&wgpu::TextureView> {
        match &self.storage {
            VolumeStorage::Gpu(gpu) => Some(&gpu.view),
            VolumeStorage::Cpu(_) => None,
        }
    }

    pub(crate) fn mark_base_layer(&self, slice: u32) {
        self.progress.base.store(slice + 1, Ordering::Release);
    }

    pub(crate) fn mark_refined_layer(&self, slice: u32) {
        self.progress.refined.store(slice + 1, Ordering::Release);
    }

    pub(crate) fn with_cpu_layer_mut<R>(
        &self,
        slice: u32,
        f: impl FnOnce(ArrayViewMut2<'_, f32>) -> R,
    ) -> Option<R> {
        match &self.storage {
            VolumeStorage::Cpu(data) => {
                let mut data = data.write().unwrap_or_else(PoisonError::into_inner);
                Some(f(data.index_axis_mut(Axis(0), slice as usize)))
            }
            VolumeStorage::Gpu(_) => None,
        }
    }

    /// Read one Z-layer, or `None` if it has not been reconstructed yet.
    pub async fn read_layer(&self, slice: u32) -> Result<Option<Array2<f32>>, StreamError> {
        if slice >= self.progress.base_completed() {
            return Ok(None);
        }
        let layers = self.read_layers(slice, 1).await?;
        Ok(Some(layers.index_axis_move(Axis(0), 0)))
    }

    /// Copy every reconstructed layer to the host.
    pub async fn snapshot(&self) -> Result<VolumeSnapshot, StreamError> {
        let layers = self.progress.base_completed();
        let data = self.read_layers(0, layers).await?;
        Ok(VolumeSnapshot::new(self.descriptor, data))
    }

    async fn read_layers(&self, first: u32, count: u32) -> Result<Array3<f32>, StreamError> {
        let (width, height, _) = self.descriptor.dims;
        if count == 0 {
            return Ok(Array3::zeros((0, height as usize, width as usize)));
        }
        match &self.storage {
            VolumeStorage::Cpu(data) => {
                let data = data.read().unwrap_or_else(PoisonError::into_inner);
                let (first, end) = (first as usize, (first + count) as usize);
                Ok(data.slice(s![first..end, .., ..]).to_owned())
            }
            VolumeStorage::Gpu(gpu) => gpu.read_layers(first, count, width, height).await,
        }
    }
}

impl fmt::Debug for VolumeTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.storage {
            VolumeStorage::Cpu(_) => "CPU",
            VolumeStorage::Gpu(_) => "GPU",
        };
        f.debug_struct("VolumeTexture")
            .field("descriptor", &self.descriptor)
            .field("progress", &self.progress)
            .field("backend", &backend)
            .finish()
    }
}

impl GpuVolume {
    async fn read_layers(
        &self,
        first: u32,
        count: u32,
        width: u32,
        height: u32,
    ) -> Result<Array3<f32>, StreamError> {
        let bytes_per_row = aligned_bytes_per_row(width);
        let size = bytes_per_row as u64 * height as u64 * count as u64;
        let readback = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Volume Readback Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Volume Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: first,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: count,
            },
        );
        self.ctx.queue.submit(Some(encoder.finish()));

        let buffer_slice = readback.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.ctx.drain()?;
        receiver
            .await
            .map_err(|_| StreamError::Gpu("readback mapping was dropped".into()))??;

        let mapped = buffer_slice.get_mapped_range();
        let row_len = width as usize * std::mem::size_of::<f32>();
        let mut samples = Vec::with_capacity((width * height * count) as usize);
        for row in mapped.chunks_exact(bytes_per_row as usize) {
            samples.extend(
                row[..row_len]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        }
        drop(mapped);
        readback.unmap();

        Array3::from_shape_vec((count as usize, height as usize, width as usize), samples)
            .map_err(|e| StreamError::Gpu(format!("readback shape: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> VolumeDescriptor {
        VolumeDescriptor {
            dims: (3, 2, 4),
            spacing: (1.0, 1.0, 2.0),
            base_range: (0.0, 1.0),
        }
    }

    #[test]
    fn slice_order_accepts_only_the_next_slice() {
        let mut order = SliceOrder::new(Phase::Base, 3);
        order.check(0).unwrap();
        order.advance();
        assert!(matches!(
            order.check(2),
            Err(StreamError::OutOfOrder {
                expected: 1,
                got: 2,
                ..
            })
        ));
        assert!(matches!(
            order.check(0),
            Err(StreamError::OutOfOrder { .. })
        ));
        assert!(matches!(
            order.check(3),
            Err(StreamError::SliceOutOfRange { slice: 3, depth: 3 })
        ));
        order.check(1).unwrap();
    }

    #[test]
    fn slice_coord_is_layer_centre() {
        let d = descriptor();
        assert_eq!(d.slice_coord(0), 0.125);
        assert_eq!(d.slice_coord(3), 0.875);
    }

    #[tokio::test]
    async fn unreconstructed_layers_are_not_readable() {
        let volume = VolumeTexture::new(&Processor::CPU, descriptor()).unwrap();
        assert!(volume.read_layer(0).await.unwrap().is_none());

        volume.with_cpu_layer_mut(0, |mut layer| layer.fill(7.0));
        volume.mark_base_layer(0);

        let layer = volume.read_layer(0).await.unwrap().unwrap();
        assert_eq!(layer.dim(), (2, 3));
        assert!(layer.iter().all(|&v| v == 7.0));
        assert!(volume.read_layer(1).await.unwrap().is_none());

        let snapshot = volume.snapshot().await.unwrap();
        assert_eq!(snapshot.dim(), (1, 2, 3));
        assert!(!snapshot.is_complete());
        assert!(!volume.is_base_complete());
    }
}
