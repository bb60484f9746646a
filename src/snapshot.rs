use image::{GrayImage, ImageBuffer};
use ndarray::{Array3, ArrayView2, s};
use rayon::prelude::*;

use crate::enums::{Interpolation, Orientation};
use crate::volume::VolumeDescriptor;

/// Display window: `v` maps to `clamp((v - center) / width + 0.5, 0, 1)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Window {
    pub width: f32,
    pub center: f32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 4096.0,
            center: 2048.0,
        }
    }
}

impl Window {
    #[inline]
    pub fn apply(&self, value: f32) -> u8 {
        let normalized = ((value - self.center) / self.width + 0.5).clamp(0.0, 1.0);
        (normalized * 255.0).round() as u8
    }
}

/// Host copy of the reconstructed layers of a volume.
pub struct VolumeSnapshot {
    pub descriptor: VolumeDescriptor,
    /// (layers, height, width); may hold fewer layers than `dims.z`.
    pub data: Array3<f32>,
}

impl VolumeSnapshot {
    pub fn new(descriptor: VolumeDescriptor, data: Array3<f32>) -> Self {
        Self { descriptor, data }
    }

    /// Dimensions of the copied data (layers, height, width).
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn is_complete(&self) -> bool {
        self.data.dim().0 == self.descriptor.depth() as usize
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        let (depth, height, width) = self.data.dim();
        let view = match orientation {
            Orientation::Axial if index < depth => self.data.slice(s![index, .., ..]),
            Orientation::Coronal if index < height => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal if index < width => self.data.slice(s![.., .., index]),
            _ => return None,
        };
        Some(view)
    }

    /// Render one orthogonal slice through `window` as an 8-bit image.
    pub fn render_slice(
        &self,
        index: usize,
        orientation: Orientation,
        window: Window,
        interpolation: Interpolation,
    ) -> Option<GrayImage> {
        let slice = self.get_slice_from_axis(index, orientation)?;
        if slice.is_empty() {
            return None;
        }

        match (interpolation, orientation) {
            (Interpolation::None, _) | (_, Orientation::Axial) => {
                let (height, width) = slice.dim();
                let pixels: Vec<u8> = slice.iter().map(|&v| window.apply(v)).collect();
                ImageBuffer::from_raw(width as u32, height as u32, pixels)
            }
            (Interpolation::Bilinear, _) => {
                let (width, height) = self.isotropic_size(orientation);
                resample(&slice, width, height, window)
            }
        }
    }

    /// Output (width, height) of a slice at physical aspect ratio. Falls back
    /// to voxel counts when the spacing is not positive and finite.
    fn isotropic_size(&self, orientation: Orientation) -> (u32, u32) {
        let (layers, height, width) = self.data.dim();
        let (sx, sy, sz) = self.descriptor.spacing;
        let valid = [sx, sy, sz].iter().all(|s| s.is_finite() && *s > 0.0);
        let (sx, sy, sz) = if valid { (sx, sy, sz) } else { (1.0, 1.0, 1.0) };
        let min_spacing = sx.min(sy).min(sz);
        let scaled = |count: usize, spacing: f32| {
            ((count as f32 * spacing / min_spacing).round() as u32).max(1)
        };

        match orientation {
            Orientation::Axial => (width as u32, height as u32),
            Orientation::Coronal => (scaled(width, sx), scaled(layers, sz)),
            Orientation::Sagittal => (scaled(height, sy), scaled(layers, sz)),
        }
    }
}

fn resample(
    slice: &ArrayView2<'_, f32>,
    width: u32,
    height: u32,
    window: Window,
) -> Option<GrayImage> {
    let (slice_height, slice_width) = slice.dim();
    let pixels: Vec<u8> = (0..height)
        .into_par_iter()
        .flat_map_iter(|y| {
            (0..width).map(move |x| {
                // texel centres map onto texel centres
                let src_x = (x as f32 + 0.5) / width as f32 * slice_width as f32 - 0.5;
                let src_y = (y as f32 + 0.5) / height as f32 * slice_height as f32 - 0.5;
                let src_x = src_x.clamp(0.0, (slice_width - 1) as f32);
                let src_y = src_y.clamp(0.0, (slice_height - 1) as f32);
                window.apply(bilinear(slice, src_y, src_x))
            })
        })
        .collect();
    ImageBuffer::from_raw(width, height, pixels)
}

#[inline]
fn bilinear(slice: &ArrayView2<'_, f32>, y: f32, x: f32) -> f32 {
    let (height, width) = slice.dim();
    let (y0, x0) = (y.floor() as usize, x.floor() as usize);
    let (y1, x1) = ((y0 + 1).min(height - 1), (x0 + 1).min(width - 1));
    let (dy, dx) = (y - y0 as f32, x - x0 as f32);

    let top = slice[[y0, x0]].mul_add(1.0 - dx, slice[[y0, x1]] * dx);
    let bottom = slice[[y1, x0]].mul_add(1.0 - dx, slice[[y1, x1]] * dx);
    top.mul_add(1.0 - dy, bottom * dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn snapshot() -> VolumeSnapshot {
        let descriptor = VolumeDescriptor {
            dims: (4, 3, 2),
            spacing: (1.0, 1.0, 2.0),
            base_range: (0.0, 4096.0),
        };
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 1000 + y * 100 + x) as f32);
        VolumeSnapshot::new(descriptor, data)
    }

    #[test]
    fn window_maps_center_to_mid_gray() {
        let window = Window::default();
        assert_eq!(window.apply(2048.0), 128);
        assert_eq!(window.apply(0.0), 0);
        assert_eq!(window.apply(4096.0), 255);
        assert_eq!(window.apply(-500.0), 0);
        assert_eq!(window.apply(9000.0), 255);
    }

    #[test]
    fn orthogonal_slices_have_expected_shapes() {
        let snapshot = snapshot();
        let window = Window::default();
        let axial = snapshot
            .render_slice(1, Orientation::Axial, window, Interpolation::None)
            .unwrap();
        assert_eq!(axial.dimensions(), (4, 3));
        let coronal = snapshot
            .render_slice(0, Orientation::Coronal, window, Interpolation::None)
            .unwrap();
        assert_eq!(coronal.dimensions(), (4, 2));
        let sagittal = snapshot
            .render_slice(3, Orientation::Sagittal, window, Interpolation::None)
            .unwrap();
        assert_eq!(sagittal.dimensions(), (3, 2));
        assert!(
            snapshot
                .render_slice(4, Orientation::Sagittal, window, Interpolation::None)
                .is_none()
        );
    }

    #[test]
    fn bilinear_slices_follow_physical_aspect() {
        let snapshot = snapshot();
        let coronal = snapshot
            .render_slice(
                1,
                Orientation::Coronal,
                Window::default(),
                Interpolation::Bilinear,
            )
            .unwrap();
        // two layers of spacing 2 become four rows
        assert_eq!(coronal.dimensions(), (4, 4));
    }

    #[test]
    fn degenerate_spacing_keeps_voxel_counts() {
        let mut snapshot = snapshot();
        snapshot.descriptor.spacing = (0.0, 1.0, f32::NAN);
        let sagittal = snapshot
            .render_slice(
                1,
                Orientation::Sagittal,
                Window::default(),
                Interpolation::Bilinear,
            )
            .unwrap();
        assert_eq!(sagittal.dimensions(), (3, 2));
    }

    #[test]
    fn sagittal_slice_reads_fixed_x() {
        let snapshot = snapshot();
        let slice = snapshot
            .get_slice_from_axis(2, Orientation::Sagittal)
            .unwrap();
        assert_eq!(slice.dim(), (2, 3));
        assert_eq!(slice[[1, 2]], 1202.0);
    }
}
