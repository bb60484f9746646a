//! Decoder collaborators for the two layers.
//!
//! The base layer is produced by an inter-frame picture codec; any codec can
//! be plugged in through [`PictureDecoder`]. Residual slices are still images
//! and go through [`ResidualDecoder`]. Both hand back single-channel samples
//! normalized to `[0, 1]`.

use image::{DynamicImage, ImageBuffer, Luma};
use log::debug;

use crate::error::StreamError;
use crate::framing::SlicePacket;
use crate::volume::VolumeDescriptor;

/// Single-channel picture with samples in `[0, 1]`.
pub type SampleImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Decoder for the base stream.
///
/// Packets arrive strictly in file order. Each call returns the pictures that
/// became available, in picture order; a codec may return none for a packet
/// and catch up later or in [`PictureDecoder::flush`].
#[allow(async_fn_in_trait)]
pub trait PictureDecoder {
    fn begin(&mut self, _descriptor: &VolumeDescriptor) -> Result<(), StreamError> {
        Ok(())
    }

    async fn decode(&mut self, packet: &SlicePacket) -> Result<Vec<SampleImage>, StreamError>;

    async fn flush(&mut self) -> Result<Vec<SampleImage>, StreamError> {
        Ok(Vec::new())
    }
}

/// Decoder for residual slice payloads.
#[allow(async_fn_in_trait)]
pub trait ResidualDecoder {
    async fn decode(&mut self, payload: Vec<u8>) -> Result<SampleImage, StreamError>;
}

/// Uncompressed 8-bit pictures, `dims.x * dims.y` bytes each. A packet may
/// carry several pictures back to back.
#[derive(Default)]
pub struct RawPictureDecoder {
    layer: Option<(u32, u32)>,
}

impl RawPictureDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PictureDecoder for RawPictureDecoder {
    fn begin(&mut self, descriptor: &VolumeDescriptor) -> Result<(), StreamError> {
        self.layer = Some((descriptor.dims.0, descriptor.dims.1));
        Ok(())
    }

    async fn decode(&mut self, packet: &SlicePacket) -> Result<Vec<SampleImage>, StreamError> {
        let (width, height) = self
            .layer
            .ok_or_else(|| StreamError::Decode("raw decoder used before volume header".into()))?;
        let picture_len = (width * height) as usize;
        if packet.payload.len() % picture_len != 0 {
            return Err(StreamError::Decode(format!(
                "raw packet of {} bytes is not a whole number of {width}x{height} pictures",
                packet.payload.len()
            )));
        }

        packet
            .payload
            .chunks_exact(picture_len)
            .map(|samples| {
                let normalized = samples.iter().map(|&v| v as f32 / 255.0).collect();
                ImageBuffer::from_raw(width, height, normalized)
                    .ok_or_else(|| StreamError::Decode("raw picture buffer size".into()))
            })
            .collect()
    }
}

/// Intra-only base stream: every packet is a standalone still image.
#[derive(Default)]
pub struct IntraPictureDecoder;

impl PictureDecoder for IntraPictureDecoder {
    async fn decode(&mut self, packet: &SlicePacket) -> Result<Vec<SampleImage>, StreamError> {
        if packet.payload.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![decode_still_blocking(packet.payload.clone()).await?])
    }
}

/// Still-image decoder for residual slices (PNG, JPEG, ... via `image`).
#[derive(Default)]
pub struct StillImageDecoder;

impl ResidualDecoder for StillImageDecoder {
    async fn decode(&mut self, payload: Vec<u8>) -> Result<SampleImage, StreamError> {
        decode_still_blocking(payload).await
    }
}

async fn decode_still_blocking(payload: Vec<u8>) -> Result<SampleImage, StreamError> {
    tokio::task::spawn_blocking(move || decode_still(&payload))
        .await
        .map_err(|e| StreamError::Decode(format!("decode task failed: {e}")))?
}

/// Decode a still image and keep its first channel, normalized to `[0, 1]`.
pub fn decode_still(bytes: &[u8]) -> Result<SampleImage, StreamError> {
    let image = image::load_from_memory(bytes)?;
    debug!(
        "decoded {}x{} {:?} still image",
        image.width(),
        image.height(),
        image.color()
    );
    Ok(red_channel(image))
}

pub fn red_channel(image: DynamicImage) -> SampleImage {
    match image {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLumaA16(_) => image.to_luma32f(),
        other => {
            let rgb = other.to_rgb32f();
            ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
                Luma([rgb.get_pixel(x, y)[0]])
            })
        }
    }
}
