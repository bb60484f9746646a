//! # volume-stream
//!
//! This crate reconstructs a 3D scalar volume (e.g. a CT scan) from two
//! progressively streamed layers fetched with HTTP range requests:
//!
//!  - a **base layer**: a header describing the volume followed by packets of
//!    an inter-frame picture codec. Each decoded picture is a normalized slice
//!    that is rescaled by the volume's value range into one Z-layer.
//!  - a **residual layer**: one still image per slice with its own value
//!    range, added onto the reconstructed layer to recover full precision.
//!
//! The volume is usable as soon as the base layer is complete; the residual
//! layer then refines it in place, slice by slice. Reconstruction runs either
//! on the CPU over an [`ndarray`] volume (in parallel using rayon) or on the
//! GPU with wgpu compute shaders writing into a 3D texture.
//!
//! Readers only ever observe layers covered by reported progress, and every
//! layer is written in strictly increasing slice order.
//!
//! # Examples
//!
//! ## Streaming a volume and exporting its central slices
//!
//! ```no_run
//! # use volume_stream::{
//! #     Interpolation, Orientation, Processor, RawPictureDecoder, RemoteSource,
//! #     StillImageDecoder, StreamConfig, StreamOrchestrator, Window,
//! # };
//! # async fn run() -> Result<(), volume_stream::StreamError> {
//! let config = StreamConfig::default();
//! let base = RemoteSource::open("https://example.org/ct/base.bin", &config)?;
//! let residual = RemoteSource::open("https://example.org/ct/residual.bin", &config)?;
//!
//! let orchestrator = StreamOrchestrator::new(Processor::CPU);
//! let loaded = orchestrator
//!     .load(
//!         base,
//!         &mut RawPictureDecoder::new(),
//!         Some((residual, &mut StillImageDecoder)),
//!     )
//!     .await?;
//!
//! let snapshot = loaded.volume.snapshot().await?;
//! let (_, height, _) = snapshot.dim();
//! if let Some(image) = snapshot.render_slice(
//!     height / 2,
//!     Orientation::Coronal,
//!     Window::default(),
//!     Interpolation::Bilinear,
//! ) {
//!     image.save("coronal.png").ok();
//! }
//! # Ok(())
//! # }
//! ```

pub mod compositor;
pub mod config;
pub mod decoder;
pub mod enums;
pub mod error;
pub mod framing;
pub mod gpu;
pub mod orchestrator;
pub mod range_reader;
pub mod reconstructor;
pub mod snapshot;
pub mod volume;

pub use compositor::ResidualSliceCompositor;
pub use config::StreamConfig;
pub use decoder::{
    IntraPictureDecoder, PictureDecoder, RawPictureDecoder, ResidualDecoder, SampleImage,
    StillImageDecoder,
};
pub use enums::{Interpolation, Orientation, Phase, Processor};
pub use error::StreamError;
pub use gpu::GpuContext;
pub use orchestrator::{LoadEvent, LoadStatus, LoadedVolume, ProgressUpdate, StreamOrchestrator};
pub use range_reader::{
    CancelToken, FileRangeSource, HttpRangeSource, MemoryRangeSource, RangeSource,
    RangeStreamReader, RemoteSource,
};
pub use reconstructor::BaseSliceReconstructor;
pub use snapshot::{VolumeSnapshot, Window};
pub use volume::{VolumeDescriptor, VolumeTexture};
