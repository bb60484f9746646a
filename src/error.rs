use crate::enums::Phase;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Short read at offset {offset}: requested {requested} bytes, received {received}")]
    ShortRead {
        offset: u64,
        requested: u64,
        received: u64,
    },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error(
        "{phase} phase delivered {delivered} slices, expected {expected} ({trailing_bytes} trailing bytes)"
    )]
    CountMismatch {
        phase: Phase,
        expected: u32,
        delivered: u32,
        trailing_bytes: u64,
    },

    #[error("{phase} slice submitted out of order: expected {expected}, got {got}")]
    OutOfOrder { phase: Phase, expected: u32, got: u32 },

    #[error("Slice {slice} is outside a volume of depth {depth}")]
    SliceOutOfRange { slice: u32, depth: u32 },

    #[error("Picture is {}x{}, volume layers are {}x{}", got.0, got.1, expected.0, expected.1)]
    PictureSize { expected: (u32, u32), got: (u32, u32) },

    #[error("Base layer incomplete: {completed} of {depth} slices reconstructed")]
    BaseIncomplete { completed: u32, depth: u32 },

    #[error("Staging resource '{0}' reused before its previous write was submitted")]
    StagingBusy(&'static str),

    #[error("Load cancelled")]
    Cancelled,

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        StreamError::Transport(e.to_string())
    }
}

impl From<image::ImageError> for StreamError {
    fn from(e: image::ImageError) -> Self {
        StreamError::Decode(e.to_string())
    }
}

impl From<wgpu::RequestAdapterError> for StreamError {
    fn from(e: wgpu::RequestAdapterError) -> Self {
        StreamError::Gpu(e.to_string())
    }
}

impl From<wgpu::RequestDeviceError> for StreamError {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        StreamError::Gpu(e.to_string())
    }
}

impl From<wgpu::BufferAsyncError> for StreamError {
    fn from(e: wgpu::BufferAsyncError) -> Self {
        StreamError::Gpu(e.to_string())
    }
}

impl From<wgpu::PollError> for StreamError {
    fn from(e: wgpu::PollError) -> Self {
        StreamError::Gpu(e.to_string())
    }
}
