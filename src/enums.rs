use std::fmt;
use std::sync::Arc;

use crate::gpu::GpuContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interpolation {
    /// Resample coronal and sagittal slices to their physical aspect ratio.
    Bilinear,
    #[default]
    None,
}

/// Where slice reconstruction runs.
#[derive(Clone, Default)]
pub enum Processor {
    #[default]
    CPU,
    GPU(Arc<GpuContext>),
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processor::CPU => f.write_str("CPU"),
            Processor::GPU(ctx) => write!(f, "GPU({})", ctx.adapter_name()),
        }
    }
}

/// The two stages of a progressive load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Base,
    Residual,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Base => f.write_str("base"),
            Phase::Residual => f.write_str("residual"),
        }
    }
}
