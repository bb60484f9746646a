use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use log::{error, info, warn};

use volume_stream::{
    GpuContext, IntraPictureDecoder, Interpolation, LoadEvent, LoadStatus, Orientation,
    PictureDecoder, Processor, RawPictureDecoder, RemoteSource, StillImageDecoder, StreamConfig,
    StreamError, StreamOrchestrator, VolumeSnapshot, Window,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProcessorArg {
    Cpu,
    Gpu,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DecoderArg {
    /// Uncompressed 8-bit pictures
    Raw,
    /// One still image per packet
    Intra,
}

/// Stream a two-layer volume and export its central orthogonal slices.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Base layer URL or path
    #[arg(long)]
    base: String,
    /// Residual layer URL or path
    #[arg(long)]
    residual: Option<String>,
    #[arg(long, value_enum, default_value_t = ProcessorArg::Cpu)]
    processor: ProcessorArg,
    #[arg(long, value_enum, default_value_t = DecoderArg::Raw)]
    decoder: DecoderArg,
    /// Directory the PNG slices are written to
    #[arg(long, default_value = ".")]
    output: PathBuf,
    #[arg(long, default_value_t = 4096.0)]
    window_width: f32,
    #[arg(long, default_value_t = 2048.0)]
    window_center: f32,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    /// Resample coronal and sagittal slices to physical aspect ratio
    #[arg(long, default_value_t = false)]
    isotropic: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let result = match args.decoder {
        DecoderArg::Raw => run(&args, &mut RawPictureDecoder::new()).await,
        DecoderArg::Intra => run(&args, &mut IntraPictureDecoder).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run<D: PictureDecoder>(args: &Args, decoder: &mut D) -> Result<(), StreamError> {
    let config = StreamConfig::default().with_timeout(Duration::from_secs(args.timeout_secs));
    let processor = match args.processor {
        ProcessorArg::Cpu => Processor::CPU,
        ProcessorArg::Gpu => Processor::GPU(Arc::new(GpuContext::new().await?)),
    };
    info!("reconstructing on {processor:?}");

    let (sender, mut receiver) = futures::channel::mpsc::unbounded();
    let progress = tokio::spawn(async move {
        while let Some(event) = receiver.next().await {
            match event {
                LoadEvent::Progress(update) => {
                    info!("{} {}/{}", update.phase, update.completed, update.total)
                }
                LoadEvent::VolumeReady { descriptor, .. } => {
                    info!("volume ready: {:?}", descriptor.dims)
                }
            }
        }
    });

    let orchestrator = StreamOrchestrator::new(processor).with_events(sender);
    let base = RemoteSource::open(&args.base, &config)?;
    let residual = args
        .residual
        .as_deref()
        .map(|location| RemoteSource::open(location, &config))
        .transpose()?;
    let mut still_decoder = StillImageDecoder;
    let residual_decoder = &mut still_decoder;
    let loaded = orchestrator
        .load(
            base,
            decoder,
            residual.map(move |source| (source, residual_decoder)),
        )
        .await?;
    drop(orchestrator);
    let _ = progress.await;

    match &loaded.status {
        LoadStatus::Complete => info!("volume fully loaded"),
        LoadStatus::Degraded { error } => warn!("volume loaded at reduced fidelity: {error}"),
        LoadStatus::RefinementFailed { refined, error } => {
            warn!("refinement failed after {refined} slices: {error}")
        }
    }

    let snapshot = loaded.volume.snapshot().await?;
    if !snapshot.is_complete() {
        warn!("exporting {} of {} layers", snapshot.dim().0, snapshot.descriptor.depth());
    }
    let window = Window {
        width: args.window_width,
        center: args.window_center,
    };
    let interpolation = if args.isotropic {
        Interpolation::Bilinear
    } else {
        Interpolation::None
    };
    std::fs::create_dir_all(&args.output)?;
    export_slices(&snapshot, &args.output, window, interpolation)
}

fn export_slices(
    snapshot: &VolumeSnapshot,
    output: &Path,
    window: Window,
    interpolation: Interpolation,
) -> Result<(), StreamError> {
    let (depth, height, width) = snapshot.dim();
    let slices = [
        (Orientation::Axial, depth / 2, "axial"),
        (Orientation::Coronal, height / 2, "coronal"),
        (Orientation::Sagittal, width / 2, "sagittal"),
    ];
    for (orientation, index, name) in slices {
        let Some(image) = snapshot.render_slice(index, orientation, window, interpolation) else {
            warn!("no {name} slice at index {index}");
            continue;
        };
        let path = output.join(format!("{name}.png"));
        image
            .save(&path)
            .map_err(|e| StreamError::Io(std::io::Error::other(e)))?;
        info!("wrote {}", path.display());
    }
    Ok(())
}
