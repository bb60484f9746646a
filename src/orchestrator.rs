//! Drives a progressive load: the base layer to completion, then the residual
//! layer refining the same volume in place.

use futures::channel::mpsc::UnboundedSender;
use log::{debug, info, warn};
use web_time::Instant;

use crate::compositor::ResidualSliceCompositor;
use crate::decoder::{PictureDecoder, ResidualDecoder, SampleImage};
use crate::enums::{Phase, Processor};
use crate::error::StreamError;
use crate::framing::{BaseFrame, BaseFramer, ResidualFramer};
use crate::range_reader::{CancelToken, RangeSource, RangeStreamReader};
use crate::reconstructor::BaseSliceReconstructor;
use crate::volume::{VolumeDescriptor, VolumeTexture};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub completed: u32,
    pub total: u32,
}

/// Events published while a load runs.
#[derive(Clone, Debug)]
pub enum LoadEvent {
    /// Every base layer is reconstructed; the volume may be rendered.
    VolumeReady {
        descriptor: VolumeDescriptor,
        volume: VolumeTexture,
    },
    Progress(ProgressUpdate),
}

/// How far the load got once a usable volume exists.
#[derive(Debug)]
pub enum LoadStatus {
    /// Base and residual layers fully applied.
    Complete,
    /// The residual stream delivered a different number of slices than the
    /// volume has layers. The delivered slices are applied.
    Degraded { error: StreamError },
    /// The residual phase aborted after refining `refined` layers; the rest
    /// are at base fidelity.
    RefinementFailed { refined: u32, error: StreamError },
}

impl LoadStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, LoadStatus::Complete)
    }
}

#[derive(Debug)]
pub struct LoadedVolume {
    pub volume: VolumeTexture,
    pub status: LoadStatus,
}

pub struct StreamOrchestrator {
    processor: Processor,
    cancel: CancelToken,
    events: Option<UnboundedSender<LoadEvent>>,
}

impl StreamOrchestrator {
    pub fn new(processor: Processor) -> Self {
        Self {
            processor,
            cancel: CancelToken::new(),
            events: None,
        }
    }

    /// Publish [`LoadEvent`]s on `sender`. A dropped receiver is ignored.
    pub fn with_events(mut self, sender: UnboundedSender<LoadEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Token that aborts the running load. Cancellation is terminal.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Load the base layer and, if given, refine it with the residual layer.
    ///
    /// Base phase failures leave no volume and are returned as errors.
    /// Residual phase failures are reported through [`LoadStatus`], except
    /// cancellation which releases the volume.
    pub async fn load<B, R, PD, RD>(
        &self,
        base: B,
        base_decoder: &mut PD,
        residual: Option<(R, &mut RD)>,
    ) -> Result<LoadedVolume, StreamError>
    where
        B: RangeSource,
        R: RangeSource,
        PD: PictureDecoder,
        RD: ResidualDecoder,
    {
        let volume = self.load_base(base, base_decoder).await?;
        let Some((source, decoder)) = residual else {
            return Ok(LoadedVolume {
                volume,
                status: LoadStatus::Complete,
            });
        };

        let status = match self.load_residual(&volume, source, decoder).await {
            Ok(status) => status,
            Err(StreamError::Cancelled) => return Err(StreamError::Cancelled),
            Err(error) => {
                let refined = volume.progress().refined();
                warn!("refinement stopped after {refined} slices: {error}");
                LoadStatus::RefinementFailed { refined, error }
            }
        };
        Ok(LoadedVolume { volume, status })
    }

    /// Run the base phase and return the fully reconstructed volume.
    pub async fn load_base<S, D>(
        &self,
        source: S,
        decoder: &mut D,
    ) -> Result<VolumeTexture, StreamError>
    where
        S: RangeSource,
        D: PictureDecoder,
    {
        let result = self.run_base(source, decoder).await;
        if let Err(StreamError::Cancelled) = &result {
            self.release();
        }
        result
    }

    /// Run the residual phase over a volume whose base phase is complete.
    ///
    /// Returns [`LoadStatus::Complete`] or [`LoadStatus::Degraded`]; any other
    /// failure is an error.
    pub async fn load_residual<S, D>(
        &self,
        volume: &VolumeTexture,
        source: S,
        decoder: &mut D,
    ) -> Result<LoadStatus, StreamError>
    where
        S: RangeSource,
        D: ResidualDecoder,
    {
        let result = self.run_residual(volume, source, decoder).await;
        if let Err(StreamError::Cancelled) = &result {
            self.release();
        }
        result
    }

    async fn run_base<S, D>(
        &self,
        source: S,
        decoder: &mut D,
    ) -> Result<VolumeTexture, StreamError>
    where
        S: RangeSource,
        D: PictureDecoder,
    {
        let start = Instant::now();
        let mut reader = RangeStreamReader::open(source, self.cancel.clone()).await?;
        info!(
            "loading base layer from {} ({} bytes)",
            reader.source().location(),
            reader.total_size()
        );

        let mut framer = BaseFramer::new(reader.total_size());
        let descriptor = match reader.next_frame(&mut framer).await? {
            Some(BaseFrame::Volume(descriptor)) => descriptor,
            _ => return Err(StreamError::Framing("base stream has no volume header".into())),
        };
        info!(
            "volume {:?} spacing {:?} range {:?}",
            descriptor.dims, descriptor.spacing, descriptor.base_range
        );

        let volume = VolumeTexture::new(&self.processor, descriptor)?;
        decoder.begin(&descriptor)?;
        let mut reconstructor = BaseSliceReconstructor::new(&volume);

        while let Some(frame) = reader.next_frame(&mut framer).await? {
            let BaseFrame::Packet(packet) = frame else {
                return Err(StreamError::Framing("repeated volume header".into()));
            };
            debug!("base packet of {} bytes (key: {})", packet.size(), packet.is_key);
            let pictures = decoder.decode(&packet).await?;
            let trailing_bytes = reader.cursor().remaining();
            self.reconstruct_pictures(&mut reconstructor, pictures, &descriptor, trailing_bytes)?;
        }
        let pictures = decoder.flush().await?;
        self.reconstruct_pictures(&mut reconstructor, pictures, &descriptor, 0)?;

        let delivered = reconstructor.next_slice();
        if delivered != descriptor.depth() {
            return Err(StreamError::CountMismatch {
                phase: Phase::Base,
                expected: descriptor.depth(),
                delivered,
                trailing_bytes: 0,
            });
        }
        reconstructor.wait_idle()?;

        let stats = reader.stats();
        info!(
            "base layer ready: {delivered} slices, {} requests ({:.2?} avg), {} bytes in {:.2?}",
            stats.requests,
            stats.avg_latency(),
            stats.bytes_fetched,
            start.elapsed()
        );
        self.emit(LoadEvent::VolumeReady {
            descriptor,
            volume: volume.clone(),
        });
        Ok(volume)
    }

    fn reconstruct_pictures(
        &self,
        reconstructor: &mut BaseSliceReconstructor,
        pictures: Vec<SampleImage>,
        descriptor: &VolumeDescriptor,
        trailing_bytes: u64,
    ) -> Result<(), StreamError> {
        let depth = descriptor.depth();
        let (low, high) = descriptor.base_range;
        for picture in pictures {
            let slice = reconstructor.next_slice();
            if slice >= depth {
                return Err(StreamError::CountMismatch {
                    phase: Phase::Base,
                    expected: depth,
                    delivered: slice + 1,
                    trailing_bytes,
                });
            }
            reconstructor.reconstruct(&picture, slice, low, high)?;
            self.emit(LoadEvent::Progress(ProgressUpdate {
                phase: Phase::Base,
                completed: slice + 1,
                total: depth,
            }));
        }
        Ok(())
    }

    async fn run_residual<S, D>(
        &self,
        volume: &VolumeTexture,
        source: S,
        decoder: &mut D,
    ) -> Result<LoadStatus, StreamError>
    where
        S: RangeSource,
        D: ResidualDecoder,
    {
        let start = Instant::now();
        let mut compositor = ResidualSliceCompositor::new(volume)?;
        let mut reader = RangeStreamReader::open(source, self.cancel.clone()).await?;
        info!(
            "loading residual layer from {} ({} bytes)",
            reader.source().location(),
            reader.total_size()
        );

        let depth = volume.descriptor().depth();
        let mut framer = ResidualFramer::new(reader.total_size());
        while compositor.next_slice() < depth {
            let Some(packet) = reader.next_frame(&mut framer).await? else {
                break;
            };
            let slice = compositor.next_slice();
            debug!(
                "residual slice {slice}: {} bytes, range {}..{}",
                packet.payload.len(),
                packet.low,
                packet.high
            );
            let residual = decoder.decode(packet.payload).await?;
            compositor.composite(&residual, slice, packet.low, packet.high)?;
            self.emit(LoadEvent::Progress(ProgressUpdate {
                phase: Phase::Residual,
                completed: slice + 1,
                total: depth,
            }));
        }
        compositor.wait_idle()?;

        let refined = compositor.next_slice();
        let trailing_bytes = reader.cursor().remaining();
        if refined < depth || trailing_bytes > 0 {
            let error = StreamError::CountMismatch {
                phase: Phase::Residual,
                expected: depth,
                delivered: refined,
                trailing_bytes,
            };
            warn!("volume refined partially: {error}");
            return Ok(LoadStatus::Degraded { error });
        }

        info!(
            "residual layer applied: {refined} slices, {} bytes ({:.2?} avg per request) in {:.2?}",
            reader.stats().bytes_fetched,
            reader.stats().avg_latency(),
            start.elapsed()
        );
        Ok(LoadStatus::Complete)
    }

    fn emit(&self, event: LoadEvent) {
        if let Some(events) = &self.events {
            let _ = events.unbounded_send(event);
        }
    }

    /// Let queued GPU work drain after a cancelled load.
    fn release(&self) {
        info!("load cancelled");
        if let Processor::GPU(ctx) = &self.processor {
            if let Err(e) = ctx.drain() {
                warn!("draining GPU after cancellation failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RawPictureDecoder;
    use crate::framing::{SlicePacket, encode_base_stream};
    use crate::range_reader::MemoryRangeSource;

    fn descriptor() -> VolumeDescriptor {
        VolumeDescriptor {
            dims: (2, 2, 2),
            spacing: (1.0, 1.0, 1.0),
            base_range: (0.0, 100.0),
        }
    }

    fn base_stream(pictures: &[u8]) -> Vec<u8> {
        let packets: Vec<SlicePacket> = pictures
            .iter()
            .enumerate()
            .map(|(i, &value)| SlicePacket {
                is_key: i == 0,
                payload: vec![value; 4],
            })
            .collect();
        encode_base_stream(&descriptor(), &packets).unwrap()
    }

    #[tokio::test]
    async fn base_phase_publishes_progress_then_ready() {
        let (sender, mut receiver) = futures::channel::mpsc::unbounded();
        let orchestrator = StreamOrchestrator::new(Processor::CPU).with_events(sender);
        let volume = orchestrator
            .load_base(
                MemoryRangeSource::new(base_stream(&[0, 255])),
                &mut RawPictureDecoder::new(),
            )
            .await
            .unwrap();
        drop(orchestrator);

        let mut events = Vec::new();
        while let Ok(Some(event)) = receiver.try_next() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            LoadEvent::Progress(ProgressUpdate {
                phase: Phase::Base,
                completed: 1,
                total: 2
            })
        ));
        assert!(matches!(
            &events[2],
            LoadEvent::VolumeReady { descriptor, .. } if *descriptor == self::descriptor()
        ));
        assert!(volume.is_base_complete());
    }

    #[tokio::test]
    async fn extra_base_picture_is_a_count_mismatch() {
        let orchestrator = StreamOrchestrator::new(Processor::CPU);
        let err = orchestrator
            .load_base(
                MemoryRangeSource::new(base_stream(&[0, 128, 255])),
                &mut RawPictureDecoder::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::CountMismatch {
                phase: Phase::Base,
                expected: 2,
                delivered: 3,
                trailing_bytes: 0
            }
        ));
    }

    #[tokio::test]
    async fn missing_base_picture_is_a_count_mismatch() {
        let orchestrator = StreamOrchestrator::new(Processor::CPU);
        let err = orchestrator
            .load_base(
                MemoryRangeSource::new(base_stream(&[0])),
                &mut RawPictureDecoder::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::CountMismatch {
                expected: 2,
                delivered: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_base_stream_is_a_framing_error() {
        let orchestrator = StreamOrchestrator::new(Processor::CPU);
        let err = orchestrator
            .load_base(MemoryRangeSource::new(Vec::new()), &mut RawPictureDecoder::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Framing(_)));
    }
}
