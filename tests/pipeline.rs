use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use volume_stream::framing::{
    ResidualSlicePacket, SlicePacket, encode_base_stream, encode_residual_stream,
};
use volume_stream::{
    CancelToken, LoadEvent, LoadStatus, MemoryRangeSource, Phase, Processor, ProgressUpdate,
    RangeSource, RawPictureDecoder, RemoteSource, StillImageDecoder, StreamConfig, StreamError,
    StreamOrchestrator, VolumeDescriptor, VolumeTexture,
};

fn descriptor() -> VolumeDescriptor {
    VolumeDescriptor {
        dims: (2, 2, 2),
        spacing: (1.0, 1.0, 1.0),
        base_range: (0.0, 100.0),
    }
}

/// Two raw 2x2 pictures, uniformly 0.0 and 1.0.
fn base_stream() -> Vec<u8> {
    let packets = [
        SlicePacket {
            is_key: true,
            payload: vec![0; 4],
        },
        SlicePacket {
            is_key: false,
            payload: vec![255; 4],
        },
    ];
    encode_base_stream(&descriptor(), &packets).unwrap()
}

fn png16(value: u16) -> Vec<u8> {
    let image = ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(2, 2, Luma([value]));
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma16(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Layer 0 gets an all-0.5 residual over (0, 10); layer 1 an all-zero one.
fn residual_packets() -> Vec<ResidualSlicePacket> {
    vec![
        ResidualSlicePacket {
            low: 0.0,
            high: 10.0,
            payload: png16(32768),
        },
        ResidualSlicePacket {
            low: 0.0,
            high: 0.0,
            payload: png16(0),
        },
    ]
}

async fn assert_layer(volume: &VolumeTexture, slice: u32, expected: f32) {
    let layer = volume.read_layer(slice).await.unwrap().unwrap();
    assert!(
        layer.iter().all(|&v| (v - expected).abs() < 1e-3),
        "layer {slice} = {layer}, expected {expected}"
    );
}

/// Cancels `token` once `after` requests have been served.
struct CancelAfter {
    inner: MemoryRangeSource,
    token: CancelToken,
    after: u64,
}

impl RangeSource for CancelAfter {
    fn location(&self) -> &str {
        "cancel-after"
    }

    async fn probe_size(&self) -> Result<u64, StreamError> {
        self.inner.probe_size().await
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StreamError> {
        let bytes = self.inner.fetch_range(offset, length).await?;
        if self.inner.requests() >= self.after {
            self.token.cancel();
        }
        Ok(bytes)
    }
}

#[tokio::test]
async fn base_stream_reconstructs_uniform_layers() {
    let orchestrator = StreamOrchestrator::new(Processor::CPU);
    let volume = orchestrator
        .load_base(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
        )
        .await
        .unwrap();

    assert_eq!(*volume.descriptor(), descriptor());
    assert!(volume.is_base_complete());
    assert_layer(&volume, 0, 0.0).await;
    assert_layer(&volume, 1, 100.0).await;
    assert!(volume.snapshot().await.unwrap().is_complete());
}

#[tokio::test]
async fn residual_stream_refines_layers_in_place() {
    let residual = encode_residual_stream(&residual_packets()).unwrap();
    let orchestrator = StreamOrchestrator::new(Processor::CPU);
    let loaded = orchestrator
        .load(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
            Some((MemoryRangeSource::new(residual), &mut StillImageDecoder)),
        )
        .await
        .unwrap();

    assert!(loaded.status.is_complete(), "{:?}", loaded.status);
    assert_eq!(loaded.volume.progress().refined(), 2);
    assert_layer(&loaded.volume, 0, 5.0).await;
    assert_layer(&loaded.volume, 1, 100.0).await;
}

#[tokio::test]
async fn exhausted_base_stream_issues_no_extra_fetch() {
    let source = MemoryRangeSource::new(base_stream());
    let counter = source.clone();
    StreamOrchestrator::new(Processor::CPU)
        .load_base(source, &mut RawPictureDecoder::new())
        .await
        .unwrap();
    // header + 2 x (size, payload)
    assert_eq!(counter.requests(), 5);
}

#[tokio::test]
async fn short_base_read_aborts_the_load() {
    let stream = base_stream();
    let reported = stream.len() as u64 + 7;
    let err = StreamOrchestrator::new(Processor::CPU)
        .load_base(
            MemoryRangeSource::new(stream).with_reported_size(reported),
            &mut RawPictureDecoder::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::ShortRead {
            requested: 3,
            received: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn short_residual_read_keeps_refined_and_base_layers() {
    let residual = encode_residual_stream(&residual_packets()).unwrap();
    let first_len = 12 + residual_packets()[0].payload.len();
    // second slice header arrives, its payload does not
    let truncated = residual[..first_len + 12].to_vec();
    let source = MemoryRangeSource::new(truncated).with_reported_size(residual.len() as u64);

    let loaded = StreamOrchestrator::new(Processor::CPU)
        .load(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
            Some((source, &mut StillImageDecoder)),
        )
        .await
        .unwrap();

    match &loaded.status {
        LoadStatus::RefinementFailed { refined, error } => {
            assert_eq!(*refined, 1);
            assert!(matches!(error, StreamError::ShortRead { .. }));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_layer(&loaded.volume, 0, 5.0).await;
    assert_layer(&loaded.volume, 1, 100.0).await;
}

#[tokio::test]
async fn missing_residual_slices_degrade_the_load() {
    let residual = encode_residual_stream(&residual_packets()[..1]).unwrap();
    let loaded = StreamOrchestrator::new(Processor::CPU)
        .load(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
            Some((MemoryRangeSource::new(residual), &mut StillImageDecoder)),
        )
        .await
        .unwrap();

    assert!(matches!(
        loaded.status,
        LoadStatus::Degraded {
            error: StreamError::CountMismatch {
                phase: Phase::Residual,
                expected: 2,
                delivered: 1,
                trailing_bytes: 0
            }
        }
    ));
    assert_layer(&loaded.volume, 0, 5.0).await;
    assert_layer(&loaded.volume, 1, 100.0).await;
}

#[tokio::test]
async fn surplus_residual_slices_are_not_fetched() {
    let mut packets = residual_packets();
    let surplus = ResidualSlicePacket {
        low: 0.0,
        high: 1000.0,
        payload: png16(65535),
    };
    let surplus_len = 12 + surplus.payload.len() as u64;
    packets.push(surplus);
    let source = MemoryRangeSource::new(encode_residual_stream(&packets).unwrap());
    let counter = source.clone();

    let loaded = StreamOrchestrator::new(Processor::CPU)
        .load(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
            Some((source, &mut StillImageDecoder)),
        )
        .await
        .unwrap();

    match loaded.status {
        LoadStatus::Degraded {
            error:
                StreamError::CountMismatch {
                    delivered,
                    trailing_bytes,
                    ..
                },
        } => {
            assert_eq!(delivered, 2);
            assert_eq!(trailing_bytes, surplus_len);
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(counter.requests(), 4);
    assert_layer(&loaded.volume, 1, 100.0).await;
}

#[tokio::test]
async fn cancelled_load_issues_no_requests() {
    let source = MemoryRangeSource::new(base_stream());
    let counter = source.clone();
    let orchestrator = StreamOrchestrator::new(Processor::CPU);
    orchestrator.cancel_token().cancel();

    let err = orchestrator
        .load_base(source, &mut RawPictureDecoder::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Cancelled));
    assert_eq!(counter.requests(), 0);
}

#[tokio::test]
async fn cancellation_during_refinement_stops_after_current_slice() {
    let (sender, mut receiver) = futures::channel::mpsc::unbounded();
    let orchestrator = StreamOrchestrator::new(Processor::CPU).with_events(sender);
    let residual = MemoryRangeSource::new(encode_residual_stream(&residual_packets()).unwrap());
    let counter = residual.clone();
    let source = CancelAfter {
        inner: residual,
        token: orchestrator.cancel_token(),
        after: 2,
    };

    let err = orchestrator
        .load(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
            Some((source, &mut StillImageDecoder)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Cancelled));
    assert_eq!(counter.requests(), 2);

    let mut ready = None;
    while let Ok(Some(event)) = receiver.try_next() {
        if let LoadEvent::VolumeReady { volume, .. } = event {
            ready = Some(volume);
        }
    }
    let volume = ready.expect("base phase completed before cancellation");
    assert_eq!(volume.progress().refined(), 1);
}

#[tokio::test]
async fn events_follow_load_order() {
    let (sender, mut receiver) = futures::channel::mpsc::unbounded();
    let residual = encode_residual_stream(&residual_packets()).unwrap();
    StreamOrchestrator::new(Processor::CPU)
        .with_events(sender)
        .load(
            MemoryRangeSource::new(base_stream()),
            &mut RawPictureDecoder::new(),
            Some((MemoryRangeSource::new(residual), &mut StillImageDecoder)),
        )
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(Some(event)) = receiver.try_next() {
        events.push(event);
    }
    let progress = |phase, completed| {
        LoadEvent::Progress(ProgressUpdate {
            phase,
            completed,
            total: 2,
        })
    };
    let expected = [
        Some(progress(Phase::Base, 1)),
        Some(progress(Phase::Base, 2)),
        None,
        Some(progress(Phase::Residual, 1)),
        Some(progress(Phase::Residual, 2)),
    ];
    assert_eq!(events.len(), expected.len());
    for (event, expected) in events.iter().zip(expected) {
        match (event, expected) {
            (LoadEvent::Progress(got), Some(LoadEvent::Progress(want))) => assert_eq!(*got, want),
            (LoadEvent::VolumeReady { descriptor, volume }, None) => {
                assert_eq!(*descriptor, self::descriptor());
                assert!(volume.is_base_complete());
            }
            (event, _) => panic!("unexpected event {event:?}"),
        }
    }
}

#[tokio::test]
async fn local_files_stream_like_remote_resources() {
    let dir = std::env::temp_dir().join(format!("volume-stream-pipeline-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let base_path = dir.join("base.bin");
    let residual_path = dir.join("residual.bin");
    std::fs::write(&base_path, base_stream()).unwrap();
    std::fs::write(&residual_path, encode_residual_stream(&residual_packets()).unwrap()).unwrap();

    let config = StreamConfig::default();
    let base = RemoteSource::open(base_path.to_str().unwrap(), &config).unwrap();
    let residual = RemoteSource::open(
        &format!("file://{}", residual_path.to_str().unwrap()),
        &config,
    )
    .unwrap();
    let loaded = StreamOrchestrator::new(Processor::CPU)
        .load(
            base,
            &mut RawPictureDecoder::new(),
            Some((residual, &mut StillImageDecoder)),
        )
        .await
        .unwrap();
    std::fs::remove_dir_all(&dir).ok();

    assert!(loaded.status.is_complete());
    assert_layer(&loaded.volume, 0, 5.0).await;
    assert_layer(&loaded.volume, 1, 100.0).await;
}
