//! Byte-level framing of the base and residual streams.
//!
//! Both framers are sans-IO state machines: they announce how many bytes they
//! need next ([`Framer::next_read`]) and are fed exactly that many bytes
//! ([`Framer::push`]). [`RangeStreamReader::next_frame`] drives them against a
//! remote resource one request at a time; [`frame_base_stream`] and
//! [`frame_residual_stream`] drive them over an in-memory buffer.
//!
//! Base stream layout (little-endian):
//!
//! ```text
//! offset 0:  i32 dim_x, i32 dim_y, i32 dim_z
//! offset 12: f32 spacing_x, f32 spacing_y, f32 spacing_z
//! offset 24: f32 low, f32 high
//! offset 32: repeated [u8 b0, u8 b1, u8 b2 | key << 7, payload]
//! ```
//!
//! Residual stream layout: repeated `[f32 low, f32 high, i32 size, payload]`.
//!
//! [`RangeStreamReader::next_frame`]: crate::range_reader::RangeStreamReader::next_frame

use crate::error::StreamError;
use crate::volume::VolumeDescriptor;

pub const VOLUME_HEADER_LEN: u64 = 32;
pub const PACKET_HEADER_LEN: u64 = 3;
pub const RESIDUAL_HEADER_LEN: u64 = 12;

/// Largest payload a 23-bit packet size can describe.
pub const MAX_PACKET_SIZE: u32 = (1 << 23) - 1;

const KEY_FLAG: u8 = 0x80;

/// A sans-IO framing state machine.
pub trait Framer {
    type Frame;

    /// Bytes required for the next step, `None` once the stream is exhausted.
    ///
    /// Fails when the framer needs more bytes than the resource has left.
    fn next_read(&self) -> Result<Option<u64>, StreamError>;

    /// Feed exactly the number of bytes announced by [`Framer::next_read`].
    fn push(&mut self, chunk: Vec<u8>) -> Result<Option<Self::Frame>, StreamError>;

    /// Bytes of the resource not yet consumed.
    fn remaining(&self) -> u64;

    fn is_exhausted(&self) -> bool;
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_i32(bytes, offset) as u32)
}

fn require(needed: u64, remaining: u64, consumed: u64, what: &str) -> Result<u64, StreamError> {
    if needed > remaining {
        return Err(StreamError::Framing(format!(
            "{what} at offset {consumed} needs {needed} bytes, only {remaining} remain"
        )));
    }
    Ok(needed)
}

fn check_chunk(expected: Option<u64>, chunk: &[u8]) -> Result<(), StreamError> {
    match expected {
        Some(len) if len == chunk.len() as u64 => Ok(()),
        Some(len) => Err(StreamError::Framing(format!(
            "framer expected {len} bytes, was fed {}",
            chunk.len()
        ))),
        None => Err(StreamError::Framing("stream already exhausted".into())),
    }
}

impl VolumeDescriptor {
    /// Parse the 32-byte base stream header.
    pub fn parse_header(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() < VOLUME_HEADER_LEN as usize {
            return Err(StreamError::Framing(format!(
                "volume header is {} bytes, expected {VOLUME_HEADER_LEN}",
                bytes.len()
            )));
        }

        let mut dims = [0u32; 3];
        for (axis, dim) in dims.iter_mut().enumerate() {
            let value = read_i32(bytes, axis * 4);
            if value <= 0 {
                return Err(StreamError::Framing(format!(
                    "volume dimension {axis} must be positive, got {value}"
                )));
            }
            *dim = value as u32;
        }

        let spacing = (read_f32(bytes, 12), read_f32(bytes, 16), read_f32(bytes, 20));
        for (axis, value) in [spacing.0, spacing.1, spacing.2].into_iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(StreamError::Framing(format!(
                    "voxel spacing {axis} must be positive and finite, got {value}"
                )));
            }
        }
        let low = read_f32(bytes, 24);
        let high = read_f32(bytes, 28);
        if !(low < high) {
            return Err(StreamError::Framing(format!(
                "base range must satisfy low < high, got ({low}, {high})"
            )));
        }

        Ok(Self {
            dims: (dims[0], dims[1], dims[2]),
            spacing,
            base_range: (low, high),
        })
    }

    pub fn to_header_bytes(&self) -> [u8; VOLUME_HEADER_LEN as usize] {
        let mut out = [0u8; VOLUME_HEADER_LEN as usize];
        let words = [
            self.dims.0 as i32 as u32,
            self.dims.1 as i32 as u32,
            self.dims.2 as i32 as u32,
            self.spacing.0.to_bits(),
            self.spacing.1.to_bits(),
            self.spacing.2.to_bits(),
            self.base_range.0.to_bits(),
            self.base_range.1.to_bits(),
        ];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// One framed packet of the base (inter-frame coded) stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlicePacket {
    pub is_key: bool,
    pub payload: Vec<u8>,
}

impl SlicePacket {
    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Split a 3-byte packet header into `(size, is_key)`.
    pub fn parse_header(header: [u8; 3]) -> (u32, bool) {
        let [b0, b1, b2] = header;
        let size = (((b2 & !KEY_FLAG) as u32) << 16) | ((b1 as u32) << 8) | b0 as u32;
        (size, b2 & KEY_FLAG != 0)
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), StreamError> {
        if self.payload.len() > MAX_PACKET_SIZE as usize {
            return Err(StreamError::Framing(format!(
                "packet of {} bytes does not fit a 23-bit size",
                self.payload.len()
            )));
        }
        let size = self.size();
        let key = if self.is_key { KEY_FLAG } else { 0 };
        out.extend_from_slice(&[size as u8, (size >> 8) as u8, (size >> 16) as u8 | key]);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// One framed packet of the residual stream.
#[derive(Clone, Debug, PartialEq)]
pub struct ResidualSlicePacket {
    pub low: f32,
    pub high: f32,
    pub payload: Vec<u8>,
}

impl ResidualSlicePacket {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), StreamError> {
        let size = i32::try_from(self.payload.len()).map_err(|_| {
            StreamError::Framing(format!(
                "residual payload of {} bytes does not fit an i32 size",
                self.payload.len()
            ))
        })?;
        out.extend_from_slice(&self.low.to_le_bytes());
        out.extend_from_slice(&self.high.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BaseFrame {
    Volume(VolumeDescriptor),
    Packet(SlicePacket),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseFramerState {
    AwaitingVolumeHeader,
    AwaitingHeader,
    AwaitingPayload { size: u32, is_key: bool },
    Exhausted,
}

pub struct BaseFramer {
    state: BaseFramerState,
    consumed: u64,
    total_size: u64,
}

impl BaseFramer {
    pub fn new(total_size: u64) -> Self {
        Self {
            state: BaseFramerState::AwaitingVolumeHeader,
            consumed: 0,
            total_size,
        }
    }

    pub fn state(&self) -> BaseFramerState {
        self.state
    }

    fn after_unit(&self) -> BaseFramerState {
        if self.consumed == self.total_size {
            BaseFramerState::Exhausted
        } else {
            BaseFramerState::AwaitingHeader
        }
    }
}

impl Framer for BaseFramer {
    type Frame = BaseFrame;

    fn next_read(&self) -> Result<Option<u64>, StreamError> {
        let remaining = self.remaining();
        let needed = match self.state {
            BaseFramerState::AwaitingVolumeHeader => {
                require(VOLUME_HEADER_LEN, remaining, self.consumed, "volume header")?
            }
            BaseFramerState::AwaitingHeader => {
                require(PACKET_HEADER_LEN, remaining, self.consumed, "packet header")?
            }
            BaseFramerState::AwaitingPayload { size, .. } => {
                require(size as u64, remaining, self.consumed, "packet payload")?
            }
            BaseFramerState::Exhausted => return Ok(None),
        };
        Ok(Some(needed))
    }

    fn push(&mut self, chunk: Vec<u8>) -> Result<Option<BaseFrame>, StreamError> {
        check_chunk(self.next_read()?, &chunk)?;
        self.consumed += chunk.len() as u64;

        match self.state {
            BaseFramerState::AwaitingVolumeHeader => {
                let descriptor = VolumeDescriptor::parse_header(&chunk)?;
                self.state = self.after_unit();
                Ok(Some(BaseFrame::Volume(descriptor)))
            }
            BaseFramerState::AwaitingHeader => {
                let (size, is_key) = SlicePacket::parse_header([chunk[0], chunk[1], chunk[2]]);
                self.state = BaseFramerState::AwaitingPayload { size, is_key };
                Ok(None)
            }
            BaseFramerState::AwaitingPayload { is_key, .. } => {
                self.state = self.after_unit();
                Ok(Some(BaseFrame::Packet(SlicePacket {
                    is_key,
                    payload: chunk,
                })))
            }
            BaseFramerState::Exhausted => unreachable!("check_chunk rejects exhausted framers"),
        }
    }

    fn remaining(&self) -> u64 {
        self.total_size - self.consumed
    }

    fn is_exhausted(&self) -> bool {
        self.state == BaseFramerState::Exhausted
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResidualFramerState {
    AwaitingSliceHeader,
    AwaitingSlicePayload { low: f32, high: f32, size: u32 },
    Exhausted,
}

pub struct ResidualFramer {
    state: ResidualFramerState,
    consumed: u64,
    total_size: u64,
}

impl ResidualFramer {
    pub fn new(total_size: u64) -> Self {
        let state = if total_size == 0 {
            ResidualFramerState::Exhausted
        } else {
            ResidualFramerState::AwaitingSliceHeader
        };
        Self {
            state,
            consumed: 0,
            total_size,
        }
    }

    pub fn state(&self) -> ResidualFramerState {
        self.state
    }
}

impl Framer for ResidualFramer {
    type Frame = ResidualSlicePacket;

    fn next_read(&self) -> Result<Option<u64>, StreamError> {
        let remaining = self.remaining();
        let needed = match self.state {
            ResidualFramerState::AwaitingSliceHeader => {
                require(RESIDUAL_HEADER_LEN, remaining, self.consumed, "residual header")?
            }
            ResidualFramerState::AwaitingSlicePayload { size, .. } => {
                require(size as u64, remaining, self.consumed, "residual payload")?
            }
            ResidualFramerState::Exhausted => return Ok(None),
        };
        Ok(Some(needed))
    }

    fn push(&mut self, chunk: Vec<u8>) -> Result<Option<ResidualSlicePacket>, StreamError> {
        check_chunk(self.next_read()?, &chunk)?;
        self.consumed += chunk.len() as u64;

        match self.state {
            ResidualFramerState::AwaitingSliceHeader => {
                let size = read_i32(&chunk, 8);
                if size < 0 {
                    return Err(StreamError::Framing(format!(
                        "residual slice at offset {} declares negative size {size}",
                        self.consumed - RESIDUAL_HEADER_LEN
                    )));
                }
                self.state = ResidualFramerState::AwaitingSlicePayload {
                    low: read_f32(&chunk, 0),
                    high: read_f32(&chunk, 4),
                    size: size as u32,
                };
                Ok(None)
            }
            ResidualFramerState::AwaitingSlicePayload { low, high, .. } => {
                self.state = if self.consumed == self.total_size {
                    ResidualFramerState::Exhausted
                } else {
                    ResidualFramerState::AwaitingSliceHeader
                };
                Ok(Some(ResidualSlicePacket {
                    low,
                    high,
                    payload: chunk,
                }))
            }
            ResidualFramerState::Exhausted => unreachable!("check_chunk rejects exhausted framers"),
        }
    }

    fn remaining(&self) -> u64 {
        self.total_size - self.consumed
    }

    fn is_exhausted(&self) -> bool {
        self.state == ResidualFramerState::Exhausted
    }
}

fn drain<F: Framer>(mut framer: F, bytes: &[u8]) -> Result<Vec<F::Frame>, StreamError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while let Some(len) = framer.next_read()? {
        let end = offset + len as usize;
        if let Some(frame) = framer.push(bytes[offset..end].to_vec())? {
            frames.push(frame);
        }
        offset = end;
    }
    Ok(frames)
}

/// Frame a complete in-memory base stream.
pub fn frame_base_stream(
    bytes: &[u8],
) -> Result<(VolumeDescriptor, Vec<SlicePacket>), StreamError> {
    let mut frames = drain(BaseFramer::new(bytes.len() as u64), bytes)?.into_iter();
    let Some(BaseFrame::Volume(descriptor)) = frames.next() else {
        return Err(StreamError::Framing("base stream has no volume header".into()));
    };
    let packets = frames
        .map(|frame| match frame {
            BaseFrame::Packet(packet) => Ok(packet),
            BaseFrame::Volume(_) => Err(StreamError::Framing("duplicate volume header".into())),
        })
        .collect::<Result<_, _>>()?;
    Ok((descriptor, packets))
}

/// Frame a complete in-memory residual stream.
pub fn frame_residual_stream(bytes: &[u8]) -> Result<Vec<ResidualSlicePacket>, StreamError> {
    drain(ResidualFramer::new(bytes.len() as u64), bytes)
}

/// Serialize a header and packets into a base stream.
pub fn encode_base_stream(
    descriptor: &VolumeDescriptor,
    packets: &[SlicePacket],
) -> Result<Vec<u8>, StreamError> {
    let mut out = descriptor.to_header_bytes().to_vec();
    for packet in packets {
        packet.encode(&mut out)?;
    }
    Ok(out)
}

pub fn encode_residual_stream(packets: &[ResidualSlicePacket]) -> Result<Vec<u8>, StreamError> {
    let mut out = Vec::new();
    for packet in packets {
        packet.encode(&mut out)?;
    }
    Ok(out)
}
