//! Binary frame header codec.
//!
//! Every binary WebSocket message starts with nine bytes: a one-byte frame
//! type tag followed by the event timestamp as a big-endian signed 64-bit
//! microsecond count. The payload body follows immediately; frame boundaries
//! come from the WebSocket message boundary, not from any length field.

use thiserror::Error;

use crate::error::{Error, Result};

/// Wire size of the binary frame header.
pub const HEADER_LEN: usize = 9;

/// Known binary frame type tags.
///
/// Unknown tags are tolerated on receive; consumers ignore frames they do
/// not understand.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FrameType {
    /// PCM or compressed audio, server to player.
    AudioChunk = 4,
    /// Artwork payload for channel 0, server to artwork role.
    ArtworkChannel0 = 8,
    /// Artwork payload for channel 1.
    ArtworkChannel1 = 9,
    /// Artwork payload for channel 2.
    ArtworkChannel2 = 10,
    /// Artwork payload for channel 3.
    ArtworkChannel3 = 11,
    /// Captured audio, source to server.
    SourceAudioChunk = 12,
    /// Visualizer data, server to visualizer role.
    VisualizationData = 16,
}

impl FrameType {
    /// Looks up a known frame type by wire tag.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            4 => Some(Self::AudioChunk),
            8 => Some(Self::ArtworkChannel0),
            9 => Some(Self::ArtworkChannel1),
            10 => Some(Self::ArtworkChannel2),
            11 => Some(Self::ArtworkChannel3),
            12 => Some(Self::SourceAudioChunk),
            16 => Some(Self::VisualizationData),
            _ => None,
        }
    }

    /// The wire tag of this frame type.
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// The artwork frame type for a channel index, `None` above channel 3.
    #[must_use]
    pub fn artwork_channel(channel: u8) -> Option<Self> {
        Self::from_tag(Self::ArtworkChannel0.tag().checked_add(channel)?)
            .filter(|t| t.artwork_index().is_some())
    }

    /// The artwork channel index encoded by this tag, if any.
    #[must_use]
    pub fn artwork_index(self) -> Option<u8> {
        match self {
            Self::ArtworkChannel0 => Some(0),
            Self::ArtworkChannel1 => Some(1),
            Self::ArtworkChannel2 => Some(2),
            Self::ArtworkChannel3 => Some(3),
            _ => None,
        }
    }
}

/// Raised when a binary frame is shorter than [`HEADER_LEN`] bytes.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("binary frame of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
pub struct ShortHeader {
    /// Observed frame length.
    pub len: usize,
}

/// The decoded 9-byte header of a binary frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinaryHeader {
    /// Frame type tag. Unknown values survive decoding untouched.
    pub tag: u8,
    /// Event timestamp in server-clock microseconds.
    pub timestamp_us: i64,
}

impl BinaryHeader {
    /// Builds a header for a known frame type.
    #[must_use]
    pub fn new(frame_type: FrameType, timestamp_us: i64) -> Self {
        Self {
            tag: frame_type.tag(),
            timestamp_us,
        }
    }

    /// The known frame type for this tag, `None` for foreign tags.
    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_tag(self.tag)
    }

    /// Packs the header into its nine wire bytes.
    #[must_use]
    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.tag;
        buf[1..].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf
    }

    /// Unpacks a header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::InvalidArgument`](crate::error::ErrorKind)
    /// error wrapping [`ShortHeader`] when `buf` holds fewer than
    /// [`HEADER_LEN`] bytes.
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::invalid_argument(ShortHeader { len: buf.len() }));
        }

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[1..HEADER_LEN]);
        Ok(Self {
            tag: buf[0],
            timestamp_us: i64::from_be_bytes(timestamp),
        })
    }
}

/// Packs a complete binary frame: header followed by the payload body.
#[must_use]
pub fn pack_frame(frame_type: FrameType, timestamp_us: i64, payload: &[u8]) -> Vec<u8> {
    let header = BinaryHeader::new(frame_type, timestamp_us);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.pack());
    frame.extend_from_slice(payload);
    frame
}
