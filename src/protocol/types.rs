//! Shared enumerations and value types of the protocol.
//!
//! Enum values travel as lowercase string literals identical to their
//! symbolic names (`repeat_one`, `external_source`, ...). Roles carry a
//! `@v1` version suffix; the part before the `@` is the role family.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{base64::Base64, serde_as};

use crate::error::{Error, Result};

/// A capability role a client may declare and the server may grant.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Receives timestamped audio frames and schedules playback.
    #[serde(rename = "player@v1")]
    Player,
    /// Issues transport and volume commands for the group.
    #[serde(rename = "controller@v1")]
    Controller,
    /// Receives now-playing metadata.
    #[serde(rename = "metadata@v1")]
    Metadata,
    /// Receives artwork payloads on up to four channels.
    #[serde(rename = "artwork@v1")]
    Artwork,
    /// Receives visualizer data frames.
    #[serde(rename = "visualizer@v1")]
    Visualizer,
    /// Captures audio and uploads it to the server.
    #[serde(rename = "source@v1")]
    Source,
}

impl Role {
    /// Every role this implementation knows, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Player,
        Self::Controller,
        Self::Metadata,
        Self::Artwork,
        Self::Visualizer,
        Self::Source,
    ];

    /// The family of this role (the literal without the version suffix).
    #[must_use]
    pub fn family(self) -> Family {
        match self {
            Self::Player => Family::Player,
            Self::Controller => Family::Controller,
            Self::Metadata => Family::Metadata,
            Self::Artwork => Family::Artwork,
            Self::Visualizer => Family::Visualizer,
            Self::Source => Family::Source,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v1", self.family())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (family, version) = s
            .split_once('@')
            .ok_or_else(|| Error::invalid_argument(format!("role without version: {s}")))?;
        if version != "v1" {
            return Err(Error::invalid_argument(format!("unsupported role version: {s}")));
        }
        let family: Family = family.parse()?;
        Ok(match family {
            Family::Player => Self::Player,
            Family::Controller => Self::Controller,
            Family::Metadata => Self::Metadata,
            Family::Artwork => Self::Artwork,
            Family::Visualizer => Self::Visualizer,
            Family::Source => Self::Source,
        })
    }
}

/// A role family: the role literal stripped of its `@vN` suffix.
///
/// A single family appears at most once per session regardless of version.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// `player`
    Player,
    /// `controller`
    Controller,
    /// `metadata`
    Metadata,
    /// `artwork`
    Artwork,
    /// `visualizer`
    Visualizer,
    /// `source`
    Source,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Player => "player",
            Self::Controller => "controller",
            Self::Metadata => "metadata",
            Self::Artwork => "artwork",
            Self::Visualizer => "visualizer",
            Self::Source => "source",
        };
        f.write_str(name)
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "player" => Ok(Self::Player),
            "controller" => Ok(Self::Controller),
            "metadata" => Ok(Self::Metadata),
            "artwork" => Ok(Self::Artwork),
            "visualizer" => Ok(Self::Visualizer),
            "source" => Ok(Self::Source),
            _ => Err(Error::invalid_argument(format!("unknown role family: {s}"))),
        }
    }
}

/// Why a connection was opened. The registry prefers `playback` sessions
/// over `discovery` when the same client id appears twice.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionReason {
    /// Connection opened to enumerate and observe the client.
    #[default]
    Discovery,
    /// Connection opened to stream to the client.
    Playback,
}

/// Audio codecs the stream format may commit to.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Raw PCM samples.
    #[default]
    Pcm,
    /// FLAC bitstream.
    Flac,
    /// Opus bitstream.
    Opus,
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pcm" => Ok(Self::Pcm),
            "flac" => Ok(Self::Flac),
            "opus" => Ok(Self::Opus),
            _ => Err(Error::invalid_argument(format!("unknown codec: {s}"))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pcm => "pcm",
            Self::Flac => "flac",
            Self::Opus => "opus",
        };
        f.write_str(name)
    }
}

/// Playback state a session reports for its group.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Audio is being rendered.
    Playing,
    /// Playback is suspended but resumable.
    Paused,
    /// Nothing is scheduled.
    #[default]
    Stopped,
}

/// Client-reported synchronization state.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// The client clock is locked to the server clock.
    Synchronized,
    /// The client cannot render.
    Error,
    /// The client is playing from a local source.
    ExternalSource,
}

/// State of a source-role capture pipeline.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// No capture running.
    #[default]
    Idle,
    /// Capture frames are being uploaded.
    Streaming,
    /// The capture pipeline failed.
    Error,
}

/// Whether a source currently observes an input signal.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSignal {
    /// Signal presence has not been determined.
    #[default]
    Unknown,
    /// An input signal is present.
    Present,
    /// No input signal.
    Absent,
}

/// Reasons a peer gives when saying goodbye.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoodbyeReason {
    /// The client switched to a different server.
    AnotherServer,
    /// The client is shutting down.
    Shutdown,
    /// The client is restarting.
    Restart,
    /// A user asked to disconnect.
    UserRequest,
}

/// Commands a server may direct at a player role.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerCommand {
    /// Set the playback volume.
    Volume,
    /// Set the mute state.
    Mute,
}

/// Media commands a controller role may issue.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCommand {
    /// Start or resume playback.
    Play,
    /// Pause playback.
    Pause,
    /// Stop playback.
    Stop,
    /// Skip to the next item.
    Next,
    /// Skip to the previous item.
    Previous,
    /// Set group volume.
    Volume,
    /// Set group mute.
    Mute,
    /// Disable repeat.
    RepeatOff,
    /// Repeat the current item.
    RepeatOne,
    /// Repeat the whole queue.
    RepeatAll,
    /// Enable shuffle.
    Shuffle,
    /// Disable shuffle.
    Unshuffle,
    /// Switch the active group.
    Switch,
    /// Select an input source.
    SelectSource,
}

/// Commands a server directs at a source role.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCommand {
    /// Begin capturing.
    Start,
    /// Stop capturing.
    Stop,
}

/// Transport controls relayed through a source role to its origin device.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceControl {
    /// Resume the origin device.
    Play,
    /// Pause the origin device.
    Pause,
    /// Next item on the origin device.
    Next,
    /// Previous item on the origin device.
    Previous,
    /// Make this source the active input.
    Activate,
    /// Release this source.
    Deactivate,
}

/// Notifications a source client sends about its own capture state.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceClientCommand {
    /// Capture started.
    Started,
    /// Capture stopped.
    Stopped,
}

/// Repeat mode carried in metadata.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Repeat disabled.
    #[default]
    Off,
    /// Repeat the current item.
    One,
    /// Repeat the whole queue.
    All,
}

/// The stream format the server commits to send to a player.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerFormat {
    /// Committed codec.
    pub codec: Codec,
    /// Samples per second, nonzero.
    pub sample_rate: u32,
    /// Channel count, nonzero.
    pub channels: u32,
    /// Bits per sample, nonzero.
    pub bit_depth: u32,
    /// Codec initialization data, base64 on the wire.
    #[serde_as(as = "Option<Base64>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<Vec<u8>>,
}

impl Default for PlayerFormat {
    fn default() -> Self {
        Self {
            codec: Codec::Pcm,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            codec_header: None,
        }
    }
}

/// PCM output parameters a player can actually open a device with.
///
/// Construction validates the ranges the renderer supports; out-of-range
/// values fail instead of producing an unopenable output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    /// Samples per second.
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u32,
    /// 16, 24 or 32 bits per sample.
    pub bit_depth: u32,
}

impl PcmFormat {
    /// Validates and builds a PCM output format.
    ///
    /// # Errors
    ///
    /// Returns an out-of-range error when `sample_rate` is zero, `channels`
    /// is not 1 or 2, or `bit_depth` is not 16, 24 or 32.
    pub fn new(sample_rate: u32, channels: u32, bit_depth: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::out_of_range("sample_rate must be positive"));
        }
        if !matches!(channels, 1 | 2) {
            return Err(Error::out_of_range(format!(
                "channels must be 1 or 2, got {channels}"
            )));
        }
        if !matches!(bit_depth, 16 | 24 | 32) {
            return Err(Error::out_of_range(format!(
                "bit_depth must be 16, 24 or 32, got {bit_depth}"
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            bit_depth,
        })
    }
}

/// Per-channel artwork configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkChannel {
    /// What the channel shows (e.g. cover, fanart).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Image container format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Target width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_width: Option<u32>,
    /// Target height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_height: Option<u32>,
}

/// Now-playing metadata pushed to metadata roles.
///
/// Every optional field is three-valued: absent leaves the receiver's
/// cached value untouched, an explicit `null` clears it, a value replaces
/// it. See [`Undefined`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Server clock of the update, microseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Track title.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub title: Undefined<String>,
    /// Track artist.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub artist: Undefined<String>,
    /// Album title.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub album: Undefined<String>,
    /// Album artist.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub album_artist: Undefined<String>,
    /// URL of the cover artwork.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub artwork_url: Undefined<String>,
    /// Release year.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub year: Undefined<i32>,
    /// Track number.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub track: Undefined<u32>,
    /// Playback progress in seconds.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub progress: Undefined<f64>,
    /// Repeat mode.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub repeat: Undefined<RepeatMode>,
    /// Shuffle state.
    #[serde(default, skip_serializing_if = "Undefined::is_absent")]
    pub shuffle: Undefined<bool>,
}

impl Metadata {
    /// Applies this update onto a cached snapshot.
    pub fn merge_into(&self, snapshot: &mut MetadataSnapshot) {
        snapshot.timestamp = self.timestamp;
        self.title.clone().merge_into(&mut snapshot.title);
        self.artist.clone().merge_into(&mut snapshot.artist);
        self.album.clone().merge_into(&mut snapshot.album);
        self.album_artist.clone().merge_into(&mut snapshot.album_artist);
        self.artwork_url.clone().merge_into(&mut snapshot.artwork_url);
        self.year.merge_into(&mut snapshot.year);
        self.track.merge_into(&mut snapshot.track);
        self.progress.merge_into(&mut snapshot.progress);
        self.repeat.merge_into(&mut snapshot.repeat);
        self.shuffle.merge_into(&mut snapshot.shuffle);
    }
}

/// The resolved view of accumulated [`Metadata`] updates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataSnapshot {
    /// Server clock of the latest update, microseconds.
    pub timestamp: i64,
    /// Track title.
    pub title: Option<String>,
    /// Track artist.
    pub artist: Option<String>,
    /// Album title.
    pub album: Option<String>,
    /// Album artist.
    pub album_artist: Option<String>,
    /// URL of the cover artwork.
    pub artwork_url: Option<String>,
    /// Release year.
    pub year: Option<i32>,
    /// Track number.
    pub track: Option<u32>,
    /// Playback progress in seconds.
    pub progress: Option<f64>,
    /// Repeat mode.
    pub repeat: Option<RepeatMode>,
    /// Shuffle state.
    pub shuffle: Option<bool>,
}

/// A field that distinguishes "not sent" from an explicit `null`.
///
/// Metadata merges need all three states: absent leaves the receiver's
/// value untouched, `null` clears it, a value replaces it.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Undefined<T> {
    /// The field was not present.
    #[default]
    Absent,
    /// The field was present and explicitly `null`.
    Null,
    /// The field carried a value.
    Value(T),
}

impl<T> Undefined<T> {
    /// Whether the field was not present at all.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The carried value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Applies this field to `target`: absent keeps it, null clears it,
    /// a value replaces it.
    pub fn merge_into(self, target: &mut Option<T>) {
        match self {
            Self::Absent => {}
            Self::Null => *target = None,
            Self::Value(value) => *target = Some(value),
        }
    }
}

impl<T: Serialize> Serialize for Undefined<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            // Absent fields are skipped at the struct level; an unskipped
            // Absent degrades to null.
            Self::Absent | Self::Null => serializer.serialize_none(),
            Self::Value(value) => serializer.serialize_some(value),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Undefined<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            None => Self::Null,
            Some(value) => Self::Value(value),
        })
    }
}
