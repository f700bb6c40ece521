//! JSON envelope contracts.
//!
//! Every control message is `{"type": "...", "payload": {...}}`. Messages
//! are split by direction into [`ClientMessage`] (client to server) and
//! [`ServerMessage`] (server to client); both map onto the wire through an
//! adjacently tagged enum with the `type` literal as discriminator.
//!
//! Inbound hello handling is deliberately lenient: a wrong-typed `version`
//! or a malformed capability block must surface as the matching handshake
//! validation failure, not as a JSON parse error, so those fields degrade
//! to `None` instead of failing the whole envelope.

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::types::{
    ArtworkChannel, ClientState, ConnectionReason, GoodbyeReason, MediaCommand, Metadata,
    PlaybackState, PlayerCommand, PlayerFormat, Role, SourceClientCommand, SourceCommand,
    SourceControl, SourceSignal, SourceState,
};
use crate::error::Result;

/// Messages a client sends to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Opening handshake with declared roles and capabilities.
    #[serde(rename = "client/hello")]
    Hello(ClientHello),

    /// A time-sync probe.
    #[serde(rename = "client/time")]
    Time(ClientTime),

    /// Player/source state report.
    #[serde(rename = "client/state")]
    State(ClientStateUpdate),

    /// Controller or source command.
    #[serde(rename = "client/command")]
    Command(ClientCommand),

    /// Orderly departure.
    #[serde(rename = "client/goodbye")]
    Goodbye(ClientGoodbye),

    /// Request to change the committed stream format.
    #[serde(rename = "stream/request-format")]
    RequestFormat(StreamRequestFormat),
}

/// Messages the server sends to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// Handshake reply with granted roles.
    #[serde(rename = "server/hello")]
    Hello(ServerHello),

    /// Time-sync reply.
    #[serde(rename = "server/time")]
    Time(ServerTime),

    /// Metadata and controller state fan-out.
    #[serde(rename = "server/state")]
    State(ServerState),

    /// Command directed at the player or source role.
    #[serde(rename = "server/command")]
    Command(ServerCommand),

    /// Group membership / playback-state update.
    #[serde(rename = "group/update")]
    GroupUpdate(GroupUpdate),

    /// Stream opening or format change announcement.
    #[serde(rename = "stream/start")]
    StreamStart(StreamStart),

    /// Request to clear buffered but unplayed data.
    #[serde(rename = "stream/clear")]
    StreamClear(StreamClear),

    /// Stream teardown announcement.
    #[serde(rename = "stream/end")]
    StreamEnd(StreamEnd),
}

impl ClientMessage {
    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parses an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or an unknown `type`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Into::into)
    }
}

impl ServerMessage {
    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parses an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or an unknown `type`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Into::into)
    }
}

/// `client/hello` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Stable identity of the client. Trimmed-nonempty is enforced during
    /// handshake validation, not during parsing.
    #[serde(default)]
    pub client_id: String,

    /// Human-readable client name.
    #[serde(default)]
    pub name: String,

    /// Protocol version; anything but `1` is rejected at handshake.
    #[serde(default, deserialize_with = "lenient_u32")]
    pub version: Option<u32>,

    /// Role literals the client offers, in preference order. Kept as raw
    /// values: non-string entries are tolerated and skipped during role
    /// resolution.
    #[serde(default, deserialize_with = "lenient_array")]
    pub supported_roles: Vec<Value>,

    /// Free-form device description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<Value>,

    /// Player capability block; required iff the player role is admitted.
    #[serde(
        rename = "player@v1_support",
        alias = "player_support",
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub player_support: Option<PlayerSupport>,

    /// Artwork capability block.
    #[serde(
        rename = "artwork@v1_support",
        alias = "artwork_support",
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub artwork_support: Option<ArtworkSupport>,

    /// Visualizer capability block.
    #[serde(
        rename = "visualizer@v1_support",
        alias = "visualizer_support",
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub visualizer_support: Option<VisualizerSupport>,

    /// Source capability block.
    #[serde(
        rename = "source@v1_support",
        alias = "source_support",
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_support: Option<SourceSupport>,
}

/// Player capability block of `client/hello`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerSupport {
    /// Formats the player can render, in preference order.
    #[serde(default)]
    pub supported_formats: Vec<FormatOffer>,

    /// Player-side jitter buffer capacity in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_capacity: Option<u64>,

    /// Player commands the client honors; `volume` / `mute` here arm the
    /// server's expectation that state reports carry those fields.
    #[serde(default, deserialize_with = "lenient_vec")]
    pub supported_commands: Vec<PlayerCommand>,
}

/// One entry of a player's `supported_formats` list.
///
/// Offers are matched loosely: an unknown codec or a non-positive parameter
/// disqualifies the entry without failing the handshake.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatOffer {
    /// Codec name; unknown names are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,

    /// Samples per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<serde_json::Number>,

    /// Channel count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<serde_json::Number>,

    /// Bits per sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<serde_json::Number>,
}

impl FormatOffer {
    /// Builds an offer from concrete parameters.
    #[must_use]
    pub fn new(codec: &str, sample_rate: u32, channels: u32, bit_depth: u32) -> Self {
        Self {
            codec: Some(codec.to_string()),
            sample_rate: Some(sample_rate.into()),
            channels: Some(channels.into()),
            bit_depth: Some(bit_depth.into()),
        }
    }
}

/// Artwork capability block of `client/hello`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtworkSupport {
    /// Channel configurations, index-aligned, at most four.
    #[serde(default)]
    pub channels: Vec<ArtworkChannel>,
}

/// Visualizer capability block of `client/hello`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizerSupport {
    /// Free-form visualizer configuration.
    #[serde(flatten)]
    pub config: serde_json::Map<String, Value>,
}

/// Source capability block of `client/hello`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSupport {
    /// Free-form source-capture configuration.
    #[serde(flatten)]
    pub config: serde_json::Map<String, Value>,
}

/// `client/time` payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTime {
    /// Client clock at transmission, microseconds.
    pub client_transmitted: i64,
}

/// `client/state` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStateUpdate {
    /// Top-level client state; `player.state` is the fallback when this
    /// is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClientState>,

    /// Player block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerStateBlock>,

    /// Source block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceStateBlock>,
}

/// Player part of `client/state`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerStateBlock {
    /// Player-scoped client state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClientState>,

    /// Current volume, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,

    /// Current mute state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

/// Source part of `client/state`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStateBlock {
    /// Capture pipeline state.
    #[serde(default)]
    pub state: SourceState,

    /// Input level, implementation-defined scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,

    /// Input signal presence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SourceSignal>,
}

/// `client/command` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCommand {
    /// Command issued by a controller role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerCommand>,

    /// Notification from a source role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceNotification>,
}

/// Controller part of `client/command`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerCommand {
    /// The media command.
    pub command: MediaCommand,

    /// Target volume for `volume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,

    /// Target mute state for `mute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,

    /// Target source for `select_source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

/// Source part of `client/command`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNotification {
    /// What the source client reports.
    pub command: SourceClientCommand,
}

/// `client/goodbye` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGoodbye {
    /// Why the client is leaving.
    pub reason: GoodbyeReason,
}

/// `stream/request-format` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRequestFormat {
    /// Requested player format changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerFormatRequest>,

    /// Requested artwork channel changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<ArtworkFormatRequest>,
}

/// Player part of `stream/request-format`; fields merge over the current
/// committed format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerFormatRequest {
    /// Requested codec name; unknown names are dropped, the rest of the
    /// request still merges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,

    /// Requested sample rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    /// Requested channel count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,

    /// Requested bit depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u32>,
}

/// Artwork part of `stream/request-format`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtworkFormatRequest {
    /// Channel index; floored, then ignored when outside 0..=3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<f64>,

    /// Requested artwork source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Requested image format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Requested width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_width: Option<u32>,

    /// Requested height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_height: Option<u32>,
}

/// `server/hello` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Stable identity of the server.
    pub server_id: String,

    /// Human-readable server name.
    pub name: String,

    /// Protocol version, always `1`.
    pub version: u32,

    /// Roles the server granted, in admission order.
    pub active_roles: Vec<Role>,

    /// Why this connection exists.
    #[serde(default)]
    pub connection_reason: ConnectionReason,
}

/// `server/time` payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTime {
    /// Echo of the probe's client clock, microseconds.
    pub client_transmitted: i64,

    /// Server clock when the probe arrived, microseconds.
    pub server_received: i64,

    /// Server clock when the reply left, microseconds.
    pub server_transmitted: i64,
}

/// `server/state` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    /// Now-playing metadata for metadata roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Controller state for controller roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerState>,
}

/// Controller part of `server/state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Media commands currently available.
    #[serde(default)]
    pub supported_commands: Vec<MediaCommand>,

    /// Group volume, 0..=100.
    #[serde(default)]
    pub volume: u32,

    /// Group mute state.
    #[serde(default)]
    pub muted: bool,

    /// Selectable input sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceInfo>>,
}

/// A selectable input source advertised to controllers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Stable source identity.
    pub id: String,

    /// Human-readable source name.
    pub name: String,
}

/// `server/command` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    /// Command for the player role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerDirective>,

    /// Command for the source role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDirective>,
}

/// Player part of `server/command`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerDirective {
    /// The player command.
    pub command: PlayerCommand,

    /// Target volume for `volume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,

    /// Target mute state for `mute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

/// Source part of `server/command`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDirective {
    /// Capture start/stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<SourceCommand>,

    /// Transport control relayed to the origin device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<SourceControl>,

    /// Voice-activity-detection tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad: Option<VadConfig>,
}

/// Voice-activity-detection parameters of a source directive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    /// Detection threshold in decibels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_db: Option<f64>,

    /// Hold time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_ms: Option<u64>,
}

/// `group/update` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    /// Current playback state of the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_state: Option<PlaybackState>,

    /// Group identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Group display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// `stream/start` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    /// Committed player format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerFormat>,

    /// Artwork channel layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<ArtworkStart>,

    /// Visualizer configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualizer: Option<serde_json::Map<String, Value>>,
}

/// Artwork part of `stream/start`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtworkStart {
    /// Channel configurations, index-aligned.
    pub channels: Vec<ArtworkChannel>,
}

/// `stream/clear` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamClear {
    /// Role families to clear; absent means all streaming roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<super::types::Family>>,
}

/// `stream/end` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    /// Role families the stream ends for; absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<super::types::Family>>,
}

/// Tolerant `u32` field: any non-numeric or out-of-range value becomes
/// `None` instead of failing the envelope.
fn lenient_u32<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u32>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_u64().and_then(|v| u32::try_from(v).ok()))
}

/// Tolerant array field: a non-array value becomes an empty vector.
fn lenient_array<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

/// Tolerant optional block: a malformed block reads as absent so handshake
/// validation reports the missing capability instead of a parse error.
fn lenient_block<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Tolerant homogeneous list: unparseable entries are skipped.
fn lenient_vec<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::types::{Family, Undefined};

    #[test]
    fn hello_roundtrip_uses_canonical_support_keys() {
        let hello = ClientMessage::Hello(ClientHello {
            client_id: "c1".to_string(),
            name: "Kitchen".to_string(),
            version: Some(1),
            supported_roles: vec![json!("player@v1")],
            player_support: Some(PlayerSupport {
                supported_formats: vec![FormatOffer::new("pcm", 48_000, 2, 16)],
                buffer_capacity: Some(524_288),
                supported_commands: vec![PlayerCommand::Volume, PlayerCommand::Mute],
            }),
            ..ClientHello::default()
        });

        let wire = hello.to_json().unwrap();
        assert!(wire.contains("\"client/hello\""));
        assert!(wire.contains("\"player@v1_support\""));
        assert_eq!(ClientMessage::from_json(&wire).unwrap(), hello);
    }

    #[test]
    fn hello_accepts_legacy_support_alias() {
        let wire = json!({
            "type": "client/hello",
            "payload": {
                "client_id": "c1",
                "name": "n",
                "version": 1,
                "supported_roles": ["player@v1"],
                "player_support": {"supported_formats": []},
            },
        });
        let ClientMessage::Hello(hello) =
            serde_json::from_value::<ClientMessage>(wire).unwrap()
        else {
            panic!("expected hello");
        };
        assert!(hello.player_support.is_some());
    }

    #[test]
    fn hello_tolerates_wrong_typed_fields() {
        let wire = json!({
            "type": "client/hello",
            "payload": {
                "client_id": "c1",
                "version": "one",
                "supported_roles": "player@v1",
                "player@v1_support": 17,
            },
        });
        let ClientMessage::Hello(hello) =
            serde_json::from_value::<ClientMessage>(wire).unwrap()
        else {
            panic!("expected hello");
        };
        assert_eq!(hello.version, None);
        assert!(hello.supported_roles.is_empty());
        assert!(hello.player_support.is_none());
    }

    #[test]
    fn server_time_roundtrip() {
        let msg = ServerMessage::Time(ServerTime {
            client_transmitted: 1,
            server_received: 2,
            server_transmitted: 3,
        });
        let wire = msg.to_json().unwrap();
        assert!(wire.contains("\"server/time\""));
        assert_eq!(ServerMessage::from_json(&wire).unwrap(), msg);
    }

    #[test]
    fn stream_clear_parses_role_families() {
        let msg = ServerMessage::from_json(
            r#"{"type":"stream/clear","payload":{"roles":["player","visualizer"]}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::StreamClear(StreamClear {
                roles: Some(vec![Family::Player, Family::Visualizer]),
            })
        );
    }

    #[test]
    fn metadata_null_and_absent_fields_differ_on_the_wire() {
        let state = ServerState {
            metadata: Some(Metadata {
                timestamp: 7,
                title: Undefined::Value("Song".to_string()),
                artist: Undefined::Null,
                ..Metadata::default()
            }),
            controller: None,
        };
        let json = serde_json::to_value(ServerMessage::State(state)).unwrap();
        let metadata = &json["payload"]["metadata"];
        assert_eq!(metadata["title"], "Song");
        assert!(metadata["artist"].is_null());
        assert!(metadata.get("album").is_none());
    }

    #[test]
    fn unknown_envelope_type_fails_parse() {
        assert!(ClientMessage::from_json(r#"{"type":"client/nonsense","payload":{}}"#).is_err());
    }

    #[test]
    fn command_envelope_roundtrip() {
        let msg = ClientMessage::Command(ClientCommand {
            controller: Some(ControllerCommand {
                command: MediaCommand::SelectSource,
                volume: None,
                mute: None,
                source_id: Some("aux".to_string()),
            }),
            source: None,
        });
        let wire = msg.to_json().unwrap();
        assert!(wire.contains("\"select_source\""));
        assert_eq!(ClientMessage::from_json(&wire).unwrap(), msg);
    }

    #[test]
    fn goodbye_reason_literals() {
        let msg = ClientMessage::Goodbye(ClientGoodbye {
            reason: GoodbyeReason::UserRequest,
        });
        assert!(msg.to_json().unwrap().contains("\"user_request\""));
    }
}
