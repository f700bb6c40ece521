//! Server-side per-connection protocol driver.
//!
//! A [`Session`] owns one client connection for the lifetime of its
//! transport: it runs the hello handshake with role negotiation, gates the
//! player's initial state report, fans inbound state and commands out to
//! hooks, and fans stream data out to the peer with backpressure applied
//! per frame class. All mutable state lives behind one lock that is never
//! held across an await; message handlers execute serially per connection.

use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use serde_json::Value;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::{
    error::Result,
    protocol::{
        frame::{self, BinaryHeader, FrameType},
        messages::{
            ArtworkStart, ClientHello, ClientMessage, ControllerCommand, ControllerState,
            GroupUpdate, PlayerSupport, ServerCommand, ServerHello, ServerMessage, ServerState,
            ServerTime, SourceStateBlock, StreamClear, StreamEnd, StreamStart,
        },
        types::{
            ArtworkChannel, ClientState, Codec, ConnectionReason, Family, GoodbyeReason, Metadata,
            PlaybackState, PlayerCommand, PlayerFormat, Role, SourceClientCommand,
        },
        PROTOCOL_VERSION,
    },
    transport::{Transport, CLOSE_POLICY_VIOLATION},
    util::Clock,
};

/// Backpressure threshold: no binary frame is emitted while more than this
/// many bytes sit unsent in the transport.
pub const MAX_BUFFERED: usize = 512 * 1024;

/// Delay before the single deferred retry of a throttled PCM frame.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Retention of the sliding drop-event window.
const DROP_WINDOW_US: i64 = 5 * 60 * 1_000_000;

/// Identity and limits of the server every session announces.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Stable server identity sent in `server/hello`.
    pub server_id: String,
    /// Human-readable server name.
    pub name: String,
    /// Announced protocol version.
    pub version: u32,
    /// Roles this server grants.
    pub supported_roles: Vec<Role>,
    /// How long a player session may take to report its initial state.
    pub initial_state_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: Uuid::new_v4().to_string(),
            name: "sendspin".to_string(),
            version: PROTOCOL_VERSION,
            supported_roles: Role::ALL.to_vec(),
            initial_state_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-connection metadata extracted by the host when accepting the socket.
#[derive(Clone, Debug, Default)]
pub struct ConnectMeta {
    /// Peer address, when known.
    pub remote_addr: Option<SocketAddr>,
    /// Why the connection was opened.
    pub connection_reason: ConnectionReason,
    /// Zone the connection belongs to, from the `zone` query parameter.
    pub zone_id: Option<i64>,
    /// Player identity, from the `player` query parameter.
    pub player_id: Option<String>,
}

impl ConnectMeta {
    /// Extracts `zone` and `player` from a request URL's query string.
    ///
    /// # Errors
    ///
    /// Returns an error when `request_url` is not a parseable URL.
    pub fn from_request_url(request_url: &str, reason: ConnectionReason) -> Result<Self> {
        let url = Url::parse(request_url)?;
        let mut meta = Self {
            connection_reason: reason,
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "zone" => meta.zone_id = value.parse().ok(),
                "player" => meta.player_id = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(meta)
    }
}

/// Shared callback attached to a session.
pub type Hook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callbacks a host attaches to observe one session.
///
/// Hooks may be attached late through the registry; events that carry
/// admission results (`on_identified`, `on_unsupported_roles`) latch and
/// replay on attachment so a late binder still observes them.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// Handshake complete and, for players, initial state received.
    /// Fires at most once per session.
    pub on_identified: Option<Hook<SessionDescriptor>>,
    /// The session was destroyed. Fires exactly once.
    pub on_disconnected: Option<Hook<SessionDescriptor>>,
    /// The peer said goodbye.
    pub on_goodbye: Option<Hook<GoodbyeReason>>,
    /// Roles the peer offered that this server does not grant.
    pub on_unsupported_roles: Option<Hook<Vec<String>>>,
    /// Player state report.
    pub on_player_state: Option<Hook<PlayerStateEvent>>,
    /// Source state report.
    pub on_source_state: Option<Hook<SourceStateBlock>>,
    /// Controller command for the group.
    pub on_group_command: Option<Hook<ControllerCommand>>,
    /// Source client notification.
    pub on_source_command: Option<Hook<SourceClientCommand>>,
    /// Captured audio frame from a source role.
    pub on_source_audio: Option<Hook<SourceAudioEvent>>,
    /// The committed player format changed on client request.
    pub on_format_changed: Option<Hook<PlayerFormat>>,
}

impl std::fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}

/// Cloneable identity snapshot of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Client identity from the hello.
    pub client_id: String,
    /// Client display name.
    pub client_name: String,
    /// Granted roles, admission order.
    pub active_roles: Vec<Role>,
    /// Why the connection exists.
    pub connection_reason: ConnectionReason,
    /// Peer address, when known.
    pub remote_addr: Option<SocketAddr>,
}

/// Player state extracted from a `client/state` report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayerStateEvent {
    /// Reported client state.
    pub state: Option<ClientState>,
    /// Reported volume.
    pub volume: Option<u32>,
    /// Reported mute state.
    pub muted: Option<bool>,
}

/// A captured audio frame uploaded by a source role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceAudioEvent {
    /// Capture timestamp, server clock microseconds.
    pub timestamp_us: i64,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

/// Backpressure counters of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackpressureStats {
    /// Frames dropped since the session opened.
    pub total_drops: u64,
    /// Size of the most recently dropped frame.
    pub last_drop_bytes: Option<usize>,
    /// When the most recent drop happened, server clock microseconds.
    pub last_drop_at_us: Option<i64>,
    /// Drops within the sliding five-minute window.
    pub drops_last_5min: usize,
}

#[derive(Debug, Default)]
struct DropLedger {
    total: u64,
    last_bytes: Option<usize>,
    last_at_us: Option<i64>,
    window: VecDeque<i64>,
}

impl DropLedger {
    fn record(&mut self, bytes: usize, at_us: i64) {
        self.total += 1;
        self.last_bytes = Some(bytes);
        self.last_at_us = Some(at_us);
        self.window.push_back(at_us);
    }

    fn stats(&mut self, now_us: i64) -> BackpressureStats {
        while let Some(&oldest) = self.window.front() {
            if now_us - oldest > DROP_WINDOW_US {
                self.window.pop_front();
            } else {
                break;
            }
        }
        BackpressureStats {
            total_drops: self.total,
            last_drop_bytes: self.last_bytes,
            last_drop_at_us: self.last_at_us,
            drops_last_5min: self.window.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    AwaitHello,
    Ready,
    Closed,
}

struct SessionState {
    phase: Phase,
    client_id: Option<String>,
    client_name: String,
    active_roles: Vec<Role>,
    player_support: Option<PlayerSupport>,
    artwork_channels: Vec<ArtworkChannel>,
    expect_volume: bool,
    expect_mute: bool,
    warned_state_expectations: bool,
    initial_state_received: bool,
    identified: bool,
    identified_fired: bool,
    unsupported_roles: Vec<String>,
    unsupported_fired: bool,
    active_stream: bool,
    stream_format: PlayerFormat,
    playback_state: PlaybackState,
    goodbye_reason: Option<GoodbyeReason>,
    source_status: Option<SourceStateBlock>,
    drops: DropLedger,
    hooks: SessionHooks,
    hooks_attached: bool,
    disconnected_fired: bool,
    initial_state_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::AwaitHello,
            client_id: None,
            client_name: String::new(),
            active_roles: Vec::new(),
            player_support: None,
            artwork_channels: Vec::new(),
            expect_volume: false,
            expect_mute: false,
            warned_state_expectations: false,
            initial_state_received: false,
            identified: false,
            identified_fired: false,
            unsupported_roles: Vec::new(),
            unsupported_fired: false,
            active_stream: false,
            stream_format: PlayerFormat::default(),
            playback_state: PlaybackState::Stopped,
            goodbye_reason: None,
            source_status: None,
            drops: DropLedger::default(),
            hooks: SessionHooks::default(),
            hooks_attached: false,
            disconnected_fired: false,
            initial_state_timer: None,
        }
    }

    fn has_role(&self, role: Role) -> bool {
        self.active_roles.contains(&role)
    }

    /// Recomputes `identified` and returns whether it just became true.
    fn refresh_identified(&mut self) -> bool {
        let ready = self.phase == Phase::Ready;
        let gated = self.has_role(Role::Player) && !self.initial_state_received;
        let identified = ready && !gated;
        let transitioned = identified && !self.identified;
        self.identified = identified;
        transitioned
    }
}

/// One server-side connection.
pub struct Session {
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    meta: ConnectMeta,
    clock: Clock,
    weak: Weak<Session>,
    state: Mutex<SessionState>,
}

/// Invokes a hook with panic isolation.
fn fire<T>(hook: Option<&Hook<T>>, event: &T) {
    if let Some(hook) = hook {
        if panic::catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
            warn!("session hook panicked");
        }
    }
}

impl Session {
    /// Creates a session over an accepted transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ServerConfig,
        meta: ConnectMeta,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            config,
            meta,
            clock,
            weak: weak.clone(),
            state: Mutex::new(SessionState::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Client identity, once the hello has been accepted.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    /// Granted roles in admission order.
    #[must_use]
    pub fn active_roles(&self) -> Vec<Role> {
        self.lock().active_roles.clone()
    }

    /// The currently committed player stream format.
    #[must_use]
    pub fn stream_format(&self) -> PlayerFormat {
        self.lock().stream_format.clone()
    }

    /// Whether the handshake completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().phase == Phase::Ready
    }

    /// Whether the session is ready and, for players, reported its state.
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.lock().identified
    }

    /// Whether a stream is currently announced to the peer.
    #[must_use]
    pub fn has_active_stream(&self) -> bool {
        self.lock().active_stream
    }

    /// Why this connection exists.
    #[must_use]
    pub fn connection_reason(&self) -> ConnectionReason {
        self.meta.connection_reason
    }

    /// Peer address, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.meta.remote_addr
    }

    /// The reason from the peer's goodbye, if one arrived.
    #[must_use]
    pub fn goodbye_reason(&self) -> Option<GoodbyeReason> {
        self.lock().goodbye_reason
    }

    /// Last reported source status.
    #[must_use]
    pub fn source_status(&self) -> Option<SourceStateBlock> {
        self.lock().source_status
    }

    /// Whether hooks have been attached.
    #[must_use]
    pub fn hooks_attached(&self) -> bool {
        self.lock().hooks_attached
    }

    /// Backpressure counters; prunes the sliding window as a side effect.
    #[must_use]
    pub fn backpressure_stats(&self) -> BackpressureStats {
        let now = self.clock.now_us();
        self.lock().drops.stats(now)
    }

    /// Identity snapshot of the session.
    #[must_use]
    pub fn descriptor(&self) -> SessionDescriptor {
        let state = self.lock();
        SessionDescriptor {
            client_id: state.client_id.clone().unwrap_or_default(),
            client_name: state.client_name.clone(),
            active_roles: state.active_roles.clone(),
            connection_reason: self.meta.connection_reason,
            remote_addr: self.meta.remote_addr,
        }
    }

    /// Attaches hooks, replaying latched admission events.
    pub fn set_hooks(&self, hooks: SessionHooks) {
        let (hooks, unsupported, fire_identified, fire_unsupported) = {
            let mut state = self.lock();
            state.hooks = hooks;
            state.hooks_attached = true;

            let fire_identified = state.identified && !state.identified_fired;
            if fire_identified {
                state.identified_fired = true;
            }
            let fire_unsupported = !state.unsupported_roles.is_empty() && !state.unsupported_fired;
            if fire_unsupported {
                state.unsupported_fired = true;
            }
            (
                state.hooks.clone(),
                state.unsupported_roles.clone(),
                fire_identified,
                fire_unsupported,
            )
        };

        if fire_unsupported {
            fire(hooks.on_unsupported_roles.as_ref(), &unsupported);
        }
        if fire_identified {
            fire(hooks.on_identified.as_ref(), &self.descriptor());
        }
    }

    /// Detaches all hooks.
    pub fn clear_hooks(&self) {
        let mut state = self.lock();
        state.hooks = SessionHooks::default();
        state.hooks_attached = false;
    }

    // ---- inbound ----------------------------------------------------------

    /// Feeds one inbound text message into the state machine.
    pub async fn handle_text(&self, text: &str) {
        let phase = self.lock().phase;
        match phase {
            Phase::Closed => {}
            Phase::AwaitHello => self.handle_hello_phase(text).await,
            Phase::Ready => self.handle_ready_phase(text).await,
        }
    }

    /// Feeds one inbound binary message into the state machine.
    pub fn handle_binary(&self, data: &[u8]) {
        let state = self.lock();
        if state.phase != Phase::Ready {
            return;
        }
        let has_source = state.has_role(Role::Source);
        let hook = state.hooks.on_source_audio.clone();
        drop(state);

        let Ok(header) = BinaryHeader::unpack(data) else {
            trace!("dropping undersized binary frame");
            return;
        };
        if header.frame_type() != Some(FrameType::SourceAudioChunk) || !has_source {
            return;
        }
        fire(
            hook.as_ref(),
            &SourceAudioEvent {
                timestamp_us: header.timestamp_us,
                data: data[frame::HEADER_LEN..].to_vec(),
            },
        );
    }

    async fn handle_hello_phase(&self, text: &str) {
        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            trace!("dropping malformed text frame before hello");
            return;
        };
        if envelope.get("type").and_then(Value::as_str) != Some("client/hello") {
            self.close_policy("expected client/hello first").await;
            return;
        }
        let payload = envelope.get("payload").cloned().unwrap_or_default();
        let hello: ClientHello = serde_json::from_value(payload).unwrap_or_default();

        if hello.version != Some(PROTOCOL_VERSION) {
            self.close_policy("invalid protocol version").await;
            return;
        }
        let client_id = hello.client_id.trim().to_string();
        if client_id.is_empty() {
            self.close_policy("missing client_id").await;
            return;
        }
        if hello.supported_roles.is_empty() {
            self.close_policy("missing supported_roles").await;
            return;
        }

        let (active_roles, unsupported_roles) = self.resolve_roles(&hello.supported_roles);

        for role in &active_roles {
            let missing = match role {
                Role::Player => hello.player_support.is_none(),
                Role::Artwork => hello.artwork_support.is_none(),
                Role::Visualizer => hello.visualizer_support.is_none(),
                Role::Source => hello.source_support.is_none(),
                Role::Controller | Role::Metadata => false,
            };
            if missing {
                self.close_policy(&format!("missing {} support", role.family()))
                    .await;
                return;
            }
        }

        let stream_format = hello
            .player_support
            .as_ref()
            .and_then(|support| preferred_format(&support.supported_formats))
            .unwrap_or_default();

        let is_player = active_roles.contains(&Role::Player);
        let group = self.default_group(&client_id);

        let (transitioned, hello_reply, group_reply) = {
            let mut state = self.lock();
            state.phase = Phase::Ready;
            state.client_id = Some(client_id.clone());
            state.client_name = hello.name.clone();
            state.active_roles = active_roles.clone();
            state.expect_volume = hello
                .player_support
                .as_ref()
                .is_some_and(|s| s.supported_commands.contains(&PlayerCommand::Volume));
            state.expect_mute = hello
                .player_support
                .as_ref()
                .is_some_and(|s| s.supported_commands.contains(&PlayerCommand::Mute));
            state.player_support = hello.player_support;
            state.artwork_channels = hello
                .artwork_support
                .map(|support| {
                    let mut channels = support.channels;
                    channels.truncate(4);
                    channels
                })
                .unwrap_or_default();
            state.stream_format = stream_format;
            state.unsupported_roles = unsupported_roles.clone();
            let transitioned = state.refresh_identified();
            if transitioned {
                state.identified_fired = state.hooks_attached;
            }

            let hello_reply = ServerMessage::Hello(ServerHello {
                server_id: self.config.server_id.clone(),
                name: self.config.name.clone(),
                version: self.config.version,
                active_roles: active_roles.clone(),
                connection_reason: self.meta.connection_reason,
            });
            let group_reply = ServerMessage::GroupUpdate(GroupUpdate {
                playback_state: Some(PlaybackState::Stopped),
                group_id: Some(group.clone()),
                group_name: Some(group),
            });
            (transitioned, hello_reply, group_reply)
        };

        info!(
            "client {client_id} connected with roles [{}]",
            active_roles
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.send_message(&hello_reply).await;
        self.send_message(&group_reply).await;

        let hooks = {
            let mut state = self.lock();
            if !unsupported_roles.is_empty() && state.hooks_attached {
                state.unsupported_fired = true;
            }
            state.hooks.clone()
        };
        if !unsupported_roles.is_empty() && hooks.on_unsupported_roles.is_some() {
            fire(hooks.on_unsupported_roles.as_ref(), &unsupported_roles);
        }
        if transitioned && self.lock().hooks_attached {
            fire(hooks.on_identified.as_ref(), &self.descriptor());
        }

        if is_player {
            self.arm_initial_state_timer();
        }
    }

    fn resolve_roles(&self, offered: &[Value]) -> (Vec<Role>, Vec<String>) {
        let mut active = Vec::new();
        let mut admitted_families: HashSet<String> = HashSet::new();
        let mut unsupported = Vec::new();

        for entry in offered {
            let Some(literal) = entry.as_str() else {
                continue;
            };
            let family = literal.split('@').next().unwrap_or(literal);
            if admitted_families.contains(family) {
                continue;
            }
            let known = literal
                .parse::<Role>()
                .ok()
                .filter(|role| self.config.supported_roles.contains(role));
            match known {
                Some(role) => {
                    admitted_families.insert(family.to_string());
                    active.push(role);
                }
                None if !literal.starts_with('_') => unsupported.push(literal.to_string()),
                None => {}
            }
        }

        (active, unsupported)
    }

    fn default_group(&self, client_id: &str) -> String {
        if let Some(player) = &self.meta.player_id {
            player.clone()
        } else if let Some(zone) = self.meta.zone_id {
            format!("zone-{zone}")
        } else if !client_id.is_empty() {
            client_id.to_string()
        } else {
            "sendspin".to_string()
        }
    }

    fn arm_initial_state_timer(&self) {
        let weak = self.weak.clone();
        let timeout = self.config.initial_state_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                session.initial_state_deadline().await;
            }
        });
        self.lock().initial_state_timer = Some(handle);
    }

    async fn initial_state_deadline(&self) {
        let expired = {
            let state = self.lock();
            state.phase == Phase::Ready && !state.initial_state_received
        };
        if expired {
            self.close_policy("initial state timeout").await;
        }
    }

    async fn handle_ready_phase(&self, text: &str) {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                trace!("dropping unparseable text frame: {e}");
                return;
            }
        };

        match message {
            ClientMessage::Hello(_) => {}
            ClientMessage::Time(probe) => {
                let received = self.clock.now_us();
                let reply = ServerMessage::Time(ServerTime {
                    client_transmitted: probe.client_transmitted,
                    server_received: received,
                    // Re-sampled so the reply reflects any serialization delay.
                    server_transmitted: self.clock.now_us(),
                });
                self.send_message(&reply).await;
            }
            ClientMessage::State(update) => self.handle_state(update),
            ClientMessage::Command(command) => {
                let hooks = self.lock().hooks.clone();
                if let Some(controller) = command.controller {
                    fire(hooks.on_group_command.as_ref(), &controller);
                }
                if let Some(source) = command.source {
                    fire(hooks.on_source_command.as_ref(), &source.command);
                }
            }
            ClientMessage::Goodbye(goodbye) => {
                let hooks = {
                    let mut state = self.lock();
                    state.goodbye_reason = Some(goodbye.reason);
                    state.hooks.clone()
                };
                fire(hooks.on_goodbye.as_ref(), &goodbye.reason);
                let _ = self.transport.close(None, "").await;
                self.destroy();
            }
            ClientMessage::RequestFormat(request) => self.handle_request_format(request).await,
        }
    }

    fn handle_state(&self, update: crate::protocol::messages::ClientStateUpdate) {
        let (player_event, source_event, identified, hooks, warn_missing) = {
            let mut state = self.lock();

            if !state.initial_state_received {
                state.initial_state_received = true;
                if let Some(timer) = state.initial_state_timer.take() {
                    timer.abort();
                }
            }
            let transitioned = state.refresh_identified();
            let identified = transitioned && {
                let fired = state.identified_fired;
                if state.hooks_attached {
                    state.identified_fired = true;
                }
                state.hooks_attached && !fired
            };

            let player = update.player.unwrap_or_default();
            let player_event = PlayerStateEvent {
                state: update.state.or(player.state),
                volume: player.volume,
                muted: player.muted,
            };

            let warn_missing = ((state.expect_volume && player.volume.is_none())
                || (state.expect_mute && player.muted.is_none()))
                && !state.warned_state_expectations;
            if warn_missing {
                state.warned_state_expectations = true;
            }

            if let Some(source) = update.source {
                state.source_status = Some(source);
            }

            (
                player_event,
                update.source,
                identified,
                state.hooks.clone(),
                warn_missing,
            )
        };

        if warn_missing {
            warn!(
                "client {} negotiated volume/mute commands but omits them from state reports",
                self.client_id().unwrap_or_default()
            );
        }

        fire(hooks.on_player_state.as_ref(), &player_event);
        if let Some(source) = source_event {
            fire(hooks.on_source_state.as_ref(), &source);
        }
        if identified {
            fire(hooks.on_identified.as_ref(), &self.descriptor());
        }
    }

    async fn handle_request_format(
        &self,
        request: crate::protocol::messages::StreamRequestFormat,
    ) {
        let mut announce_player = false;
        let mut announce_artwork: Option<Vec<ArtworkChannel>> = None;
        let mut changed_format: Option<PlayerFormat> = None;

        {
            let mut state = self.lock();

            if let Some(player) = request.player {
                if state.has_role(Role::Player) {
                    let format = &mut state.stream_format;
                    if let Some(codec) = player.codec.as_deref() {
                        // Unknown codec strings are dropped; the numeric
                        // fields still merge.
                        if let Ok(codec) = codec.parse::<Codec>() {
                            format.codec = codec;
                        }
                    }
                    if let Some(rate) = player.sample_rate {
                        format.sample_rate = rate;
                    }
                    if let Some(channels) = player.channels {
                        format.channels = channels;
                    }
                    if let Some(depth) = player.bit_depth {
                        format.bit_depth = depth;
                    }
                    changed_format = Some(format.clone());
                    announce_player = true;
                }
            }

            if let Some(artwork) = request.artwork {
                if state.has_role(Role::Artwork) {
                    #[expect(clippy::cast_possible_truncation)]
                    let index = artwork.channel.map(|c| c.floor() as i64);
                    if let Some(index) = index {
                        if (0..4).contains(&index) {
                            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                            let index = index as usize;
                            if state.artwork_channels.len() <= index {
                                state
                                    .artwork_channels
                                    .resize(index + 1, ArtworkChannel::default());
                            }
                            let channel = &mut state.artwork_channels[index];
                            if artwork.source.is_some() {
                                channel.source = artwork.source;
                            }
                            if artwork.format.is_some() {
                                channel.format = artwork.format;
                            }
                            if artwork.media_width.is_some() {
                                channel.media_width = artwork.media_width;
                            }
                            if artwork.media_height.is_some() {
                                channel.media_height = artwork.media_height;
                            }
                            announce_artwork = Some(state.artwork_channels.clone());
                        }
                    }
                }
            }
        }

        if let Some(channels) = announce_artwork {
            self.send_message(&ServerMessage::StreamStart(StreamStart {
                artwork: Some(ArtworkStart { channels }),
                ..StreamStart::default()
            }))
            .await;
        }

        if announce_player {
            let hooks = self.lock().hooks.clone();
            if let Some(format) = changed_format {
                fire(hooks.on_format_changed.as_ref(), &format);
            }
            let format = self.lock().stream_format.clone();
            self.send_message(&ServerMessage::StreamStart(StreamStart {
                player: Some(format),
                ..StreamStart::default()
            }))
            .await;
        }
    }

    // ---- outbound ---------------------------------------------------------

    /// Whether ready-gated sends may proceed.
    fn may_send(&self) -> bool {
        self.transport.is_open() && self.lock().phase == Phase::Ready
    }

    async fn send_message(&self, message: &ServerMessage) {
        if !self.transport.is_open() {
            return;
        }
        match message.to_json() {
            Ok(text) => {
                if let Err(e) = self.transport.send_text(text).await {
                    trace!("swallowing send failure: {e}");
                }
            }
            Err(e) => error!("failed to serialize outbound message: {e}"),
        }
    }

    /// Announces a stream start, optionally committing a new format first.
    pub async fn send_stream_start(&self, format: Option<PlayerFormat>) {
        if !self.may_send() {
            return;
        }
        let format = {
            let mut state = self.lock();
            if let Some(format) = format {
                state.stream_format = format;
            }
            state.active_stream = true;
            state.stream_format.clone()
        };
        self.send_message(&ServerMessage::StreamStart(StreamStart {
            player: Some(format),
            ..StreamStart::default()
        }))
        .await;
    }

    /// Asks the peer to drop buffered but unplayed data.
    pub async fn send_stream_clear(&self, roles: Option<Vec<Family>>) {
        if !self.may_send() {
            return;
        }
        self.send_message(&ServerMessage::StreamClear(StreamClear { roles }))
            .await;
    }

    /// Announces the end of the stream for the given role families.
    pub async fn send_stream_end(&self, roles: Option<Vec<Family>>) {
        if !self.may_send() {
            return;
        }
        {
            let mut state = self.lock();
            let ends_player = roles
                .as_ref()
                .is_none_or(|roles| roles.contains(&Family::Player));
            if ends_player {
                state.active_stream = false;
            }
        }
        self.send_message(&ServerMessage::StreamEnd(StreamEnd { roles }))
            .await;
    }

    /// Sends one PCM frame, announcing the stream first when needed.
    ///
    /// Above the backpressure threshold the frame is deferred once for
    /// five milliseconds; the retry sends while the socket is open,
    /// regardless of the buffered amount at that point.
    pub async fn send_pcm(&self, data: &[u8], timestamp_us: Option<i64>) {
        if !self.may_send() {
            return;
        }
        let announce = {
            let mut state = self.lock();
            let announce = !state.active_stream;
            state.active_stream = true;
            announce.then(|| state.stream_format.clone())
        };
        if let Some(format) = announce {
            self.send_message(&ServerMessage::StreamStart(StreamStart {
                player: Some(format),
                ..StreamStart::default()
            }))
            .await;
        }

        let timestamp = timestamp_us.unwrap_or_else(|| self.clock.now_us());
        let frame = frame::pack_frame(FrameType::AudioChunk, timestamp, data);

        if self.transport.buffered_amount() > MAX_BUFFERED {
            let weak = self.weak.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SEND_RETRY_DELAY).await;
                if let Some(session) = weak.upgrade() {
                    if session.transport.is_open() {
                        if let Err(e) = session.transport.send_binary(frame).await {
                            trace!("swallowing deferred send failure: {e}");
                        }
                    }
                }
            });
            return;
        }

        if let Err(e) = self.transport.send_binary(frame).await {
            trace!("swallowing send failure: {e}");
        }
    }

    /// Sends a command, dropping blocks whose target role is not admitted.
    pub async fn send_server_command(&self, mut command: ServerCommand) {
        if !self.may_send() {
            return;
        }
        {
            let state = self.lock();
            if !state.has_role(Role::Player) {
                command.player = None;
            }
            if !state.has_role(Role::Source) {
                command.source = None;
            }
        }
        if command.player.is_none() && command.source.is_none() {
            return;
        }
        self.send_message(&ServerMessage::Command(command)).await;
    }

    /// Sends a group update. Allowed before the session is ready.
    pub async fn send_group_update(
        &self,
        state: PlaybackState,
        group_id: Option<String>,
        group_name: Option<String>,
    ) {
        if !self.transport.is_open() {
            return;
        }
        self.lock().playback_state = state;
        self.send_message(&ServerMessage::GroupUpdate(GroupUpdate {
            playback_state: Some(state),
            group_id,
            group_name,
        }))
        .await;
    }

    /// Last playback state announced through a group update.
    #[must_use]
    pub fn playback_state(&self) -> PlaybackState {
        self.lock().playback_state
    }

    /// Sends now-playing metadata.
    pub async fn send_metadata(&self, metadata: Metadata) {
        if !self.may_send() {
            return;
        }
        self.send_message(&ServerMessage::State(ServerState {
            metadata: Some(metadata),
            controller: None,
        }))
        .await;
    }

    /// Sends controller state.
    pub async fn send_controller_state(&self, controller: ControllerState) {
        if !self.may_send() {
            return;
        }
        self.send_message(&ServerMessage::State(ServerState {
            metadata: None,
            controller: Some(controller),
        }))
        .await;
    }

    /// Announces the artwork channel layout.
    pub async fn send_artwork_stream_start(&self, channels: Vec<ArtworkChannel>) {
        if !self.may_send() {
            return;
        }
        let channels = {
            let mut state = self.lock();
            let mut channels = channels;
            channels.truncate(4);
            state.artwork_channels = channels.clone();
            channels
        };
        self.send_message(&ServerMessage::StreamStart(StreamStart {
            artwork: Some(ArtworkStart { channels }),
            ..StreamStart::default()
        }))
        .await;
    }

    /// Sends one artwork payload; `None` clears the channel with an empty
    /// frame. Frames are dropped and counted under backpressure.
    pub async fn send_artwork(&self, channel: u8, data: Option<&[u8]>) {
        let Some(frame_type) = FrameType::artwork_channel(channel) else {
            warn!("artwork channel {channel} out of range");
            return;
        };
        let timestamp = self.clock.now_us();
        self.send_droppable(frame_type, timestamp, data.unwrap_or_default())
            .await;
    }

    /// Announces the visualizer configuration.
    pub async fn send_visualizer_stream_start(
        &self,
        config: serde_json::Map<String, Value>,
    ) {
        if !self.may_send() {
            return;
        }
        self.send_message(&ServerMessage::StreamStart(StreamStart {
            visualizer: Some(config),
            ..StreamStart::default()
        }))
        .await;
    }

    /// Sends one visualizer frame. Frames are dropped and counted under
    /// backpressure.
    pub async fn send_visualizer_frame(&self, data: &[u8], timestamp_us: Option<i64>) {
        let timestamp = timestamp_us.unwrap_or_else(|| self.clock.now_us());
        self.send_droppable(FrameType::VisualizationData, timestamp, data)
            .await;
    }

    async fn send_droppable(&self, frame_type: FrameType, timestamp_us: i64, data: &[u8]) {
        if !self.may_send() {
            return;
        }
        let frame = frame::pack_frame(frame_type, timestamp_us, data);
        if self.transport.buffered_amount() > MAX_BUFFERED {
            let now = self.clock.now_us();
            self.lock().drops.record(frame.len(), now);
            return;
        }
        if let Err(e) = self.transport.send_binary(frame).await {
            trace!("swallowing send failure: {e}");
        }
    }

    // ---- teardown ---------------------------------------------------------

    async fn close_policy(&self, reason: &str) {
        debug!("closing session: {reason}");
        let _ = self
            .transport
            .close(Some(CLOSE_POLICY_VIOLATION), reason)
            .await;
        self.destroy();
    }

    /// Tears the session down: cancels timers, marks it closed, and fires
    /// `on_disconnected` exactly once.
    pub fn destroy(&self) {
        let hooks = {
            let mut state = self.lock();
            if let Some(timer) = state.initial_state_timer.take() {
                timer.abort();
            }
            state.phase = Phase::Closed;
            if state.disconnected_fired {
                return;
            }
            state.disconnected_fired = true;
            state.hooks.clone()
        };
        fire(hooks.on_disconnected.as_ref(), &self.descriptor());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(timer) = state.initial_state_timer.take() {
                timer.abort();
            }
        }
    }
}

/// Picks the first offered format with a known codec and positive
/// parameters.
fn preferred_format(offers: &[crate::protocol::messages::FormatOffer]) -> Option<PlayerFormat> {
    offers.iter().find_map(|offer| {
        let codec = offer.codec.as_deref()?.parse::<Codec>().ok()?;
        Some(PlayerFormat {
            codec,
            sample_rate: positive_u32(offer.sample_rate.as_ref())?,
            channels: positive_u32(offer.channels.as_ref())?,
            bit_depth: positive_u32(offer.bit_depth.as_ref())?,
            codec_header: None,
        })
    })
}

fn positive_u32(value: Option<&serde_json::Number>) -> Option<u32> {
    value
        .and_then(serde_json::Number::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|&v| v > 0)
}
