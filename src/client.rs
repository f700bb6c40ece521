//! Peer-side implementation of the protocol.
//!
//! A [`Client`] dials the server, negotiates its roles, keeps the Kalman
//! time filter fed through an adaptive sync cadence, dispatches inbound
//! stream data to listeners, and uploads source capture frames stamped
//! with projected server time. One background task owns the socket; all
//! sends funnel through it so outbound ordering matches submission order.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};

use crate::{
    error::{Error, ErrorKind, Result},
    events::{ListenerSet, Subscription},
    protocol::{
        frame::{self, BinaryHeader, FrameType},
        messages::{
            ArtworkSupport, ClientCommand, ClientGoodbye, ClientHello, ClientMessage,
            ClientStateUpdate, ClientTime, ControllerCommand, ControllerState, GroupUpdate,
            PlayerStateBlock, PlayerSupport, ServerCommand, ServerHello, ServerMessage,
            SourceDirective, SourceNotification, SourceStateBlock, SourceSupport, StreamStart,
            VisualizerSupport,
        },
        types::{
            ClientState, Codec, Family, GoodbyeReason, MediaCommand, MetadataSnapshot, PcmFormat,
            Role, SourceClientCommand,
        },
        PROTOCOL_VERSION,
    },
    timing::{RttSample, TimeFilter},
    util::Clock,
};

/// Default ceiling for socket open plus `server/hello`.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful disconnect waits for the close handshake.
const GRACEFUL_CLOSE_CEILING: Duration = Duration::from_millis(100);

/// Safety margin added to scheduled play times while the filter is still
/// acquiring lock.
const BOOTSTRAP_MARGIN_US: i64 = 500_000;

/// A declared role lacks its capability block.
#[derive(Clone, Copy, Debug, ThisError, PartialEq, Eq)]
pub enum CapabilityError {
    /// `player` declared without `player_support`.
    #[error("player role declared without player support")]
    MissingPlayerSupport,
    /// `artwork` declared without `artwork_support`.
    #[error("artwork role declared without artwork support")]
    MissingArtworkSupport,
    /// `source` declared without `source_support`.
    #[error("source role declared without source support")]
    MissingSourceSupport,
}

/// The server did not reply with `server/hello` in time.
#[derive(Clone, Copy, Debug, ThisError, PartialEq, Eq)]
#[error("timed out waiting for server/hello")]
pub struct HelloTimeout;

/// A capture timestamp cannot be projected before the filter locks.
#[derive(Clone, Copy, Debug, ThisError, PartialEq, Eq)]
#[error("time filter is not synchronized")]
pub struct NotSynchronized;

/// Neither a server timestamp nor a capture timestamp was supplied.
#[derive(Clone, Copy, Debug, ThisError, PartialEq, Eq)]
#[error("source audio chunk needs a capture or server timestamp")]
pub struct MissingTimestamp;

/// Construction options for a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Free-form device description sent in the hello.
    pub device_info: Option<serde_json::Value>,
    /// Player capability block; required with the player role.
    pub player_support: Option<PlayerSupport>,
    /// Artwork capability block; required with the artwork role.
    pub artwork_support: Option<ArtworkSupport>,
    /// Visualizer capability block.
    pub visualizer_support: Option<VisualizerSupport>,
    /// Source capability block; required with the source role.
    pub source_support: Option<SourceSupport>,
    /// Additional delay applied to scheduled play times, milliseconds.
    pub static_delay_ms: i64,
    /// Volume reported in the initial state, 0..=100.
    pub initial_volume: u32,
    /// Mute state reported in the initial state.
    pub initial_muted: bool,
    /// Time source; tests pin this.
    pub clock: Clock,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            device_info: None,
            player_support: None,
            artwork_support: None,
            visualizer_support: None,
            source_support: None,
            static_delay_ms: 0,
            initial_volume: 100,
            initial_muted: false,
            clock: Clock::monotonic(),
        }
    }
}

/// The audio format a player renders, derived from `stream/start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// Committed codec.
    pub codec: Codec,
    /// Validated PCM output parameters.
    pub pcm: PcmFormat,
    /// Decoded codec initialization data, when the server sent one.
    pub codec_header: Option<Vec<u8>>,
}

/// One audio frame delivered to audio-chunk listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioChunkEvent {
    /// Playback timestamp on the server clock, microseconds.
    pub timestamp_us: i64,
    /// Frame payload.
    pub data: Vec<u8>,
    /// Format the frame is encoded in.
    pub format: AudioFormat,
}

/// Role list attached to `stream/clear` and `stream/end` notifications;
/// `None` means all streaming roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRolesEvent {
    /// Affected role families.
    pub roles: Option<Vec<Family>>,
}

/// Timestamp options for [`Client::send_source_audio_chunk`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceChunkOptions {
    /// Local capture time to project onto the server clock.
    pub capture_ts_us: Option<i64>,
    /// Pre-projected server timestamp, used verbatim.
    pub server_ts_us: Option<i64>,
}

#[derive(Default)]
struct StreamState {
    active: bool,
    format: Option<AudioFormat>,
}

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    run: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Listeners {
    metadata: ListenerSet<crate::protocol::types::Metadata>,
    group_update: ListenerSet<GroupUpdate>,
    controller_state: ListenerSet<ControllerState>,
    stream_start: ListenerSet<AudioFormat>,
    stream_end: ListenerSet<StreamRolesEvent>,
    stream_clear: ListenerSet<StreamRolesEvent>,
    audio_chunk: ListenerSet<AudioChunkEvent>,
    disconnect: ListenerSet<()>,
    server_command: ListenerSet<ServerCommand>,
    source_command: ListenerSet<SourceDirective>,
}

struct ClientInner {
    client_id: String,
    client_name: String,
    roles: Vec<Role>,
    options: ClientOptions,
    clock: Clock,
    filter: Mutex<TimeFilter>,
    stream: Mutex<StreamState>,
    metadata: Mutex<MetadataSnapshot>,
    server: Mutex<Option<ServerHello>>,
    conn: Mutex<Option<Connection>>,
    sync_kick: Notify,
    listeners: Listeners,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A Sendspin peer.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.client_id)
            .field("roles", &self.inner.roles)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client with the given identity and declared roles.
    ///
    /// # Errors
    ///
    /// Fails with a [`CapabilityError`] when a declared role lacks its
    /// capability block.
    pub fn new(
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        roles: Vec<Role>,
        options: ClientOptions,
    ) -> Result<Self> {
        if roles.contains(&Role::Player) && options.player_support.is_none() {
            return Err(Error::invalid_argument(CapabilityError::MissingPlayerSupport));
        }
        if roles.contains(&Role::Artwork) && options.artwork_support.is_none() {
            return Err(Error::invalid_argument(CapabilityError::MissingArtworkSupport));
        }
        if roles.contains(&Role::Source) && options.source_support.is_none() {
            return Err(Error::invalid_argument(CapabilityError::MissingSourceSupport));
        }

        let clock = options.clock.clone();
        Ok(Self {
            inner: Arc::new(ClientInner {
                client_id: client_id.into(),
                client_name: client_name.into(),
                roles,
                clock,
                options,
                filter: Mutex::new(TimeFilter::new()),
                stream: Mutex::new(StreamState::default()),
                metadata: Mutex::new(MetadataSnapshot::default()),
                server: Mutex::new(None),
                conn: Mutex::new(None),
                sync_kick: Notify::new(),
                listeners: Listeners::default(),
            }),
        })
    }

    // ---- connection -------------------------------------------------------

    /// Connects with the default ten-second timeout.
    ///
    /// # Errors
    ///
    /// See [`connect_with_timeout`](Self::connect_with_timeout).
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.connect_with_timeout(url, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connects to a server, completing the hello handshake.
    ///
    /// The timeout covers both the socket open and the wait for
    /// `server/hello`.
    ///
    /// # Errors
    ///
    /// Fails when already connected, when the socket cannot be opened in
    /// time, or with [`HelloTimeout`] when the server does not greet back.
    pub async fn connect_with_timeout(&self, url: &str, connect_timeout: Duration) -> Result<()> {
        if lock(&self.inner.conn).is_some() {
            return Err(Error::failed_precondition("already connected"));
        }
        lock(&self.inner.filter).reset();
        *lock(&self.inner.stream) = StreamState::default();
        *lock(&self.inner.metadata) = MetadataSnapshot::default();

        let deadline = tokio::time::Instant::now() + connect_timeout;
        let (socket, _) = tokio::time::timeout_at(deadline, connect_async(url))
            .await
            .map_err(|_| Error::deadline_exceeded("websocket open timed out"))??;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let hello = self.inner.hello_message();
        ws_tx.send(Message::Text(hello.to_json()?)).await?;

        let server_hello = loop {
            let message = tokio::time::timeout_at(deadline, ws_rx.next())
                .await
                .map_err(|_| Error::new(ErrorKind::DeadlineExceeded, HelloTimeout))?;
            match message {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                    Ok(ServerMessage::Hello(hello)) => break hello,
                    Ok(other) => self.inner.dispatch(other),
                    Err(e) => trace!("dropping unparseable handshake message: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::unavailable("connection closed during handshake"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        };

        info!(
            "connected to {} ({})",
            server_hello.name, server_hello.server_id
        );
        *lock(&self.inner.server) = Some(server_hello);

        if self.inner.roles.contains(&Role::Player) {
            let state = ClientMessage::State(ClientStateUpdate {
                state: Some(ClientState::Synchronized),
                player: Some(PlayerStateBlock {
                    state: Some(ClientState::Synchronized),
                    volume: Some(self.inner.options.initial_volume),
                    muted: Some(self.inner.options.initial_muted),
                }),
                source: None,
            });
            ws_tx.send(Message::Text(state.to_json()?)).await?;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(run_loop(Arc::clone(&self.inner), ws_tx, ws_rx, out_rx));
        *lock(&self.inner.conn) = Some(Connection {
            tx: out_tx,
            run: Some(run),
        });
        Ok(())
    }

    /// Closes the connection, waiting briefly for the close handshake.
    pub async fn disconnect(&self) {
        let Some(mut connection) = lock(&self.inner.conn).take() else {
            return;
        };
        let _ = connection.tx.send(Message::Close(None));
        if let Some(mut run) = connection.run.take() {
            if tokio::time::timeout(GRACEFUL_CLOSE_CEILING, &mut run)
                .await
                .is_err()
            {
                run.abort();
            }
        }
    }

    /// Identity of the connected server, once the handshake completed.
    #[must_use]
    pub fn server_info(&self) -> Option<ServerHello> {
        lock(&self.inner.server).clone()
    }

    /// Whether a connection task is currently running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.conn).is_some()
    }

    // ---- time -------------------------------------------------------------

    /// Whether the time filter has locked onto the server clock.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        lock(&self.inner.filter).is_synchronized()
    }

    /// Converts a server frame timestamp into the local time to render it.
    ///
    /// Falls back to a half-second safety margin from now while the filter
    /// is still acquiring lock.
    #[must_use]
    pub fn compute_play_time(&self, server_ts_us: i64) -> i64 {
        self.inner.compute_play_time(server_ts_us)
    }

    /// Projects a local timestamp onto the server clock, compensating the
    /// static delay.
    #[must_use]
    pub fn compute_server_time(&self, client_ts_us: i64) -> i64 {
        let filter = lock(&self.inner.filter);
        filter.server_from_client(client_ts_us - self.inner.static_delay_us())
    }

    // ---- sends ------------------------------------------------------------

    /// Reports player state to the server.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn send_player_state(
        &self,
        state: ClientState,
        volume: Option<u32>,
        muted: Option<bool>,
    ) -> Result<()> {
        self.inner.send_message(&ClientMessage::State(ClientStateUpdate {
            state: Some(state),
            player: Some(PlayerStateBlock {
                state: Some(state),
                volume,
                muted,
            }),
            source: None,
        }))
    }

    /// Reports source capture state to the server.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn send_source_state(&self, source: SourceStateBlock) -> Result<()> {
        self.inner.send_message(&ClientMessage::State(ClientStateUpdate {
            state: None,
            player: None,
            source: Some(source),
        }))
    }

    /// Issues a controller command for the group.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn send_group_command(
        &self,
        command: MediaCommand,
        volume: Option<u32>,
        mute: Option<bool>,
    ) -> Result<()> {
        self.inner.send_message(&ClientMessage::Command(ClientCommand {
            controller: Some(ControllerCommand {
                command,
                volume,
                mute,
                source_id: None,
            }),
            source: None,
        }))
    }

    /// Notifies the server about the capture pipeline.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn send_source_command(&self, command: SourceClientCommand) -> Result<()> {
        self.inner.send_message(&ClientMessage::Command(ClientCommand {
            controller: None,
            source: Some(SourceNotification { command }),
        }))
    }

    /// Says goodbye to the server before disconnecting.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn send_goodbye(&self, reason: GoodbyeReason) -> Result<()> {
        self.inner
            .send_message(&ClientMessage::Goodbye(ClientGoodbye { reason }))
    }

    /// Uploads one captured audio frame.
    ///
    /// The frame is stamped with `server_ts_us` when given; otherwise the
    /// capture timestamp is projected through the time filter, which must
    /// be synchronized.
    ///
    /// # Errors
    ///
    /// Fails with [`MissingTimestamp`] when no timestamp is supplied, with
    /// [`NotSynchronized`] when projection is impossible, or when not
    /// connected.
    pub fn send_source_audio_chunk(
        &self,
        data: &[u8],
        options: SourceChunkOptions,
    ) -> Result<()> {
        let timestamp = match options.server_ts_us {
            Some(server_ts) => server_ts,
            None => {
                let capture_ts = options
                    .capture_ts_us
                    .ok_or_else(|| Error::invalid_argument(MissingTimestamp))?;
                let filter = lock(&self.inner.filter);
                if !filter.is_synchronized() {
                    return Err(Error::failed_precondition(NotSynchronized));
                }
                // Capture times are not delay-adjusted; the static delay
                // only applies to playback scheduling.
                filter.server_from_client(capture_ts)
            }
        };
        self.inner.send_raw(Message::Binary(frame::pack_frame(
            FrameType::SourceAudioChunk,
            timestamp,
            data,
        )))
    }

    /// The accumulated view of received metadata updates.
    #[must_use]
    pub fn metadata_snapshot(&self) -> MetadataSnapshot {
        lock(&self.inner.metadata).clone()
    }

    // ---- listeners --------------------------------------------------------

    /// Observes `server/state` metadata updates.
    pub fn add_metadata_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&crate::protocol::types::Metadata) + Send + Sync + 'static,
    {
        self.inner.listeners.metadata.add(listener)
    }

    /// Observes `group/update` messages.
    pub fn add_group_update_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&GroupUpdate) + Send + Sync + 'static,
    {
        self.inner.listeners.group_update.add(listener)
    }

    /// Observes `server/state` controller updates.
    pub fn add_controller_state_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ControllerState) + Send + Sync + 'static,
    {
        self.inner.listeners.controller_state.add(listener)
    }

    /// Observes new streams. Format-only updates do not re-notify.
    pub fn add_stream_start_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AudioFormat) + Send + Sync + 'static,
    {
        self.inner.listeners.stream_start.add(listener)
    }

    /// Observes stream teardowns.
    pub fn add_stream_end_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StreamRolesEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.stream_end.add(listener)
    }

    /// Observes buffer-clear requests.
    pub fn add_stream_clear_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StreamRolesEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.stream_clear.add(listener)
    }

    /// Observes decoded audio frames.
    pub fn add_audio_chunk_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AudioChunkEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.audio_chunk.add(listener)
    }

    /// Observes loss of the connection.
    pub fn add_disconnect_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.listeners.disconnect.add(listener)
    }

    /// Observes `server/command` messages.
    pub fn add_server_command_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ServerCommand) + Send + Sync + 'static,
    {
        self.inner.listeners.server_command.add(listener)
    }

    /// Observes source-directed commands.
    pub fn add_source_command_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SourceDirective) + Send + Sync + 'static,
    {
        self.inner.listeners.source_command.add(listener)
    }
}

impl ClientInner {
    fn static_delay_us(&self) -> i64 {
        self.options.static_delay_ms * 1_000
    }

    fn compute_play_time(&self, server_ts_us: i64) -> i64 {
        let delay = self.static_delay_us();
        let filter = lock(&self.filter);
        if filter.is_synchronized() {
            filter.client_from_server(server_ts_us) + delay
        } else {
            self.clock.now_us() + BOOTSTRAP_MARGIN_US + delay
        }
    }

    fn hello_message(&self) -> ClientMessage {
        let declared = |role: Role| self.roles.contains(&role);
        ClientMessage::Hello(ClientHello {
            client_id: self.client_id.clone(),
            name: self.client_name.clone(),
            version: Some(PROTOCOL_VERSION),
            supported_roles: self
                .roles
                .iter()
                .map(|role| serde_json::Value::String(role.to_string()))
                .collect(),
            device_info: self.options.device_info.clone(),
            player_support: declared(Role::Player)
                .then(|| self.options.player_support.clone())
                .flatten(),
            artwork_support: declared(Role::Artwork)
                .then(|| self.options.artwork_support.clone())
                .flatten(),
            visualizer_support: declared(Role::Visualizer)
                .then(|| self.options.visualizer_support.clone())
                .flatten(),
            source_support: declared(Role::Source)
                .then(|| self.options.source_support.clone())
                .flatten(),
        })
    }

    fn send_message(&self, message: &ClientMessage) -> Result<()> {
        self.send_raw(Message::Text(message.to_json()?))
    }

    fn send_raw(&self, message: Message) -> Result<()> {
        let conn = lock(&self.conn);
        let Some(connection) = conn.as_ref() else {
            return Err(Error::failed_precondition("not connected"));
        };
        connection
            .tx
            .send(message)
            .map_err(|_| Error::unavailable("connection task gone"))
    }

    fn handle_text(&self, text: &str) {
        match ServerMessage::from_json(text) {
            Ok(message) => self.dispatch(message),
            Err(e) => trace!("dropping unparseable message: {e}"),
        }
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Hello(_) => {}
            ServerMessage::Time(reply) => {
                let now_rx = self.clock.now_us();
                let sample = RttSample::from_reply(&reply, now_rx);
                lock(&self.filter).update(sample.offset, sample.delay, now_rx);
            }
            ServerMessage::State(state) => {
                if let Some(metadata) = state.metadata {
                    metadata.merge_into(&mut lock(&self.metadata));
                    self.listeners.metadata.emit(&metadata);
                }
                if let Some(controller) = state.controller {
                    self.listeners.controller_state.emit(&controller);
                }
            }
            ServerMessage::Command(command) => {
                let source = command.source;
                self.listeners.server_command.emit(&command);
                if let Some(source) = source {
                    self.listeners.source_command.emit(&source);
                }
            }
            ServerMessage::GroupUpdate(update) => {
                self.listeners.group_update.emit(&update);
            }
            ServerMessage::StreamStart(start) => self.handle_stream_start(start),
            ServerMessage::StreamClear(clear) => {
                let valid = clear.roles.as_ref().is_none_or(|roles| {
                    roles
                        .iter()
                        .all(|role| matches!(role, Family::Player | Family::Visualizer))
                });
                if valid {
                    self.listeners
                        .stream_clear
                        .emit(&StreamRolesEvent { roles: clear.roles });
                }
            }
            ServerMessage::StreamEnd(end) => {
                let ends_player = end
                    .roles
                    .as_ref()
                    .is_none_or(|roles| roles.contains(&Family::Player));
                if ends_player {
                    let mut stream = lock(&self.stream);
                    stream.active = false;
                    stream.format = None;
                }
                self.listeners
                    .stream_end
                    .emit(&StreamRolesEvent { roles: end.roles });
            }
        }
    }

    fn handle_stream_start(&self, start: StreamStart) {
        let Some(player) = start.player else {
            return;
        };
        let pcm = match PcmFormat::new(player.sample_rate, player.channels, player.bit_depth) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("ignoring stream start with unusable format: {e}");
                return;
            }
        };
        let format = AudioFormat {
            codec: player.codec,
            pcm,
            codec_header: player.codec_header,
        };

        let newly_active = {
            let mut stream = lock(&self.stream);
            let newly_active = !stream.active;
            stream.active = true;
            stream.format = Some(format.clone());
            newly_active
        };

        if newly_active {
            self.listeners.stream_start.emit(&format);
            // Fresh streams deserve a fresh sync sample before the first
            // frame needs scheduling.
            self.sync_kick.notify_one();
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        let format = {
            let stream = lock(&self.stream);
            if !stream.active {
                return;
            }
            stream.format.clone()
        };
        let Ok(header) = BinaryHeader::unpack(data) else {
            trace!("dropping undersized binary frame");
            return;
        };
        if header.frame_type() != Some(FrameType::AudioChunk) {
            return;
        }
        let Some(format) = format else {
            return;
        };
        self.listeners.audio_chunk.emit(&AudioChunkEvent {
            timestamp_us: header.timestamp_us,
            data: data[frame::HEADER_LEN..].to_vec(),
            format,
        });
    }

    fn finish_connection(&self) {
        *lock(&self.conn) = None;
        {
            let mut stream = lock(&self.stream);
            stream.active = false;
            stream.format = None;
        }
        info!("disconnected from server");
        self.listeners.disconnect.emit(&());
    }
}

/// Next time-sync interval for the filter's current confidence.
fn sync_interval(filter: &TimeFilter) -> Duration {
    if !filter.is_synchronized() {
        return Duration::from_millis(200);
    }
    match filter.error_us() {
        e if e < 1_000 => Duration::from_millis(3_000),
        e if e < 2_000 => Duration::from_millis(1_000),
        e if e < 5_000 => Duration::from_millis(500),
        _ => Duration::from_millis(200),
    }
}

async fn run_loop<Tx, Rx>(
    inner: Arc<ClientInner>,
    mut ws_tx: Tx,
    mut ws_rx: Rx,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) where
    Tx: Sink<Message, Error = WsError> + Unpin,
    Rx: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    // Fires immediately: the first client/time goes out as soon as the
    // loop starts, then reschedules itself after every send.
    let mut next_sync = tokio::time::Instant::now();

    loop {
        tokio::select! {
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => inner.handle_text(&text),
                Some(Ok(Message::Binary(data))) => inner.handle_binary(&data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("error receiving message: {e}");
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            () = tokio::time::sleep_until(next_sync) => {
                let probe = ClientMessage::Time(ClientTime {
                    client_transmitted: inner.clock.now_us(),
                });
                match probe.to_json() {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("failed to serialize time probe: {e}"),
                }
                next_sync = tokio::time::Instant::now() + sync_interval(&lock(&inner.filter));
            },
            () = inner.sync_kick.notified() => {
                next_sync = tokio::time::Instant::now();
            },
        }
    }

    inner.finish_connection();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::protocol::messages::{FormatOffer, ServerTime};
    use crate::protocol::types::{Metadata, PlayerFormat, Undefined};

    fn player_options(clock: Clock) -> ClientOptions {
        ClientOptions {
            player_support: Some(PlayerSupport {
                supported_formats: vec![FormatOffer::new("pcm", 48_000, 2, 16)],
                buffer_capacity: Some(524_288),
                supported_commands: vec![],
            }),
            clock,
            ..ClientOptions::default()
        }
    }

    fn stepped_clock() -> (Clock, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(0));
        let clock = {
            let now = Arc::clone(&now);
            Clock::from_fn(move || now.load(Ordering::SeqCst))
        };
        (clock, now)
    }

    fn test_client() -> (Client, Arc<AtomicI64>) {
        let (clock, now) = stepped_clock();
        let client = Client::new(
            "c1",
            "Kitchen",
            vec![Role::Player],
            player_options(clock),
        )
        .unwrap();
        (client, now)
    }

    /// Wires the client to an in-memory channel instead of a socket.
    fn attach_channel(client: &Client) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&client.inner.conn) = Some(Connection { tx, run: None });
        rx
    }

    fn synchronize(client: &Client, now: &AtomicI64, offset: i64) {
        for t in [1_000_000i64, 2_000_000] {
            now.store(t, Ordering::SeqCst);
            client.inner.dispatch(ServerMessage::Time(ServerTime {
                client_transmitted: t,
                server_received: t + offset,
                server_transmitted: t + offset,
            }));
        }
        assert!(client.is_synchronized());
    }

    #[test]
    fn constructor_requires_capability_blocks() {
        let err = Client::new(
            "c1",
            "n",
            vec![Role::Player],
            ClientOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.downcast::<CapabilityError>(),
            Some(&CapabilityError::MissingPlayerSupport)
        );

        let err = Client::new("c1", "n", vec![Role::Artwork], ClientOptions::default())
            .unwrap_err();
        assert_eq!(
            err.downcast::<CapabilityError>(),
            Some(&CapabilityError::MissingArtworkSupport)
        );

        assert!(Client::new("c1", "n", vec![Role::Controller], ClientOptions::default()).is_ok());
    }

    #[test]
    fn hello_omits_undeclared_capability_blocks() {
        let (client, _) = test_client();
        let ClientMessage::Hello(hello) = client.inner.hello_message() else {
            panic!("expected hello");
        };
        assert_eq!(hello.supported_roles, vec![json!("player@v1")]);
        assert!(hello.player_support.is_some());
        assert!(hello.artwork_support.is_none());
        assert!(hello.source_support.is_none());
    }

    #[test]
    fn server_time_replies_feed_the_filter() {
        let (client, now) = test_client();
        assert!(!client.is_synchronized());
        synchronize(&client, &now, 1_000_000);
        // Zero-delay samples with constant offset lock exactly.
        assert_eq!(client.compute_server_time(3_000_000), 4_000_000);
    }

    #[test]
    fn compute_play_time_uses_bootstrap_margin_until_locked() {
        let (clock, now) = stepped_clock();
        let mut options = player_options(clock);
        options.static_delay_ms = 50;
        let client = Client::new("c1", "n", vec![Role::Player], options).unwrap();

        now.store(1_000_000, Ordering::SeqCst);
        assert_eq!(client.compute_play_time(123), 1_000_000 + 500_000 + 50_000);

        synchronize(&client, &now, 0);
        assert_eq!(client.compute_play_time(2_000_000), 2_000_000 + 50_000);
    }

    #[test]
    fn stream_start_notifies_once_and_updates_format_silently() {
        let (client, _) = test_client();
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let _sub = client.add_stream_start_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let start = |rate: u32| {
            ServerMessage::StreamStart(StreamStart {
                player: Some(PlayerFormat {
                    sample_rate: rate,
                    ..PlayerFormat::default()
                }),
                ..StreamStart::default()
            })
        };

        client.inner.dispatch(start(48_000));
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        // A format update on an active stream must not re-notify.
        client.inner.dispatch(start(44_100));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            lock(&client.inner.stream).format.as_ref().unwrap().pcm,
            PcmFormat::new(44_100, 2, 16).unwrap()
        );
    }

    #[test]
    fn unusable_stream_format_is_ignored() {
        let (client, _) = test_client();
        client.inner.dispatch(ServerMessage::StreamStart(StreamStart {
            player: Some(PlayerFormat {
                channels: 6,
                ..PlayerFormat::default()
            }),
            ..StreamStart::default()
        }));
        assert!(!lock(&client.inner.stream).active);
    }

    #[test]
    fn audio_chunks_reach_listeners_only_while_streaming() {
        let (client, _) = test_client();
        let chunks: Arc<Mutex<Vec<AudioChunkEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let _sub = client.add_audio_chunk_listener(move |chunk| {
            sink.lock().unwrap().push(chunk.clone());
        });

        let frame = frame::pack_frame(FrameType::AudioChunk, 42, b"pcm");
        client.inner.handle_binary(&frame);
        assert!(chunks.lock().unwrap().is_empty());

        client.inner.dispatch(ServerMessage::StreamStart(StreamStart {
            player: Some(PlayerFormat::default()),
            ..StreamStart::default()
        }));
        client.inner.handle_binary(&frame);

        let seen = chunks.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].timestamp_us, 42);
        assert_eq!(seen[0].data, b"pcm");
    }

    #[test]
    fn stream_clear_rejects_foreign_roles() {
        let (client, _) = test_client();
        let clears = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&clears);
        let _sub = client.add_stream_clear_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.inner.dispatch(ServerMessage::StreamClear(
            crate::protocol::messages::StreamClear {
                roles: Some(vec![Family::Metadata]),
            },
        ));
        assert_eq!(clears.load(Ordering::SeqCst), 0);

        client.inner.dispatch(ServerMessage::StreamClear(
            crate::protocol::messages::StreamClear {
                roles: Some(vec![Family::Player, Family::Visualizer]),
            },
        ));
        assert_eq!(clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stream_end_drops_stream_state() {
        let (client, _) = test_client();
        client.inner.dispatch(ServerMessage::StreamStart(StreamStart {
            player: Some(PlayerFormat::default()),
            ..StreamStart::default()
        }));
        assert!(lock(&client.inner.stream).active);

        client.inner.dispatch(ServerMessage::StreamEnd(
            crate::protocol::messages::StreamEnd { roles: None },
        ));
        let stream = lock(&client.inner.stream);
        assert!(!stream.active);
        assert!(stream.format.is_none());
    }

    #[test]
    fn source_chunk_requires_timestamp_and_sync() {
        let (client, now) = test_client();
        let _rx = attach_channel(&client);

        let err = client
            .send_source_audio_chunk(b"x", SourceChunkOptions::default())
            .unwrap_err();
        assert_eq!(err.downcast::<MissingTimestamp>(), Some(&MissingTimestamp));

        let err = client
            .send_source_audio_chunk(
                b"x",
                SourceChunkOptions {
                    capture_ts_us: Some(1_000_000),
                    server_ts_us: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.downcast::<NotSynchronized>(), Some(&NotSynchronized));

        synchronize(&client, &now, 0);
        assert!(client
            .send_source_audio_chunk(
                b"x",
                SourceChunkOptions {
                    capture_ts_us: Some(1_000_000),
                    server_ts_us: None,
                },
            )
            .is_ok());
    }

    #[tokio::test]
    async fn explicit_server_timestamp_is_used_verbatim() {
        let (client, _) = test_client();
        let mut rx = attach_channel(&client);

        client
            .send_source_audio_chunk(
                b"abc",
                SourceChunkOptions {
                    capture_ts_us: None,
                    server_ts_us: Some(1_000_000),
                },
            )
            .unwrap();

        let Some(Message::Binary(frame)) = rx.recv().await else {
            panic!("expected binary frame");
        };
        assert_eq!(frame[0], 12);
        assert_eq!(&frame[1..9], &1_000_000i64.to_be_bytes());
        assert_eq!(&frame[9..], b"abc");
    }

    #[test]
    fn metadata_updates_accumulate_into_snapshot() {
        let (client, _) = test_client();
        client.inner.dispatch(ServerMessage::State(
            crate::protocol::messages::ServerState {
                metadata: Some(Metadata {
                    timestamp: 1,
                    title: Undefined::Value("One".to_string()),
                    artist: Undefined::Value("Band".to_string()),
                    ..Metadata::default()
                }),
                controller: None,
            },
        ));
        client.inner.dispatch(ServerMessage::State(
            crate::protocol::messages::ServerState {
                metadata: Some(Metadata {
                    timestamp: 2,
                    artist: Undefined::Null,
                    ..Metadata::default()
                }),
                controller: None,
            },
        ));

        let snapshot = client.metadata_snapshot();
        assert_eq!(snapshot.title.as_deref(), Some("One"));
        assert_eq!(snapshot.artist, None);
        assert_eq!(snapshot.timestamp, 2);
    }

    #[test]
    fn sync_cadence_follows_filter_confidence() {
        let mut filter = TimeFilter::new();
        assert_eq!(sync_interval(&filter), Duration::from_millis(200));

        let mut locked_with_error = |max_error: f64| {
            filter.reset();
            filter.update(0.0, max_error, 0);
            filter.update(0.0, max_error, 1_000_000);
            sync_interval(&filter)
        };
        assert_eq!(locked_with_error(10.0), Duration::from_millis(3_000));
        assert_eq!(locked_with_error(1_500.0), Duration::from_millis(1_000));
        assert_eq!(locked_with_error(3_000.0), Duration::from_millis(500));
        assert_eq!(locked_with_error(6_000.0), Duration::from_millis(200));
    }
}
