//! Client-id indexed registry of live sessions.
//!
//! The registry owns every session for the lifetime of its transport and
//! routes server-initiated operations to the right one. Hooks register by
//! client id and bind late: attachment resolves immediately when a session
//! with that id already exists, and otherwise latches until the next
//! inbound message reveals the id. Its maps are mutated only on connection
//! open/close and hook registration, never on the hot frame path.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    error::{Error, Result},
    events::{ListenerSet, Subscription},
    protocol::{
        messages::{ControllerState, ServerCommand},
        types::{ConnectionReason, Family, Metadata, PlaybackState, PlayerFormat},
    },
    session::{ConnectMeta, ServerConfig, Session, SessionDescriptor, SessionHooks},
    transport::Transport,
    util::Clock,
};

/// Acquires a registry map, tolerating poisoning from a panicked hook.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry-assigned handle for one connection; stands in for the socket
/// identity the host holds.
pub type SessionId = u64;

/// Lifecycle notifications observable on the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A connection was accepted and a session created for it.
    ClientAdded(SessionDescriptor),
    /// A connection went away and its session was destroyed.
    ClientRemoved(SessionDescriptor),
}

/// Stream-lead measurements reported by the upstream streamer, kept for
/// introspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeadStats {
    /// How far ahead of playback the streamer currently is, microseconds.
    pub lead_us: i64,
    /// The lead the streamer aims for, microseconds.
    pub target_lead_us: i64,
    /// Bytes buffered client-side, when reported.
    pub buffered_bytes: Option<u64>,
    /// When the entry was recorded, server clock microseconds.
    pub updated_at_us: i64,
}

/// Maps connections to sessions and client ids to pending hooks.
pub struct SessionRegistry {
    config: ServerConfig,
    clock: Clock,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    pending_hooks: Mutex<HashMap<String, SessionHooks>>,
    lead_stats: Mutex<HashMap<String, LeadStats>>,
    events: ListenerSet<RegistryEvent>,
}

impl SessionRegistry {
    /// A registry announcing `config` to every new session.
    #[must_use]
    pub fn new(config: ServerConfig, clock: Clock) -> Self {
        Self {
            config,
            clock,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            pending_hooks: Mutex::new(HashMap::new()),
            lead_stats: Mutex::new(HashMap::new()),
            events: ListenerSet::new(),
        }
    }

    /// Registers a listener for lifecycle events.
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.events.add(listener)
    }

    /// Creates a session for an accepted connection.
    pub fn add_connection(
        &self,
        transport: Arc<dyn Transport>,
        meta: ConnectMeta,
    ) -> (SessionId, Arc<Session>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(transport, self.config.clone(), meta, self.clock.clone());
        lock(&self.sessions).insert(id, Arc::clone(&session));
        self.events
            .emit(&RegistryEvent::ClientAdded(session.descriptor()));
        (id, session)
    }

    /// Dispatches an inbound text message, then late-binds pending hooks
    /// once the session has revealed its client id.
    pub async fn handle_text(&self, id: SessionId, text: &str) {
        let Some(session) = self.session_by_id(id) else {
            return;
        };
        session.handle_text(text).await;

        if session.hooks_attached() {
            return;
        }
        let Some(client_id) = session.client_id() else {
            return;
        };
        let pending = lock(&self.pending_hooks).get(&client_id).cloned();
        if let Some(hooks) = pending {
            debug!("late-binding hooks for client {client_id}");
            session.set_hooks(hooks);
        }
    }

    /// Dispatches an inbound binary message.
    pub fn handle_binary(&self, id: SessionId, data: &[u8]) {
        if let Some(session) = self.session_by_id(id) {
            session.handle_binary(data);
        }
    }

    /// Removes and destroys the session after its transport closed.
    pub fn connection_closed(&self, id: SessionId) {
        let session = lock(&self.sessions).remove(&id);
        if let Some(session) = session {
            session.destroy();
            self.events
                .emit(&RegistryEvent::ClientRemoved(session.descriptor()));
        }
    }

    /// Installs hooks for a client id, attaching immediately when a session
    /// with that id already exists.
    pub fn register_hooks(&self, client_id: &str, hooks: SessionHooks) {
        lock(&self.pending_hooks).insert(client_id.to_string(), hooks.clone());
        if let Some(session) = self.get_session(client_id) {
            session.set_hooks(hooks);
        }
    }

    /// Drops the hooks registered for a client id.
    pub fn unregister_hooks(&self, client_id: &str) {
        lock(&self.pending_hooks).remove(client_id);
        if let Some(session) = self.get_session(client_id) {
            session.clear_hooks();
        }
    }

    /// Looks up a session by client id, preferring a `playback` connection
    /// over a stale `discovery` one when both exist.
    #[must_use]
    pub fn get_session(&self, client_id: &str) -> Option<Arc<Session>> {
        let sessions = lock(&self.sessions);
        let mut found: Option<Arc<Session>> = None;
        for session in sessions.values() {
            if session.client_id().as_deref() != Some(client_id) {
                continue;
            }
            if session.connection_reason() == ConnectionReason::Playback {
                return Some(Arc::clone(session));
            }
            found.get_or_insert_with(|| Arc::clone(session));
        }
        found
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Descriptors of every live session.
    #[must_use]
    pub fn descriptors(&self) -> Vec<SessionDescriptor> {
        lock(&self.sessions).values().map(|s| s.descriptor()).collect()
    }

    fn session_by_id(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.sessions).get(&id).cloned()
    }

    fn require(&self, client_id: &str) -> Result<Arc<Session>> {
        self.get_session(client_id)
            .ok_or_else(|| Error::not_found(format!("no session for client {client_id}")))
    }

    // ---- send-verb mirrors ------------------------------------------------

    /// Announces a stream start to a client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_stream_start_to(
        &self,
        client_id: &str,
        format: Option<PlayerFormat>,
    ) -> Result<()> {
        self.require(client_id)?.send_stream_start(format).await;
        Ok(())
    }

    /// Announces a stream end to a client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_stream_end_to(
        &self,
        client_id: &str,
        roles: Option<Vec<Family>>,
    ) -> Result<()> {
        self.require(client_id)?.send_stream_end(roles).await;
        Ok(())
    }

    /// Asks a client to clear buffered data.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_stream_clear_to(
        &self,
        client_id: &str,
        roles: Option<Vec<Family>>,
    ) -> Result<()> {
        self.require(client_id)?.send_stream_clear(roles).await;
        Ok(())
    }

    /// Sends one PCM frame to a client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_pcm_to(
        &self,
        client_id: &str,
        data: &[u8],
        timestamp_us: Option<i64>,
    ) -> Result<()> {
        self.require(client_id)?.send_pcm(data, timestamp_us).await;
        Ok(())
    }

    /// Sends now-playing metadata to a client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_metadata_to(&self, client_id: &str, metadata: Metadata) -> Result<()> {
        self.require(client_id)?.send_metadata(metadata).await;
        Ok(())
    }

    /// Sends controller state to a client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_controller_state_to(
        &self,
        client_id: &str,
        controller: ControllerState,
    ) -> Result<()> {
        self.require(client_id)?
            .send_controller_state(controller)
            .await;
        Ok(())
    }

    /// Sends a group update to a client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_group_update_to(
        &self,
        client_id: &str,
        state: PlaybackState,
        group_id: Option<String>,
        group_name: Option<String>,
    ) -> Result<()> {
        self.require(client_id)?
            .send_group_update(state, group_id, group_name)
            .await;
        Ok(())
    }

    /// Sends a command to a client, role-gated by its session.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no session has that client id.
    pub async fn send_server_command_to(
        &self,
        client_id: &str,
        command: ServerCommand,
    ) -> Result<()> {
        self.require(client_id)?.send_server_command(command).await;
        Ok(())
    }

    // ---- lead stats -------------------------------------------------------

    /// Records the streamer's lead measurements for a client.
    pub fn record_lead_stats(
        &self,
        client_id: &str,
        lead_us: i64,
        target_lead_us: i64,
        buffered_bytes: Option<u64>,
    ) {
        let entry = LeadStats {
            lead_us,
            target_lead_us,
            buffered_bytes,
            updated_at_us: self.clock.now_us(),
        };
        lock(&self.lead_stats).insert(client_id.to_string(), entry);
    }

    /// Latest lead measurements recorded for a client.
    #[must_use]
    pub fn lead_stats(&self, client_id: &str) -> Option<LeadStats> {
        lock(&self.lead_stats).get(client_id).copied()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(ServerConfig::default(), Clock::monotonic())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::session::SessionDescriptor;
    use crate::transport::testing::MockTransport;

    fn test_registry() -> SessionRegistry {
        SessionRegistry::new(
            ServerConfig {
                server_id: "srv-1".to_string(),
                ..ServerConfig::default()
            },
            Clock::from_fn(|| 1_000),
        )
    }

    fn hello(client_id: &str) -> String {
        json!({
            "type": "client/hello",
            "payload": {
                "client_id": client_id,
                "name": client_id,
                "version": 1,
                "supported_roles": ["controller@v1"],
            },
        })
        .to_string()
    }

    fn open(registry: &SessionRegistry) -> (SessionId, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let (id, _session) = registry.add_connection(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ConnectMeta::default(),
        );
        (id, transport)
    }

    fn open_with_reason(
        registry: &SessionRegistry,
        reason: ConnectionReason,
    ) -> (SessionId, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let meta = ConnectMeta {
            connection_reason: reason,
            ..ConnectMeta::default()
        };
        let (id, _session) = registry.add_connection(
            Arc::clone(&transport) as Arc<dyn Transport>,
            meta,
        );
        (id, transport)
    }

    #[tokio::test]
    async fn pending_hooks_bind_after_identification() {
        let registry = test_registry();
        let identified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&identified);
        registry.register_hooks(
            "c1",
            SessionHooks {
                on_identified: Some(Arc::new(move |descriptor: &SessionDescriptor| {
                    assert_eq!(descriptor.client_id, "c1");
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..SessionHooks::default()
            },
        );

        let (id, _transport) = open(&registry);
        assert_eq!(identified.load(Ordering::SeqCst), 0);

        // Controller-only sessions identify at hello; the dispatch loop
        // binds the pending hooks right after, which replays the event.
        registry.handle_text(id, &hello("c1")).await;
        assert_eq!(identified.load(Ordering::SeqCst), 1);
        assert!(registry.get_session("c1").unwrap().hooks_attached());
    }

    #[tokio::test]
    async fn register_hooks_attaches_to_live_session() {
        let registry = test_registry();
        let (id, _transport) = open(&registry);
        registry.handle_text(id, &hello("c1")).await;

        let identified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&identified);
        registry.register_hooks(
            "c1",
            SessionHooks {
                on_identified: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..SessionHooks::default()
            },
        );
        assert_eq!(identified.load(Ordering::SeqCst), 1);

        registry.unregister_hooks("c1");
        assert!(!registry.get_session("c1").unwrap().hooks_attached());
    }

    #[tokio::test]
    async fn get_session_prefers_playback_connections() {
        let registry = test_registry();
        let (discovery_id, _t1) = open_with_reason(&registry, ConnectionReason::Discovery);
        let (playback_id, _t2) = open_with_reason(&registry, ConnectionReason::Playback);
        registry.handle_text(discovery_id, &hello("c1")).await;
        registry.handle_text(playback_id, &hello("c1")).await;
        assert_eq!(registry.session_count(), 2);

        let session = registry.get_session("c1").unwrap();
        assert_eq!(session.connection_reason(), ConnectionReason::Playback);

        registry.connection_closed(playback_id);
        let session = registry.get_session("c1").unwrap();
        assert_eq!(session.connection_reason(), ConnectionReason::Discovery);
    }

    #[tokio::test]
    async fn lifecycle_events_fire_on_open_and_close() {
        let registry = test_registry();
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let added_counter = Arc::clone(&added);
        let removed_counter = Arc::clone(&removed);
        let _sub = registry.add_listener(move |event| match event {
            RegistryEvent::ClientAdded(_) => {
                added_counter.fetch_add(1, Ordering::SeqCst);
            }
            RegistryEvent::ClientRemoved(_) => {
                removed_counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (id, _transport) = open(&registry);
        assert_eq!(added.load(Ordering::SeqCst), 1);

        registry.connection_closed(id);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.session_count(), 0);

        // Closing an unknown connection is a no-op.
        registry.connection_closed(id);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_verb_mirrors_route_by_client_id() {
        let registry = test_registry();
        let (id, transport) = open(&registry);
        registry.handle_text(id, &hello("c1")).await;

        registry
            .send_group_update_to("c1", PlaybackState::Playing, None, None)
            .await
            .unwrap();
        let last = transport.texts().pop().unwrap();
        assert!(last.contains("group/update"));
        assert!(last.contains("playing"));

        let err = registry
            .send_pcm_to("nobody", b"x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn lead_stats_ledger_roundtrip() {
        let registry = test_registry();
        assert_eq!(registry.lead_stats("c1"), None);

        registry.record_lead_stats("c1", 15_000, 20_000, Some(4_096));
        let stats = registry.lead_stats("c1").unwrap();
        assert_eq!(stats.lead_us, 15_000);
        assert_eq!(stats.target_lead_us, 20_000);
        assert_eq!(stats.buffered_bytes, Some(4_096));
        assert_eq!(stats.updated_at_us, 1_000);
    }

    #[tokio::test]
    async fn binary_routes_to_the_right_session() {
        let registry = test_registry();
        let (id, _transport) = open(&registry);
        // Unknown ids are ignored rather than panicking.
        registry.handle_binary(id + 100, &[12, 0, 0, 0, 0, 0, 0, 0, 0]);
        registry.handle_binary(id, &[12, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
