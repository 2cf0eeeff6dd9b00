use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::RwLock;

use crate::events::EventQueue;
use crate::ids::allocate_id;
use crate::plugin::Plugin;
use crate::transport::MediaTransport;

/// A browser's control-plane context: an ordered event queue plus the handles
/// it has attached to plugins.
pub struct Session {
    id: u64,
    handles: RwLock<HashMap<u64, Arc<Handle>>>,
    events: EventQueue,
    destroyed: AtomicBool,
}

impl Session {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            handles: RwLock::new(HashMap::new()),
            events: EventQueue::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Set before the session is unlinked from the registry, so in-flight
    /// workers and relays observe a consistent "going away" state.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub async fn handle_count(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Remove and return every handle; used by the destroy cascade after the
    /// session has been marked destroyed.
    pub(crate) async fn drain_handles(&self) -> Vec<Arc<Handle>> {
        self.handles
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }
}

/// A session's attachment to one plugin instance. Bound to exactly one plugin
/// for its entire lifetime; owns the (future) peer connection through its
/// media state.
pub struct Handle {
    id: u64,
    session: Weak<Session>,
    plugin: Arc<dyn Plugin>,
    media: MediaState,
    detached: AtomicBool,
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn media(&self) -> &MediaState {
        &self.media
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("plugin", &self.plugin.info().package)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Placeholder for the handle's ICE/DTLS context, filled in by the SDP
/// bridge: the transport slot, the negotiated stream set and the
/// setup-once/up flags.
pub struct MediaState {
    transport: StdMutex<Option<Arc<dyn MediaTransport>>>,
    ice_started: AtomicBool,
    webrtc_up: AtomicBool,
    audio: AtomicBool,
    video: AtomicBool,
}

impl MediaState {
    fn new() -> Self {
        Self {
            transport: StdMutex::new(None),
            ice_started: AtomicBool::new(false),
            webrtc_up: AtomicBool::new(false),
            audio: AtomicBool::new(false),
            video: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get the handle's transport, creating it with `make` on first use.
    /// The slot mutex makes concurrent first uses converge on one transport.
    pub fn transport_or_insert_with(
        &self,
        make: impl FnOnce() -> anyhow::Result<Arc<dyn MediaTransport>>,
    ) -> anyhow::Result<Arc<dyn MediaTransport>> {
        let mut slot = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }
        let transport = make()?;
        *slot = Some(transport.clone());
        Ok(transport)
    }

    pub(crate) fn take_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// True exactly once: the first caller wins the right to run ICE local
    /// setup for this handle.
    pub(crate) fn begin_ice(&self) -> bool {
        !self.ice_started.swap(true, Ordering::AcqRel)
    }

    pub fn ice_started(&self) -> bool {
        self.ice_started.load(Ordering::Acquire)
    }

    /// True exactly once: the first caller fires `setup_media`.
    pub(crate) fn raise(&self) -> bool {
        !self.webrtc_up.swap(true, Ordering::AcqRel)
    }

    pub fn is_up(&self) -> bool {
        self.webrtc_up.load(Ordering::Acquire)
    }

    pub(crate) fn set_streams(&self, audio: bool, video: bool) {
        self.audio.store(audio, Ordering::Release);
        self.video.store(video, Ordering::Release);
    }

    pub fn has_audio(&self) -> bool {
        self.audio.load(Ordering::Acquire)
    }

    pub fn has_video(&self) -> bool {
        self.video.load(Ordering::Acquire)
    }
}

/// Concurrent map of live sessions. All mutations are serialized under the
/// registry lock, which is held only long enough to insert or remove; plugin
/// callbacks are never invoked under it.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        let id = allocate_id(&sessions);
        let session = Session::new(id);
        sessions.insert(id, session.clone());
        tracing::info!(session_id = id, "Session created");
        session
    }

    pub async fn find_session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Mark the session destroyed, then unlink it. Returns the session so the
    /// caller can run the handle cascade outside the registry lock.
    pub async fn destroy_session(&self, id: u64) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get(&id)?;
        session.mark_destroyed();
        let session = sessions.remove(&id);
        if session.is_some() {
            tracing::info!(session_id = id, "Session destroyed");
        }
        session
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of every live session; used by shutdown teardown.
    pub async fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn create_handle(
        &self,
        session: &Arc<Session>,
        plugin: Arc<dyn Plugin>,
    ) -> Arc<Handle> {
        let mut handles = session.handles.write().await;
        let id = allocate_id(&handles);
        let handle = Arc::new(Handle {
            id,
            session: Arc::downgrade(session),
            plugin,
            media: MediaState::new(),
            detached: AtomicBool::new(false),
        });
        handles.insert(id, handle.clone());
        tracing::info!(
            session_id = session.id(),
            handle_id = id,
            plugin = handle.plugin.info().package,
            "Handle attached"
        );
        handle
    }

    pub async fn find_handle(&self, session: &Arc<Session>, id: u64) -> Option<Arc<Handle>> {
        session.handles.read().await.get(&id).cloned()
    }

    /// Unlink a handle from its session. The caller runs the plugin-side
    /// teardown afterwards, outside the lock.
    pub async fn destroy_handle(&self, session: &Arc<Session>, id: u64) -> Option<Arc<Handle>> {
        let handle = session.handles.write().await.remove(&id);
        if handle.is_some() {
            tracing::info!(session_id = session.id(), handle_id = id, "Handle detached");
        }
        handle
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
