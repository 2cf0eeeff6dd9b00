//! Reference pair-matching videocall plugin: two registered users call each
//! other through the gateway, which relays their RTP/RTCP and applies
//! REMB-based bitrate caps.

mod remb;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use gatehouse_core::plugin::{GatewayCallbacks, Plugin, PluginInfo};
use gatehouse_core::session::Handle;
use gatehouse_protocol::Jsep;
use serde_json::{Value, json};

pub const VIDEOCALL_PACKAGE: &str = "janus.plugin.videocall";

/// Per-handle plugin state. Peer links are symmetric and only ever touched
/// under the plugin mutex, so a destroyed peer is always safe to observe.
struct VideoCallSession {
    handle: Arc<Handle>,
    username: Option<String>,
    audio_active: bool,
    video_active: bool,
    /// Bits per second; 0 means no cap.
    bitrate: u32,
    peer: Option<u64>,
    destroyed: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u64, VideoCallSession>,
    usernames: HashMap<String, u64>,
}

/// An event computed under the lock, delivered after it is released.
struct Outbound {
    handle: Arc<Handle>,
    transaction: Option<String>,
    data: Value,
    jsep: Option<Jsep>,
}

pub struct VideoCallPlugin {
    gateway: OnceLock<Arc<dyn GatewayCallbacks>>,
    inner: Mutex<Inner>,
}

impl VideoCallPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gateway: OnceLock::new(),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gateway(&self) -> Option<&Arc<dyn GatewayCallbacks>> {
        self.gateway.get()
    }

    async fn deliver(&self, events: Vec<Outbound>) {
        let Some(gateway) = self.gateway() else { return };
        for event in events {
            if let Err(e) = gateway
                .push_event(
                    &event.handle,
                    event.transaction.as_deref(),
                    event.data,
                    event.jsep,
                )
                .await
            {
                tracing::warn!(handle_id = event.handle.id(), "Event push failed: {e}");
            }
        }
    }

    fn list(&self, handle: &Arc<Handle>, transaction: Option<&str>) -> Result<Vec<Outbound>, String> {
        let inner = self.lock();
        let mut list: Vec<String> = inner.usernames.keys().cloned().collect();
        list.sort();
        Ok(vec![Outbound {
            handle: handle.clone(),
            transaction: transaction.map(str::to_string),
            data: json!({ "list": list }),
            jsep: None,
        }])
    }

    fn register(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        body: &Value,
    ) -> Result<Vec<Outbound>, String> {
        let username = body
            .get("username")
            .and_then(Value::as_str)
            .ok_or("Missing username")?
            .to_string();

        let mut inner = self.lock();
        {
            let session = inner
                .sessions
                .get(&handle.id())
                .ok_or("No videocall session for this handle")?;
            if session.username.is_some() {
                return Err("Already registered".to_string());
            }
        }
        if inner.usernames.contains_key(&username) {
            return Err(format!("Username '{username}' already taken"));
        }
        inner.usernames.insert(username.clone(), handle.id());
        if let Some(session) = inner.sessions.get_mut(&handle.id()) {
            session.username = Some(username.clone());
        }
        tracing::info!(handle_id = handle.id(), %username, "User registered");

        Ok(vec![Outbound {
            handle: handle.clone(),
            transaction: transaction.map(str::to_string),
            data: json!({ "event": "registered", "username": username }),
            jsep: None,
        }])
    }

    fn call(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        body: &Value,
        jsep: Option<Jsep>,
    ) -> Result<Vec<Outbound>, String> {
        let callee_name = body
            .get("username")
            .and_then(Value::as_str)
            .ok_or("Missing username")?;
        let jsep = jsep.ok_or("Missing SDP")?;

        let mut inner = self.lock();
        let caller_id = handle.id();
        let caller_name = {
            let caller = inner
                .sessions
                .get(&caller_id)
                .ok_or("No videocall session for this handle")?;
            if caller.peer.is_some() {
                return Err("Already in a call".to_string());
            }
            caller
                .username
                .clone()
                .ok_or("Register a username before calling")?
        };

        let callee_id = *inner
            .usernames
            .get(callee_name)
            .ok_or_else(|| format!("Username '{callee_name}' doesn't exist"))?;
        if callee_id == caller_id {
            return Err("You can't call yourself".to_string());
        }

        let callee = inner
            .sessions
            .get(&callee_id)
            .ok_or_else(|| format!("Username '{callee_name}' doesn't exist"))?;
        if callee.peer.is_some() {
            // The callee is busy; tell the caller the call is over before it
            // began. No peer link is made.
            return Ok(vec![Outbound {
                handle: handle.clone(),
                transaction: transaction.map(str::to_string),
                data: json!({
                    "event": "hangup",
                    "username": caller_name,
                    "reason": "User busy",
                }),
                jsep: None,
            }]);
        }
        let callee_handle = callee.handle.clone();

        // Link both directions under the same lock acquisition.
        if let Some(caller) = inner.sessions.get_mut(&caller_id) {
            caller.peer = Some(callee_id);
        }
        if let Some(callee) = inner.sessions.get_mut(&callee_id) {
            callee.peer = Some(caller_id);
        }
        tracing::info!(caller = %caller_name, callee = callee_name, "Call started");

        Ok(vec![
            Outbound {
                handle: callee_handle,
                transaction: None,
                data: json!({ "event": "incomingcall", "username": caller_name }),
                jsep: Some(jsep),
            },
            Outbound {
                handle: handle.clone(),
                transaction: transaction.map(str::to_string),
                data: json!({ "event": "calling" }),
                jsep: None,
            },
        ])
    }

    fn accept(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        jsep: Option<Jsep>,
    ) -> Result<Vec<Outbound>, String> {
        let jsep = jsep.ok_or("Missing SDP")?;

        let inner = self.lock();
        let session = inner
            .sessions
            .get(&handle.id())
            .ok_or("No videocall session for this handle")?;
        let peer_id = session.peer.ok_or("No incoming call to accept")?;
        let own_name = session.username.clone().unwrap_or_default();
        let peer_handle = inner
            .sessions
            .get(&peer_id)
            .ok_or("The caller is gone")?
            .handle
            .clone();
        drop(inner);

        Ok(vec![
            Outbound {
                handle: peer_handle,
                transaction: None,
                data: json!({ "event": "accepted", "username": own_name }),
                jsep: Some(jsep),
            },
            Outbound {
                handle: handle.clone(),
                transaction: transaction.map(str::to_string),
                data: json!({ "event": "accepted" }),
                jsep: None,
            },
        ])
    }

    fn set(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        body: &Value,
    ) -> Result<Vec<Outbound>, String> {
        let audio = body.get("audio").and_then(Value::as_bool);
        let video = body.get("video").and_then(Value::as_bool);
        let bitrate = body.get("bitrate").and_then(Value::as_u64).map(|b| b as u32);

        let mut synthesize = None;
        {
            let mut inner = self.lock();
            let session = inner
                .sessions
                .get_mut(&handle.id())
                .ok_or("No videocall session for this handle")?;
            if let Some(audio) = audio {
                session.audio_active = audio;
            }
            if let Some(video) = video {
                session.video_active = video;
            }
            if let Some(bitrate) = bitrate {
                session.bitrate = bitrate;
                if bitrate > 0 {
                    synthesize = Some(bitrate);
                }
                // A zero cap ceases REMB capping immediately; no packet is
                // synthesized to "un-cap" the browser.
            }
        }

        if let Some(bitrate) = synthesize {
            match remb::encode(bitrate) {
                Ok(packet) => {
                    if let Some(gateway) = self.gateway() {
                        gateway.relay_rtcp(handle, true, &packet);
                    }
                }
                Err(e) => tracing::warn!(handle_id = handle.id(), "REMB synthesis failed: {e}"),
            }
        }

        Ok(vec![Outbound {
            handle: handle.clone(),
            transaction: transaction.map(str::to_string),
            data: json!({ "event": "set" }),
            jsep: None,
        }])
    }

    fn hangup(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
    ) -> Result<Vec<Outbound>, String> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get(&handle.id())
            .ok_or("No videocall session for this handle")?;
        // No call in progress: silently ignore.
        let Some(peer_id) = session.peer else {
            return Ok(Vec::new());
        };

        let peer_handle = Self::unlink(&mut inner, handle.id(), peer_id);
        drop(inner);

        let mut events = vec![Outbound {
            handle: handle.clone(),
            transaction: transaction.map(str::to_string),
            data: json!({ "event": "hangup", "reason": "We did the hangup" }),
            jsep: None,
        }];
        if let Some(peer_handle) = peer_handle {
            events.push(Outbound {
                handle: peer_handle,
                transaction: None,
                data: json!({ "event": "hangup", "reason": "Remote hangup" }),
                jsep: None,
            });
        }
        Ok(events)
    }

    /// Clear both ends of a peer link under the caller's lock; returns the
    /// peer's handle if it is still around.
    fn unlink(inner: &mut Inner, own_id: u64, peer_id: u64) -> Option<Arc<Handle>> {
        if let Some(own) = inner.sessions.get_mut(&own_id) {
            own.peer = None;
        }
        let peer = inner.sessions.get_mut(&peer_id)?;
        peer.peer = None;
        Some(peer.handle.clone())
    }
}

impl Default for VideoCallPlugin {
    fn default() -> Self {
        Self {
            gateway: OnceLock::new(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl Plugin for VideoCallPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            package: VIDEOCALL_PACKAGE,
            name: "Gatehouse VideoCall plugin",
            description: "Pair-matching videocall bridge",
            version: 1,
            version_string: env!("CARGO_PKG_VERSION"),
        }
    }

    async fn init(
        &self,
        gateway: Arc<dyn GatewayCallbacks>,
        config_dir: &Path,
    ) -> anyhow::Result<()> {
        if self.gateway.set(gateway).is_err() {
            anyhow::bail!("videocall plugin initialized twice");
        }
        tracing::debug!(config_dir = %config_dir.display(), "VideoCall plugin ready");
        Ok(())
    }

    async fn destroy(&self) {
        let mut inner = self.lock();
        inner.sessions.clear();
        inner.usernames.clear();
    }

    async fn create_session(&self, handle: &Arc<Handle>) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.sessions.insert(
            handle.id(),
            VideoCallSession {
                handle: handle.clone(),
                username: None,
                audio_active: true,
                video_active: true,
                bitrate: 0,
                peer: None,
                destroyed: false,
            },
        );
        Ok(())
    }

    async fn destroy_session(&self, handle: &Arc<Handle>) -> anyhow::Result<()> {
        let (peer_handle, username) = {
            let mut inner = self.lock();
            let Some(session) = inner.sessions.get_mut(&handle.id()) else {
                return Ok(());
            };
            session.destroyed = true;
            let peer_id = session.peer;
            let username = session.username.clone();
            // Clear the peer link before the state is freed.
            let peer_handle = peer_id.and_then(|peer_id| Self::unlink(&mut inner, handle.id(), peer_id));
            if let Some(username) = &username {
                inner.usernames.remove(username);
            }
            inner.sessions.remove(&handle.id());
            (peer_handle, username)
        };

        if let Some(username) = username {
            tracing::info!(handle_id = handle.id(), %username, "User unregistered");
        }
        if let Some(peer_handle) = peer_handle {
            self.deliver(vec![Outbound {
                handle: peer_handle,
                transaction: None,
                data: json!({ "event": "hangup", "reason": "Remote hangup" }),
                jsep: None,
            }])
            .await;
        }
        Ok(())
    }

    async fn setup_media(&self, handle: &Arc<Handle>) {
        tracing::debug!(handle_id = handle.id(), "Media path is up");
    }

    async fn hangup_media(&self, handle: &Arc<Handle>) {
        let peer_handle = {
            let mut inner = self.lock();
            let Some(session) = inner.sessions.get(&handle.id()) else {
                return;
            };
            let Some(peer_id) = session.peer else { return };
            Self::unlink(&mut inner, handle.id(), peer_id)
        };
        if let Some(peer_handle) = peer_handle {
            self.deliver(vec![Outbound {
                handle: peer_handle,
                transaction: None,
                data: json!({ "event": "hangup", "reason": "Remote hangup" }),
                jsep: None,
            }])
            .await;
        }
    }

    async fn handle_message(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        body: Value,
        jsep: Option<Jsep>,
    ) -> anyhow::Result<()> {
        let request = body
            .get("request")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let result = match request.as_str() {
            "list" => self.list(handle, transaction),
            "register" => self.register(handle, transaction, &body),
            "call" => self.call(handle, transaction, &body, jsep),
            "accept" => self.accept(handle, transaction, jsep),
            "set" => self.set(handle, transaction, &body),
            "hangup" => self.hangup(handle, transaction),
            other => Err(format!("Unknown request '{other}'")),
        };

        match result {
            Ok(events) => self.deliver(events).await,
            Err(reason) => {
                tracing::debug!(handle_id = handle.id(), %request, "Request failed: {reason}");
                self.deliver(vec![Outbound {
                    handle: handle.clone(),
                    transaction: transaction.map(str::to_string),
                    data: json!({ "event": "error", "error": reason }),
                    jsep: None,
                }])
                .await;
            }
        }
        Ok(())
    }

    fn incoming_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        let peer_handle = {
            let inner = self.lock();
            let Some(session) = inner.sessions.get(&handle.id()) else {
                return;
            };
            if session.destroyed {
                return;
            }
            let active = if video {
                session.video_active
            } else {
                session.audio_active
            };
            if !active {
                return;
            }
            let Some(peer_id) = session.peer else { return };
            let Some(peer) = inner.sessions.get(&peer_id) else {
                return;
            };
            peer.handle.clone()
        };
        if let Some(gateway) = self.gateway() {
            gateway.relay_rtp(&peer_handle, video, buf);
        }
    }

    fn incoming_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        let (peer_handle, cap) = {
            let inner = self.lock();
            let Some(session) = inner.sessions.get(&handle.id()) else {
                return;
            };
            if session.destroyed {
                return;
            }
            let Some(peer_id) = session.peer else { return };
            let Some(peer) = inner.sessions.get(&peer_id) else {
                return;
            };
            (peer.handle.clone(), session.bitrate)
        };

        let capped = if cap > 0 { remb::cap(buf, cap) } else { None };
        if let Some(gateway) = self.gateway() {
            gateway.relay_rtcp(&peer_handle, video, capped.as_deref().unwrap_or(buf));
        }
    }
}
