use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_protocol::{ApiError, ErrorCode, Jsep, Reply};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::bridge;
use crate::events::{LONG_POLL_WAIT, Polled};
use crate::host::{InboundMessage, PluginHost};
use crate::plugin::GatewayCallbacks;
use crate::session::{Handle, Session, SessionRegistry};
use crate::transport::{MediaTransport, TransportFactory};

pub const SERVER_NAME: &str = "Gatehouse WebRTC Gateway";
const SERVER_VERSION: u32 = 1;

/// The signaling core: owns the session registry and the plugin host, runs
/// the SDP bridge, and is the callback surface plugins talk back through.
///
/// Process-lifetime singleton in the binary; tests build as many parallel
/// instances as they like.
pub struct Gateway {
    registry: SessionRegistry,
    host: PluginHost,
    transports: Arc<dyn TransportFactory>,
    stop: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        host: PluginHost,
        transports: Arc<dyn TransportFactory>,
        stop: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            host,
            transports,
            stop,
        })
    }

    /// Initialize plugins and spawn their workers.
    pub async fn start(self: &Arc<Self>, plugins_folder: &Path) -> anyhow::Result<()> {
        let callbacks: Arc<dyn GatewayCallbacks> = self.clone();
        self.host
            .start(callbacks, plugins_folder, self.stop.clone())
            .await
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.clone()
    }

    /// `create`: allocate a session, return its id.
    pub async fn create_session(&self) -> u64 {
        self.registry.create_session().await.id()
    }

    /// `destroy`: tear a session down, cascading over its handles.
    pub async fn destroy_session(&self, session_id: u64) -> Result<(), ApiError> {
        let session = self
            .registry
            .destroy_session(session_id)
            .await
            .ok_or_else(|| no_such_session(session_id))?;
        for handle in session.drain_handles().await {
            if let Err(e) = self.teardown_handle(&handle).await {
                tracing::warn!(
                    session_id,
                    handle_id = handle.id(),
                    "Handle teardown failed during session destroy: {e:#}"
                );
            }
        }
        Ok(())
    }

    /// `attach`: bind a new handle to the named plugin.
    pub async fn attach(&self, session_id: u64, package: &str) -> Result<u64, ApiError> {
        let session = self.find_session(session_id).await?;
        let plugin = self.host.get(package).ok_or_else(|| {
            ApiError::with_reason(ErrorCode::PluginNotFound, format!("No such plugin '{package}'"))
        })?;

        let handle = self.registry.create_handle(&session, plugin.clone()).await;
        if let Err(e) = plugin.create_session(&handle).await {
            self.registry.destroy_handle(&session, handle.id()).await;
            return Err(ApiError::with_reason(
                ErrorCode::PluginAttach,
                format!("Couldn't attach to plugin '{package}': {e}"),
            ));
        }
        Ok(handle.id())
    }

    /// `detach`: unlink a handle and release its plugin-side state.
    pub async fn detach(&self, session_id: u64, handle_id: u64) -> Result<(), ApiError> {
        let session = self.find_session(session_id).await?;
        let handle = self
            .registry
            .destroy_handle(&session, handle_id)
            .await
            .ok_or_else(|| no_such_handle(handle_id))?;
        self.teardown_handle(&handle).await.map_err(|e| {
            ApiError::with_reason(ErrorCode::PluginDetach, format!("Couldn't detach: {e}"))
        })
    }

    /// `message`: run the remote SDP leg if a jsep is present, then queue
    /// the body for the plugin's worker. The dispatcher acks synchronously;
    /// the plugin answers through the event queue.
    pub async fn message(
        &self,
        session_id: u64,
        handle_id: u64,
        transaction: Option<String>,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), ApiError> {
        let session = self.find_session(session_id).await?;
        let handle = self
            .registry
            .find_handle(&session, handle_id)
            .await
            .ok_or_else(|| no_such_handle(handle_id))?;

        let jsep = match jsep {
            Some(jsep) => {
                let transport = self.transport_for(&handle)?;
                let outcome = bridge::process_remote(&handle, &transport, jsep)?;
                if outcome.media_ready {
                    raise_media(&handle);
                }
                Some(outcome.jsep)
            }
            None => None,
        };

        self.host.dispatch(InboundMessage {
            handle,
            transaction,
            body,
            jsep,
        })
    }

    /// Long-poll drain of the session's event queue; `None` means the 30 s
    /// window elapsed and the dispatcher should answer with a keepalive.
    pub async fn poll(&self, session_id: u64) -> Result<Option<Value>, ApiError> {
        let session = self.find_session(session_id).await?;
        match session.events().poll(LONG_POLL_WAIT, self.stop.clone()).await {
            Polled::Event(event) => Ok(Some(event)),
            Polled::Timeout => Ok(None),
        }
    }

    /// `info`: gateway metadata plus the loaded plugin table.
    pub fn server_info(&self, transaction: String) -> Reply {
        let plugins: serde_json::Map<String, Value> = self
            .host
            .infos()
            .into_iter()
            .map(|info| {
                (
                    info.package.to_string(),
                    json!({
                        "name": info.name,
                        "description": info.description,
                        "version": info.version,
                        "version_string": info.version_string,
                    }),
                )
            })
            .collect();
        Reply::ServerInfo {
            transaction,
            name: SERVER_NAME.to_string(),
            version: SERVER_VERSION,
            version_string: env!("CARGO_PKG_VERSION").to_string(),
            plugins: Value::Object(plugins),
        }
    }

    /// Administrative teardown: destroy every session, then the plugins, in
    /// reverse startup order.
    pub async fn shutdown(&self) {
        for session in self.registry.live_sessions().await {
            if let Err(e) = self.destroy_session(session.id()).await {
                tracing::warn!(session_id = session.id(), "Teardown failed: {e}");
            }
        }
        self.host.destroy_all().await;
    }

    async fn find_session(&self, session_id: u64) -> Result<Arc<Session>, ApiError> {
        self.registry
            .find_session(session_id)
            .await
            .filter(|s| !s.is_destroyed())
            .ok_or_else(|| no_such_session(session_id))
    }

    fn transport_for(&self, handle: &Arc<Handle>) -> Result<Arc<dyn MediaTransport>, ApiError> {
        handle
            .media()
            .transport_or_insert_with(|| self.transports.create(handle))
            .map_err(|e| {
                ApiError::with_reason(ErrorCode::Unknown, format!("Transport setup failed: {e}"))
            })
    }

    /// Detach-time cascade: hang up live media, close the transport, then
    /// let the plugin free its per-handle state.
    async fn teardown_handle(&self, handle: &Arc<Handle>) -> anyhow::Result<()> {
        handle.mark_detached();
        if handle.media().is_up() {
            handle.plugin().hangup_media(handle).await;
        }
        if let Some(transport) = handle.media().take_transport() {
            transport.close();
        }
        handle.plugin().destroy_session(handle).await
    }
}

fn no_such_session(session_id: u64) -> ApiError {
    ApiError::with_reason(ErrorCode::SessionNotFound, format!("No such session {session_id}"))
}

fn no_such_handle(handle_id: u64) -> ApiError {
    ApiError::with_reason(ErrorCode::HandleNotFound, format!("No such handle {handle_id}"))
}

/// First completed negotiation fires `setup_media`, off the caller's path.
fn raise_media(handle: &Arc<Handle>) {
    if handle.media().raise() {
        let plugin = handle.plugin().clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            plugin.setup_media(&handle).await;
        });
    }
}

#[async_trait]
impl GatewayCallbacks for Gateway {
    async fn push_event(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        data: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), ApiError> {
        if !data.is_object() {
            return Err(ApiError::with_reason(
                ErrorCode::InvalidJsonObject,
                "Event data is not a JSON object",
            ));
        }
        let Some(session) = handle.session() else {
            return Err(ApiError::with_reason(
                ErrorCode::SessionNotFound,
                "Session is gone",
            ));
        };
        if session.is_destroyed() || handle.is_detached() {
            tracing::debug!(
                handle_id = handle.id(),
                "Dropping event for destroyed session"
            );
            return Ok(());
        }

        let jsep = match jsep {
            Some(jsep) => {
                let transport = self.transport_for(handle)?;
                let outcome =
                    bridge::process_local(handle, &transport, jsep, self.stop.clone()).await?;
                if outcome.media_ready {
                    raise_media(handle);
                }
                Some(outcome.jsep)
            }
            None => None,
        };

        let reply = Reply::event(
            handle.id(),
            transaction.map(str::to_string),
            handle.plugin().info().package,
            data,
            jsep,
        );
        let event = serde_json::to_value(&reply)
            .map_err(|e| ApiError::with_reason(ErrorCode::Unknown, e.to_string()))?;
        session.events().push(event);
        Ok(())
    }

    fn relay_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        if handle.is_detached() || !handle.media().is_up() {
            return;
        }
        if handle.session().map(|s| s.is_destroyed()).unwrap_or(true) {
            return;
        }
        if let Some(transport) = handle.media().transport() {
            transport.send_rtp(video, buf);
        }
    }

    fn relay_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]) {
        if handle.is_detached() || !handle.media().is_up() {
            return;
        }
        if handle.session().map(|s| s.is_destroyed()).unwrap_or(true) {
            return;
        }
        if let Some(transport) = handle.media().transport() {
            transport.send_rtcp(video, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginInfo};
    use crate::transport::memory::MemoryTransportFactory;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const OFFER: &str = "v=0\r\n\
        s=-\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:remotefrag\r\n\
        a=ice-pwd:remotepwd012345678901234\r\n\
        a=candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host\r\n";

    /// Records every entry-point invocation so tests can assert the
    /// lifecycle contract.
    #[derive(Default)]
    struct RecordingPlugin {
        calls: StdMutex<Vec<String>>,
        messages: StdMutex<Vec<(u64, Option<String>, Value, Option<Jsep>)>>,
    }

    impl RecordingPlugin {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn messages(&self) -> Vec<(u64, Option<String>, Value, Option<Jsep>)> {
            self.messages.lock().unwrap().clone()
        }
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                package: "test.plugin.recording",
                name: "Recording",
                description: "records entry-point invocations",
                version: 1,
                version_string: "0.0.1",
            }
        }
        async fn init(
            &self,
            _gateway: Arc<dyn GatewayCallbacks>,
            _config_dir: &Path,
        ) -> anyhow::Result<()> {
            self.record("init");
            Ok(())
        }
        async fn destroy(&self) {
            self.record("destroy");
        }
        async fn create_session(&self, handle: &Arc<Handle>) -> anyhow::Result<()> {
            self.record(format!("create_session:{}", handle.id()));
            Ok(())
        }
        async fn destroy_session(&self, handle: &Arc<Handle>) -> anyhow::Result<()> {
            self.record(format!("destroy_session:{}", handle.id()));
            Ok(())
        }
        async fn setup_media(&self, handle: &Arc<Handle>) {
            self.record(format!("setup_media:{}", handle.id()));
        }
        async fn hangup_media(&self, handle: &Arc<Handle>) {
            self.record(format!("hangup_media:{}", handle.id()));
        }
        async fn handle_message(
            &self,
            handle: &Arc<Handle>,
            transaction: Option<&str>,
            body: Value,
            jsep: Option<Jsep>,
        ) -> anyhow::Result<()> {
            self.record(format!("handle_message:{}", handle.id()));
            self.messages.lock().unwrap().push((
                handle.id(),
                transaction.map(str::to_string),
                body,
                jsep,
            ));
            Ok(())
        }
        fn incoming_rtp(&self, _handle: &Arc<Handle>, _video: bool, _buf: &[u8]) {}
        fn incoming_rtcp(&self, _handle: &Arc<Handle>, _video: bool, _buf: &[u8]) {}
    }

    struct Fixture {
        gateway: Arc<Gateway>,
        plugin: Arc<RecordingPlugin>,
        transports: Arc<MemoryTransportFactory>,
        _stop_tx: watch::Sender<bool>,
    }

    async fn fixture() -> Fixture {
        let plugin = Arc::new(RecordingPlugin::default());
        let mut host = PluginHost::new();
        host.register(plugin.clone()).unwrap();
        let transports = Arc::new(MemoryTransportFactory::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let gateway = Gateway::new(host, transports.clone(), stop_rx);
        gateway.start(&std::env::temp_dir()).await.unwrap();
        Fixture {
            gateway,
            plugin,
            transports,
            _stop_tx: stop_tx,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn create_then_destroy_nets_zero_sessions() {
        let fx = fixture().await;
        let id = fx.gateway.create_session().await;
        assert_eq!(fx.gateway.registry().session_count().await, 1);
        fx.gateway.destroy_session(id).await.unwrap();
        assert_eq!(fx.gateway.registry().session_count().await, 0);

        let err = fx.gateway.poll(id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn attach_then_detach_calls_plugin_lifecycle_once_each() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();
        fx.gateway.detach(session_id, handle_id).await.unwrap();

        let calls = fx.plugin.calls();
        assert_eq!(
            calls,
            vec![
                "init".to_string(),
                format!("create_session:{handle_id}"),
                format!("destroy_session:{handle_id}"),
            ]
        );
    }

    #[tokio::test]
    async fn attach_unknown_plugin_fails() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let err = fx.gateway.attach(session_id, "nope").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PluginNotFound);
    }

    #[tokio::test]
    async fn detach_unknown_handle_fails() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let err = fx.gateway.detach(session_id, 99).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::HandleNotFound);
    }

    #[tokio::test]
    async fn message_reaches_plugin_worker() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();

        fx.gateway
            .message(
                session_id,
                handle_id,
                Some("t42".to_string()),
                json!({"request": "ping"}),
                None,
            )
            .await
            .unwrap();

        let plugin = fx.plugin.clone();
        eventually(move || !plugin.messages().is_empty()).await;

        let (hid, transaction, body, jsep) = fx.plugin.messages().remove(0);
        assert_eq!(hid, handle_id);
        assert_eq!(transaction.as_deref(), Some("t42"));
        assert_eq!(body["request"], "ping");
        assert!(jsep.is_none());
    }

    #[tokio::test]
    async fn offer_message_runs_ice_setup_once_and_anonymizes() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();

        fx.gateway
            .message(
                session_id,
                handle_id,
                Some("t1".to_string()),
                json!({"request": "call"}),
                Some(Jsep::offer(OFFER)),
            )
            .await
            .unwrap();

        let plugin = fx.plugin.clone();
        eventually(move || !plugin.messages().is_empty()).await;

        let transport = fx.transports.transport_for(handle_id).unwrap();
        assert_eq!(transport.gather_calls(), 1);

        let (_, _, _, jsep) = fx.plugin.messages().remove(0);
        let jsep = jsep.unwrap();
        assert!(jsep.kind.is_offer());
        assert!(!jsep.sdp.contains("remotefrag"));
        assert!(!jsep.sdp.contains("a=candidate:"));
    }

    #[tokio::test]
    async fn push_event_delivers_in_order_through_poll() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();
        let session = fx.gateway.registry().find_session(session_id).await.unwrap();
        let handle = fx
            .gateway
            .registry()
            .find_handle(&session, handle_id)
            .await
            .unwrap();

        for i in 0..3 {
            fx.gateway
                .push_event(&handle, Some("t"), json!({"seq": i}), None)
                .await
                .unwrap();
        }

        for i in 0..3 {
            let event = fx.gateway.poll(session_id).await.unwrap().unwrap();
            assert_eq!(event["janus"], "event");
            assert_eq!(event["sender"], handle_id);
            assert_eq!(event["plugindata"]["plugin"], "test.plugin.recording");
            assert_eq!(event["plugindata"]["data"]["seq"], i);
        }
    }

    #[tokio::test]
    async fn push_event_rejects_non_object_data() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();
        let session = fx.gateway.registry().find_session(session_id).await.unwrap();
        let handle = fx
            .gateway
            .registry()
            .find_handle(&session, handle_id)
            .await
            .unwrap();

        let err = fx
            .gateway
            .push_event(&handle, None, json!("not an object"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidJsonObject);
    }

    #[tokio::test]
    async fn answer_event_merges_local_material_and_fires_setup_media() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();
        let session = fx.gateway.registry().find_session(session_id).await.unwrap();
        let handle = fx
            .gateway
            .registry()
            .find_handle(&session, handle_id)
            .await
            .unwrap();

        // Browser offer in, plugin answer out.
        fx.gateway
            .message(
                session_id,
                handle_id,
                Some("t1".to_string()),
                json!({"request": "call"}),
                Some(Jsep::offer(OFFER)),
            )
            .await
            .unwrap();
        fx.gateway
            .push_event(
                &handle,
                Some("t1"),
                json!({"event": "accepted"}),
                Some(Jsep::answer(OFFER)),
            )
            .await
            .unwrap();

        let event = fx.gateway.poll(session_id).await.unwrap().unwrap();
        let sdp = event["jsep"]["sdp"].as_str().unwrap();
        assert_eq!(event["jsep"]["type"], "answer");
        assert!(sdp.contains("a=ice-ufrag:memfrag"));
        assert!(!sdp.contains("remotefrag"));

        let transport = fx.transports.transport_for(handle_id).unwrap();
        assert_eq!(transport.install_calls(), 1);
        assert!(handle.media().is_up());

        let plugin = fx.plugin.clone();
        eventually(move || {
            plugin
                .calls()
                .contains(&format!("setup_media:{handle_id}"))
        })
        .await;
    }

    #[tokio::test]
    async fn destroy_session_cascades_over_handles() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let h1 = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();
        let h2 = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();

        fx.gateway.destroy_session(session_id).await.unwrap();

        let calls = fx.plugin.calls();
        assert!(calls.contains(&format!("destroy_session:{h1}")));
        assert!(calls.contains(&format!("destroy_session:{h2}")));
        assert_eq!(fx.gateway.registry().session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_to_keepalive_marker() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let polled = fx.gateway.poll(session_id).await.unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn shutdown_destroys_sessions_then_plugins() {
        let fx = fixture().await;
        let session_id = fx.gateway.create_session().await;
        let handle_id = fx
            .gateway
            .attach(session_id, "test.plugin.recording")
            .await
            .unwrap();

        fx.gateway.shutdown().await;

        let calls = fx.plugin.calls();
        let destroy_session_at = calls
            .iter()
            .position(|c| c == &format!("destroy_session:{handle_id}"))
            .expect("plugin session destroyed");
        let destroy_at = calls
            .iter()
            .position(|c| c == "destroy")
            .expect("plugin destroyed");
        assert!(destroy_session_at < destroy_at);
        assert_eq!(fx.gateway.registry().session_count().await, 0);
    }

    #[tokio::test]
    async fn server_info_lists_plugins() {
        let fx = fixture().await;
        let reply = fx.gateway.server_info("t".to_string());
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["janus"], "server_info");
        assert_eq!(
            json["plugins"]["test.plugin.recording"]["name"],
            "Recording"
        );
    }
}
