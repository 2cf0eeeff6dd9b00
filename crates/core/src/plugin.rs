use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_protocol::{ApiError, Jsep};
use serde_json::Value;

use crate::session::Handle;

/// Static description of a plugin, exposed through `server_info` and used to
/// key the plugin directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginInfo {
    /// Dotted package identifier, e.g. `janus.plugin.videocall`
    pub package: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub version: u32,
    pub version_string: &'static str,
}

/// The plugin side of the host contract. Every entry point is mandatory; the
/// host validates the metadata at registration and drives the lifecycle.
///
/// `incoming_rtp`/`incoming_rtcp` sit on the media path and must never block;
/// everything else runs on the plugin's message worker or the control plane.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    /// Called once at startup with the gateway callback surface and the
    /// plugin's own configuration directory.
    async fn init(
        &self,
        gateway: Arc<dyn GatewayCallbacks>,
        config_dir: &Path,
    ) -> anyhow::Result<()>;

    /// Called once at shutdown, after all sessions are gone.
    async fn destroy(&self);

    /// A handle was attached to this plugin; set up per-handle state.
    async fn create_session(&self, handle: &Arc<Handle>) -> anyhow::Result<()>;

    /// The handle is going away; release per-handle state. This is the only
    /// path that frees plugin-side state.
    async fn destroy_session(&self, handle: &Arc<Handle>) -> anyhow::Result<()>;

    /// The handle's media path is up (negotiation finished, candidates
    /// installed).
    async fn setup_media(&self, handle: &Arc<Handle>);

    /// The handle's media path went away (transport failure or teardown).
    async fn hangup_media(&self, handle: &Arc<Handle>);

    /// A `message` request reached this handle. `jsep`, when present, has
    /// already been anonymized by the SDP bridge.
    async fn handle_message(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        body: Value,
        jsep: Option<Jsep>,
    ) -> anyhow::Result<()>;

    /// Demultiplexed RTP arrived from the handle's peer connection.
    fn incoming_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);

    /// Demultiplexed RTCP arrived from the handle's peer connection.
    fn incoming_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);
}

/// The gateway side of the contract, handed to every plugin at `init`.
#[async_trait]
pub trait GatewayCallbacks: Send + Sync {
    /// Queue an asynchronous event for the handle's session. `data` must be a
    /// JSON object; a `jsep` runs the local→remote leg of the SDP bridge
    /// before the event is enqueued.
    async fn push_event(
        &self,
        handle: &Arc<Handle>,
        transaction: Option<&str>,
        data: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), ApiError>;

    /// Hand RTP to the ICE/DTLS layer for this handle. Blackhole when the
    /// handle has no active media.
    fn relay_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);

    /// Hand RTCP to the ICE/DTLS layer for this handle.
    fn relay_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);
}
