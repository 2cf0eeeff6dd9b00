//! The seam to the out-of-scope ICE/DTLS-SRTP stack. The bridge and the
//! relay callbacks only ever talk to these traits; `UdpTransport` is the
//! default implementation, `MemoryTransport` backs tests.

use std::sync::Arc;

use tokio::sync::watch;

use crate::sdp::{LocalMedia, RemoteMedia};
use crate::session::Handle;

pub mod udp;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// Candidate-gathering progress for a handle's media streams, published on a
/// watch channel so the SDP bridge can await completion instead of polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    /// `start_gathering` has not run yet.
    Idle,
    InProgress,
    Complete,
    Failed,
}

/// One handle's media plumbing.
pub trait MediaTransport: Send + Sync {
    /// Begin ICE local setup for the requested streams. Called at most once
    /// per handle (the bridge enforces this).
    fn start_gathering(&self, audio: bool, video: bool) -> anyhow::Result<()>;

    /// Watch channel tracking candidate gathering.
    fn gathering(&self) -> watch::Receiver<GatheringState>;

    /// The gateway's credentials, fingerprint and gathered candidates.
    /// Only meaningful once gathering is `Complete`.
    fn local_media(&self) -> LocalMedia;

    /// Store the remote side's credentials and candidate lines.
    fn set_remote_media(&self, remote: RemoteMedia);

    /// Activate the stored remote candidates (components 1 and 2 of each
    /// stream where present). Called on the answer leg of negotiation.
    fn install_remote_candidates(&self);

    fn send_rtp(&self, video: bool, buf: &[u8]);

    fn send_rtcp(&self, video: bool, buf: &[u8]);

    /// Tear the transport down; ingress stops, egress becomes a blackhole.
    fn close(&self);
}

/// Creates a transport per handle; wired at startup so tests can substitute
/// the in-memory implementation.
pub trait TransportFactory: Send + Sync {
    fn create(&self, handle: &Arc<Handle>) -> anyhow::Result<Arc<dyn MediaTransport>>;
}
