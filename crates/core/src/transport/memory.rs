//! In-memory media transport used by tests across the workspace: records
//! egress, scripts gathering outcomes and lets tests inject ingress.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use crate::sdp::{LocalMedia, RemoteMedia};
use crate::session::Handle;
use crate::transport::{GatheringState, MediaTransport, TransportFactory};

#[derive(Default)]
struct Recorded {
    remote: Option<RemoteMedia>,
    install_calls: usize,
    gather_calls: usize,
    rtp: Vec<(bool, Vec<u8>)>,
    rtcp: Vec<(bool, Vec<u8>)>,
    closed: bool,
}

pub struct MemoryTransport {
    handle: Weak<Handle>,
    auto_complete: bool,
    recorded: Mutex<Recorded>,
    gathering_tx: watch::Sender<GatheringState>,
    gathering_rx: watch::Receiver<GatheringState>,
}

impl MemoryTransport {
    fn new(handle: Weak<Handle>, auto_complete: bool) -> Arc<Self> {
        let (gathering_tx, gathering_rx) = watch::channel(GatheringState::Idle);
        Arc::new(Self {
            handle,
            auto_complete,
            recorded: Mutex::new(Recorded::default()),
            gathering_tx,
            gathering_rx,
        })
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn complete_gathering(&self) {
        let _ = self.gathering_tx.send(GatheringState::Complete);
    }

    pub fn fail_gathering(&self) {
        let _ = self.gathering_tx.send(GatheringState::Failed);
    }

    pub fn gather_calls(&self) -> usize {
        self.locked().gather_calls
    }

    pub fn install_calls(&self) -> usize {
        self.locked().install_calls
    }

    pub fn remote(&self) -> Option<RemoteMedia> {
        self.locked().remote.clone()
    }

    pub fn sent_rtp(&self) -> Vec<(bool, Vec<u8>)> {
        self.locked().rtp.clone()
    }

    pub fn sent_rtcp(&self) -> Vec<(bool, Vec<u8>)> {
        self.locked().rtcp.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.locked().closed
    }

    /// Feed a frame in as if it arrived from the wire.
    pub fn inject_rtp(&self, video: bool, buf: &[u8]) {
        if let Some(handle) = self.handle.upgrade() {
            handle.plugin().incoming_rtp(&handle, video, buf);
        }
    }

    pub fn inject_rtcp(&self, video: bool, buf: &[u8]) {
        if let Some(handle) = self.handle.upgrade() {
            handle.plugin().incoming_rtcp(&handle, video, buf);
        }
    }
}

impl MediaTransport for MemoryTransport {
    fn start_gathering(&self, _audio: bool, _video: bool) -> anyhow::Result<()> {
        self.locked().gather_calls += 1;
        let _ = self.gathering_tx.send(if self.auto_complete {
            GatheringState::Complete
        } else {
            GatheringState::InProgress
        });
        Ok(())
    }

    fn gathering(&self) -> watch::Receiver<GatheringState> {
        self.gathering_rx.clone()
    }

    fn local_media(&self) -> LocalMedia {
        LocalMedia {
            ufrag: "memfrag".to_string(),
            pwd: "mempwd0123456789abcdef00".to_string(),
            fingerprint: "sha-256 00:11:22:33".to_string(),
            audio_candidates: vec![
                "candidate:1 1 udp 2130706431 198.51.100.1 21000 typ host".to_string(),
            ],
            video_candidates: vec![
                "candidate:2 1 udp 2130706431 198.51.100.1 21002 typ host".to_string(),
            ],
        }
    }

    fn set_remote_media(&self, remote: RemoteMedia) {
        self.locked().remote = Some(remote);
    }

    fn install_remote_candidates(&self) {
        self.locked().install_calls += 1;
    }

    fn send_rtp(&self, video: bool, buf: &[u8]) {
        self.locked().rtp.push((video, buf.to_vec()));
    }

    fn send_rtcp(&self, video: bool, buf: &[u8]) {
        self.locked().rtcp.push((video, buf.to_vec()));
    }

    fn close(&self) {
        self.locked().closed = true;
    }
}

/// Factory handing out `MemoryTransport`s and remembering which handle got
/// which, so tests can inspect them afterwards.
pub struct MemoryTransportFactory {
    auto_complete: bool,
    created: Mutex<Vec<(u64, Arc<MemoryTransport>)>>,
}

impl MemoryTransportFactory {
    /// Gathering completes as soon as it starts.
    pub fn new() -> Self {
        Self {
            auto_complete: true,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Gathering stays in progress until the test script completes or fails
    /// it.
    pub fn manual() -> Self {
        Self {
            auto_complete: false,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn transport_for(&self, handle_id: u64) -> Option<Arc<MemoryTransport>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(id, _)| *id == handle_id)
            .map(|(_, t)| t.clone())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, handle: &Arc<Handle>) -> anyhow::Result<Arc<dyn MediaTransport>> {
        let transport = MemoryTransport::new(Arc::downgrade(handle), self.auto_complete);
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle.id(), transport.clone()));
        Ok(transport)
    }
}
