use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use gatehouse_protocol::config::RtpPortRange;

use crate::sdp::{self, LocalMedia, RemoteMedia};
use crate::session::Handle;
use crate::transport::{GatheringState, MediaTransport, TransportFactory};

/// Round-robin port allocation from the configured media range, shared by
/// every transport the factory creates.
struct PortAllocator {
    range: RtpPortRange,
    next: AtomicU32,
}

impl PortAllocator {
    fn new(range: RtpPortRange) -> Self {
        Self {
            range,
            next: AtomicU32::new(range.lo as u32),
        }
    }

    /// Bind a non-blocking socket on the next free port of the range.
    /// A port still held by a dying transport is simply skipped.
    fn bind(&self, interface: IpAddr) -> anyhow::Result<std::net::UdpSocket> {
        let span = (self.range.hi - self.range.lo + 1) as u32;
        for _ in 0..span {
            let offset = self.next.fetch_add(1, Ordering::Relaxed) - self.range.lo as u32;
            let port = self.range.lo + (offset % span) as u16;
            let addr = SocketAddr::new(interface, port);
            if let Ok(socket) = std::net::UdpSocket::bind(addr) {
                socket.set_nonblocking(true)?;
                return Ok(socket);
            }
        }
        anyhow::bail!("no free media port in {}-{}", self.range.lo, self.range.hi)
    }
}

/// Allocates one plain-UDP transport per handle.
///
/// This is the integration seam for a production ICE/DTLS stack: candidates
/// are host candidates on the configured interface (plus the advertised
/// public address), gathering completes as soon as the sockets are bound, and
/// inbound traffic is demultiplexed straight to the plugin's ingress entry
/// points.
pub struct UdpTransportFactory {
    interface: IpAddr,
    public_ip: Option<IpAddr>,
    fingerprint: String,
    ports: Arc<PortAllocator>,
}

impl UdpTransportFactory {
    pub fn new(
        interface: IpAddr,
        public_ip: Option<IpAddr>,
        range: RtpPortRange,
        fingerprint: String,
    ) -> Self {
        Self {
            interface,
            public_ip,
            fingerprint,
            ports: Arc::new(PortAllocator::new(range)),
        }
    }
}

impl TransportFactory for UdpTransportFactory {
    fn create(&self, handle: &Arc<Handle>) -> anyhow::Result<Arc<dyn MediaTransport>> {
        let (gathering_tx, gathering_rx) = watch::channel(GatheringState::Idle);
        Ok(Arc::new(UdpTransport {
            interface: self.interface,
            public_ip: self.public_ip,
            fingerprint: self.fingerprint.clone(),
            ports: self.ports.clone(),
            handle: Arc::downgrade(handle),
            ufrag: ice_string(8),
            pwd: ice_string(24),
            inner: Mutex::new(Inner {
                audio: None,
                video: None,
                remote: RemoteMedia::default(),
                local: None,
            }),
            closed: Arc::new(AtomicBool::new(false)),
            gathering_tx,
            gathering_rx,
        }))
    }
}

struct Stream {
    socket: Arc<UdpSocket>,
    target: Mutex<Option<SocketAddr>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    audio: Option<Stream>,
    video: Option<Stream>,
    remote: RemoteMedia,
    local: Option<LocalMedia>,
}

pub struct UdpTransport {
    interface: IpAddr,
    public_ip: Option<IpAddr>,
    fingerprint: String,
    ports: Arc<PortAllocator>,
    handle: Weak<Handle>,
    ufrag: String,
    pwd: String,
    inner: Mutex<Inner>,
    closed: Arc<AtomicBool>,
    gathering_tx: watch::Sender<GatheringState>,
    gathering_rx: watch::Receiver<GatheringState>,
}

fn ice_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn candidates_for(port: u16, interface: IpAddr, public_ip: Option<IpAddr>) -> Vec<String> {
    let mut candidates = vec![format!(
        "candidate:1 1 udp 2130706431 {interface} {port} typ host"
    )];
    if let Some(public) = public_ip {
        candidates.push(format!(
            "candidate:2 1 udp 2130706175 {public} {port} typ host"
        ));
    }
    candidates
}

impl UdpTransport {
    fn bind_stream(&self, video: bool) -> anyhow::Result<Stream> {
        let socket = self.ports.bind(self.interface)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);

        let reader = tokio::spawn(read_loop(
            socket.clone(),
            self.handle.clone(),
            video,
            self.closed.clone(),
        ));

        Ok(Stream {
            socket,
            target: Mutex::new(None),
            reader: Mutex::new(Some(reader)),
        })
    }

    fn send(&self, video: bool, buf: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let stream = if video { &inner.video } else { &inner.audio };
        let Some(stream) = stream else { return };
        let target = *stream.target.lock().unwrap_or_else(|e| e.into_inner());
        let Some(target) = target else { return };
        // Media never blocks: drop on a full socket buffer.
        let _ = stream.socket.try_send_to(buf, target);
    }
}

impl MediaTransport for UdpTransport {
    fn start_gathering(&self, audio: bool, video: bool) -> anyhow::Result<()> {
        let _ = self.gathering_tx.send(GatheringState::InProgress);

        let result = (|| -> anyhow::Result<()> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut audio_candidates = Vec::new();
            let mut video_candidates = Vec::new();
            if audio {
                let stream = self.bind_stream(false)?;
                let port = stream.socket.local_addr()?.port();
                audio_candidates = candidates_for(port, self.interface, self.public_ip);
                inner.audio = Some(stream);
            }
            if video {
                let stream = self.bind_stream(true)?;
                let port = stream.socket.local_addr()?.port();
                video_candidates = candidates_for(port, self.interface, self.public_ip);
                inner.video = Some(stream);
            }
            inner.local = Some(LocalMedia {
                ufrag: self.ufrag.clone(),
                pwd: self.pwd.clone(),
                fingerprint: self.fingerprint.clone(),
                audio_candidates,
                video_candidates,
            });
            Ok(())
        })();

        match result {
            Ok(()) => {
                let _ = self.gathering_tx.send(GatheringState::Complete);
                Ok(())
            }
            Err(e) => {
                let _ = self.gathering_tx.send(GatheringState::Failed);
                Err(e).context("media socket setup failed")
            }
        }
    }

    fn gathering(&self) -> watch::Receiver<GatheringState> {
        self.gathering_rx.clone()
    }

    fn local_media(&self) -> LocalMedia {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local
            .clone()
            .unwrap_or_else(|| LocalMedia {
                ufrag: self.ufrag.clone(),
                pwd: self.pwd.clone(),
                fingerprint: self.fingerprint.clone(),
                audio_candidates: Vec::new(),
                video_candidates: Vec::new(),
            })
    }

    fn set_remote_media(&self, remote: RemoteMedia) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remote = remote;
    }

    fn install_remote_candidates(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (stream, candidates) in [
            (&inner.audio, &inner.remote.audio_candidates),
            (&inner.video, &inner.remote.video_candidates),
        ] {
            let Some(stream) = stream else { continue };
            // Component 1 carries media; component 2 is accepted but muxed.
            let target = candidates
                .iter()
                .find(|c| sdp::candidate_component(c) == Some(1))
                .and_then(|c| sdp::candidate_addr(c));
            if let Some(addr) = target {
                *stream.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
            }
        }
    }

    fn send_rtp(&self, video: bool, buf: &[u8]) {
        self.send(video, buf);
    }

    fn send_rtcp(&self, video: bool, buf: &[u8]) {
        self.send(video, buf);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for stream in [inner.audio.take(), inner.video.take()]
            .into_iter()
            .flatten()
        {
            if let Some(reader) = stream
                .reader
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                reader.abort();
            }
        }
    }
}

/// RTP/RTCP demultiplexing on a muxed socket: RTCP packet types occupy
/// 200..=207 in the second octet.
fn is_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 2 && (200..=207).contains(&buf[1])
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    handle: Weak<Handle>,
    video: bool,
    closed: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1500];
    loop {
        let (len, _peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => break,
        };
        if closed.load(Ordering::Acquire) {
            break;
        }
        let Some(handle) = handle.upgrade() else { break };
        if handle.is_detached() {
            break;
        }
        let payload = &buf[..len];
        if is_rtcp(payload) {
            handle.plugin().incoming_rtcp(&handle, video, payload);
        } else {
            handle.plugin().incoming_rtp(&handle, video, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtcp_demux_covers_the_packet_type_range() {
        assert!(is_rtcp(&[0x80, 200]));
        assert!(is_rtcp(&[0x81, 207]));
        assert!(!is_rtcp(&[0x80, 96])); // RTP payload type 96
        assert!(!is_rtcp(&[0x80, 111])); // RTP payload type 111
        assert!(!is_rtcp(&[0x80]));
    }

    #[test]
    fn ice_strings_have_requested_length() {
        assert_eq!(ice_string(8).len(), 8);
        assert_eq!(ice_string(24).len(), 24);
        assert_ne!(ice_string(24), ice_string(24));
    }

    #[test]
    fn host_candidates_include_public_ip() {
        let candidates = candidates_for(
            20000,
            "10.0.0.5".parse().unwrap(),
            Some("203.0.113.9".parse().unwrap()),
        );
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].contains("10.0.0.5 20000 typ host"));
        assert!(candidates[1].contains("203.0.113.9 20000 typ host"));
    }

    #[test]
    fn port_allocator_walks_the_range() {
        let allocator = PortAllocator::new(RtpPortRange { lo: 49152, hi: 49162 });
        let interface: IpAddr = "127.0.0.1".parse().unwrap();
        let a = allocator.bind(interface).unwrap();
        let b = allocator.bind(interface).unwrap();
        let pa = a.local_addr().unwrap().port();
        let pb = b.local_addr().unwrap().port();
        assert_ne!(pa, pb);
        assert!((49152..=49162).contains(&pa));
        assert!((49152..=49162).contains(&pb));
    }
}
