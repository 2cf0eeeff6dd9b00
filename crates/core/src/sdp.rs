//! Line-level SDP processing owned by the negotiation bridge: previewing,
//! anonymization and credential/candidate merging. Full SDP↔ICE parsing is
//! the media transport's business.

use std::net::SocketAddr;

/// Media section counts from a quick pre-parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpPreview {
    pub audio: usize,
    pub video: usize,
}

/// Count audio and video m-sections. Fails on input that is not plausibly an
/// SDP session description.
pub fn preview(sdp: &str) -> Result<SdpPreview, String> {
    let mut lines = sdp.lines().filter(|l| !l.trim().is_empty());
    match lines.next() {
        Some(first) if first.trim_end() == "v=0" => {}
        Some(first) => return Err(format!("expected v=0, got '{}'", first.trim_end())),
        None => return Err("empty SDP".to_string()),
    }

    let mut counts = SdpPreview { audio: 0, video: 0 };
    let mut media_lines = 0usize;
    for line in lines {
        let line = line.trim_end();
        if line.starts_with("m=") {
            media_lines += 1;
            if line.starts_with("m=audio") {
                counts.audio += 1;
            } else if line.starts_with("m=video") {
                counts.video += 1;
            }
        }
    }
    if media_lines == 0 {
        return Err("no media sections".to_string());
    }
    Ok(counts)
}

const STRIPPED_PREFIXES: &[&str] = &[
    "a=candidate:",
    "a=ice-ufrag:",
    "a=ice-pwd:",
    "a=ice-options:",
    "a=fingerprint:",
];

/// Strip ICE credentials, fingerprints and candidates before the SDP crosses
/// a trust boundary. Idempotent.
pub fn anonymize(sdp: &str) -> String {
    let kept: Vec<&str> = sdp
        .lines()
        .map(str::trim_end)
        .filter(|line| {
            *line != "a=end-of-candidates"
                && !STRIPPED_PREFIXES.iter().any(|p| line.starts_with(p))
        })
        .collect();
    let mut out = kept.join("\r\n");
    out.push_str("\r\n");
    out
}

/// ICE material extracted from a remote (browser-side) SDP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMedia {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub fingerprint: Option<String>,
    /// Candidate attribute values (without the `a=` prefix) of the first
    /// audio section.
    pub audio_candidates: Vec<String>,
    /// Likewise for the first video section.
    pub video_candidates: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Head,
    Audio,
    Video,
    Other,
}

/// Pull credentials, fingerprint and per-stream candidates out of a remote
/// SDP. Only the first audio and first video section count; anything beyond
/// that is not negotiated.
pub fn parse_remote(sdp: &str) -> RemoteMedia {
    let mut remote = RemoteMedia::default();
    let mut section = Section::Head;
    let mut seen_audio = false;
    let mut seen_video = false;

    for line in sdp.lines().map(str::trim_end) {
        if line.starts_with("m=") {
            section = if line.starts_with("m=audio") && !seen_audio {
                seen_audio = true;
                Section::Audio
            } else if line.starts_with("m=video") && !seen_video {
                seen_video = true;
                Section::Video
            } else {
                Section::Other
            };
            continue;
        }
        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            remote.ufrag.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
            remote.pwd.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("a=fingerprint:") {
            remote.fingerprint.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("a=") {
            if value.starts_with("candidate:") {
                match section {
                    Section::Audio => remote.audio_candidates.push(value.to_string()),
                    Section::Video => remote.video_candidates.push(value.to_string()),
                    _ => {}
                }
            }
        }
    }
    remote
}

/// The gateway's own ICE material, merged into outbound SDP.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMedia {
    pub ufrag: String,
    pub pwd: String,
    /// `hash-func fingerprint`, e.g. `sha-256 AB:CD:…`
    pub fingerprint: String,
    pub audio_candidates: Vec<String>,
    pub video_candidates: Vec<String>,
}

/// Inject the gateway's credentials, fingerprint and candidates into each
/// negotiated media section of an (anonymized) SDP.
pub fn merge(sdp: &str, local: &LocalMedia) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut section = Section::Head;
    let mut seen_audio = false;
    let mut seen_video = false;

    let mut flush = |out: &mut Vec<String>, section: Section| {
        let candidates = match section {
            Section::Audio => &local.audio_candidates,
            Section::Video => &local.video_candidates,
            _ => return,
        };
        out.push(format!("a=ice-ufrag:{}", local.ufrag));
        out.push(format!("a=ice-pwd:{}", local.pwd));
        out.push(format!("a=fingerprint:{}", local.fingerprint));
        for candidate in candidates {
            out.push(format!("a={candidate}"));
        }
    };

    for line in sdp.lines().map(str::trim_end) {
        if line.starts_with("m=") {
            flush(&mut out, section);
            section = if line.starts_with("m=audio") && !seen_audio {
                seen_audio = true;
                Section::Audio
            } else if line.starts_with("m=video") && !seen_video {
                seen_video = true;
                Section::Video
            } else {
                Section::Other
            };
        }
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    flush(&mut out, section);

    let mut merged = out.join("\r\n");
    merged.push_str("\r\n");
    merged
}

/// Component id of a candidate attribute value
/// (`candidate:<foundation> <component> <transport> …`).
pub fn candidate_component(candidate: &str) -> Option<u16> {
    candidate.split_whitespace().nth(1)?.parse().ok()
}

/// Connection address/port of a candidate attribute value.
pub fn candidate_addr(candidate: &str) -> Option<SocketAddr> {
    let mut fields = candidate.split_whitespace();
    let addr = fields.nth(4)?;
    let port = fields.next()?;
    format!("{addr}:{port}").parse().ok()
}
