//! The SDP negotiation bridge: couples the opaque plugin JSON exchange to
//! the handle's ICE/DTLS transport.
//!
//! Remote→local (browser sent an offer or answer): preview, ICE local setup
//! on offers, credential/candidate hand-off, candidate install on answers,
//! then anonymization before the plugin sees the SDP.
//!
//! Local→remote (plugin produced an offer or answer): ICE local setup on
//! offers, wait for candidate gathering, anonymize and merge the gateway's
//! own material, candidate install on answers.

use std::sync::Arc;

use gatehouse_protocol::{ApiError, ErrorCode, Jsep, JsepType};
use tokio::sync::watch;

use crate::sdp;
use crate::session::Handle;
use crate::transport::{GatheringState, MediaTransport};

/// A processed JSEP plus whether this step completed negotiation (remote
/// candidates are installed, so media can come up).
#[derive(Debug)]
pub struct BridgeOutcome {
    pub jsep: Jsep,
    pub media_ready: bool,
}

/// Browser → plugin direction. Runs on the dispatcher path, before the
/// message is queued for the plugin.
pub fn process_remote(
    handle: &Arc<Handle>,
    transport: &Arc<dyn MediaTransport>,
    jsep: Jsep,
) -> Result<BridgeOutcome, ApiError> {
    let preview = sdp::preview(&jsep.sdp)
        .map_err(|e| ApiError::with_reason(ErrorCode::JsepInvalidSdp, format!("Invalid SDP: {e}")))?;

    if jsep.kind.is_offer() {
        start_ice(handle, transport, preview)?;
    }

    transport.set_remote_media(sdp::parse_remote(&jsep.sdp));

    let media_ready = jsep.kind == JsepType::Answer;
    if media_ready {
        transport.install_remote_candidates();
    }

    Ok(BridgeOutcome {
        jsep: Jsep {
            kind: jsep.kind,
            sdp: sdp::anonymize(&jsep.sdp),
        },
        media_ready,
    })
}

/// Plugin → browser direction. Runs inside `push_event`; awaits candidate
/// gathering before merging the gateway's material into the outbound SDP.
pub async fn process_local(
    handle: &Arc<Handle>,
    transport: &Arc<dyn MediaTransport>,
    jsep: Jsep,
    stop: watch::Receiver<bool>,
) -> Result<BridgeOutcome, ApiError> {
    let preview = sdp::preview(&jsep.sdp)
        .map_err(|e| ApiError::with_reason(ErrorCode::JsepInvalidSdp, format!("Invalid SDP: {e}")))?;

    if jsep.kind.is_offer() {
        start_ice(handle, transport, preview)?;
    }

    wait_gathering(transport, stop).await?;

    let merged = sdp::merge(&sdp::anonymize(&jsep.sdp), &transport.local_media());

    let media_ready = jsep.kind == JsepType::Answer;
    if media_ready {
        transport.install_remote_candidates();
    }

    Ok(BridgeOutcome {
        jsep: Jsep {
            kind: jsep.kind,
            sdp: merged,
        },
        media_ready,
    })
}

/// Trigger ICE local setup exactly once per handle. The m-section counts are
/// hints; at most one audio and one video stream are negotiated regardless of
/// how many the SDP carries.
fn start_ice(
    handle: &Arc<Handle>,
    transport: &Arc<dyn MediaTransport>,
    preview: sdp::SdpPreview,
) -> Result<(), ApiError> {
    if !handle.media().begin_ice() {
        return Ok(());
    }
    handle
        .media()
        .set_streams(preview.audio > 0, preview.video > 0);
    transport
        .start_gathering(preview.audio > 0, preview.video > 0)
        .map_err(|e| {
            ApiError::with_reason(ErrorCode::JsepInvalidSdp, format!("ICE setup failed: {e}"))
        })
}

/// Await candidate-gathering completion on the transport's watch channel.
async fn wait_gathering(
    transport: &Arc<dyn MediaTransport>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ApiError> {
    let mut gathering = transport.gathering();
    loop {
        match *gathering.borrow() {
            GatheringState::Complete => return Ok(()),
            GatheringState::Failed => {
                return Err(ApiError::with_reason(
                    ErrorCode::JsepInvalidSdp,
                    "Candidate gathering failed",
                ));
            }
            GatheringState::Idle => {
                return Err(ApiError::with_reason(
                    ErrorCode::JsepInvalidSdp,
                    "ICE local setup never ran for this handle",
                ));
            }
            GatheringState::InProgress => {}
        }
        // Resolves only once the stop flag is actually raised; a dropped
        // sender parks the branch instead of spinning on the error.
        let stopped = async {
            loop {
                if stop.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
                if *stop.borrow() {
                    return;
                }
            }
        };
        tokio::select! {
            changed = gathering.changed() => {
                if changed.is_err() {
                    return Err(ApiError::with_reason(
                        ErrorCode::JsepInvalidSdp,
                        "Transport went away during candidate gathering",
                    ));
                }
            }
            _ = stopped => {
                return Err(ApiError::with_reason(ErrorCode::Unknown, "Shutting down"));
            }
        }
    }
}
