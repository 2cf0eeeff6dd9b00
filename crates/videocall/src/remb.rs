//! Receiver Estimated Maximum Bitrate handling: synthesizing a cap packet
//! when the user asks for one, and rewriting forwarded RTCP so a relayed
//! estimate never exceeds the configured cap.

use rtcp::packet::Packet;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;

/// Build a standalone REMB packet carrying `bitrate` (bits per second).
pub fn encode(bitrate: u32) -> anyhow::Result<Vec<u8>> {
    let remb = ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 0,
        bitrate: bitrate as f32,
        ssrcs: Vec::new(),
    };
    let packets: Vec<Box<dyn Packet + Send + Sync>> = vec![Box::new(remb)];
    Ok(rtcp::packet::marshal(&packets)?.to_vec())
}

/// Rewrite any REMB in a (possibly compound) RTCP packet down to `cap`.
/// Returns `None` when nothing needed rewriting, so callers can forward the
/// original bytes untouched.
pub fn cap(buf: &[u8], cap: u32) -> Option<Vec<u8>> {
    let mut raw = buf;
    let packets = rtcp::packet::unmarshal(&mut raw).ok()?;

    let mut changed = false;
    let rebuilt: Vec<Box<dyn Packet + Send + Sync>> = packets
        .into_iter()
        .map(|packet| {
            if let Some(remb) = packet
                .as_any()
                .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
                && remb.bitrate > cap as f32
            {
                changed = true;
                let mut capped = remb.clone();
                capped.bitrate = cap as f32;
                return Box::new(capped) as Box<dyn Packet + Send + Sync>;
            }
            packet
        })
        .collect();

    if !changed {
        return None;
    }
    rtcp::packet::marshal(&rebuilt).ok().map(|bytes| bytes.to_vec())
}
