// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track cleaning of inbound RTP payloads.
//!
//! H.264 tracks get RFC 6184 depacketization (STAP-A splitting and FU-A
//! reassembly) so callbacks see whole NAL units; all other tracks pass
//! through untouched.

use std::time::Duration;

use bytes::Bytes;

use crate::rtp::ReceivedPacket;

pub(crate) mod h264;

/// A received RTP packet after cleaning.
pub struct CleanedPacket {
    /// The packet that completed this output.
    pub packet: ReceivedPacket,

    /// Whether the presentation timestamp of this packet is known to equal
    /// its decode timestamp. True for non-H.264 tracks; for H.264, true
    /// when the reassembled unit contains an IDR slice.
    pub pts_equals_dts: bool,

    /// Reassembled NAL units, including their header byte. Empty for
    /// non-H.264 tracks.
    pub nalus: Vec<Bytes>,

    /// Presentation time since the first packet of the stream, derived from
    /// the RTP timestamp at the track's clock rate.
    pub pts: Duration,
}

impl std::fmt::Debug for CleanedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanedPacket")
            .field("packet", &self.packet)
            .field("pts_equals_dts", &self.pts_equals_dts)
            .field("nalus", &self.nalus.len())
            .field("pts", &self.pts)
            .finish()
    }
}

/// Converts 32-bit RTP timestamps to elapsed time since the first packet,
/// extending through wraparound. Differences of more than `i32::MAX` clock
/// units are treated as backwards jumps; elapsed time saturates at zero.
pub(crate) struct PtsDecoder {
    clock_rate: u32,
    state: Option<(u32, i64)>,
}

impl PtsDecoder {
    pub(crate) fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            state: None,
        }
    }

    pub(crate) fn decode(&mut self, timestamp: u32) -> Duration {
        let (prev, total) = match self.state {
            None => {
                self.state = Some((timestamp, 0));
                return Duration::ZERO;
            }
            Some(s) => s,
        };
        let delta = i64::from(timestamp.wrapping_sub(prev) as i32);
        let total = total + delta;
        self.state = Some((timestamp, total));
        if total <= 0 || self.clock_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((total as u64).saturating_mul(1_000_000_000) / u64::from(self.clock_rate))
    }
}

/// Per-track inbound RTP cleaner.
pub(crate) enum Cleaner {
    H264(h264::Depacketizer),
    PassThrough(PtsDecoder),
}

impl Cleaner {
    pub(crate) fn new(is_h264: bool, clock_rate: u32) -> Self {
        if is_h264 {
            Cleaner::H264(h264::Depacketizer::new(clock_rate))
        } else {
            Cleaner::PassThrough(PtsDecoder::new(clock_rate))
        }
    }

    /// Processes one inbound packet, yielding a cleaned packet when output
    /// is complete. H.264 packets carrying only the middle of a fragmented
    /// NAL unit are consumed without output.
    pub(crate) fn process(&mut self, pkt: ReceivedPacket) -> Result<Option<CleanedPacket>, String> {
        match self {
            Cleaner::H264(d) => d.process(pkt),
            Cleaner::PassThrough(pts) => {
                let pts = pts.decode(pkt.timestamp());
                Ok(Some(CleanedPacket {
                    packet: pkt,
                    pts_equals_dts: true,
                    nalus: Vec::new(),
                    pts,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;

    fn pkt(timestamp: u32) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            track_id: 0,
            sequence_number: 1,
            timestamp,
            payload_type: 96,
            ssrc: 1,
            mark: true,
        }
        .build([1, 2, 3])
        .unwrap()
    }

    #[test]
    fn pts_decoder_wraparound() {
        let mut d = PtsDecoder::new(90_000);
        let first = u32::MAX - 89_999;
        assert_eq!(d.decode(first), Duration::ZERO);
        // One second later the timestamp has wrapped through zero.
        assert_eq!(d.decode(first.wrapping_add(90_000)), Duration::from_secs(1));
        assert_eq!(d.decode(first.wrapping_add(180_000)), Duration::from_secs(2));
    }

    #[test]
    fn pts_decoder_backwards_saturates() {
        let mut d = PtsDecoder::new(90_000);
        assert_eq!(d.decode(180_000), Duration::ZERO);
        assert_eq!(d.decode(90_000), Duration::ZERO);
        assert_eq!(d.decode(270_000), Duration::from_secs(1));
    }

    #[test]
    fn passthrough() {
        let mut c = Cleaner::new(false, 8_000);
        let out = c.process(pkt(0)).unwrap().unwrap();
        assert!(out.pts_equals_dts);
        assert!(out.nalus.is_empty());
        let out = c.process(pkt(8_000)).unwrap().unwrap();
        assert_eq!(out.pts, Duration::from_secs(1));
    }
}
