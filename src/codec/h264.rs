// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use h264_reader::nal::{NalHeader, UnitType};
use log::debug;

use crate::rtp::ReceivedPacket;

use super::{CleanedPacket, PtsDecoder};

/// Reassembles NAL units from H.264 RTP packets as specified in
/// [RFC 6184](https://tools.ietf.org/html/rfc6184): single NAL unit
/// packets, STAP-A aggregates, and FU-A fragments.
///
/// This doesn't inspect the contents of the NAL units beyond their headers,
/// so it doesn't depend on or verify compliance with H.264 section 7.4.1.2.3
/// "Order of NAL units and coded pictures and association to access units".
///
/// Interior packet loss drops the partial fragment and resynchronizes at
/// the next unit start rather than failing the stream; servers drop packets
/// internally even on TCP.
pub(crate) struct Depacketizer {
    pts: PtsDecoder,

    /// An in-progress FU-A: the reconstructed NAL header and the pieces
    /// accumulated so far (header byte included in the first piece).
    frag: Option<Frag>,
}

struct Frag {
    hdr: NalHeader,
    buf: BytesMut,
}

impl Depacketizer {
    pub(crate) fn new(clock_rate: u32) -> Self {
        Self {
            pts: PtsDecoder::new(clock_rate),
            frag: None,
        }
    }

    pub(crate) fn process(
        &mut self,
        pkt: ReceivedPacket,
    ) -> Result<Option<CleanedPacket>, String> {
        let seq = pkt.sequence_number();
        let mut data = Bytes::copy_from_slice(pkt.payload());
        if data.is_empty() {
            return Err(format!("empty NAL at RTP seq {seq:04x}"));
        }
        // https://tools.ietf.org/html/rfc6184#section-5.2
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header has F bit set at seq {seq:04x}"));
        }

        let mut nalus = Vec::new();
        match nal_header & 0b11111 {
            1..=23 => {
                if self.frag.take().is_some() {
                    debug!("discarding incomplete FU-A at seq {seq:04x}");
                }
                nalus.push(data);
            }
            24 => {
                // STAP-A. https://tools.ietf.org/html/rfc6184#section-5.7.1
                if self.frag.take().is_some() {
                    debug!("discarding incomplete FU-A at seq {seq:04x}");
                }
                data.advance(1);
                while data.has_remaining() {
                    if data.remaining() < 2 {
                        return Err(format!(
                            "STAP-A has {} remaining bytes while expecting 2-byte length",
                            data.remaining()
                        ));
                    }
                    let len = usize::from(data.get_u16());
                    if len == 0 {
                        return Err("zero length in STAP-A".to_owned());
                    }
                    if data.remaining() < len {
                        return Err(format!(
                            "STAP-A too short: {} bytes remaining, expecting {len}-byte NAL",
                            data.remaining()
                        ));
                    }
                    NalHeader::new(data[0])
                        .map_err(|_| "bad NAL header in STAP-A".to_owned())?;
                    nalus.push(data.split_to(len));
                }
            }
            25..=27 | 29 => {
                return Err(format!(
                    "unimplemented NAL (header 0x{nal_header:02x}) at seq {seq:04x}"
                ))
            }
            28 => {
                // FU-A. https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 3 {
                    return Err(format!("FU-A is too short at seq {seq:04x}"));
                }
                let fu_header = data[1];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let reserved = (fu_header & 0b0010_0000) != 0;
                if (start && end) || reserved {
                    return Err(format!(
                        "invalid FU-A header {fu_header:08b} at seq {seq:04x}"
                    ));
                }
                let hdr = NalHeader::new((nal_header & 0b0110_0000) | (fu_header & 0b0001_1111))
                    .expect("NalHeader with F bit clear is valid");
                data.advance(2);
                match (start, self.frag.as_mut()) {
                    (true, frag) => {
                        if frag.is_some() {
                            debug!("discarding incomplete FU-A at seq {seq:04x}");
                        }
                        let mut buf = BytesMut::with_capacity(1 + data.len());
                        buf.put_u8(hdr.into());
                        buf.put_slice(&data);
                        self.frag = Some(Frag { hdr, buf });
                    }
                    (false, Some(frag)) => {
                        if u8::from(frag.hdr) != u8::from(hdr) {
                            let (was, now) = (frag.hdr, hdr);
                            self.frag = None;
                            return Err(format!(
                                "FU-A has inconsistent NAL type: {was:?} then {now:?} at seq {seq:04x}"
                            ));
                        }
                        frag.buf.put_slice(&data);
                        if end {
                            let frag = self.frag.take().expect("frag is present");
                            nalus.push(frag.buf.freeze());
                        }
                    }
                    (false, None) => {
                        // Lost the start of this fragment; wait for the next unit.
                        debug!("FU-A without start while no fragment in progress at seq {seq:04x}");
                        return Ok(None);
                    }
                }
            }
            _ => return Err(format!("bad NAL header {nal_header:0x} at seq {seq:04x}")),
        }

        if nalus.is_empty() {
            return Ok(None);
        }
        let pts = self.pts.decode(pkt.timestamp());
        let pts_equals_dts = nalus.iter().any(|n| {
            NalHeader::new(n[0])
                .map(|h| h.nal_unit_type() == UnitType::SliceLayerWithoutPartitioningIdr)
                .unwrap_or(false)
        });
        Ok(Some(CleanedPacket {
            packet: pkt,
            pts_equals_dts,
            nalus,
            pts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;

    fn pkt(seq: u16, timestamp: u32, mark: bool, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            track_id: 0,
            sequence_number: seq,
            timestamp,
            payload_type: 96,
            ssrc: 0x1234,
            mark,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn single_nal() {
        let mut d = Depacketizer::new(90_000);
        let out = d
            .process(pkt(1, 0, true, &[0x65, 0xaa, 0xbb]))
            .unwrap()
            .unwrap();
        assert_eq!(out.nalus.len(), 1);
        assert_eq!(&out.nalus[0][..], &[0x65, 0xaa, 0xbb]);
        assert!(out.pts_equals_dts); // IDR slice
    }

    #[test]
    fn stap_a() {
        // Aggregation of SPS (0x67, 2 bytes) and PPS (0x68, 2 bytes).
        let mut d = Depacketizer::new(90_000);
        let out = d
            .process(pkt(
                1,
                0,
                true,
                &[0x18, 0x00, 0x02, 0x67, 0x42, 0x00, 0x02, 0x68, 0xce],
            ))
            .unwrap()
            .unwrap();
        assert_eq!(out.nalus.len(), 2);
        assert_eq!(&out.nalus[0][..], &[0x67, 0x42]);
        assert_eq!(&out.nalus[1][..], &[0x68, 0xce]);
        assert!(!out.pts_equals_dts);
    }

    #[test]
    fn fu_a_reassembly() {
        let mut d = Depacketizer::new(90_000);
        // FU indicator 0x7c (type 28), start fragment of an IDR (type 5).
        assert!(d
            .process(pkt(1, 0, false, &[0x7c, 0x85, 0x01, 0x02]))
            .unwrap()
            .is_none());
        assert!(d
            .process(pkt(2, 0, false, &[0x7c, 0x05, 0x03]))
            .unwrap()
            .is_none());
        let out = d
            .process(pkt(3, 0, true, &[0x7c, 0x45, 0x04]))
            .unwrap()
            .unwrap();
        assert_eq!(out.nalus.len(), 1);
        assert_eq!(&out.nalus[0][..], &[0x65, 0x01, 0x02, 0x03, 0x04]);
        assert!(out.pts_equals_dts);
    }

    #[test]
    fn fu_a_missing_start_resyncs() {
        let mut d = Depacketizer::new(90_000);
        // A middle fragment with no start in flight is dropped silently.
        assert!(d
            .process(pkt(5, 0, false, &[0x7c, 0x05, 0x03]))
            .unwrap()
            .is_none());
        // The next complete unit comes through.
        let out = d
            .process(pkt(6, 3000, true, &[0x61, 0xaa]))
            .unwrap()
            .unwrap();
        assert_eq!(out.nalus.len(), 1);
    }

    #[test]
    fn rejects_forbidden_bit() {
        let mut d = Depacketizer::new(90_000);
        d.process(pkt(1, 0, true, &[0xe5, 0x01])).unwrap_err();
    }
}
