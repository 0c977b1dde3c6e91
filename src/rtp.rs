// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::ops::Range;

use bytes::{Buf, Bytes};

use crate::PacketContext;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// Raw packet without state-specific interpretation or metadata.
///
/// Primarily validates a raw buffer then provides accessors for it,
/// keeping around the payload range determined during validation.
pub(crate) struct RawPacket(pub(crate) Bytes);

impl RawPacket {
    /// Validates an RTP packet, returning a wrapper and the payload range.
    pub(crate) fn new(data: Bytes) -> Result<(Self, Range<u16>), RawPacketError> {
        // RTP doesn't have a defined maximum size but it's implied by the transport:
        // * UDP packets (even with fragmentation) are at most 65,536 (minus IP/UDP headers).
        // * interleaved RTSP data messages have at most 65,536 bytes of data.
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => {
                return Err(RawPacketError {
                    reason: "too long",
                    data,
                })
            }
        };
        if len < MIN_HEADER_LEN {
            return Err(RawPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(RawPacketError {
                reason: "must be version 2",
                data,
            });
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = data[0] & 0b0000_1111;
        let csrc_end = MIN_HEADER_LEN + (4 * u16::from(csrc_count));
        let payload_start = if has_extension {
            if data.len() < usize::from(csrc_end + 4) {
                return Err(RawPacketError {
                    reason: "extension is after end of packet",
                    data,
                });
            }
            let extension_words = u16::from_be_bytes([
                data[usize::from(csrc_end) + 2],
                data[usize::from(csrc_end) + 3],
            ]);
            match extension_words
                .checked_mul(4)
                .and_then(|l| l.checked_add(4))
                .and_then(|l| csrc_end.checked_add(l))
            {
                Some(s) => s,
                None => {
                    return Err(RawPacketError {
                        reason: "extension extends beyond maximum packet size",
                        data,
                    })
                }
            }
        } else {
            csrc_end
        };
        if len < payload_start {
            return Err(RawPacketError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        let payload_end = if has_padding {
            if len == payload_start {
                return Err(RawPacketError {
                    reason: "missing padding",
                    data,
                });
            }
            let padding_len = u16::from(data[data.len() - 1]);
            if padding_len == 0 {
                return Err(RawPacketError {
                    reason: "invalid padding length 0",
                    data,
                });
            }
            match len.checked_sub(padding_len) {
                Some(e) if e >= payload_start => e,
                _ => {
                    return Err(RawPacketError {
                        reason: "padding larger than payload",
                        data,
                    })
                }
            }
        } else {
            len
        };
        Ok((Self(data), payload_start..payload_end))
    }

    #[inline]
    pub(crate) fn mark(&self) -> bool {
        (self.0[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub(crate) fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub(crate) fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    #[inline]
    pub(crate) fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    #[inline]
    pub(crate) fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }
}

#[derive(Debug)]
#[doc(hidden)]
pub struct RawPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

pub(crate) struct RawPacketBuilder {
    pub(crate) sequence_number: u16,
    pub(crate) timestamp: u32,
    pub(crate) payload_type: u8,
    pub(crate) ssrc: u32,
    pub(crate) mark: bool,
}

impl RawPacketBuilder {
    pub(crate) fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<(RawPacket, Range<u16>), &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        let len = u16::try_from(data.len()).map_err(|_| "payload too long")?;
        Ok((RawPacket(data), MIN_HEADER_LEN..len))
    }
}

/// Serializes an empty version-2 RTP packet, used to punch NAT/firewall
/// state toward the server's advertised ports before `PLAY`.
pub(crate) fn empty_packet() -> Bytes {
    let (raw, _) = RawPacketBuilder {
        sequence_number: 0,
        timestamp: 0,
        payload_type: 0,
        ssrc: 0,
        mark: false,
    }
    .build(std::iter::empty())
    .expect("empty packet is always valid");
    raw.0
}

/// A received, validated RTP packet.
pub struct ReceivedPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) track_id: usize,
    pub(crate) raw: RawPacket,
    pub(crate) payload_range: Range<u16>,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("ctx", &self.ctx)
            .field("track_id", &self.track_id)
            .field("timestamp", &self.raw.timestamp())
            .field("ssrc", &self.raw.ssrc())
            .field("sequence_number", &self.raw.sequence_number())
            .field("mark", &self.raw.mark())
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

impl ReceivedPacket {
    /// Validates `data` as an RTP packet received on `track_id`.
    pub(crate) fn parse(
        ctx: PacketContext,
        track_id: usize,
        data: Bytes,
    ) -> Result<Self, RawPacketError> {
        let (raw, payload_range) = RawPacket::new(data)?;
        Ok(Self {
            ctx,
            track_id,
            raw,
            payload_range,
        })
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn track_id(&self) -> usize {
        self.track_id
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.raw.mark()
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.raw.ssrc()
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.raw.sequence_number()
    }

    /// Returns the raw 32-bit RTP timestamp from the packet header.
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.raw.timestamp()
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.raw.payload_type()
    }

    /// Returns the raw bytes, including the RTP headers.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw.0[..]
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw.0[usize::from(self.payload_range.start)..usize::from(self.payload_range.end)]
    }

    /// Consumes the `ReceivedPacket` and returns the payload as a [`Bytes`].
    ///
    /// This is currently very efficient (no copying or reference-counting),
    /// although that is not an API guarantee.
    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        let mut data = self.raw.0;
        data.truncate(usize::from(self.payload_range.end));
        data.advance(usize::from(self.payload_range.start));
        data
    }
}

/// Testing API.
#[doc(hidden)]
pub struct ReceivedPacketBuilder {
    pub ctx: PacketContext,
    pub track_id: usize,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl ReceivedPacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<ReceivedPacket, &'static str> {
        let (raw, payload_range) = RawPacketBuilder {
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark: self.mark,
        }
        .build(payload)?;
        Ok(ReceivedPacket {
            ctx: self.ctx,
            track_id: self.track_id,
            raw,
            payload_range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacketContext;

    #[test]
    fn parse_minimal() {
        let pkt = ReceivedPacket::parse(
            PacketContext::dummy(),
            0,
            Bytes::from_static(&[
                0x80, 0x60, 0x01, 0x02, // v=2, pt=96, seq=0x0102
                0x00, 0x00, 0x30, 0x39, // timestamp=12345
                0xde, 0xad, 0xbe, 0xef, // ssrc
                0x01, 0x02, 0x03, // payload
            ]),
        )
        .unwrap();
        assert_eq!(pkt.sequence_number(), 0x0102);
        assert_eq!(pkt.timestamp(), 12345);
        assert_eq!(pkt.ssrc(), 0xdead_beef);
        assert_eq!(pkt.payload_type(), 96);
        assert!(!pkt.mark());
        assert_eq!(pkt.payload(), &[1, 2, 3]);
    }

    #[test]
    fn parse_padding() {
        // 2 payload bytes, 2 padding bytes (final byte gives padding length).
        let pkt = ReceivedPacket::parse(
            PacketContext::dummy(),
            0,
            Bytes::from_static(&[
                0xa0, 0xe0, 0x00, 0x01, // v=2, padding, pt=96, mark
                0x00, 0x00, 0x00, 0x01, //
                0x00, 0x00, 0x00, 0x02, //
                0x01, 0x02, 0x00, 0x02, // payload + padding
            ]),
        )
        .unwrap();
        assert!(pkt.mark());
        assert_eq!(pkt.payload(), &[1, 2]);
    }

    #[test]
    fn reject_garbage() {
        for raw in [
            &b""[..],
            &b"\x80\x60\x00\x01\x00\x00\x00\x01"[..], // truncated header
            &b"\x40\x60\x00\x01\x00\x00\x00\x01\x00\x00\x00\x02\x01"[..], // version 1
        ] {
            ReceivedPacket::parse(PacketContext::dummy(), 0, Bytes::copy_from_slice(raw))
                .unwrap_err();
        }
    }

    #[test]
    fn empty_packet_is_parseable() {
        let pkt = ReceivedPacket::parse(PacketContext::dummy(), 0, empty_packet()).unwrap();
        assert_eq!(pkt.payload(), b"");
    }
}
