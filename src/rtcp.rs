// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTCP data as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6):
//! validation of received compound packets and construction of the periodic
//! receiver reports (play) and sender reports (record) the client emits.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::PacketContext;

/// A received RTCP compound packet.
///
/// The contents have been validated at least as specified in [RFC 3550
/// appendix A.2](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.2),
/// updated by [RFC 5506](https://datatracker.ietf.org/doc/html/rfc5506):
///
/// *   There is at least one RTCP packet within the compound packet.
/// *   All packets are RTCP version 2.
/// *   Non-final packets have no padding.
/// *   The packets' lengths add up to the compound packet's length.
pub struct ReceivedCompoundPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) track_id: usize,
    pub(crate) raw: Bytes,
}

impl ReceivedCompoundPacket {
    /// For tests.
    #[doc(hidden)]
    pub fn dummy(data: &[u8]) -> Self {
        Self {
            ctx: PacketContext::dummy(),
            track_id: 0,
            raw: Bytes::copy_from_slice(data),
        }
    }

    /// Validates the supplied compound packet.
    pub(crate) fn validate(raw: &[u8]) -> Result<(), String> {
        let (mut pkt, mut rest) = PacketRef::parse(raw)?;
        loop {
            if rest.is_empty() {
                break;
            } else if pkt.has_padding() {
                return Err("padding on non-final packet within RTCP compound packet".to_owned());
            }
            (pkt, rest) = PacketRef::parse(rest)?;
        }
        Ok(())
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn track_id(&self) -> usize {
        self.track_id
    }

    /// Returns the full raw compound packet, including headers of all packets.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw[..]
    }

    /// Returns an iterator through all contained packets.
    #[inline]
    pub fn pkts(&self) -> impl Iterator<Item = PacketRef<'_>> {
        CompoundPacketIterator(&self.raw[..])
    }
}

impl std::fmt::Debug for ReceivedCompoundPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedCompoundPacket")
            .field("ctx", &self.ctx)
            .field("track_id", &self.track_id)
            .field("raw", &crate::hex::LimitedHex::new(&self.raw[..], 64))
            .finish()
    }
}

/// Internal type returned from [`ReceivedCompoundPacket::pkts`].
struct CompoundPacketIterator<'a>(&'a [u8]);

impl<'a> Iterator for CompoundPacketIterator<'a> {
    type Item = PacketRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.is_empty() {
            return None;
        }

        let (pkt, rest) =
            PacketRef::parse(self.0).expect("failed to parse previously validated packet");
        self.0 = rest;
        Some(pkt)
    }
}

/// A payload type-specific accessor for a packet.
#[non_exhaustive]
pub enum TypedPacketRef<'a> {
    SenderReport(SenderReportRef<'a>),
    ReceiverReport(ReceiverReportRef<'a>),
}

/// A sender report, as defined in
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
pub struct SenderReportRef<'a>(PacketRef<'a>);

impl<'a> SenderReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        let count = usize::from(pkt.count());
        const HEADER_LEN: usize = 8;
        const SENDER_INFO_LEN: usize = 20;
        const REPORT_BLOCK_LEN: usize = 24;
        let expected_len = HEADER_LEN + SENDER_INFO_LEN + (count * REPORT_BLOCK_LEN);
        if pkt.payload_end < expected_len {
            return Err(format!(
                "RTCP SR has invalid count={} with unpadded_byte_len={}",
                count, pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[4..8].try_into().unwrap())
    }

    pub fn ntp_timestamp(&self) -> crate::NtpTimestamp {
        crate::NtpTimestamp(u64::from_be_bytes(self.0.buf[8..16].try_into().unwrap()))
    }

    pub fn rtp_timestamp(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[16..20].try_into().unwrap())
    }
}

impl<'a> std::ops::Deref for SenderReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A receiver report, as defined in
/// [RFC 3550 section 6.4.2](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.2).
pub struct ReceiverReportRef<'a>(PacketRef<'a>);

impl<'a> ReceiverReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        let count = usize::from(pkt.count());
        const HEADER_LEN: usize = 8;
        const REPORT_BLOCK_LEN: usize = 24;
        let expected_len = HEADER_LEN + (count * REPORT_BLOCK_LEN);
        if pkt.payload_end < expected_len {
            return Err(format!(
                "RTCP RR has invalid count={} with unpadded_byte_len={}",
                count, pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[4..8].try_into().unwrap())
    }
}

impl<'a> std::ops::Deref for ReceiverReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A generic packet, not parsed as any particular payload type.
///
/// This only interprets the leading four bytes (version, padding, count,
/// payload type, length).
#[derive(Copy, Clone)]
pub struct PacketRef<'a> {
    buf: &'a [u8],
    payload_end: usize,
}

const COMMON_HEADER_LEN: usize = 4;

impl<'a> PacketRef<'a> {
    /// Parses a buffer into this packet and rest, doing only basic validation
    /// of the version, padding, and length.
    pub fn parse(buf: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(format!(
                "RTCP packets must be at least {} bytes; have only {}",
                COMMON_HEADER_LEN,
                buf.len()
            ));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packets must be version 2; got {ver}"));
        }

        // raw_len is "The length of this RTCP packet in 32-bit words minus one,
        // including the header and any padding."
        let raw_len = (u16::from(buf[2]) << 8) | u16::from(buf[3]);
        let len = (usize::from(raw_len) + 1) * 4;
        if buf.len() < len {
            return Err(format!(
                "RTCP packet header has length {} bytes; have only {}",
                len,
                buf.len()
            ));
        }
        let (this, rest) = buf.split_at(len);
        let padding_bit = this[0] & 0b0010_0000;
        if padding_bit != 0 {
            if raw_len == 0 {
                return Err("RTCP packet has invalid combination of padding and len=0".to_owned());
            }
            let padding_bytes = usize::from(this[len - 1]);
            if padding_bytes == 0 || padding_bytes > len - COMMON_HEADER_LEN {
                return Err(format!(
                    "RTCP packet of len {len} states invalid {padding_bytes} padding bytes"
                ));
            }
            Ok((
                PacketRef {
                    buf: this,
                    payload_end: len - padding_bytes,
                },
                rest,
            ))
        } else {
            Ok((
                PacketRef {
                    buf: this,
                    payload_end: len,
                },
                rest,
            ))
        }
    }

    /// Returns the uninterpreted payload type of this RTCP packet.
    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.buf[1]
    }

    /// Parses to a `TypedPacketRef` if the payload type is supported.
    pub fn as_typed(self) -> Result<Option<TypedPacketRef<'a>>, String> {
        match self.payload_type() {
            200 => Ok(Some(TypedPacketRef::SenderReport(
                SenderReportRef::validate(self)?,
            ))),
            201 => Ok(Some(TypedPacketRef::ReceiverReport(
                ReceiverReportRef::validate(self)?,
            ))),
            _ => Ok(None),
        }
    }

    /// Parses as a sender report, if the type matches.
    pub fn as_sender_report(self) -> Result<Option<SenderReportRef<'a>>, String> {
        if self.payload_type() == 200 {
            return Ok(Some(SenderReportRef::validate(self)?));
        }
        Ok(None)
    }

    /// Returns true iff this packet has padding.
    #[inline]
    pub fn has_padding(&self) -> bool {
        (self.buf[0] & 0b0010_0000) != 0
    }

    /// Returns the low 5 bits of the first octet, which is typically a count
    /// or subtype.
    #[inline]
    pub fn count(&self) -> u8 {
        self.buf[0] & 0b0001_1111
    }

    /// Returns the full raw data, including headers.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        self.buf
    }
}

/// Serializes an empty receiver report (RC=0), used to punch NAT/firewall
/// state toward the server's RTCP port before `PLAY`.
pub(crate) fn empty_receiver_report() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(2 << 6); // version 2, no padding, RC=0
    buf.put_u8(201);
    buf.put_u16(1); // length in words minus one
    buf.put_u32(0); // sender SSRC
    buf.freeze()
}

/// Accumulates statistics on a track's inbound RTP packets and builds
/// periodic receiver reports from them (play mode, UDP transport).
///
/// Writers are the UDP socket reader task; the control loop locks the state
/// on each report period and sends the serialized report through the
/// client's write queue.
pub(crate) struct ReceiverReportState {
    clock_rate: u32,
    local_ssrc: u32,

    /// SSRC of the remote sender, learned from its first packet.
    remote_ssrc: Option<u32>,

    /// Extended highest sequence number seen (cycles << 16 | seq).
    ext_highest_seq: u32,
    base_seq: u32,
    received: u32,

    /// Receive count and expected count as of the previous report, for the
    /// fraction-lost field.
    received_prior: u32,
    expected_prior: u32,

    /// Interarrival jitter estimate in clock-rate units (RFC 3550 A.8).
    jitter: f64,
    last_transit: Option<f64>,

    /// Middle 32 bits of the last sender report's NTP timestamp and when it
    /// arrived, for the LSR/DLSR fields.
    last_sr: Option<(u32, Instant)>,

    epoch: Instant,
}

impl ReceiverReportState {
    pub(crate) fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            local_ssrc: rand::random(),
            remote_ssrc: None,
            ext_highest_seq: 0,
            base_seq: 0,
            received: 0,
            received_prior: 0,
            expected_prior: 0,
            jitter: 0.0,
            last_transit: None,
            last_sr: None,
            epoch: Instant::now(),
        }
    }

    pub(crate) fn observe_rtp(&mut self, ssrc: u32, seq: u16, timestamp: u32, arrival: Instant) {
        if self.remote_ssrc.is_none() {
            self.remote_ssrc = Some(ssrc);
            self.ext_highest_seq = u32::from(seq);
            self.base_seq = u32::from(seq);
        } else {
            let prev = (self.ext_highest_seq & 0xFFFF) as u16;
            let delta = seq.wrapping_sub(prev);
            if delta < 0x8000 {
                // Forward movement, possibly wrapping a cycle.
                let cycles = self.ext_highest_seq & 0xFFFF_0000;
                let new = if seq < prev {
                    cycles.wrapping_add(0x1_0000) | u32::from(seq)
                } else {
                    cycles | u32::from(seq)
                };
                self.ext_highest_seq = new;
            }
        }
        self.received = self.received.wrapping_add(1);

        if self.clock_rate > 0 {
            let arrival_rtp =
                arrival.duration_since(self.epoch).as_secs_f64() * f64::from(self.clock_rate);
            let transit = arrival_rtp - f64::from(timestamp);
            if let Some(last) = self.last_transit {
                let d = (transit - last).abs();
                self.jitter += (d - self.jitter) / 16.0;
            }
            self.last_transit = Some(transit);
        }
    }

    pub(crate) fn observe_sender_report(&mut self, ntp: crate::NtpTimestamp, arrival: Instant) {
        self.last_sr = Some(((ntp.0 >> 16) as u32, arrival));
    }

    /// Builds a receiver report, or `None` if no RTP packet has been seen yet.
    pub(crate) fn build(&mut self, now: Instant) -> Option<Bytes> {
        let remote_ssrc = self.remote_ssrc?;

        let expected = self.ext_highest_seq.wrapping_sub(self.base_seq).wrapping_add(1);
        let lost = expected.saturating_sub(self.received).min(0x7F_FFFF);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let (lsr, dlsr) = match self.last_sr {
            Some((lsr, at)) => {
                let delay = now.saturating_duration_since(at).as_secs_f64();
                (lsr, (delay * 65_536.0) as u32)
            }
            None => (0, 0),
        };

        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(2 << 6 | 1); // version 2, no padding, RC=1
        buf.put_u8(201);
        buf.put_u16(7); // length in words minus one
        buf.put_u32(self.local_ssrc);
        buf.put_u32(remote_ssrc);
        buf.put_u32(u32::from(fraction) << 24 | lost);
        buf.put_u32(self.ext_highest_seq);
        buf.put_u32(self.jitter as u32);
        buf.put_u32(lsr);
        buf.put_u32(dlsr);
        Some(buf.freeze())
    }
}

/// Accumulates statistics on a track's outbound RTP packets and builds
/// periodic sender reports from them (record mode, UDP transport).
///
/// Writers are the threads calling `write_packet_rtp`; the control loop
/// locks the state on each report period.
pub(crate) struct SenderReportState {
    clock_rate: u32,
    ssrc: Option<u32>,
    packet_count: u32,
    octet_count: u32,

    /// RTP timestamp and send time of the last packet whose PTS equals its
    /// DTS; the report's RTP timestamp is extrapolated from this pair.
    last_rtp_time: Option<(u32, Instant)>,
}

impl SenderReportState {
    pub(crate) fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            ssrc: None,
            packet_count: 0,
            octet_count: 0,
            last_rtp_time: None,
        }
    }

    pub(crate) fn observe_rtp(
        &mut self,
        ssrc: u32,
        timestamp: u32,
        payload_len: usize,
        pts_equals_dts: bool,
        now: Instant,
    ) {
        self.ssrc = Some(ssrc);
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);
        if pts_equals_dts {
            self.last_rtp_time = Some((timestamp, now));
        }
    }

    /// Builds a sender report, or `None` if no RTP packet has been sent yet.
    pub(crate) fn build(&mut self, now: Instant) -> Option<Bytes> {
        let ssrc = self.ssrc?;
        let (last_ts, last_at) = self.last_rtp_time?;
        let elapsed = now.saturating_duration_since(last_at).as_secs_f64();
        let rtp_time = last_ts.wrapping_add((elapsed * f64::from(self.clock_rate)) as u32);

        let mut buf = BytesMut::with_capacity(28);
        buf.put_u8(2 << 6); // version 2, no padding, RC=0
        buf.put_u8(200);
        buf.put_u16(6); // length in words minus one
        buf.put_u32(ssrc);
        buf.put_u64(crate::NtpTimestamp::now().0);
        buf.put_u32(rtp_time);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dahua() {
        // Sender report and source description from a Dahua camera.
        let buf = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2f\x4c\x34\x1d\
                    \x81\xca\x00\x04\x66\x42\x6a\xe1\
                    \x01\x06\x28\x6e\x6f\x6e\x65\x29\
                    \x00\x00\x00\x00";
        ReceivedCompoundPacket::validate(buf).unwrap();
        let (pkt, buf) = PacketRef::parse(buf).unwrap();
        let sr = pkt.as_sender_report().unwrap().unwrap();
        assert_eq!(sr.ntp_timestamp(), crate::NtpTimestamp(0xe4362f99cccccccc));
        assert_eq!(sr.rtp_timestamp(), 0x852ef807);
        assert_eq!(sr.ssrc(), 0x66426ae1);
        let (pkt, buf) = PacketRef::parse(buf).unwrap();
        assert_eq!(pkt.payload_type(), 202);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn padding() {
        let buf = b"\xa7\x00\x00\x02asdf\x00\x00\x00\x04rest";
        let (pkt, rest) = PacketRef::parse(buf).unwrap();
        assert_eq!(pkt.count(), 7);
        assert_eq!(&pkt.buf[4..pkt.payload_end], b"asdf");
        assert_eq!(b"rest", rest);
    }

    #[test]
    fn padding_on_non_final_packet() {
        let buf = b"\xa0\xc9\x00\x01\x00\x00\x00\x04\
                    \x80\xc9\x00\x01\x00\x00\x00\x00";
        ReceivedCompoundPacket::validate(buf).unwrap_err();
    }

    #[test]
    fn receiver_report_roundtrip() {
        let mut state = ReceiverReportState::new(90_000);
        let epoch = Instant::now();
        assert!(state.build(epoch).is_none());
        for i in 0..10u16 {
            state.observe_rtp(0xabcd_0123, 100 + i, 3000 * u32::from(i), epoch);
        }
        let report = state.build(epoch).unwrap();
        ReceivedCompoundPacket::validate(&report).unwrap();
        let (pkt, rest) = PacketRef::parse(&report).unwrap();
        assert!(rest.is_empty());
        match pkt.as_typed().unwrap().unwrap() {
            TypedPacketRef::ReceiverReport(rr) => {
                assert_eq!(rr.count(), 1);
                // First report block's SSRC is the remote sender.
                assert_eq!(
                    u32::from_be_bytes(rr.raw()[8..12].try_into().unwrap()),
                    0xabcd_0123
                );
                // Extended highest sequence number.
                assert_eq!(
                    u32::from_be_bytes(rr.raw()[16..20].try_into().unwrap()),
                    109
                );
            }
            _ => panic!("expected receiver report"),
        }
    }

    #[test]
    fn receiver_report_counts_loss() {
        let mut state = ReceiverReportState::new(90_000);
        let epoch = Instant::now();
        state.observe_rtp(1, 100, 0, epoch);
        state.observe_rtp(1, 101, 3000, epoch);
        state.observe_rtp(1, 105, 15000, epoch); // 102-104 lost
        let report = state.build(epoch).unwrap();
        let lost = u32::from_be_bytes(report[12..16].try_into().unwrap()) & 0xFF_FFFF;
        assert_eq!(lost, 3);
    }

    #[test]
    fn sender_report_roundtrip() {
        let mut state = SenderReportState::new(90_000);
        let now = Instant::now();
        assert!(state.build(now).is_none());
        state.observe_rtp(0x1234_5678, 1000, 100, true, now);
        state.observe_rtp(0x1234_5678, 1000, 50, false, now);
        let report = state.build(now).unwrap();
        ReceivedCompoundPacket::validate(&report).unwrap();
        let (pkt, _) = PacketRef::parse(&report).unwrap();
        let sr = pkt.as_sender_report().unwrap().unwrap();
        assert_eq!(sr.ssrc(), 0x1234_5678);
        assert_eq!(sr.rtp_timestamp(), 1000);
        // packet count, octet count
        assert_eq!(u32::from_be_bytes(report[20..24].try_into().unwrap()), 2);
        assert_eq!(u32::from_be_bytes(report[24..28].try_into().unwrap()), 150);
    }

    #[test]
    fn empty_receiver_report_is_valid() {
        ReceivedCompoundPacket::validate(&empty_receiver_report()).unwrap();
    }
}
