// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP 1.0 client library.
//!
//! Supports reading media streams from a server (`DESCRIBE` + `SETUP` +
//! `PLAY`) and publishing media streams to a server (`ANNOUNCE` + `SETUP` +
//! `RECORD`), over UDP, UDP multicast, or TCP interleaved transport, with
//! automatic fallback from UDP to TCP when no packets arrive.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use bytes::Bytes;
use rtsp_types::Message;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

mod error;
mod hex;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub(crate) use {bail, wrap};

pub mod client;
pub mod codec;
mod queue;
pub mod rtcp;
pub mod rtp;

mod tokio;

#[cfg(test)]
mod testutil;

/// The maximum size of an RTP or RTCP packet this library will send or
/// accept, matching common camera firmware limits. Larger inbound packets
/// fail the stream; larger outbound packets are rejected at the sender.
pub const MAX_PACKET_SIZE: usize = 2048;

/// A received RTSP message.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) ctx: RtspMessageContext,
    pub(crate) msg: Message<Bytes>,
}

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp((2_208_988_800) << 32);

/// A wallclock time represented using the format of the Network Time Protocol.
///
/// NTP timestamps are in a fixed-point representation of seconds since
/// 0h UTC on 1 January 1900: the top 32 bits are the integer part, the
/// bottom 32 bits the fractional part. Used in outbound RTCP sender
/// reports; values received from the peer may be complete nonsense.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub(crate) fn now() -> Self {
        let now = chrono::Utc::now();
        let unix_sec = now.timestamp() as u64;
        let nanos = now.timestamp_subsec_nanos().min(999_999_999);
        let frac = ((f64::from(nanos) / 1e9) * f64::from(u32::MAX)).round() as u32;
        NtpTimestamp(UNIX_EPOCH.0.wrapping_add((unix_sec << 32) | u64::from(frac)))
    }
}

impl std::fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let since_epoch = self.0.wrapping_sub(UNIX_EPOCH.0);
        write!(f, "{}.{:08x}", since_epoch >> 32, since_epoch & 0xFFFF_FFFF)
    }
}

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// A wall time taken from the local machine's realtime clock, used in error reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }

    pub(crate) fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the application parsed the message. Caveat: this may not
    /// closely match the time on a packet capture if the application is
    /// overloaded (or if `CLOCK_REALTIME` jumps).
    received_wall: WallTime,
}

impl RtspMessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Context for an RTP or RTCP packet, received either via RTSP interleaved
/// data or UDP.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext(PacketContextInner);

impl PacketContext {
    #[doc(hidden)]
    pub fn dummy() -> PacketContext {
        Self(PacketContextInner::Dummy)
    }

    pub(crate) fn tcp(msg_ctx: RtspMessageContext) -> Self {
        Self(PacketContextInner::Tcp { msg_ctx })
    }

    pub(crate) fn udp(from: SocketAddr) -> Self {
        Self(PacketContextInner::Udp {
            from,
            received_wall: WallTime::now(),
        })
    }
}

#[derive(Copy, Clone, Debug)]
enum PacketContextInner {
    Tcp {
        msg_ctx: RtspMessageContext,
    },
    Udp {
        from: SocketAddr,
        received_wall: WallTime,
    },
    Dummy,
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            PacketContextInner::Udp {
                from,
                received_wall,
            } => write!(f, "{}@{}", from, received_wall),
            PacketContextInner::Tcp { msg_ctx } => Display::fmt(&msg_ctx, f),
            PacketContextInner::Dummy => write!(f, "dummy"),
        }
    }
}

pub(crate) fn to_u64(v: usize) -> u64 {
    u64::try_from(v).expect("usize fits in u64")
}

/// Returns the range within `buf` that represents `subset`.
/// If `subset` is empty, returns None; otherwise panics if `subset` is not within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_now_is_past_unix_epoch() {
        let now = NtpTimestamp::now();
        assert!(now > UNIX_EPOCH);
    }

    #[test]
    fn as_range_subsets() {
        let buf = [0u8; 16];
        assert_eq!(as_range(&buf, &buf[4..8]), Some(4..8));
        assert_eq!(as_range(&buf, &buf[0..0]), None);
    }
}
