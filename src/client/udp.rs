// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track UDP sockets: the RTP/RTCP pair, its reader tasks, and
//! liveness timestamps.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::codec::Cleaner;
use crate::rtcp::{ReceivedCompoundPacket, ReceiverReportState};
use crate::rtp::ReceivedPacket;
use crate::{PacketContext, MAX_PACKET_SIZE};

use super::{OnPacketRtcp, OnPacketRtp};

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One of a track's two UDP sockets.
///
/// `last_packet_time` is stamped by the reader task and read by the control
/// loop's stream-liveness timer; zero means no packet has arrived yet.
pub(crate) struct UdpEndpoint {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) last_packet_time: Arc<AtomicI64>,

    /// Where outbound packets go: the connection's peer at the server port
    /// (unicast) or the group address (multicast), learned from the `SETUP`
    /// response.
    pub(crate) peer: Option<SocketAddr>,

    /// Inbound packets from any other source are discarded. `None` accepts
    /// everything (multicast, or `any_port_enable`).
    pub(crate) expected_source: Option<SocketAddr>,
}

impl UdpEndpoint {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            last_packet_time: Arc::new(AtomicI64::new(0)),
            peer: None,
            expected_source: None,
        }
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Sends one datagram to the negotiated peer. A no-op until the `SETUP`
    /// response has provided one.
    pub(crate) async fn write(&self, payload: &[u8]) -> std::io::Result<()> {
        if let Some(peer) = self.peer {
            self.socket.send_to(payload, peer).await?;
        }
        Ok(())
    }
}

/// A track's RTP+RTCP socket pair, RTCP bound one above the (even) RTP port.
pub(crate) struct TrackSockets {
    pub(crate) rtp: UdpEndpoint,
    pub(crate) rtcp: UdpEndpoint,
}

impl TrackSockets {
    /// Binds a fresh even/odd pair on an ephemeral port.
    pub(crate) async fn bind_auto() -> std::io::Result<Self> {
        let pair = crate::tokio::UdpPair::for_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await?;
        Ok(Self {
            rtp: UdpEndpoint::new(pair.rtp_socket),
            rtcp: UdpEndpoint::new(pair.rtcp_socket),
        })
    }

    /// Binds the caller's chosen (already-validated) consecutive pair.
    pub(crate) async fn bind_exact(rtp_port: u16) -> std::io::Result<Self> {
        let pair =
            crate::tokio::UdpPair::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), rtp_port).await?;
        Ok(Self {
            rtp: UdpEndpoint::new(pair.rtp_socket),
            rtcp: UdpEndpoint::new(pair.rtcp_socket),
        })
    }

    /// Binds listeners for the multicast group and port pair from the
    /// server's `Transport` header and joins the group on both.
    pub(crate) async fn bind_multicast(
        destination: IpAddr,
        port: (u16, u16),
    ) -> std::io::Result<Self> {
        let rtp = bind_multicast_socket(destination, port.0).await?;
        let rtcp = bind_multicast_socket(destination, port.1).await?;
        Ok(Self {
            rtp: UdpEndpoint::new(rtp),
            rtcp: UdpEndpoint::new(rtcp),
        })
    }

    /// True if any packet at all has arrived on either socket.
    pub(crate) fn saw_packet(&self) -> bool {
        self.rtp.last_packet_time.load(Ordering::Relaxed) != 0
            || self.rtcp.last_packet_time.load(Ordering::Relaxed) != 0
    }

    /// Returns the most recent packet arrival on either socket, as unix
    /// seconds, or 0 if nothing has arrived.
    pub(crate) fn last_packet_time(&self) -> i64 {
        self.rtp
            .last_packet_time
            .load(Ordering::Relaxed)
            .max(self.rtcp.last_packet_time.load(Ordering::Relaxed))
    }
}

async fn bind_multicast_socket(group: IpAddr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = match group {
        IpAddr::V4(group) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
            socket
        }
        IpAddr::V6(group) => {
            let socket = UdpSocket::bind((std::net::Ipv6Addr::UNSPECIFIED, port)).await?;
            socket.join_multicast_v6(&group, 0)?;
            socket
        }
    };
    Ok(socket)
}

/// What a reader task does with each datagram, beyond stamping
/// `last_packet_time`.
pub(crate) enum UdpReader {
    /// Play mode, RTP socket: validate, clean, report, deliver.
    PlayRtp {
        track_id: usize,
        cleaner: Cleaner,
        receiver_report: Arc<Mutex<ReceiverReportState>>,
        on_packet_rtp: OnPacketRtp,
    },
    /// Play mode, RTCP socket: validate the compound packet, correlate
    /// sender reports, deliver each constituent packet.
    PlayRtcp {
        track_id: usize,
        receiver_report: Arc<Mutex<ReceiverReportState>>,
        on_packet_rtcp: OnPacketRtcp,
    },
    /// Record mode, RTP socket: nothing flows inward; keep NAT state fresh.
    RecordRtp,
    /// Record mode, RTCP socket: the server's receiver reports.
    RecordRtcp {
        track_id: usize,
        on_packet_rtcp: OnPacketRtcp,
    },
}

/// Reads datagrams until the socket errors or the task is aborted.
///
/// Malformed packets are dropped with a debug log rather than failing the
/// stream; UDP gives no ordering or integrity promises worth dying over.
pub(crate) async fn run_reader(
    socket: Arc<UdpSocket>,
    last_packet_time: Arc<AtomicI64>,
    expected_peer: Option<SocketAddr>,
    mut reader: UdpReader,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("UDP recv error: {e}");
                return;
            }
        };
        if let Some(expected) = expected_peer {
            if from != expected {
                debug!("ignoring datagram from unexpected source {from}");
                continue;
            }
        }
        if n > MAX_PACKET_SIZE {
            debug!("ignoring {n}-byte datagram over maximum packet size");
            continue;
        }
        last_packet_time.store(unix_now(), Ordering::Relaxed);

        let data = bytes::Bytes::copy_from_slice(&buf[..n]);
        match &mut reader {
            UdpReader::PlayRtp {
                track_id,
                cleaner,
                receiver_report,
                on_packet_rtp,
            } => {
                let pkt = match ReceivedPacket::parse(PacketContext::udp(from), *track_id, data) {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        debug!("ignoring bad RTP packet on track {track_id}: {}", e.reason);
                        continue;
                    }
                };
                receiver_report.lock().unwrap().observe_rtp(
                    pkt.ssrc(),
                    pkt.sequence_number(),
                    pkt.timestamp(),
                    std::time::Instant::now(),
                );
                match cleaner.process(pkt) {
                    Ok(Some(cleaned)) => on_packet_rtp(&cleaned),
                    Ok(None) => {}
                    Err(e) => debug!("ignoring uncleanable RTP packet on track {track_id}: {e}"),
                }
            }
            UdpReader::PlayRtcp {
                track_id,
                receiver_report,
                on_packet_rtcp,
            } => {
                if let Err(e) = ReceivedCompoundPacket::validate(&data) {
                    debug!("ignoring bad RTCP packet on track {track_id}: {e}");
                    continue;
                }
                let compound = ReceivedCompoundPacket {
                    ctx: PacketContext::udp(from),
                    track_id: *track_id,
                    raw: data,
                };
                for pkt in compound.pkts() {
                    if let Ok(Some(sr)) = pkt.as_sender_report() {
                        receiver_report
                            .lock()
                            .unwrap()
                            .observe_sender_report(sr.ntp_timestamp(), std::time::Instant::now());
                    }
                    on_packet_rtcp(*track_id, pkt);
                }
            }
            UdpReader::RecordRtp => {}
            UdpReader::RecordRtcp {
                track_id,
                on_packet_rtcp,
            } => {
                if let Err(e) = ReceivedCompoundPacket::validate(&data) {
                    debug!("ignoring bad RTCP packet on track {track_id}: {e}");
                    continue;
                }
                let compound = ReceivedCompoundPacket {
                    ctx: PacketContext::udp(from),
                    track_id: *track_id,
                    raw: data,
                };
                for pkt in compound.pkts() {
                    on_packet_rtcp(*track_id, pkt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_pair_ports() {
        let sockets = TrackSockets::bind_exact(0).await.unwrap();
        let rtp_port = sockets.rtp.local_port();
        assert_eq!(sockets.rtcp.local_port(), rtp_port + 1);
        assert!(!sockets.saw_packet());
    }

    #[tokio::test]
    async fn write_without_peer_is_noop() {
        let sockets = TrackSockets::bind_auto().await.unwrap();
        sockets.rtp.write(b"x").await.unwrap();
    }

    #[tokio::test]
    async fn reader_filters_and_stamps() {
        let sockets = TrackSockets::bind_auto().await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = SocketAddr::from(([127, 0, 0, 1], sockets.rtp.local_port()));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let on_packet_rtp: OnPacketRtp = Arc::new(move |cleaned: &crate::codec::CleanedPacket| {
            let _ = tx.send(cleaned.packet.sequence_number());
        });
        let last = sockets.rtp.last_packet_time.clone();
        let handle = tokio::spawn(run_reader(
            sockets.rtp.socket.clone(),
            last.clone(),
            Some(peer.local_addr().unwrap()),
            UdpReader::PlayRtp {
                track_id: 0,
                cleaner: Cleaner::new(false, 90_000),
                receiver_report: Arc::new(Mutex::new(ReceiverReportState::new(90_000))),
                on_packet_rtp,
            },
        ));

        let pkt = crate::rtp::ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            track_id: 0,
            sequence_number: 7,
            timestamp: 0,
            payload_type: 96,
            ssrc: 1,
            mark: false,
        }
        .build([0u8])
        .unwrap();
        peer.send_to(pkt.raw(), dest).await.unwrap();
        assert_eq!(rx.recv().await, Some(7));
        assert_ne!(last.load(Ordering::Relaxed), 0);

        // A datagram from an unexpected source is dropped.
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(pkt.raw(), dest).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        handle.abort();
    }
}
