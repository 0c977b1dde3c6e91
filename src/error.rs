// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::client::ClientState;
use crate::{ConnectionContext, PacketContext, RtspMessageContext};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Currently the focus is on providing detailed human-readable error messages.
/// In most cases they have enough information to find the offending packet
/// in Wireshark.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some((*status).into()),
            _ => None,
        }
    }

    /// Returns true if the error is the terminal "client closed" error.
    pub fn is_terminated(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Terminated)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The verb is not allowed in the session's current state.
    #[error("{} not allowed in state {state}; allowed states: {allowed:?}",
            Into::<&str>::into(.method))]
    InvalidState {
        method: rtsp_types::Method,
        state: ClientState,
        allowed: &'static [ClientState],
    },

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("{status} response to {} CSeq={cseq}: {description}\n\n\
             conn: {conn_ctx}\nmsg: {msg_ctx}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error("Invalid Session header: {description}")]
    SessionHeaderInvalid { description: String },

    #[error("Invalid Transport header: {description}")]
    TransportHeaderInvalid { description: String },

    #[error("Can't read and publish within the same session")]
    CannotReadPublishSameTime,

    #[error("Can't setup tracks with different base URLs")]
    CannotSetupTracksDifferentUrls,

    #[error("RTP and RTCP ports must be both zero or both nonzero")]
    UdpPortsZero,

    #[error("The RTCP port must be the RTP port plus one")]
    UdpPortsNotConsecutive,

    #[error("Server did not provide server ports in its Transport header")]
    ServerPortsNotProvided,

    #[error("DESCRIBE response has no Content-Type header")]
    ContentTypeMissing,

    #[error("DESCRIBE response has unsupported Content-Type {0:?}")]
    ContentTypeUnsupported(String),

    #[error(
        "Received interleaved data on unassigned channel {channel_id}: \n\
         {:?}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    RtspUnassignedChannelError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        data: Bytes,
    },

    #[error("{description}\n\nconn: {conn_ctx}\ntrack: {track_id}\npkt: {pkt_ctx}")]
    PacketError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        track_id: usize,
        description: String,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Unable to bind UDP sockets: {0}")]
    UdpBindError(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("No UDP packet received within the timeout")]
    UdpTimeout,

    #[error("No interleaved frame received within the timeout")]
    TcpTimeout,

    #[error("Client terminated")]
    Terminated,

    #[error("Timeout")]
    Timeout,
}
