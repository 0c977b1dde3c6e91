// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`].
//!
//! In theory there could be a similar async-std-based implementation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rtsp_types::{Data, Message};
use std::net::IpAddr;
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;

use crate::error::ErrorInt;
use crate::{Error, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// Byte stream under the RTSP connection: plain TCP or TLS over TCP.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type IoStream = Box<dyn AsyncStream>;

/// A RTSP connection which implements `Stream`, `Sink`, and `Unpin`.
///
/// The `Stream` side yields [`ReceivedMessage`]s (responses, requests, and
/// interleaved data frames alike); the `Sink` side accepts any
/// [`Message<Bytes>`], including data frames during publish.
pub(crate) struct Connection(Framed<IoStream, Codec>);

impl Connection {
    /// Opens a plain TCP connection. The caller applies its own deadline.
    pub(crate) async fn connect(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_stream(stream)
    }

    /// Opens a TCP connection and performs a TLS handshake over it with
    /// `host` as the server name (the `rtsps` scheme).
    pub(crate) async fn connect_tls(
        host: &str,
        port: u16,
        connector: &tokio_native_tls::TlsConnector,
    ) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect((host, port)).await?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let stream = connector
            .connect(host, stream)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Self(Framed::new(
            Box::new(stream) as IoStream,
            Codec {
                ctx: ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall: WallTime::now(),
                },
                read_pos: 0,
            },
        )))
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self(Framed::new(
            Box::new(stream) as IoStream,
            Codec {
                ctx: ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall,
                },
                read_pos: 0,
            },
        )))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.0.codec().read_pos + crate::to_u64(self.0.read_buffer().remaining()),
            received_wall: WallTime::now(),
        }
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            CodecError::ParseError { .. } => unreachable!(),
        }
    }
}

impl futures::Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(error) => ErrorInt::RtspReadError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: self.eof_ctx(),
                    source: error,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                    },
                    description,
                },
            })
        })
    }
}

impl futures::Sink<Message<Bytes>> for Connection {
    type Error = ErrorInt;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.0
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}

/// Encodes and decodes RTSP messages.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // Skip whitespace as `rtsp-types` does. It's important to also do it here, or we might
        // skip our own data message encoding (next if) then hit
        // unreachable! after rtsp-types returns Message::Data.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Fast path for interleaved data, avoiding MessageRef -> Message<&[u8]> ->
            // Message<Bytes> conversion. This speeds things up quite a bit in practice,
            // avoiding a bunch of memmove calls.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some((
                len,
                Message::Data(Data::new(channel_id, msg.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Map msg's body to a Bytes representation and advance `src`. Awkward:
        // 1.  lifetime concerns require mapping twice: first so the message
        //     doesn't depend on the BytesMut, which needs to be split/advanced;
        //     then to get the proper Bytes body in place post-split.
        // 2.  rtsp_types messages must be AsRef<[u8]>, so we can't use the
        //     range as an intermediate body.
        // 3.  within a match because the rtsp_types::Message enum itself
        //     doesn't have body/replace_body/map_body methods.
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Request(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Request(msg.replace_body(Bytes::new()))
                }
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Response(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Response(msg.replace_body(Bytes::new()))
                }
            }
            Message::Data(_) => unreachable!(),
        };
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src) {
            Err(e) => return Err(e),
            Ok(None) => return Ok(None),
            Ok(Some((len, msg))) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<rtsp_types::Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(
        &mut self,
        item: rtsp_types::Message<Bytes>,
        mut dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::Data(data) => {
                // Fast path with the 4-byte framing prefix written by hand,
                // reusing `dst` as the scratch buffer across packets.
                let channel_id = data.channel_id();
                let body = data.into_body();
                let len = u16::try_from(body.len()).expect("interleaved payload fits in u16");
                dst.reserve(4 + body.len());
                dst.put_u8(b'$');
                dst.put_u8(channel_id);
                dst.put_u16(len);
                dst.put_slice(&body);
            }
            item => {
                item.write(&mut (&mut dst).writer())
                    .expect("BufMut Writer is infallible");
            }
        }
        Ok(())
    }
}

/// A pair of local UDP sockets used for RTP and RTCP transmission.
///
/// The RTP port is always even, and the RTCP port is always the following (odd) integer.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) async fn for_ip(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        const ALLOWED_RTP_RANGE: Range<u16> = 5000..65000; // stolen from ffmpeg's defaults.
        for i in 0..MAX_TRIES {
            let rtp_port = rand::Rng::gen_range(&mut rand::thread_rng(), ALLOWED_RTP_RANGE) & !0b1;
            match Self::bind(ip_addr, rtp_port).await {
                Ok(pair) => return Ok(pair),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    log::trace!(
                        "Try {}/{}: unable to bind pair at {}:{}",
                        i,
                        MAX_TRIES,
                        ip_addr,
                        rtp_port
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "Unable to find even/odd pair in {}:{}..{} after {} tries",
                ip_addr, ALLOWED_RTP_RANGE.start, ALLOWED_RTP_RANGE.end, MAX_TRIES
            ),
        ))
    }

    /// Binds the pair at exactly (`rtp_port`, `rtp_port + 1`).
    pub(crate) async fn bind(ip_addr: IpAddr, rtp_port: u16) -> Result<Self, std::io::Error> {
        let rtp_socket = UdpSocket::bind((ip_addr, rtp_port)).await?;
        // Re-read the port: with rtp_port=0 the kernel picked one.
        let rtp_port = rtp_socket.local_addr()?.port();
        let rtcp_socket = UdpSocket::bind((ip_addr, rtp_port + 1)).await?;
        Ok(Self {
            rtp_port,
            rtp_socket,
            rtcp_socket,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;

    fn test_codec() -> Codec {
        Codec {
            ctx: ConnectionContext::dummy(),
            read_pos: 0,
        }
    }

    #[test]
    fn crlf_data() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..], b"rest");
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.into_body()[..], b"asdf");
            }
            o => panic!("unexpected message {o:?}"),
        }
    }

    #[test]
    fn incomplete_data_frame() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&b"$\x01\x00\x10asdf"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn data_frame_roundtrip() {
        use tokio_util::codec::Encoder;
        let mut codec = test_codec();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Data(Data::new(4, Bytes::from_static(b"payload"))),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..4], b"$\x04\x00\x07");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 4);
                assert_eq!(&d.into_body()[..], b"payload");
            }
            o => panic!("unexpected message {o:?}"),
        }
    }

    #[tokio::test]
    async fn udp_pair_is_even_odd() {
        let pair = UdpPair::for_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtp_port + 1
        );
    }
}
