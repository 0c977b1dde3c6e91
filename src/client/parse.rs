// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers and SDP bodies into client types.

use bytes::Bytes;
use pretty_hex::PrettyHex;
use sdp_types::Media;
use std::net::IpAddr;
use std::num::NonZeroU16;
use url::Url;

use super::Track;

/// Returns the registered static payload type's (media, encoding,
/// clock rate, channels), if any.
///
/// See the [RTP parameters registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1).
/// The registry is officially closed, so this list should never change.
fn static_payload_type(pt: u8) -> Option<(&'static str, &'static str, u32, Option<NonZeroU16>)> {
    let mono = NonZeroU16::new(1);
    Some(match pt {
        0 => ("audio", "pcmu", 8_000, mono),
        3 => ("audio", "gsm", 8_000, mono),
        4 => ("audio", "g723", 8_000, mono),
        5 => ("audio", "dvi4", 8_000, mono),
        6 => ("audio", "dvi4", 16_000, mono),
        7 => ("audio", "lpc", 8_000, mono),
        8 => ("audio", "pcma", 8_000, mono),
        9 => ("audio", "g722", 8_000, mono),
        10 => ("audio", "l16", 44_100, NonZeroU16::new(2)),
        11 => ("audio", "l16", 44_100, mono),
        12 => ("audio", "qcelp", 8_000, mono),
        13 => ("audio", "cn", 8_000, mono),
        14 => ("audio", "mpa", 90_000, None),
        15 => ("audio", "g728", 8_000, mono),
        16 => ("audio", "dvi4", 11_025, mono),
        17 => ("audio", "dvi4", 22_050, mono),
        18 => ("audio", "g729", 8_000, mono),
        25 => ("video", "celb", 90_000, None),
        26 => ("video", "jpeg", 90_000, None),
        28 => ("video", "nv", 90_000, None),
        31 => ("video", "h261", 90_000, None),
        32 => ("video", "mpv", 90_000, None),
        33 => ("video", "mp2t", 90_000, None),
        34 => ("video", "h263", 90_000, None),
        _ => return None,
    })
}

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }

    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| {
        format!(
            "unable to join base url {} with control url {:?}: {}",
            base_url, control, e
        )
    })
}

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str(), 10).ok())
}

/// Returns true if the `OPTIONS` response's `Public` header lists the method.
pub(crate) fn public_header_lists(response: &rtsp_types::Response<Bytes>, method: &str) -> bool {
    match response.header(&rtsp_types::headers::PUBLIC) {
        Some(v) => v
            .as_str()
            .split(',')
            .any(|m| m.trim().eq_ignore_ascii_case(method)),
        None => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: Option<u32>,
}

/// Parses a `Session` response header value.
/// See [RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37).
pub(crate) fn parse_session(value: &str) -> Result<SessionHeader, String> {
    match value.split_once(';') {
        None => Ok(SessionHeader {
            id: value.into(),
            timeout_sec: None,
        }),
        Some((id, rest)) => {
            if let Some(v) = rest.trim().strip_prefix("timeout=") {
                let timeout_sec =
                    u32::from_str_radix(v, 10).map_err(|_| format!("unparseable timeout {v}"))?;
                Ok(SessionHeader {
                    id: id.into(),
                    timeout_sec: Some(timeout_sec),
                })
            } else {
                Err(format!("unparseable Session header {value:?}"))
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Unicast,
    Multicast,
}

/// A parsed `Transport` response header.
/// See [RFC 2326 section 12.39](https://datatracker.ietf.org/doc/html/rfc2326#section-12.39).
/// Which parameters must be present depends on the transport in use; the
/// `SETUP` handler validates that.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportHeader {
    pub(crate) delivery: Option<Delivery>,
    pub(crate) interleaved: Option<(u8, u8)>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) destination: Option<IpAddr>,
    pub(crate) server_port: Option<(u16, u16)>,
    pub(crate) port: Option<(u16, u16)>,
    pub(crate) ssrc: Option<u32>,
}

fn parse_u16_pair(s: &str) -> Result<(u16, u16), String> {
    let mut parts = s.splitn(2, '-');
    let n = parts.next().expect("splitn returns at least one part");
    let n = u16::from_str_radix(n, 10).map_err(|_| format!("bad port {n:?}"))?;
    match parts.next() {
        Some(m) => {
            let m = u16::from_str_radix(m, 10).map_err(|_| format!("bad port {m:?}"))?;
            Ok((n, m))
        }
        // A single value implies the pair starting there, as with interleaved=n.
        None => Ok((n, n + 1)),
    }
}

pub(crate) fn parse_transport(value: &str) -> Result<TransportHeader, String> {
    let mut h = TransportHeader::default();
    for part in value.split(';') {
        let part = part.trim();
        if part == "unicast" {
            h.delivery = Some(Delivery::Unicast);
        } else if part == "multicast" {
            h.delivery = Some(Delivery::Multicast);
        } else if let Some(v) = part.strip_prefix("interleaved=") {
            let (n, m) = parse_u16_pair(v)?;
            let n = u8::try_from(n).map_err(|_| format!("bad channel number {n}"))?;
            let m = u8::try_from(m).map_err(|_| format!("bad channel number {m}"))?;
            h.interleaved = Some((n, m));
        } else if let Some(v) = part.strip_prefix("source=") {
            h.source = Some(
                v.parse()
                    .map_err(|_| format!("unparseable source {v:?}"))?,
            );
        } else if let Some(v) = part.strip_prefix("destination=") {
            h.destination = Some(
                v.parse()
                    .map_err(|_| format!("unparseable destination {v:?}"))?,
            );
        } else if let Some(v) = part.strip_prefix("server_port=") {
            h.server_port = Some(parse_u16_pair(v)?);
        } else if let Some(v) = part.strip_prefix("port=") {
            h.port = Some(parse_u16_pair(v)?);
        } else if let Some(v) = part.strip_prefix("ssrc=") {
            h.ssrc =
                Some(u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v}"))?);
        }
    }
    Ok(h)
}

/// Parses a [Media] description to a [Track].
/// On failure, returns an error which is expected to be supplemented with
/// the [Media] debug string and packed into a `RtspResponseError`.
fn parse_media(media_description: &Media) -> Result<Track, String> {
    let media = media_description.media.clone();

    // https://tools.ietf.org/html/rfc8866#section-5.14 says "If the <proto>
    // sub-field is "RTP/AVP" or "RTP/SAVP" the <fmt> sub-fields contain RTP
    // payload type numbers." Several other variants exist, such as
    // "TCP/RTP/AVP"; looking for a "RTP" component seems appropriate.
    if !media_description.proto.starts_with("RTP/") && !media_description.proto.contains("/RTP/") {
        return Err("expected RTP-based proto".into());
    }

    // RFC 8866: "When a list of payload type numbers is given, ... the first
    // of these formats SHOULD be used as the default format for the session."
    let payload_type_str = media_description
        .fmt
        .split_ascii_whitespace()
        .next()
        .unwrap();
    let payload_type = u8::from_str_radix(payload_type_str, 10)
        .map_err(|_| format!("invalid RTP payload type {payload_type_str:?}"))?;
    if (payload_type & 0x80) != 0 {
        return Err(format!("invalid RTP payload type {payload_type}"));
    }

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    for a in &media_description.attributes {
        if a.attribute == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "rtpmap attribute with no value".to_string())?;
            // https://tools.ietf.org/html/rfc8866#section-6.6
            // rtpmap-value = payload-type SP encoding-name
            //   "/" clock-rate [ "/" encoding-params ]
            let (rtpmap_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid rtpmap attribute".to_string())?;
            if rtpmap_payload_type == payload_type_str {
                rtpmap = Some(v);
            }
        } else if a.attribute == "fmtp" {
            // Similarly starts with payload-type SP.
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "fmtp attribute with no value".to_string())?;
            let (fmtp_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid fmtp attribute".to_string())?;
            if fmtp_payload_type == payload_type_str {
                fmtp = Some(v.to_owned());
            }
        } else if a.attribute == "control" {
            control = a.value.clone();
        }
    }

    let encoding_name;
    let clock_rate;
    let channels;
    match rtpmap {
        Some(rtpmap) => {
            let (e, rtpmap) = rtpmap
                .split_once('/')
                .ok_or_else(|| "invalid rtpmap attribute".to_string())?;
            encoding_name = e.to_ascii_lowercase();
            let (clock_rate_str, channels_str) = match rtpmap.find('/') {
                None => (rtpmap, None),
                Some(i) => (&rtpmap[..i], Some(&rtpmap[i + 1..])),
            };
            clock_rate = u32::from_str_radix(clock_rate_str, 10)
                .map_err(|_| "bad clockrate in rtpmap".to_string())?;
            channels = channels_str
                .map(|c| {
                    u16::from_str_radix(c, 10)
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| format!("invalid channels specification {c:?}"))
                })
                .transpose()?;
        }
        None => {
            let (static_media, e, c, ch) = static_payload_type(payload_type).ok_or_else(|| {
                format!("expected rtpmap parameter or assigned static payload type (got {payload_type})")
            })?;
            if static_media != media {
                return Err(format!(
                    "SDP media type {media} must match static payload type {payload_type}"
                ));
            }
            encoding_name = e.to_owned();
            clock_rate = c;
            channels = ch;
        }
    }

    Ok(Track {
        media,
        encoding_name,
        payload_type,
        clock_rate,
        channels,
        fmtp,
        control,
    })
}

/// Parses a successful RTSP `DESCRIBE` response into the track list and the
/// session base URL.
///
/// The base URL is, in priority order: the session-level `a=control`
/// attribute (unless `*`), the `Content-Base` header, the request URL.
pub(crate) fn parse_describe(
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<(Vec<Track>, Url), String> {
    let sdp = sdp_types::Session::parse(&response.body()[..]).map_err(|e| {
        format!(
            "Unable to parse SDP: {}\n\n{:#?}",
            e,
            response.body().hex_dump()
        )
    })?;

    let content_base = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| Url::parse(v.as_str()).map_err(|e| format!("bad Content-Base {v:?}: {e}")))
        .transpose()?;

    let mut base_url = None;
    for a in &sdp.attributes {
        if a.attribute == "control" {
            base_url = match a.value.as_deref() {
                None | Some("*") => None,
                Some(c) => Some(join_control(
                    content_base.as_ref().unwrap_or(request_url),
                    c,
                )?),
            };
            break;
        }
    }
    let base_url = base_url
        .or(content_base)
        .unwrap_or_else(|| request_url.clone());

    let tracks = sdp
        .medias
        .iter()
        .enumerate()
        .map(|(i, m)| {
            parse_media(m).map_err(|e| format!("unable to parse track {i}: {e}\n\n{m:#?}"))
        })
        .collect::<Result<Vec<Track>, String>>()?;

    Ok((tracks, base_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::response;

    #[test]
    fn session_header() {
        assert_eq!(
            parse_session("12345678").unwrap(),
            SessionHeader {
                id: "12345678".into(),
                timeout_sec: None,
            }
        );
        assert_eq!(
            parse_session("12345678;timeout=66").unwrap(),
            SessionHeader {
                id: "12345678".into(),
                timeout_sec: Some(66),
            }
        );
        parse_session("12345678;bogus=1").unwrap_err();
    }

    #[test]
    fn transport_header_udp() {
        let h = parse_transport(
            "RTP/AVP/UDP;unicast;client_port=5000-5001;server_port=6256-6257;ssrc=4F5EB806",
        )
        .unwrap();
        assert_eq!(h.delivery, Some(Delivery::Unicast));
        assert_eq!(h.server_port, Some((6256, 6257)));
        assert_eq!(h.ssrc, Some(0x4F5E_B806));
        assert_eq!(h.interleaved, None);
    }

    #[test]
    fn transport_header_multicast() {
        let h = parse_transport("RTP/AVP;multicast;destination=239.0.0.1;port=5000-5001;ttl=16")
            .unwrap();
        assert_eq!(h.delivery, Some(Delivery::Multicast));
        assert_eq!(h.destination, Some("239.0.0.1".parse().unwrap()));
        assert_eq!(h.port, Some((5000, 5001)));
    }

    #[test]
    fn transport_header_tcp() {
        let h = parse_transport("RTP/AVP/TCP;unicast;interleaved=4-5").unwrap();
        assert_eq!(h.interleaved, Some((4, 5)));
        // A single channel id implies the following one.
        let h = parse_transport("RTP/AVP/TCP;unicast;interleaved=6").unwrap();
        assert_eq!(h.interleaved, Some((6, 7)));
    }

    #[test]
    fn transport_header_source() {
        let h = parse_transport("RTP/AVP;unicast;source=192.168.5.2;server_port=2000-2001")
            .unwrap();
        assert_eq!(h.source, Some("192.168.5.2".parse().unwrap()));
        parse_transport("RTP/AVP;unicast;source=bogus").unwrap_err();
    }

    fn fake_describe(headers: &str, body: &str) -> rtsp_types::Response<bytes::Bytes> {
        response(
            format!(
                "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\n{}Content-Length: {}\r\n\r\n{}",
                headers,
                body.len(),
                body,
            )
            .into_bytes(),
        )
    }

    const SDP_ONE_H264_TRACK: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Stream\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z00AH5Y1QKALdNwEBAQI,aO48gA==\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn describe_with_content_base() {
        let url = Url::parse("rtsp://192.168.5.206/h264Preview_01_main").unwrap();
        let resp = fake_describe(
            "Content-Base: rtsp://192.168.5.206/base/\r\n",
            SDP_ONE_H264_TRACK,
        );
        let (tracks, base_url) = parse_describe(&url, &resp).unwrap();
        assert_eq!(base_url.as_str(), "rtsp://192.168.5.206/base/");
        assert_eq!(tracks.len(), 1);
        let t = &tracks[0];
        assert_eq!(t.media, "video");
        assert_eq!(t.encoding_name, "h264");
        assert_eq!(t.payload_type, 96);
        assert_eq!(t.clock_rate, 90_000);
        assert_eq!(t.control.as_deref(), Some("trackID=1"));
        assert!(t.fmtp.as_deref().unwrap().starts_with("packetization-mode=1"));
        assert!(t.is_h264());
    }

    #[test]
    fn describe_with_session_control() {
        let url = Url::parse("rtsp://example/stream").unwrap();
        let body = format!("{SDP_ONE_H264_TRACK}a=control:rtsp://example/other/\r\n");
        let resp = fake_describe("", &body);
        let (_, base_url) = parse_describe(&url, &resp).unwrap();
        assert_eq!(base_url.as_str(), "rtsp://example/other/");
    }

    #[test]
    fn describe_without_base_headers_uses_request_url() {
        let url = Url::parse("rtsp://example/stream").unwrap();
        let resp = fake_describe("", SDP_ONE_H264_TRACK);
        let (_, base_url) = parse_describe(&url, &resp).unwrap();
        assert_eq!(base_url, url);
    }

    #[test]
    fn describe_static_payload_type() {
        let url = Url::parse("rtsp://example/stream").unwrap();
        let body = "v=0\r\n\
            o=- 0 0 IN IP4 127.0.0.1\r\n\
            s=Stream\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 0\r\n\
            a=control:trackID=0\r\n";
        let resp = fake_describe("", body);
        let (tracks, _) = parse_describe(&url, &resp).unwrap();
        assert_eq!(tracks[0].encoding_name, "pcmu");
        assert_eq!(tracks[0].clock_rate, 8_000);
        assert_eq!(tracks[0].channels, NonZeroU16::new(1));
    }

    #[test]
    fn public_header() {
        let resp = response(
            b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\
              Public: OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER\r\n\r\n"
                .to_vec(),
        );
        assert!(public_header_lists(&resp, "GET_PARAMETER"));
        assert!(!public_header_lists(&resp, "RECORD"));
    }
}
