// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Media tracks: the client-side view of one SDP media description.

use std::num::NonZeroU16;

use url::Url;

use super::parse::join_control;

/// One media stream within a presentation, as described by SDP.
///
/// Tracks are produced by `describe()` when reading. When publishing, the
/// caller builds them and passes them to `announce()`, which assigns each
/// track's control path.
#[derive(Clone, Debug)]
pub struct Track {
    /// Media type, e.g. `video` or `audio`.
    pub media: String,

    /// Encoding name from `a=rtpmap` (or the static payload type registry),
    /// with ASCII characters in lowercase. E.g. `h264`.
    pub encoding_name: String,

    /// RTP payload type. It's common to use one of the dynamically assigned
    /// values, 96–127.
    pub payload_type: u8,

    /// RTP clock rate, in Hz.
    pub clock_rate: u32,

    /// Number of audio channels, if applicable and known.
    pub channels: Option<NonZeroU16>,

    /// `a=fmtp` parameters, if any, excluding the leading payload type.
    pub fmtp: Option<String>,

    /// The track's control URL, as given in `a=control`. Relative values
    /// are resolved against the session base URL at `SETUP` time.
    pub control: Option<String>,
}

impl Track {
    /// Builds an H.264 video track for publishing.
    pub fn h264(payload_type: u8, fmtp: Option<String>) -> Self {
        Track {
            media: "video".to_owned(),
            encoding_name: "h264".to_owned(),
            payload_type,
            clock_rate: 90_000,
            channels: None,
            fmtp,
            control: None,
        }
    }

    pub(crate) fn is_h264(&self) -> bool {
        self.encoding_name.eq_ignore_ascii_case("h264")
    }

    /// Returns the URL to direct this track's `SETUP` at.
    pub(crate) fn url(&self, base_url: &Url) -> Result<Url, String> {
        match self.control.as_deref() {
            None | Some("") => Ok(base_url.clone()),
            Some(c) => join_control(base_url, c),
        }
    }
}

/// Serializes `tracks` as the `ANNOUNCE` body, assigning each track a
/// `trackID=n` control path in the process.
pub(crate) fn marshal_sdp(tracks: &mut [Track]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(256);
    out.push_str("v=0\r\n");
    out.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
    out.push_str("s=Stream\r\n");
    out.push_str("t=0 0\r\n");
    for (i, track) in tracks.iter_mut().enumerate() {
        track.control = Some(format!("trackID={i}"));
        let _ = write!(
            out,
            "m={} 0 RTP/AVP {}\r\n",
            track.media, track.payload_type
        );
        let _ = write!(
            out,
            "a=rtpmap:{} {}/{}",
            track.payload_type, track.encoding_name, track.clock_rate
        );
        if let Some(channels) = track.channels {
            let _ = write!(out, "/{channels}");
        }
        out.push_str("\r\n");
        if let Some(fmtp) = &track.fmtp {
            let _ = write!(out, "a=fmtp:{} {}\r\n", track.payload_type, fmtp);
        }
        let _ = write!(out, "a=control:trackID={i}\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_assigns_controls() {
        let mut tracks = vec![
            Track::h264(96, Some("packetization-mode=1".to_owned())),
            Track {
                media: "audio".to_owned(),
                encoding_name: "mpeg4-generic".to_owned(),
                payload_type: 97,
                clock_rate: 48_000,
                channels: NonZeroU16::new(2),
                fmtp: None,
                control: None,
            },
        ];
        let sdp = marshal_sdp(&mut tracks);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 h264/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=rtpmap:97 mpeg4-generic/48000/2\r\n"));
        assert_eq!(tracks[0].control.as_deref(), Some("trackID=0"));
        assert_eq!(tracks[1].control.as_deref(), Some("trackID=1"));

        // The body must itself be parseable.
        let session = sdp_types::Session::parse(sdp.as_bytes()).unwrap();
        assert_eq!(session.medias.len(), 2);
    }

    #[test]
    fn track_url_resolution() {
        let base = Url::parse("rtsp://example/stream/").unwrap();
        let t = Track {
            control: Some("trackID=1".to_owned()),
            ..Track::h264(96, None)
        };
        assert_eq!(
            t.url(&base).unwrap().as_str(),
            "rtsp://example/stream/trackID=1"
        );
        let t = Track {
            control: Some("rtsp://other/abs".to_owned()),
            ..Track::h264(96, None)
        };
        assert_eq!(t.url(&base).unwrap().as_str(), "rtsp://other/abs");
    }
}
