// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;

pub(crate) fn response(raw: impl AsRef<[u8]>) -> rtsp_types::Response<Bytes> {
    let raw = raw.as_ref();
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b: &[u8]| Bytes::copy_from_slice(b)),
        _ => panic!("unexpected message type"),
    }
}
