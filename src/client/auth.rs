// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authorization header generation from `WWW-Authenticate` challenges.

use std::borrow::Cow;

use base64::Engine as _;

/// Splits a folded `WWW-Authenticate` value into individual challenges.
///
/// Servers may send several challenges, which header folding joins with
/// commas; commas also separate parameters within a challenge, so split
/// only where a known scheme name follows.
pub(crate) fn split_challenges(value: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    for scheme in ["Digest", "Basic"] {
        let mut from = 0;
        while let Some(i) = value[from..].find(scheme) {
            let at = from + i;
            let preceded_ok = at == 0
                || value[..at]
                    .trim_end()
                    .ends_with(',');
            if preceded_ok {
                starts.push(at);
            }
            from = at + scheme.len();
        }
    }
    if starts.is_empty() {
        return vec![value];
    }
    starts.sort_unstable();
    let mut out = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(value.len());
        out.push(value[start..end].trim_end_matches([' ', ',']));
    }
    out
}

/// Builds `Authorization` headers for every request once the server has
/// challenged. Constructed from the 401 response's `WWW-Authenticate`
/// values and the credentials embedded in the caller's URL; Digest is
/// preferred over Basic when the server offers both.
#[derive(Debug)]
pub(crate) struct Sender {
    username: String,
    password: String,
    scheme: Scheme,
}

#[derive(Debug)]
enum Scheme {
    Digest(Box<digest_auth::WwwAuthenticateHeader>),
    Basic,
}

impl Sender {
    pub(crate) fn new<'a>(
        challenges: impl Iterator<Item = &'a str>,
        username: &str,
        password: &str,
    ) -> Result<Self, String> {
        let mut basic = false;
        let mut digest = None;
        for challenge in challenges {
            let challenge = challenge.trim();
            if challenge.starts_with("Digest ") && digest.is_none() {
                digest = Some(
                    digest_auth::WwwAuthenticateHeader::parse(challenge)
                        .map_err(|e| format!("bad Digest challenge: {e}"))?,
                );
            } else if challenge.starts_with("Basic ") || challenge == "Basic" {
                basic = true;
            }
        }
        let scheme = match digest {
            Some(d) => Scheme::Digest(Box::new(d)),
            None if basic => Scheme::Basic,
            None => return Err("no supported authentication scheme offered".to_owned()),
        };
        Ok(Sender {
            username: username.to_owned(),
            password: password.to_owned(),
            scheme,
        })
    }

    /// Returns the `Authorization` header value for one request.
    pub(crate) fn authorization(
        &mut self,
        method: rtsp_types::Method,
        uri: &str,
    ) -> Result<String, String> {
        match &mut self.scheme {
            Scheme::Digest(challenge) => {
                let method = digest_auth::HttpMethod(Cow::Borrowed(Into::<&str>::into(&method)));
                let ctx = digest_auth::AuthContext::new_with_method(
                    &self.username,
                    &self.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    method,
                );
                Ok(challenge
                    .respond(&ctx)
                    .map_err(|e| format!("digest response failed: {e}"))?
                    .to_string())
            }
            Scheme::Basic => {
                let creds = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", self.username, self.password));
                Ok(format!("Basic {creds}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        let mut sender = Sender::new(
            [r#"Basic realm="4419b63f5e51""#].into_iter(),
            "admin",
            "secret",
        )
        .unwrap();
        let v = sender
            .authorization(rtsp_types::Method::Describe, "rtsp://example/")
            .unwrap();
        assert_eq!(v, "Basic YWRtaW46c2VjcmV0");
    }

    #[test]
    fn prefers_digest() {
        let mut sender = Sender::new(
            [
                r#"Basic realm="4419b63f5e51""#,
                r#"Digest realm="4419b63f5e51", nonce="8b84a3b789283a8bea8da7fa7d41f08b", stale="FALSE""#,
            ]
            .into_iter(),
            "admin",
            "secret",
        )
        .unwrap();
        let v = sender
            .authorization(rtsp_types::Method::Describe, "rtsp://example/")
            .unwrap();
        assert!(v.starts_with("Digest username=\"admin\""), "got {v}");
        assert!(v.contains("uri=\"rtsp://example/\""), "got {v}");
    }

    #[test]
    fn no_scheme() {
        Sender::new([r#"Bearer foo"#].into_iter(), "u", "p").unwrap_err();
    }

    #[test]
    fn split_folded_challenges() {
        let v = r#"Digest realm="r", nonce="n", stale="FALSE", Basic realm="r""#;
        let parts = split_challenges(v);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("Digest realm"));
        assert!(!parts[0].contains("Basic"));
        assert!(parts[1].starts_with("Basic realm"));

        assert_eq!(split_challenges(r#"Basic realm="r""#), vec![r#"Basic realm="r""#]);
    }
}
