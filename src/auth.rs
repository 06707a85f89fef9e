// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `WWW-Authenticate` challenge parsing and `Authorization` header
//! construction for the Basic and Digest schemes.
//!
//! Digest is the RFC 2617 MD5 variant without `qop`, which is what RTSP
//! cameras overwhelmingly speak:
//!
//! ```text
//! HA1 = md5(username ":" realm ":" password)
//! HA2 = md5(method ":" uri)
//! response = md5(HA1 ":" nonce ":" HA2)
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::client::Credentials;

/// An authentication scheme latched from a server's 401 challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AuthScheme {
    Basic { realm: String },
    Digest { realm: String, nonce: String },
}

/// Returns the value of a `key="..."` parameter within a challenge.
fn quoted_param<'a>(challenge: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{key}=\"");
    let start = challenge.find(&needle)? + needle.len();
    let end = challenge[start..].find('"')? + start;
    Some(&challenge[start..end])
}

impl AuthScheme {
    /// Parses a `WWW-Authenticate` header value.
    ///
    /// Returns `None` for schemes other than Basic/Digest or for a Digest
    /// challenge missing its realm or nonce.
    pub(crate) fn parse(challenge: &str) -> Option<Self> {
        let challenge = challenge.trim();
        if let Some(params) = challenge.strip_prefix("Digest ") {
            return Some(AuthScheme::Digest {
                realm: quoted_param(params, "realm")?.to_owned(),
                nonce: quoted_param(params, "nonce")?.to_owned(),
            });
        }
        if let Some(params) = challenge.strip_prefix("Basic ") {
            return Some(AuthScheme::Basic {
                realm: quoted_param(params, "realm").unwrap_or("").to_owned(),
            });
        }
        None
    }

    /// Builds the `Authorization` header value for one request.
    pub(crate) fn authorization(&self, creds: &Credentials, method: &str, uri: &str) -> String {
        match self {
            AuthScheme::Basic { .. } => {
                let token = BASE64.encode(format!("{}:{}", creds.username, creds.password));
                format!("Basic {token}")
            }
            AuthScheme::Digest { realm, nonce } => {
                let ha1 = md5_hex(&format!("{}:{realm}:{}", creds.username, creds.password));
                let ha2 = md5_hex(&format!("{method}:{uri}"));
                let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
                format!(
                    "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", \
                     uri=\"{uri}\", response=\"{response}\"",
                    creds.username,
                )
            }
        }
    }
}

/// 32-character lowercase hex MD5.
fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    #[test]
    fn parse_digest_challenge() {
        let scheme = AuthScheme::parse("Digest realm=\"r\", nonce=\"n\"").unwrap();
        assert_eq!(
            scheme,
            AuthScheme::Digest {
                realm: "r".to_owned(),
                nonce: "n".to_owned(),
            }
        );
        // Parameter order is not significant.
        let scheme = AuthScheme::parse("Digest nonce=\"abc\", realm=\"cam\"").unwrap();
        assert_eq!(
            scheme,
            AuthScheme::Digest {
                realm: "cam".to_owned(),
                nonce: "abc".to_owned(),
            }
        );
    }

    #[test]
    fn parse_basic_challenge() {
        assert_eq!(
            AuthScheme::parse("Basic realm=\"cam\""),
            Some(AuthScheme::Basic {
                realm: "cam".to_owned()
            })
        );
    }

    #[test]
    fn rejects_unusable_challenges() {
        assert_eq!(AuthScheme::parse("Digest realm=\"r\""), None); // no nonce
        assert_eq!(AuthScheme::parse("Bearer token"), None);
        assert_eq!(AuthScheme::parse(""), None);
    }

    #[test]
    fn digest_response_vector() {
        // HA1 = md5("u:r:p"), HA2 = md5("OPTIONS:rtsp://h/s"),
        // response = md5(HA1:n:HA2); check against an independently
        // computed value.
        let scheme = AuthScheme::parse("Digest realm=\"r\", nonce=\"n\"").unwrap();
        let header = scheme.authorization(&creds("u", "p"), "OPTIONS", "rtsp://h/s");
        let expected_response = md5_hex(&format!(
            "{}:n:{}",
            md5_hex("u:r:p"),
            md5_hex("OPTIONS:rtsp://h/s")
        ));
        assert_eq!(
            header,
            format!(
                "Digest username=\"u\", realm=\"r\", nonce=\"n\", \
                 uri=\"rtsp://h/s\", response=\"{expected_response}\""
            )
        );
        assert_eq!(expected_response.len(), 32);
        assert!(expected_response.chars().all(|c| c.is_ascii_hexdigit()
            && !c.is_ascii_uppercase()));
    }

    #[test]
    fn basic_header() {
        let scheme = AuthScheme::Basic {
            realm: "r".to_owned(),
        };
        // base64("user:pass")
        assert_eq!(
            scheme.authorization(&creds("user", "pass"), "DESCRIBE", "rtsp://h/"),
            "Basic dXNlcjpwYXNz"
        );
        // Empty password still encodes the colon.
        assert_eq!(
            scheme.authorization(&creds("user", ""), "DESCRIBE", "rtsp://h/"),
            "Basic dXNlcjo="
        );
    }
}
