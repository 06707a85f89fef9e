// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control-URL resolution from a DESCRIBE response.
//!
//! Only the sliver of SDP this client needs: find the video (else audio)
//! media section and its `a=control` attribute, then join it to the base
//! URL the way live555 and ffmpeg do rather than per RFC 3986. Servers in
//! the wild expect the non-compliant join.

use super::header_value;

/// Resolves the SETUP target from a DESCRIBE response (headers + SDP body).
///
/// The base URL is the `Content-Base` header (any trailing `/` stripped)
/// when present, else `play_url`. Falls back to the base when the SDP has
/// no usable media section or control attribute; RFC 2326 appendix C.3
/// allows the server to omit it for single-stream presentations.
pub(crate) fn resolve_control(response: &str, play_url: &str) -> String {
    let head = response.split("\r\n\r\n").next().unwrap_or(response);
    let base = header_value(head, "Content-Base")
        .map(|b| b.trim_end_matches('/'))
        .unwrap_or(play_url);

    let section = media_section(response, "m=video").or_else(|| media_section(response, "m=audio"));
    let Some(Some(control)) = section else {
        // No media section at all, or one without a control attribute.
        return base.to_owned();
    };

    if control.starts_with("rtsp://") {
        control.to_owned()
    } else if control == "*" {
        base.to_owned()
    } else if let Some(rooted) = control.strip_prefix('/') {
        format!("{}/{rooted}", scheme_and_authority(base))
    } else {
        format!("{base}/{control}")
    }
}

/// Finds the first media section whose `m=` line starts with `kind`.
///
/// Returns `None` when no such section exists, `Some(None)` when the
/// section exists but carries no `a=control`, and `Some(Some(value))`
/// otherwise. The distinction matters: a video section without a control
/// resolves to the base URL rather than falling back to audio.
fn media_section<'a>(response: &'a str, kind: &str) -> Option<Option<&'a str>> {
    let mut in_section = false;
    for line in response.lines() {
        if line.starts_with("m=") {
            if in_section {
                return Some(None);
            }
            in_section = line.starts_with(kind);
        } else if in_section {
            if let Some(control) = line.strip_prefix("a=control:") {
                return Some(Some(control.trim()));
            }
        }
    }
    in_section.then_some(None)
}

/// `rtsp://host:port` of a URL, without any path.
fn scheme_and_authority(url: &str) -> &str {
    let authority_start = match url.find("://") {
        Some(i) => i + 3,
        None => return url,
    };
    match url[authority_start..].find('/') {
        Some(i) => &url[..authority_start + i],
        None => url,
    }
}
