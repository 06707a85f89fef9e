// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demultiplexes one RTSP/TCP byte stream into text messages and
//! interleaved binary frames ([RFC 2326 section
//! 10.12](https://datatracker.ietf.org/doc/html/rfc2326#section-10.12)).
//!
//! The stream starts in text-only mode. Binary `'$'` framing is only honored
//! after [`Splitter::enable_rtp`]; before that a `'$'` is just the first
//! byte of (malformed) text. Each emitted unit is consumed atomically, so a
//! `'$'` inside a `Content-Length`-covered body can never be mistaken for a
//! frame header.

use bytes::{Buf, Bytes, BytesMut};
use log::{trace, warn};

/// One demultiplexed unit from the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SplitItem {
    /// A complete RTSP message: status line, headers, CRLFCRLF, body.
    Response(String),

    /// The payload of an interleaved frame on an even (RTP) channel.
    /// `track` is the channel pair index, i.e. channel / 2.
    Frame { track: usize, payload: Bytes },
}

/// Stateful framer over the accumulated read buffer.
///
/// Used as the [`tokio_util::codec::Decoder`] of the connection's
/// `FramedRead`; the `BytesMut` handed to [`decode`](Self::decode) is the
/// accumulator.
pub(crate) struct Splitter {
    rtp_enabled: bool,
}

impl Splitter {
    pub(crate) fn new() -> Self {
        Self { rtp_enabled: false }
    }

    /// Switches interleaved framing on (or off again, which nothing does in
    /// practice). Called once PLAY is on the wire; the PLAY response still
    /// parses as text because `'R' != '$'`.
    pub(crate) fn enable_rtp(&mut self, enable: bool) {
        self.rtp_enabled = enable;
    }

    #[cfg(test)]
    pub(crate) fn rtp_enabled(&self) -> bool {
        self.rtp_enabled
    }
}

/// Finds the end of the header block: the offset of the first `CRLFCRLF`.
fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Scans the header block for `Content-Length`, case-insensitively, and
/// returns its value. Absent or unparseable values count as 0.
fn content_length(head: &[u8]) -> usize {
    for line in head.split(|&b| b == b'\n') {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = std::str::from_utf8(&line[..colon]).unwrap_or("");
        if !name.trim().eq_ignore_ascii_case("content-length") {
            continue;
        }
        let value = String::from_utf8_lossy(&line[colon + 1..]);
        let value = value.trim();
        match value.parse::<usize>() {
            Ok(len) => return len,
            Err(_) => {
                warn!("unparseable Content-Length {value:?}; assuming no body");
                return 0;
            }
        }
    }
    0
}

impl tokio_util::codec::Decoder for Splitter {
    type Item = SplitItem;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SplitItem>, std::io::Error> {
        loop {
            // Tolerate stray CRLF between messages, as some servers emit.
            while src.starts_with(b"\r\n") {
                src.advance(2);
            }
            if src.is_empty() {
                return Ok(None);
            }

            if self.rtp_enabled && src[0] == b'$' {
                // Interleaved frame: '$', channel, 16-bit big-endian length.
                if src.len() < 4 {
                    return Ok(None);
                }
                let channel = src[1];
                let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
                if src.len() < len {
                    src.reserve(len - src.len());
                    return Ok(None);
                }
                let mut frame = src.split_to(len);
                frame.advance(4);
                if channel % 2 != 0 {
                    // Odd channels carry RTCP under the 0-1 pairing; not handled.
                    trace!("dropping {} interleaved bytes on channel {channel}", frame.len());
                    continue;
                }
                return Ok(Some(SplitItem::Frame {
                    track: usize::from(channel / 2),
                    payload: frame.freeze(),
                }));
            }

            // Text message: everything through CRLFCRLF, plus Content-Length
            // bytes of body.
            let Some(header_end) = find_crlfcrlf(src) else {
                return Ok(None);
            };
            let total = header_end + 4 + content_length(&src[..header_end]);
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let msg = src.split_to(total);
            return Ok(Some(SplitItem::Response(
                String::from_utf8_lossy(&msg).into_owned(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Decoder;

    /// Feeds `input` in chunks of `step` bytes, draining after every chunk.
    fn run(splitter: &mut Splitter, input: &[u8], step: usize) -> Vec<SplitItem> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in input.chunks(step) {
            buf.extend_from_slice(chunk);
            while let Some(item) = splitter.decode(&mut buf).unwrap() {
                out.push(item);
            }
        }
        assert!(buf.is_empty(), "unconsumed bytes: {buf:?}");
        out
    }

    fn response(s: &str) -> SplitItem {
        SplitItem::Response(s.to_owned())
    }

    const WITH_BODY: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 4\r\n\r\nBODY";

    #[test]
    fn response_byte_at_a_time() {
        let items = run(&mut Splitter::new(), WITH_BODY, 1);
        assert_eq!(
            items,
            vec![response(
                "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 4\r\n\r\nBODY"
            )]
        );
        if let SplitItem::Response(r) = &items[0] {
            assert_eq!(r.len(), WITH_BODY.len());
        }
    }

    #[test]
    fn segmentation_invariance() {
        let mut input = Vec::new();
        input.extend_from_slice(WITH_BODY);
        input.extend_from_slice(b"RTSP/1.0 404 Stream Not Found\r\nCSeq: 2\r\n\r\n");
        for step in [1, 2, 3, 5, 7, input.len()] {
            let items = run(&mut Splitter::new(), &input, step);
            assert_eq!(items.len(), 2, "step {step}");
            assert_eq!(
                items[1],
                response("RTSP/1.0 404 Stream Not Found\r\nCSeq: 2\r\n\r\n"),
                "step {step}"
            );
        }
    }

    #[test]
    fn interleaved_frames_across_boundaries() {
        let mut splitter = Splitter::new();
        splitter.enable_rtp(true);
        let items = run(
            &mut splitter,
            b"$\x00\x00\x08AAAAAAAA$\x00\x00\x04BBBB",
            3,
        );
        assert_eq!(
            items,
            vec![
                SplitItem::Frame {
                    track: 0,
                    payload: Bytes::from_static(b"AAAAAAAA"),
                },
                SplitItem::Frame {
                    track: 0,
                    payload: Bytes::from_static(b"BBBB"),
                },
            ]
        );
    }

    #[test]
    fn odd_channel_dropped() {
        let mut splitter = Splitter::new();
        splitter.enable_rtp(true);
        let items = run(
            &mut splitter,
            b"$\x01\x00\x04rtcp$\x02\x00\x03pkt",
            usize::MAX,
        );
        assert_eq!(
            items,
            vec![SplitItem::Frame {
                track: 1,
                payload: Bytes::from_static(b"pkt"),
            }]
        );
    }

    #[test]
    fn dollar_is_text_until_rtp_enabled() {
        // Before PLAY, a '$' can only be (bogus) text; it must wait for
        // CRLFCRLF rather than being eaten as a frame header.
        let items = run(&mut Splitter::new(), b"$x\r\n\r\n", usize::MAX);
        assert_eq!(items, vec![response("$x\r\n\r\n")]);
    }

    #[test]
    fn dollar_inside_body_not_misframed() {
        let mut splitter = Splitter::new();
        splitter.enable_rtp(true);
        let input = b"RTSP/1.0 200 OK\r\nContent-Length: 6\r\n\r\n$\x00\x00\x01x!$\x00\x00\x02ok";
        let items = run(&mut splitter, input, 4);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            response("RTSP/1.0 200 OK\r\nContent-Length: 6\r\n\r\n$\u{0}\u{0}\u{1}x!")
        );
        assert_eq!(
            items[1],
            SplitItem::Frame {
                track: 0,
                payload: Bytes::from_static(b"ok"),
            }
        );
    }

    #[test]
    fn content_length_case_insensitive() {
        let items = run(
            &mut Splitter::new(),
            b"RTSP/1.0 200 OK\r\ncontent-length:  2 \r\n\r\nhi",
            1,
        );
        assert_eq!(
            items,
            vec![response("RTSP/1.0 200 OK\r\ncontent-length:  2 \r\n\r\nhi")]
        );
    }

    #[test]
    fn missing_content_length_means_no_body() {
        let items = run(
            &mut Splitter::new(),
            b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\nRTSP/1.0 200 OK\r\nCSeq: 2\r\n\r\n",
            usize::MAX,
        );
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn interleaved_after_response() {
        let mut splitter = Splitter::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 4\r\n\r\n$\x00\x00\x02hi");
        assert!(matches!(
            splitter.decode(&mut buf).unwrap(),
            Some(SplitItem::Response(_))
        ));
        // Mode flips between the PLAY response and the first frame.
        splitter.enable_rtp(true);
        assert_eq!(
            splitter.decode(&mut buf).unwrap(),
            Some(SplitItem::Frame {
                track: 0,
                payload: Bytes::from_static(b"hi"),
            })
        );
        assert_eq!(splitter.decode(&mut buf).unwrap(), None);
    }
}
