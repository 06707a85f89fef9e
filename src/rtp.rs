// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet handling as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1),
//! with just enough [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184)
//! awareness to spot H.264 keyframes.

use bytes::Bytes;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: usize = 12;

/// NAL unit type of a single instantaneous decoder refresh slice.
const NAL_IDR: u8 = 5;

/// NAL unit type of an FU-A fragmentation unit.
const NAL_FU_A: u8 = 28;

/// A decoded RTP packet.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The packet is immutable once parsed. The payload shares the backing
/// allocation of the raw frame, so cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpPacket {
    version: u8,
    padding: bool,
    extension: bool,
    csrc_count: u8,
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    payload: Bytes,
}

/// Reason a raw frame failed to parse as RTP, along with the offending bytes.
#[derive(Debug)]
pub struct RtpParseError {
    pub reason: &'static str,
    pub data: Bytes,
}

impl std::fmt::Display for RtpParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} bytes)", self.reason, self.data.len())
    }
}

impl std::error::Error for RtpParseError {}

impl RtpPacket {
    /// Validates and decodes a raw frame.
    ///
    /// The header must fit: `12 + 4*csrc_count` bytes, plus the extension
    /// header and its declared word count when the X bit is set. Anything
    /// after the header is payload, padding included.
    pub fn parse(data: Bytes) -> Result<Self, RtpParseError> {
        if data.len() < MIN_HEADER_LEN {
            return Err(RtpParseError {
                reason: "too short",
                data,
            });
        }
        let version = (data[0] >> 6) & 0b11;
        if version != 2 {
            return Err(RtpParseError {
                reason: "must be version 2",
                data,
            });
        }
        let padding = (data[0] & 0b0010_0000) != 0;
        let extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = data[0] & 0b0000_1111;
        let marker = (data[1] & 0b1000_0000) != 0;
        let payload_type = data[1] & 0b0111_1111;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let csrc_end = MIN_HEADER_LEN + 4 * usize::from(csrc_count);
        let payload_start = if extension {
            if data.len() < csrc_end + 4 {
                return Err(RtpParseError {
                    reason: "extension is after end of packet",
                    data,
                });
            }
            let ext_words =
                usize::from(u16::from_be_bytes([data[csrc_end + 2], data[csrc_end + 3]]));
            csrc_end + 4 + 4 * ext_words
        } else {
            csrc_end
        };
        if data.len() < payload_start {
            return Err(RtpParseError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        let payload = data.slice(payload_start..);
        Ok(Self {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload,
        })
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn has_padding(&self) -> bool {
        self.padding
    }

    #[inline]
    pub fn has_extension(&self) -> bool {
        self.extension
    }

    #[inline]
    pub fn csrc_count(&self) -> u8 {
        self.csrc_count
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.marker
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Returns the payload bytes (everything after the header, padding included).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the payload carries the start of an H.264 IDR picture
    /// per [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
    ///
    /// A single NAL of type 5 is a keyframe. An FU-A (type 28) is a keyframe
    /// only on its first fragment (start bit set) when the fragmented NAL
    /// type is 5. Other payloads, including non-H.264 codecs that happen to
    /// share the bit patterns, report `false` or garbage; callers decide
    /// per-stream whether the answer is meaningful.
    pub fn is_keyframe(&self) -> bool {
        let Some(&first) = self.payload.first() else {
            return false;
        };
        match first & 0x1F {
            NAL_IDR => true,
            NAL_FU_A => {
                let Some(&fu_header) = self.payload.get(1) else {
                    return false;
                };
                (fu_header & 0x80) != 0 && (fu_header & 0x1F) == NAL_IDR
            }
            _ => false,
        }
    }
}

/// Builds the wire image of a packet with no CSRCs, extension, or padding.
///
/// Used by tests and tools that need well-formed frames.
pub struct RtpPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl RtpPacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(self, payload: P) -> Result<Bytes, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        Ok([
            2 << 6, // version=2, no padding, no extension, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &'static [u8]) -> Result<RtpPacket, RtpParseError> {
        RtpPacket::parse(Bytes::from_static(raw))
    }

    #[test]
    fn fixed_header() {
        let pkt = parse(b"\x80\xe0\x12\x34\x00\x00\x30\x39\xde\xad\xbe\xefhello").unwrap();
        assert_eq!(pkt.version(), 2);
        assert!(!pkt.has_padding());
        assert!(!pkt.has_extension());
        assert_eq!(pkt.csrc_count(), 0);
        assert!(pkt.mark());
        assert_eq!(pkt.payload_type(), 0x60);
        assert_eq!(pkt.sequence_number(), 0x1234);
        assert_eq!(pkt.timestamp(), 12_345);
        assert_eq!(pkt.ssrc(), 0xdead_beef);
        assert_eq!(pkt.payload(), b"hello");
    }

    #[test]
    fn csrcs_skipped() {
        let pkt = parse(b"\x82\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03AAAABBBBxy").unwrap();
        assert_eq!(pkt.csrc_count(), 2);
        assert_eq!(pkt.payload(), b"xy");
    }

    #[test]
    fn extension_skipped() {
        // Extension header declares one 32-bit word.
        let pkt = parse(b"\x90\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03\xbe\xde\x00\x01WXYZab")
            .unwrap();
        assert!(pkt.has_extension());
        assert_eq!(pkt.payload(), b"ab");
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse(b"").unwrap_err().reason, "too short");
        assert_eq!(
            parse(b"\x80\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00").unwrap_err().reason,
            "too short"
        );
        assert_eq!(
            parse(b"\x00\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03").unwrap_err().reason,
            "must be version 2"
        );
        // X bit set, but no room for the extension header itself.
        assert_eq!(
            parse(b"\x90\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03\x00\x00").unwrap_err().reason,
            "extension is after end of packet"
        );
        // Extension declares more words than the frame holds.
        assert_eq!(
            parse(b"\x90\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03\xbe\xde\x00\x04ab")
                .unwrap_err()
                .reason,
            "payload start is after end of packet"
        );
    }

    #[test]
    fn empty_payload_ok() {
        let pkt = parse(b"\x80\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03").unwrap();
        assert_eq!(pkt.payload(), b"");
        assert!(!pkt.is_keyframe());
    }

    #[test]
    fn h264_keyframe_detection() {
        let frame = |payload: &[u8]| {
            RtpPacket::parse(
                RtpPacketBuilder {
                    sequence_number: 1,
                    timestamp: 0,
                    payload_type: 96,
                    ssrc: 0x4cacc3d1,
                    mark: false,
                }
                .build(payload.to_vec())
                .unwrap(),
            )
            .unwrap()
        };
        // Single NAL, type 5 (IDR).
        assert!(frame(b"\x65rest").is_keyframe());
        // FU-A carrying the start of an IDR: start bit set, fragmented type 5.
        assert!(frame(b"\x7c\x85data").is_keyframe());
        // FU-A continuation of an IDR: start bit clear.
        assert!(!frame(b"\x7c\x05data").is_keyframe());
        // FU-A start of a non-IDR slice.
        assert!(!frame(b"\x7c\x81data").is_keyframe());
        // Single NAL, type 1 (non-IDR slice).
        assert!(!frame(b"\x41rest").is_keyframe());
        // Truncated FU-A with no FU header byte.
        assert!(!frame(b"\x7c").is_keyframe());
    }

    #[test]
    fn round_trip() {
        for (seq, ts, pt, ssrc, mark, payload) in [
            (0u16, 0u32, 0u8, 0u32, false, &b""[..]),
            (0x1234, 0xdead_beef, 96, 0x4cac_c3d1, true, &b"\x65payload"[..]),
            (u16::MAX, u32::MAX, 127, u32::MAX, false, &b"x"[..]),
        ] {
            let raw = RtpPacketBuilder {
                sequence_number: seq,
                timestamp: ts,
                payload_type: pt,
                ssrc,
                mark,
            }
            .build(payload.iter().copied())
            .unwrap();
            let pkt = RtpPacket::parse(raw).unwrap();
            assert_eq!(pkt.sequence_number(), seq);
            assert_eq!(pkt.timestamp(), ts);
            assert_eq!(pkt.payload_type(), pt);
            assert_eq!(pkt.ssrc(), ssrc);
            assert_eq!(pkt.mark(), mark);
            assert_eq!(pkt.payload(), payload);
        }
    }
}
