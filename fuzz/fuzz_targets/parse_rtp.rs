#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let data = bytes::Bytes::copy_from_slice(data);
    if let Ok(pkt) = rivulet::rtp::RtpPacket::parse(data.clone()) {
        // The payload must lie within the frame, and keyframe detection
        // must hold up on arbitrary payload bytes.
        assert!(pkt.payload().len() <= data.len());
        let _ = pkt.is_keyframe();
    }
});
