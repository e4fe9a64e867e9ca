//! Advisory video packet inspection.
//!
//! Screen agents prefix encoded frames with a two-byte header
//! `[0x07, codec_id]`. The relay never decodes video; it only sniffs the
//! header to classify keyframes for frame-buffer eviction and, for VP8,
//! to read the intra-frame resolution. All of this is best-effort: a
//! payload that does not parse is treated as an inter-frame.

const PACKET_MARKER: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(VideoCodec::Vp8),
            1 => Some(VideoCodec::Vp9),
            2 => Some(VideoCodec::H264),
            3 => Some(VideoCodec::H265),
            4 => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "VP8",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::Av1 => "AV1",
        }
    }
}

/// Splits a tagged packet into its codec and frame data.
pub fn parse_packet(packet: &[u8]) -> Option<(VideoCodec, &[u8])> {
    if packet.len() < 2 || packet[0] != PACKET_MARKER {
        return None;
    }
    let codec = VideoCodec::from_id(packet[1])?;
    Some((codec, &packet[2..]))
}

/// Builds a tagged packet around encoded frame data.
pub fn make_packet(codec_id: u8, frame: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(2 + frame.len());
    packet.push(PACKET_MARKER);
    packet.push(codec_id);
    packet.extend_from_slice(frame);
    packet
}

/// Keyframe heuristic per codec.
///
/// VP8/VP9 keep the frame-type flag in bit 0 of the first byte (0 =
/// keyframe). H.264 scans for an IDR NAL (type 5) behind either start
/// code; H.265 for NAL types 16..=23.
pub fn is_keyframe(codec: VideoCodec, data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    match codec {
        VideoCodec::Vp8 | VideoCodec::Vp9 => data[0] & 0x01 == 0,
        VideoCodec::H264 => {
            for i in 0..data.len().saturating_sub(4) {
                if data[i] == 0x00 && data[i + 1] == 0x00 {
                    if data[i + 2] == 0x00 && data[i + 3] == 0x01 {
                        if i + 4 < data.len() && data[i + 4] & 0x1F == 5 {
                            return true;
                        }
                    } else if data[i + 2] == 0x01 {
                        if i + 3 < data.len() && data[i + 3] & 0x1F == 5 {
                            return true;
                        }
                    }
                }
            }
            false
        }
        VideoCodec::H265 => {
            for i in 0..data.len().saturating_sub(4) {
                if data[i] == 0x00
                    && data[i + 1] == 0x00
                    && data[i + 2] == 0x00
                    && data[i + 3] == 0x01
                    && i + 4 < data.len()
                {
                    let nal_type = (data[i + 4] >> 1) & 0x3F;
                    if (16..=23).contains(&nal_type) {
                        return true;
                    }
                }
            }
            false
        }
        VideoCodec::Av1 => false,
    }
}

/// Classifies an opaque distributor payload: true only when it carries a
/// recognizable packet header whose frame passes the keyframe heuristic.
pub fn classify_keyframe(payload: &[u8]) -> bool {
    match parse_packet(payload) {
        Some((codec, frame)) => is_keyframe(codec, frame),
        None => false,
    }
}

/// Reads the resolution out of a VP8 keyframe header.
pub fn vp8_resolution(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < 10 || data[0] & 0x01 != 0 {
        return None;
    }
    // VP8 keyframe start code.
    if data[3] != 0x9d || data[4] != 0x01 || data[5] != 0x2a {
        return None;
    }
    let width = u16::from_le_bytes([data[6], data[7]]) & 0x3FFF;
    let height = u16::from_le_bytes([data[8], data[9]]) & 0x3FFF;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let packet = make_packet(2, &[1, 2, 3, 4]);
        let (codec, frame) = parse_packet(&packet).unwrap();
        assert_eq!(codec, VideoCodec::H264);
        assert_eq!(codec.name(), "H264");
        assert_eq!(frame, &[1, 2, 3, 4]);
    }

    #[test]
    fn parse_rejects_bad_marker_and_codec() {
        assert!(parse_packet(&[0x08, 0, 1, 2]).is_none());
        assert!(parse_packet(&[0x07, 9, 1, 2]).is_none());
        assert!(parse_packet(&[0x07]).is_none());
    }

    #[test]
    fn vp8_keyframe_bit() {
        assert!(is_keyframe(VideoCodec::Vp8, &[0x00, 0, 0, 0]));
        assert!(!is_keyframe(VideoCodec::Vp8, &[0x01, 0, 0, 0]));
        // Too short to judge.
        assert!(!is_keyframe(VideoCodec::Vp8, &[0x00, 0]));
    }

    #[test]
    fn h264_idr_behind_both_start_codes() {
        let long = [0x00, 0x00, 0x00, 0x01, 0x65, 0xAA];
        let short = [0x00, 0x00, 0x01, 0x65, 0xAA];
        let non_idr = [0x00, 0x00, 0x00, 0x01, 0x41, 0xAA];
        assert!(is_keyframe(VideoCodec::H264, &long));
        assert!(is_keyframe(VideoCodec::H264, &short));
        assert!(!is_keyframe(VideoCodec::H264, &non_idr));
    }

    #[test]
    fn h265_irap_range() {
        // NAL type is bits 1..=6 of the byte after the start code.
        let idr = [0x00, 0x00, 0x00, 0x01, 19 << 1, 0xAA];
        let trail = [0x00, 0x00, 0x00, 0x01, 1 << 1, 0xAA];
        assert!(is_keyframe(VideoCodec::H265, &idr));
        assert!(!is_keyframe(VideoCodec::H265, &trail));
    }

    #[test]
    fn classify_requires_header() {
        let keyframe_packet = make_packet(0, &[0x00, 0, 0, 0]);
        let inter_packet = make_packet(0, &[0x01, 0, 0, 0]);
        assert!(classify_keyframe(&keyframe_packet));
        assert!(!classify_keyframe(&inter_packet));
        assert!(!classify_keyframe(&[0x00, 0, 0, 0]));
    }

    #[test]
    fn vp8_resolution_extraction() {
        let mut frame = vec![0x00, 0x00, 0x00, 0x9d, 0x01, 0x2a];
        frame.extend_from_slice(&640u16.to_le_bytes());
        frame.extend_from_slice(&480u16.to_le_bytes());
        assert_eq!(vp8_resolution(&frame), Some((640, 480)));
        // Inter-frame has no resolution header.
        frame[0] = 0x01;
        assert_eq!(vp8_resolution(&frame), None);
    }
}
