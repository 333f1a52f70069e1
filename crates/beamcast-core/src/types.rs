use serde::{Deserialize, Serialize};

// MARK: - VideoCodec

/// Video codec negotiated with the client.
///
/// Wire values follow the Moonlight convention: 0 = H.264, 1 = HEVC, 2 = AV1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

impl VideoCodec {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => Self::Hevc,
            2 => Self::Av1,
            _ => Self::H264,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::H264 => 0,
            Self::Hevc => 1,
            Self::Av1 => 2,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::Hevc => write!(f, "HEVC"),
            Self::Av1 => write!(f, "AV1"),
        }
    }
}

// MARK: - ChromaSampling

/// Chroma sampling mode. Wire: 0 = 4:2:0, 1 = 4:4:4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaSampling {
    Yuv420,
    Yuv444,
}

impl ChromaSampling {
    pub fn from_wire(value: i32) -> Self {
        if value == 1 {
            Self::Yuv444
        } else {
            Self::Yuv420
        }
    }
}

// MARK: - Colorspace

/// SDR encoding matrix, taken from the upper bits of `encoderCscMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMatrix {
    Bt601,
    Bt709,
    Bt2020,
}

/// Resolved colour description for the encoder and the SPS/VUI rewrite.
///
/// `encoderCscMode` packs the range bit in bit 0 and the SDR matrix in the
/// remaining bits; HDR always encodes as BT.2020 + ST 2084.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colorspace {
    pub matrix: ColorMatrix,
    pub full_range: bool,
    pub hdr: bool,
}

impl Colorspace {
    pub fn from_csc_mode(csc_mode: i32, hdr: bool) -> Self {
        let full_range = csc_mode & 0x1 != 0;
        let matrix = if hdr {
            ColorMatrix::Bt2020
        } else {
            match csc_mode >> 1 {
                1 => ColorMatrix::Bt709,
                2 => ColorMatrix::Bt2020,
                _ => ColorMatrix::Bt601,
            }
        };
        Self { matrix, full_range, hdr }
    }

    /// ISO/IEC 23001-8 colour primaries code point.
    pub fn primaries(&self) -> u8 {
        match (self.hdr, self.matrix) {
            (true, _) | (false, ColorMatrix::Bt2020) => 9,
            (false, ColorMatrix::Bt709) => 1,
            (false, ColorMatrix::Bt601) => 6,
        }
    }

    /// Transfer characteristics code point (ST 2084 when HDR).
    pub fn transfer(&self) -> u8 {
        if self.hdr {
            16
        } else {
            match self.matrix {
                ColorMatrix::Bt709 => 1,
                ColorMatrix::Bt601 => 6,
                ColorMatrix::Bt2020 => 14,
            }
        }
    }

    /// Matrix coefficients code point.
    pub fn matrix_coefficients(&self) -> u8 {
        match self.matrix {
            ColorMatrix::Bt709 => 1,
            ColorMatrix::Bt601 => 6,
            ColorMatrix::Bt2020 => 9,
        }
    }
}

// MARK: - RawPixelFormat

/// Pixel layout of frames handed over by the capture backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPixelFormat {
    Bgrx,
    Nv12,
    P010,
    Yuv444P,
}

impl RawPixelFormat {
    /// GStreamer caps format string for this layout.
    pub fn caps_name(self) -> &'static str {
        match self {
            Self::Bgrx => "BGRx",
            Self::Nv12 => "NV12",
            Self::P010 => "P010_10LE",
            Self::Yuv444P => "Y444",
        }
    }

    /// Bytes per frame for a given geometry.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Bgrx => pixels * 4,
            Self::Nv12 => pixels * 3 / 2,
            Self::P010 => pixels * 3,
            Self::Yuv444P => pixels * 3,
        }
    }
}

// MARK: - CapturedFrame

/// One raw frame from the capture backend.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: bytes::Bytes,
    pub width: u32,
    pub height: u32,
    pub format: RawPixelFormat,
    /// Monotonic frame counter assigned by the capture source.
    pub frame_number: u64,
}

// MARK: - HdrMetadata

/// Static HDR mastering metadata pushed to the client on display changes.
///
/// Chromaticity coordinates are in 0.00002 units, luminance in cd/m²
/// (max) and 0.0001 cd/m² (min), per CTA-861.3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrMetadata {
    pub display_primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),
    pub max_display_luminance: u16,
    pub min_display_luminance: u16,
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

/// HDR state change: metadata is only meaningful while `enabled`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HdrInfo {
    pub enabled: bool,
    pub metadata: HdrMetadata,
}

impl HdrInfo {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        let mut info = HdrInfo { enabled: payload[0] != 0, metadata: HdrMetadata::default() };
        if payload.len() >= 25 {
            let u16_at = |off: usize| u16::from_le_bytes([payload[off], payload[off + 1]]);
            for (i, primary) in info.metadata.display_primaries.iter_mut().enumerate() {
                *primary = (u16_at(1 + i * 4), u16_at(3 + i * 4));
            }
            info.metadata.white_point = (u16_at(13), u16_at(15));
            info.metadata.max_display_luminance = u16_at(17);
            info.metadata.min_display_luminance = u16_at(19);
            info.metadata.max_content_light_level = u16_at(21);
            info.metadata.max_frame_average_light_level = u16_at(23);
        }
        Some(info)
    }

    /// Little-endian payload for the HDR_INFO control message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        out.push(self.enabled as u8);
        for (x, y) in self.metadata.display_primaries {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out.extend_from_slice(&self.metadata.white_point.0.to_le_bytes());
        out.extend_from_slice(&self.metadata.white_point.1.to_le_bytes());
        out.extend_from_slice(&self.metadata.max_display_luminance.to_le_bytes());
        out.extend_from_slice(&self.metadata.min_display_luminance.to_le_bytes());
        out.extend_from_slice(&self.metadata.max_content_light_level.to_le_bytes());
        out.extend_from_slice(&self.metadata.max_frame_average_light_level.to_le_bytes());
        out
    }
}

// MARK: - CommandEntry

/// One pre/post-session command, executed by the external process runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub cmd: String,
    pub elevated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_wire_roundtrip() {
        for codec in [VideoCodec::H264, VideoCodec::Hevc, VideoCodec::Av1] {
            assert_eq!(VideoCodec::from_wire(codec.to_wire()), codec);
        }
        // Unknown values fall back to H.264
        assert_eq!(VideoCodec::from_wire(7), VideoCodec::H264);
    }

    #[test]
    fn csc_mode_unpacks_range_and_matrix() {
        let cs = Colorspace::from_csc_mode(0x3, false); // full range, BT.709
        assert!(cs.full_range);
        assert_eq!(cs.matrix, ColorMatrix::Bt709);
        assert_eq!(cs.matrix_coefficients(), 1);

        let cs = Colorspace::from_csc_mode(0x0, false); // limited, BT.601
        assert!(!cs.full_range);
        assert_eq!(cs.matrix, ColorMatrix::Bt601);

        // HDR overrides the SDR matrix selection entirely
        let cs = Colorspace::from_csc_mode(0x2, true);
        assert_eq!(cs.matrix, ColorMatrix::Bt2020);
        assert_eq!(cs.transfer(), 16);
    }

    #[test]
    fn hdr_info_payload_roundtrip() {
        let info = HdrInfo {
            enabled: true,
            metadata: HdrMetadata {
                display_primaries: [(100, 200), (300, 400), (500, 600)],
                white_point: (700, 800),
                max_display_luminance: 1000,
                min_display_luminance: 50,
                max_content_light_level: 900,
                max_frame_average_light_level: 400,
            },
        };
        let buf = info.encode();
        assert_eq!(buf.len(), 25);
        let parsed = HdrInfo::decode(&buf).unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.metadata, info.metadata);
    }
}
