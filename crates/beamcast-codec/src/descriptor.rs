//! Encoder capability descriptors.
//!
//! One descriptor per backend, one `CodecSupport` per codec the backend
//! claims. Probing mutates the capability bits, so descriptors are owned
//! values built by the constructor functions below and injected into
//! sessions — never global statics.
//!
//! | Backend  | H.264 element | HEVC element  | AV1 element |
//! |----------|---------------|---------------|-------------|
//! | nvenc    | `nvh264enc`   | `nvh265enc`   | `nvav1enc`  |
//! | vaapi    | `vah264enc`   | `vah265enc`   | `vaav1enc`  |
//! | software | `x264enc`     | `x265enc`     | —           |

use beamcast_core::{RawPixelFormat, VideoCodec, VideoConfig};

use crate::options::EncoderOption;

// ── Capabilities ──────────────────────────────────────────────────────────────

/// Capability bitset for one (backend × codec) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    /// The probe obtained a packet from this codec.
    pub const PASSED: Capabilities = Capabilities(1 << 0);
    /// The backend honours a maximum-reference-frames option.
    pub const REF_FRAMES_RESTRICT: Capabilities = Capabilities(1 << 1);
    /// 10-bit HDR encode passed.
    pub const DYNAMIC_RANGE: Capabilities = Capabilities(1 << 2);
    /// 4:4:4 encode passed.
    pub const YUV444: Capabilities = Capabilities(1 << 3);
    /// The emitted SPS carries a usable VUI.
    pub const VUI_PARAMETERS: Capabilities = Capabilities(1 << 4);

    pub fn contains(self, flag: Capabilities) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: Capabilities, value: bool) {
        if value {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

// ── CodecSupport ──────────────────────────────────────────────────────────────

/// Per-codec slice of a backend descriptor.
#[derive(Debug, Clone)]
pub struct CodecSupport {
    pub codec: VideoCodec,
    /// GStreamer element implementing this codec on this backend.
    pub element: &'static str,
    /// Parser element appended after the encoder.
    pub parser: &'static str,
    /// Caps string constraining the encoder output.
    pub output_caps: &'static str,
    pub capabilities: Capabilities,

    pub common_options: Vec<EncoderOption>,
    pub sdr_options: Vec<EncoderOption>,
    pub hdr_options: Vec<EncoderOption>,
    pub sdr444_options: Vec<EncoderOption>,
    pub hdr444_options: Vec<EncoderOption>,
    pub fallback_options: Vec<EncoderOption>,
}

impl CodecSupport {
    /// Option set for the session's dynamic-range / chroma combination,
    /// appended to `common_options`.
    pub fn options_for(&self, config: &VideoConfig) -> Vec<&EncoderOption> {
        let specific: &[EncoderOption] = match (config.hdr(), config.chroma_sampling_type) {
            (false, 0) => &self.sdr_options,
            (true, 0) => &self.hdr_options,
            (false, _) => &self.sdr444_options,
            (true, _) => &self.hdr444_options,
        };
        self.common_options.iter().chain(specific.iter()).collect()
    }

    pub fn passed(&self) -> bool {
        self.capabilities.contains(Capabilities::PASSED)
    }
}

// ── EncoderKind ───────────────────────────────────────────────────────────────

/// The closed set of encoder backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Nvenc,
    Vaapi,
    Software,
}

impl EncoderKind {
    /// Map a descriptor option name to this backend's element property.
    /// Names not listed pass through unchanged.
    pub fn map_key(self, name: &'static str) -> &'static str {
        match (self, name) {
            (Self::Nvenc, "quality-preset") => "preset",
            (Self::Vaapi, "quality-preset") => "quality-level",
            (Self::Software, "quality-preset") => "speed-preset",
            (Self::Software, "ref-frames") => "ref",
            (Self::Nvenc, "ref-frames") => "max-ref-frames",
            (Self::Vaapi, "ref-frames") => "ref-frames",
            (Self::Software, "gop-size") => "key-int-max",
            (Self::Vaapi, "gop-size") => "key-int-max",
            (Self::Nvenc, "gop-size") => "gop-size",
            _ => name,
        }
    }
}

// ── EncoderDescriptor ─────────────────────────────────────────────────────────

/// Everything the pipeline needs to know about one encoder backend.
#[derive(Debug, Clone)]
pub struct EncoderDescriptor {
    pub name: &'static str,
    pub kind: EncoderKind,

    pub pix_fmt_8bit: RawPixelFormat,
    pub pix_fmt_10bit: RawPixelFormat,
    pub pix_fmt_yuv444_8bit: RawPixelFormat,
    pub pix_fmt_yuv444_10bit: RawPixelFormat,

    /// Some VA-API paths omit the VUI; their probe must parse the SPS.
    pub needs_vui_check: bool,

    pub h264: CodecSupport,
    pub hevc: CodecSupport,
    pub av1: Option<CodecSupport>,
}

impl EncoderDescriptor {
    pub fn codec_from_config(&self, config: &VideoConfig) -> Option<&CodecSupport> {
        match config.codec {
            VideoCodec::H264 => Some(&self.h264),
            VideoCodec::Hevc => Some(&self.hevc),
            VideoCodec::Av1 => self.av1.as_ref(),
        }
    }

    pub fn codec_from_config_mut(&mut self, config: &VideoConfig) -> Option<&mut CodecSupport> {
        match config.codec {
            VideoCodec::H264 => Some(&mut self.h264),
            VideoCodec::Hevc => Some(&mut self.hevc),
            VideoCodec::Av1 => self.av1.as_mut(),
        }
    }

    /// Input pixel format for the session's bit depth / chroma.
    pub fn pix_fmt_for(&self, config: &VideoConfig) -> RawPixelFormat {
        match (config.hdr(), config.chroma_sampling_type) {
            (false, 0) => self.pix_fmt_8bit,
            (true, 0) => self.pix_fmt_10bit,
            (false, _) => self.pix_fmt_yuv444_8bit,
            (true, _) => self.pix_fmt_yuv444_10bit,
        }
    }

    /// Usable at all: at least one codec passed probing.
    pub fn passed(&self) -> bool {
        self.h264.passed() || self.hevc.passed() || self.av1.as_ref().is_some_and(|c| c.passed())
    }
}

// ── Backend constructors ──────────────────────────────────────────────────────

fn gop_from_config(config: &VideoConfig) -> i64 {
    if config.enable_intra_refresh {
        // Intra refresh replaces periodic IDRs; effectively open GOP.
        i64::from(i32::MAX)
    } else {
        // IDR on demand only; Moonlight drives keyframes via control messages.
        (config.fps() as i64) * 10
    }
}

fn codec_support(
    codec: VideoCodec,
    element: &'static str,
    parser: &'static str,
    output_caps: &'static str,
    common: Vec<EncoderOption>,
) -> CodecSupport {
    CodecSupport {
        codec,
        element,
        parser,
        output_caps,
        capabilities: Capabilities::default(),
        common_options: common,
        sdr_options: Vec::new(),
        hdr_options: Vec::new(),
        sdr444_options: Vec::new(),
        hdr444_options: Vec::new(),
        fallback_options: Vec::new(),
    }
}

const H264_CAPS: &str = "video/x-h264,stream-format=byte-stream,alignment=au";
const H265_CAPS: &str = "video/x-h265,stream-format=byte-stream,alignment=au";
const AV1_CAPS: &str = "video/x-av1";

const H264_PARSE: &str = "h264parse config-interval=-1";
const H265_PARSE: &str = "h265parse config-interval=-1";
const AV1_PARSE: &str = "av1parse";

/// NVIDIA NVENC family.
pub fn nvenc() -> EncoderDescriptor {
    let common = || {
        vec![
            EncoderOption::int_fn("bitrate", |c| c.bitrate_kbps as i64),
            EncoderOption::int_fn("gop-size", gop_from_config),
            EncoderOption::str("rc-mode", "cbr"),
            EncoderOption::str("quality-preset", "low-latency-hq"),
            EncoderOption::int("zerolatency", 1),
        ]
    };
    EncoderDescriptor {
        name: "nvenc",
        kind: EncoderKind::Nvenc,
        pix_fmt_8bit: RawPixelFormat::Nv12,
        pix_fmt_10bit: RawPixelFormat::P010,
        pix_fmt_yuv444_8bit: RawPixelFormat::Yuv444P,
        pix_fmt_yuv444_10bit: RawPixelFormat::Yuv444P,
        needs_vui_check: false,
        h264: codec_support(VideoCodec::H264, "nvh264enc", H264_PARSE, H264_CAPS, common()),
        hevc: codec_support(VideoCodec::Hevc, "nvh265enc", H265_PARSE, H265_CAPS, common()),
        av1: Some(codec_support(VideoCodec::Av1, "nvav1enc", AV1_PARSE, AV1_CAPS, common())),
    }
}

/// VA-API (Intel/AMD).
pub fn vaapi() -> EncoderDescriptor {
    let common = || {
        vec![
            EncoderOption::int_fn("bitrate", |c| c.bitrate_kbps as i64),
            EncoderOption::int_fn("gop-size", gop_from_config),
            EncoderOption::str("rate-control", "cbr"),
            EncoderOption::int_fn("ref-frames", |c| c.num_ref_frames as i64),
        ]
    };
    EncoderDescriptor {
        name: "vaapi",
        kind: EncoderKind::Vaapi,
        pix_fmt_8bit: RawPixelFormat::Nv12,
        pix_fmt_10bit: RawPixelFormat::P010,
        pix_fmt_yuv444_8bit: RawPixelFormat::Yuv444P,
        pix_fmt_yuv444_10bit: RawPixelFormat::Yuv444P,
        needs_vui_check: true,
        h264: codec_support(VideoCodec::H264, "vah264enc", H264_PARSE, H264_CAPS, common()),
        hevc: codec_support(VideoCodec::Hevc, "vah265enc", H265_PARSE, H265_CAPS, common()),
        av1: Some(codec_support(VideoCodec::Av1, "vaav1enc", AV1_PARSE, AV1_CAPS, common())),
    }
}

/// CPU fallback.
pub fn software() -> EncoderDescriptor {
    let h264_common = vec![
        EncoderOption::int_fn("bitrate", |c| c.bitrate_kbps as i64),
        EncoderOption::int_fn("gop-size", gop_from_config),
        EncoderOption::str("tune", "zerolatency"),
        EncoderOption::str("quality-preset", "veryfast"),
        EncoderOption::int_fn("ref-frames", |c| c.num_ref_frames as i64),
        EncoderOption::int_fn("threads", |c| {
            if c.width >= 2560 { 4 } else { 2 }
        }),
    ];
    let h265_common = vec![
        EncoderOption::int_fn("bitrate", |c| c.bitrate_kbps as i64),
        EncoderOption::str("tune", "zerolatency"),
        EncoderOption::str("speed-preset", "ultrafast"),
        EncoderOption::int_fn("key-int-max", gop_from_config),
    ];
    EncoderDescriptor {
        name: "software",
        kind: EncoderKind::Software,
        pix_fmt_8bit: RawPixelFormat::Nv12,
        pix_fmt_10bit: RawPixelFormat::P010,
        pix_fmt_yuv444_8bit: RawPixelFormat::Yuv444P,
        pix_fmt_yuv444_10bit: RawPixelFormat::Yuv444P,
        needs_vui_check: false,
        h264: codec_support(VideoCodec::H264, "x264enc", H264_PARSE, H264_CAPS, h264_common),
        hevc: codec_support(VideoCodec::Hevc, "x265enc", H265_PARSE, H265_CAPS, h265_common),
        av1: None,
    }
}

/// Probe order, best first.
pub fn candidates() -> Vec<EncoderDescriptor> {
    vec![nvenc(), vaapi(), software()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_bits_are_independent() {
        let mut caps = Capabilities::default();
        caps.set(Capabilities::PASSED, true);
        caps.set(Capabilities::YUV444, true);
        assert!(caps.contains(Capabilities::PASSED));
        assert!(caps.contains(Capabilities::YUV444));
        assert!(!caps.contains(Capabilities::DYNAMIC_RANGE));
        caps.set(Capabilities::PASSED, false);
        assert!(!caps.contains(Capabilities::PASSED));
        assert!(caps.contains(Capabilities::YUV444));
    }

    #[test]
    fn option_set_selection_follows_config() {
        let desc = software();
        let sdr = VideoConfig::default();
        let hdr = VideoConfig { dynamic_range: 1, ..Default::default() };
        // SDR 4:2:0 picks common + sdr sets only
        assert_eq!(
            desc.h264.options_for(&sdr).len(),
            desc.h264.common_options.len() + desc.h264.sdr_options.len()
        );
        assert_eq!(desc.pix_fmt_for(&sdr), RawPixelFormat::Nv12);
        assert_eq!(desc.pix_fmt_for(&hdr), RawPixelFormat::P010);
    }

    #[test]
    fn key_dictionary_maps_per_backend() {
        assert_eq!(EncoderKind::Software.map_key("ref-frames"), "ref");
        assert_eq!(EncoderKind::Vaapi.map_key("ref-frames"), "ref-frames");
        assert_eq!(EncoderKind::Nvenc.map_key("quality-preset"), "preset");
        assert_eq!(EncoderKind::Nvenc.map_key("bitrate"), "bitrate");
    }

    #[test]
    fn probe_order_prefers_hardware() {
        let c = candidates();
        assert_eq!(c.first().map(|d| d.name), Some("nvenc"));
        assert_eq!(c.last().map(|d| d.name), Some("software"));
    }
}
