//! Startup encoder probing.
//!
//! Walks the candidate list in priority order and performs a synthetic
//! encode per claimed codec: one solid 1280×720@60 SDR 4:2:0 frame must
//! come back as a packet within the deadline. Capability probes (HDR
//! 10-bit, 4:4:4, reference-frame restriction, VUI emission) then refine
//! the capability bits. The first backend with at least one PASSED codec
//! wins.
//!
//! Only safe to run while no session is streaming — encoders are a shared
//! hardware resource.

use std::time::Duration;

use tracing::{debug, info, warn};

use beamcast_bitstream::sps_has_valid_vui;
use beamcast_core::{
    CaptureSource, EncoderError, RawPixelFormat, SolidColorSource, VideoCodec, VideoConfig,
};

use crate::descriptor::{Capabilities, CodecSupport, EncoderDescriptor};
use crate::session::{element_has_property, EncodeSession, GstEncodeSession};

/// How long one synthetic encode may take before the codec is failed.
const PROBE_DEADLINE: Duration = Duration::from_millis(2500);

/// Per-codec results exported to the handshake layer so the client can pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveCodecs {
    pub hevc: bool,
    pub av1: bool,
    pub ref_frames_invalidation: bool,
    /// Indexed by wire codec id: H.264, HEVC, AV1.
    pub yuv444: [bool; 3],
}

fn probe_config(codec: VideoCodec) -> VideoConfig {
    VideoConfig {
        width: 1280,
        height: 720,
        framerate: 60,
        bitrate_kbps: 10_000,
        codec,
        ..Default::default()
    }
}

/// Feed one synthetic frame through a fresh session; true iff a packet
/// arrives in time.
async fn synthetic_encode(
    descriptor: &EncoderDescriptor,
    codec: &CodecSupport,
    config: &VideoConfig,
) -> bool {
    let mut session = match GstEncodeSession::new(descriptor, codec, config, RawPixelFormat::Bgrx) {
        Ok(s) => s,
        Err(e) => {
            debug!("{}/{}: session construction failed: {}", descriptor.name, codec.element, e);
            return false;
        }
    };
    let mut source = SolidColorSource::new(config.width, config.height, 60).with_frame_limit(1);
    let frame = match source.next_frame(Duration::from_millis(100)).await {
        Ok(Some(f)) => f,
        _ => return false,
    };
    if session.convert(&frame).is_err() {
        return false;
    }
    session.next_packet_timeout(PROBE_DEADLINE).await.is_some()
}

async fn probe_codec(descriptor: &EncoderDescriptor, codec: &mut CodecSupport) {
    let codec_kind = codec.codec;
    let base = probe_config(codec_kind);

    if gstreamer::ElementFactory::find(codec.element).is_none() {
        debug!("{}: element {} not present", descriptor.name, codec.element);
        return;
    }

    if !synthetic_encode(descriptor, codec, &base).await {
        warn!("{}/{} failed the synthetic encode", descriptor.name, codec.element);
        return;
    }
    codec.capabilities.set(Capabilities::PASSED, true);

    // HDR: 10-bit main-10 class encode
    let hdr = VideoConfig { dynamic_range: 1, ..base.clone() };
    if codec_kind != VideoCodec::H264 && synthetic_encode(descriptor, codec, &hdr).await {
        codec.capabilities.set(Capabilities::DYNAMIC_RANGE, true);
    }

    // 4:4:4 chroma
    let yuv444 = VideoConfig { chroma_sampling_type: 1, ..base.clone() };
    if synthetic_encode(descriptor, codec, &yuv444).await {
        codec.capabilities.set(Capabilities::YUV444, true);
    }

    // Reference-frame restriction: honoured iff the element exposes the
    // mapped ref-frames property.
    let ref_key = descriptor.kind.map_key("ref-frames");
    if element_has_property(codec.element, ref_key) {
        codec.capabilities.set(Capabilities::REF_FRAMES_RESTRICT, true);
    }

    // VUI: suspect backends must prove the SPS carries one.
    if descriptor.needs_vui_check {
        let has_vui = probe_vui(descriptor, codec, &base).await;
        codec.capabilities.set(Capabilities::VUI_PARAMETERS, has_vui);
    } else {
        codec.capabilities.set(Capabilities::VUI_PARAMETERS, true);
    }
}

async fn probe_vui(
    descriptor: &EncoderDescriptor,
    codec: &CodecSupport,
    config: &VideoConfig,
) -> bool {
    let Ok(mut session) = GstEncodeSession::new(descriptor, codec, config, RawPixelFormat::Bgrx)
    else {
        return false;
    };
    let mut source = SolidColorSource::new(config.width, config.height, 60).with_frame_limit(1);
    let Ok(Some(frame)) = source.next_frame(Duration::from_millis(100)).await else {
        return false;
    };
    if session.convert(&frame).is_err() {
        return false;
    }
    match session.next_packet_timeout(PROBE_DEADLINE).await {
        Some(packet) => sps_has_valid_vui(codec.codec, &packet.data),
        None => false,
    }
}

/// Probe all candidates; returns the selected descriptor and the exported
/// per-codec flags.
pub async fn probe_encoders(
    mut candidates: Vec<EncoderDescriptor>,
) -> Result<(EncoderDescriptor, ActiveCodecs), EncoderError> {
    for descriptor in candidates.iter_mut() {
        let available = gstreamer::ElementFactory::find(descriptor.h264.element).is_some()
            || gstreamer::ElementFactory::find(descriptor.hevc.element).is_some();
        if !available {
            debug!("Skipping {}: no elements present", descriptor.name);
            continue;
        }

        let mut h264 = std::mem::replace(&mut descriptor.h264, placeholder());
        probe_codec(descriptor, &mut h264).await;
        descriptor.h264 = h264;

        let mut hevc = std::mem::replace(&mut descriptor.hevc, placeholder());
        probe_codec(descriptor, &mut hevc).await;
        descriptor.hevc = hevc;

        if let Some(mut av1) = descriptor.av1.take() {
            probe_codec(descriptor, &mut av1).await;
            descriptor.av1 = Some(av1);
        }

        if descriptor.passed() {
            let active = ActiveCodecs {
                hevc: descriptor.hevc.passed(),
                av1: descriptor.av1.as_ref().is_some_and(|c| c.passed()),
                ref_frames_invalidation: descriptor
                    .h264
                    .capabilities
                    .contains(Capabilities::REF_FRAMES_RESTRICT),
                yuv444: [
                    descriptor.h264.capabilities.contains(Capabilities::YUV444),
                    descriptor.hevc.capabilities.contains(Capabilities::YUV444),
                    descriptor
                        .av1
                        .as_ref()
                        .map(|c| c.capabilities.contains(Capabilities::YUV444))
                        .unwrap_or(false),
                ],
            };
            info!(
                "Selected encoder {} (hevc={}, av1={})",
                descriptor.name, active.hevc, active.av1
            );
            return Ok((descriptor.clone(), active));
        }
    }

    Err(EncoderError::NoUsableEncoder { codec: "any" })
}

fn placeholder() -> CodecSupport {
    CodecSupport {
        codec: VideoCodec::H264,
        element: "identity",
        parser: "identity",
        output_caps: "video/x-h264",
        capabilities: Capabilities::default(),
        common_options: Vec::new(),
        sdr_options: Vec::new(),
        hdr_options: Vec::new(),
        sdr444_options: Vec::new(),
        hdr444_options: Vec::new(),
        fallback_options: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_config_is_720p60_sdr() {
        let cfg = probe_config(VideoCodec::H264);
        assert_eq!((cfg.width, cfg.height), (1280, 720));
        assert_eq!(cfg.fps(), 60.0);
        assert!(!cfg.hdr());
        assert_eq!(cfg.chroma_sampling_type, 0);
    }

    // Encode probing itself needs a GStreamer runtime with encoder elements
    // present; it runs in the host binary, not in unit tests.
}
