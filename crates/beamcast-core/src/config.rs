//! Negotiated per-session configuration and host-side stream settings.
//!
//! `VideoConfig`/`AudioConfig` arrive from the handshake layer and are
//! immutable for the lifetime of a session. `StreamSettings` and
//! `AutoBitrateSettings` are the host operator's knobs; the structs only
//! define the deserialisable shape and defaults — reading the config file
//! is the outer layer's job.

use serde::{Deserialize, Serialize};

use crate::types::{ChromaSampling, VideoCodec};

// MARK: - VideoConfig

/// Video encoding configuration requested by the remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    /// Requested framerate: plain fps when ≤ 1000, millifps above that.
    pub framerate: u32,
    /// Target bitrate in kilobits per second.
    pub bitrate_kbps: u32,
    pub slices_per_frame: u32,
    /// Maximum reference frames the client decoder holds.
    pub num_ref_frames: u32,
    /// Bit 0: colour range (0 limited, 1 full). Upper bits: SDR matrix
    /// (0 BT.601, 1 BT.709, 2 BT.2020).
    pub encoder_csc_mode: i32,
    pub codec: VideoCodec,
    /// Bit depth: 0 = 8-bit, > 0 = 10-bit (HDR when the display is in HDR mode).
    pub dynamic_range: i32,
    pub chroma_sampling_type: i32,
    pub enable_intra_refresh: bool,
    /// Requested display cadence, may differ from `framerate`.
    pub encoding_framerate: u32,
    pub input_only: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 60,
            bitrate_kbps: 20_000,
            slices_per_frame: 1,
            num_ref_frames: 1,
            encoder_csc_mode: 0,
            codec: VideoCodec::H264,
            dynamic_range: 0,
            chroma_sampling_type: 0,
            enable_intra_refresh: false,
            encoding_framerate: 60,
            input_only: false,
        }
    }
}

impl VideoConfig {
    /// Framerate in frames per second, decoding the millifps convention.
    pub fn fps(&self) -> f32 {
        if self.framerate > 1000 {
            self.framerate as f32 / 1000.0
        } else {
            self.framerate as f32
        }
    }

    /// Interval between frames at the target cadence.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.fps().max(1.0) as f64)
    }

    pub fn hdr(&self) -> bool {
        self.dynamic_range > 0
    }

    pub fn chroma(&self) -> ChromaSampling {
        ChromaSampling::from_wire(self.chroma_sampling_type)
    }

    /// 90 kHz RTP timestamp increment per frame.
    pub fn rtp_timestamp_step(&self) -> u32 {
        (90_000.0 / self.fps().max(1.0)) as u32
    }
}

// MARK: - Audio

/// Predefined Opus multistream layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusStreamConfig {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub streams: u8,
    pub coupled_streams: u8,
    pub mapping: [u8; 8],
    pub bitrate: u32,
}

/// The six negotiable layouts: stereo / 5.1 / 7.1, each in a normal and a
/// high-quality variant.
pub const STEREO: OpusStreamConfig = OpusStreamConfig {
    sample_rate: 48_000,
    channel_count: 2,
    streams: 1,
    coupled_streams: 1,
    mapping: [0, 1, 0, 0, 0, 0, 0, 0],
    bitrate: 96_000,
};

pub const HIGH_STEREO: OpusStreamConfig = OpusStreamConfig {
    bitrate: 512_000,
    ..STEREO
};

pub const SURROUND_51: OpusStreamConfig = OpusStreamConfig {
    sample_rate: 48_000,
    channel_count: 6,
    streams: 4,
    coupled_streams: 2,
    mapping: [0, 4, 1, 5, 2, 3, 0, 0],
    bitrate: 256_000,
};

pub const HIGH_SURROUND_51: OpusStreamConfig = OpusStreamConfig {
    streams: 6,
    coupled_streams: 0,
    mapping: [0, 1, 2, 3, 4, 5, 0, 0],
    bitrate: 1_536_000,
    ..SURROUND_51
};

pub const SURROUND_71: OpusStreamConfig = OpusStreamConfig {
    sample_rate: 48_000,
    channel_count: 8,
    streams: 5,
    coupled_streams: 3,
    mapping: [0, 6, 1, 7, 2, 3, 4, 5],
    bitrate: 450_000,
};

pub const HIGH_SURROUND_71: OpusStreamConfig = OpusStreamConfig {
    streams: 8,
    coupled_streams: 0,
    mapping: [0, 1, 2, 3, 4, 5, 6, 7],
    bitrate: 2_048_000,
    ..SURROUND_71
};

/// Audio configuration negotiated for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Opus packet duration in milliseconds (5 or 10 typically).
    pub packet_duration_ms: u32,
    pub channels: u8,
    pub channel_mask: u32,
    pub high_quality: bool,
    pub host_audio: bool,
    pub input_only: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            packet_duration_ms: 5,
            channels: 2,
            channel_mask: 0x3,
            high_quality: false,
            host_audio: false,
            input_only: false,
        }
    }
}

impl AudioConfig {
    pub fn stream_config(&self) -> OpusStreamConfig {
        match (self.channels, self.high_quality) {
            (6, false) => SURROUND_51,
            (6, true) => HIGH_SURROUND_51,
            (8, false) => SURROUND_71,
            (8, true) => HIGH_SURROUND_71,
            (_, true) => HIGH_STEREO,
            _ => STEREO,
        }
    }

    /// 48 kHz RTP timestamp increment per packet.
    pub fn rtp_timestamp_step(&self) -> u32 {
        self.packet_duration_ms * 48
    }
}

// MARK: - SessionConfig

/// Full configuration handed to `Session::alloc` by the handshake layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub video: VideoConfig,
    pub audio: AudioConfig,

    /// Maximum media payload bytes per datagram before framing overhead.
    pub packet_size: usize,
    pub min_required_fec_packets: u32,
    pub feature_flags: u32,
    pub control_protocol_type: i32,
    pub audio_qos_type: i32,
    pub video_qos_type: i32,
    pub encryption_flags_enabled: u32,
    pub gamepad_mask: Option<i32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            packet_size: 1024,
            min_required_fec_packets: 2,
            feature_flags: 0,
            control_protocol_type: 0,
            audio_qos_type: 0,
            video_qos_type: 0,
            encryption_flags_enabled: 0,
            gamepad_mask: None,
        }
    }
}

// MARK: - StreamSettings

/// Video encryption policy for a network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Never encrypt media, even if the client supports it.
    Never,
    /// Encrypt when the client supports it, stream plaintext otherwise.
    Opportunistic,
    /// Refuse clients that cannot encrypt.
    Mandatory,
}

/// Host-side stream-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub ping_timeout_ms: u64,
    /// Parity overhead for video FEC groups, in percent of data shards.
    pub fec_percentage: u32,
    pub lan_encryption_mode: EncryptionMode,
    pub wan_encryption_mode: EncryptionMode,
    /// Window the handshake must complete in before the session is dropped.
    pub handshake_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 10_000,
            fec_percentage: 20,
            lan_encryption_mode: EncryptionMode::Opportunistic,
            wan_encryption_mode: EncryptionMode::Mandatory,
            handshake_timeout_ms: 10_000,
        }
    }
}

// MARK: - AutoBitrateSettings

/// Operator configuration for the closed-loop bitrate controller.
///
/// Field names match the external config keys one-for-one
/// (`auto_bitrate_loss_severe_pct` → `loss_severe_pct`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBitrateSettings {
    /// Server-enforced floor in kbps.
    pub min_kbps: u32,
    /// Server-enforced ceiling in kbps (0 = defer to client / session).
    pub max_kbps: u32,
    /// Absolute cap from the `max_bitrate` key (0 = unconstrained).
    pub max_bitrate_cap: u32,
    /// Minimum time between any two adjustments.
    pub adjustment_interval_ms: u64,
    /// Smallest |factor − 1|·100 that is worth applying.
    pub min_adjustment_pct: u32,
    pub loss_severe_pct: u32,
    pub loss_moderate_pct: u32,
    pub loss_mild_pct: u32,
    pub decrease_severe_pct: u32,
    pub decrease_moderate_pct: u32,
    pub decrease_mild_pct: u32,
    pub increase_good_pct: u32,
    /// Clean-network duration required before any increase.
    pub good_stability_ms: u64,
    pub increase_min_interval_ms: u64,
    /// While the client reports POOR, cap the factor at 1 − this/100.
    pub poor_status_cap_pct: u32,
    /// Emit BITRATE_STATS every this many LOSS_STATS packets.
    pub stats_interval_packets: u32,
}

impl Default for AutoBitrateSettings {
    fn default() -> Self {
        Self {
            min_kbps: 1,
            max_kbps: 0,
            max_bitrate_cap: 0,
            adjustment_interval_ms: 3000,
            min_adjustment_pct: 5,
            loss_severe_pct: 10,
            loss_moderate_pct: 5,
            loss_mild_pct: 1,
            decrease_severe_pct: 25,
            decrease_moderate_pct: 12,
            decrease_mild_pct: 5,
            increase_good_pct: 5,
            good_stability_ms: 5000,
            increase_min_interval_ms: 3000,
            poor_status_cap_pct: 25,
            stats_interval_packets: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millifps_framerate_decodes() {
        let mut cfg = VideoConfig { framerate: 60, ..Default::default() };
        assert_eq!(cfg.fps(), 60.0);
        // 1000 is still plain fps; 1001 flips to millifps
        cfg.framerate = 1000;
        assert_eq!(cfg.fps(), 1000.0);
        cfg.framerate = 59_940;
        assert!((cfg.fps() - 59.94).abs() < 0.001);
    }

    #[test]
    fn surround_layouts_are_consistent() {
        for cfg in [STEREO, HIGH_STEREO, SURROUND_51, HIGH_SURROUND_51, SURROUND_71, HIGH_SURROUND_71] {
            assert!(cfg.streams >= cfg.coupled_streams);
            assert!(cfg.channel_count as usize <= cfg.mapping.len());
            assert_eq!(cfg.sample_rate, 48_000);
        }
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let s: AutoBitrateSettings = serde_json::from_str(r#"{"loss_severe_pct": 15}"#).unwrap();
        assert_eq!(s.loss_severe_pct, 15);
        assert_eq!(s.decrease_severe_pct, 25);
        assert_eq!(s.adjustment_interval_ms, 3000);
    }

    #[test]
    fn audio_timestamp_step_is_48khz() {
        let audio = AudioConfig { packet_duration_ms: 5, ..Default::default() };
        assert_eq!(audio.rtp_timestamp_step(), 240);
    }
}
