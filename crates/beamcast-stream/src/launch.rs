//! Launch-session handoff from the external pairing/RTSP layer.
//!
//! The RTSP-like handshake (outside this workspace) negotiates keys and
//! stream parameters, then hands the core one of these to allocate a
//! `Session` from.

use beamcast_core::{CommandEntry, Permissions};
use beamcast_crypto::GcmCipher;

/// Everything the handshake layer negotiated for one client launch.
pub struct LaunchSession {
    pub id: u32,

    /// AES-128 session key shared with the client.
    pub gcm_key: Vec<u8>,
    /// 16-byte launch IV; seeds the per-stream IVs and `avRiKeyId`.
    pub iv: Vec<u8>,

    /// Payload the client pings the AV sockets with to claim its endpoints.
    pub av_ping_payload: String,
    /// Matches the session across simultaneously-pending handshakes.
    pub control_connect_data: u32,

    pub device_name: String,
    pub device_uuid: String,
    pub permissions: Permissions,

    pub input_only: bool,
    pub host_audio: bool,
    pub auto_bitrate_enabled: bool,
    /// 0 = client did not specify.
    pub auto_bitrate_min_kbps: u32,
    pub auto_bitrate_max_kbps: u32,

    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub gamepad_mask: i32,
    pub surround_info: i32,
    pub surround_params: String,
    pub enable_hdr: bool,
    pub enable_sops: bool,
    pub virtual_display: bool,
    pub scale_factor: u32,

    /// Cipher for the encrypted RTSP replies, when the client negotiated
    /// `rtsps://`.
    pub rtsp_cipher: Option<GcmCipher>,
    pub rtsp_url_scheme: String,
    pub rtsp_iv_counter: u32,

    pub do_cmds: Vec<CommandEntry>,
    pub undo_cmds: Vec<CommandEntry>,
}

impl LaunchSession {
    /// Big-endian of the first four IV bytes; keys the audio shard cipher.
    pub fn av_ri_key_id(&self) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in self.iv.iter().take(4).enumerate() {
            bytes[i] = *b;
        }
        u32::from_be_bytes(bytes)
    }
}

#[cfg(test)]
pub(crate) fn test_launch_session() -> LaunchSession {
    LaunchSession {
        id: 1,
        gcm_key: vec![0x42; 16],
        iv: (0u8..16).collect(),
        av_ping_payload: "PING-PAYLOAD-0001".into(),
        control_connect_data: 0xdead_beef,
        device_name: "test-device".into(),
        device_uuid: "00000000-0000-0000-0000-000000000001".into(),
        permissions: Permissions::ALL,
        input_only: false,
        host_audio: false,
        auto_bitrate_enabled: true,
        auto_bitrate_min_kbps: 0,
        auto_bitrate_max_kbps: 0,
        width: 1920,
        height: 1080,
        fps: 60,
        gamepad_mask: 0,
        surround_info: 0,
        surround_params: String::new(),
        enable_hdr: false,
        enable_sops: false,
        virtual_display: false,
        scale_factor: 100,
        rtsp_cipher: None,
        rtsp_url_scheme: "rtsp://".into(),
        rtsp_iv_counter: 0,
        do_cmds: Vec::new(),
        undo_cmds: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn av_ri_key_id_is_big_endian_iv_prefix() {
        let launch = test_launch_session();
        // IV bytes 0,1,2,3 big-endian
        assert_eq!(launch.av_ri_key_id(), 0x0001_0203);
    }
}
