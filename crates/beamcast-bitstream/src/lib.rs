//! beamcast-bitstream — SPS/VUI post-processing for encoded access units.
//!
//! Some hardware encoders emit an SPS without VUI colour signalling, which
//! leaves the client guessing at range and matrix. This crate parses the
//! first access unit (and every IDR), and when the SPS lacks a VUI it
//! produces `(old, new)` byte replacements the sender splices in during
//! packetization — the encoder's output buffer itself is never touched.
//!
//! ```text
//! encoder AU ──► split NALs ──► SPS? ──► parse to vui_flag
//!                                          ├─ VUI present → no-op
//!                                          └─ absent → rewrite RBSP,
//!                                             re-escape, emit Replacement
//! ```

pub mod bits;
pub mod h264;
pub mod hevc;
pub mod nal;

use beamcast_core::{Colorspace, Replacement, VideoCodec};
use thiserror::Error;
use tracing::{debug, warn};

use bits::{escape_rbsp, unescape_rbsp, BitReader};
use nal::{h264_nal_type, hevc_nal_type, split_nal_units, NalUnit, H264_NAL_SPS, HEVC_NAL_SPS};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("Ran out of bits")]
    OutOfBits,

    #[error("Malformed bitstream: {0}")]
    Malformed(&'static str),

    #[error("Access unit contains no SPS")]
    NoSps,
}

// ── VuiParams ─────────────────────────────────────────────────────────────────

/// Colour signalling written into an inserted VUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuiParams {
    pub video_full_range: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

impl From<Colorspace> for VuiParams {
    fn from(cs: Colorspace) -> Self {
        Self {
            video_full_range: cs.full_range,
            colour_primaries: cs.primaries(),
            transfer_characteristics: cs.transfer(),
            matrix_coefficients: cs.matrix_coefficients(),
        }
    }
}

// ── Public entry points ───────────────────────────────────────────────────────

/// Post-process one access unit: returns the replacement list the sender
/// applies in order. Empty when the SPS already carries a VUI, when there is
/// no SPS in this AU, or for codecs without SPS post-processing (AV1).
pub fn make_sps_replacements(codec: VideoCodec, au: &[u8], vui: &VuiParams) -> Vec<Replacement> {
    let result = match codec {
        VideoCodec::H264 => process_h264(au, vui),
        VideoCodec::Hevc => process_hevc(au, vui),
        VideoCodec::Av1 => Ok(Vec::new()),
    };
    match result {
        Ok(replacements) => replacements,
        Err(BitstreamError::NoSps) => Vec::new(),
        Err(e) => {
            warn!("SPS post-processing skipped: {}", e);
            Vec::new()
        }
    }
}

/// True when the access unit's SPS contains a VUI that parses cleanly.
/// Used by encoder probing to set the VUI_PARAMETERS capability.
pub fn sps_has_valid_vui(codec: VideoCodec, au: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => h264_sps(au).ok().is_some_and(|(_, rbsp)| {
            let Ok(layout) = h264::parse_sps(&rbsp) else {
                return false;
            };
            if !layout.vui_present {
                return false;
            }
            let mut r = BitReader::new(&rbsp);
            r.skip(layout.vui_flag_pos as u32 + 1).is_ok() && h264::parse_vui(&mut r).is_ok()
        }),
        VideoCodec::Hevc => hevc_sps(au).ok().is_some_and(|(_, rbsp)| {
            let Ok(layout) = hevc::parse_sps(&rbsp) else {
                return false;
            };
            if !layout.vui_present {
                return false;
            }
            let mut r = BitReader::new(&rbsp);
            r.skip(layout.vui_flag_pos as u32 + 1).is_ok()
                && hevc::parse_vui(&mut r, layout.max_sub_layers_minus1).is_ok()
        }),
        VideoCodec::Av1 => true,
    }
}

// ── Per-codec plumbing ────────────────────────────────────────────────────────

fn h264_sps(au: &[u8]) -> Result<(NalUnit, Vec<u8>), BitstreamError> {
    let unit = split_nal_units(au)
        .into_iter()
        .find(|u| h264_nal_type(u.payload(au)) == Some(H264_NAL_SPS))
        .ok_or(BitstreamError::NoSps)?;
    let payload = unit.payload(au);
    if payload.len() < 2 {
        return Err(BitstreamError::Malformed("SPS too short"));
    }
    Ok((unit, unescape_rbsp(&payload[1..])))
}

fn hevc_sps(au: &[u8]) -> Result<(NalUnit, Vec<u8>), BitstreamError> {
    let unit = split_nal_units(au)
        .into_iter()
        .find(|u| hevc_nal_type(u.payload(au)) == Some(HEVC_NAL_SPS))
        .ok_or(BitstreamError::NoSps)?;
    let payload = unit.payload(au);
    if payload.len() < 3 {
        return Err(BitstreamError::Malformed("SPS too short"));
    }
    Ok((unit, unescape_rbsp(&payload[2..])))
}

fn process_h264(au: &[u8], vui: &VuiParams) -> Result<Vec<Replacement>, BitstreamError> {
    let (unit, rbsp) = h264_sps(au)?;
    let layout = h264::parse_sps(&rbsp)?;
    if layout.vui_present {
        debug!("H.264 SPS already has a VUI");
        return Ok(Vec::new());
    }
    let new_rbsp = h264::insert_vui(&rbsp, &layout, vui)?;
    Ok(vec![rebuild_sps(au, &unit, 1, &new_rbsp)])
}

fn process_hevc(au: &[u8], vui: &VuiParams) -> Result<Vec<Replacement>, BitstreamError> {
    let (unit, rbsp) = hevc_sps(au)?;
    let layout = hevc::parse_sps(&rbsp)?;
    if layout.vui_present {
        debug!("HEVC SPS already has a VUI");
        return Ok(Vec::new());
    }
    let new_rbsp = hevc::insert_vui(&rbsp, &layout, vui)?;
    Ok(vec![rebuild_sps(au, &unit, 2, &new_rbsp)])
}

fn rebuild_sps(au: &[u8], unit: &NalUnit, header_len: usize, new_rbsp: &[u8]) -> Replacement {
    let old = unit.full_range(au);
    let mut new = Vec::with_capacity(old.len() + 16);
    new.extend_from_slice(&au[unit.start_code_offset..unit.payload_offset + header_len]);
    new.extend_from_slice(&escape_rbsp(new_rbsp));
    Replacement::new(old.to_vec(), new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bits::BitWriter;

    fn synth_h264_sps_rbsp(with_vui: bool, vui: &VuiParams) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bits(66, 8); // profile_idc: baseline
        w.write_bits(0, 8); // constraint flags
        w.write_bits(31, 8); // level_idc
        w.write_ue(0); // sps_id
        w.write_ue(0); // log2_max_frame_num_minus4
        w.write_ue(0); // pic_order_cnt_type
        w.write_ue(0); // log2_max_pic_order_cnt_lsb_minus4
        w.write_ue(1); // max_num_ref_frames
        w.write_bit(false); // gaps_in_frame_num
        w.write_ue(79); // pic_width_in_mbs_minus1 (1280)
        w.write_ue(44); // pic_height_in_map_units_minus1 (720)
        w.write_bit(true); // frame_mbs_only
        w.write_bit(true); // direct_8x8_inference
        w.write_bit(false); // frame_cropping
        w.write_bit(with_vui); // vui_parameters_present
        if with_vui {
            h264::write_vui(&mut w, vui);
        }
        w.finish_rbsp()
    }

    fn synth_hevc_sps_rbsp() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bits(0, 4); // sps_video_parameter_set_id
        w.write_bits(0, 3); // sps_max_sub_layers_minus1
        w.write_bit(true); // sps_temporal_id_nesting
        // profile_tier_level: 96 bits, contents irrelevant to the parser
        w.write_bits(0x01, 8);
        w.write_bits(0x6000_0000, 32);
        w.write_bits(0, 32);
        w.write_bits(0, 16);
        w.write_bits(93, 8); // general_level_idc
        w.write_ue(0); // sps_seq_parameter_set_id
        w.write_ue(1); // chroma_format_idc 4:2:0
        w.write_ue(1280);
        w.write_ue(720);
        w.write_bit(false); // conformance_window
        w.write_ue(0); // bit_depth_luma_minus8
        w.write_ue(0); // bit_depth_chroma_minus8
        w.write_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.write_bit(true); // sub_layer_ordering_info_present
        w.write_ue(1); // sps_max_dec_pic_buffering_minus1
        w.write_ue(0); // sps_max_num_reorder_pics
        w.write_ue(0); // sps_max_latency_increase_plus1
        w.write_ue(0); // log2_min_luma_coding_block_size_minus3
        w.write_ue(2); // log2_diff_max_min_luma_coding_block_size
        w.write_ue(0); // log2_min_luma_transform_block_size_minus2
        w.write_ue(2); // log2_diff_max_min_luma_transform_block_size
        w.write_ue(0); // max_transform_hierarchy_depth_inter
        w.write_ue(0); // max_transform_hierarchy_depth_intra
        w.write_bit(false); // scaling_list_enabled
        w.write_bit(false); // amp_enabled
        w.write_bit(true); // sample_adaptive_offset_enabled
        w.write_bit(false); // pcm_enabled
        w.write_ue(0); // num_short_term_ref_pic_sets
        w.write_bit(false); // long_term_ref_pics_present
        w.write_bit(true); // sps_temporal_mvp_enabled
        w.write_bit(true); // strong_intra_smoothing_enabled
        w.write_bit(false); // vui_parameters_present
        w.write_bit(false); // sps_extension_present
        w.finish_rbsp()
    }

    fn h264_au(rbsp: &[u8]) -> Vec<u8> {
        let mut au = vec![0x00, 0x00, 0x00, 0x01, 0x67];
        au.extend_from_slice(&escape_rbsp(rbsp));
        // Trailing IDR slice NAL so the SPS is not the only unit
        au.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0x88, 0x84]);
        au
    }

    fn hevc_au(rbsp: &[u8]) -> Vec<u8> {
        let mut au = vec![0x00, 0x00, 0x00, 0x01, 0x42, 0x01];
        au.extend_from_slice(&escape_rbsp(rbsp));
        au.extend_from_slice(&[0x00, 0x00, 0x01, 0x26, 0x01, 0xaf]);
        au
    }

    const TEST_VUI: VuiParams = VuiParams {
        video_full_range: false,
        colour_primaries: 1,
        transfer_characteristics: 1,
        matrix_coefficients: 1,
    };

    #[test]
    fn h264_missing_vui_gets_inserted() {
        let au = h264_au(&synth_h264_sps_rbsp(false, &TEST_VUI));
        assert!(!sps_has_valid_vui(VideoCodec::H264, &au));

        let reps = make_sps_replacements(VideoCodec::H264, &au, &TEST_VUI);
        assert_eq!(reps.len(), 1);
        assert!(reps[0].new.len() > reps[0].old.len());

        let patched = Replacement::apply_all(&reps, &au);
        assert!(sps_has_valid_vui(VideoCodec::H264, &patched));
    }

    #[test]
    fn h264_existing_vui_is_noop() {
        let au = h264_au(&synth_h264_sps_rbsp(true, &TEST_VUI));
        assert!(sps_has_valid_vui(VideoCodec::H264, &au));
        assert!(make_sps_replacements(VideoCodec::H264, &au, &TEST_VUI).is_empty());
    }

    #[test]
    fn h264_insertion_is_idempotent() {
        let au = h264_au(&synth_h264_sps_rbsp(false, &TEST_VUI));
        let patched = Replacement::apply_all(&make_sps_replacements(VideoCodec::H264, &au, &TEST_VUI), &au);
        assert!(make_sps_replacements(VideoCodec::H264, &patched, &TEST_VUI).is_empty());
    }

    #[test]
    fn hevc_missing_vui_gets_inserted() {
        let au = hevc_au(&synth_hevc_sps_rbsp());
        assert!(!sps_has_valid_vui(VideoCodec::Hevc, &au));

        let reps = make_sps_replacements(VideoCodec::Hevc, &au, &TEST_VUI);
        assert_eq!(reps.len(), 1);

        let patched = Replacement::apply_all(&reps, &au);
        assert!(sps_has_valid_vui(VideoCodec::Hevc, &patched));
        // Second pass sees the VUI and leaves the AU alone
        assert!(make_sps_replacements(VideoCodec::Hevc, &patched, &TEST_VUI).is_empty());
    }

    #[test]
    fn au_without_sps_produces_nothing() {
        let au = [0x00, 0x00, 0x01, 0x61, 0xde, 0xad]; // non-IDR slice only
        assert!(make_sps_replacements(VideoCodec::H264, &au, &TEST_VUI).is_empty());
    }

    #[test]
    fn av1_is_passthrough() {
        assert!(make_sps_replacements(VideoCodec::Av1, &[1, 2, 3], &TEST_VUI).is_empty());
        assert!(sps_has_valid_vui(VideoCodec::Av1, &[1, 2, 3]));
    }
}
