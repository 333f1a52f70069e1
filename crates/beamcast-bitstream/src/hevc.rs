//! HEVC sequence-parameter-set parsing and VUI insertion.

use crate::bits::{BitReader, BitWriter};
use crate::{BitstreamError, VuiParams};

pub struct SpsLayout {
    pub vui_flag_pos: usize,
    pub vui_present: bool,
    pub max_sub_layers_minus1: u32,
}

/// Parse an HEVC SPS RBSP (unescaped, 2-byte NAL header stripped) up to and
/// including `vui_parameters_present_flag`.
pub fn parse_sps(rbsp: &[u8]) -> Result<SpsLayout, BitstreamError> {
    let mut r = BitReader::new(rbsp);

    r.skip(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)?;
    r.skip(1)?; // sps_temporal_id_nesting_flag
    skip_profile_tier_level(&mut r, max_sub_layers_minus1)?;

    r.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc == 3 {
        r.skip(1)?; // separate_colour_plane_flag
    }
    r.read_ue()?; // pic_width_in_luma_samples
    r.read_ue()?; // pic_height_in_luma_samples
    if r.read_bit()? {
        // conformance_window_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    r.read_ue()?; // bit_depth_luma_minus8
    r.read_ue()?; // bit_depth_chroma_minus8
    let log2_max_poc_lsb = r.read_ue()? + 4;
    let ordering_info_present = r.read_bit()?;
    let ordering_start = if ordering_info_present { 0 } else { max_sub_layers_minus1 };
    for _ in ordering_start..=max_sub_layers_minus1 {
        r.read_ue()?; // sps_max_dec_pic_buffering_minus1
        r.read_ue()?; // sps_max_num_reorder_pics
        r.read_ue()?; // sps_max_latency_increase_plus1
    }
    r.read_ue()?; // log2_min_luma_coding_block_size_minus3
    r.read_ue()?; // log2_diff_max_min_luma_coding_block_size
    r.read_ue()?; // log2_min_luma_transform_block_size_minus2
    r.read_ue()?; // log2_diff_max_min_luma_transform_block_size
    r.read_ue()?; // max_transform_hierarchy_depth_inter
    r.read_ue()?; // max_transform_hierarchy_depth_intra
    if r.read_bit()? {
        // scaling_list_enabled_flag
        if r.read_bit()? {
            skip_scaling_list_data(&mut r)?;
        }
    }
    r.skip(1)?; // amp_enabled_flag
    r.skip(1)?; // sample_adaptive_offset_enabled_flag
    if r.read_bit()? {
        // pcm_enabled_flag
        r.skip(4)?; // pcm_sample_bit_depth_luma_minus1
        r.skip(4)?; // pcm_sample_bit_depth_chroma_minus1
        r.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        r.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        r.skip(1)?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_ref_pic_sets = r.read_ue()?;
    if num_short_term_ref_pic_sets > 64 {
        return Err(BitstreamError::Malformed("too many short-term RPS"));
    }
    let mut num_delta_pocs = vec![0u32; num_short_term_ref_pic_sets as usize];
    for idx in 0..num_short_term_ref_pic_sets as usize {
        skip_st_ref_pic_set(&mut r, idx, &mut num_delta_pocs)?;
    }

    if r.read_bit()? {
        // long_term_ref_pics_present_flag
        let count = r.read_ue()?;
        for _ in 0..count {
            r.skip(log2_max_poc_lsb)?; // lt_ref_pic_poc_lsb_sps
            r.skip(1)?; // used_by_curr_pic_lt_sps_flag
        }
    }
    r.skip(1)?; // sps_temporal_mvp_enabled_flag
    r.skip(1)?; // strong_intra_smoothing_enabled_flag

    let vui_flag_pos = r.position();
    let vui_present = r.read_bit()?;
    Ok(SpsLayout { vui_flag_pos, vui_present, max_sub_layers_minus1 })
}

fn skip_profile_tier_level(r: &mut BitReader<'_>, max_sub_layers_minus1: u32) -> Result<(), BitstreamError> {
    r.skip(8)?; // profile_space + tier + profile_idc
    r.skip(32)?; // profile_compatibility_flags
    r.skip(48)?; // progressive/interlaced/non-packed/frame-only + 43 reserved + inbld
    r.skip(8)?; // general_level_idc

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.read_bit()?;
        level_present[i] = r.read_bit()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.skip(88)?;
        }
        if level_present[i] {
            r.skip(8)?;
        }
    }
    Ok(())
}

fn skip_scaling_list_data(r: &mut BitReader<'_>) -> Result<(), BitstreamError> {
    for size_id in 0..4u32 {
        let matrices = if size_id == 3 { 2 } else { 6 };
        for _ in 0..matrices {
            if !r.read_bit()? {
                // scaling_list_pred_mode_flag == 0
                r.read_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                let coefs = 64.min(1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    r.read_se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coefs {
                    r.read_se()?; // scaling_list_delta_coef
                }
            }
        }
    }
    Ok(())
}

fn skip_st_ref_pic_set(
    r: &mut BitReader<'_>,
    idx: usize,
    num_delta_pocs: &mut [u32],
) -> Result<(), BitstreamError> {
    let inter_prediction = if idx != 0 { r.read_bit()? } else { false };
    if inter_prediction {
        // In an SPS, the reference set is always the previous one.
        r.skip(1)?; // delta_rps_sign
        r.read_ue()?; // abs_delta_rps_minus1
        let ref_count = num_delta_pocs[idx - 1];
        let mut kept = 0u32;
        for _ in 0..=ref_count {
            let used = r.read_bit()?;
            let use_delta = if !used { r.read_bit()? } else { true };
            if used || use_delta {
                kept += 1;
            }
        }
        // Upper bound; exact count needs delta-POC reconstruction, which the
        // post-processor never consumes.
        num_delta_pocs[idx] = kept;
    } else {
        let negatives = r.read_ue()?;
        let positives = r.read_ue()?;
        if negatives.saturating_add(positives) > 32 {
            return Err(BitstreamError::Malformed("oversized ref pic set"));
        }
        for _ in 0..negatives + positives {
            r.read_ue()?; // delta_poc_sX_minus1
            r.skip(1)?; // used_by_curr_pic_sX_flag
        }
        num_delta_pocs[idx] = negatives + positives;
    }
    Ok(())
}

/// Parse the VUI following `vui_parameters_present_flag == 1`.
pub fn parse_vui(r: &mut BitReader<'_>, max_sub_layers_minus1: u32) -> Result<(), BitstreamError> {
    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        let idc = r.read_bits(8)?;
        if idc == 255 {
            r.skip(32)?;
        }
    }
    if r.read_bit()? {
        r.skip(1)?; // overscan_appropriate_flag
    }
    if r.read_bit()? {
        // video_signal_type_present_flag
        r.skip(3)?;
        r.skip(1)?;
        if r.read_bit()? {
            r.skip(24)?;
        }
    }
    if r.read_bit()? {
        // chroma_loc_info_present_flag
        r.read_ue()?;
        r.read_ue()?;
    }
    r.skip(1)?; // neutral_chroma_indication_flag
    r.skip(1)?; // field_seq_flag
    r.skip(1)?; // frame_field_info_present_flag
    if r.read_bit()? {
        // default_display_window_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? {
        // vui_timing_info_present_flag
        r.skip(32)?; // vui_num_units_in_tick
        r.skip(32)?; // vui_time_scale
        if r.read_bit()? {
            r.read_ue()?; // vui_num_ticks_poc_diff_one_minus1
        }
        if r.read_bit()? {
            skip_hrd(r, true, max_sub_layers_minus1)?;
        }
    }
    if r.read_bit()? {
        // bitstream_restriction_flag
        r.skip(3)?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    Ok(())
}

fn skip_hrd(
    r: &mut BitReader<'_>,
    common_inf_present: bool,
    max_sub_layers_minus1: u32,
) -> Result<(), BitstreamError> {
    let mut nal_hrd = false;
    let mut vcl_hrd = false;
    let mut sub_pic_hrd = false;
    if common_inf_present {
        nal_hrd = r.read_bit()?;
        vcl_hrd = r.read_bit()?;
        if nal_hrd || vcl_hrd {
            sub_pic_hrd = r.read_bit()?;
            if sub_pic_hrd {
                r.skip(8)?; // tick_divisor_minus2
                r.skip(5)?; // du_cpb_removal_delay_increment_length_minus1
                r.skip(1)?; // sub_pic_cpb_params_in_pic_timing_sei_flag
                r.skip(5)?; // dpb_output_delay_du_length_minus1
            }
            r.skip(4)?; // bit_rate_scale
            r.skip(4)?; // cpb_size_scale
            if sub_pic_hrd {
                r.skip(4)?; // cpb_size_du_scale
            }
            r.skip(5)?; // initial_cpb_removal_delay_length_minus1
            r.skip(5)?; // au_cpb_removal_delay_length_minus1
            r.skip(5)?; // dpb_output_delay_length_minus1
        }
    }
    for _ in 0..=max_sub_layers_minus1 {
        let fixed_rate_general = r.read_bit()?;
        let fixed_rate_cvs = if !fixed_rate_general { r.read_bit()? } else { true };
        let mut low_delay = false;
        if fixed_rate_cvs {
            r.read_ue()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay = r.read_bit()?;
        }
        let cpb_cnt = if !low_delay { r.read_ue()? + 1 } else { 1 };
        for hrd_present in [nal_hrd, vcl_hrd] {
            if hrd_present {
                for _ in 0..cpb_cnt {
                    r.read_ue()?; // bit_rate_value_minus1
                    r.read_ue()?; // cpb_size_value_minus1
                    if sub_pic_hrd {
                        r.read_ue()?;
                        r.read_ue()?;
                    }
                    r.skip(1)?; // cbr_flag
                }
            }
        }
    }
    Ok(())
}

/// Rewrite an HEVC SPS RBSP that lacks a VUI, appending a minimal VUI with
/// the colour description.
pub fn insert_vui(rbsp: &[u8], layout: &SpsLayout, vui: &VuiParams) -> Result<Vec<u8>, BitstreamError> {
    let mut r = BitReader::new(rbsp);
    let mut w = BitWriter::new();
    w.copy_bits(&mut r, layout.vui_flag_pos)?;

    // Original flag must be 0 and the SPS must carry no extensions, else the
    // remaining bits cannot be re-aligned safely.
    if r.read_bit()? {
        return Err(BitstreamError::Malformed("SPS already has a VUI"));
    }
    if r.read_bit()? {
        return Err(BitstreamError::Malformed("SPS carries extensions"));
    }

    w.write_bit(true); // vui_parameters_present_flag
    write_hevc_vui(&mut w, vui);
    w.write_bit(false); // sps_extension_present_flag
    Ok(w.finish_rbsp())
}

fn write_hevc_vui(w: &mut BitWriter, vui: &VuiParams) {
    w.write_bit(false); // aspect_ratio_info_present_flag
    w.write_bit(false); // overscan_info_present_flag
    w.write_bit(true); // video_signal_type_present_flag
    w.write_bits(5, 3); // video_format: unspecified
    w.write_bit(vui.video_full_range);
    w.write_bit(true); // colour_description_present_flag
    w.write_bits(vui.colour_primaries as u32, 8);
    w.write_bits(vui.transfer_characteristics as u32, 8);
    w.write_bits(vui.matrix_coefficients as u32, 8);
    w.write_bit(false); // chroma_loc_info_present_flag
    w.write_bit(false); // neutral_chroma_indication_flag
    w.write_bit(false); // field_seq_flag
    w.write_bit(false); // frame_field_info_present_flag
    w.write_bit(false); // default_display_window_flag
    w.write_bit(false); // vui_timing_info_present_flag
    w.write_bit(false); // bitstream_restriction_flag
}
