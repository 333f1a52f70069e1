//! H.264 sequence-parameter-set parsing and VUI insertion.

use crate::bits::{BitReader, BitWriter};
use crate::{BitstreamError, VuiParams};

/// Where the `vui_parameters_present_flag` sits in an SPS RBSP.
pub struct SpsLayout {
    /// Bit offset of the flag, counted from the start of the RBSP.
    pub vui_flag_pos: usize,
    pub vui_present: bool,
}

/// Parse an SPS RBSP (unescaped, NAL header stripped) up to and including
/// `vui_parameters_present_flag`.
pub fn parse_sps(rbsp: &[u8]) -> Result<SpsLayout, BitstreamError> {
    let mut r = BitReader::new(rbsp);

    let profile_idc = r.read_bits(8)?;
    r.skip(8)?; // constraint_set flags + reserved
    r.skip(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? {
            // seq_scaling_matrix_present_flag
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    match pic_order_cnt_type {
        0 => {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.skip(1)?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }

    r.read_ue()?; // max_num_ref_frames
    r.skip(1)?; // gaps_in_frame_num_value_allowed_flag
    r.read_ue()?; // pic_width_in_mbs_minus1
    r.read_ue()?; // pic_height_in_map_units_minus1
    let frame_mbs_only = r.read_bit()?;
    if !frame_mbs_only {
        r.skip(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip(1)?; // direct_8x8_inference_flag
    if r.read_bit()? {
        // frame_cropping_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }

    let vui_flag_pos = r.position();
    let vui_present = r.read_bit()?;
    Ok(SpsLayout { vui_flag_pos, vui_present })
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), BitstreamError> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// Parse the VUI that follows `vui_parameters_present_flag == 1`. Returns
/// an error if the structure is malformed.
pub fn parse_vui(r: &mut BitReader<'_>) -> Result<(), BitstreamError> {
    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        let idc = r.read_bits(8)?;
        if idc == 255 {
            r.skip(32)?; // sar_width + sar_height
        }
    }
    if r.read_bit()? {
        r.skip(1)?; // overscan_appropriate_flag
    }
    if r.read_bit()? {
        // video_signal_type_present_flag
        r.skip(3)?; // video_format
        r.skip(1)?; // video_full_range_flag
        if r.read_bit()? {
            r.skip(24)?; // primaries, transfer, matrix
        }
    }
    if r.read_bit()? {
        // chroma_loc_info_present_flag
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? {
        // timing_info_present_flag
        r.skip(32)?; // num_units_in_tick
        r.skip(32)?; // time_scale
        r.skip(1)?; // fixed_frame_rate_flag
    }
    let nal_hrd = r.read_bit()?;
    if nal_hrd {
        skip_hrd(r)?;
    }
    let vcl_hrd = r.read_bit()?;
    if vcl_hrd {
        skip_hrd(r)?;
    }
    if nal_hrd || vcl_hrd {
        r.skip(1)?; // low_delay_hrd_flag
    }
    r.skip(1)?; // pic_struct_present_flag
    if r.read_bit()? {
        // bitstream_restriction_flag
        r.skip(1)?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    Ok(())
}

fn skip_hrd(r: &mut BitReader<'_>) -> Result<(), BitstreamError> {
    let cpb_cnt = r.read_ue()? + 1;
    r.skip(8)?; // bit_rate_scale + cpb_size_scale
    for _ in 0..cpb_cnt {
        r.read_ue()?; // bit_rate_value_minus1
        r.read_ue()?; // cpb_size_value_minus1
        r.skip(1)?; // cbr_flag
    }
    r.skip(20)?; // four 5-bit lengths
    Ok(())
}

/// Rewrite an SPS RBSP that lacks a VUI, appending a minimal VUI carrying
/// the colour description. Returns the new RBSP.
pub fn insert_vui(rbsp: &[u8], layout: &SpsLayout, vui: &VuiParams) -> Result<Vec<u8>, BitstreamError> {
    let mut r = BitReader::new(rbsp);
    let mut w = BitWriter::new();
    w.copy_bits(&mut r, layout.vui_flag_pos)?;

    w.write_bit(true); // vui_parameters_present_flag
    write_vui(&mut w, vui);

    Ok(w.finish_rbsp())
}

/// Minimal VUI: colour signalling only, no timing or HRD.
pub(crate) fn write_vui(w: &mut BitWriter, vui: &VuiParams) {
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
    w.write_bit(false); // timing_info_present_flag
    w.write_bit(false); // nal_hrd_parameters_present_flag
    w.write_bit(false); // vcl_hrd_parameters_present_flag
    w.write_bit(false); // pic_struct_present_flag
    w.write_bit(false); // bitstream_restriction_flag
}
