// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An Annex B h.265 essence parser.
//!
//! Scans byte streams for access unit boundaries and decodes the sequence
//! parameter set of each access unit, enough to describe the stream to a
//! container writer. Only the Main 4:2:2 10 Intra family is accepted.

use enumn::N;
use log::warn;

use crate::bitstream_utils::BitReader;
use crate::descriptor::EssenceKind;
use crate::parser::EssenceParser;
use crate::parser::FrameSize;
use crate::parser::FrameStart;
use crate::parser::ParseError;

pub const ASPECT_RATIO_IDC_EXTENDED_SAR: u8 = 255;

/// Table 7-1, the NAL unit types the scanner cares about.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NaluType {
    /// Coded slice segment of an IDR picture.
    IdrWRadl = 19,
    /// IDR slice with no leading pictures.
    IdrNLp = 20,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    PrefixSeiNut = 39,
}

fn is_idr(nalu_type: Option<u8>) -> bool {
    matches!(
        nalu_type.and_then(NaluType::n),
        Some(NaluType::IdrWRadl) | Some(NaluType::IdrNLp)
    )
}

/// The decoded fields of a sequence parameter set, flattened to what
/// descriptor population consumes. Optional fields carry an explicit
/// presence flag; absence is never conflated with zero.
#[derive(Clone, Debug)]
pub struct SeqParameterSet {
    chroma_format_idc: u8,
    pic_width_in_luma_samples: u32,
    pic_height_in_luma_samples: u32,
    bit_depth_luma_minus8: u32,

    have_aspect_ratio_info: bool,
    aspect_ratio_idc: u8,
    sar_width: u16,
    sar_height: u16,

    have_video_format: bool,
    video_format: u8,

    have_color_description: bool,
    color_primaries: u8,
    transfer_characteristics: u8,
    matrix_coeffs: u8,

    general_profile_space: u8,
    general_profile_idc: u8,
    general_level_idc: u8,
    general_tier_flag: bool,

    general_progressive_source_flag: bool,
    general_interlaced_source_flag: bool,
    general_non_packed_constraint_flag: bool,
    general_frame_only_constraint_flag: bool,

    have_extended_constraints: bool,
    general_max_14bit_constraint_flag: bool,
    general_max_12bit_constraint_flag: bool,
    general_max_10bit_constraint_flag: bool,
    general_max_8bit_constraint_flag: bool,
    general_max_422chroma_constraint_flag: bool,
    general_max_420chroma_constraint_flag: bool,
    general_max_monochrome_constraint_flag: bool,
    general_intra_constraint_flag: bool,
    general_one_picture_only_constraint_flag: bool,
    general_lower_bit_rate_constraint_flag: bool,

    bit_rate_scale: u8,
    have_bit_rate_value: bool,
    bit_rate_value_minus1: u32,
}

impl Default for SeqParameterSet {
    fn default() -> Self {
        Self {
            chroma_format_idc: 0,
            pic_width_in_luma_samples: 0,
            pic_height_in_luma_samples: 0,
            bit_depth_luma_minus8: 0,
            have_aspect_ratio_info: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            have_video_format: false,
            // "unspecified" until signalled otherwise
            video_format: 5,
            have_color_description: false,
            color_primaries: 2,
            transfer_characteristics: 2,
            matrix_coeffs: 2,
            general_profile_space: 0,
            general_profile_idc: 0,
            general_level_idc: 0,
            general_tier_flag: false,
            general_progressive_source_flag: false,
            general_interlaced_source_flag: false,
            general_non_packed_constraint_flag: false,
            general_frame_only_constraint_flag: false,
            have_extended_constraints: false,
            general_max_14bit_constraint_flag: false,
            general_max_12bit_constraint_flag: false,
            general_max_10bit_constraint_flag: false,
            general_max_8bit_constraint_flag: false,
            general_max_422chroma_constraint_flag: false,
            general_max_420chroma_constraint_flag: false,
            general_max_monochrome_constraint_flag: false,
            general_intra_constraint_flag: false,
            general_one_picture_only_constraint_flag: false,
            general_lower_bit_rate_constraint_flag: false,
            bit_rate_scale: 0,
            have_bit_rate_value: false,
            bit_rate_value_minus1: 0,
        }
    }
}

impl SeqParameterSet {
    pub fn chroma_format_idc(&self) -> u8 {
        self.chroma_format_idc
    }

    pub fn pic_width_in_luma_samples(&self) -> u32 {
        self.pic_width_in_luma_samples
    }

    pub fn pic_height_in_luma_samples(&self) -> u32 {
        self.pic_height_in_luma_samples
    }

    pub fn bit_depth_luma_minus8(&self) -> u32 {
        self.bit_depth_luma_minus8
    }

    pub fn have_aspect_ratio_info(&self) -> bool {
        self.have_aspect_ratio_info
    }

    /// Panics if no aspect ratio information was signalled; check
    /// [`Self::have_aspect_ratio_info`] first.
    pub fn aspect_ratio_idc(&self) -> u8 {
        assert!(self.have_aspect_ratio_info);
        self.aspect_ratio_idc
    }

    pub fn sar_width(&self) -> u16 {
        assert!(self.have_aspect_ratio_info);
        self.sar_width
    }

    pub fn sar_height(&self) -> u16 {
        assert!(self.have_aspect_ratio_info);
        self.sar_height
    }

    pub fn have_video_format(&self) -> bool {
        self.have_video_format
    }

    /// Panics if no video format was signalled; check
    /// [`Self::have_video_format`] first.
    pub fn video_format(&self) -> u8 {
        assert!(self.have_video_format);
        self.video_format
    }

    pub fn have_color_description(&self) -> bool {
        self.have_color_description
    }

    /// Panics if no color description was signalled; check
    /// [`Self::have_color_description`] first.
    pub fn color_primaries(&self) -> u8 {
        assert!(self.have_color_description);
        self.color_primaries
    }

    pub fn transfer_characteristics(&self) -> u8 {
        assert!(self.have_color_description);
        self.transfer_characteristics
    }

    pub fn matrix_coeffs(&self) -> u8 {
        assert!(self.have_color_description);
        self.matrix_coeffs
    }

    pub fn general_profile_space(&self) -> u8 {
        self.general_profile_space
    }

    pub fn general_profile_idc(&self) -> u8 {
        self.general_profile_idc
    }

    pub fn general_level_idc(&self) -> u8 {
        self.general_level_idc
    }

    pub fn general_tier_flag(&self) -> bool {
        self.general_tier_flag
    }

    pub fn general_progressive_source_flag(&self) -> bool {
        self.general_progressive_source_flag
    }

    pub fn general_interlaced_source_flag(&self) -> bool {
        self.general_interlaced_source_flag
    }

    pub fn general_non_packed_constraint_flag(&self) -> bool {
        self.general_non_packed_constraint_flag
    }

    pub fn general_frame_only_constraint_flag(&self) -> bool {
        self.general_frame_only_constraint_flag
    }

    pub fn have_extended_constraints(&self) -> bool {
        self.have_extended_constraints
    }

    pub fn general_max_14bit_constraint_flag(&self) -> bool {
        self.general_max_14bit_constraint_flag
    }

    pub fn general_max_12bit_constraint_flag(&self) -> bool {
        self.general_max_12bit_constraint_flag
    }

    pub fn general_max_10bit_constraint_flag(&self) -> bool {
        self.general_max_10bit_constraint_flag
    }

    pub fn general_max_8bit_constraint_flag(&self) -> bool {
        self.general_max_8bit_constraint_flag
    }

    pub fn general_max_422chroma_constraint_flag(&self) -> bool {
        self.general_max_422chroma_constraint_flag
    }

    pub fn general_max_420chroma_constraint_flag(&self) -> bool {
        self.general_max_420chroma_constraint_flag
    }

    pub fn general_max_monochrome_constraint_flag(&self) -> bool {
        self.general_max_monochrome_constraint_flag
    }

    pub fn general_intra_constraint_flag(&self) -> bool {
        self.general_intra_constraint_flag
    }

    pub fn general_one_picture_only_constraint_flag(&self) -> bool {
        self.general_one_picture_only_constraint_flag
    }

    pub fn general_lower_bit_rate_constraint_flag(&self) -> bool {
        self.general_lower_bit_rate_constraint_flag
    }

    pub fn bit_rate_scale(&self) -> u8 {
        self.bit_rate_scale
    }

    pub fn have_bit_rate_value(&self) -> bool {
        self.have_bit_rate_value
    }

    /// Panics if no HRD bit rate was signalled; check
    /// [`Self::have_bit_rate_value`] first.
    pub fn bit_rate_value_minus1(&self) -> u32 {
        assert!(self.have_bit_rate_value);
        self.bit_rate_value_minus1
    }
}

/// Finds the next `00 00 01` start code prefix. The scan is based on FFmpeg's
/// avpriv_find_start_code in libavcodec/utils.c.
fn next_start_code_prefix(data: &[u8]) -> Option<usize> {
    let mut i = 3;
    while i < data.len() {
        if data[i - 1] > 1 {
            i += 3;
        } else if data[i - 2] != 0 {
            i += 2;
        } else if data[i - 3] != 0 || data[i - 1] != 1 {
            i += 1;
        } else {
            break;
        }
    }

    if i < data.len() {
        Some(i - 3)
    } else {
        None
    }
}

/// Access unit boundary scanner and sequence parameter set decoder.
#[derive(Default)]
pub struct HevcParser {
    /// Scan offset within the current frame's buffer view.
    offset: usize,
    frame_num: u64,
    nal_unit_type: Option<u8>,
    last_nal_unit_type: Option<u8>,
    sps: SeqParameterSet,
}

impl HevcParser {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set(&self) -> &SeqParameterSet {
        &self.sps
    }

    pub fn frame_num(&self) -> u64 {
        self.frame_num
    }

    /// Maps the decoded constraint flags to the output format tag. Anything
    /// outside the Main 4:2:2 10 Intra family is rejected.
    pub fn essence_kind(&self) -> Result<EssenceKind, ParseError> {
        if self.sps.general_profile_idc != 4 {
            return Err(ParseError::Unsupported(format!(
                "HEVC general_profile_idc {} is not supported",
                self.sps.general_profile_idc
            )));
        }

        if !self.sps.general_max_420chroma_constraint_flag && self.sps.chroma_format_idc <= 2 {
            Ok(EssenceKind::HevcMain42210Intra)
        } else if self.sps.general_max_420chroma_constraint_flag
            && self.sps.chroma_format_idc <= 1
        {
            Ok(EssenceKind::HevcMain10Intra)
        } else {
            Err(ParseError::Unsupported(
                "HEVC constraint flags do not match a supported essence type".into(),
            ))
        }
    }

    fn reset_frame_info(&mut self) {
        self.offset = 0;
        self.sps = SeqParameterSet::default();
    }

    /// The stream must match the single profile downstream descriptor
    /// population assumes: 4:2:2 chroma, 10 bit, intra only.
    fn check_conformance(&self) -> Result<(), ParseError> {
        if !self.sps.general_intra_constraint_flag {
            return Err(ParseError::Unsupported(
                "intra only essence required but general_intra_constraint_flag is 0".into(),
            ));
        }
        if self.sps.chroma_format_idc != 2 {
            return Err(ParseError::Unsupported(format!(
                "only 4:2:2 chroma is supported, got chroma_format_idc {}",
                self.sps.chroma_format_idc
            )));
        }
        if !self.sps.general_max_10bit_constraint_flag || self.sps.general_max_8bit_constraint_flag
        {
            return Err(ParseError::Unsupported(
                "only 10 bit essence is supported by the constraint flags".into(),
            ));
        }
        if self.sps.bit_depth_luma_minus8 > 2 {
            return Err(ParseError::Unsupported(format!(
                "only 10 bit essence is supported, got bit_depth_luma_minus8 {}",
                self.sps.bit_depth_luma_minus8
            )));
        }

        Ok(())
    }

    fn parse_profile_tier_level(
        &mut self,
        r: &mut BitReader,
        max_sub_layers_minus1: u8,
    ) -> anyhow::Result<()> {
        let sps = &mut self.sps;

        sps.general_profile_space = r.read_bits(2)?;
        sps.general_tier_flag = r.read_bit()?;
        sps.general_profile_idc = r.read_bits(5)?;

        let mut compat = [false; 32];
        for flag in compat.iter_mut() {
            *flag = r.read_bit()?;
        }

        sps.general_progressive_source_flag = r.read_bit()?;
        sps.general_interlaced_source_flag = r.read_bit()?;
        sps.general_non_packed_constraint_flag = r.read_bit()?;
        sps.general_frame_only_constraint_flag = r.read_bit()?;

        let idc = sps.general_profile_idc;
        let profile = |n: u8| idc == n || compat[n as usize];

        if profile(4)
            || profile(5)
            || profile(6)
            || profile(7)
            || profile(8)
            || profile(9)
            || profile(10)
            || profile(11)
        {
            sps.have_extended_constraints = true;
            sps.general_max_12bit_constraint_flag = r.read_bit()?;
            sps.general_max_10bit_constraint_flag = r.read_bit()?;
            sps.general_max_8bit_constraint_flag = r.read_bit()?;
            sps.general_max_422chroma_constraint_flag = r.read_bit()?;
            sps.general_max_420chroma_constraint_flag = r.read_bit()?;
            sps.general_max_monochrome_constraint_flag = r.read_bit()?;
            sps.general_intra_constraint_flag = r.read_bit()?;
            sps.general_one_picture_only_constraint_flag = r.read_bit()?;
            sps.general_lower_bit_rate_constraint_flag = r.read_bit()?;

            if profile(5) || profile(9) || profile(10) || profile(11) {
                sps.general_max_14bit_constraint_flag = r.read_bit()?;
                r.skip_bits(33)?;
            } else {
                r.skip_bits(34)?;
            }
        } else if profile(2) {
            r.skip_bits(7)?;
            sps.general_one_picture_only_constraint_flag = r.read_bit()?;
            r.skip_bits(35)?;
        } else {
            r.skip_bits(43)?;
        }
        // general_inbld_flag or general_reserved_zero_bit
        r.skip_bits(1)?;

        sps.general_level_idc = r.read_bits(8)?;

        let mut sub_layer_profile_present_flag = [false; 8];
        let mut sub_layer_level_present_flag = [false; 8];
        for i in 0..max_sub_layers_minus1 as usize {
            sub_layer_profile_present_flag[i] = r.read_bit()?;
            sub_layer_level_present_flag[i] = r.read_bit()?;
        }

        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                r.skip_bits(2)?;
            }
        }

        for i in 0..max_sub_layers_minus1 as usize {
            if sub_layer_profile_present_flag[i] {
                // sub_layer profile space, tier, idc, compatibility flags,
                // source/constraint flags and the reserved span; none of it
                // feeds descriptor population.
                r.skip_bits(2 + 1 + 5 + 32 + 4)?;
                r.skip_bits(44)?;
            }
            if sub_layer_level_present_flag[i] {
                r.skip_bits(8)?;
            }
        }

        Ok(())
    }

    fn parse_scaling_list_data(r: &mut BitReader) -> anyhow::Result<()> {
        // Consumed only to keep the cursor aligned.
        for size_id in 0..4 {
            let num_matrices = if size_id == 3 { 2 } else { 6 };
            for _ in 0..num_matrices {
                let scaling_list_pred_mode_flag = r.read_bit()?;
                if !scaling_list_pred_mode_flag {
                    r.read_ue::<u32>()?; // scaling_list_pred_matrix_id_delta
                } else {
                    let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));
                    if size_id > 1 {
                        r.read_se::<i32>()?; // scaling_list_dc_coef_minus8
                    }
                    for _ in 0..coef_num {
                        r.read_se::<i32>()?; // scaling_list_delta_coef
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_short_term_ref_pic_set(
        r: &mut BitReader,
        st_rps_idx: u32,
        num_short_term_ref_pic_sets: u32,
    ) -> anyhow::Result<()> {
        // Consumed only to keep the cursor aligned. Intra only streams carry
        // no predicted sets, so a single used/use-delta entry suffices there.
        let mut inter_ref_pic_set_prediction_flag = false;
        if st_rps_idx != 0 {
            inter_ref_pic_set_prediction_flag = r.read_bit()?;
        }

        if inter_ref_pic_set_prediction_flag {
            if st_rps_idx == num_short_term_ref_pic_sets {
                r.read_ue::<u32>()?; // delta_idx_minus1
            }
            r.read_bit()?; // delta_rps_sign
            r.read_ue::<u32>()?; // abs_delta_rps_minus1

            let used_by_curr_pic_flag = r.read_bit()?;
            if !used_by_curr_pic_flag {
                r.read_bit()?; // use_delta_flag
            }
        } else {
            let num_negative_pics: u32 = r.read_ue()?;
            let num_positive_pics: u32 = r.read_ue()?;

            for _ in 0..num_negative_pics {
                r.read_ue::<u32>()?; // delta_poc_s0_minus1
                r.read_bit()?; // used_by_curr_pic_s0_flag
            }
            for _ in 0..num_positive_pics {
                r.read_ue::<u32>()?; // delta_poc_s1_minus1
                r.read_bit()?; // used_by_curr_pic_s1_flag
            }
        }

        Ok(())
    }

    fn parse_sub_layer_hrd_parameters(
        &mut self,
        r: &mut BitReader,
        cpb_cnt: u32,
        sub_pic_hrd_params_present_flag: bool,
    ) -> anyhow::Result<()> {
        for i in 0..cpb_cnt {
            let bit_rate_value_minus1: u32 = r.read_ue()?;
            if i == 0 && !self.sps.have_bit_rate_value {
                self.sps.bit_rate_value_minus1 = bit_rate_value_minus1;
                self.sps.have_bit_rate_value = true;
            }

            r.read_ue::<u32>()?; // cpb_size_value_minus1
            if sub_pic_hrd_params_present_flag {
                r.read_ue::<u32>()?; // cpb_size_du_value_minus1
                r.read_ue::<u32>()?; // bit_rate_du_value_minus1
            }
            r.read_bit()?; // cbr_flag
        }

        Ok(())
    }

    fn parse_hrd_parameters(
        &mut self,
        r: &mut BitReader,
        common_inf_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> anyhow::Result<()> {
        let mut nal_hrd_parameters_present_flag = false;
        let mut vcl_hrd_parameters_present_flag = false;
        let mut sub_pic_hrd_params_present_flag = false;

        if common_inf_present_flag {
            nal_hrd_parameters_present_flag = r.read_bit()?;
            vcl_hrd_parameters_present_flag = r.read_bit()?;

            if nal_hrd_parameters_present_flag || vcl_hrd_parameters_present_flag {
                sub_pic_hrd_params_present_flag = r.read_bit()?;
                if sub_pic_hrd_params_present_flag {
                    r.skip_bits(8)?; // tick_divisor_minus2
                    r.skip_bits(5)?; // du_cpb_removal_delay_increment_length_minus1
                    r.skip_bits(1)?; // sub_pic_cpb_params_in_pic_timing_sei_flag
                    r.skip_bits(5)?; // dpb_output_delay_du_length_minus1
                }

                self.sps.bit_rate_scale = r.read_bits(4)?;
                r.skip_bits(4)?; // cpb_size_scale
                if sub_pic_hrd_params_present_flag {
                    r.skip_bits(4)?; // cpb_size_du_scale
                }
                r.skip_bits(5)?; // initial_cpb_removal_delay_length_minus1
                r.skip_bits(5)?; // au_cpb_removal_delay_length_minus1
                r.skip_bits(5)?; // dpb_output_delay_length_minus1
            }
        }

        for _ in 0..=max_sub_layers_minus1 {
            let fixed_pic_rate_general_flag = r.read_bit()?;
            let fixed_pic_rate_within_cvs_flag = if fixed_pic_rate_general_flag {
                true
            } else {
                r.read_bit()?
            };

            let mut low_delay_hrd_flag = false;
            if fixed_pic_rate_within_cvs_flag {
                r.read_ue::<u32>()?; // elemental_duration_in_tc_minus1
            } else {
                low_delay_hrd_flag = r.read_bit()?;
            }

            let mut cpb_cnt_minus1 = 0u32;
            if !low_delay_hrd_flag {
                cpb_cnt_minus1 = r.read_ue_max(31)?;
            }

            if nal_hrd_parameters_present_flag {
                self.parse_sub_layer_hrd_parameters(
                    r,
                    cpb_cnt_minus1 + 1,
                    sub_pic_hrd_params_present_flag,
                )?;
            }
            if vcl_hrd_parameters_present_flag {
                self.parse_sub_layer_hrd_parameters(
                    r,
                    cpb_cnt_minus1 + 1,
                    sub_pic_hrd_params_present_flag,
                )?;
            }
        }

        Ok(())
    }

    fn parse_vui_parameters(
        &mut self,
        r: &mut BitReader,
        max_sub_layers_minus1: u8,
    ) -> anyhow::Result<()> {
        let aspect_ratio_info_present_flag = r.read_bit()?;
        if aspect_ratio_info_present_flag {
            self.sps.have_aspect_ratio_info = true;
            self.sps.aspect_ratio_idc = r.read_bits(8)?;
            if self.sps.aspect_ratio_idc == ASPECT_RATIO_IDC_EXTENDED_SAR {
                self.sps.sar_width = r.read_bits(16)?;
                self.sps.sar_height = r.read_bits(16)?;
            }
        }

        let overscan_info_present_flag = r.read_bit()?;
        if overscan_info_present_flag {
            r.read_bit()?; // overscan_appropriate_flag
        }

        let video_signal_type_present_flag = r.read_bit()?;
        if video_signal_type_present_flag {
            self.sps.have_video_format = true;
            self.sps.video_format = r.read_bits(3)?;
            r.read_bit()?; // video_full_range_flag

            let colour_description_present_flag = r.read_bit()?;
            if colour_description_present_flag {
                self.sps.have_color_description = true;
                self.sps.color_primaries = r.read_bits(8)?;
                self.sps.transfer_characteristics = r.read_bits(8)?;
                self.sps.matrix_coeffs = r.read_bits(8)?;
            }
        }

        let chroma_loc_info_present_flag = r.read_bit()?;
        if chroma_loc_info_present_flag {
            r.read_ue::<u32>()?; // chroma_sample_loc_type_top_field
            r.read_ue::<u32>()?; // chroma_sample_loc_type_bottom_field
        }

        r.read_bit()?; // neutral_chroma_indication_flag
        r.read_bit()?; // field_seq_flag
        r.read_bit()?; // frame_field_info_present_flag

        let default_display_window_flag = r.read_bit()?;
        if default_display_window_flag {
            r.read_ue::<u32>()?; // def_disp_win_left_offset
            r.read_ue::<u32>()?; // def_disp_win_right_offset
            r.read_ue::<u32>()?; // def_disp_win_top_offset
            r.read_ue::<u32>()?; // def_disp_win_bottom_offset
        }

        let vui_timing_info_present_flag = r.read_bit()?;
        if vui_timing_info_present_flag {
            r.read_bits_u32()?; // vui_num_units_in_tick
            r.read_bits_u32()?; // vui_time_scale

            let vui_poc_proportional_to_timing_flag = r.read_bit()?;
            if vui_poc_proportional_to_timing_flag {
                r.read_ue::<u32>()?; // vui_num_ticks_poc_diff_one_minus1
            }

            let vui_hrd_parameters_present_flag = r.read_bit()?;
            if vui_hrd_parameters_present_flag {
                self.parse_hrd_parameters(r, true, max_sub_layers_minus1)?;
            }
        }

        let bitstream_restriction_flag = r.read_bit()?;
        if bitstream_restriction_flag {
            r.read_bit()?; // tiles_fixed_structure_flag
            r.read_bit()?; // motion_vectors_over_pic_boundaries_flag
            r.read_bit()?; // restricted_ref_pic_lists_flag
            r.read_ue::<u32>()?; // min_spatial_segmentation_idc
            r.read_ue::<u32>()?; // max_bytes_per_pic_denom
            r.read_ue::<u32>()?; // max_bits_per_min_cu_denom
            r.read_ue::<u32>()?; // log2_max_mv_length_horizontal
            r.read_ue::<u32>()?; // log2_max_mv_length_vertical
        }

        Ok(())
    }

    fn parse_seq_parameter_set(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let mut r = BitReader::new(data, true);

        r.read_bits::<u32>(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1: u8 = r.read_bits(3)?;
        r.read_bit()?; // sps_temporal_id_nesting_flag

        self.parse_profile_tier_level(&mut r, max_sub_layers_minus1)?;

        r.read_ue_max::<u32>(31)?; // sps_seq_parameter_set_id

        self.sps.chroma_format_idc = r.read_ue_max(3)?;
        if self.sps.chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }

        self.sps.pic_width_in_luma_samples = r.read_ue()?;
        self.sps.pic_height_in_luma_samples = r.read_ue()?;

        let conformance_window_flag = r.read_bit()?;
        if conformance_window_flag {
            r.read_ue::<u32>()?; // conf_win_left_offset
            r.read_ue::<u32>()?; // conf_win_right_offset
            r.read_ue::<u32>()?; // conf_win_top_offset
            r.read_ue::<u32>()?; // conf_win_bottom_offset
        }

        self.sps.bit_depth_luma_minus8 = r.read_ue()?;
        r.read_ue::<u32>()?; // bit_depth_chroma_minus8

        let log2_max_pic_order_cnt_lsb_minus4: u32 = r.read_ue()?;

        let sps_sub_layer_ordering_info_present_flag = r.read_bit()?;
        let start = if sps_sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers_minus1
        };
        for _ in start..=max_sub_layers_minus1 {
            r.read_ue::<u32>()?; // sps_max_dec_pic_buffering_minus1
            r.read_ue::<u32>()?; // sps_max_num_reorder_pics
            r.read_ue::<u32>()?; // sps_max_latency_increase_plus1
        }

        r.read_ue::<u32>()?; // log2_min_luma_coding_block_size_minus3
        r.read_ue::<u32>()?; // log2_diff_max_min_luma_coding_block_size
        r.read_ue::<u32>()?; // log2_min_transform_block_size_minus2
        r.read_ue::<u32>()?; // log2_diff_max_min_transform_block_size
        r.read_ue::<u32>()?; // max_transform_hierarchy_depth_inter
        r.read_ue::<u32>()?; // max_transform_hierarchy_depth_intra

        let scaling_list_enabled_flag = r.read_bit()?;
        if scaling_list_enabled_flag {
            let sps_scaling_list_data_present_flag = r.read_bit()?;
            if sps_scaling_list_data_present_flag {
                Self::parse_scaling_list_data(&mut r)?;
            }
        }

        r.read_bit()?; // amp_enabled_flag
        r.read_bit()?; // sample_adaptive_offset_enabled_flag

        let pcm_enabled_flag = r.read_bit()?;
        if pcm_enabled_flag {
            r.read_bits::<u32>(4)?; // pcm_sample_bit_depth_luma_minus1
            r.read_bits::<u32>(4)?; // pcm_sample_bit_depth_chroma_minus1
            r.read_ue::<u32>()?; // log2_min_pcm_luma_coding_block_size_minus3
            r.read_ue::<u32>()?; // log2_diff_max_min_pcm_luma_coding_block_size
            r.read_bit()?; // pcm_loop_filter_disabled_flag
        }

        let num_short_term_ref_pic_sets: u32 = r.read_ue_max(64)?;
        for i in 0..num_short_term_ref_pic_sets {
            Self::parse_short_term_ref_pic_set(&mut r, i, num_short_term_ref_pic_sets)?;
        }

        let long_term_ref_pics_present_flag = r.read_bit()?;
        if long_term_ref_pics_present_flag {
            let num_long_term_ref_pics_sps: u32 = r.read_ue()?;
            for _ in 0..num_long_term_ref_pics_sps {
                // lt_ref_pic_poc_lsb_sps, log2_max_pic_order_cnt_lsb_minus4 + 4 bits wide
                r.skip_bits(log2_max_pic_order_cnt_lsb_minus4 as usize + 4)?;
                r.read_bit()?; // used_by_curr_pic_lt_sps_flag
            }
        }

        r.read_bit()?; // sps_temporal_mvp_enabled_flag
        r.read_bit()?; // strong_intra_smoothing_enabled_flag

        let vui_parameters_present_flag = r.read_bit()?;
        if vui_parameters_present_flag {
            self.parse_vui_parameters(&mut r, max_sub_layers_minus1)?;
        }

        r.read_bit()?; // sps_extension_flag

        Ok(())
    }
}

impl EssenceParser for HevcParser {
    /// The access unit shall start with a zero_byte followed by
    /// start_code_prefix_one_3byte; the returned offset is that of the
    /// zero_byte.
    fn locate_frame_start(&mut self, data: &[u8]) -> FrameStart {
        let offset = match next_start_code_prefix(data) {
            Some(offset) => offset,
            None => return FrameStart::NeedMoreData,
        };

        if offset == 0 || data[offset - 1] != 0x00 {
            warn!("HEVC: missing zero_byte before start_code_prefix_one_3byte at access unit start");
            return FrameStart::NeedMoreData;
        }

        FrameStart::Offset(offset - 1)
    }

    fn compute_frame_size(&mut self, data: &[u8]) -> FrameSize {
        if data.is_empty() {
            // End of stream: the remaining buffered bytes become the final
            // frame. Anything shorter than a start code and NAL header is
            // not a frame.
            if self.offset == 0 {
                return FrameSize::Invalid;
            }
            let end_pos = self.offset + 5;
            self.frame_num += 1;
            self.offset = 0;
            return FrameSize::Complete(end_pos);
        }

        let mut end_pos = None;

        // keep 5 bytes of space for the start code and NAL header
        while end_pos.is_none() && self.offset < data.len().saturating_sub(5) {
            if data[self.offset] == 0x00
                && data[self.offset + 1] == 0x00
                && data[self.offset + 2] == 0x01
            {
                // advance start code
                self.offset += 3;

                let b1 = data[self.offset];

                // advance nal header
                self.offset += 2;

                self.last_nal_unit_type = self.nal_unit_type;
                self.nal_unit_type = Some((b1 & 0x7e) >> 1);

                if is_idr(self.last_nal_unit_type) {
                    // back to before the start code and NAL header
                    end_pos = Some(self.offset - 5);
                }
            } else {
                self.offset += 1;
            }
        }

        match end_pos {
            Some(size) => {
                self.frame_num += 1;
                // done, start again
                self.offset = 0;
                FrameSize::Complete(size)
            }
            None => FrameSize::NeedMoreData,
        }
    }

    fn extract_frame_info(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.reset_frame_info();

        let mut have_sps = false;
        while !have_sps && self.offset < data.len().saturating_sub(5) {
            if data[self.offset] == 0x00
                && data[self.offset + 1] == 0x00
                && data[self.offset + 2] == 0x01
            {
                self.offset += 3;
                let b1 = data[self.offset];
                self.offset += 2;

                let nal_unit_type = (b1 & 0x7e) >> 1;
                if nal_unit_type == NaluType::SpsNut as u8 {
                    self.parse_seq_parameter_set(&data[self.offset..])
                        .map_err(|e| {
                            ParseError::Malformed(format!("sequence parameter set: {:#}", e))
                        })?;
                    // The first SPS is sufficient for descriptor population.
                    have_sps = true;
                }
            } else {
                self.offset += 1;
            }
        }

        self.offset = 0;

        if !have_sps {
            return Err(ParseError::Malformed(
                "no sequence parameter set in access unit".into(),
            ));
        }

        self.check_conformance()
    }
}


#[cfg(test)]
mod tests {
    use super::test_stream::build_access_unit;
    use super::test_stream::nal;
    use super::*;
    use crate::bitstream_utils::BitWriter;

    #[test]
    fn frame_start_requires_zero_byte() {
        let mut parser = HevcParser::new();
        let au = build_access_unit(64, 64);

        // Only the three byte start code prefix after non-zero garbage: the
        // mandated zero_byte is missing.
        let mut data = vec![0xde, 0xad];
        data.extend(&au[1..]);
        assert_eq!(parser.locate_frame_start(&data), FrameStart::NeedMoreData);

        // The four byte form carries its own zero_byte; leading garbage is
        // skipped.
        let mut data = vec![0xde, 0xad];
        data.extend(&au);
        assert_eq!(parser.locate_frame_start(&data), FrameStart::Offset(2));

        assert_eq!(parser.locate_frame_start(&au), FrameStart::Offset(0));

        assert_eq!(
            parser.locate_frame_start(&[0xff; 64]),
            FrameStart::NeedMoreData
        );
    }

    #[test]
    fn frame_boundary_follows_idr() {
        let au1 = build_access_unit(1920, 1080);
        let au2 = build_access_unit(1920, 1080);

        let mut stream = au1.clone();
        stream.extend(&au2);

        let mut parser = HevcParser::new();
        // The boundary sits right before the next access unit's three byte
        // start code; the zero_byte before it stays with the first frame.
        assert_eq!(
            parser.compute_frame_size(&stream),
            FrameSize::Complete(au1.len() + 1)
        );
        assert_eq!(parser.frame_num(), 1);
    }

    #[test]
    fn truncated_stream_needs_more_data_then_finalizes() {
        let au = build_access_unit(640, 480);
        let mut parser = HevcParser::new();

        assert_eq!(parser.compute_frame_size(&au), FrameSize::NeedMoreData);

        // End of stream: the remaining bytes become the final frame. The
        // reported size may overshoot by the scan guard and is clamped by the
        // caller.
        match parser.compute_frame_size(&[]) {
            FrameSize::Complete(size) => {
                assert!(size >= au.len() - 5);
                assert!(size <= au.len() + 4);
            }
            other => panic!("expected a final frame, got {:?}", other),
        }
    }

    #[test]
    fn empty_stream_is_invalid() {
        let mut parser = HevcParser::new();
        assert_eq!(parser.compute_frame_size(&[]), FrameSize::Invalid);
    }

    #[test]
    fn incremental_feeding_matches_single_shot() {
        let _ = env_logger::try_init();

        let au1 = build_access_unit(1920, 1080);
        let au2 = build_access_unit(1920, 1080);
        let au3 = build_access_unit(1920, 1080);

        let mut stream = au1.clone();
        stream.extend(&au2);
        stream.extend(&au3);

        let single_shot = {
            let mut parser = HevcParser::new();
            let mut sizes = Vec::new();
            let mut pos = 0;
            loop {
                match parser.compute_frame_size(&stream[pos..]) {
                    FrameSize::Complete(size) => {
                        sizes.push(size);
                        pos += size;
                    }
                    FrameSize::NeedMoreData => break,
                    FrameSize::Invalid => panic!("unexpected invalid frame"),
                }
            }
            match parser.compute_frame_size(&[]) {
                FrameSize::Complete(size) => sizes.push(size.min(stream.len() - pos)),
                other => panic!("expected a final frame, got {:?}", other),
            }
            sizes
        };

        let byte_at_a_time = {
            let mut parser = HevcParser::new();
            let mut sizes = Vec::new();
            let mut buf: Vec<u8> = Vec::new();
            for &byte in &stream {
                buf.push(byte);
                if let FrameSize::Complete(size) = parser.compute_frame_size(&buf) {
                    sizes.push(size);
                    buf.drain(..size);
                }
            }
            match parser.compute_frame_size(&[]) {
                FrameSize::Complete(size) => sizes.push(size.min(buf.len())),
                other => panic!("expected a final frame, got {:?}", other),
            }
            sizes
        };

        assert_eq!(single_shot, byte_at_a_time);
        assert_eq!(single_shot.iter().sum::<usize>(), stream.len());
    }

    #[test]
    fn frame_info_reproduces_sps_fields() {
        let au = build_access_unit(1920, 1080);

        let mut parser = HevcParser::new();
        parser.extract_frame_info(&au).unwrap();

        let sps = parser.seq_parameter_set();
        assert_eq!(sps.pic_width_in_luma_samples(), 1920);
        assert_eq!(sps.pic_height_in_luma_samples(), 1080);
        assert_eq!(sps.chroma_format_idc(), 2);
        assert_eq!(sps.bit_depth_luma_minus8(), 2);
        assert_eq!(sps.general_profile_idc(), 4);
        assert_eq!(sps.general_level_idc(), 123);
        assert!(sps.general_progressive_source_flag());
        assert!(sps.have_extended_constraints());
        assert!(sps.general_intra_constraint_flag());
        assert!(sps.general_max_422chroma_constraint_flag());
        assert!(!sps.general_max_420chroma_constraint_flag());
        assert!(sps.have_aspect_ratio_info());
        assert_eq!(sps.aspect_ratio_idc(), 1);
        assert!(sps.have_video_format());
        assert_eq!(sps.video_format(), 5);
        assert!(sps.have_color_description());
        assert_eq!(sps.color_primaries(), 9);
        assert_eq!(sps.transfer_characteristics(), 16);
        assert_eq!(sps.matrix_coeffs(), 9);
        assert!(!sps.have_bit_rate_value());

        assert!(matches!(
            parser.essence_kind(),
            Ok(EssenceKind::HevcMain42210Intra)
        ));
    }

    #[test]
    fn sps_fields_survive_chunked_boundary_scan() {
        let au1 = build_access_unit(3840, 2160);
        let au2 = build_access_unit(3840, 2160);

        let mut stream = au1.clone();
        stream.extend(&au2);

        let mut parser = HevcParser::new();
        let mut buf: Vec<u8> = Vec::new();
        let mut frame = None;
        for &byte in &stream {
            buf.push(byte);
            if let FrameSize::Complete(size) = parser.compute_frame_size(&buf) {
                frame = Some(buf[..size].to_vec());
                break;
            }
        }

        let frame = frame.expect("no frame boundary found");
        parser.extract_frame_info(&frame).unwrap();
        assert_eq!(parser.seq_parameter_set().pic_width_in_luma_samples(), 3840);
        assert_eq!(
            parser.seq_parameter_set().pic_height_in_luma_samples(),
            2160
        );
    }

    #[test]
    fn missing_sps_is_malformed() {
        let mut au = nal(NaluType::AudNut, &[0x50]);
        au.extend(nal(NaluType::IdrWRadl, &[0xaf, 0x1d, 0x80, 0x94]));

        let mut parser = HevcParser::new();
        assert!(matches!(
            parser.extract_frame_info(&au),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_profile_is_unsupported() {
        // Rewrite general_profile_idc to Main (1) and clear the
        // compatibility flags; the extended constraint block disappears, so
        // conformance must reject the stream rather than defaulting.
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf, true);
            w.write_f(4, 0u32).unwrap();
            w.write_f(3, 0u32).unwrap();
            w.write_f(1, 1u32).unwrap();
            w.write_f(2, 0u32).unwrap(); // general_profile_space
            w.write_f(1, 0u32).unwrap(); // general_tier_flag
            w.write_f(5, 1u32).unwrap(); // general_profile_idc, Main
            w.write_f(32, 0u32).unwrap(); // compatibility flags
            w.write_f(4, 0u32).unwrap(); // source/constraint flags
            w.write_f(32, 0u32).unwrap(); // reserved 44 bits
            w.write_f(12, 0u32).unwrap();
            w.write_f(8, 120u32).unwrap(); // general_level_idc
            w.write_ue(0).unwrap(); // sps_seq_parameter_set_id
            w.write_ue(1).unwrap(); // chroma_format_idc
            w.write_ue(640).unwrap();
            w.write_ue(480).unwrap();
            w.write_f(1, 0u32).unwrap(); // conformance_window_flag
            w.write_ue(0).unwrap(); // bit_depth_luma_minus8
            w.write_ue(0).unwrap(); // bit_depth_chroma_minus8
            w.write_ue(4).unwrap(); // log2_max_pic_order_cnt_lsb_minus4
            w.write_f(1, 0u32).unwrap(); // sps_sub_layer_ordering_info_present_flag
            w.write_ue(0).unwrap();
            w.write_ue(0).unwrap();
            w.write_ue(0).unwrap();
            w.write_ue(0).unwrap();
            w.write_ue(2).unwrap();
            w.write_ue(0).unwrap();
            w.write_ue(3).unwrap();
            w.write_ue(0).unwrap();
            w.write_ue(0).unwrap();
            w.write_f(1, 0u32).unwrap(); // scaling_list_enabled_flag
            w.write_f(1, 0u32).unwrap(); // amp_enabled_flag
            w.write_f(1, 0u32).unwrap(); // sample_adaptive_offset_enabled_flag
            w.write_f(1, 0u32).unwrap(); // pcm_enabled_flag
            w.write_ue(0).unwrap(); // num_short_term_ref_pic_sets
            w.write_f(1, 0u32).unwrap(); // long_term_ref_pics_present_flag
            w.write_f(1, 0u32).unwrap(); // sps_temporal_mvp_enabled_flag
            w.write_f(1, 0u32).unwrap(); // strong_intra_smoothing_enabled_flag
            w.write_f(1, 0u32).unwrap(); // vui_parameters_present_flag
            w.write_f(1, 0u32).unwrap(); // sps_extension_flag
            w.write_f(1, 1u32).unwrap(); // rbsp_stop_one_bit
            w.flush().unwrap();
        }

        let mut au = nal(NaluType::AudNut, &[0x50]);
        au.extend(nal(NaluType::SpsNut, &buf));
        au.extend(nal(NaluType::IdrWRadl, &[0xaf, 0x1d, 0x80, 0x94]));

        let mut parser = HevcParser::new();
        assert!(matches!(
            parser.extract_frame_info(&au),
            Err(ParseError::Unsupported(_))
        ));
        assert!(matches!(
            parser.essence_kind(),
            Err(ParseError::Unsupported(_))
        ));
    }
}
