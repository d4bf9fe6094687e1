// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Populates container file descriptors from decoded essence headers.
//!
//! The container writer persists one descriptor per essence stream; the
//! functions here translate a parser's decoded record into the typed fields
//! the writer needs, including the signalled-code to descriptor-value
//! mapping tables. Unmapped color metadata codes are logged and left unset;
//! everything else outside the supported profiles was already rejected by
//! the parsers.

use log::warn;

use crate::parser::hevc::HevcParser;
use crate::parser::hevc::SeqParameterSet;
use crate::parser::hevc::ASPECT_RATIO_IDC_EXTENDED_SAR;
use crate::parser::iab::IabParser;
use crate::parser::isxd::IsxdParser;
use crate::parser::sadm::SadmParser;
use crate::parser::ParseError;
use crate::Rational;
use crate::Resolution;

/// The essence kinds this crate can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EssenceKind {
    HevcMain42210Intra,
    HevcMain10Intra,
    ImmersiveAudio,
    SerializedAudioMetadata,
    XmlData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorPrimaries {
    Itu709,
    Itu470Pal,
    Smpte170M,
    Itu2020,
    SmpteDcdm,
    P3D65,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferCharacteristic {
    Itu709,
    Itu470,
    Smpte240M,
    Linear,
    Iec6196624Xvycc,
    Itu1361,
    Itu2020,
    SmpteSt2084,
    HlgOetf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodingEquations {
    Gbr,
    Itu709,
    Itu601,
    Smpte240M,
    YCgCo,
    Itu2020Ncl,
}

/// Maps a signalled colour_primaries code to a descriptor value.
pub fn map_color_primaries(code: u8) -> Option<ColorPrimaries> {
    match code {
        1 => Some(ColorPrimaries::Itu709),
        4 | 5 => Some(ColorPrimaries::Itu470Pal),
        6 => Some(ColorPrimaries::Smpte170M),
        9 => Some(ColorPrimaries::Itu2020),
        // SMPTE P3DCI, ST 2113
        11 => Some(ColorPrimaries::SmpteDcdm),
        12 => Some(ColorPrimaries::P3D65),
        _ => {
            warn!("colour_primaries value {} is not mapped", code);
            None
        }
    }
}

/// Maps a signalled transfer_characteristics code to a descriptor value.
pub fn map_transfer_characteristic(code: u8) -> Option<TransferCharacteristic> {
    match code {
        1 => Some(TransferCharacteristic::Itu709),
        4 | 5 => Some(TransferCharacteristic::Itu470),
        7 => Some(TransferCharacteristic::Smpte240M),
        8 => Some(TransferCharacteristic::Linear),
        11 => Some(TransferCharacteristic::Iec6196624Xvycc),
        12 => Some(TransferCharacteristic::Itu1361),
        14 | 15 => Some(TransferCharacteristic::Itu2020),
        16 => Some(TransferCharacteristic::SmpteSt2084),
        // ITU-R BT.2100-2 hybrid log gamma
        18 => Some(TransferCharacteristic::HlgOetf),
        _ => {
            warn!("transfer_characteristics value {} is not mapped", code);
            None
        }
    }
}

/// Maps a signalled matrix_coeffs code to a descriptor value.
pub fn map_coding_equations(code: u8) -> Option<CodingEquations> {
    match code {
        0 => Some(CodingEquations::Gbr),
        1 => Some(CodingEquations::Itu709),
        5 | 6 => Some(CodingEquations::Itu601),
        7 => Some(CodingEquations::Smpte240M),
        8 => Some(CodingEquations::YCgCo),
        9 => Some(CodingEquations::Itu2020Ncl),
        // constant luminance system, no descriptor value
        10 => None,
        _ => {
            warn!("matrix_coeffs value {} is not mapped", code);
            None
        }
    }
}

/// Table E.1, aspect_ratio_idc to sample aspect ratio.
static ASPECT_RATIOS: [Rational; 17] = [
    Rational::new(0, 1),
    Rational::new(1, 1),
    Rational::new(12, 11),
    Rational::new(10, 11),
    Rational::new(16, 11),
    Rational::new(40, 33),
    Rational::new(24, 11),
    Rational::new(20, 11),
    Rational::new(32, 11),
    Rational::new(80, 33),
    Rational::new(18, 11),
    Rational::new(15, 11),
    Rational::new(64, 33),
    Rational::new(160, 99),
    Rational::new(4, 3),
    Rational::new(3, 2),
    Rational::new(2, 1),
];

pub fn aspect_ratio_for_idc(aspect_ratio_idc: u8) -> Option<Rational> {
    ASPECT_RATIOS.get(aspect_ratio_idc as usize).copied()
}

/// Display aspect ratio for the sequence, from the extended SAR or the
/// aspect ratio table.
fn aspect_ratio_from_sps(sps: &SeqParameterSet) -> Rational {
    if !sps.have_aspect_ratio_info() {
        return Rational::new(0, 1);
    }

    if sps.aspect_ratio_idc() == ASPECT_RATIO_IDC_EXTENDED_SAR {
        Rational::new(
            sps.sar_width() as i32 * sps.pic_width_in_luma_samples() as i32,
            sps.sar_height() as i32 * sps.pic_height_in_luma_samples() as i32,
        )
        .reduce()
    } else {
        match aspect_ratio_for_idc(sps.aspect_ratio_idc()) {
            Some(aspect_ratio) => aspect_ratio.reduce(),
            None => {
                warn!("invalid aspect_ratio_idc {}", sps.aspect_ratio_idc());
                Rational::new(0, 1)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureDescriptor {
    pub resolution: Resolution,
    pub component_depth: u32,
    pub horizontal_subsampling: u32,
    pub vertical_subsampling: u32,
    pub aspect_ratio: Rational,
    pub color_primaries: Option<ColorPrimaries>,
    pub transfer_characteristic: Option<TransferCharacteristic>,
    pub coding_equations: Option<CodingEquations>,
    pub profile: u8,
    pub level: u8,
    pub tier: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoundDescriptor {
    pub sample_rate: Rational,
    pub bit_depth: u32,
    pub channel_count: u32,
    pub frame_rate: Option<Rational>,
    /// One metadata sub-descriptor is created per counted section.
    pub metadata_section_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDescriptor {
    pub namespace_uri: String,
    pub root_element_name: String,
}

/// A descriptor for one essence stream, tagged by stream kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EssenceDescriptor {
    Picture(PictureDescriptor),
    Sound(SoundDescriptor),
    Data(DataDescriptor),
}

/// Builds the picture descriptor for a decoded HEVC access unit.
pub fn picture_descriptor_from_hevc(parser: &HevcParser) -> Result<PictureDescriptor, ParseError> {
    if parser.essence_kind()? != EssenceKind::HevcMain42210Intra {
        return Err(ParseError::Unsupported(
            "only HEVC Main 4:2:2 10 Intra pictures are described".into(),
        ));
    }

    let sps = parser.seq_parameter_set();

    let (color_primaries, transfer_characteristic, coding_equations) =
        if sps.have_color_description() {
            (
                map_color_primaries(sps.color_primaries()),
                map_transfer_characteristic(sps.transfer_characteristics()),
                map_coding_equations(sps.matrix_coeffs()),
            )
        } else {
            (None, None, None)
        };

    Ok(PictureDescriptor {
        resolution: Resolution {
            width: sps.pic_width_in_luma_samples(),
            height: sps.pic_height_in_luma_samples(),
        },
        component_depth: sps.bit_depth_luma_minus8() + 8,
        // 4:2:2 chroma
        horizontal_subsampling: 2,
        vertical_subsampling: 1,
        aspect_ratio: aspect_ratio_from_sps(sps),
        color_primaries,
        transfer_characteristic,
        coding_equations,
        profile: sps.general_profile_idc(),
        level: sps.general_level_idc(),
        tier: sps.general_tier_flag() as u8,
    })
}

/// Builds the sound descriptor for a decoded immersive audio frame.
pub fn sound_descriptor_from_iab(parser: &IabParser) -> SoundDescriptor {
    SoundDescriptor {
        sample_rate: parser.sample_rate(),
        bit_depth: parser.bit_depth(),
        channel_count: parser.channel_count(),
        frame_rate: Some(parser.frame_rate()),
        metadata_section_count: 0,
    }
}

/// Builds the sound descriptor for a decoded serialized audio metadata
/// stream.
pub fn sound_descriptor_from_sadm(parser: &SadmParser) -> SoundDescriptor {
    SoundDescriptor {
        sample_rate: parser.audio_sample_rate(),
        bit_depth: parser.bit_depth(),
        channel_count: parser.channel_count(),
        frame_rate: None,
        metadata_section_count: parser.num_metadata_sections(),
    }
}

/// Builds the data descriptor for an XML data essence stream.
pub fn data_descriptor_from_isxd(parser: &IsxdParser) -> DataDescriptor {
    DataDescriptor {
        namespace_uri: parser.namespace_uri().to_owned(),
        root_element_name: parser.root_element_name().to_owned(),
    }
}
