// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An immersive audio bitstream essence parser.
//!
//! Walks the nested tag/length element tree of each frame by recursive
//! descent, descending only into the elements that carry the fields a
//! container writer needs: the frame element (version, sample rate, bit
//! depth, frame rate) and the bed definition element (channel count).

use enumn::N;
use log::debug;
use log::error;

use crate::bitstream_utils::TagReadError;
use crate::bitstream_utils::TagReader;
use crate::parser::EssenceParser;
use crate::parser::FrameSize;
use crate::parser::FrameStart;
use crate::parser::ParseError;
use crate::Rational;
use crate::FRAME_RATE_100;
use crate::FRAME_RATE_120;
use crate::FRAME_RATE_23976;
use crate::FRAME_RATE_24;
use crate::FRAME_RATE_25;
use crate::FRAME_RATE_30;
use crate::FRAME_RATE_48;
use crate::FRAME_RATE_50;
use crate::FRAME_RATE_60;
use crate::FRAME_RATE_96;
use crate::SAMPLING_RATE_48K;
use crate::SAMPLING_RATE_96K;

const PREAMBLE_TAG: u32 = 0x01;
const IA_FRAME_TAG: u32 = 0x02;

/// The element identifiers of the bitstream.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ElementId {
    IaFrame = 0x08,
    BedDefinition = 0x10,
    BedRemap = 0x20,
    ObjectDefinition = 0x40,
    ObjectZoneDefinition = 0x80,
    AuthoringToolInfo = 0x100,
    UserData = 0x101,
    AudioDataDlc = 0x200,
    AudioDataPcm = 0x400,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IabSampleRate {
    Hz48000 = 0,
    Hz96000 = 1,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IabBitDepth {
    Bits16 = 0,
    Bits24 = 1,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IabFrameRate {
    Fps24 = 0,
    Fps25 = 1,
    Fps30 = 2,
    Fps48 = 3,
    Fps50 = 4,
    Fps60 = 5,
    Fps96 = 6,
    Fps100 = 7,
    Fps120 = 8,
    Fps23976 = 9,
}

enum IabError {
    /// The buffered bytes end before the current field does.
    OutOfData,
    Malformed(String),
}

impl From<TagReadError> for IabError {
    fn from(err: TagReadError) -> Self {
        match err {
            TagReadError::OutOfBits => IabError::OutOfData,
            other => IabError::Malformed(other.to_string()),
        }
    }
}

/// Recursive descent walker over immersive audio frames.
#[derive(Default)]
pub struct IabParser {
    /// Set once the frame header and the leading elements were walked; the
    /// size computation then only waits for the frame body bytes.
    frame_header_parsed: bool,
    frame_length: usize,
    /// Short-circuits descent once every needed field is known.
    necessary_info_acquired: bool,
    version: u8,
    sample_rate: Option<IabSampleRate>,
    bit_depth: Option<IabBitDepth>,
    frame_rate: Option<IabFrameRate>,
    channel_count: u32,
}

impl IabParser {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn have_sample_rate(&self) -> bool {
        self.sample_rate.is_some()
    }

    /// Panics if no frame element was parsed yet; check
    /// [`Self::have_sample_rate`] first.
    pub fn sample_rate(&self) -> Rational {
        match self.sample_rate {
            Some(IabSampleRate::Hz48000) => SAMPLING_RATE_48K,
            Some(IabSampleRate::Hz96000) => SAMPLING_RATE_96K,
            None => panic!("sample rate queried before a frame was parsed"),
        }
    }

    pub fn have_bit_depth(&self) -> bool {
        self.bit_depth.is_some()
    }

    /// Panics if no frame element was parsed yet; check
    /// [`Self::have_bit_depth`] first.
    pub fn bit_depth(&self) -> u32 {
        match self.bit_depth {
            Some(IabBitDepth::Bits16) => 16,
            Some(IabBitDepth::Bits24) => 24,
            None => panic!("bit depth queried before a frame was parsed"),
        }
    }

    pub fn have_frame_rate(&self) -> bool {
        self.frame_rate.is_some()
    }

    /// Panics if no frame element was parsed yet; check
    /// [`Self::have_frame_rate`] first.
    pub fn frame_rate(&self) -> Rational {
        match self.frame_rate {
            Some(IabFrameRate::Fps23976) => FRAME_RATE_23976,
            Some(IabFrameRate::Fps24) => FRAME_RATE_24,
            Some(IabFrameRate::Fps25) => FRAME_RATE_25,
            Some(IabFrameRate::Fps30) => FRAME_RATE_30,
            Some(IabFrameRate::Fps48) => FRAME_RATE_48,
            Some(IabFrameRate::Fps50) => FRAME_RATE_50,
            Some(IabFrameRate::Fps60) => FRAME_RATE_60,
            Some(IabFrameRate::Fps96) => FRAME_RATE_96,
            Some(IabFrameRate::Fps100) => FRAME_RATE_100,
            Some(IabFrameRate::Fps120) => FRAME_RATE_120,
            None => panic!("frame rate queried before a frame was parsed"),
        }
    }

    pub fn have_channel_count(&self) -> bool {
        self.channel_count != 0
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    fn reset_frame_info(&mut self) {
        self.frame_header_parsed = false;
        self.frame_length = 0;
        self.necessary_info_acquired = false;
        self.version = 0;
        self.sample_rate = None;
        self.bit_depth = None;
        self.frame_rate = None;
        self.channel_count = 0;
    }

    fn parse_frame_info(&mut self, data: &[u8]) -> Result<(), IabError> {
        self.reset_frame_info();

        debug!("parse new IAB frame");

        let mut r = TagReader::new(data);

        Self::read_preamble(&mut r)?;

        let tag = r.read(8)?;
        if tag != IA_FRAME_TAG {
            return Err(IabError::Malformed(format!("invalid frame tag {:#04x}", tag)));
        }

        let frame_length = r.read(32)?;
        debug!("frame length: {}", frame_length);

        let offset = r.bit_offset();
        debug_assert!(offset % 8 == 0);

        // preamble and frame header, then the frame body
        self.frame_length = offset / 8 + frame_length as usize;

        self.read_element(&mut r)
    }

    fn read_preamble(r: &mut TagReader) -> Result<(), IabError> {
        let preamble_tag = r.read(8)?;
        if preamble_tag != PREAMBLE_TAG {
            return Err(IabError::Malformed(format!(
                "invalid preamble tag {:#04x}",
                preamble_tag
            )));
        }

        let preamble_length = r.read(32)?;
        r.skip(preamble_length as usize * 8)?;
        Ok(())
    }

    fn read_element(&mut self, r: &mut TagReader) -> Result<(), IabError> {
        // skip the rest of the stream if we have all info we need
        if self.necessary_info_acquired {
            return Ok(());
        }

        let raw_id = r.read_plex(8)?;
        let element_id = match ElementId::n(raw_id) {
            Some(id) => id,
            None => {
                error!("invalid IAB element ID: {:#06x}", raw_id);
                return Err(IabError::Malformed(format!(
                    "invalid element ID {:#06x}",
                    raw_id
                )));
            }
        };

        let element_length = r.read_plex(8)?;
        debug!(
            "element ID: {:?}, element length: {}",
            element_id, element_length
        );

        match element_id {
            // carries frame rate, sample rate and bit depth
            ElementId::IaFrame => self.read_ia_frame(r),
            // carries the channel count
            ElementId::BedDefinition => self.read_bed_definition(r),
            _ => {
                // Anything else carries nothing we need; stop descending.
                self.necessary_info_acquired = true;
                Ok(())
            }
        }
    }

    fn read_ia_frame(&mut self, r: &mut TagReader) -> Result<(), IabError> {
        let version = r.read(8)?;
        if version != 0x01 {
            return Err(IabError::Malformed(format!(
                "unsupported bitstream version {}",
                version
            )));
        }

        let sample_rate = r.read(2)?;
        let bit_depth = r.read(2)?;
        let frame_rate = r.read(4)?;

        let max_rendered = r.read_plex(8)?;
        let num_sub_elements = r.read_plex(8)?;

        debug!(
            "IA frame: version {}, sample rate code {}, bit depth code {}, frame rate code {}, \
             max rendered {}, sub elements {}",
            version, sample_rate, bit_depth, frame_rate, max_rendered, num_sub_elements
        );

        self.version = version as u8;
        self.sample_rate = IabSampleRate::n(sample_rate as u8);
        self.bit_depth = IabBitDepth::n(bit_depth as u8);
        self.frame_rate = IabFrameRate::n(frame_rate as u8);

        for _ in 0..num_sub_elements {
            self.read_element(r)?;
        }

        Ok(())
    }

    fn read_bed_definition(&mut self, r: &mut TagReader) -> Result<(), IabError> {
        r.read_plex(8)?; // meta ID

        let conditional_bed = r.read(1)?;
        if conditional_bed != 0 {
            r.read(8)?; // bed use case
        }

        let channel_count = r.read_plex(4)?;
        debug!("channel count: {}", channel_count);

        if channel_count == 0 {
            return Err(IabError::Malformed("bed definition with no channels".into()));
        }
        self.channel_count = channel_count;

        // done, no more data needed
        self.necessary_info_acquired = true;
        Ok(())
    }
}

impl EssenceParser for IabParser {
    fn locate_frame_start(&mut self, _data: &[u8]) -> FrameStart {
        FrameStart::Offset(0)
    }

    fn compute_frame_size(&mut self, data: &[u8]) -> FrameSize {
        // done with the stream
        if data.is_empty() {
            return FrameSize::Invalid;
        }

        if !self.frame_header_parsed {
            match self.parse_frame_info(data) {
                Ok(()) => self.frame_header_parsed = true,
                Err(IabError::OutOfData) => return FrameSize::NeedMoreData,
                Err(IabError::Malformed(msg)) => {
                    error!("error parsing IAB: {}", msg);
                    return FrameSize::Invalid;
                }
            }
        }

        // done with the frame
        if data.len() >= self.frame_length {
            // reset for the next frame
            self.frame_header_parsed = false;
            return FrameSize::Complete(self.frame_length);
        }

        FrameSize::NeedMoreData
    }

    fn extract_frame_info(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.parse_frame_info(data).map_err(|e| match e {
            IabError::OutOfData => ParseError::Malformed("frame ends mid element".into()),
            IabError::Malformed(msg) => ParseError::Malformed(msg),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_stream {
    use super::ElementId;
    use super::IabBitDepth;
    use super::IabSampleRate;
    use super::IA_FRAME_TAG;
    use super::PREAMBLE_TAG;
    use crate::bitstream_utils::BitWriter;

    /// Builds a frame body holding one IA frame element with a single bed
    /// definition sub element.
    pub(crate) fn build_frame_body(channel_count: u32) -> Vec<u8> {
        let mut body = Vec::new();
        let mut w = BitWriter::new(&mut body, false);

        w.write_f(8, ElementId::IaFrame as u32).unwrap();
        w.write_f(8, 0x20u32).unwrap(); // element length, unused by the walker
        w.write_f(8, 0x01u32).unwrap(); // version
        w.write_f(2, IabSampleRate::Hz48000 as u32).unwrap();
        w.write_f(2, IabBitDepth::Bits24 as u32).unwrap();
        w.write_f(4, 0u32).unwrap(); // frame rate code 0, 24 fps
        w.write_f(8, 2u32).unwrap(); // max rendered, plex(8)
        w.write_f(8, 1u32).unwrap(); // sub element count, plex(8)

        // bed definition sub element
        w.write_f(8, ElementId::BedDefinition as u32).unwrap();
        w.write_f(8, 0x08u32).unwrap(); // element length
        w.write_f(8, 0x01u32).unwrap(); // meta ID, plex(8)
        w.write_f(1, 0u32).unwrap(); // conditional bed
        if channel_count < 15 {
            w.write_f(4, channel_count).unwrap();
        } else {
            // plex(4) escape to 8 bits
            w.write_f(4, 0xfu32).unwrap();
            w.write_f(8, channel_count).unwrap();
        }
        w.flush().unwrap();
        drop(w);

        // trailing audio payload the walker never visits
        body.extend_from_slice(&[0xa5; 24]);
        body
    }

    pub(crate) fn wrap_frame(preamble: &[u8], body: &[u8]) -> Vec<u8> {
        let mut data = vec![PREAMBLE_TAG as u8];
        data.extend_from_slice(&(preamble.len() as u32).to_be_bytes());
        data.extend_from_slice(preamble);
        data.push(IA_FRAME_TAG as u8);
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(body);
        data
    }

    pub(crate) fn build_frame(channel_count: u32) -> Vec<u8> {
        wrap_frame(&[], &build_frame_body(channel_count))
    }
}
