// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A serialized audio metadata essence parser.
//!
//! Frames are framed into sections: audio essence and fill sections are
//! skipped byte for byte, metadata sections carry an XML payload that is
//! decoded once per stream to obtain channel count, sample rate and bit
//! depth. Section payloads may arrive split across any number of reads, so
//! every read primitive distinguishes "not enough data yet" from malformed
//! input.

use std::collections::BTreeMap;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use enumn::N;
use log::debug;
use log::error;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::parser::EssenceParser;
use crate::parser::FrameSize;
use crate::parser::FrameStart;
use crate::parser::ParseError;
use crate::Rational;
use crate::ZERO_RATIONAL;

const SECTION_HEADER_LENGTH: usize = 6;
const METADATA_PAYLOAD_TAG: u8 = 0x12;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionIdentifier {
    AudioEssence = 0x00,
    MetadataPack = 0x01,
    MetadataPayload = 0x02,
    Fill = 0xff,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MetadataFormat {
    Xml = 0x00,
    Gzip = 0x01,
}

/// One entry per non-essence, non-fill section of the first frame; the
/// container writer creates one metadata sub-descriptor per entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataSectionInfo {
    pub index: u8,
    pub identifier: u8,
}

enum SadmError {
    /// The buffered bytes end before the current field does.
    OutOfData,
    Malformed(String),
}

/// Section-framed re-entrant frame walker.
pub struct SadmParser {
    /// Is the current section's header parsed already?
    section_header_parsed: bool,
    /// Size of the current section's payload.
    section_size: usize,
    /// Number of sections in the frame; zero until the count byte is read.
    sections: u32,
    /// Index byte of the current section.
    current_section_index: u8,
    /// Position in the frame's buffer view. Monotonic within a frame, reset
    /// to zero when a new frame begins.
    stream_pos: usize,
    /// Position within the current section's payload. Never exceeds
    /// `section_size`.
    section_pos: usize,
    /// Frame length accumulated from the section headers.
    frame_length: usize,
    current_section_identifier: SectionIdentifier,
    /// Metadata is constant for a clip's duration and decoded once; this is
    /// deliberately not reset between frames.
    metadata_parsed: bool,
    metadata_header_parsed: bool,
    num_frames_parsed: u32,

    num_metadata_sections: u32,
    sample_rate: Rational,
    bit_depth: u32,
    channels: u32,

    /// Metadata payload bytes, accumulated across reads.
    metadata: Vec<u8>,
    metadata_section_info: BTreeMap<u8, MetadataSectionInfo>,
}

impl Default for SadmParser {
    fn default() -> Self {
        Self {
            section_header_parsed: false,
            section_size: 0,
            sections: 0,
            current_section_index: 0,
            stream_pos: 0,
            section_pos: 0,
            frame_length: 0,
            current_section_identifier: SectionIdentifier::AudioEssence,
            metadata_parsed: false,
            metadata_header_parsed: false,
            num_frames_parsed: 0,
            num_metadata_sections: 0,
            sample_rate: ZERO_RATIONAL,
            bit_depth: 0,
            channels: 0,
            metadata: Vec::new(),
            metadata_section_info: BTreeMap::new(),
        }
    }
}

impl SadmParser {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    pub fn audio_sample_rate(&self) -> Rational {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u32 {
        self.channels
    }

    pub fn num_metadata_sections(&self) -> u32 {
        self.num_metadata_sections
    }

    pub fn metadata_section_info(&self) -> &BTreeMap<u8, MetadataSectionInfo> {
        &self.metadata_section_info
    }

    /// Audio and fill sections are always skipped; metadata sections are
    /// skipped once their content was decoded on the first frame.
    fn skip_section(&self) -> bool {
        if matches!(
            self.current_section_identifier,
            SectionIdentifier::AudioEssence | SectionIdentifier::Fill
        ) {
            return true;
        }
        self.metadata_parsed
    }

    /// Bytes readable right now, capped by both the buffer and the current
    /// section's payload.
    fn bytes_available(&self, data_len: usize) -> usize {
        let buffered = data_len.saturating_sub(self.stream_pos);
        if self.section_header_parsed {
            std::cmp::min(buffered, self.section_size - self.section_pos)
        } else {
            buffered
        }
    }

    fn read_byte(&mut self, data: &[u8]) -> Result<u8, SadmError> {
        if self.bytes_available(data.len()) == 0 {
            return Err(SadmError::OutOfData);
        }

        let byte = data[self.stream_pos];
        self.stream_pos += 1;
        if self.section_header_parsed {
            self.section_pos += 1;
        }
        Ok(byte)
    }

    /// Reads a BER length field: short form carries the length in the low 7
    /// bits, long form carries the number of big-endian length bytes there.
    fn read_ber_length(&mut self, data: &[u8]) -> Result<u32, SadmError> {
        if self.bytes_available(data.len()) < 4 {
            return Err(SadmError::OutOfData);
        }

        let byte0 = self.read_byte(data)?;
        if (byte0 & 0x80) == 0 {
            return Ok(u32::from(byte0 & 0x7f));
        }

        let num_bytes = byte0 & 0x7f;
        if num_bytes > 4 {
            return Err(SadmError::Malformed(format!(
                "BER length field with {} length bytes",
                num_bytes
            )));
        }

        let mut length = 0u32;
        for _ in 0..num_bytes {
            length = (length << 8) | u32::from(self.read_byte(data)?);
        }
        Ok(length)
    }

    fn parse_metadata_header(&mut self, data: &[u8]) -> Result<(), SadmError> {
        // make sure we have enough bytes to read the payload header
        if self.section_size.saturating_sub(self.section_pos) < 7 {
            return Err(SadmError::Malformed(
                "metadata section too short for a payload header".into(),
            ));
        }
        if self.bytes_available(data.len()) < 7 {
            return Err(SadmError::OutOfData);
        }

        let payload_tag = self.read_byte(data)?;
        if payload_tag != METADATA_PAYLOAD_TAG {
            return Err(SadmError::Malformed(format!(
                "invalid metadata payload tag {:#04x}",
                payload_tag
            )));
        }

        let payload_length = self.read_ber_length(data)?;
        self.metadata.clear();
        self.metadata.reserve(payload_length as usize);

        let version = self.read_byte(data)?;
        if version != 0x00 {
            return Err(SadmError::Malformed(format!(
                "unsupported metadata version {}",
                version
            )));
        }

        let format = self.read_byte(data)?;
        match MetadataFormat::n(format) {
            Some(MetadataFormat::Xml) => Ok(()),
            Some(MetadataFormat::Gzip) => Err(SadmError::Malformed(
                "GZIP metadata is not supported yet".into(),
            )),
            None => Err(SadmError::Malformed(format!(
                "invalid metadata format {:#04x}",
                format
            ))),
        }
    }

    /// Parses one section, resuming from the last durable checkpoint when
    /// called again with more data.
    fn parse_section(&mut self, data: &[u8]) -> Result<(), SadmError> {
        debug!(
            "s-ADM: parse section (pos {} / data size {})",
            self.stream_pos,
            data.len()
        );

        if self.sections == 0 {
            let count = self.read_byte(data)?;
            if count < 2 {
                return Err(SadmError::Malformed(
                    "minimum of 2 sections required".into(),
                ));
            }
            self.sections = u32::from(count);
            self.frame_length = 1;
        }

        if !self.section_header_parsed {
            if data.len().saturating_sub(self.stream_pos) < SECTION_HEADER_LENGTH {
                return Err(SadmError::OutOfData);
            }

            self.current_section_index = self.read_byte(data)?;
            let raw_identifier = self.read_byte(data)?;
            let identifier = SectionIdentifier::n(raw_identifier).ok_or_else(|| {
                SadmError::Malformed(format!("invalid section identifier {:#04x}", raw_identifier))
            })?;
            self.current_section_identifier = identifier;

            if !matches!(
                identifier,
                SectionIdentifier::AudioEssence | SectionIdentifier::Fill
            ) {
                // only count on the first frame, constant for the rest of
                // the stream
                if self.num_frames_parsed == 0 {
                    self.num_metadata_sections += 1;
                    self.metadata_section_info.insert(
                        self.current_section_index,
                        MetadataSectionInfo {
                            index: self.current_section_index,
                            identifier: raw_identifier,
                        },
                    );
                }
            }

            debug!("s-ADM: got section {:?}", identifier);

            self.section_size =
                BigEndian::read_u32(&data[self.stream_pos..self.stream_pos + 4]) as usize;
            self.stream_pos += 4;
            self.section_pos = 0;

            debug!("s-ADM: section size {}", self.section_size);

            self.frame_length += SECTION_HEADER_LENGTH + self.section_size;
            self.section_header_parsed = true;
        }

        if self.skip_section() {
            let skip = self.bytes_available(data.len());
            self.stream_pos += skip;
            self.section_pos += skip;
            return Ok(());
        }

        if !self.metadata_header_parsed {
            // The header is parsed atomically: on a short buffer the cursor
            // rolls back so no field is consumed twice.
            let stream_mark = self.stream_pos;
            let section_mark = self.section_pos;
            match self.parse_metadata_header(data) {
                Ok(()) => self.metadata_header_parsed = true,
                Err(SadmError::OutOfData) => {
                    self.stream_pos = stream_mark;
                    self.section_pos = section_mark;
                    return Err(SadmError::OutOfData);
                }
                Err(err) => return Err(err),
            }
        }

        let count = self.bytes_available(data.len());
        self.metadata
            .extend_from_slice(&data[self.stream_pos..self.stream_pos + count]);
        self.stream_pos += count;
        self.section_pos += count;

        if self.section_pos == self.section_size {
            self.parse_metadata_payload()?;
            self.metadata_parsed = true;
        }

        Ok(())
    }

    /// Decodes the buffered XML payload: channel count from the number of
    /// `audioTrackUID` elements, sample rate and bit depth from their
    /// attributes, which all tracks must agree on.
    fn parse_metadata_payload(&mut self) -> Result<(), SadmError> {
        debug!(
            "s-ADM: parsing metadata payload ({} bytes)",
            self.metadata.len()
        );

        let mut sample_rate = self.sample_rate;
        let mut bit_depth = self.bit_depth;
        let mut channels = self.channels;
        let count_channels = !self.metadata_parsed;

        let mut reader = Reader::from_reader(self.metadata.as_slice());
        let mut buf = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| SadmError::Malformed(format!("metadata XML: {}", e)))?;

            match event {
                Event::Eof => break,
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let name = e.local_name();
                    if name.as_ref() == b"frameFormat" {
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                SadmError::Malformed(format!("metadata XML attribute: {}", e))
                            })?;
                            let value = String::from_utf8_lossy(&attr.value);
                            match attr.key.local_name().as_ref() {
                                b"type" if value != "full" => {
                                    return Err(SadmError::Malformed(
                                        "only full frames are supported".into(),
                                    ));
                                }
                                b"frameFormatID" => {
                                    debug!("s-ADM: frame format ID {}", value);
                                }
                                _ => {}
                            }
                        }
                    } else if name.as_ref() == b"audioTrackUID" {
                        if count_channels {
                            channels += 1;
                        }
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                SadmError::Malformed(format!("metadata XML attribute: {}", e))
                            })?;
                            let value = String::from_utf8_lossy(&attr.value);
                            match attr.key.local_name().as_ref() {
                                b"sampleRate" => {
                                    let rate: i32 = value.trim().parse().map_err(|_| {
                                        SadmError::Malformed(format!(
                                            "invalid sampleRate attribute '{}'",
                                            value
                                        ))
                                    })?;
                                    if sample_rate != ZERO_RATIONAL {
                                        if rate != sample_rate.numerator {
                                            return Err(SadmError::Malformed(
                                                "not all tracks have the same sample rate".into(),
                                            ));
                                        }
                                    } else {
                                        sample_rate = Rational::new(rate, 1);
                                    }
                                }
                                b"bitDepth" => {
                                    let depth: u32 = value.trim().parse().map_err(|_| {
                                        SadmError::Malformed(format!(
                                            "invalid bitDepth attribute '{}'",
                                            value
                                        ))
                                    })?;
                                    if bit_depth != 0 {
                                        if depth != bit_depth {
                                            return Err(SadmError::Malformed(
                                                "not all tracks have the same bit depth".into(),
                                            ));
                                        }
                                    } else {
                                        bit_depth = depth;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
                _ => {}
            }

            buf.clear();
        }

        self.sample_rate = sample_rate;
        self.bit_depth = bit_depth;
        self.channels = channels;
        Ok(())
    }

    fn reset_section_info(&mut self) {
        self.section_header_parsed = false;
        self.section_pos = 0;
        self.section_size = 0;
    }

    /// Called in between frames. The decoded metadata fields and the
    /// metadata-parsed flag survive, everything positional resets.
    fn reset_frame_info(&mut self) {
        self.stream_pos = 0;
        self.metadata_header_parsed = false;
        self.current_section_identifier = SectionIdentifier::AudioEssence;
        self.section_header_parsed = false;
        self.section_size = 0;
        self.section_pos = 0;
        self.current_section_index = 0;
        self.sections = 0;
        self.frame_length = 0;
    }
}

impl EssenceParser for SadmParser {
    fn locate_frame_start(&mut self, _data: &[u8]) -> FrameStart {
        FrameStart::Offset(0)
    }

    fn compute_frame_size(&mut self, data: &[u8]) -> FrameSize {
        debug!(
            "s-ADM: compute frame size ({}, {})",
            self.stream_pos,
            data.len()
        );

        // done with the stream
        if data.is_empty() {
            debug!("s-ADM: end of data");
            return FrameSize::Invalid;
        }

        while self.stream_pos < data.len() {
            match self.parse_section(data) {
                Ok(()) => {
                    // end of section reached
                    if self.section_header_parsed && self.section_pos == self.section_size {
                        let last_section =
                            u32::from(self.current_section_index) == self.sections - 1;
                        self.reset_section_info();
                        debug!("s-ADM: section done, on to the next");

                        if last_section {
                            debug!("s-ADM: last section done");
                            let frame_length = self.frame_length;
                            self.reset_frame_info();
                            self.num_frames_parsed += 1;
                            return FrameSize::Complete(frame_length);
                        }
                    }
                }
                Err(SadmError::OutOfData) => return FrameSize::NeedMoreData,
                Err(SadmError::Malformed(msg)) => {
                    error!("invalid s-ADM frame: {}", msg);
                    return FrameSize::Invalid;
                }
            }
        }

        // need more data
        FrameSize::NeedMoreData
    }

    /// Expects the whole frame to be available in one buffer.
    fn extract_frame_info(&mut self, data: &[u8]) -> Result<(), ParseError> {
        let map_err = |e: SadmError| match e {
            SadmError::OutOfData => ParseError::Malformed("frame ends mid section".into()),
            SadmError::Malformed(msg) => ParseError::Malformed(msg),
        };

        self.parse_section(data).map_err(map_err)?;
        self.reset_section_info();
        for _ in 1..self.sections {
            self.parse_section(data).map_err(map_err)?;
            self.reset_section_info();
        }

        // The decoded fields and the metadata-parsed flag survive; the
        // positional state goes back to the start of a frame.
        self.reset_frame_info();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_stream {
    use super::MetadataFormat;
    use super::SectionIdentifier;
    use super::METADATA_PAYLOAD_TAG;

    pub(crate) fn metadata_xml(sample_rate: u32, bit_depth: u32, tracks: usize) -> String {
        let mut xml = String::from("<frame><frameFormat type=\"full\" frameFormatID=\"FF_1\"/>");
        for _ in 0..tracks {
            xml.push_str(&format!(
                "<audioTrackUID sampleRate=\"{}\" bitDepth=\"{}\"/>",
                sample_rate, bit_depth
            ));
        }
        xml.push_str("</frame>");
        xml
    }

    pub(crate) fn metadata_payload(xml: &str, long_form_ber: bool) -> Vec<u8> {
        let mut payload = vec![METADATA_PAYLOAD_TAG];
        if long_form_ber {
            payload.push(0x82);
            payload.extend_from_slice(&(xml.len() as u16).to_be_bytes());
        } else {
            assert!(xml.len() < 128);
            payload.push(xml.len() as u8);
        }
        payload.push(0x00); // version
        payload.push(MetadataFormat::Xml as u8);
        payload.extend_from_slice(xml.as_bytes());
        payload
    }

    pub(crate) fn section(index: u8, identifier: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![index, identifier];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn wrap_frame(metadata: &[u8]) -> Vec<u8> {
        let mut frame = vec![3u8];
        frame.extend(section(
            0,
            SectionIdentifier::AudioEssence as u8,
            &[0xaa; 16],
        ));
        frame.extend(section(1, SectionIdentifier::MetadataPayload as u8, metadata));
        frame.extend(section(2, SectionIdentifier::Fill as u8, &[0x00; 4]));
        frame
    }

    pub(crate) fn build_frame(sample_rate: u32, bit_depth: u32, tracks: usize) -> Vec<u8> {
        wrap_frame(&metadata_payload(
            &metadata_xml(sample_rate, bit_depth, tracks),
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_stream::metadata_payload;
    use super::test_stream::metadata_xml;
    use super::test_stream::section;
    use super::test_stream::wrap_frame;
    use super::*;

    #[test]
    fn whole_frame_consumes_exactly_the_computed_length() {
        let xml = metadata_xml(48000, 24, 2);
        let frame = wrap_frame(&metadata_payload(&xml, true));

        let mut parser = SadmParser::new();
        assert_eq!(parser.locate_frame_start(&frame), FrameStart::Offset(0));
        assert_eq!(
            parser.compute_frame_size(&frame),
            FrameSize::Complete(frame.len())
        );

        assert_eq!(parser.channel_count(), 2);
        assert_eq!(parser.audio_sample_rate(), Rational::new(48000, 1));
        assert_eq!(parser.bit_depth(), 24);
        assert_eq!(parser.num_metadata_sections(), 1);
        let info = parser.metadata_section_info().get(&1).copied().unwrap();
        assert_eq!(info.index, 1);
        assert_eq!(info.identifier, SectionIdentifier::MetadataPayload as u8);
    }

    #[test]
    fn split_sections_resume_without_rereading_headers() {
        let _ = env_logger::try_init();

        let xml = metadata_xml(48000, 24, 2);
        let frame = wrap_frame(&metadata_payload(&xml, false));

        let mut parser = SadmParser::new();
        let mut buf: Vec<u8> = Vec::new();
        let mut result = FrameSize::NeedMoreData;
        for &byte in &frame {
            assert_eq!(result, FrameSize::NeedMoreData, "resolved early");
            buf.push(byte);
            result = parser.compute_frame_size(&buf);
        }

        assert_eq!(result, FrameSize::Complete(frame.len()));
        // Channels counted once, not once per retry.
        assert_eq!(parser.channel_count(), 2);
        assert_eq!(parser.bit_depth(), 24);
    }

    #[test]
    fn fewer_than_two_sections_is_rejected() {
        let mut frame = vec![1u8];
        frame.extend(section(0, SectionIdentifier::AudioEssence as u8, &[0x00; 8]));

        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&frame), FrameSize::Invalid);
    }

    #[test]
    fn invalid_section_identifier_is_rejected() {
        let mut frame = vec![2u8];
        frame.extend(section(0, 0x77, &[0x00; 8]));
        frame.extend(section(1, SectionIdentifier::Fill as u8, &[0x00; 4]));

        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&frame), FrameSize::Invalid);
    }

    #[test]
    fn gzip_metadata_is_rejected() {
        let xml = metadata_xml(48000, 24, 1);
        let mut payload = metadata_payload(&xml, false);
        payload[3] = MetadataFormat::Gzip as u8;
        let frame = wrap_frame(&payload);

        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&frame), FrameSize::Invalid);
    }

    #[test]
    fn disagreeing_track_attributes_are_rejected() {
        let xml = "<frame><audioTrackUID sampleRate=\"48000\" bitDepth=\"24\"/>\
                   <audioTrackUID sampleRate=\"96000\" bitDepth=\"24\"/></frame>";
        let frame = wrap_frame(&metadata_payload(xml, false));

        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&frame), FrameSize::Invalid);
    }

    #[test]
    fn non_full_frame_format_is_rejected() {
        let xml = "<frame><frameFormat type=\"header\"/></frame>";
        let frame = wrap_frame(&metadata_payload(xml, false));

        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&frame), FrameSize::Invalid);
    }

    #[test]
    fn metadata_is_decoded_once_per_stream() {
        let xml = metadata_xml(96000, 16, 4);
        let frame = wrap_frame(&metadata_payload(&xml, false));

        let mut stream = frame.clone();
        stream.extend(&frame);

        let mut parser = SadmParser::new();
        assert_eq!(
            parser.compute_frame_size(&stream),
            FrameSize::Complete(frame.len())
        );
        assert_eq!(parser.channel_count(), 4);

        // The second frame's metadata section is skipped byte for byte; the
        // decoded fields stay as they are.
        assert_eq!(
            parser.compute_frame_size(&stream[frame.len()..]),
            FrameSize::Complete(frame.len())
        );
        assert_eq!(parser.channel_count(), 4);
        assert_eq!(parser.num_metadata_sections(), 1);
    }

    #[test]
    fn end_of_stream_is_definitive() {
        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&[]), FrameSize::Invalid);
    }

    #[test]
    fn frame_info_from_a_whole_frame() {
        // A track writer hands a complete frame to a fresh parser.
        let xml = metadata_xml(48000, 24, 8);
        let frame = wrap_frame(&metadata_payload(&xml, false));

        let mut parser = SadmParser::new();
        parser.extract_frame_info(&frame).unwrap();

        assert_eq!(parser.channel_count(), 8);
        assert_eq!(parser.audio_sample_rate(), Rational::new(48000, 1));
        assert_eq!(parser.bit_depth(), 24);
        assert_eq!(parser.num_metadata_sections(), 1);
    }

    #[test]
    fn bad_payload_tag_is_rejected() {
        let xml = metadata_xml(48000, 24, 1);
        let mut payload = metadata_payload(&xml, false);
        payload[0] = 0x99;
        let frame = wrap_frame(&payload);

        let mut parser = SadmParser::new();
        assert_eq!(parser.compute_frame_size(&frame), FrameSize::Invalid);
    }
}
