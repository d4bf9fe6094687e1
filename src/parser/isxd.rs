// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An XML data essence parser.
//!
//! Each frame is one XML document followed by a delimiter byte. The parser
//! streams events over the growing buffer, captures the namespace and local
//! name of the first start element as the expected root, and declares the
//! frame complete when the matching end element is seen. Only whole XML
//! events advance the durable cursor, so a buffer ending mid token is simply
//! retried once more bytes arrive.

use log::debug;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::parser::EssenceParser;
use crate::parser::FrameSize;
use crate::parser::FrameStart;
use crate::parser::ParseError;

/// Producers of version 2.0 vendor documents sometimes omit the namespace
/// declaration; it is inferred for interoperability.
const DOLBY_VISION_ELEMENT: &[u8] = b"DolbyVisionGlobalData";
const DOLBY_VISION_2_0_NAMESPACE: &str = "http://www.dolby.com/schemas/dvmd/2_0_5";

/// Streaming namespace-aware XML frame walker.
#[derive(Default)]
pub struct IsxdParser {
    /// Bytes consumed as whole XML events; the resume point for the next
    /// call.
    pos: usize,
    /// One past the root's closing tag once the frame is fully parsed.
    bytes_read: usize,
    full_frame_parsed: bool,
    /// Captured from the first start element of the stream and kept across
    /// frames.
    namespace_uri: String,
    root_element_name: String,
}

impl IsxdParser {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn namespace_uri(&self) -> &str {
        &self.namespace_uri
    }

    pub fn root_element_name(&self) -> &str {
        &self.root_element_name
    }

    /// Reset between frames; the captured root identity survives.
    fn reset_parser(&mut self) {
        self.pos = 0;
        self.bytes_read = 0;
        self.full_frame_parsed = false;
    }

    fn handle_start_element(&mut self, reader: &NsReader<&[u8]>, e: &quick_xml::events::BytesStart) {
        if self.root_element_name.is_empty() {
            let (resolution, local) = reader.resolve_element(e.name());
            self.root_element_name = String::from_utf8_lossy(local.as_ref()).into_owned();
            if let ResolveResult::Bound(ns) = resolution {
                self.namespace_uri = String::from_utf8_lossy(ns.as_ref()).into_owned();
            }
            debug!(
                "XML data essence root: {{{}}}{}",
                self.namespace_uri, self.root_element_name
            );
        }

        // No namespace established: infer it from the vendor element's
        // version attribute.
        if self.namespace_uri.is_empty() && e.local_name().as_ref() == DOLBY_VISION_ELEMENT {
            for attr in e.attributes().flatten() {
                if attr.key.local_name().as_ref() == b"version" && attr.value.starts_with(b"2.0") {
                    self.namespace_uri = DOLBY_VISION_2_0_NAMESPACE.into();
                }
            }
        }
    }

    fn is_root_end(&self, local_name: &[u8]) -> bool {
        !self.root_element_name.is_empty() && local_name == self.root_element_name.as_bytes()
    }

    /// Consumes whole XML events from the resume point. Returns with
    /// `full_frame_parsed` unset when the buffered bytes end mid document.
    fn parse_frame_info(&mut self, data: &[u8]) {
        let base = self.pos;
        let mut reader = NsReader::from_reader(&data[base..]);
        // A resumed view starts mid document, so end tags cannot be matched
        // against their start tags here.
        reader.config_mut().check_end_names = false;

        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => return,
                Ok(event) => {
                    match &event {
                        Event::Start(e) => self.handle_start_element(&reader, e),
                        Event::Empty(e) => {
                            self.handle_start_element(&reader, e);
                            if self.is_root_end(e.local_name().as_ref()) {
                                self.full_frame_parsed = true;
                            }
                        }
                        Event::End(e) => {
                            if self.is_root_end(e.local_name().as_ref()) {
                                self.full_frame_parsed = true;
                            }
                        }
                        _ => {}
                    }

                    self.pos = base + reader.buffer_position() as usize;

                    if self.full_frame_parsed {
                        self.bytes_read = self.pos;
                        return;
                    }
                }
                // The tail may be an incomplete token rather than broken
                // XML; wait for more bytes to decide.
                Err(_) => return,
            }

            buf.clear();
        }
    }
}

impl EssenceParser for IsxdParser {
    fn locate_frame_start(&mut self, _data: &[u8]) -> FrameStart {
        FrameStart::Offset(0)
    }

    fn compute_frame_size(&mut self, data: &[u8]) -> FrameSize {
        // done with the stream
        if data.is_empty() {
            return FrameSize::Invalid;
        }

        if !self.full_frame_parsed {
            self.parse_frame_info(data);
        }

        if self.full_frame_parsed {
            // One byte of lookahead decides whether the delimiter is a
            // newline.
            if self.bytes_read >= data.len() {
                return FrameSize::NeedMoreData;
            }

            let mut size = self.bytes_read;
            if data[size] == b'\n' {
                size += 1;
            }

            self.reset_parser();
            return FrameSize::Complete(size);
        }

        FrameSize::NeedMoreData
    }

    fn extract_frame_info(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if self.root_element_name.is_empty() {
            self.parse_frame_info(data);
        }

        if self.root_element_name.is_empty() {
            return Err(ParseError::Malformed("no XML root element".into()));
        }
        Ok(())
    }
}
