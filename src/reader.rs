// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives an essence parser against a growing read buffer.
//!
//! The reader appends fixed-size blocks from its source, asks the parser
//! whether a complete frame is buffered and retries until it is; resolved
//! frames accumulate at the front of the buffer until the caller collects
//! them.

use std::io::ErrorKind;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use log::warn;

use crate::parser::hevc::HevcParser;
use crate::parser::EssenceParser;
use crate::parser::FrameSize;
use crate::parser::FrameStart;

const READ_BLOCK_SIZE: usize = 8192;
const PARSE_FRAME_START_SIZE: usize = 8192;

/// Reads raw HEVC essence from a byte source, one access unit at a time.
pub struct HevcRawEssenceReader<R: Read> {
    source: R,
    parser: HevcParser,
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` belonging to resolved samples.
    sample_data_size: usize,
    num_samples: u32,
    read_first_sample: bool,
    last_sample_read: bool,
    /// Bounds buffer growth when a stream never produces a valid boundary.
    max_sample_size: Option<usize>,
}

impl<R: Read> HevcRawEssenceReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            parser: HevcParser::new(),
            buffer: Vec::new(),
            sample_data_size: 0,
            num_samples: 0,
            read_first_sample: false,
            last_sample_read: false,
            max_sample_size: None,
        }
    }

    pub fn with_max_sample_size(source: R, max_sample_size: usize) -> Self {
        Self {
            max_sample_size: Some(max_sample_size),
            ..Self::new(source)
        }
    }

    pub fn parser(&self) -> &HevcParser {
        &self.parser
    }

    pub fn parser_mut(&mut self) -> &mut HevcParser {
        &mut self.parser
    }

    /// The bytes of the samples resolved by the last `read_samples` call.
    pub fn sample_data(&self) -> &[u8] {
        &self.buffer[..self.sample_data_size]
    }

    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }

    /// Reads up to `num_samples` access units, returning how many were
    /// resolved. Returns 0 once the stream is exhausted.
    pub fn read_samples(&mut self, num_samples: u32) -> anyhow::Result<u32> {
        if self.last_sample_read {
            return Ok(0);
        }

        // Drop the samples of the previous read, keeping any bytes already
        // read beyond them.
        self.buffer.drain(..self.sample_data_size);
        self.sample_data_size = 0;
        self.num_samples = 0;

        for _ in 0..num_samples {
            if !self.read_and_parse()? {
                break;
            }
        }

        Ok(self.num_samples)
    }

    fn read_and_parse(&mut self) -> anyhow::Result<bool> {
        let sample_start = self.sample_data_size;

        if !self.read_first_sample {
            // find the start of the first sample
            self.read_bytes(PARSE_FRAME_START_SIZE)?;
            match self.parser.locate_frame_start(&self.buffer[sample_start..]) {
                FrameStart::Offset(offset) => {
                    // shift the start of the first sample to the front
                    self.buffer.drain(sample_start..sample_start + offset);
                }
                FrameStart::NeedMoreData => {
                    warn!("failed to find the start of a raw essence sample");
                    self.last_sample_read = true;
                    return Ok(false);
                }
            }
            self.read_first_sample = true;
        } else {
            self.read_bytes(READ_BLOCK_SIZE)?;
        }

        let sample_size = loop {
            match self.parser.compute_frame_size(&self.buffer[sample_start..]) {
                FrameSize::Complete(size) => break Some(size),
                FrameSize::Invalid => break None,
                FrameSize::NeedMoreData => {}
            }

            if let Some(max) = self.max_sample_size {
                if self.buffer.len() - sample_start > max {
                    bail!("maximum raw sample size ({}) exceeded", max);
                }
            }

            let num_read = self.read_bytes(READ_BLOCK_SIZE)?;
            if num_read == 0 {
                // end of stream: ask for the final frame
                match self.parser.compute_frame_size(&[]) {
                    FrameSize::Complete(size) => break Some(size),
                    _ => break None,
                }
            }
        };

        match sample_size {
            Some(size) => {
                // The end-of-stream size may overshoot the scan guard.
                let size = std::cmp::min(size, self.buffer.len() - sample_start);
                self.sample_data_size += size;
                self.num_samples += 1;
                Ok(true)
            }
            None => {
                // invalid or exhausted sample data
                self.last_sample_read = true;
                Ok(false)
            }
        }
    }

    /// Appends up to `count` bytes from the source, returning how many
    /// arrived.
    fn read_bytes(&mut self, count: usize) -> anyhow::Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + count, 0);

        let mut total = 0;
        while total < count {
            match self.source.read(&mut self.buffer[start + total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buffer.truncate(start);
                    return Err(e).context("reading essence source");
                }
            }
        }

        self.buffer.truncate(start + total);
        Ok(total)
    }
}
