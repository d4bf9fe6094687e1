// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The parser contract shared by all essence formats.
//!
//! Parsers are driven by a caller that owns the read buffer: the caller
//! appends bytes, asks whether a complete frame is available and, once one
//! is, asks for the decoded frame header fields. Running out of buffered
//! bytes is ordinary control flow, never an error.

pub mod hevc;
pub mod iab;
pub mod isxd;
pub mod sadm;

use thiserror::Error;

/// Outcome of scanning for the first frame boundary of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStart {
    /// Offset of the first byte belonging to the first frame.
    Offset(usize),
    /// No frame start in the buffered bytes yet.
    NeedMoreData,
}

/// Outcome of resolving the size of the frame at the head of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// A complete frame of this many bytes is buffered.
    Complete(usize),
    /// The frame continues beyond the buffered bytes.
    NeedMoreData,
    /// The buffered bytes do not form a valid frame. The frame is rejected,
    /// not retried.
    Invalid,
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The input violates the format's grammar.
    #[error("malformed stream: {0}")]
    Malformed(String),
    /// The input decodes to values outside the profiles this crate supports.
    #[error("unsupported profile: {0}")]
    Unsupported(String),
}

/// Boundary and header-field extraction over a growing buffer of raw essence.
///
/// For a given parser instance calls must be sequential in byte-stream order:
/// frame N's size is resolved before frame N's info is requested, and before
/// frame N+1 scanning begins.
pub trait EssenceParser {
    /// Locates the start of the first frame. Idempotent; callable repeatedly
    /// as the buffer grows. Formats with no inter-frame alignment gap always
    /// report offset 0.
    fn locate_frame_start(&mut self, data: &[u8]) -> FrameStart;

    /// Resolves the size of the frame starting at `data[0]`, retrying from
    /// internal checkpoints as the buffer grows. An empty buffer signals
    /// end-of-stream and yields a definitive answer.
    fn compute_frame_size(&mut self, data: &[u8]) -> FrameSize;

    /// Decodes the frame's header fields once a complete frame is buffered.
    fn extract_frame_info(&mut self, data: &[u8]) -> Result<(), ParseError>;
}
