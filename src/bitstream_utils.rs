// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level readers and writers shared by the essence parsers.

use std::io::Cursor;
use std::io::Write;

use anyhow::anyhow;
use bytes::Buf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error)]
pub enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

/// A bit reader for codec bitstreams. It properly handles emulation-prevention
/// bytes when asked to.
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in emulation prevention byte detection.
    prev_two_bytes: u32,
    /// Number of emulation prevention bytes (i.e. 0x000003) we found.
    num_epb: usize,
    /// Whether or not we need emulation prevention logic.
    needs_epb: bool,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], needs_epb: bool) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
            needs_epb,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        let bit = self.read_bits::<u32>(1)?;
        match bit {
            1 => Ok(true),
            0 => Ok(false),
            _ => panic!("Unexpected value {}", bit),
        }
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Read a 32 bit field as two split reads, since `read_bits` takes at
    /// most 31 bits.
    pub fn read_bits_u32(&mut self) -> Result<u32, ReadBitsError> {
        let high = self.read_bits::<u32>(31)? << 1;
        Ok(high | self.read_bits::<u32>(1)?)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;
        let mut bit = self.read_bits::<u32>(1)?;

        while bit == 0 {
            num_bits += 1;
            bit = self.read_bits(1)?;
        }

        if num_bits > 31 {
            return Err(anyhow!("Invalid stream"));
        }

        let mut value = (1 << num_bits) - 1;
        let rest;

        // Check for overflow
        if num_bits == 31 {
            rest = self.read_bits::<u32>(num_bits)?;
            if rest == 0 {
                return U::try_from(value).map_err(|_| anyhow!("Conversion error"));
            } else {
                return Err(anyhow!("Invalid stream"));
            }
        }

        if num_bits > 0 {
            value += self.read_bits::<u32>(num_bits)?;
        }

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue()?;
        if ue > max || ue < min {
            Err(anyhow!(
                "Value out of bounds: expected {} - {}, got {}",
                min,
                max,
                ue
            ))
        } else {
            Ok(U::try_from(ue).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        self.read_ue_bounded(0, max)
    }

    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue = self.read_ue::<u32>()? as i32;

        if ue % 2 == 0 {
            Ok(U::try_from(-ue / 2).map_err(|_| anyhow!("Conversion error"))?)
        } else {
            Ok(U::try_from(ue / 2 + 1).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    fn get_byte(&mut self) -> Result<u8, GetByteError> {
        if self.data.remaining() == 0 {
            return Err(GetByteError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<(), GetByteError> {
        let mut byte = self.get_byte()?;

        if self.needs_epb {
            if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
                // We found an epb
                self.num_epb += 1;
                // Read another byte
                byte = self.get_byte()?;
                // We need another 3 bytes before another epb can happen.
                self.prev_two_bytes = 0xffff;
            }
            self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TagReadError {
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("{0} bits requested, at most 32 supported")]
    TooManyBitsRequested(usize),
    #[error("plex code does not terminate within 32 bits")]
    UnterminatedPlex,
}

/// A byte/bit cursor over a tag/length coded frame. Unlike [`BitReader`] it
/// supports 32 bit fields directly and decodes the self-describing
/// variable-width ("plex") integer code.
pub struct TagReader<'a> {
    data: &'a [u8],
    /// Position in bits from the start of `data`.
    bit_pos: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Read `num_bits` (1..=32) bits from the stream.
    pub fn read(&mut self, num_bits: usize) -> Result<u32, TagReadError> {
        if num_bits == 0 || num_bits > 32 {
            return Err(TagReadError::TooManyBitsRequested(num_bits));
        }
        if self.bit_pos + num_bits > self.data.len() * 8 {
            return Err(TagReadError::OutOfBits);
        }

        let mut remaining = num_bits;
        let mut out: u64 = 0;
        while remaining > 0 {
            let byte = self.data[self.bit_pos / 8];
            let avail = 8 - (self.bit_pos % 8);
            let take = std::cmp::min(avail, remaining);
            let bits = (byte >> (avail - take)) & ((1u16 << take) - 1) as u8;
            out = (out << take) | u64::from(bits);
            self.bit_pos += take;
            remaining -= take;
        }

        Ok(out as u32)
    }

    /// Advance the cursor by `num_bits` without materializing a value.
    pub fn skip(&mut self, num_bits: usize) -> Result<(), TagReadError> {
        if self.bit_pos + num_bits > self.data.len() * 8 {
            return Err(TagReadError::OutOfBits);
        }
        self.bit_pos += num_bits;
        Ok(())
    }

    /// Position of the cursor in bits from the start of the stream.
    pub fn bit_offset(&self) -> usize {
        self.bit_pos
    }

    /// Decode a plex coded value starting at `num_bits` width: a field of all
    /// ones is an escape to twice the width, up to 32 bits.
    pub fn read_plex(&mut self, mut num_bits: usize) -> Result<u32, TagReadError> {
        while num_bits <= 32 {
            let value = self.read(num_bits)?;
            let max_value = (1u64 << num_bits) - 1;
            if u64::from(value) < max_value {
                return Ok(value);
            }
            num_bits <<= 1;
        }

        Err(TagReadError::UnterminatedPlex)
    }
}

#[derive(Debug)]
pub enum BitWriterError {
    InvalidBitCount,
    Io(std::io::Error),
}

impl std::fmt::Display for BitWriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BitWriterError::InvalidBitCount => write!(f, "invalid bit count"),
            BitWriterError::Io(x) => write!(f, "{}", x),
        }
    }
}

impl From<std::io::Error> for BitWriterError {
    fn from(err: std::io::Error) -> Self {
        BitWriterError::Io(err)
    }
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Write-side mirror of [`BitReader`], used to synthesize bitstreams. Can
/// insert emulation-prevention bytes so that the output stays a legal RBSP.
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
    prev_two_bytes: u16,
    insert_epb: bool,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W, insert_epb: bool) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
            prev_two_bytes: 0xffff,
            insert_epb,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = (1 << bit) as u32;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            let byte = self.curr_byte;
            self.emit_byte(byte)?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Writes an unsigned exponential golomb coding number.
    pub fn write_ue(&mut self, value: u32) -> BitWriterResult<usize> {
        let bits = 32 - (value + 1).leading_zeros() as usize;
        self.write_f(2 * bits - 1, value + 1)
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            let byte = self.curr_byte;
            self.emit_byte(byte)?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if [`Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    fn emit_byte(&mut self, byte: u8) -> BitWriterResult<()> {
        if self.insert_epb {
            if self.prev_two_bytes == 0 && byte <= 0x03 {
                self.out.write_all(&[0x03])?;
                self.prev_two_bytes = 0xffff;
            }
            self.prev_two_bytes = (self.prev_two_bytes << 8) | u16::from(byte);
        }

        self.out.write_all(&[byte])?;
        Ok(())
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests are adapted from the chromium tests at media/video/h264_bit_reader_unitttest.cc

    #[test]
    fn read_stream_without_escape_and_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = BitReader::new(&RBSP, true);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 6);
    }

    #[test]
    fn skip_bits_crossing_bytes() {
        const RBSP: [u8; 3] = [0b1010_1010, 0b0101_0101, 0b1111_0000];

        let mut reader = BitReader::new(&RBSP, false);
        reader.skip_bits(10).unwrap();
        assert_eq!(reader.read_bits::<u32>(6).unwrap(), 0b01_0101);
        assert_eq!(reader.read_bits::<u32>(4).unwrap(), 0b1111);
    }

    #[test]
    fn read_past_end_fails() {
        const RBSP: [u8; 1] = [0xff];

        let mut reader = BitReader::new(&RBSP, false);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xff);
        assert!(reader.read_bits::<u32>(1).is_err());
    }

    #[test]
    fn epb_is_unescaped() {
        // 00 00 03 00 is the escaped form of 00 00 00.
        const RBSP: [u8; 5] = [0x12, 0x00, 0x00, 0x03, 0x00];

        let mut reader = BitReader::new(&RBSP, true);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x12);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.num_epb(), 1);
    }

    #[test]
    fn ue_smallest_codes() {
        // Decoding "1" yields 0, decoding "010" yields 1.
        let mut reader = BitReader::new(&[0b1000_0000], false);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);

        let mut reader = BitReader::new(&[0b0100_0000], false);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
    }

    #[test]
    fn ue_write_then_read_is_identity() {
        let mut buf = Vec::new();
        {
            let mut writer = BitWriter::new(&mut buf, false);
            for i in 0..256u32 {
                writer.write_ue(i).unwrap();
            }
            writer.flush().unwrap();
        }

        let mut reader = BitReader::new(&buf, false);
        for i in 0..256u32 {
            assert_eq!(reader.read_ue::<u32>().unwrap(), i);
        }
    }

    #[test]
    fn ue_max_is_enforced() {
        let mut buf = Vec::new();
        {
            let mut writer = BitWriter::new(&mut buf, false);
            writer.write_ue(32).unwrap();
            writer.flush().unwrap();
        }

        let mut reader = BitReader::new(&buf, false);
        assert!(reader.read_ue_max::<u32>(31).is_err());
    }

    #[test]
    fn se_maps_sign_from_parity() {
        // ue codes 0..=4 map to se 0, 1, -1, 2, -2.
        let mut buf = Vec::new();
        {
            let mut writer = BitWriter::new(&mut buf, false);
            for i in 0..5u32 {
                writer.write_ue(i).unwrap();
            }
            writer.flush().unwrap();
        }

        let mut reader = BitReader::new(&buf, false);
        for expected in [0i32, 1, -1, 2, -2] {
            assert_eq!(reader.read_se::<i32>().unwrap(), expected);
        }
    }

    #[test]
    fn writer_inserts_epb() {
        let mut buf = Vec::new();
        {
            let mut writer = BitWriter::new(&mut buf, true);
            writer.write_f(24, 0u32).unwrap();
            writer.write_f(8, 0xffu32).unwrap();
            writer.flush().unwrap();
        }

        assert_eq!(buf, vec![0x00, 0x00, 0x03, 0x00, 0xff]);

        let mut reader = BitReader::new(&buf, true);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xff);
    }

    #[test]
    fn tag_reader_reads_across_bytes() {
        const DATA: [u8; 3] = [0xab, 0xcd, 0xef];

        let mut reader = TagReader::new(&DATA);
        assert_eq!(reader.read(4).unwrap(), 0xa);
        assert_eq!(reader.read(16).unwrap(), 0xbcde);
        assert_eq!(reader.bit_offset(), 20);
        assert_eq!(reader.read(4).unwrap(), 0xf);
        assert!(matches!(reader.read(1), Err(TagReadError::OutOfBits)));
    }

    #[test]
    fn tag_reader_reads_32_bits() {
        const DATA: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

        let mut reader = TagReader::new(&DATA);
        assert_eq!(reader.read(32).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn plex_small_value_is_literal() {
        let mut reader = TagReader::new(&[0x08]);
        assert_eq!(reader.read_plex(8).unwrap(), 0x08);
        assert_eq!(reader.bit_offset(), 8);
    }

    #[test]
    fn plex_all_ones_escalates_width() {
        // 0xff at width 8 escapes to a 16 bit value rather than being taken
        // literally.
        let mut reader = TagReader::new(&[0xff, 0x01, 0x02]);
        assert_eq!(reader.read_plex(8).unwrap(), 0x0102);
        assert_eq!(reader.bit_offset(), 24);
    }

    #[test]
    fn plex_never_terminating_is_an_error() {
        let mut reader = TagReader::new(&[0xff; 7]);
        assert!(matches!(
            reader.read_plex(8),
            Err(TagReadError::UnterminatedPlex)
        ));
    }

    #[test]
    fn plex_width_4_starts_narrow() {
        // 0b1111 escapes 4 -> 8 bits.
        let mut reader = TagReader::new(&[0b1111_0000, 0b1100_0000]);
        assert_eq!(reader.read_plex(4).unwrap(), 0x0c);
        assert_eq!(reader.bit_offset(), 12);
    }
}
