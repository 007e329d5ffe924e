//! Object image parsing and layout.
//!
//! An image is a fixed 0x100-byte header of big-endian tables followed by segment payloads.
//! The header lists up to 7 executable (text) segments and 11 data segments by file offset,
//! load address and length, then the zero-init range and the entry point.
//!
//! Parsing validates the geometry once: payloads must lie inside the buffer, no two loaded
//! segments may overlap in memory, and the entry point must be inside the code window.
//! Patching later changes payload bytes only, never the tables.

use object::endian::{BigEndian, U32Bytes};
use object::pod::{self, Pod};
use std::fmt;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::store::ByteStore;
use crate::utils::align_up;

pub const TEXT_SEGMENTS: usize = 7;
pub const DATA_SEGMENTS: usize = 11;
pub const HEADER_SIZE: usize = 0x100;
/// Alignment applied to segment ends, both in memory and in the file.
pub const SEGMENT_ALIGN: u64 = 32;
/// Addresses the loader accepts as an entry point.
pub const CODE_WINDOW: Range<u32> = 0x8000_3100..0x8180_0000;

type U32Be = U32Bytes<BigEndian>;

/// On-disk header layout.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct RawHeader {
    text_offsets: [U32Be; TEXT_SEGMENTS],
    data_offsets: [U32Be; DATA_SEGMENTS],
    text_addresses: [U32Be; TEXT_SEGMENTS],
    data_addresses: [U32Be; DATA_SEGMENTS],
    text_lengths: [U32Be; TEXT_SEGMENTS],
    data_lengths: [U32Be; DATA_SEGMENTS],
    zero_init_address: U32Be,
    zero_init_length: U32Be,
    entry_point: U32Be,
    padding: [u8; 0x1C],
}

// SAFETY: every field is a byte array, so the struct has alignment 1, no padding and
// accepts any bit pattern.
unsafe impl Pod for RawHeader {}

fn be(value: u32) -> U32Be {
    U32Bytes::new(BigEndian, value)
}

fn get(value: U32Be) -> u32 {
    value.get(BigEndian)
}

/// Which table a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRole {
    Executable,
    Data,
}

/// One slot of the segment tables.
///
/// A slot with `length == 0` is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub role: SegmentRole,
    /// Slot number within its table.
    pub index: usize,
    pub file_offset: u32,
    pub memory_address: u32,
    pub length: u32,
}

impl Segment {
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Memory range `[start, end)` with the end rounded up to the segment alignment.
    pub fn aligned_memory_range(&self) -> Range<u64> {
        let start = self.memory_address as u64;
        start..align_up(start + self.length as u64, SEGMENT_ALIGN)
    }

    fn file_range(&self) -> Range<usize> {
        self.file_offset as usize..self.file_offset as usize + self.length as usize
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.role {
            SegmentRole::Executable => "text",
            SegmentRole::Data => "data",
        };
        write!(
            f,
            "{}{}: 0x{:08X}..0x{:08X} (file 0x{:X}, {} bytes)",
            kind,
            self.index,
            self.memory_address,
            self.memory_address as u64 + self.length as u64,
            self.file_offset,
            self.length
        )
    }
}

/// A parsed object image and its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectImage {
    text: [Segment; TEXT_SEGMENTS],
    data: [Segment; DATA_SEGMENTS],
    zero_init_address: u32,
    zero_init_length: u32,
    entry_point: u32,
    bytes: Vec<u8>,
}

impl ObjectImage {
    /// Parses and validates an image.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let (header, _) = pod::from_bytes::<RawHeader>(&bytes).map_err(|()| {
            Error::Format(format!(
                "{} bytes is shorter than the 0x{:X}-byte header",
                bytes.len(),
                HEADER_SIZE
            ))
        })?;

        let text = std::array::from_fn(|i| Segment {
            role: SegmentRole::Executable,
            index: i,
            file_offset: get(header.text_offsets[i]),
            memory_address: get(header.text_addresses[i]),
            length: get(header.text_lengths[i]),
        });
        let data = std::array::from_fn(|i| Segment {
            role: SegmentRole::Data,
            index: i,
            file_offset: get(header.data_offsets[i]),
            memory_address: get(header.data_addresses[i]),
            length: get(header.data_lengths[i]),
        });

        let zero_init_address = get(header.zero_init_address);
        let zero_init_length = get(header.zero_init_length);
        let entry_point = get(header.entry_point);

        let image = Self {
            text,
            data,
            zero_init_address,
            zero_init_length,
            entry_point,
            bytes,
        };
        image.check_file_ranges()?;
        image.check_overlaps()?;
        image.check_entry_point()?;

        tracing::debug!(
            "parsed image: {} segments, entry 0x{:08X}",
            image.loaded_segments().count(),
            image.entry_point
        );
        Ok(image)
    }

    /// Assembles an image from `(load address, payload)` pairs.
    ///
    /// Slots are filled in order; the result goes through [`ObjectImage::parse`] validation.
    pub fn build(
        text: &[(u32, &[u8])],
        data: &[(u32, &[u8])],
        zero_init: (u32, u32),
        entry_point: u32,
    ) -> Result<Self> {
        if text.len() > TEXT_SEGMENTS || data.len() > DATA_SEGMENTS {
            return Err(Error::Format(format!(
                "at most {TEXT_SEGMENTS} text and {DATA_SEGMENTS} data segments fit in the header"
            )));
        }
        let mut text_slots = [(0, &[][..]); TEXT_SEGMENTS];
        text_slots[..text.len()].copy_from_slice(text);
        let mut data_slots = [(0, &[][..]); DATA_SEGMENTS];
        data_slots[..data.len()].copy_from_slice(data);

        Self::parse(lay_out(&text_slots, &data_slots, zero_init, entry_point)?)
    }

    /// Writes the image back out in canonical layout.
    ///
    /// Payloads are packed after the header in table order, each padded to 32 bytes. Unused
    /// slots get a zero file offset.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let slot = |s: &Segment| (s.memory_address, self.segment_payload(s));
        let text: [(u32, &[u8]); TEXT_SEGMENTS] = std::array::from_fn(|i| slot(&self.text[i]));
        let data: [(u32, &[u8]); DATA_SEGMENTS] = std::array::from_fn(|i| slot(&self.data[i]));
        // Aliased payloads are written out once per slot, so the result can outgrow the input.
        lay_out(
            &text,
            &data,
            (self.zero_init_address, self.zero_init_length),
            self.entry_point,
        )
    }

    pub fn executable_segments(&self) -> &[Segment] {
        &self.text
    }

    pub fn data_segments(&self) -> &[Segment] {
        &self.data
    }

    /// All slots, executable first.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.text.iter().chain(self.data.iter())
    }

    /// Non-empty slots only.
    pub fn loaded_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments().filter(|s| !s.is_empty())
    }

    /// Zero-init range as `(address, length)`.
    pub fn zero_init(&self) -> (u32, u32) {
        (self.zero_init_address, self.zero_init_length)
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn segment_payload(&self, segment: &Segment) -> &[u8] {
        if segment.is_empty() {
            return &[];
        }
        &self.bytes[segment.file_range()]
    }

    /// Replaces the raw bytes with a staged copy of the same length.
    pub(crate) fn commit(&mut self, staged: Vec<u8>) {
        debug_assert_eq!(staged.len(), self.bytes.len());
        self.bytes = staged;
    }

    fn check_file_ranges(&self) -> Result<()> {
        for segment in self.loaded_segments() {
            if (segment.file_offset as usize) < HEADER_SIZE {
                return Err(Error::Format(format!(
                    "{segment} starts inside the header"
                )));
            }
            if segment.file_offset as usize + segment.length as usize > self.bytes.len() {
                return Err(Error::Format(format!(
                    "{segment} runs past the end of the {}-byte file",
                    self.bytes.len()
                )));
            }
        }
        Ok(())
    }

    fn check_overlaps(&self) -> Result<()> {
        let loaded: Vec<&Segment> = self.loaded_segments().collect();
        for (i, a) in loaded.iter().enumerate() {
            let ra = a.aligned_memory_range();
            for b in &loaded[i + 1..] {
                let rb = b.aligned_memory_range();
                // Half-open ranges: touching ends are not an overlap.
                if ra.start < rb.end && rb.start < ra.end {
                    return Err(Error::InvalidLayout(format!("{a} overlaps {b}")));
                }
            }
        }
        Ok(())
    }

    fn check_entry_point(&self) -> Result<()> {
        if !CODE_WINDOW.contains(&self.entry_point) {
            return Err(Error::InvalidLayout(format!(
                "entry point 0x{:08X} is outside 0x{:08X}..0x{:08X}",
                self.entry_point, CODE_WINDOW.start, CODE_WINDOW.end
            )));
        }
        Ok(())
    }
}

impl ByteStore for ObjectImage {
    fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        self.bytes.read(offset, len)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        self.bytes.write(offset, bytes)
    }
}

/// File offset and length of a payload placed at `offset`, both as header fields.
fn file_slot(offset: usize, len: usize) -> Result<(u32, u32)> {
    let end = offset as u64 + len as u64;
    match (u32::try_from(offset), u32::try_from(len)) {
        (Ok(offset), Ok(length)) if end <= 1 << 32 => Ok((offset, length)),
        _ => Err(Error::Format(format!(
            "payload at file offset 0x{offset:X} of {len} bytes does not fit in a 4 GiB image"
        ))),
    }
}

/// Lays out a header and payloads, packing each payload on a 32-byte boundary.
fn lay_out(
    text: &[(u32, &[u8]); TEXT_SEGMENTS],
    data: &[(u32, &[u8]); DATA_SEGMENTS],
    zero_init: (u32, u32),
    entry_point: u32,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; HEADER_SIZE];
    let mut header = RawHeader {
        text_offsets: [be(0); TEXT_SEGMENTS],
        data_offsets: [be(0); DATA_SEGMENTS],
        text_addresses: [be(0); TEXT_SEGMENTS],
        data_addresses: [be(0); DATA_SEGMENTS],
        text_lengths: [be(0); TEXT_SEGMENTS],
        data_lengths: [be(0); DATA_SEGMENTS],
        zero_init_address: be(zero_init.0),
        zero_init_length: be(zero_init.1),
        entry_point: be(entry_point),
        padding: [0; 0x1C],
    };

    let mut place = |address: u32, payload: &[u8]| -> Result<(u32, u32, u32)> {
        if payload.is_empty() {
            return Ok((0, address, 0));
        }
        let (offset, length) = file_slot(buffer.len(), payload.len())?;
        buffer.extend_from_slice(payload);
        buffer.resize(align_up(buffer.len() as u64, SEGMENT_ALIGN) as usize, 0);
        Ok((offset, address, length))
    };

    for (i, (address, payload)) in text.iter().enumerate() {
        let (offset, address, length) = place(*address, *payload)?;
        header.text_offsets[i] = be(offset);
        header.text_addresses[i] = be(address);
        header.text_lengths[i] = be(length);
    }
    for (i, (address, payload)) in data.iter().enumerate() {
        let (offset, address, length) = place(*address, *payload)?;
        header.data_offsets[i] = be(offset);
        header.data_addresses[i] = be(address);
        header.data_lengths[i] = be(length);
    }

    buffer[..HEADER_SIZE].copy_from_slice(pod::bytes_of(&header));
    Ok(buffer)
}
