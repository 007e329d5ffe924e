//! Address classification.
//!
//! An [`AddressSpace`] is an ordered table of memory ranges, each tagged with the region it
//! belongs to and the file offset its first byte is stored at. It answers two questions for
//! the patch engine: which region an address is in, and where in the file its bytes live.
//!
//! The table is data. It is either derived from an image's own segment tables or loaded
//! from an address map supplied by the caller.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::image::{ObjectImage, SegmentRole, DATA_SEGMENTS, TEXT_SEGMENTS};

/// A named region of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Executable segment slot `n`.
    Text(u8),
    /// Data segment slot `n`.
    Data(u8),
    /// Memory cleared at load time; has no bytes in the image.
    ZeroInit,
}

impl Region {
    /// Whether the region is backed by bytes in the image.
    pub fn is_patchable(self) -> bool {
        !matches!(self, Region::ZeroInit)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Text(n) => write!(f, "text{n}"),
            Region::Data(n) => write!(f, "data{n}"),
            Region::ZeroInit => f.write_str("bss"),
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower == "bss" {
            return Ok(Region::ZeroInit);
        }
        let slot = |digits: &str, limit: usize| -> Option<u8> {
            digits.parse::<u8>().ok().filter(|&n| (n as usize) < limit)
        };
        lower
            .strip_prefix("text")
            .and_then(|d| slot(d, TEXT_SEGMENTS))
            .map(Region::Text)
            .or_else(|| {
                lower
                    .strip_prefix("data")
                    .and_then(|d| slot(d, DATA_SEGMENTS))
                    .map(Region::Data)
            })
            .ok_or_else(|| format!("unknown region `{s}`"))
    }
}

/// One entry of the address table: `[start, end)` maps to `file_offset_base` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u32,
    /// Exclusive. Stored as u64 so a range may end at the top of the 32-bit space.
    pub end: u64,
    pub region: Region,
    pub file_offset_base: u32,
}

impl AddressRange {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && (address as u64) < self.end
    }
}

/// Ordered lookup table from memory addresses to regions and file offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    ranges: Vec<AddressRange>,
}

impl AddressSpace {
    /// Creates an address space from an externally supplied table.
    ///
    /// Lookups scan the table in order, so earlier entries shadow later overlapping ones.
    pub fn new(ranges: Vec<AddressRange>) -> Result<Self> {
        if let Some(bad) = ranges.iter().find(|r| r.end <= r.start as u64) {
            return Err(Error::InvalidLayout(format!(
                "{} range 0x{:08X}..0x{:08X} is empty",
                bad.region, bad.start, bad.end
            )));
        }
        // Every byte of a range must have a file offset that fits in 32 bits.
        if let Some(bad) = ranges
            .iter()
            .find(|r| r.file_offset_base as u64 + (r.end - r.start as u64) > 1 << 32)
        {
            return Err(Error::InvalidLayout(format!(
                "{} range 0x{:08X}..0x{:08X} at file offset 0x{:X} runs past 4 GiB",
                bad.region, bad.start, bad.end, bad.file_offset_base
            )));
        }
        Ok(Self { ranges })
    }

    /// Derives the table from an image: loaded segments first, then the zero-init range.
    ///
    /// Zero-init ranges commonly cover small data segments; listing segments first keeps
    /// those addresses patchable.
    pub fn from_image(image: &ObjectImage) -> Self {
        let mut ranges: Vec<AddressRange> = image
            .loaded_segments()
            .map(|s| AddressRange {
                start: s.memory_address,
                end: s.memory_address as u64 + s.length as u64,
                region: match s.role {
                    SegmentRole::Executable => Region::Text(s.index as u8),
                    SegmentRole::Data => Region::Data(s.index as u8),
                },
                file_offset_base: s.file_offset,
            })
            .collect();

        let (address, length) = image.zero_init();
        if length > 0 {
            ranges.push(AddressRange {
                start: address,
                end: address as u64 + length as u64,
                region: Region::ZeroInit,
                file_offset_base: 0,
            });
        }
        Self { ranges }
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    fn lookup(&self, address: u32) -> Result<&AddressRange> {
        self.ranges
            .iter()
            .find(|r| r.contains(address))
            .ok_or(Error::OutOfRange(address))
    }

    /// Returns the region `address` belongs to.
    pub fn classify(&self, address: u32) -> Result<Region> {
        self.lookup(address).map(|r| r.region)
    }

    /// Translates a patchable address to its file offset.
    pub fn to_file_offset(&self, address: u32) -> Result<u32> {
        let range = self.lookup(address)?;
        if !range.region.is_patchable() {
            return Err(Error::UnpatchableRegion {
                address,
                region: range.region,
            });
        }
        (address - range.start)
            .checked_add(range.file_offset_base)
            .ok_or(Error::OutOfRange(address))
    }

    /// Like [`AddressSpace::to_file_offset`], but the whole `len`-byte span has to stay
    /// inside one range.
    pub fn to_file_span(&self, address: u32, len: usize) -> Result<u32> {
        let offset = self.to_file_offset(address)?;
        let range = self.lookup(address)?;
        let last = address as u64 + len as u64;
        if last > range.end {
            return Err(Error::OutOfRange(u32::try_from(range.end).unwrap_or(u32::MAX)));
        }
        Ok(offset)
    }
}
