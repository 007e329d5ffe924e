//! Patch descriptor parsing.
//!
//! Patches arrive as a flat stream of hex digits. Whitespace and case are ignored; the
//! decoded bytes are a sequence of records, each starting with a tag byte:
//!
//! | tag    | layout                                        | meaning                  |
//! |--------|-----------------------------------------------|--------------------------|
//! | `0x04` | `tag addr[3] word[4]`                         | overwrite one word       |
//! | `0xC2` | `tag addr[3] count[4] instructions[count * 4]`| inject a routine         |
//!
//! Only the low 24 bits of the target are encoded; the high byte is always `0x80`.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::address::AddressSpace;
use crate::error::{Error, Result};
use crate::utils::{decode_hex, encode_hex};

pub const TAG_DIRECT_WRITE: u8 = 0x04;
pub const TAG_INJECTED_ROUTINE: u8 = 0xC2;
/// High byte OR-ed onto every 24-bit record address.
pub const ADDRESS_HIGH_BYTE: u8 = 0x80;

const RECORD_HEADER_LEN: usize = 8;
const WORD: usize = 4;

/// A requested edit that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchDescriptor {
    /// Replace the word at `target`.
    DirectWrite { target: u32, new_word: [u8; 4] },
    /// Branch from `target` to a routine placed at the hijack cursor. The routine's last
    /// word is replaced by a branch back to `target + 4`.
    InjectedRoutine { target: u32, instructions: Vec<u8> },
}

impl PatchDescriptor {
    pub fn target(&self) -> u32 {
        match self {
            PatchDescriptor::DirectWrite { target, .. }
            | PatchDescriptor::InjectedRoutine { target, .. } => *target,
        }
    }

    /// Encodes the descriptor back into its wire record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (tag, body) = match self {
            PatchDescriptor::DirectWrite { new_word, .. } => (TAG_DIRECT_WRITE, new_word.to_vec()),
            PatchDescriptor::InjectedRoutine { instructions, .. } => {
                let count = (instructions.len() / WORD) as u32;
                let mut body = count.to_be_bytes().to_vec();
                body.extend_from_slice(instructions);
                (TAG_INJECTED_ROUTINE, body)
            }
        };
        let mut record = self.target().to_be_bytes().to_vec();
        record[0] = tag;
        record.extend_from_slice(&body);
        record
    }
}

/// A validated batch of descriptors, ready to be applied once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBatch {
    descriptors: Vec<PatchDescriptor>,
}

impl PatchBatch {
    /// Validates programmatically built descriptors the same way [`parse_all`] does.
    pub fn new(descriptors: Vec<PatchDescriptor>, space: &AddressSpace) -> Result<Self> {
        for descriptor in &descriptors {
            validate(descriptor, space)?;
        }
        check_unique(&descriptors)?;
        Ok(Self { descriptors })
    }

    pub fn descriptors(&self) -> &[PatchDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Bytes of hijack space the batch's injected routines need.
    pub fn hijack_len(&self) -> usize {
        self.descriptors
            .iter()
            .map(|d| match d {
                PatchDescriptor::InjectedRoutine { instructions, .. } => instructions.len(),
                PatchDescriptor::DirectWrite { .. } => 0,
            })
            .sum()
    }

    /// Re-encodes the batch as patch text, one record per line.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for descriptor in &self.descriptors {
            let _ = writeln!(text, "{}", encode_hex(&descriptor.to_bytes()));
        }
        text
    }

    pub(crate) fn into_descriptors(self) -> Vec<PatchDescriptor> {
        self.descriptors
    }
}

/// Decodes and validates a patch text stream.
///
/// Every record is checked against `space` as soon as it is decoded; duplicate targets are
/// rejected once the whole stream has been read.
pub fn parse_all(text: &str, space: &AddressSpace) -> Result<PatchBatch> {
    let bytes = decode_hex(text)?;
    let mut descriptors = Vec::new();
    let mut position = 0;

    while position < bytes.len() {
        let (descriptor, consumed) = decode_record(&bytes[position..], position)?;
        validate(&descriptor, space)?;
        tracing::debug!(
            "record at byte {}: {} bytes targeting 0x{:08X}",
            position,
            consumed,
            descriptor.target()
        );
        descriptors.push(descriptor);
        position += consumed;
    }

    check_unique(&descriptors)?;
    Ok(PatchBatch { descriptors })
}

/// Decodes the record at the front of `bytes`, returning it and its encoded length.
fn decode_record(bytes: &[u8], position: usize) -> Result<(PatchDescriptor, usize)> {
    let tag = bytes[0];
    if tag != TAG_DIRECT_WRITE && tag != TAG_INJECTED_ROUTINE {
        return Err(Error::UnsupportedTag { tag, position });
    }
    if bytes.len() < RECORD_HEADER_LEN {
        return Err(Error::MalformedPatch(format!(
            "record at byte {position} is truncated ({} of {RECORD_HEADER_LEN} bytes)",
            bytes.len()
        )));
    }

    let target = u32::from_be_bytes([ADDRESS_HIGH_BYTE, bytes[1], bytes[2], bytes[3]]);
    let field = [bytes[4], bytes[5], bytes[6], bytes[7]];

    if tag == TAG_DIRECT_WRITE {
        return Ok((
            PatchDescriptor::DirectWrite {
                target,
                new_word: field,
            },
            RECORD_HEADER_LEN,
        ));
    }

    let count = i32::from_be_bytes(field);
    if count <= 0 {
        return Err(Error::NonPositiveCount {
            address: target,
            count,
        });
    }
    let available = bytes.len() - RECORD_HEADER_LEN;
    let payload_len = (count as usize)
        .checked_mul(WORD)
        .filter(|&len| len <= available)
        .ok_or_else(|| {
            Error::MalformedPatch(format!(
                "routine for 0x{target:08X} declares {count} instructions but only {available} bytes follow"
            ))
        })?;

    let instructions = bytes[RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len].to_vec();
    Ok((
        PatchDescriptor::InjectedRoutine {
            target,
            instructions,
        },
        RECORD_HEADER_LEN + payload_len,
    ))
}

/// Checks a descriptor's shape and that its target word is patchable.
fn validate(descriptor: &PatchDescriptor, space: &AddressSpace) -> Result<()> {
    let target = descriptor.target();
    // Records only carry the low 24 bits.
    if target >> 24 != ADDRESS_HIGH_BYTE as u32 {
        return Err(Error::OutOfRange(target));
    }
    if target % WORD as u32 != 0 {
        return Err(Error::MisalignedAddress(target));
    }
    if let PatchDescriptor::InjectedRoutine { instructions, .. } = descriptor {
        if instructions.is_empty() || instructions.len() % WORD != 0 {
            return Err(Error::MalformedPatch(format!(
                "routine for 0x{target:08X} is {} bytes, not a whole number of instructions",
                instructions.len()
            )));
        }
    }
    space.to_file_span(target, WORD)?;
    Ok(())
}

fn check_unique(descriptors: &[PatchDescriptor]) -> Result<()> {
    let mut seen = HashSet::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !seen.insert(descriptor.target()) {
            return Err(Error::Uniqueness(descriptor.target()));
        }
    }
    Ok(())
}
