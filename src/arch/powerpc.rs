//! 32-bit PowerPC backend.
//!
//! Implements the `Architecture` trait for big-endian PowerPC (the `b`/`bl` I-form branch).

use super::Architecture;
use crate::error::{Error, Result};

/// Primary opcode 18 (`b`) in the top six bits.
const OPCODE_BRANCH: u32 = 18 << 26;
/// LI field: a signed 24-bit word displacement stored pre-shifted by two.
const DISPLACEMENT_MASK: u32 = 0x03FF_FFFC;
const LINK_BIT: u32 = 0x1;

pub const MAX_DISPLACEMENT: i64 = 0x01FF_FFFC;
pub const MIN_DISPLACEMENT: i64 = -0x0200_0000;

/// The PowerPC architecture backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerPc;

impl Architecture for PowerPc {
    fn instruction_size(&self) -> u32 {
        4
    }

    fn encode_branch(&self, source: u32, destination: u32, link: bool) -> Result<[u8; 4]> {
        let displacement = destination as i64 - source as i64;

        // The low two bits of LI are AA/LK, so the displacement has to be word aligned.
        if displacement % 4 != 0 {
            let misaligned = if source % 4 != 0 { source } else { destination };
            return Err(Error::MisalignedAddress(misaligned));
        }
        if !(MIN_DISPLACEMENT..=MAX_DISPLACEMENT).contains(&displacement) {
            return Err(Error::DisplacementOverflow {
                from: source,
                to: destination,
            });
        }

        let mut word = OPCODE_BRANCH | (displacement as u32 & DISPLACEMENT_MASK);
        if link {
            word |= LINK_BIT;
        }
        tracing::trace!(
            "branch 0x{:08X} -> 0x{:08X} encoded as {:08X}",
            source,
            destination,
            word
        );
        Ok(word.to_be_bytes())
    }
}
