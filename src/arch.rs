//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates the instruction encoding
//! the patcher needs. The patch engine stays generic while a backend decides how a relative
//! branch is laid out and how far it can reach.

use crate::error::Result;

pub mod powerpc;

/// A trait representing a target instruction set.
pub trait Architecture {
    /// Width in bytes of one instruction word.
    fn instruction_size(&self) -> u32;

    /// Encodes a relative branch placed at `source` that jumps to `destination`.
    ///
    /// # Arguments
    /// * `source` - The address the branch instruction will be written to.
    /// * `destination` - The address execution continues at.
    /// * `link` - Whether the branch records a return address.
    fn encode_branch(&self, source: u32, destination: u32, link: bool) -> Result<[u8; 4]>;
}
