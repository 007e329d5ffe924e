//! Patch application and removal.
//!
//! This module contains the `Patcher` struct which drives a batch through its lifecycle:
//! 1. Apply: every descriptor is resolved to file offsets and written to a staging copy of
//!    the image, capturing the bytes it replaces.
//! 2. Commit: only when the whole batch succeeded is the staging copy swapped in.
//! 3. Remove: the captured bytes are written back, newest edit first.
//!
//! A [`PatchBatch`] is consumed by `apply` and the resulting [`PatchSet`] is consumed by
//! `remove`, so neither can be used twice.

use tracing::{debug, info, warn};

use crate::address::AddressSpace;
use crate::arch::Architecture;
use crate::descriptor::{PatchBatch, PatchDescriptor};
use crate::error::{Error, Result};
use crate::image::ObjectImage;
use crate::store::ByteStore;

const WORD: usize = 4;

/// An edit that has been written, together with everything needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedPatch {
    DirectWrite {
        target: u32,
        new_word: [u8; 4],
        replaced_word: [u8; 4],
    },
    InjectedRoutine {
        target: u32,
        replaced_word_at_target: [u8; 4],
        hijack_address: u32,
        /// Routine as written, with its final word already turned into the branch back.
        instruction_bytes_written: Vec<u8>,
        replaced_bytes_at_hijack: Vec<u8>,
    },
}

impl AppliedPatch {
    pub fn target(&self) -> u32 {
        match self {
            AppliedPatch::DirectWrite { target, .. }
            | AppliedPatch::InjectedRoutine { target, .. } => *target,
        }
    }

    /// Hijack space used by this patch as `(address, length)`.
    pub fn hijack_span(&self) -> Option<(u32, usize)> {
        match self {
            AppliedPatch::DirectWrite { .. } => None,
            AppliedPatch::InjectedRoutine {
                hijack_address,
                instruction_bytes_written,
                ..
            } => Some((*hijack_address, instruction_bytes_written.len())),
        }
    }
}

/// A named group of applied patches, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    pub name: String,
    pub patches: Vec<AppliedPatch>,
}

impl PatchSet {
    /// First address past every injected routine of the set.
    pub fn next_hijack_cursor(&self) -> Option<u32> {
        self.patches
            .iter()
            .filter_map(AppliedPatch::hijack_span)
            .map(|(address, len)| address.saturating_add(len as u32))
            .max()
    }
}

/// A patch that could not be reverted.
#[derive(Debug)]
pub struct RemoveFailure {
    /// Position of the patch within its set.
    pub index: usize,
    pub target: u32,
    pub error: Error,
}

/// Result of removing a patch set. Removal keeps going past failures.
#[derive(Debug)]
pub struct RemoveOutcome {
    pub name: String,
    /// Targets restored, in the order they were processed.
    pub restored: Vec<u32>,
    pub failures: Vec<RemoveFailure>,
}

impl RemoveOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies and removes patch batches for one architecture.
pub struct Patcher<A: Architecture> {
    arch: A,
}

impl<A: Architecture> Patcher<A> {
    pub fn new(arch: A) -> Self {
        Self { arch }
    }

    /// Applies `batch` to `image`.
    ///
    /// Injected routines are placed one after another starting at `hijack_cursor`, which is
    /// advanced past the last one on success. On error neither the image nor the cursor
    /// changes.
    pub fn apply(
        &self,
        image: &mut ObjectImage,
        space: &AddressSpace,
        batch: PatchBatch,
        name: &str,
        hijack_cursor: &mut u32,
    ) -> Result<PatchSet> {
        let mut staged = image.bytes().to_vec();
        let mut cursor = *hijack_cursor;
        let mut patches = Vec::with_capacity(batch.len());

        for descriptor in batch.into_descriptors() {
            let applied = match descriptor {
                PatchDescriptor::DirectWrite { target, new_word } => {
                    self.write_word(&mut staged, space, target, new_word)?
                }
                PatchDescriptor::InjectedRoutine {
                    target,
                    instructions,
                } => self.inject(&mut staged, space, target, instructions, &mut cursor)?,
            };
            patches.push(applied);
        }

        image.commit(staged);
        *hijack_cursor = cursor;
        info!(
            "applied {} patches as `{}` (hijack cursor now 0x{:08X})",
            patches.len(),
            name,
            cursor
        );
        Ok(PatchSet {
            name: name.to_string(),
            patches,
        })
    }

    fn write_word<S: ByteStore>(
        &self,
        store: &mut S,
        space: &AddressSpace,
        target: u32,
        new_word: [u8; 4],
    ) -> Result<AppliedPatch> {
        let offset = space.to_file_span(target, WORD)?;
        let replaced_word = read_word(store, offset)?;
        store.write(offset, &new_word)?;
        debug!("0x{:08X}: {:02X?} -> {:02X?}", target, replaced_word, new_word);
        Ok(AppliedPatch::DirectWrite {
            target,
            new_word,
            replaced_word,
        })
    }

    fn inject<S: ByteStore>(
        &self,
        store: &mut S,
        space: &AddressSpace,
        target: u32,
        mut instructions: Vec<u8>,
        cursor: &mut u32,
    ) -> Result<AppliedPatch> {
        let hijack_address = *cursor;
        let width = self.arch.instruction_size();
        if hijack_address % width != 0 {
            return Err(Error::MisalignedAddress(hijack_address));
        }

        let len = instructions.len();
        let target_offset = space.to_file_span(target, WORD)?;
        let hijack_offset = space.to_file_span(hijack_address, len)?;

        // The span check above keeps the routine's end at or below 2^32.
        let end = hijack_address as u64 + len as u64;
        let tail = (end - WORD as u64) as u32;
        let return_address =
            u32::try_from(target as u64 + width as u64).map_err(|_| Error::OutOfRange(target))?;
        let branch_in = self.arch.encode_branch(target, hijack_address, false)?;
        let branch_out = self.arch.encode_branch(tail, return_address, false)?;
        // A routine ending at the top of the address space leaves no room after it.
        let next = u32::try_from(end).unwrap_or(u32::MAX);

        let replaced_word_at_target = read_word(store, target_offset)?;
        store.write(target_offset, &branch_in)?;

        let replaced_bytes_at_hijack = store.read(hijack_offset, len)?;
        instructions[len - WORD..].copy_from_slice(&branch_out);
        store.write(hijack_offset, &instructions)?;

        debug!(
            "0x{:08X}: hijacked to {} bytes at 0x{:08X}",
            target, len, hijack_address
        );
        *cursor = next;
        Ok(AppliedPatch::InjectedRoutine {
            target,
            replaced_word_at_target,
            hijack_address,
            instruction_bytes_written: instructions,
            replaced_bytes_at_hijack,
        })
    }

    /// Reverts every patch of `set`, newest first.
    ///
    /// A patch that cannot be reverted is recorded in the outcome and the rest are still
    /// processed.
    pub fn remove(
        &self,
        image: &mut ObjectImage,
        space: &AddressSpace,
        set: PatchSet,
    ) -> RemoveOutcome {
        let mut outcome = RemoveOutcome {
            name: set.name,
            restored: Vec::new(),
            failures: Vec::new(),
        };

        for (index, patch) in set.patches.into_iter().enumerate().rev() {
            let target = patch.target();
            match self.restore(image, space, &patch) {
                Ok(()) => outcome.restored.push(target),
                Err(error) => {
                    warn!("could not revert patch #{} at 0x{:08X}: {}", index, target, error);
                    outcome.failures.push(RemoveFailure {
                        index,
                        target,
                        error,
                    });
                }
            }
        }

        info!(
            "removed `{}`: {} restored, {} failed",
            outcome.name,
            outcome.restored.len(),
            outcome.failures.len()
        );
        outcome
    }

    fn restore<S: ByteStore>(
        &self,
        store: &mut S,
        space: &AddressSpace,
        patch: &AppliedPatch,
    ) -> Result<()> {
        match patch {
            AppliedPatch::DirectWrite {
                target,
                new_word,
                replaced_word,
            } => {
                let offset = space.to_file_span(*target, WORD)?;
                warn_if_drifted(store, *target, offset, new_word)?;
                store.write(offset, replaced_word)
            }
            AppliedPatch::InjectedRoutine {
                target,
                replaced_word_at_target,
                hijack_address,
                instruction_bytes_written,
                replaced_bytes_at_hijack,
            } => {
                if instruction_bytes_written.len() != replaced_bytes_at_hijack.len() {
                    return Err(Error::MalformedPatch(format!(
                        "routine for 0x{target:08X} wrote {} bytes but saved {}",
                        instruction_bytes_written.len(),
                        replaced_bytes_at_hijack.len()
                    )));
                }

                // Hijack space first: it may cover the target word.
                let hijack_offset =
                    space.to_file_span(*hijack_address, replaced_bytes_at_hijack.len())?;
                let target_offset = space.to_file_span(*target, WORD)?;

                warn_if_drifted(store, *hijack_address, hijack_offset, instruction_bytes_written)?;
                store.write(hijack_offset, replaced_bytes_at_hijack)?;

                if let Ok(branch_in) = self.arch.encode_branch(*target, *hijack_address, false) {
                    warn_if_drifted(store, *target, target_offset, &branch_in)?;
                }
                store.write(target_offset, replaced_word_at_target)
            }
        }
    }
}

fn read_word<S: ByteStore>(store: &S, offset: u32) -> Result<[u8; 4]> {
    let mut word = [0u8; 4];
    word.copy_from_slice(&store.read(offset, WORD)?);
    Ok(word)
}

/// Logs when the bytes about to be reverted are not the ones the patch wrote.
fn warn_if_drifted<S: ByteStore>(
    store: &S,
    address: u32,
    offset: u32,
    expected: &[u8],
) -> Result<()> {
    let current = store.read(offset, expected.len())?;
    if current != expected {
        warn!(
            "bytes at 0x{:08X} changed since the patch was applied; restoring anyway",
            address
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressRange, Region};
    use crate::arch::powerpc::PowerPc;
    use crate::descriptor::parse_all;

    const TEXT: u32 = 0x8000_3100;
    const HIJACK: u32 = 0x8000_4000;

    fn image() -> ObjectImage {
        let code: Vec<u8> = (0..0x200u32).map(|i| i as u8).collect();
        let cave = [0xEEu8; 0x100];
        ObjectImage::build(&[(TEXT, &code[..])], &[(HIJACK, &cave[..])], (0, 0), TEXT).unwrap()
    }

    fn patcher() -> Patcher<PowerPc> {
        Patcher::new(PowerPc)
    }

    #[test]
    fn direct_write_round_trip() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::from_image(&image);
        let batch = parse_all("04003110 60000000", &space).unwrap();
        let mut cursor = HIJACK;

        let set = patcher()
            .apply(&mut image, &space, batch, "nop", &mut cursor)
            .unwrap();
        assert_eq!(
            set.patches,
            [AppliedPatch::DirectWrite {
                target: 0x8000_3110,
                new_word: [0x60, 0, 0, 0],
                replaced_word: [0x10, 0x11, 0x12, 0x13],
            }]
        );
        assert_eq!(image.read(0x110, 4).unwrap(), [0x60, 0, 0, 0]);
        assert_eq!(cursor, HIJACK);

        let outcome = patcher().remove(&mut image, &space, set);
        assert!(outcome.is_complete());
        assert_eq!(outcome.restored, [0x8000_3110]);
        assert_eq!(image, original);
    }

    #[test]
    fn injected_routine_round_trip() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::from_image(&image);
        let batch = parse_all("C2003140 00000002 38600001 00000000", &space).unwrap();
        let mut cursor = HIJACK;

        let set = patcher()
            .apply(&mut image, &space, batch, "inject", &mut cursor)
            .unwrap();

        // b +0xEC0 at the target, routine with a branch back to 0x80003144 at the cave.
        assert_eq!(image.read(0x140, 4).unwrap(), [0x48, 0x00, 0x0E, 0xC0]);
        assert_eq!(
            image.read(0x300, 8).unwrap(),
            [0x38, 0x60, 0x00, 0x01, 0x4B, 0xFF, 0xF1, 0x40]
        );
        assert_eq!(cursor, HIJACK + 8);
        assert_eq!(set.next_hijack_cursor(), Some(HIJACK + 8));
        match &set.patches[0] {
            AppliedPatch::InjectedRoutine {
                replaced_word_at_target,
                replaced_bytes_at_hijack,
                ..
            } => {
                assert_eq!(replaced_word_at_target, &[0x40, 0x41, 0x42, 0x43]);
                assert_eq!(replaced_bytes_at_hijack, &vec![0xEE; 8]);
            }
            other => panic!("unexpected patch {other:?}"),
        }

        let outcome = patcher().remove(&mut image, &space, set);
        assert!(outcome.is_complete());
        assert_eq!(image, original);
    }

    #[test]
    fn cursor_threads_across_batches() {
        let mut image = image();
        let space = AddressSpace::from_image(&image);
        let mut cursor = HIJACK;

        let first = parse_all("C2003140 00000001 00000000", &space).unwrap();
        patcher()
            .apply(&mut image, &space, first, "a", &mut cursor)
            .unwrap();
        let second = parse_all("C2003180 00000003 60000000 60000000 00000000", &space).unwrap();
        let set = patcher()
            .apply(&mut image, &space, second, "b", &mut cursor)
            .unwrap();

        assert_eq!(set.patches[0].hijack_span(), Some((HIJACK + 4, 12)));
        assert_eq!(cursor, HIJACK + 16);
    }

    #[test]
    fn failed_apply_leaves_image_and_cursor_untouched() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::from_image(&image);

        // A one-word routine exactly fills the last word of the cave.
        let batch = parse_all("04003110 60000000 C2003140 00000001 00000000", &space).unwrap();
        let mut cursor = HIJACK + 0xFC;
        let set = patcher()
            .apply(&mut image, &space, batch, "fits", &mut cursor)
            .unwrap();
        assert_eq!(cursor, HIJACK + 0x100);
        patcher().remove(&mut image, &space, set);
        assert_eq!(image, original);

        // A two-word routine runs past it; the direct write before it must not stick.
        let batch = parse_all("04003110 60000000 C2003140 00000002 00000000 00000000", &space)
            .unwrap();
        let mut cursor = HIJACK + 0xFC;
        let result = patcher().apply(&mut image, &space, batch, "overflow", &mut cursor);
        assert!(matches!(result, Err(Error::OutOfRange(_))));
        assert_eq!(cursor, HIJACK + 0xFC);
        assert_eq!(image, original);
    }

    #[test]
    fn unreachable_hijack_is_a_displacement_overflow() {
        let mut image = image();
        let original = image.clone();
        // Map the cave's file bytes 48 MiB away from the code.
        let space = AddressSpace::new(vec![
            AddressRange {
                start: TEXT,
                end: TEXT as u64 + 0x200,
                region: Region::Text(0),
                file_offset_base: 0x100,
            },
            AddressRange {
                start: 0x8300_0000,
                end: 0x8300_0100,
                region: Region::Data(0),
                file_offset_base: 0x300,
            },
        ])
        .unwrap();
        let batch = parse_all("04003110 60000000 C2003140 00000001 00000000", &space).unwrap();
        let mut cursor = 0x8300_0000;

        let result = patcher().apply(&mut image, &space, batch, "far", &mut cursor);
        assert!(matches!(result, Err(Error::DisplacementOverflow { .. })));
        assert_eq!(image, original);
        assert_eq!(cursor, 0x8300_0000);
    }

    #[test]
    fn misaligned_cursor() {
        let mut image = image();
        let space = AddressSpace::from_image(&image);
        let batch = parse_all("C2003140 00000001 00000000", &space).unwrap();
        let mut cursor = HIJACK + 2;
        assert!(matches!(
            patcher().apply(&mut image, &space, batch, "odd", &mut cursor),
            Err(Error::MisalignedAddress(_))
        ));
    }

    #[test]
    fn overlapping_edits_unwind_exactly() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::from_image(&image);
        // The direct write lands inside the routine written just before it.
        let batch = parse_all(
            "C2003140 00000002 38600001 00000000 04004000 60000000",
            &space,
        )
        .unwrap();
        let mut cursor = HIJACK;

        let set = patcher()
            .apply(&mut image, &space, batch, "overlap", &mut cursor)
            .unwrap();
        assert_eq!(image.read(0x300, 4).unwrap(), [0x60, 0, 0, 0]);

        patcher().remove(&mut image, &space, set);
        assert_eq!(image, original);
    }

    #[test]
    fn remove_continues_past_failures() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::from_image(&image);
        let batch = parse_all("04003110 60000000 04003120 60000000", &space).unwrap();
        let mut cursor = HIJACK;
        let mut set = patcher()
            .apply(&mut image, &space, batch, "partial", &mut cursor)
            .unwrap();

        set.patches.insert(
            1,
            AppliedPatch::DirectWrite {
                target: 0x9000_0000,
                new_word: [0; 4],
                replaced_word: [0; 4],
            },
        );
        let outcome = patcher().remove(&mut image, &space, set);

        assert!(!outcome.is_complete());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);
        assert!(matches!(outcome.failures[0].error, Error::OutOfRange(0x9000_0000)));
        assert_eq!(outcome.restored, [0x8000_3120, 0x8000_3110]);
        assert_eq!(image, original);
    }

    #[test]
    fn remove_restores_even_when_bytes_drifted() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::from_image(&image);
        let batch = parse_all("04003110 60000000", &space).unwrap();
        let mut cursor = HIJACK;
        let set = patcher()
            .apply(&mut image, &space, batch, "drift", &mut cursor)
            .unwrap();

        image.write(0x110, &[1, 2, 3, 4]).unwrap();
        let outcome = patcher().remove(&mut image, &space, set);
        assert!(outcome.is_complete());
        assert_eq!(image, original);
    }

    /// Reaches anywhere; stores the raw displacement.
    struct Unbounded;

    impl Architecture for Unbounded {
        fn instruction_size(&self) -> u32 {
            4
        }

        fn encode_branch(&self, source: u32, destination: u32, _link: bool) -> Result<[u8; 4]> {
            Ok(destination.wrapping_sub(source).to_be_bytes())
        }
    }

    #[test]
    fn routine_may_end_at_the_top_of_the_address_space() {
        let mut image = image();
        let original = image.clone();
        let space = AddressSpace::new(vec![
            AddressRange {
                start: TEXT,
                end: TEXT as u64 + 0x200,
                region: Region::Text(0),
                file_offset_base: 0x100,
            },
            AddressRange {
                start: 0xFFFF_FF00,
                end: 1 << 32,
                region: Region::Data(0),
                file_offset_base: 0x300,
            },
        ])
        .unwrap();
        let batch = parse_all("C2003140 00000002 38600001 00000000", &space).unwrap();
        let mut cursor = 0xFFFF_FFF8;

        let patcher = Patcher::new(Unbounded);
        let set = patcher
            .apply(&mut image, &space, batch, "top", &mut cursor)
            .unwrap();
        assert_eq!(cursor, u32::MAX);
        assert_eq!(
            image.read(0x3FC, 4).unwrap(),
            0x8000_3144u32.wrapping_sub(0xFFFF_FFFC).to_be_bytes()
        );

        assert!(patcher.remove(&mut image, &space, set).is_complete());
        assert_eq!(image, original);
    }
}
