//! Patch record bookkeeping.
//!
//! The record is the list of applied sets, oldest first, kept between runs. These helpers
//! decide where the next batch's routines go, which set a removal targets, and what stays
//! on record when a removal only partly succeeds.

use std::fs;
use std::path::Path;

use crate::descriptor::PatchBatch;
use crate::error::{Error, Result};
use crate::patcher::{PatchSet, RemoveOutcome};
use crate::{persist, store};

/// Reads the record file; a missing file is an empty record.
pub fn load(path: &Path) -> Result<Vec<PatchSet>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    persist::from_str(&fs::read_to_string(path)?)
}

/// Replaces the record file atomically.
pub fn save(path: &Path, sets: &[PatchSet]) -> Result<()> {
    store::write_atomic(path, persist::to_string(sets)?.as_bytes())
}

/// Appends `set` to the record at `record_path`, then writes the patched `image` to
/// `output`.
///
/// The record is written first, so a patched image on disk always has an entry. When the
/// image cannot be written the previous record is put back.
pub fn commit_applied(
    record_path: &Path,
    sets: &mut Vec<PatchSet>,
    set: PatchSet,
    output: &Path,
    image: &[u8],
) -> Result<()> {
    sets.push(set);
    if let Err(err) = save(record_path, sets) {
        sets.pop();
        return Err(err);
    }
    if let Err(err) = store::write_atomic(output, image) {
        sets.pop();
        save(record_path, sets)?;
        return Err(err);
    }
    Ok(())
}

/// First address past every injected routine on record.
pub fn next_hijack_cursor(sets: &[PatchSet]) -> Option<u32> {
    sets.iter().filter_map(PatchSet::next_hijack_cursor).max()
}

/// Picks the hijack cursor for `batch`.
///
/// An explicit cursor wins; otherwise routines continue after the last recorded one. A
/// batch without routines never needs a cursor.
pub fn hijack_cursor(
    sets: &[PatchSet],
    explicit: Option<u32>,
    batch: &PatchBatch,
) -> Result<u32> {
    match explicit.or_else(|| next_hijack_cursor(sets)) {
        Some(cursor) => Ok(cursor),
        None if batch.hijack_len() > 0 => Err(Error::Record(
            "patch injects routines but no hijack address is known".to_string(),
        )),
        None => Ok(0),
    }
}

/// Fails when `name` is already on record.
pub fn check_new_name(sets: &[PatchSet], name: &str) -> Result<()> {
    if sets.iter().any(|s| s.name == name) {
        return Err(Error::Record(format!("a patch set named `{name}` already exists")));
    }
    Ok(())
}

/// Takes the named set, or the latest one, off the record together with its position.
pub fn take(sets: &mut Vec<PatchSet>, name: Option<&str>) -> Result<(usize, PatchSet)> {
    let position = match name {
        Some(name) => sets.iter().position(|s| s.name == name),
        None => sets.len().checked_sub(1),
    };
    match position {
        Some(position) => Ok((position, sets.remove(position))),
        None => Err(Error::Record(match name {
            Some(name) => format!("no patch set named `{name}`"),
            None => "no patch sets applied".to_string(),
        })),
    }
}

/// Puts the patches of `set` that `outcome` could not revert back at `position`.
///
/// Nothing is reinserted when the removal was complete.
pub fn keep_failed(
    sets: &mut Vec<PatchSet>,
    position: usize,
    set: PatchSet,
    outcome: &RemoveOutcome,
) {
    if outcome.is_complete() {
        return;
    }
    let patches = set
        .patches
        .into_iter()
        .enumerate()
        .filter(|(i, _)| outcome.failures.iter().any(|f| f.index == *i))
        .map(|(_, p)| p)
        .collect();
    sets.insert(
        position.min(sets.len()),
        PatchSet {
            name: set.name,
            patches,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressRange, AddressSpace, Region};
    use crate::descriptor::parse_all;
    use crate::patcher::{AppliedPatch, RemoveFailure};

    fn direct(target: u32) -> AppliedPatch {
        AppliedPatch::DirectWrite {
            target,
            new_word: [0x60, 0, 0, 0],
            replaced_word: [0; 4],
        }
    }

    fn routine(target: u32, hijack_address: u32, len: usize) -> AppliedPatch {
        AppliedPatch::InjectedRoutine {
            target,
            replaced_word_at_target: [0; 4],
            hijack_address,
            instruction_bytes_written: vec![0; len],
            replaced_bytes_at_hijack: vec![0; len],
        }
    }

    fn set(name: &str, patches: Vec<AppliedPatch>) -> PatchSet {
        PatchSet {
            name: name.to_string(),
            patches,
        }
    }

    fn space() -> AddressSpace {
        AddressSpace::new(vec![AddressRange {
            start: 0x8000_3100,
            end: 0x8006_3100,
            region: Region::Text(0),
            file_offset_base: 0x100,
        }])
        .unwrap()
    }

    #[test]
    fn commit_writes_record_then_image() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("patches.json");
        let output = dir.path().join("main.dol");
        let mut sets = vec![set("a", vec![direct(0x8000_3110)])];
        save(&record_path, &sets).unwrap();

        commit_applied(&record_path, &mut sets, set("b", vec![]), &output, b"patched").unwrap();
        assert_eq!(load(&record_path).unwrap(), sets);
        assert_eq!(sets.len(), 2);
        assert_eq!(std::fs::read(&output).unwrap(), b"patched");
    }

    #[test]
    fn unwritable_record_leaves_the_image_alone() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("missing").join("patches.json");
        let output = dir.path().join("main.dol");
        std::fs::write(&output, b"original").unwrap();
        let mut sets = Vec::new();

        let result = commit_applied(&record_path, &mut sets, set("b", vec![]), &output, b"patched");
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(sets.is_empty());
        assert_eq!(std::fs::read(&output).unwrap(), b"original");
    }

    #[test]
    fn unwritable_image_rolls_the_record_back() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("patches.json");
        // A directory cannot be replaced by a file.
        let output = dir.path().join("out");
        std::fs::create_dir(&output).unwrap();
        let mut sets = vec![set("a", vec![direct(0x8000_3110)])];
        save(&record_path, &sets).unwrap();

        let result = commit_applied(&record_path, &mut sets, set("b", vec![]), &output, b"patched");
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(sets.len(), 1);
        assert_eq!(load(&record_path).unwrap(), sets);
    }

    #[test]
    fn missing_record_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("patches.json")).unwrap().is_empty());
    }

    #[test]
    fn cursor_continues_after_the_furthest_routine() {
        let sets = vec![
            set("a", vec![routine(0x8000_3140, 0x8006_0010, 8)]),
            set("b", vec![direct(0x8000_3110), routine(0x8000_3180, 0x8006_0000, 8)]),
        ];
        let batch = parse_all("C2003200 00000001 00000000", &space()).unwrap();
        assert_eq!(next_hijack_cursor(&sets), Some(0x8006_0018));
        assert_eq!(hijack_cursor(&sets, None, &batch).unwrap(), 0x8006_0018);
        assert_eq!(
            hijack_cursor(&sets, Some(0x8006_1000), &batch).unwrap(),
            0x8006_1000
        );
    }

    #[test]
    fn routines_need_a_cursor() {
        let sets = vec![set("a", vec![direct(0x8000_3110)])];
        let routines = parse_all("C2003200 00000001 00000000", &space()).unwrap();
        assert!(matches!(
            hijack_cursor(&sets, None, &routines),
            Err(Error::Record(_))
        ));
        let writes = parse_all("04003200 60000000", &space()).unwrap();
        assert_eq!(hijack_cursor(&sets, None, &writes).unwrap(), 0);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let sets = vec![set("nop", vec![])];
        assert!(matches!(check_new_name(&sets, "nop"), Err(Error::Record(_))));
        assert!(check_new_name(&sets, "other").is_ok());
    }

    #[test]
    fn take_defaults_to_the_latest_set() {
        let mut sets = vec![set("a", vec![]), set("b", vec![]), set("c", vec![])];
        let (position, taken) = take(&mut sets, None).unwrap();
        assert_eq!((position, taken.name.as_str()), (2, "c"));
        let (position, taken) = take(&mut sets, Some("a")).unwrap();
        assert_eq!((position, taken.name.as_str()), (0, "a"));
        assert_eq!(sets, [set("b", vec![])]);

        assert!(matches!(take(&mut sets, Some("a")), Err(Error::Record(_))));
        sets.clear();
        assert!(matches!(take(&mut sets, None), Err(Error::Record(_))));
    }

    #[test]
    fn partial_removal_keeps_only_failed_patches_in_place() {
        let mut sets = vec![set("a", vec![]), set("c", vec![])];
        let removed = set(
            "b",
            vec![direct(0x8000_3110), direct(0x8000_3114), direct(0x8000_3118)],
        );
        let outcome = RemoveOutcome {
            name: "b".to_string(),
            restored: vec![0x8000_3118, 0x8000_3110],
            failures: vec![RemoveFailure {
                index: 1,
                target: 0x8000_3114,
                error: Error::OutOfRange(0x8000_3114),
            }],
        };

        keep_failed(&mut sets, 1, removed, &outcome);
        assert_eq!(
            sets,
            [
                set("a", vec![]),
                set("b", vec![direct(0x8000_3114)]),
                set("c", vec![])
            ]
        );
    }

    #[test]
    fn complete_removal_keeps_nothing() {
        let mut sets = vec![set("a", vec![])];
        let outcome = RemoveOutcome {
            name: "b".to_string(),
            restored: vec![0x8000_3110],
            failures: Vec::new(),
        };
        keep_failed(&mut sets, 1, set("b", vec![direct(0x8000_3110)]), &outcome);
        assert_eq!(sets, [set("a", vec![])]);
    }
}
