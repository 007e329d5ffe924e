//! Patch set persistence.
//!
//! Applied patch sets are stored as a JSON array so a session can be resumed or audited
//! later. Addresses and byte strings are big-endian hex:
//!
//! ```json
//! [{ "name": "widescreen",
//!    "patches": [{ "type": "DirectWrite", "targetAddress": "8000CB14",
//!                  "bytes": "60000000", "replacedBytes": "12345678" }] }]
//! ```
//!
//! For an `InjectedRoutine`, `bytes` holds the routine as written at `hijackedAddress`,
//! `replacedBytes` the word replaced at the target and `hijackedBytes` the bytes the routine
//! replaced.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patcher::{AppliedPatch, PatchSet};
use crate::utils::{decode_hex, encode_hex, format_address, parse_address};

const DIRECT_WRITE: &str = "DirectWrite";
const INJECTED_ROUTINE: &str = "InjectedRoutine";

// Every field is optional on the wire so a missing one is reported as a malformed patch
// rather than a generic JSON error.
#[derive(Debug, Serialize, Deserialize)]
struct RawPatchSet {
    name: Option<String>,
    patches: Option<Vec<RawPatch>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPatch {
    #[serde(rename = "type")]
    kind: Option<String>,
    target_address: Option<String>,
    bytes: Option<String>,
    replaced_bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hijacked_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hijacked_bytes: Option<String>,
}

impl From<&AppliedPatch> for RawPatch {
    fn from(patch: &AppliedPatch) -> Self {
        match patch {
            AppliedPatch::DirectWrite {
                target,
                new_word,
                replaced_word,
            } => RawPatch {
                kind: Some(DIRECT_WRITE.to_string()),
                target_address: Some(format_address(*target)),
                bytes: Some(encode_hex(new_word)),
                replaced_bytes: Some(encode_hex(replaced_word)),
                hijacked_address: None,
                hijacked_bytes: None,
            },
            AppliedPatch::InjectedRoutine {
                target,
                replaced_word_at_target,
                hijack_address,
                instruction_bytes_written,
                replaced_bytes_at_hijack,
            } => RawPatch {
                kind: Some(INJECTED_ROUTINE.to_string()),
                target_address: Some(format_address(*target)),
                bytes: Some(encode_hex(instruction_bytes_written)),
                replaced_bytes: Some(encode_hex(replaced_word_at_target)),
                hijacked_address: Some(format_address(*hijack_address)),
                hijacked_bytes: Some(encode_hex(replaced_bytes_at_hijack)),
            },
        }
    }
}

impl RawPatch {
    fn into_applied(self, set: &str, index: usize) -> Result<AppliedPatch> {
        let missing = |field: &str| {
            Error::MalformedPatch(format!("patch #{index} of `{set}` has no `{field}`"))
        };

        let kind = self.kind.ok_or_else(|| missing("type"))?;
        if kind != DIRECT_WRITE && kind != INJECTED_ROUTINE {
            return Err(Error::UnknownTag(kind));
        }

        let target = parse_address(&self.target_address.ok_or_else(|| missing("targetAddress"))?)?;
        let bytes = decode_hex(&self.bytes.ok_or_else(|| missing("bytes"))?)?;
        let replaced = decode_hex(&self.replaced_bytes.ok_or_else(|| missing("replacedBytes"))?)?;
        let replaced_word = to_word(&replaced, "replacedBytes", set, index)?;

        if kind == DIRECT_WRITE {
            return Ok(AppliedPatch::DirectWrite {
                target,
                new_word: to_word(&bytes, "bytes", set, index)?,
                replaced_word,
            });
        }

        let hijack_address =
            parse_address(&self.hijacked_address.ok_or_else(|| missing("hijackedAddress"))?)?;
        let hijacked = decode_hex(&self.hijacked_bytes.ok_or_else(|| missing("hijackedBytes"))?)?;
        if bytes.is_empty() || bytes.len() % 4 != 0 || hijacked.len() != bytes.len() {
            return Err(Error::MalformedPatch(format!(
                "patch #{index} of `{set}` has {} routine bytes and {} hijacked bytes",
                bytes.len(),
                hijacked.len()
            )));
        }

        Ok(AppliedPatch::InjectedRoutine {
            target,
            replaced_word_at_target: replaced_word,
            hijack_address,
            instruction_bytes_written: bytes,
            replaced_bytes_at_hijack: hijacked,
        })
    }
}

fn to_word(bytes: &[u8], field: &str, set: &str, index: usize) -> Result<[u8; 4]> {
    <[u8; 4]>::try_from(bytes).map_err(|_| {
        Error::MalformedPatch(format!(
            "`{field}` of patch #{index} in `{set}` is {} bytes, expected 4",
            bytes.len()
        ))
    })
}

/// Serializes patch sets to pretty-printed JSON.
pub fn to_string(sets: &[PatchSet]) -> Result<String> {
    let raw: Vec<RawPatchSet> = sets
        .iter()
        .map(|set| RawPatchSet {
            name: Some(set.name.clone()),
            patches: Some(set.patches.iter().map(RawPatch::from).collect()),
        })
        .collect();
    serde_json::to_string_pretty(&raw)
        .map_err(|e| Error::MalformedPatch(format!("cannot encode patch sets: {e}")))
}

/// Parses patch sets written by [`to_string`].
pub fn from_str(text: &str) -> Result<Vec<PatchSet>> {
    let raw: Vec<RawPatchSet> = serde_json::from_str(text)
        .map_err(|e| Error::MalformedPatch(format!("invalid patch set file: {e}")))?;

    raw.into_iter()
        .enumerate()
        .map(|(i, set)| {
            let name = set
                .name
                .ok_or_else(|| Error::MalformedPatch(format!("patch set #{i} has no `name`")))?;
            let patches = set
                .patches
                .ok_or_else(|| Error::MalformedPatch(format!("`{name}` has no `patches`")))?
                .into_iter()
                .enumerate()
                .map(|(index, patch)| patch.into_applied(&name, index))
                .collect::<Result<Vec<_>>>()?;
            Ok(PatchSet { name, patches })
        })
        .collect()
}
