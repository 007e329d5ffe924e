//! Configuration module.
//!
//! This module defines the command-line interface (CLI) using `clap`, and the address map
//! file format that lets a caller describe an image's regions instead of deriving them from
//! its header.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use crate::address::{AddressRange, AddressSpace, Region};
use crate::error::{Error, Result};
use crate::utils::parse_address;

/// Applies and reverts reversible patches on PowerPC object images.
///
/// Applied patches are recorded in a JSON file together with the bytes they replaced, so
/// any set can be removed again later.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the image header and segment tables
    Info {
        /// Object image to inspect
        image: PathBuf,
    },
    /// Apply a patch text file and record what it replaced
    Apply {
        /// Object image to patch
        image: PathBuf,

        /// Patch text (hex records)
        #[arg(short, long)]
        patch: PathBuf,

        /// Name the applied set is recorded under
        #[arg(short, long)]
        name: String,

        /// Patch record file to append to
        #[arg(short, long, default_value = "patches.json")]
        record: PathBuf,

        /// Where injected routines start; defaults to right after the last recorded one
        #[arg(long, value_parser = parse_cursor)]
        hijack: Option<u32>,

        /// JSON address map; defaults to the image's own segment tables
        #[arg(long)]
        address_map: Option<PathBuf>,

        /// Write the patched image here instead of over the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Revert a recorded patch set
    Remove {
        /// Object image to restore
        image: PathBuf,

        /// Patch record file to take the set from
        #[arg(short, long, default_value = "patches.json")]
        record: PathBuf,

        /// Set to remove; defaults to the most recently applied one
        #[arg(short, long)]
        name: Option<String>,

        /// JSON address map; defaults to the image's own segment tables
        #[arg(long)]
        address_map: Option<PathBuf>,

        /// Write the restored image here instead of over the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rewrite the image in canonical layout
    Rebuild {
        /// Object image to read
        image: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn parse_cursor(text: &str) -> std::result::Result<u32, String> {
    parse_address(text).map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize)]
struct AddressMapFile {
    ranges: Vec<AddressMapEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressMapEntry {
    start: String,
    end: String,
    region: String,
    #[serde(default)]
    file_offset_base: Option<String>,
}

/// Parses an address map:
///
/// ```json
/// { "ranges": [ { "start": "0x80003100", "end": "0x80005540",
///                 "region": "text0", "fileOffsetBase": "0x100" },
///               { "start": "0x803D0000", "end": "0x80420000", "region": "bss" } ] }
/// ```
///
/// `end` is exclusive. `fileOffsetBase` may be omitted for `bss`.
pub fn parse_address_map(text: &str) -> Result<AddressSpace> {
    let file: AddressMapFile = serde_json::from_str(text)
        .map_err(|e| Error::Format(format!("invalid address map: {e}")))?;

    let ranges = file
        .ranges
        .into_iter()
        .map(|entry| {
            let region: Region = entry.region.parse().map_err(Error::Format)?;
            let file_offset_base = match (&entry.file_offset_base, region) {
                (Some(base), _) => parse_address(base)?,
                (None, Region::ZeroInit) => 0,
                (None, _) => {
                    return Err(Error::Format(format!(
                        "{region} range needs a fileOffsetBase"
                    )))
                }
            };
            Ok(AddressRange {
                start: parse_address(&entry.start)?,
                end: parse_address(&entry.end)? as u64,
                region,
                file_offset_base,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    AddressSpace::new(ranges)
}
