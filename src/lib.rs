//! Reversible Patching Library.
//!
//! This library provides the core components for the `dolpatch` tool.
//! It is organized into several modules:
//! - `image`: Object image parsing, validation and layout.
//! - `address`: Address classification and file offset translation.
//! - `descriptor`: Patch text decoding into validated batches.
//! - `patcher`: Applying and removing batches.
//! - `arch`: Architecture-specific instruction encoding.
//! - `persist`: Saving and loading applied patch sets.
//! - `record`: Bookkeeping of the applied sets across runs.
//! - `store`: Byte storage and atomic file output.
//! - `config`: CLI configuration and address maps.

pub mod address;
pub mod arch;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod patcher;
pub mod persist;
pub mod record;
pub mod store;
pub mod utils;

pub use address::{AddressRange, AddressSpace, Region};
pub use descriptor::{parse_all, PatchBatch, PatchDescriptor};
pub use error::{Error, Result};
pub use image::{ObjectImage, Segment, SegmentRole};
pub use patcher::{AppliedPatch, PatchSet, Patcher, RemoveOutcome};
