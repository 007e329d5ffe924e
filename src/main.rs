//! Entry point for the dolpatch tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap` and set up logging.
//! 2. Load and validate the object image.
//! 3. Build the address space from the image or from an address map file.
//! 4. Run the requested command: info, apply, remove or rebuild.
//! 5. Write the patch record and the image back atomically.
//!
//! Error handling is done via `anyhow`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use dolpatch::arch::powerpc::PowerPc;
use dolpatch::config::{self, Command, Config};
use dolpatch::{parse_all, record, store, AddressSpace, ObjectImage, PatchSet, Patcher};

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match config.command {
        Command::Info { image } => info(&image),
        Command::Apply {
            image,
            patch,
            name,
            record,
            hijack,
            address_map,
            output,
        } => {
            let output = output.unwrap_or_else(|| image.clone());
            apply(&image, &patch, &name, &record, hijack, address_map.as_deref(), &output)
        }
        Command::Remove {
            image,
            record,
            name,
            address_map,
            output,
        } => {
            let output = output.unwrap_or_else(|| image.clone());
            remove(&image, &record, name.as_deref(), address_map.as_deref(), &output)
        }
        Command::Rebuild { image, output } => {
            let image = load_image(&image)?;
            let bytes = image
                .serialize()
                .context("failed to lay out the rebuilt image")?;
            store::write_atomic(&output, &bytes)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Rebuilt image written to {}", output.display());
            Ok(())
        }
    }
}

fn load_image(path: &Path) -> Result<ObjectImage> {
    let bytes = store::load(path).with_context(|| format!("failed to open {}", path.display()))?;
    ObjectImage::parse(bytes).with_context(|| format!("failed to parse {}", path.display()))
}

fn address_space(image: &ObjectImage, address_map: Option<&Path>) -> Result<AddressSpace> {
    match address_map {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            config::parse_address_map(&text)
                .with_context(|| format!("failed to parse {}", path.display()))
        }
        None => Ok(AddressSpace::from_image(image)),
    }
}

fn load_record(path: &Path) -> Result<Vec<PatchSet>> {
    record::load(path).with_context(|| format!("failed to read {}", path.display()))
}

fn save_record(path: &Path, sets: &[PatchSet]) -> Result<()> {
    record::save(path, sets).with_context(|| format!("failed to write {}", path.display()))
}

fn info(path: &Path) -> Result<()> {
    let image = load_image(path)?;
    println!("{}", path.display());
    println!("  entry point: 0x{:08X}", image.entry_point());
    for segment in image.loaded_segments() {
        println!("  {segment}");
    }
    let (address, length) = image.zero_init();
    println!(
        "  bss: 0x{:08X}..0x{:08X} ({} bytes)",
        address,
        address as u64 + length as u64,
        length
    );
    Ok(())
}

fn apply(
    image_path: &Path,
    patch_path: &Path,
    name: &str,
    record_path: &Path,
    hijack: Option<u32>,
    address_map: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let mut image = load_image(image_path)?;
    let space = address_space(&image, address_map)?;

    let text = fs::read_to_string(patch_path)
        .with_context(|| format!("failed to read {}", patch_path.display()))?;
    let batch = parse_all(&text, &space)
        .with_context(|| format!("failed to parse {}", patch_path.display()))?;

    let mut sets = load_record(record_path)?;
    record::check_new_name(&sets, name)
        .with_context(|| format!("cannot record into {}", record_path.display()))?;
    let mut cursor = record::hijack_cursor(&sets, hijack, &batch).context("use --hijack")?;

    let patcher = Patcher::new(PowerPc);
    let set = patcher
        .apply(&mut image, &space, batch, name, &mut cursor)
        .context("failed to apply patch")?;
    let count = set.patches.len();

    record::commit_applied(record_path, &mut sets, set, output, image.bytes())
        .with_context(|| format!("failed to commit `{}` to {}", name, output.display()))?;

    println!(
        "Applied {} patches as `{}` to {}",
        count,
        name,
        output.display()
    );
    Ok(())
}

fn remove(
    image_path: &Path,
    record_path: &Path,
    name: Option<&str>,
    address_map: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let mut image = load_image(image_path)?;
    let space = address_space(&image, address_map)?;

    let mut sets = load_record(record_path)?;
    let (position, set) = record::take(&mut sets, name)
        .with_context(|| format!("nothing to remove in {}", record_path.display()))?;
    let name = set.name.clone();

    let patcher = Patcher::new(PowerPc);
    let outcome = patcher.remove(&mut image, &space, set.clone());

    store::write_atomic(output, image.bytes())
        .with_context(|| format!("failed to write {}", output.display()))?;

    let complete = outcome.is_complete();
    record::keep_failed(&mut sets, position, set, &outcome);
    save_record(record_path, &sets)?;
    if complete {
        println!("Removed `{}` from {}", name, output.display());
        return Ok(());
    }

    for failure in &outcome.failures {
        eprintln!(
            "  patch #{} at 0x{:08X}: {}",
            failure.index, failure.target, failure.error
        );
    }
    bail!(
        "`{}` was only partially removed ({} restored, {} failed)",
        name,
        outcome.restored.len(),
        outcome.failures.len()
    )
}
