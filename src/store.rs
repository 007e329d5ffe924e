//! Byte storage.
//!
//! [`ByteStore`] is the random-access surface the patch engine reads original bytes from and
//! writes edits to. Files are loaded through a memory map and written back atomically so a
//! crash never leaves a half-patched image on disk.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::Result;

/// A byte-addressable random-access store.
pub trait ByteStore {
    /// Reads `len` bytes starting at `offset`.
    fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>>;

    /// Overwrites bytes starting at `offset`. The store never grows.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()>;
}

fn out_of_bounds(offset: u32, len: usize, size: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("0x{offset:X}+{len} is past the end of a {size}-byte store"),
    )
}

impl ByteStore for Vec<u8> {
    fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        self.get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| out_of_bounds(offset, len, self.len()).into())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let size = self.len();
        let target = self
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| out_of_bounds(offset, bytes.len(), size))?;
        target.copy_from_slice(bytes);
        tracing::trace!("wrote {} bytes at file offset 0x{:X}", bytes.len(), offset);
        Ok(())
    }
}

/// Loads a whole file into memory.
pub fn load(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    // SAFETY: the map is copied out immediately and dropped before returning.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap.to_vec())
}

/// Replaces `path` with `bytes` via a temporary file in the same directory and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    io::Write::write_all(&mut temp, bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    tracing::debug!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn vec_store_bounds() {
        let mut store = vec![0u8; 8];
        store.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.read(3, 3).unwrap(), [0, 1, 2]);
        assert!(matches!(store.write(6, &[1, 2, 3]), Err(Error::Io(_))));
        assert!(matches!(store.read(9, 0), Err(Error::Io(_))));
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn atomic_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.dol");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(load(&path).unwrap(), b"second");
        // Only the destination is left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
