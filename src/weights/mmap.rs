//! Memory-mapped checkpoint access.
//!
//! Maps safetensors files read-only so headers can be inspected without
//! reading gigabytes of tensor data.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{MammutError, Result};

/// A read-only memory-mapped file. Dropping it unmaps the file.
pub struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    /// Map a file into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            MammutError::WeightLoad(format!("failed to open {}: {e}", path.display()))
        })?;

        // Safety: checkpoints are treated as read-only for the lifetime of the map.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                MammutError::WeightLoad(format!("failed to mmap {}: {e}", path.display()))
            })?
        };

        Ok(MappedFile { mmap })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Bounds-checked subslice.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size());
        match end {
            Some(end) => Ok(&self.mmap[offset..end]),
            None => Err(MammutError::WeightLoad(format!(
                "slice [{offset}..{offset}+{len}] exceeds file size {}",
                self.size()
            ))),
        }
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }
}
