//! Growable byte storage backing a hive.
//!
//! A hive is either a memory-mapped file (the common case) or an in-memory
//! buffer (synthetic hives built for tests, or a hive loaded with
//! `Hive::from_vec`). Both need to grow when the allocator runs out of
//! space; `Backing` is the single place that knows how.

use crate::error::Result;
use memmap2::MmapMut;
use std::fs::File;

pub enum Backing {
    Mapped { file: File, mmap: MmapMut },
    Owned(Vec<u8>),
}

impl Backing {
    pub fn open_file(file: File) -> Result<Self> {
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Backing::Mapped { file, mmap })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Backing::Owned(data)
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Mapped { mmap, .. } => mmap,
            Backing::Owned(v) => v,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Mapped { mmap, .. } => mmap,
            Backing::Owned(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the backing store by `additional` zero-filled bytes, remapping
    /// a file-backed store after extending the file.
    pub fn grow_by(&mut self, additional: usize) -> Result<()> {
        match self {
            Backing::Mapped { file, mmap } => {
                let new_len = mmap.len() + additional;
                file.set_len(new_len as u64)?;
                *mmap = unsafe { MmapMut::map_mut(&*file)? };
                Ok(())
            }
            Backing::Owned(v) => {
                v.resize(v.len() + additional, 0);
                Ok(())
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        if let Backing::Mapped { mmap, .. } = self {
            mmap.flush()?;
        }
        Ok(())
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let Backing::Mapped { mmap, .. } = self {
            mmap.flush_range(offset, len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_backing_grows() {
        let mut backing = Backing::from_vec(vec![0u8; 16]);
        backing.grow_by(16).unwrap();
        assert_eq!(backing.len(), 32);
    }
}
