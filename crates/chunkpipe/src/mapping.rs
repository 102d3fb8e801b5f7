//! Memory backing a segment: a shared file mapping or process-local heap.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use shm_primitives::{HeapRegion, Region};

/// A file mapped with `MAP_SHARED`. Every process mapping the same file sees
/// the same bytes, each at its own base address.
pub struct MappedSegment {
    base_addr: *mut u8,
    size: usize,
    path: PathBuf,
    /// Kept open for the lifetime of the mapping.
    _file: File,
}

// SAFETY: the mapping is plain memory; everything placed in it synchronizes
// through atomics.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Create (or truncate) `path` to `size` zeroed bytes and map it.
    pub fn create(path: impl AsRef<Path>, size: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        Self::map(file, size, path)
    }

    /// Map an existing file in full.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        Self::map(file, size, path)
    }

    fn map(file: File, size: usize, path: &Path) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file"));
        }
        // SAFETY: fresh mapping of a file we hold open.
        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(path = %path.display(), size, base = ?base_addr, "segment file mapped");
        Ok(Self {
            base_addr: base_addr as *mut u8,
            size,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn region(&self) -> Region {
        // SAFETY: the mapping lives as long as self.
        unsafe { Region::from_raw(self.base_addr, self.size) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        // SAFETY: base_addr and size come from a successful mmap.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

/// Where a segment's bytes live.
pub enum SegmentMemory {
    Mapped(MappedSegment),
    Heap(HeapRegion),
}

impl SegmentMemory {
    pub fn region(&self) -> Region {
        match self {
            Self::Mapped(m) => m.region(),
            Self::Heap(h) => h.region(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Mapped(m) => m.len(),
            Self::Heap(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Mapped(m) => Some(m.path()),
            Self::Heap(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chunkpipe_{name}_{}.shm", std::process::id()))
    }

    #[test]
    fn two_mappings_share_bytes_at_different_addresses() {
        let path = temp_path("mapping");
        let a = MappedSegment::create(&path, 8192).unwrap();
        let b = MappedSegment::open(&path).unwrap();
        assert_eq!(b.len(), 8192);
        assert_ne!(a.region().as_ptr(), b.region().as_ptr());

        unsafe { a.region().offset(100).write(0xAB) };
        assert_eq!(unsafe { b.region().offset(100).read() }, 0xAB);

        drop((a, b));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn open_missing_or_empty_file_fails() {
        assert!(MappedSegment::open(temp_path("missing")).is_err());
        let path = temp_path("empty");
        std::fs::File::create(&path).unwrap();
        assert!(MappedSegment::open(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
