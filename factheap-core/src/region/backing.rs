//! The memory object behind a region and its mapping.

use super::config::RegionConfig;
use crate::error::{FactHeapError, Result};
use crate::types::RegionOffset;
use memmap2::{MmapMut, MmapOptions};
use rustix::fd::{AsRawFd, BorrowedFd, RawFd};
use rustix::fs::{FallocateFlags, MemfdFlags};
use rustix::io::{Errno, FdFlags};
use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;

/// Where the region's pages come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Anonymous memfd.
    Memfd,
    /// Unlinked temporary file in the configured shm directory.
    ShmFile,
    /// Duplicate of another process's descriptor.
    Attached,
}

/// An open memory object plus a shared mapping of it.
pub(crate) struct Backing {
    mmap: MmapMut,
    file: File,
    kind: BackingKind,
}

impl Backing {
    /// Create and map a fresh object of `size` bytes.
    pub(crate) fn create(config: &RegionConfig, size: u64) -> Result<Self> {
        let (file, kind) = match &config.shm_dir {
            Some(dir) => (shm_file(dir, config.shm_min_avail)?, BackingKind::ShmFile),
            None => (anonymous_memfd()?, BackingKind::Memfd),
        };

        // The descriptor is handed to workers, so it must survive exec.
        rustix::io::fcntl_setfd(&file, FdFlags::empty()).map_err(|e| {
            FactHeapError::RegionCreate {
                name: "fd flags".to_string(),
                cause: e.to_string(),
            }
        })?;

        file.set_len(size).map_err(|e| FactHeapError::RegionCreate {
            name: format!("{kind:?}"),
            cause: e.to_string(),
        })?;

        let mmap = map(&file, size)?;
        Ok(Self { mmap, file, kind })
    }

    /// Map an object created by another process.
    pub(crate) fn attach(fd: RawFd, size: u64) -> Result<Self> {
        // SAFETY: the connector record promises `fd` is open in this process;
        // it is only borrowed long enough to duplicate it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let owned = rustix::io::fcntl_dupfd_cloexec(borrowed, 0).map_err(|e| {
            FactHeapError::RegionAttach {
                fd,
                cause: e.to_string(),
            }
        })?;
        let file = File::from(owned);

        let actual = file
            .metadata()
            .map_err(|e| FactHeapError::RegionAttach {
                fd,
                cause: e.to_string(),
            })?
            .len();
        if actual < size {
            return Err(FactHeapError::RegionAttach {
                fd,
                cause: format!("object is {actual} bytes, layout needs {size}"),
            });
        }

        let mmap = map(&file, size)?;
        Ok(Self {
            mmap,
            file,
            kind: BackingKind::Attached,
        })
    }

    /// Base address of the mapping.
    pub(crate) fn base(&mut self) -> NonNull<u8> {
        NonNull::from(&mut self.mmap[..]).cast()
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn kind(&self) -> BackingKind {
        self.kind
    }

    /// Make sure the backing store can supply `len` bytes at `offset`.
    ///
    /// Writing to a page of a sparse memfd that cannot be backed raises
    /// SIGBUS; reserving first turns that into an error the caller sees.
    pub(crate) fn reserve(&self, offset: RegionOffset, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        loop {
            match rustix::fs::fallocate(&self.file, FallocateFlags::empty(), offset.as_u64(), len)
            {
                Ok(()) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(e) => {
                    return Err(FactHeapError::OutOfSharedMemory {
                        offset,
                        len,
                        cause: e.to_string(),
                    })
                }
            }
        }
    }
}

fn anonymous_memfd() -> Result<File> {
    let name = format!("factheap-{}", uuid::Uuid::new_v4());
    let fd = rustix::fs::memfd_create(name.as_str(), MemfdFlags::empty()).map_err(|e| {
        FactHeapError::RegionCreate {
            name,
            cause: e.to_string(),
        }
    })?;
    Ok(File::from(fd))
}

fn shm_file(dir: &Path, min_avail: u64) -> Result<File> {
    if min_avail > 0 {
        let stats = rustix::fs::statvfs(dir).map_err(|e| FactHeapError::RegionCreate {
            name: dir.display().to_string(),
            cause: format!("statvfs: {e}"),
        })?;
        let available = stats.f_bsize.saturating_mul(stats.f_bavail);
        if available < min_avail {
            return Err(FactHeapError::InsufficientShm {
                dir: dir.to_path_buf(),
                available,
                required: min_avail,
            });
        }
    }

    tempfile::tempfile_in(dir).map_err(|e| FactHeapError::RegionCreate {
        name: dir.display().to_string(),
        cause: e.to_string(),
    })
}

fn map(file: &File, size: u64) -> Result<MmapMut> {
    // SAFETY: the object is shared on purpose; every access to the mapping
    // goes through atomics or through ranges owned by a single writer.
    unsafe {
        MmapOptions::new()
            .len(size as usize)
            .map_mut(file)
            .map_err(|e| FactHeapError::RegionMap {
                size,
                cause: e.to_string(),
            })
    }
}
