//! Shared-memory region handle.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{ShmError, ShmResult};

#[cfg(unix)]
use crate::unix as platform;
#[cfg(windows)]
use crate::windows as platform;

/// Which side of the handshake holds a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRole {
    /// Created the OS object and is responsible for releasing it.
    Creator,
    /// Mapped an object created by another process.
    Attacher,
}

impl RegionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionRole::Creator => "creator",
            RegionRole::Attacher => "attacher",
        }
    }
}

/// A named OS shared-memory segment mapped into this process.
///
/// Access goes through bounds-checked copies. The other process may write
/// at any time, so no Rust reference into the mapping is ever handed out.
///
/// Dropping a region releases it according to its role: an attacher
/// unmaps, a creator unmaps and removes the OS object.
pub struct SharedMemoryRegion {
    name: String,
    size: usize,
    role: RegionRole,
    mapping: Option<platform::Mapping>,
}

// The mapping is process-wide memory, not tied to the creating thread.
unsafe impl Send for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Create a new segment under `name`. Fails if the name is taken.
    pub(crate) fn create(name: &str, size: usize) -> ShmResult<Self> {
        if size == 0 {
            return Err(ShmError::Allocation(
                "cannot create a zero-sized region".to_string(),
            ));
        }

        let mapping = platform::create_shm(name, size)?;
        debug!(name, size, "Created shared memory region");

        Ok(Self {
            name: name.to_string(),
            size,
            role: RegionRole::Creator,
            mapping: Some(mapping),
        })
    }

    /// Map a segment that another process created.
    pub fn attach(name: &str, size: usize) -> ShmResult<Self> {
        if size == 0 {
            return Err(ShmError::Mmap(format!(
                "cannot attach zero bytes of '{}'",
                name
            )));
        }

        let mapping = platform::open_shm(name, size)?;
        debug!(name, size, "Attached shared memory region");

        Ok(Self {
            name: name.to_string(),
            size,
            role: RegionRole::Attacher,
            mapping: Some(mapping),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn role(&self) -> RegionRole {
        self.role
    }

    /// Base address of this process's view.
    ///
    /// Only meaningful inside this process. Writes through it race with the
    /// other side exactly like [`SharedMemoryRegion::write_at`] does.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping
            .as_ref()
            .map_or(std::ptr::null_mut(), platform::Mapping::as_ptr)
    }

    fn check_range(&self, offset: usize, len: usize) -> ShmResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Copy `bytes` into the region at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> ShmResult<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: range checked against the mapped length.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Copy `out.len()` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> ShmResult<()> {
        self.check_range(offset, out.len())?;
        // SAFETY: range checked against the mapped length.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Set every byte of the region.
    pub fn fill(&mut self, byte: u8) {
        // SAFETY: whole mapped length.
        unsafe {
            std::ptr::write_bytes(self.as_ptr(), byte, self.size);
        }
    }

    /// Snapshot of the whole region.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        // Full range is always in bounds.
        let _ = self.read_at(0, &mut out);
        out
    }

    /// Unmap and remove the OS object. Creator only.
    ///
    /// Call this only after the attacher confirmed it let go of its view.
    pub fn destroy(mut self) -> ShmResult<()> {
        if self.role != RegionRole::Creator {
            return Err(ShmError::WrongRole {
                operation: "destroy",
                role: self.role.as_str(),
            });
        }
        debug!(name = %self.name, "Destroying shared memory region");
        self.release()
    }

    /// Unmap without removing the OS object. Attacher only.
    pub fn detach(mut self) -> ShmResult<()> {
        if self.role != RegionRole::Attacher {
            return Err(ShmError::WrongRole {
                operation: "detach",
                role: self.role.as_str(),
            });
        }
        debug!(name = %self.name, "Detaching shared memory region");
        self.release()
    }

    fn release(&mut self) -> ShmResult<()> {
        let Some(mapping) = self.mapping.take() else {
            return Ok(());
        };

        // SAFETY: the mapping was taken out of self, nothing refers to it.
        let unmapped = unsafe { platform::close_shm(mapping) };
        let unlinked = match self.role {
            RegionRole::Creator => platform::unlink_shm(&self.name),
            RegionRole::Attacher => Ok(()),
        };
        unmapped.and(unlinked)
    }
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("role", &self.role)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if self.mapping.is_some() {
            if let Err(err) = self.release() {
                warn!(name = %self.name, error = %err, "Failed to release shared memory region");
            }
        }
    }
}
