//! Unix (macOS/Linux) shared memory implementation.
//!
//! Uses POSIX shared memory (`shm_open`) and `mmap`.
//!
//! # Naming Convention
//!
//! Shared memory objects are named `/{prefix}_{pid}_{counter}`. The leading
//! `/` is required by POSIX, and macOS limits names to 31 characters
//! including it.

use std::ffi::CString;
use std::ptr::{self, NonNull};

use libc::{
    c_int, c_uint, c_void, close, fstat, ftruncate, mmap, munmap, off_t, shm_open, shm_unlink,
    MAP_FAILED, MAP_SHARED, O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE, S_IRUSR, S_IWUSR,
};

use crate::error::{ShmError, ShmResult};

/// Longest name macOS accepts, leading `/` included.
const MAX_NAME_LEN: usize = 31;

/// Name for the `counter`-th region of process `pid`.
pub(crate) fn segment_name(prefix: &str, pid: u32, counter: u32) -> String {
    format!("/{}_{}_{}", prefix, pid, counter)
}

/// A live mapping plus the descriptor it was created from.
#[derive(Debug)]
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    fd: c_int,
}

impl Mapping {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

fn c_name(name: &str) -> ShmResult<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > MAX_NAME_LEN {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// Create and map a new shared memory region.
///
/// Fails if an object with this name already exists.
pub(crate) fn create_shm(name: &str, size: usize) -> ShmResult<Mapping> {
    let c_name = c_name(name)?;

    unsafe {
        // Create shared memory object (fail if exists)
        let fd = shm_open(
            c_name.as_ptr(),
            O_CREAT | O_EXCL | O_RDWR,
            (S_IRUSR | S_IWUSR) as c_uint,
        );

        if fd == -1 {
            let err = std::io::Error::last_os_error();
            return Err(ShmError::Allocation(format!(
                "shm_open failed for '{}': {}",
                name, err
            )));
        }

        // Set size
        if ftruncate(fd, size as off_t) == -1 {
            let err = std::io::Error::last_os_error();
            close(fd);
            shm_unlink(c_name.as_ptr());
            return Err(ShmError::Allocation(format!(
                "ftruncate to {} bytes failed: {}",
                size, err
            )));
        }

        match map_fd(fd, size) {
            Ok(mapping) => Ok(mapping),
            Err(err) => {
                close(fd);
                shm_unlink(c_name.as_ptr());
                Err(err)
            }
        }
    }
}

/// Open and map an existing region created by another process.
///
/// `size` comes from the creator's handshake; the object must be at least
/// that large.
pub(crate) fn open_shm(name: &str, size: usize) -> ShmResult<Mapping> {
    let c_name = c_name(name)?;

    unsafe {
        let fd = shm_open(c_name.as_ptr(), O_RDWR, 0);

        if fd == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::Platform(format!(
                "shm_open failed for '{}': {}",
                name, err
            )));
        }

        let mut stat: libc::stat = std::mem::zeroed();
        if fstat(fd, &mut stat) == -1 {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(ShmError::Platform(format!("fstat failed: {}", err)));
        }
        if (stat.st_size as u64) < size as u64 {
            close(fd);
            return Err(ShmError::Mmap(format!(
                "segment '{}' holds {} bytes, {} requested",
                name, stat.st_size, size
            )));
        }

        map_fd(fd, size).map_err(|err| {
            close(fd);
            err
        })
    }
}

unsafe fn map_fd(fd: c_int, size: usize) -> ShmResult<Mapping> {
    let ptr = mmap(
        ptr::null_mut(),
        size,
        PROT_READ | PROT_WRITE,
        MAP_SHARED,
        fd,
        0,
    );

    if ptr == MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(ShmError::Mmap(format!("mmap failed: {}", err)));
    }

    let ptr = NonNull::new(ptr as *mut u8)
        .ok_or_else(|| ShmError::Mmap("mmap returned null".to_string()))?;

    Ok(Mapping { ptr, len: size, fd })
}

/// Unmap and close shared memory
///
/// # Safety
///
/// No pointer derived from the mapping may be used afterwards.
pub(crate) unsafe fn close_shm(mapping: Mapping) -> ShmResult<()> {
    let unmapped = munmap(mapping.ptr.as_ptr() as *mut c_void, mapping.len);
    let unmap_err = (unmapped == -1).then(std::io::Error::last_os_error);
    close(mapping.fd);

    match unmap_err {
        Some(err) => Err(ShmError::Mmap(format!("munmap failed: {}", err))),
        None => Ok(()),
    }
}

/// Remove the shared memory object (creator only).
pub(crate) fn unlink_shm(name: &str) -> ShmResult<()> {
    let c_name = c_name(name)?;

    unsafe {
        if shm_unlink(c_name.as_ptr()) == -1 {
            let err = std::io::Error::last_os_error();
            // ENOENT is ok - already unlinked
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(ShmError::Platform(format!("shm_unlink failed: {}", err)));
            }
        }
    }
    Ok(())
}
