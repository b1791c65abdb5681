//! Windows shared memory implementation.
//!
//! Regions are pagefile-backed file mappings named
//! `Local\{prefix}_{pid}_{counter}`. The `Local\` prefix keeps the object in
//! the session namespace. The kernel releases the object once the last
//! handle is closed, so there is no separate unlink step.

use windows::core::HSTRING;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

use crate::error::{ShmError, ShmResult};

/// Name for the `counter`-th region of process `pid`.
pub(crate) fn segment_name(prefix: &str, pid: u32, counter: u32) -> String {
    format!("Local\\{}_{}_{}", prefix, pid, counter)
}

/// A mapped view plus the mapping handle it belongs to.
pub(crate) struct Mapping {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
}

impl Mapping {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }
}

fn check_name(name: &str) -> ShmResult<HSTRING> {
    if name.is_empty() || name.contains('\0') {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(HSTRING::from(name))
}

/// Create and map a new pagefile-backed region.
pub(crate) fn create_shm(name: &str, size: usize) -> ShmResult<Mapping> {
    let wide_name = check_name(name)?;
    let size = size as u64;

    unsafe {
        let handle = CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            None,
            PAGE_READWRITE,
            (size >> 32) as u32,
            size as u32,
            &wide_name,
        )
        .map_err(|e| ShmError::Allocation(format!("CreateFileMappingW failed: {}", e)))?;

        if GetLastError() == ERROR_ALREADY_EXISTS {
            let _ = CloseHandle(handle);
            return Err(ShmError::Allocation(format!(
                "mapping '{}' already exists",
                name
            )));
        }

        map_view(handle, size as usize)
    }
}

/// Open and map a region created by another process.
pub(crate) fn open_shm(name: &str, size: usize) -> ShmResult<Mapping> {
    let wide_name = check_name(name)?;

    unsafe {
        let handle = OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &wide_name).map_err(|e| {
            if e.code() == ERROR_FILE_NOT_FOUND.to_hresult() {
                ShmError::NotFound(name.to_string())
            } else {
                ShmError::Platform(format!("OpenFileMappingW failed: {}", e))
            }
        })?;

        map_view(handle, size)
    }
}

unsafe fn map_view(handle: HANDLE, size: usize) -> ShmResult<Mapping> {
    let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size);
    if view.Value.is_null() {
        let err = windows::core::Error::from_win32();
        let _ = CloseHandle(handle);
        return Err(ShmError::Mmap(format!("MapViewOfFile failed: {}", err)));
    }
    Ok(Mapping { handle, view })
}

/// Unmap the view and close the mapping handle.
///
/// # Safety
///
/// No pointer derived from the mapping may be used afterwards.
pub(crate) unsafe fn close_shm(mapping: Mapping) -> ShmResult<()> {
    let unmapped = UnmapViewOfFile(mapping.view);
    let _ = CloseHandle(mapping.handle);
    unmapped.map_err(|e| ShmError::Mmap(format!("UnmapViewOfFile failed: {}", e)))
}

/// Nothing to remove: the object dies with its last handle.
pub(crate) fn unlink_shm(_name: &str) -> ShmResult<()> {
    Ok(())
}
