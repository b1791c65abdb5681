//! Unique naming and creation of regions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::error::{ShmError, ShmResult};
use crate::region::SharedMemoryRegion;

#[cfg(unix)]
use crate::unix::segment_name;
#[cfg(windows)]
use crate::windows::segment_name;

const DEFAULT_PREFIX: &str = "spm";

/// Attempts before giving up on finding a free name.
const MAX_CREATE_ATTEMPTS: u32 = 16;

/// Hands out region names unique within the OS namespace and creates the
/// regions behind them.
///
/// Names combine the process id with a monotonic counter. Every creator in a
/// process should share one factory, normally [`SharedMemoryFactory::shared`].
#[derive(Debug)]
pub struct SharedMemoryFactory {
    prefix: String,
    pid: u32,
    counter: AtomicU32,
}

impl SharedMemoryFactory {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    /// Factory whose names start with `prefix` instead of the default.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            pid: std::process::id(),
            counter: AtomicU32::new(0),
        }
    }

    /// The process-wide factory.
    pub fn shared() -> Arc<SharedMemoryFactory> {
        static SHARED: OnceLock<Arc<SharedMemoryFactory>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(SharedMemoryFactory::new()))
            .clone()
    }

    /// Next unused name.
    pub fn next_name(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        segment_name(&self.prefix, self.pid, counter)
    }

    /// Create and map a fresh region of `size` bytes.
    ///
    /// A name left behind by an earlier process with the same pid is
    /// skipped; any other failure is reported as an allocation error.
    pub fn create(&self, size: usize) -> ShmResult<SharedMemoryRegion> {
        let mut last_err = None;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let name = self.next_name();
            match SharedMemoryRegion::create(&name, size) {
                Ok(region) => return Ok(region),
                Err(err @ ShmError::Allocation(_)) if size > 0 => {
                    debug!(name = %name, error = %err, "Region name unavailable, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ShmError::Allocation(format!("no free region name after {} attempts", MAX_CREATE_ATTEMPTS))
        }))
    }
}

impl Default for SharedMemoryFactory {
    fn default() -> Self {
        Self::new()
    }
}
