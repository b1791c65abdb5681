//! Named shared-memory regions for handing decoded frames from the plugin
//! child to the host without copying them through the control socket.
//!
//! # Lifecycle
//!
//! ```text
//!   host (creator)                       child (attacher)
//!   factory.create(size) ── shm_add ───▶ attach(name, size)
//!        ...  backend writes pixels, host reads them  ...
//!   remove requested ───── shm_remove ──▶ backend lets go, detach()
//!   destroy() ◀──────── shm_remove_response
//! ```
//!
//! The creator owns the OS object. It must keep the region mapped until the
//! attacher has confirmed that it unmapped its view, so `destroy` is only
//! ever called after the handshake completes.
//!
//! # Platform Support
//!
//! | Platform | Implementation |
//! |----------|----------------|
//! | macOS / Linux | POSIX `shm_open` + `mmap` |
//! | Windows | `CreateFileMappingW` + `MapViewOfFile` |
//!
//! There is no locking inside a region. Readers accept that a frame may be
//! torn while the writer is mid-update; the `updated` notification marks
//! frame boundaries.

mod error;
mod factory;
mod region;

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

pub use error::{ShmError, ShmResult};
pub use factory::SharedMemoryFactory;
pub use region::{RegionRole, SharedMemoryRegion};
