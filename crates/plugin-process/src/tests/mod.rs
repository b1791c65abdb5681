//! Scenario tests for the host and child process managers.
//!
//! Host and child run on the test thread, stepped in turn over a real
//! loopback pipe, with a stub backend behind the C entry-point ABI.
//!
//! - `harness.rs`       - stub backend, in-process launcher, PluginPair / MediaPair
//! - `lifecycle.rs`     - launch, hello, load, run, graceful shutdown
//! - `shared_memory.rs` - region handshake and two-phase teardown
//! - `totality.rs`      - every state reaches DONE when the other side goes away
//! - `blocking.rs`      - blocking requests, deferral and lock-up suspension
//! - `ordering.rs`      - per-pipe FIFO in both directions
//! - `media.rs`         - media session size negotiation and event mapping

pub(crate) mod harness;
mod totality;
