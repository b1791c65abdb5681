//! Message pipe between the plugin host and the plugin child.
//!
//! Every message crosses the socket as one framed unit:
//!
//! ```text
//! [4: big-endian u32 length N][N: UTF-8 message text]
//! ```
//!
//! [`MessagePipe`] owns the socket together with its outbound queue and
//! inbound reassembly buffer. It has no threads of its own: callers drive it
//! from their loop with [`MessagePipe::pump`].

pub mod error;
pub mod framing;
pub mod pipe;

pub use error::{PipeError, PipeResult};
pub use framing::{encode_frame, read_frame, FrameReader, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN};
pub use pipe::MessagePipe;
