//! Message pipe over a loopback TCP stream.

use crate::error::{PipeError, PipeResult};
use crate::framing::{encode_frame, FrameReader, DEFAULT_MAX_FRAME_LEN};
use plugin_message::Message;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

const READ_CHUNK_LEN: usize = 16 * 1024;

/// A framed, buffered, non-threaded message channel.
///
/// `send` only enqueues. Nothing moves on the socket until the owner calls
/// [`MessagePipe::pump`] (or [`MessagePipe::flush`]). Once the peer closes
/// the connection or an IO error occurs the pipe is broken for good: later
/// sends are dropped and pumps fail with [`PipeError::Broken`].
#[derive(Debug)]
pub struct MessagePipe {
    stream: TcpStream,
    outbound: Vec<u8>,
    reader: FrameReader,
    broken: bool,
}

impl MessagePipe {
    /// Connect to a host listening on `127.0.0.1:<port>`.
    pub async fn connect(port: u16) -> PipeResult<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        debug!(port, "Connected message pipe");
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> PipeResult<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            outbound: Vec::new(),
            reader: FrameReader::new(DEFAULT_MAX_FRAME_LEN),
            broken: false,
        })
    }

    /// Limit the size of inbound frames.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.reader = FrameReader::new(max_frame_len);
        self
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Bytes queued but not yet written to the socket.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Queue a message for the next pump.
    pub fn send(&mut self, message: &Message) {
        if self.broken {
            trace!(
                class = message.class(),
                name = message.name(),
                "Dropping message on broken pipe"
            );
            return;
        }

        let frame = match message.generate() {
            Ok(text) => encode_frame(text.as_bytes()),
            Err(err) => Err(err.into()),
        };
        match frame {
            Ok(frame) => self.outbound.extend_from_slice(&frame),
            Err(err) => warn!(
                class = message.class(),
                name = message.name(),
                error = %err,
                "Failed to frame outgoing message"
            ),
        }
    }

    /// Move bytes in both directions and return every complete inbound
    /// message in arrival order.
    ///
    /// Waits at most `timeout` for the socket to become ready, then reads
    /// until it would block. Malformed messages inside a well-formed frame
    /// are logged and dropped. If the connection ends during this pump the
    /// messages that arrived before the end are still returned; the next
    /// pump reports the broken pipe.
    pub async fn pump(&mut self, timeout: Duration) -> PipeResult<Vec<Message>> {
        if self.broken {
            return Err(PipeError::Broken);
        }

        let mut messages = Vec::new();

        if let Err(err) = self.write_pending() {
            return Err(self.mark_broken(err));
        }

        let interest = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE.add(Interest::WRITABLE)
        };

        let ready = match tokio::time::timeout(timeout, self.stream.ready(interest)).await {
            Err(_elapsed) => return Ok(messages),
            Ok(Err(err)) => return Err(self.mark_broken(err.into())),
            Ok(Ok(ready)) => ready,
        };

        if ready.is_writable() {
            if let Err(err) = self.write_pending() {
                return Err(self.mark_broken(err));
            }
        }

        if !(ready.is_readable() || ready.is_read_closed()) {
            return Ok(messages);
        }

        let read_result = self.read_available();
        let decode_result = self.decode_frames(&mut messages);
        let failure = match (read_result, decode_result) {
            (_, Err(err)) => Some(err),
            (Err(err), Ok(())) => Some(err),
            (Ok(true), Ok(())) => Some(PipeError::Broken),
            (Ok(false), Ok(())) => None,
        };

        if let Some(err) = failure {
            let err = self.mark_broken(err);
            if messages.is_empty() {
                return Err(err);
            }
        }

        Ok(messages)
    }

    /// Write queued bytes until the queue is empty or `timeout` elapses.
    pub async fn flush(&mut self, timeout: Duration) -> PipeResult<()> {
        if self.broken {
            return Err(PipeError::Broken);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Err(err) = self.write_pending() {
                return Err(self.mark_broken(err));
            }
            if self.outbound.is_empty() {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, self.stream.writable()).await {
                Err(_elapsed) => {
                    return Err(PipeError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} bytes still queued", self.outbound.len()),
                    )))
                }
                Ok(Err(err)) => return Err(self.mark_broken(err.into())),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Shut the connection down. Queued bytes that were not flushed are lost.
    pub async fn close(&mut self) {
        if !self.outbound.is_empty() {
            debug!(
                pending = self.outbound.len(),
                "Closing pipe with unsent bytes"
            );
        }
        if let Err(err) = self.stream.shutdown().await {
            trace!(error = %err, "Shutdown of pipe socket failed");
        }
        self.outbound.clear();
        self.broken = true;
    }

    fn write_pending(&mut self) -> PipeResult<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(PipeError::Broken),
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Read until the socket would block. Returns true on end of stream.
    fn read_available(&mut self) -> PipeResult<bool> {
        let mut chunk = [0u8; READ_CHUNK_LEN];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(read) => self.reader.extend(&chunk[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn decode_frames(&mut self, messages: &mut Vec<Message>) -> PipeResult<()> {
        while let Some(frame) = self.reader.next_frame()? {
            match Message::parse_bytes(&frame) {
                Ok(message) => {
                    trace!(
                        class = message.class(),
                        name = message.name(),
                        "Received message"
                    );
                    messages.push(message);
                }
                Err(err) => warn!(
                    error = %err,
                    len = frame.len(),
                    "Dropping malformed message"
                ),
            }
        }
        Ok(())
    }

    fn mark_broken(&mut self, err: PipeError) -> PipeError {
        if !self.broken {
            match &err {
                PipeError::Broken => debug!("Message pipe closed by peer"),
                other => warn!(error = %other, "Message pipe broken"),
            }
        }
        self.broken = true;
        self.outbound.clear();
        err
    }
}
