use std::io::{self, Read};

use bytes::{Buf, BytesMut};
use tracing::trace;

use super::ChannelId;

/// Default number of bytes requested from the socket per read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Extracts frames from the bytes buffered for a channel.
///
/// `decode` is offered every byte not yet consumed and returns how many of
/// them it consumed. Returning `0` means "need more data"; the unconsumed
/// tail is offered again, extended, after the next read.
pub trait FrameDecoder: Send {
    fn decode(&mut self, channel: ChannelId, buf: &[u8]) -> io::Result<usize>;
}

impl<F> FrameDecoder for F
where
    F: FnMut(ChannelId, &[u8]) -> io::Result<usize> + Send,
{
    fn decode(&mut self, channel: ChannelId, buf: &[u8]) -> io::Result<usize> {
        self(channel, buf)
    }
}

/// Result of a single bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read and offered to the decoder.
    Read(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its side; no further bytes will arrive.
    EndOfStream,
}

/// Inbound buffering for a channel.
///
/// Bytes are read into a fixed scratch area. Only the tail the decoder did
/// not consume is copied into `buffer`, which may be capped with
/// [`set_max_buffered`](Self::set_max_buffered).
pub struct ReadContext {
    buffer: BytesMut,
    scratch: Box<[u8]>,
    read_size: usize,
    max_buffered: Option<usize>,
    decoder: Box<dyn FrameDecoder>,
    end_of_stream: bool,
    backlog: bool,
    total_read: u64,
}

impl ReadContext {
    pub fn new(decoder: Box<dyn FrameDecoder>, read_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scratch: Box::default(),
            read_size: read_size.max(1),
            max_buffered: None,
            decoder,
            end_of_stream: false,
            backlog: false,
            total_read: 0,
        }
    }

    /// Limits the bytes kept for a frame the decoder has not completed yet.
    /// A read that leaves more than `limit` bytes buffered fails with
    /// [`io::ErrorKind::InvalidData`].
    pub fn set_max_buffered(&mut self, limit: Option<usize>) {
        self.max_buffered = limit;
    }

    pub fn max_buffered(&self) -> Option<usize> {
        self.max_buffered
    }

    /// Performs one bounded read from `source` and hands the buffered bytes
    /// to the decoder.
    ///
    /// Never loops until the source is drained. Until a read reports
    /// `WouldBlock` or end of stream the context keeps a backlog, so the
    /// caller can schedule another read without waiting for a new edge.
    pub fn read<R: Read + ?Sized>(
        &mut self,
        channel: ChannelId,
        source: &mut R,
    ) -> io::Result<ReadOutcome> {
        if self.end_of_stream {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read after end of stream",
            ));
        }

        if self.scratch.len() != self.read_size {
            self.scratch = vec![0; self.read_size].into_boxed_slice();
        }

        let result = loop {
            match source.read(&mut self.scratch) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                self.backlog = false;
                if e.kind() == io::ErrorKind::WouldBlock {
                    return Ok(ReadOutcome::WouldBlock);
                }
                return Err(e);
            }
        };

        if n == 0 {
            self.end_of_stream = true;
            self.backlog = false;
            trace!(%channel, "end of stream");
            return Ok(ReadOutcome::EndOfStream);
        }

        self.backlog = true;
        self.total_read += n as u64;

        let chunk = &self.scratch[..n];
        if self.buffer.is_empty() {
            let consumed = drain_frames(self.decoder.as_mut(), channel, chunk)?;
            self.buffer.extend_from_slice(&chunk[consumed..]);
        } else {
            self.buffer.extend_from_slice(chunk);
            let consumed = drain_frames(self.decoder.as_mut(), channel, &self.buffer)?;
            self.buffer.advance(consumed);
        }
        trace!(%channel, bytes = n, buffered = self.buffer.len(), "read");

        match self.max_buffered {
            Some(limit) if self.buffer.len() > limit => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} bytes buffered without a complete frame, limit is {}",
                    self.buffer.len(),
                    limit
                ),
            )),
            _ => Ok(ReadOutcome::Read(n)),
        }
    }

    /// Whether the source has not been seen drained since the last read.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Bytes read but not yet consumed by the decoder.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    pub(crate) fn release(&mut self) {
        self.buffer = BytesMut::new();
        self.scratch = Box::default();
        self.backlog = false;
    }
}

/// Offers `buf` to `decoder` until it asks for more data. Returns how many
/// bytes were consumed.
fn drain_frames(
    decoder: &mut dyn FrameDecoder,
    channel: ChannelId,
    buf: &[u8],
) -> io::Result<usize> {
    let mut offset = 0;
    while offset < buf.len() {
        let rest = &buf[offset..];
        let consumed = decoder.decode(channel, rest)?;
        if consumed == 0 {
            break;
        }
        if consumed > rest.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "decoder consumed {} bytes but only {} were buffered",
                    consumed,
                    rest.len()
                ),
            ));
        }
        offset += consumed;
    }
    Ok(offset)
}
