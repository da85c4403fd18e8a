use std::{
    collections::VecDeque,
    fmt,
    io::{self, Write},
    panic::{self, AssertUnwindSafe},
};

use bytes::{Buf, Bytes};
use tracing::{trace, warn};

use super::{notify_listener, panic_message, ChannelId};
use crate::error::{ChannelError, ListenerError};

/// Completion callback of a write operation.
///
/// Receives `Ok(())` once the whole payload has been handed to the socket, or
/// the error that made the write impossible. An `Err` returned by the
/// listener is reported as a listener fault and never affects the channel.
pub type WriteListener =
    Box<dyn FnOnce(Result<(), ChannelError>) -> anyhow::Result<()> + Send + 'static>;

/// An outbound payload and the listener to complete once it is sent.
///
/// An operation dropped before completing, for instance one still queued for
/// a selector that has stopped, completes with [`ChannelError::Closed`].
pub struct WriteOperation {
    payload: Bytes,
    listener: Option<WriteListener>,
}

impl WriteOperation {
    pub fn new<F>(payload: impl Into<Bytes>, listener: F) -> Self
    where
        F: FnOnce(Result<(), ChannelError>) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            payload: payload.into(),
            listener: Some(Box::new(listener)),
        }
    }

    /// A write nobody waits on.
    pub fn detached(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            listener: None,
        }
    }

    /// Bytes of the payload not yet written.
    pub fn remaining(&self) -> usize {
        self.payload.len()
    }

    pub(crate) fn complete(
        mut self,
        channel: ChannelId,
        result: Result<(), ChannelError>,
        faults: &mut Vec<ListenerError>,
    ) {
        if let Some(listener) = self.listener.take() {
            if let Err(fault) = notify_listener(channel, "write", move || listener(result)) {
                faults.push(fault);
            }
        }
    }
}

impl Drop for WriteOperation {
    fn drop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(move || listener(Err(ChannelError::Closed)))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "exception while executing listener"),
            Err(payload) => warn!(
                error = %panic_message(payload.as_ref()),
                "exception while executing listener"
            ),
        }
    }
}

impl fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOperation")
            .field("remaining", &self.payload.len())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Per-channel FIFO of pending writes.
#[derive(Debug, Default)]
pub struct WriteContext {
    queue: VecDeque<WriteOperation>,
    queued_bytes: usize,
}

impl WriteContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `op` to the queue. Returns `true` if the queue was empty
    /// before, meaning write interest must now be armed.
    pub fn submit(&mut self, op: WriteOperation) -> bool {
        let was_empty = self.queue.is_empty();
        self.queued_bytes += op.remaining();
        self.queue.push_back(op);
        was_empty
    }

    /// Writes queued payloads in order until the queue drains or `sink`
    /// stops accepting bytes.
    ///
    /// A listener completes only after its whole payload went out. Returns
    /// whether operations are still pending. On error the operation being
    /// written stays at the head of the queue so that tearing the channel
    /// down fails it along with the rest.
    pub fn flush<W: Write + ?Sized>(
        &mut self,
        channel: ChannelId,
        sink: &mut W,
        faults: &mut Vec<ListenerError>,
    ) -> io::Result<bool> {
        let mut flushed = 0usize;

        while let Some(op) = self.queue.front_mut() {
            if !op.payload.is_empty() {
                match sink.write(&op.payload) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket accepted zero bytes",
                        ));
                    }
                    Ok(n) => {
                        op.payload.advance(n);
                        self.queued_bytes -= n;
                        flushed += n;
                        if !op.payload.is_empty() {
                            continue;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }

            if let Some(done) = self.queue.pop_front() {
                done.complete(channel, Ok(()), faults);
            }
        }

        trace!(
            %channel,
            flushed,
            pending_ops = self.queue.len(),
            pending_bytes = self.queued_bytes,
            "flush"
        );
        Ok(self.has_queued_ops())
    }

    /// Completes every queued operation with `error`, oldest first.
    pub fn fail_all(
        &mut self,
        channel: ChannelId,
        error: &ChannelError,
        faults: &mut Vec<ListenerError>,
    ) {
        self.queued_bytes = 0;
        for op in self.queue.drain(..) {
            op.complete(channel, Err(error.clone()), faults);
        }
    }

    pub fn has_queued_ops(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queued_ops(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}
