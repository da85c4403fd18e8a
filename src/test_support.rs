//! In-memory sockets and helpers for unit tests.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
};

use mio::{event::Source, Interest, Poll, Registry, Token};

use crate::channel::{ChannelId, FrameDecoder, Socket};

/// Scriptable socket: inbound chunks, a per-flush write budget and canned
/// connect/registration failures. Registering it with a real registry is a
/// no-op apart from bookkeeping.
#[derive(Default)]
pub(crate) struct MockSocket {
    inbound: VecDeque<Vec<u8>>,
    eof: bool,
    read_error: Option<io::ErrorKind>,
    written: Vec<u8>,
    write_budget: Option<usize>,
    write_error: Option<io::ErrorKind>,
    connect_polls: usize,
    connect_error: Option<io::ErrorKind>,
    socket_error: Option<io::ErrorKind>,
    register_error: Option<io::ErrorKind>,
    last_interest: Option<Interest>,
    reregistrations: usize,
}

impl MockSocket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_inbound(mut self, chunk: &[u8]) -> Self {
        self.push_inbound(chunk);
        self
    }

    pub(crate) fn push_inbound(&mut self, chunk: &[u8]) {
        self.inbound.push_back(chunk.to_vec());
    }

    pub(crate) fn with_eof(mut self) -> Self {
        self.eof = true;
        self
    }

    pub(crate) fn with_read_error(mut self, kind: io::ErrorKind) -> Self {
        self.read_error = Some(kind);
        self
    }

    pub(crate) fn with_write_budget(mut self, budget: usize) -> Self {
        self.write_budget = Some(budget);
        self
    }

    pub(crate) fn refill_write_budget(&mut self, budget: usize) {
        self.write_budget = Some(budget);
    }

    pub(crate) fn with_write_error(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    /// `finish_connect` reports "in progress" `polls` times before succeeding.
    pub(crate) fn with_pending_connect(mut self, polls: usize) -> Self {
        self.connect_polls = polls;
        self
    }

    pub(crate) fn with_connect_error(mut self, kind: io::ErrorKind) -> Self {
        self.connect_error = Some(kind);
        self
    }

    pub(crate) fn with_socket_error(mut self, kind: io::ErrorKind) -> Self {
        self.socket_error = Some(kind);
        self
    }

    pub(crate) fn with_register_error(mut self, kind: io::ErrorKind) -> Self {
        self.register_error = Some(kind);
        self
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    pub(crate) fn last_interest(&self) -> Option<Interest> {
        self.last_interest
    }

    pub(crate) fn reregistrations(&self) -> usize {
        self.reregistrations
    }
}

impl Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(kind) = self.read_error {
            return Err(io::Error::new(kind, "scripted read error"));
        }
        let Some(chunk) = self.inbound.front_mut() else {
            if self.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.inbound.pop_front();
        }
        Ok(n)
    }
}

impl Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.write_error {
            return Err(io::Error::new(kind, "scripted write error"));
        }
        let n = match self.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = self.write_budget.as_mut() {
            *budget -= n;
        }
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for MockSocket {
    fn register(
        &mut self,
        _registry: &Registry,
        _token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        if let Some(kind) = self.register_error {
            return Err(io::Error::new(kind, "scripted registration error"));
        }
        self.last_interest = Some(interests);
        Ok(())
    }

    fn reregister(
        &mut self,
        _registry: &Registry,
        _token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.last_interest = Some(interests);
        self.reregistrations += 1;
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        self.last_interest = None;
        Ok(())
    }
}

impl Socket for MockSocket {
    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(kind) = self.connect_error {
            return Err(io::Error::new(kind, "scripted connect error"));
        }
        if self.connect_polls > 0 {
            self.connect_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(self
            .socket_error
            .map(|kind| io::Error::new(kind, "scripted socket error")))
    }
}

/// Keeps a poll instance alive and hands out registry handles to channels.
pub(crate) struct TestRegistry {
    _poll: Poll,
    registry: Arc<Registry>,
}

impl TestRegistry {
    pub(crate) fn new() -> Self {
        let poll = Poll::new().expect("create poll");
        let registry = Arc::new(poll.registry().try_clone().expect("clone registry"));
        Self {
            _poll: poll,
            registry,
        }
    }

    pub(crate) fn handle(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

/// Decoder that swallows everything.
pub(crate) fn discard() -> Box<dyn FrameDecoder> {
    Box::new(|_: ChannelId, buf: &[u8]| -> io::Result<usize> { Ok(buf.len()) })
}
