//! Channels: one socket plus the state needed to read from and write to it
//! without blocking.
//!
//! ```text
//!  Channel<S>
//!    ├── socket: S                       (None once closed)
//!    ├── registration ──▶ Arc<Registry>  (token + applied interest)
//!    ├── interest: InterestSet
//!    ├── ReadContext       inbound buffer + FrameDecoder
//!    ├── WriteContext      FIFO of WriteOperation
//!    └── ExceptionContext  first error wins
//! ```
//!
//! A channel knows nothing about the selector that drives it. It holds a
//! [`Registration`] handle (its token and a shared registry handle) so that
//! interest changes can be applied as soon as they are made, and it is torn
//! down entirely by [`Channel::close`].

pub mod exception;
pub mod read;
pub mod write;

use std::{
    any::Any,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use bytes::Bytes;
use mio::{event::Source, net::TcpStream, Interest, Registry, Token};
use tracing::trace;

use crate::{
    error::{ChannelError, ListenerError},
    interest::InterestSet,
};
pub use exception::ExceptionContext;
pub use read::{FrameDecoder, ReadContext, ReadOutcome, DEFAULT_READ_BUFFER_SIZE};
pub use write::{WriteContext, WriteListener, WriteOperation};

/// Identity of a channel. Doubles as its registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl ChannelId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ChannelId {
    fn from(token: Token) -> Self {
        ChannelId(token.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A non-blocking stream socket a channel can drive.
pub trait Socket: io::Read + io::Write + Source + Send {
    /// Checks a pending connect. `Ok(true)` once connected, `Ok(false)` while
    /// still in progress.
    fn finish_connect(&mut self) -> io::Result<bool>;

    /// Takes the pending socket error (`SO_ERROR`), if any.
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl Socket for TcpStream {
    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(err) = TcpStream::take_error(self)? {
            return Err(err);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }
}

/// Listener run once when the channel closes, with the error that caused it.
pub type CloseListener =
    Box<dyn FnOnce(ChannelId, Option<&ChannelError>) -> anyhow::Result<()> + Send + 'static>;

/// Handle into the readiness primitive's registration table.
pub struct Registration {
    token: Token,
    registry: Arc<Registry>,
    applied: Option<Interest>,
}

impl Registration {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Interest currently registered with the OS.
    pub fn applied(&self) -> Option<Interest> {
        self.applied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Pending,
    Connected,
}

pub struct Channel<S: Socket> {
    id: ChannelId,
    socket: Option<S>,
    registration: Option<Registration>,
    interest: InterestSet,
    connect: ConnectState,
    read: ReadContext,
    write: WriteContext,
    exception: ExceptionContext,
    close_listeners: Vec<CloseListener>,
    listener_faults: Vec<ListenerError>,
}

impl<S: Socket> Channel<S> {
    /// Wraps an already connected socket, typically one just accepted.
    pub fn new(id: ChannelId, socket: S, decoder: Box<dyn FrameDecoder>, read_size: usize) -> Self {
        Self {
            id,
            socket: Some(socket),
            registration: None,
            interest: InterestSet::EMPTY,
            connect: ConnectState::Connected,
            read: ReadContext::new(decoder, read_size),
            write: WriteContext::new(),
            exception: ExceptionContext::new(),
            close_listeners: Vec::new(),
            listener_faults: Vec::new(),
        }
    }

    /// Wraps a socket whose outbound connect is still in progress.
    pub fn connecting(
        id: ChannelId,
        socket: S,
        decoder: Box<dyn FrameDecoder>,
        read_size: usize,
    ) -> Self {
        let mut channel = Self::new(id, socket, decoder, read_size);
        channel.connect = ConnectState::Pending;
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connect == ConnectState::Connected
    }

    pub fn interest(&self) -> InterestSet {
        self.interest
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn socket_mut(&mut self) -> Option<&mut S> {
        self.socket.as_mut()
    }

    /// See [`ReadContext::set_max_buffered`].
    pub fn set_max_buffered(&mut self, limit: Option<usize>) {
        self.read.set_max_buffered(limit);
    }

    pub fn read_context(&self) -> &ReadContext {
        &self.read
    }

    pub fn write_context(&self) -> &WriteContext {
        &self.write
    }

    pub fn exception_context(&self) -> &ExceptionContext {
        &self.exception
    }

    /// Admits the channel to the readiness primitive.
    ///
    /// The socket is registered with whatever interest is armed at this
    /// point, or plain readability if nothing is. The event handler then
    /// arms the real set from `on_registered`.
    pub fn register(&mut self, registry: Arc<Registry>) -> io::Result<()> {
        let socket = self.socket.as_mut().ok_or_else(closed_error)?;
        let token = self.id.token();
        let interest = self.interest.to_mio().unwrap_or(Interest::READABLE);
        socket.register(&registry, token, interest)?;
        self.registration = Some(Registration {
            token,
            registry,
            applied: Some(interest),
        });
        trace!(channel = %self.id, ?interest, "registered");
        Ok(())
    }

    /// Replaces the interest set and applies it to the registration.
    pub fn set_interest(&mut self, interest: InterestSet) -> io::Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.interest = interest;
        self.apply_interest()
    }

    pub fn add_interest(&mut self, interest: InterestSet) -> io::Result<()> {
        self.set_interest(self.interest.add(interest))
    }

    pub fn remove_interest(&mut self, interest: InterestSet) -> io::Result<()> {
        self.set_interest(self.interest.remove(interest))
    }

    fn apply_interest(&mut self) -> io::Result<()> {
        let (Some(socket), Some(registration)) = (self.socket.as_mut(), self.registration.as_mut())
        else {
            return Ok(());
        };
        let wanted = self.interest.to_mio();
        if wanted == registration.applied {
            return Ok(());
        }
        match (registration.applied, wanted) {
            (Some(_), Some(interest)) => {
                socket.reregister(&registration.registry, registration.token, interest)?
            }
            (None, Some(interest)) => {
                socket.register(&registration.registry, registration.token, interest)?
            }
            (Some(_), None) => socket.deregister(&registration.registry)?,
            (None, None) => {}
        }
        trace!(channel = %self.id, interest = ?self.interest, "interest changed");
        registration.applied = wanted;
        Ok(())
    }

    /// Completes a pending connect if the socket reports it done.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        let socket = self.socket.as_mut().ok_or_else(closed_error)?;
        if socket.finish_connect()? {
            self.connect = ConnectState::Connected;
            return Ok(true);
        }
        Ok(false)
    }

    /// One bounded read through the read context.
    pub fn read(&mut self) -> io::Result<ReadOutcome> {
        let socket = self.socket.as_mut().ok_or_else(closed_error)?;
        self.read.read(self.id, socket)
    }

    pub fn has_read_backlog(&self) -> bool {
        self.is_open() && self.read.has_backlog()
    }

    /// Flushes queued writes. Returns whether writes are still pending.
    pub fn flush(&mut self) -> io::Result<bool> {
        let socket = self.socket.as_mut().ok_or_else(closed_error)?;
        self.write.flush(self.id, socket, &mut self.listener_faults)
    }

    /// Queues `payload`; `listener` is completed once it is fully sent or
    /// the channel fails.
    pub fn write<F>(&mut self, payload: impl Into<Bytes>, listener: F)
    where
        F: FnOnce(Result<(), ChannelError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.submit(WriteOperation::new(payload, listener));
    }

    /// Queues an operation and arms write interest if the queue was empty.
    /// Writing to a closed channel fails the operation right away.
    pub fn submit(&mut self, op: WriteOperation) {
        if !self.is_open() {
            let error = self
                .exception
                .error()
                .cloned()
                .unwrap_or(ChannelError::Closed);
            op.complete(self.id, Err(error), &mut self.listener_faults);
            return;
        }
        if self.write.submit(op) {
            if let Err(e) = self.add_interest(InterestSet::WRITE) {
                self.fail(ChannelError::write(e));
            }
        }
    }

    /// Records `error` with the exception context and closes the channel if
    /// it is the first one. Returns whether this call closed the channel.
    pub fn fail(&mut self, error: ChannelError) -> bool {
        if self.exception.accept(self.id, error) {
            let was_open = self.is_open();
            self.close();
            return was_open;
        }
        false
    }

    /// Takes the error pending on the socket, if any.
    pub fn take_socket_error(&self) -> Option<io::Error> {
        let socket = self.socket.as_ref()?;
        match socket.take_error() {
            Ok(err) => err,
            Err(e) => Some(e),
        }
    }

    pub fn add_close_listener<F>(&mut self, listener: F)
    where
        F: FnOnce(ChannelId, Option<&ChannelError>) -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_open() {
            self.close_listeners.push(Box::new(listener));
            return;
        }
        let error = self.exception.error();
        let id = self.id;
        if let Err(fault) = notify_listener(id, "close", move || listener(id, error)) {
            self.listener_faults.push(fault);
        }
    }

    /// Closes the channel: deregisters it, drops the socket, fails pending
    /// writes and runs close listeners. Closing twice is a no-op.
    pub fn close(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        if let Some(registration) = self.registration.take() {
            if registration.applied.is_some() {
                if let Err(e) = socket.deregister(&registration.registry) {
                    trace!(channel = %self.id, error = %e, "deregister on close failed");
                }
            }
        }
        drop(socket);
        self.interest = InterestSet::EMPTY;

        let error = self
            .exception
            .error()
            .cloned()
            .unwrap_or(ChannelError::Closed);
        self.write
            .fail_all(self.id, &error, &mut self.listener_faults);
        self.read.release();

        let id = self.id;
        for listener in std::mem::take(&mut self.close_listeners) {
            let cause = self.exception.error();
            if let Err(fault) = notify_listener(id, "close", move || listener(id, cause)) {
                self.listener_faults.push(fault);
            }
        }
        trace!(channel = %id, "closed");
    }

    /// Drains the listener failures collected since the last call.
    pub fn take_listener_faults(&mut self) -> Vec<ListenerError> {
        std::mem::take(&mut self.listener_faults)
    }
}

impl<S: Socket> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("connected", &self.is_connected())
            .field("interest", &self.interest)
            .field("queued_writes", &self.write.queued_ops())
            .finish()
    }
}

impl<S: Socket> Drop for Channel<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is closed")
}

/// Runs an application listener, turning both a returned error and a panic
/// into a [`ListenerError`].
pub(crate) fn notify_listener<F>(
    channel: ChannelId,
    listener: &'static str,
    f: F,
) -> Result<(), ListenerError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ListenerError::new(channel, listener, format!("{e:#}"))),
        Err(payload) => Err(ListenerError::new(
            channel,
            listener,
            format!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
