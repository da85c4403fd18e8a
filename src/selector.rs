//! The selector loop: one `mio::Poll`, the channels registered with it and
//! the queue other threads use to reach them.
//!
//! ```text
//!   other threads                      selector thread
//!  ┌──────────────┐   Command    ┌──────────────────────────────┐
//!  │SelectorHandle│──────────────▶ drain_commands()             │
//!  │ (Sender +    │   wake()     │ poll(events, timeout)        │
//!  │  Waker)      │──────────────▶ for each ready channel:      │
//!  └──────────────┘              │   dispatch_ready(handler, ..)│
//!                                │   settle(): drop closed,     │
//!                                │   remember read backlog      │
//!                                └──────────────────────────────┘
//! ```
//!
//! Only the selector thread touches the registration table and the channels
//! in it. Everything else goes through [`Command`]s.

#[cfg(feature = "unstable-mpmc")]
use std::sync::mpmc as queue;
#[cfg(not(feature = "unstable-mpmc"))]
use std::sync::mpsc as queue;
use std::{
    collections::HashMap,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use mio::{net::TcpStream, Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{
        notify_listener, panic_message, Channel, ChannelId, CloseListener, Socket,
        WriteOperation,
    },
    config::ReactorConfig,
    error::{ChannelError, ListenerError, Result},
    event::{Readiness, ReadinessEvent, SocketReady},
    handler::{EventHandler, SocketEventHandler},
};

/// Token reserved for the waker. Channel ids start at 1.
pub const WAKE_TOKEN: Token = Token(0);

/// Requests handed to a selector from outside its thread.
pub enum Command<S: Socket> {
    /// Transfers ownership of a channel to the selector.
    Register(Channel<S>),
    Write { id: ChannelId, op: WriteOperation },
    OnClose(PendingClose),
    Close { id: ChannelId },
    Shutdown,
}

impl<S: Socket> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register(channel) => write!(f, "Register({})", channel.id()),
            Command::Write { id, op } => write!(f, "Write({id}, {} bytes)", op.remaining()),
            Command::OnClose(pending) => write!(f, "OnClose({})", pending.id),
            Command::Close { id } => write!(f, "Close({id})"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A close listener on its way to the selector.
///
/// If the selector never hands it to the channel, because the channel is
/// already gone or the selector stopped, the listener runs when this is
/// dropped, with no cause.
pub struct PendingClose {
    id: ChannelId,
    listener: Option<CloseListener>,
}

impl PendingClose {
    pub fn new(id: ChannelId, listener: CloseListener) -> Self {
        Self {
            id,
            listener: Some(listener),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn take(mut self) -> Option<CloseListener> {
        self.listener.take()
    }

    /// Runs the listener for a channel that is no longer around.
    fn run(mut self) -> std::result::Result<(), ListenerError> {
        let id = self.id;
        match self.listener.take() {
            Some(listener) => notify_listener(id, "close", move || listener(id, None)),
            None => Ok(()),
        }
    }
}

impl Drop for PendingClose {
    fn drop(&mut self) {
        let id = self.id;
        if let Some(listener) = self.listener.take() {
            if let Err(fault) = notify_listener(id, "close", move || listener(id, None)) {
                report_orphan_faults(vec![fault]);
            }
        }
    }
}

/// Thread-safe handle to a running selector.
pub struct SelectorHandle<S: Socket = TcpStream> {
    index: usize,
    sender: queue::Sender<Command<S>>,
    waker: Arc<Waker>,
}

impl<S: Socket> Clone for SelectorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<S: Socket> fmt::Debug for SelectorHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorHandle")
            .field("index", &self.index)
            .finish()
    }
}

impl<S: Socket> SelectorHandle<S> {
    pub fn index(&self) -> usize {
        self.index
    }

    fn send(&self, command: Command<S>) -> std::result::Result<(), Command<S>> {
        self.sender.send(command).map_err(|e| e.0)?;
        if let Err(e) = self.waker.wake() {
            error!(selector = self.index, error = %e, "failed to wake selector");
        }
        Ok(())
    }

    fn gone(&self) -> anyhow::Error {
        anyhow!("selector {} has shut down", self.index)
    }

    /// Hands `channel` over to the selector thread.
    pub fn register(&self, channel: Channel<S>) -> Result<()> {
        self.send(Command::Register(channel))
            .map_err(|_| self.gone())
    }

    /// Queues `op` on channel `id`. If the selector is gone the operation is
    /// failed with [`ChannelError::Closed`] on the calling thread.
    pub fn write(&self, id: ChannelId, op: WriteOperation) -> Result<()> {
        match self.send(Command::Write { id, op }) {
            Ok(()) => Ok(()),
            Err(Command::Write { op, .. }) => {
                let mut faults = Vec::new();
                op.complete(id, Err(ChannelError::Closed), &mut faults);
                report_orphan_faults(faults);
                Err(self.gone())
            }
            Err(_) => Err(self.gone()),
        }
    }

    /// Adds a close listener to channel `id`. If the selector is gone the
    /// listener runs on the calling thread.
    pub fn on_close(&self, id: ChannelId, listener: CloseListener) -> Result<()> {
        self.send(Command::OnClose(PendingClose::new(id, listener)))
            .map_err(|_| self.gone())
    }

    pub fn close(&self, id: ChannelId) -> Result<()> {
        self.send(Command::Close { id }).map_err(|_| self.gone())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).map_err(|_| self.gone())
    }
}

fn report_orphan_faults(faults: Vec<ListenerError>) {
    for fault in faults {
        warn!(
            channel = %fault.channel,
            listener = fault.listener,
            error = %fault.message,
            "exception while executing listener"
        );
    }
}

/// Runs one readiness notification through `handler`, in order: connect
/// completion, socket error, read, write.
pub fn dispatch_ready<S, H>(handler: &H, channel: &mut Channel<S>, ready: SocketReady)
where
    S: Socket,
    H: EventHandler<S> + ?Sized,
{
    if channel.interest().is_connect() && ready.may_complete_connect() {
        handler.handle_event(channel, Readiness::Connectable);
    }

    if ready.is_error() && channel.is_open() {
        if let Some(error) = channel.take_socket_error() {
            handler.handle_event(channel, Readiness::Fault(error));
        }
    }

    if !channel.is_open() || !channel.is_connected() {
        return;
    }

    if ready.is_readable() && channel.interest().is_read() {
        handler.handle_event(channel, Readiness::Readable);
    }

    if ready.is_writable() && channel.interest().is_write() {
        handler.handle_event(channel, Readiness::Writable);
    }
}

/// Single-threaded dispatcher over one readiness primitive.
pub struct SocketSelector<S: Socket = TcpStream, H: EventHandler<S> = SocketEventHandler> {
    index: usize,
    poll: Poll,
    events: Events,
    registry: Arc<Registry>,
    channels: HashMap<ChannelId, Channel<S>>,
    backlog: Vec<ChannelId>,
    handler: H,
    receiver: queue::Receiver<Command<S>>,
    handle: SelectorHandle<S>,
    poll_timeout: Duration,
}

impl<S: Socket, H: EventHandler<S>> SocketSelector<S, H> {
    pub fn new(index: usize, config: &ReactorConfig, handler: H) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = queue::channel();

        Ok(Self {
            index,
            events: Events::with_capacity(config.events_capacity),
            poll,
            registry,
            channels: HashMap::new(),
            backlog: Vec::new(),
            handler,
            receiver,
            handle: SelectorHandle {
                index,
                sender,
                waker,
            },
            poll_timeout: config.poll_timeout,
        })
    }

    pub fn handle(&self) -> SelectorHandle<S> {
        self.handle.clone()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of open channels registered with this selector.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel<S>> {
        self.channels.get(&id)
    }

    /// Runs the loop until a [`Command::Shutdown`] arrives or polling fails,
    /// then closes every channel still registered and settles the commands
    /// that arrived too late.
    pub fn run(&mut self) -> Result<()> {
        info!(selector = self.index, "selector started");
        let result = loop {
            match self.turn() {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => {
                    error!(selector = self.index, error = %e, "selector loop failed");
                    break Err(e);
                }
            }
        };
        self.close_all();
        self.drain_late_commands();
        info!(selector = self.index, "selector stopped");
        result
    }

    /// One iteration: drain commands, poll, dispatch. Returns `false` once
    /// shutdown was requested.
    pub fn turn(&mut self) -> Result<bool> {
        if !self.drain_commands() {
            return Ok(false);
        }

        let timeout = if self.backlog.is_empty() {
            self.poll_timeout
        } else {
            Duration::ZERO
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let mut ready: Vec<SocketReady> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(SocketReady::from)
            .collect();

        for id in self.backlog.drain(..) {
            let synthetic = SocketReady::readable(id.token());
            match ready.iter_mut().find(|r| r.token() == id.token()) {
                Some(existing) => existing.merge(synthetic),
                None => ready.push(synthetic),
            }
        }

        for event in ready {
            self.dispatch(event);
        }
        Ok(true)
    }

    /// Dispatches one readiness notification, isolating panics raised by the
    /// handler as generic faults of that channel.
    pub fn dispatch(&mut self, ready: SocketReady) {
        let id = ChannelId::from(ready.token());
        self.guarded(id, |handler, channel| dispatch_ready(handler, channel, ready));
    }

    /// Hands an already classified event to the handler of its channel.
    pub fn deliver(&mut self, event: ReadinessEvent) {
        let ReadinessEvent { channel, readiness } = event;
        self.guarded(channel, |handler, channel| {
            handler.handle_event(channel, readiness)
        });
    }

    fn guarded<F>(&mut self, id: ChannelId, f: F)
    where
        F: FnOnce(&H, &mut Channel<S>),
    {
        let Some(channel) = self.channels.get_mut(&id) else {
            trace!(selector = self.index, channel = %id, "event for unknown channel");
            return;
        };
        let handler = &self.handler;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(handler, channel)));
        if let Err(payload) = outcome {
            let error = io::Error::other(format!(
                "event handler panicked: {}",
                panic_message(payload.as_ref())
            ));
            handler.handle_event(channel, Readiness::Fault(error));
        }
        self.settle(id);
    }

    fn settle(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        if !channel.is_open() {
            if let Some(channel) = self.channels.remove(&id) {
                debug!(
                    selector = self.index,
                    channel = %id,
                    error = ?channel.exception_context().error(),
                    "channel removed"
                );
            }
        } else if channel.has_read_backlog()
            && channel.interest().is_read()
            && !self.backlog.contains(&id)
        {
            self.backlog.push(id);
        }
    }

    fn drain_commands(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(Command::Register(channel)) => self.admit(channel),
                Ok(Command::Write { id, op }) => self.write(id, op),
                Ok(Command::OnClose(pending)) => self.on_close(pending),
                Ok(Command::Close { id }) => self.close(id),
                Ok(Command::Shutdown) => return false,
                Err(queue::TryRecvError::Empty) | Err(queue::TryRecvError::Disconnected) => {
                    return true
                }
            }
        }
    }

    /// Takes ownership of `channel` and registers it with the poll.
    pub fn admit(&mut self, mut channel: Channel<S>) {
        let id = channel.id();
        if id.token() == WAKE_TOKEN || self.channels.contains_key(&id) {
            let error = io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("channel id {id} is already in use"),
            );
            self.handler
                .handle_event(&mut channel, Readiness::RegistrationFailed(error));
            return;
        }

        let handler = &self.handler;
        let registry = self.registry.clone();
        let admitted =
            panic::catch_unwind(AssertUnwindSafe(|| handler.admit(&mut channel, registry)));
        match admitted {
            Ok(true) => {
                trace!(selector = self.index, channel = %id, "channel admitted");
                self.channels.insert(id, channel);
            }
            Ok(false) => {
                debug!(selector = self.index, channel = %id, "channel rejected");
            }
            Err(payload) => {
                let error = io::Error::other(format!(
                    "event handler panicked: {}",
                    panic_message(payload.as_ref())
                ));
                handler.handle_event(&mut channel, Readiness::RegistrationFailed(error));
            }
        }
    }

    fn write(&mut self, id: ChannelId, op: WriteOperation) {
        match self.channels.get_mut(&id) {
            Some(channel) => {
                channel.submit(op);
                self.handler.drain_listener_faults(channel);
                self.settle(id);
            }
            None => {
                let mut faults = Vec::new();
                op.complete(id, Err(ChannelError::Closed), &mut faults);
                for fault in faults {
                    self.handler.on_listener_fault(fault);
                }
            }
        }
    }

    fn on_close(&mut self, pending: PendingClose) {
        match self.channels.get_mut(&pending.id()) {
            Some(channel) => {
                if let Some(listener) = pending.take() {
                    channel.add_close_listener(listener);
                }
                self.handler.drain_listener_faults(channel);
            }
            None => {
                if let Err(fault) = pending.run() {
                    self.handler.on_listener_fault(fault);
                }
            }
        }
    }

    /// Closes channel `id` from the selector thread.
    pub fn close(&mut self, id: ChannelId) {
        if let Some(mut channel) = self.channels.remove(&id) {
            channel.close();
            self.handler.drain_listener_faults(&mut channel);
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
        self.backlog.clear();
    }

    /// Settles commands queued behind a shutdown: channels are closed,
    /// writes fail with [`ChannelError::Closed`] and close listeners run.
    fn drain_late_commands(&mut self) {
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Register(mut channel) => {
                    channel.close();
                    self.handler.drain_listener_faults(&mut channel);
                }
                Command::Write { id, op } => {
                    let mut faults = Vec::new();
                    op.complete(id, Err(ChannelError::Closed), &mut faults);
                    for fault in faults {
                        self.handler.on_listener_fault(fault);
                    }
                }
                Command::OnClose(pending) => {
                    if let Err(fault) = pending.run() {
                        self.handler.on_listener_fault(fault);
                    }
                }
                Command::Close { .. } | Command::Shutdown => {}
            }
        }
    }
}

impl<S: Socket, H: EventHandler<S>> Drop for SocketSelector<S, H> {
    fn drop(&mut self) {
        self.close_all();
        self.drain_late_commands();
    }
}
