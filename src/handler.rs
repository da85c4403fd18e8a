//! Event handlers turn readiness notifications into channel operations.
//!
//! [`EventHandler`] is the dispatch contract: one callback per event kind and
//! a provided [`EventHandler::handle_event`] that matches on [`Readiness`]
//! and routes every failure to the matching `*_failed` callback, so nothing
//! escapes into the selector loop. [`SocketEventHandler`] is the handler used
//! for client and peer connections.
//!
//! ```text
//!  Readiness::Connectable ─▶ finish_connect ─▶ on_connected | on_connect_failed
//!  Readiness::Readable    ─▶ on_readable    ─▶ (err) on_read_failed
//!  Readiness::Writable    ─▶ on_writable    ─▶ (err) on_write_failed
//!  Readiness::RegistrationFailed ─▶ on_registration_failed
//!  Readiness::Fault       ─▶ on_generic_fault
//!                                   │
//!                                   ▼
//!                  ExceptionContext (first error wins, close once)
//! ```

use std::{io, sync::Arc};

use mio::Registry;
use tracing::{debug, trace, warn};

use crate::{
    channel::{Channel, ChannelId, ReadOutcome, Socket},
    error::{ChannelError, ListenerError},
    event::Readiness,
    interest::InterestSet,
};

pub trait EventHandler<S: Socket> {
    /// Called once right after the channel was admitted to the readiness
    /// primitive.
    fn on_registered(&self, channel: &mut Channel<S>) -> io::Result<()>;

    fn on_registration_failed(&self, channel: &mut Channel<S>, error: io::Error);

    /// Called once when a pending connect completes.
    fn on_connected(&self, channel: &mut Channel<S>) -> io::Result<()>;

    fn on_connect_failed(&self, channel: &mut Channel<S>, error: io::Error);

    fn on_readable(&self, channel: &mut Channel<S>) -> io::Result<()>;

    fn on_read_failed(&self, channel: &mut Channel<S>, error: io::Error);

    fn on_writable(&self, channel: &mut Channel<S>) -> io::Result<()>;

    fn on_write_failed(&self, channel: &mut Channel<S>, error: io::Error);

    /// Handling an event failed for a reason not tied to connect, read or
    /// write.
    fn on_generic_fault(&self, channel: &mut Channel<S>, error: io::Error) {
        log_generic_fault(channel.id(), &error);
    }

    /// An application listener failed. The channel is left alone.
    fn on_listener_fault(&self, fault: ListenerError) {
        warn!(
            channel = %fault.channel,
            listener = fault.listener,
            error = %fault.message,
            "exception while executing listener"
        );
    }

    /// Admits `channel` to `registry` and runs `on_registered`. Any failure
    /// is dispatched as [`Readiness::RegistrationFailed`]. Returns whether
    /// the channel is still open afterwards.
    fn admit(&self, channel: &mut Channel<S>, registry: Arc<Registry>) -> bool {
        let admitted = channel
            .register(registry)
            .and_then(|()| self.on_registered(channel));
        match admitted {
            Ok(()) => self.drain_listener_faults(channel),
            Err(e) => self.handle_event(channel, Readiness::RegistrationFailed(e)),
        }
        channel.is_open()
    }

    /// Dispatches one readiness notification for `channel`.
    ///
    /// I/O readiness for a closed channel is dropped. Faults are still
    /// routed so the exception context can absorb them.
    fn handle_event(&self, channel: &mut Channel<S>, readiness: Readiness) {
        let io_event = matches!(
            readiness,
            Readiness::Connectable | Readiness::Readable | Readiness::Writable
        );
        if io_event && !channel.is_open() {
            trace!(channel = %channel.id(), ?readiness, "dropping event for closed channel");
            return;
        }

        match readiness {
            Readiness::Connectable => match channel.finish_connect() {
                Ok(true) => {
                    if let Err(e) = self.on_connected(channel) {
                        self.on_connect_failed(channel, e);
                    }
                }
                Ok(false) => {}
                Err(e) => self.on_connect_failed(channel, e),
            },
            Readiness::Readable => {
                if let Err(e) = self.on_readable(channel) {
                    self.on_read_failed(channel, e);
                }
            }
            Readiness::Writable => {
                if let Err(e) = self.on_writable(channel) {
                    self.on_write_failed(channel, e);
                }
            }
            Readiness::RegistrationFailed(e) => self.on_registration_failed(channel, e),
            Readiness::Fault(e) => self.on_generic_fault(channel, e),
        }

        self.drain_listener_faults(channel);
    }

    fn drain_listener_faults(&self, channel: &mut Channel<S>) {
        for fault in channel.take_listener_faults() {
            self.on_listener_fault(fault);
        }
    }
}

fn log_generic_fault(channel: ChannelId, error: &io::Error) {
    debug!(%channel, %error, "exception while handling event for channel");
}

/// Handler for non-server sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketEventHandler;

impl SocketEventHandler {
    pub fn new() -> Self {
        Self
    }
}

impl<S: Socket> EventHandler<S> for SocketEventHandler {
    fn on_registered(&self, channel: &mut Channel<S>) -> io::Result<()> {
        channel.add_interest(InterestSet::connect_and_read())
    }

    fn on_registration_failed(&self, channel: &mut Channel<S>, error: io::Error) {
        debug!(channel = %channel.id(), %error, "failed to register socket channel");
        channel.fail(ChannelError::registration(error));
    }

    fn on_connected(&self, channel: &mut Channel<S>) -> io::Result<()> {
        trace!(channel = %channel.id(), "connected");
        channel.remove_interest(InterestSet::CONNECT)
    }

    fn on_connect_failed(&self, channel: &mut Channel<S>, error: io::Error) {
        debug!(channel = %channel.id(), %error, "failed to connect to socket channel");
        channel.fail(ChannelError::connect(error));
    }

    fn on_readable(&self, channel: &mut Channel<S>) -> io::Result<()> {
        if channel.read()? == ReadOutcome::EndOfStream {
            trace!(channel = %channel.id(), "peer closed the stream");
            channel.close();
        }
        Ok(())
    }

    fn on_read_failed(&self, channel: &mut Channel<S>, error: io::Error) {
        debug!(channel = %channel.id(), %error, "exception while reading from socket channel");
        channel.fail(ChannelError::read(error));
    }

    fn on_writable(&self, channel: &mut Channel<S>) -> io::Result<()> {
        if channel.flush()? {
            channel.add_interest(InterestSet::WRITE)
        } else {
            channel.remove_interest(InterestSet::WRITE)
        }
    }

    fn on_write_failed(&self, channel: &mut Channel<S>, error: io::Error) {
        debug!(channel = %channel.id(), %error, "exception while writing to socket channel");
        channel.fail(ChannelError::write(error));
    }

    fn on_generic_fault(&self, channel: &mut Channel<S>, error: io::Error) {
        log_generic_fault(channel.id(), &error);
        channel.fail(ChannelError::fault(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelErrorKind;
    use crate::test_support::{discard, MockSocket, TestRegistry};
    use mio::Interest;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    /// Delegates to [`SocketEventHandler`] and records which callbacks ran.
    #[derive(Default)]
    struct Recorder {
        inner: SocketEventHandler,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn record(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EventHandler<MockSocket> for Recorder {
        fn on_registered(&self, channel: &mut Channel<MockSocket>) -> io::Result<()> {
            self.record("registered");
            self.inner.on_registered(channel)
        }

        fn on_registration_failed(&self, channel: &mut Channel<MockSocket>, error: io::Error) {
            self.record("registration_failed");
            self.inner.on_registration_failed(channel, error)
        }

        fn on_connected(&self, channel: &mut Channel<MockSocket>) -> io::Result<()> {
            self.record("connected");
            self.inner.on_connected(channel)
        }

        fn on_connect_failed(&self, channel: &mut Channel<MockSocket>, error: io::Error) {
            self.record("connect_failed");
            self.inner.on_connect_failed(channel, error)
        }

        fn on_readable(&self, channel: &mut Channel<MockSocket>) -> io::Result<()> {
            self.record("readable");
            self.inner.on_readable(channel)
        }

        fn on_read_failed(&self, channel: &mut Channel<MockSocket>, error: io::Error) {
            self.record("read_failed");
            self.inner.on_read_failed(channel, error)
        }

        fn on_writable(&self, channel: &mut Channel<MockSocket>) -> io::Result<()> {
            self.record("writable");
            self.inner.on_writable(channel)
        }

        fn on_write_failed(&self, channel: &mut Channel<MockSocket>, error: io::Error) {
            self.record("write_failed");
            self.inner.on_write_failed(channel, error)
        }

        fn on_generic_fault(&self, channel: &mut Channel<MockSocket>, error: io::Error) {
            self.record("generic_fault");
            self.inner.on_generic_fault(channel, error)
        }

        fn on_listener_fault(&self, fault: ListenerError) {
            self.record("listener_fault");
            EventHandler::<MockSocket>::on_listener_fault(&self.inner, fault)
        }
    }

    fn admitted(
        handler: &impl EventHandler<MockSocket>,
        channel: Channel<MockSocket>,
    ) -> (TestRegistry, Channel<MockSocket>) {
        let registry = TestRegistry::new();
        let mut channel = channel;
        assert!(handler.admit(&mut channel, registry.handle()));
        (registry, channel)
    }

    fn accepted(socket: MockSocket) -> Channel<MockSocket> {
        Channel::new(ChannelId(1), socket, discard(), 16)
    }

    #[test]
    fn test_registration_arms_connect_and_read() {
        let handler = SocketEventHandler::new();
        let (_registry, channel) = admitted(&handler, accepted(MockSocket::new()));

        assert_eq!(channel.interest(), InterestSet::connect_and_read());
        assert_eq!(
            channel.socket().unwrap().last_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn test_connect_disarms_connect_interest() {
        let handler = SocketEventHandler::new();
        let socket = MockSocket::new().with_pending_connect(1);
        let channel = Channel::connecting(ChannelId(2), socket, discard(), 16);
        let (_registry, mut channel) = admitted(&handler, channel);

        handler.handle_event(&mut channel, Readiness::Connectable);
        assert!(!channel.is_connected());
        assert!(channel.interest().is_connect());

        handler.handle_event(&mut channel, Readiness::Connectable);
        assert!(channel.is_connected());
        assert_eq!(channel.interest(), InterestSet::READ);
        assert_eq!(
            channel.socket().unwrap().last_interest(),
            Some(Interest::READABLE)
        );
    }

    #[test]
    fn test_connect_failure_closes_channel() {
        let handler = Recorder::default();
        let socket = MockSocket::new().with_connect_error(io::ErrorKind::ConnectionRefused);
        let channel = Channel::connecting(ChannelId(3), socket, discard(), 16);
        let (_registry, mut channel) = admitted(&handler, channel);

        handler.handle_event(&mut channel, Readiness::Connectable);

        assert!(!channel.is_open());
        assert_eq!(
            channel.exception_context().error().map(ChannelError::kind),
            Some(ChannelErrorKind::Connect)
        );
        assert_eq!(handler.calls(), vec!["registered", "connect_failed"]);
    }

    #[test]
    fn test_end_of_stream_closes_and_stops_dispatch() {
        let handler = Recorder::default();
        let (_registry, mut channel) =
            admitted(&handler, accepted(MockSocket::new().with_inbound(b"last").with_eof()));

        handler.handle_event(&mut channel, Readiness::Readable);
        assert!(channel.is_open());
        handler.handle_event(&mut channel, Readiness::Readable);
        assert!(!channel.is_open());
        assert!(!channel.exception_context().has_failed());

        handler.handle_event(&mut channel, Readiness::Readable);
        handler.handle_event(&mut channel, Readiness::Writable);
        assert_eq!(handler.calls(), vec!["registered", "readable", "readable"]);
    }

    #[test]
    fn test_read_error_routes_to_exception_context() {
        let handler = SocketEventHandler::new();
        let socket = MockSocket::new().with_read_error(io::ErrorKind::ConnectionReset);
        let (_registry, mut channel) = admitted(&handler, accepted(socket));

        handler.handle_event(&mut channel, Readiness::Readable);

        assert!(!channel.is_open());
        assert_eq!(
            channel.exception_context().error().map(ChannelError::kind),
            Some(ChannelErrorKind::Read)
        );
    }

    #[test]
    fn test_unbounded_partial_frame_fails_channel() {
        let handler = SocketEventHandler::new();
        let needs_more = |_: ChannelId, _: &[u8]| -> io::Result<usize> { Ok(0) };
        let socket = MockSocket::new().with_inbound(&[7u8; 24]);
        let mut channel = Channel::new(ChannelId(1), socket, Box::new(needs_more), 16);
        channel.set_max_buffered(Some(20));
        let (_registry, mut channel) = admitted(&handler, channel);
        handler.handle_event(&mut channel, Readiness::Connectable);

        handler.handle_event(&mut channel, Readiness::Readable);
        assert!(channel.is_open());
        handler.handle_event(&mut channel, Readiness::Readable);

        assert!(!channel.is_open());
        assert_eq!(
            channel.exception_context().error().map(ChannelError::kind),
            Some(ChannelErrorKind::Read)
        );
    }

    #[test]
    fn test_writable_toggles_write_interest() {
        let handler = SocketEventHandler::new();
        let (_registry, mut channel) =
            admitted(&handler, accepted(MockSocket::new().with_write_budget(12)));
        handler.handle_event(&mut channel, Readiness::Connectable);

        let done = Arc::new(Mutex::new(Vec::new()));
        for (index, len) in [(1usize, 10usize), (2, 5), (3, 1)] {
            let done = done.clone();
            channel.write(vec![0u8; len], move |r| {
                assert!(r.is_ok());
                done.lock().unwrap().push(index);
                Ok(())
            });
        }
        assert!(channel.interest().is_write());

        handler.handle_event(&mut channel, Readiness::Writable);
        assert_eq!(done.lock().unwrap().as_slice(), &[1]);
        assert!(channel.interest().is_write());
        assert_eq!(channel.write_context().queued_bytes(), 4);

        channel.socket_mut().unwrap().refill_write_budget(12);
        handler.handle_event(&mut channel, Readiness::Writable);
        assert_eq!(done.lock().unwrap().as_slice(), &[1, 2, 3]);
        assert!(!channel.interest().is_write());
        assert_eq!(
            channel.socket().unwrap().last_interest(),
            Some(Interest::READABLE)
        );
    }

    #[test]
    fn test_registration_failure_records_one_error() {
        let handler = Recorder::default();
        let registry = TestRegistry::new();
        let socket = MockSocket::new()
            .with_register_error(io::ErrorKind::PermissionDenied)
            .with_inbound(b"never read");
        let mut channel = accepted(socket);

        assert!(!handler.admit(&mut channel, registry.handle()));
        handler.handle_event(&mut channel, Readiness::Connectable);
        handler.handle_event(&mut channel, Readiness::Readable);

        assert_eq!(handler.calls(), vec!["registration_failed"]);
        assert_eq!(channel.exception_context().reported(), 1);
        assert_eq!(
            channel.exception_context().error().map(ChannelError::kind),
            Some(ChannelErrorKind::Registration)
        );
    }

    #[test]
    fn test_duplicate_faults_close_once() {
        let handler = SocketEventHandler::new();
        let (_registry, mut channel) = admitted(&handler, accepted(MockSocket::new()));
        let closes = Arc::new(Mutex::new(0));
        let counter = closes.clone();
        channel.add_close_listener(move |_, _| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
        handler.on_read_failed(&mut channel, broken());
        handler.on_write_failed(&mut channel, broken());
        handler.handle_event(&mut channel, Readiness::Fault(broken()));

        assert_eq!(*closes.lock().unwrap(), 1);
        assert_eq!(channel.exception_context().reported(), 3);
        assert_eq!(
            channel.exception_context().error().map(ChannelError::kind),
            Some(ChannelErrorKind::Read)
        );
    }

    #[test]
    #[traced_test]
    fn test_listener_fault_is_logged_and_channel_stays_open() {
        let handler = Recorder::default();
        let (_registry, mut channel) = admitted(&handler, accepted(MockSocket::new()));
        handler.handle_event(&mut channel, Readiness::Connectable);

        channel.write(&b"ping"[..], |_| Err(anyhow::anyhow!("listener bug")));
        handler.handle_event(&mut channel, Readiness::Writable);

        assert!(channel.is_open());
        assert!(!channel.exception_context().has_failed());
        assert!(handler.calls().contains(&"listener_fault"));
        assert!(logs_contain("exception while executing listener"));
    }
}
