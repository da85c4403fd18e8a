//! # Mill-NIO
//! A non-blocking socket reactor for Rust built directly on [`mio`], without an async runtime.
//! Each connection is a [`Channel`]: a socket plus a read context, a write queue and an
//! exception context. Selector threads poll for readiness and hand every notification to an
//! [`EventHandler`], which reads, flushes, and adjusts the channel's interest set.
//! ## Core Philosophy
//! Mill-NIO was designed for applications that require:
//! - **Bounded work per notification**: one read per readable event, queued writes flushed until the socket pushes back
//! - **Ownership instead of locks**: a channel belongs to exactly one selector thread
//! - **Contained failures**: the first error closes a channel, later ones are absorbed
//! ## Features
//! - **Interest control**: connect, read and write interest applied to the OS only when they change
//! - **Write completion**: every queued write completes exactly once, in order
//! - **Listener isolation**: failing or panicking application callbacks never take a channel down
//! - **Multiple selectors**: channels are spread round-robin over a fixed set of selector threads
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌────────────────┐
//! │ EventLoop   │───▶│ SelectorPool │───▶│ SocketSelector │ (one thread each)
//! └─────────────┘    └──────────────┘    └────────────────┘
//!        │                                        │
//!        ▼                                        ▼
//! ┌──────────────┐   Command + wake   ┌────────────────────┐    ┌─────────────┐
//! │ChannelHandle │───────────────────▶│ SocketEventHandler │───▶│ Channel<S>  │
//! └──────────────┘                    └────────────────────┘    └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_nio::{ChannelId, EventLoop, ReactorConfig};
//! use std::{io, net::SocketAddr};
//!
//! fn main() -> anyhow::Result<()> {
//!     let event_loop = EventLoop::new(ReactorConfig::default())?;
//!     let addr: SocketAddr = "127.0.0.1:7000".parse()?;
//!
//!     let channel = event_loop.connect(addr, |id: ChannelId, buf: &[u8]| -> io::Result<usize> {
//!         println!("{id}: {} bytes", buf.len());
//!         Ok(buf.len())
//!     })?;
//!
//!     channel.write(&b"ping"[..], |result| {
//!         println!("write finished: {result:?}");
//!         Ok(())
//!     })?;
//!
//!     event_loop.stop();
//!     Ok(())
//! }
//! ```
//!
//! - [`EventLoop`]: Main entry point for registering streams and connecting to peers
//! - [`EventHandler`]: Trait mapping readiness notifications onto channel operations
//! - [`channel`]: Channels and their read, write and exception contexts
//! - [`selector`]: The single-threaded selector loop and its cross-thread handle
//! - [`pool`]: Selector threads
//! - [`error`]: Error types and result handling

#![cfg_attr(feature = "unstable-mpmc", feature(mpmc_channel))]

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod interest;
pub mod pool;
pub mod selector;

#[cfg(test)]
mod test_support;

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use mio::net::TcpStream;
use tracing::debug;

pub use channel::{Channel, ChannelId, FrameDecoder, Socket, WriteOperation};
pub use config::ReactorConfig;
pub use error::{ChannelError, ChannelErrorKind, ListenerError};
pub use event::{Readiness, ReadinessEvent};
pub use handler::{EventHandler, SocketEventHandler};
pub use interest::InterestSet;

use crate::{error::Result, pool::SelectorPool, selector::SelectorHandle};

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_nio::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{Channel, ChannelId, FrameDecoder, Socket, WriteOperation};
    pub use crate::config::ReactorConfig;
    pub use crate::error::{ChannelError, ListenerError};
    pub use crate::handler::{EventHandler, SocketEventHandler};
    pub use crate::interest::InterestSet;
    pub use crate::selector::{self, SocketSelector};
    pub use crate::{ChannelHandle, EventLoop};
}

/// Owns the selector threads and hands channels to them.
///
/// Every registered stream gets a fresh [`ChannelId`] and is moved to one
/// selector thread, which owns it from then on. The returned
/// [`ChannelHandle`] is how other threads write to it or close it.
///
/// Dropping the event loop stops every selector, closes every channel and
/// waits for the threads to exit.
///
/// ## Example
///
/// ```rust,no_run
/// use mill_nio::{ChannelId, EventLoop, ReactorConfig};
/// use mio::net::TcpStream;
/// use std::{io, net::TcpListener};
///
/// let event_loop = EventLoop::new(ReactorConfig::builder().selectors(2).build())?;
/// let listener = TcpListener::bind("127.0.0.1:0")?;
/// let (stream, _) = listener.accept()?;
/// stream.set_nonblocking(true)?;
///
/// let channel = event_loop.register(
///     TcpStream::from_std(stream),
///     |_: ChannelId, buf: &[u8]| -> io::Result<usize> { Ok(buf.len()) },
/// )?;
/// channel.close()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct EventLoop {
    pool: SelectorPool,
    config: ReactorConfig,
    next_id: AtomicUsize,
}

impl EventLoop {
    /// Starts `config.selectors` selector threads.
    ///
    /// ## Errors
    ///
    /// Returns an error if a poll instance or a selector thread cannot be
    /// created.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        let pool = SelectorPool::new(&config)?;
        Ok(Self {
            pool,
            config,
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn selectors(&self) -> usize {
        self.pool.len()
    }

    fn next_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn configure(&self, id: ChannelId, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            debug!(channel = %id, error = %e, "failed to set TCP_NODELAY");
        }
    }

    /// Registers an already connected, non-blocking stream.
    ///
    /// `decoder` sees every inbound byte of the channel on its selector
    /// thread. Registration itself completes asynchronously: if it fails the
    /// channel is closed and its close listeners observe the cause.
    ///
    /// ## Errors
    ///
    /// Returns an error if the chosen selector has already shut down.
    pub fn register<D>(&self, stream: TcpStream, decoder: D) -> Result<ChannelHandle>
    where
        D: FrameDecoder + 'static,
    {
        let id = self.next_id();
        self.configure(id, &stream);
        let channel = Channel::new(id, stream, Box::new(decoder), self.config.read_buffer_size);
        self.hand_over(channel)
    }

    /// Starts a non-blocking connect to `addr` and registers the stream.
    ///
    /// Writes issued before the connect completes are queued and flushed
    /// once it does. A failed connect closes the channel with
    /// [`ChannelError::Connect`].
    pub fn connect<D>(&self, addr: SocketAddr, decoder: D) -> Result<ChannelHandle>
    where
        D: FrameDecoder + 'static,
    {
        let stream = TcpStream::connect(addr)?;
        let id = self.next_id();
        self.configure(id, &stream);
        let channel =
            Channel::connecting(id, stream, Box::new(decoder), self.config.read_buffer_size);
        self.hand_over(channel)
    }

    fn hand_over(&self, mut channel: Channel<TcpStream>) -> Result<ChannelHandle> {
        channel.set_max_buffered(self.config.max_buffered);
        let id = channel.id();
        let selector = self.pool.next().clone();
        selector.register(channel)?;
        debug!(channel = %id, selector = selector.index(), "channel handed over");
        Ok(ChannelHandle { id, selector })
    }

    /// Signals every selector to stop. Channels still open are closed by
    /// their selector. Non-blocking; dropping the event loop waits.
    pub fn stop(&self) {
        self.pool.shutdown();
    }
}

/// Cross-thread handle to a channel owned by a selector.
///
/// Every method queues a command for the owning selector and returns
/// immediately. Once the selector is gone they return an error, and a write
/// listener passed along is completed with [`ChannelError::Closed`].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    selector: SelectorHandle<TcpStream>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queues `payload`. `listener` runs on the selector thread once the
    /// whole payload was written, or with the error that prevented it.
    pub fn write<F>(&self, payload: impl Into<Bytes>, listener: F) -> Result<()>
    where
        F: FnOnce(std::result::Result<(), ChannelError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.selector
            .write(self.id, WriteOperation::new(payload, listener))
    }

    pub fn write_detached(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.selector
            .write(self.id, WriteOperation::detached(payload))
    }

    /// Runs `listener` once the channel closes. If it already has, the
    /// listener runs on the next selector iteration with no cause, as it
    /// would for an orderly close.
    pub fn on_close<F>(&self, listener: F) -> Result<()>
    where
        F: FnOnce(ChannelId, Option<&ChannelError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.selector.on_close(self.id, Box::new(listener))
    }

    pub fn close(&self) -> Result<()> {
        self.selector.close(self.id)
    }
}
