use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::channel::ChannelId;

/// Result type for event loop entry points.
pub type Result<T> = anyhow::Result<T>;

/// Terminal failure of a channel.
///
/// Every variant except [`ChannelError::Closed`] wraps the I/O error that
/// caused it. Errors are cheap to clone so the same failure can be handed to
/// every pending write listener when the channel is torn down.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("failed to register channel: {0}")]
    Registration(#[source] Arc<io::Error>),
    #[error("failed to connect: {0}")]
    Connect(#[source] Arc<io::Error>),
    #[error("read failed: {0}")]
    Read(#[source] Arc<io::Error>),
    #[error("write failed: {0}")]
    Write(#[source] Arc<io::Error>),
    #[error("channel fault: {0}")]
    Fault(#[source] Arc<io::Error>),
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    pub fn registration(err: io::Error) -> Self {
        ChannelError::Registration(Arc::new(err))
    }

    pub fn connect(err: io::Error) -> Self {
        ChannelError::Connect(Arc::new(err))
    }

    pub fn read(err: io::Error) -> Self {
        ChannelError::Read(Arc::new(err))
    }

    pub fn write(err: io::Error) -> Self {
        ChannelError::Write(Arc::new(err))
    }

    pub fn fault(err: io::Error) -> Self {
        ChannelError::Fault(Arc::new(err))
    }

    /// The underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ChannelError::Registration(e)
            | ChannelError::Connect(e)
            | ChannelError::Read(e)
            | ChannelError::Write(e)
            | ChannelError::Fault(e) => Some(e),
            ChannelError::Closed => None,
        }
    }

    pub fn kind(&self) -> ChannelErrorKind {
        match self {
            ChannelError::Registration(_) => ChannelErrorKind::Registration,
            ChannelError::Connect(_) => ChannelErrorKind::Connect,
            ChannelError::Read(_) => ChannelErrorKind::Read,
            ChannelError::Write(_) => ChannelErrorKind::Write,
            ChannelError::Fault(_) => ChannelErrorKind::Fault,
            ChannelError::Closed => ChannelErrorKind::Closed,
        }
    }
}

/// Discriminant of [`ChannelError`], handy for assertions and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelErrorKind {
    Registration,
    Connect,
    Read,
    Write,
    Fault,
    Closed,
}

impl fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelErrorKind::Registration => "registration",
            ChannelErrorKind::Connect => "connect",
            ChannelErrorKind::Read => "read",
            ChannelErrorKind::Write => "write",
            ChannelErrorKind::Fault => "fault",
            ChannelErrorKind::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An application listener attached to a channel operation failed.
///
/// Listener failures never close the channel; they are only reported.
#[derive(Debug, Error)]
#[error("{listener} listener on channel {channel} failed: {message}")]
pub struct ListenerError {
    pub channel: ChannelId,
    pub listener: &'static str,
    pub message: String,
}

impl ListenerError {
    pub(crate) fn new(channel: ChannelId, listener: &'static str, message: impl Into<String>) -> Self {
        Self {
            channel,
            listener,
            message: message.into(),
        }
    }
}
