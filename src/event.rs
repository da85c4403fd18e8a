use mio::{event::Event, Token};
use std::{fmt, io};

use crate::channel::ChannelId;

/// What happened to a channel, as seen by the event handler.
pub enum Readiness {
    /// A pending connect may have completed.
    Connectable,
    Readable,
    Writable,
    /// Admission to the readiness primitive failed.
    RegistrationFailed(io::Error),
    /// Anything else that went wrong while handling the channel.
    Fault(io::Error),
}

impl Readiness {
    pub fn name(&self) -> &'static str {
        match self {
            Readiness::Connectable => "connectable",
            Readiness::Readable => "readable",
            Readiness::Writable => "writable",
            Readiness::RegistrationFailed(_) => "registration-failed",
            Readiness::Fault(_) => "fault",
        }
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::RegistrationFailed(e) | Readiness::Fault(e) => {
                write!(f, "{}({})", self.name(), e)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// A readiness notification bound to the channel it applies to.
#[derive(Debug)]
pub struct ReadinessEvent {
    pub channel: ChannelId,
    pub readiness: Readiness,
}

/// Platform-neutral snapshot of a mio event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SocketReady {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

impl fmt::Debug for SocketReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketReady")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("error", &self.error)
            .finish()
    }
}

impl SocketReady {
    /// Synthetic readable notification, used to re-dispatch channels whose
    /// last read filled the whole buffer.
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            readable: true,
            writable: false,
            error: false,
            read_closed: false,
            write_closed: false,
        }
    }

    pub fn writable(token: Token) -> Self {
        Self {
            writable: true,
            readable: false,
            ..Self::readable(token)
        }
    }

    /// Error readiness, as reported for a socket with a pending error.
    pub fn error(token: Token) -> Self {
        Self {
            error: true,
            readable: false,
            ..Self::readable(token)
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable || self.read_closed
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Whether this notification can mean a pending connect finished,
    /// successfully or not.
    pub fn may_complete_connect(&self) -> bool {
        self.writable || self.error || self.write_closed
    }

    pub(crate) fn merge(&mut self, other: SocketReady) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
        self.read_closed |= other.read_closed;
        self.write_closed |= other.write_closed;
    }
}

impl From<&Event> for SocketReady {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_readable() {
        let ready = SocketReady::readable(Token(7));
        assert_eq!(ready.token(), Token(7));
        assert!(ready.is_readable());
        assert!(!ready.is_writable());
        assert!(!ready.may_complete_connect());
    }

    #[test]
    fn test_merge() {
        let mut ready = SocketReady::readable(Token(3));
        let writable = SocketReady {
            writable: true,
            ..SocketReady::readable(Token(3))
        };
        ready.merge(writable);
        assert!(ready.is_readable());
        assert!(ready.is_writable());
        assert!(ready.may_complete_connect());
    }

    #[test]
    fn test_readiness_debug() {
        let fault = Readiness::Fault(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(format!("{:?}", fault), "fault(boom)");
        assert_eq!(format!("{:?}", Readiness::Writable), "writable");
    }
}
