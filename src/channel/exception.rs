use tracing::debug;

use super::ChannelId;
use crate::error::ChannelError;

/// Per-channel fault sink.
///
/// The first error wins: it is recorded and the caller is told to close the
/// channel. Every later error is counted and dropped, so several callbacks
/// racing to report the same broken socket tear it down only once.
#[derive(Debug, Default)]
pub struct ExceptionContext {
    first: Option<ChannelError>,
    reported: usize,
}

impl ExceptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` for `channel`. Returns `true` if this is the first
    /// error, which is the caller's signal to close the channel.
    pub fn accept(&mut self, channel: ChannelId, error: ChannelError) -> bool {
        self.reported += 1;
        match &self.first {
            Some(first) => {
                debug!(
                    %channel,
                    first = %first,
                    absorbed = %error,
                    "absorbing duplicate channel error"
                );
                false
            }
            None => {
                debug!(%channel, kind = %error.kind(), error = %error, "channel failed");
                self.first = Some(error);
                true
            }
        }
    }

    /// The first error recorded, if the channel has failed.
    pub fn error(&self) -> Option<&ChannelError> {
        self.first.as_ref()
    }

    pub fn has_failed(&self) -> bool {
        self.first.is_some()
    }

    /// Number of errors reported, the retained one included.
    pub fn reported(&self) -> usize {
        self.reported
    }

    pub fn absorbed(&self) -> usize {
        self.reported.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelErrorKind;
    use std::io;

    fn reset() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")
    }

    #[test]
    fn test_first_error_wins() {
        let mut ctx = ExceptionContext::new();
        let id = ChannelId(1);

        assert!(ctx.accept(id, ChannelError::read(reset())));
        assert!(!ctx.accept(id, ChannelError::write(reset())));
        assert!(!ctx.accept(id, ChannelError::fault(reset())));

        assert_eq!(ctx.error().map(ChannelError::kind), Some(ChannelErrorKind::Read));
        assert_eq!(ctx.reported(), 3);
        assert_eq!(ctx.absorbed(), 2);
    }

    #[test]
    fn test_fresh_context_has_no_error() {
        let ctx = ExceptionContext::new();
        assert!(!ctx.has_failed());
        assert!(ctx.error().is_none());
        assert_eq!(ctx.absorbed(), 0);
    }
}
