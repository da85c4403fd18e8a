use std::time::Duration;

use crate::channel::DEFAULT_READ_BUFFER_SIZE;

/// Selector count used when the machine's parallelism cannot be queried.
pub const DEFAULT_SELECTORS: usize = 4;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub fn default_selector_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_SELECTORS)
}

/// Configuration for an [`EventLoop`](crate::EventLoop).
///
/// Use [`ReactorConfig::builder()`] to override individual values.
///
/// ## Sizing
///
/// - selectors: number of selector threads, each with its own poll
/// - events_capacity: readiness events fetched per poll
/// - read_buffer_size: upper bound of a single read, per channel
/// - max_buffered: optional cap on bytes held for an incomplete frame. A
///   channel exceeding it fails with a read error
///
/// ## Socket Options
///
/// - no_delay: When enabled (default), disables Nagle's algorithm on every
///   registered stream
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of selector threads
    pub selectors: usize,
    /// Events fetched per poll
    pub events_capacity: usize,
    /// Longest time a selector blocks in poll
    pub poll_timeout: Duration,
    /// Bytes requested per read
    pub read_buffer_size: usize,
    /// Cap on bytes buffered for a frame the decoder has not completed
    pub max_buffered: Option<usize>,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
}

impl ReactorConfig {
    pub fn builder() -> ReactorConfigBuilder {
        ReactorConfigBuilder::new()
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            selectors: default_selector_count(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_buffered: None,
            no_delay: true,
        }
    }
}

/// Builder for [`ReactorConfig`].
///
/// Unset fields fall back to [`ReactorConfig::default()`]. Zero sizes are
/// raised to one.
#[derive(Debug, Default)]
pub struct ReactorConfigBuilder {
    selectors: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    read_buffer_size: Option<usize>,
    max_buffered: Option<usize>,
    no_delay: Option<bool>,
}

impl ReactorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selectors(mut self, count: usize) -> Self {
        self.selectors = Some(count);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn max_buffered(mut self, limit: usize) -> Self {
        self.max_buffered = Some(limit);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn build(self) -> ReactorConfig {
        let default = ReactorConfig::default();
        ReactorConfig {
            selectors: self.selectors.unwrap_or(default.selectors).max(1),
            events_capacity: self
                .events_capacity
                .unwrap_or(default.events_capacity)
                .max(1),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            read_buffer_size: self
                .read_buffer_size
                .unwrap_or(default.read_buffer_size)
                .max(1),
            max_buffered: self.max_buffered.or(default.max_buffered),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ReactorConfig::builder().build();
        assert!(config.selectors >= 1);
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
        assert_eq!(config.poll_timeout, DEFAULT_POLL_TIMEOUT);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.max_buffered, None);
        assert!(config.no_delay);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ReactorConfig::builder()
            .selectors(2)
            .events_capacity(64)
            .poll_timeout(Duration::from_millis(5))
            .read_buffer_size(0)
            .max_buffered(64 * 1024)
            .no_delay(false)
            .build();
        assert_eq!(config.selectors, 2);
        assert_eq!(config.events_capacity, 64);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
        assert_eq!(config.read_buffer_size, 1);
        assert_eq!(config.max_buffered, Some(64 * 1024));
        assert!(!config.no_delay);
    }
}
