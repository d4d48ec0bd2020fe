use std::time::Duration;

use crate::{
    error::{Error, Result},
    protocol::MESSAGE_MAX_SIZE,
    reactor::{DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS},
    utils::get_default_capacity,
};

pub const DEFAULT_CONTEXT_POOL_SIZE: usize = 100;

/// Configuration for an [`Engine`](crate::Engine).
///
/// Controls how much memory the engine reserves up front and how readiness
/// is turned into completions. Use `EngineConfig::builder()` for ergonomic
/// construction.
///
/// ## Memory
///
/// - pool_size: number of I/O contexts, and of arena chunks backing them
/// - chunk_size: bytes per chunk, which is also the largest message payload
///
/// ## Behaviour
///
/// - auto_accept: a listener re-arms `accept()` after every completed accept
/// - notify_closed: publish a `ConnectionClosed` event when a socket closes
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of pooled I/O contexts
    pub pool_size: usize,
    /// Size of each arena chunk in bytes
    pub chunk_size: usize,
    /// Number of completion worker threads
    pub workers: usize,
    /// Readiness events handled per poll
    pub events_capacity: usize,
    /// Upper bound on a single poll wait
    pub poll_timeout: Duration,
    /// Enable TCP_NODELAY on accepted and connected streams
    pub no_delay: bool,
    /// Re-arm listeners after each accept
    pub auto_accept: bool,
    /// Publish an event when a connection closes
    pub notify_closed: bool,
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Largest payload a single message may carry.
    pub fn max_message_size(&self) -> usize {
        self.chunk_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Configuration("pool_size must be non-zero".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Configuration("chunk_size must be non-zero".into()));
        }
        if self.chunk_size as u64 > u32::MAX as u64 {
            return Err(Error::Configuration(format!(
                "chunk_size {} does not fit a u32 length prefix",
                self.chunk_size
            )));
        }
        if self.pool_size.checked_mul(self.chunk_size).is_none() {
            return Err(Error::Configuration(
                "pool_size * chunk_size overflows".into(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be non-zero".into()));
        }
        if self.events_capacity == 0 {
            return Err(Error::Configuration(
                "events_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_CONTEXT_POOL_SIZE,
            chunk_size: MESSAGE_MAX_SIZE,
            workers: get_default_capacity(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            no_delay: true,
            auto_accept: false,
            notify_closed: false,
        }
    }
}

/// Builder for EngineConfig.
///
/// All fields are optional and fall back to `EngineConfig::default()`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    pool_size: Option<usize>,
    chunk_size: Option<usize>,
    workers: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    no_delay: Option<bool>,
    auto_accept: Option<bool>,
    notify_closed: Option<bool>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of pooled I/O contexts
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Set the chunk size, and with it the maximum message size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Set the number of worker threads
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
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

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn auto_accept(mut self, enabled: bool) -> Self {
        self.auto_accept = Some(enabled);
        self
    }

    pub fn notify_closed(mut self, enabled: bool) -> Self {
        self.notify_closed = Some(enabled);
        self
    }

    /// Build the EngineConfig
    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            pool_size: self.pool_size.unwrap_or(default.pool_size),
            chunk_size: self.chunk_size.unwrap_or(default.chunk_size),
            workers: self.workers.unwrap_or(default.workers),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            auto_accept: self.auto_accept.unwrap_or(default.auto_accept),
            notify_closed: self.notify_closed.unwrap_or(default.notify_closed),
        }
    }
}
