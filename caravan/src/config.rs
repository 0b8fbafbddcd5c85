/// Configuration for the target.
#[derive(Clone)]
pub struct Config {
    /// Worker/thread configuration.
    pub worker: WorkerConfig,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Forced send/receive buffer size on the listener, inherited by
    /// accepted sockets. Must comfortably exceed the caravan capacity.
    pub sock_buf_size: u32,
    /// Maximum in-capsule write payload accepted in a command PDU.
    pub inline_data_size: u32,
    /// Maximum queues (connections) per worker.
    pub max_queues: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            backlog: 128,
            tcp_nodelay: true,
            sock_buf_size: 8 << 20,
            inline_data_size: 4 * crate::sg::PAGE_SIZE as u32,
            max_queues: 1024,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_queues == 0 || self.max_queues >= (1 << 24) {
            return Err(crate::error::Error::Config(
                "max_queues must be > 0 and < 2^24".into(),
            ));
        }
        if self.sock_buf_size < crate::caravan::CARAVAN_CAPACITY as u32 {
            return Err(crate::error::Error::Config(
                "sock_buf_size must be at least the caravan capacity".into(),
            ));
        }
        if self.inline_data_size == 0 {
            return Err(crate::error::Error::Config(
                "inline_data_size must be > 0".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(crate::error::Error::Config("backlog must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the thread-per-core worker model.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Number of worker threads. 0 = number of CPUs.
    pub threads: usize,
    /// Whether to pin each worker to a CPU core.
    pub pin_to_core: bool,
    /// Starting CPU core index for pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            pin_to_core: true,
            core_offset: 0,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use caravan::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .workers(2)
///     .max_queues(256)
///     .tcp_nodelay(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Worker settings ──────────────────────────────────────────────

    /// Set the number of worker threads. 0 = number of CPUs.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.worker.threads = n;
        self
    }

    /// Enable or disable CPU core pinning.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.worker.pin_to_core = enable;
        self
    }

    /// Set the starting CPU core index for pinning.
    pub fn core_offset(mut self, offset: usize) -> Self {
        self.config.worker.core_offset = offset;
        self
    }

    // ── Connection settings ──────────────────────────────────────────

    /// Set the maximum number of queues per worker.
    pub fn max_queues(mut self, n: u32) -> Self {
        self.config.max_queues = n;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the forced socket send/receive buffer size.
    pub fn sock_buf_size(mut self, bytes: u32) -> Self {
        self.config.sock_buf_size = bytes;
        self
    }

    // ── Protocol settings ────────────────────────────────────────────

    /// Set the maximum in-capsule write payload size.
    pub fn inline_data_size(mut self, bytes: u32) -> Self {
        self.config.inline_data_size = bytes;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_queues() {
        let config = ConfigBuilder::new().max_queues(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_undersized_sndbuf() {
        let config = ConfigBuilder::new().sock_buf_size(4096).build();
        assert!(config.is_err());
    }
}
