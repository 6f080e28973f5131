/// Configuration for a netline event loop.
#[derive(Clone)]
pub struct Config {
    /// Maximum number of concurrent streams (connection slots).
    pub max_streams: u32,
    /// Maximum number of concurrent servers (listener slots).
    pub max_servers: u32,
    /// Listen backlog for servers.
    pub backlog: i32,
    /// Capacity of the shared read slab in bytes.
    pub pool_capacity: usize,
    /// Spare-capacity threshold below which the slab is replaced.
    pub pool_low_water: usize,
    /// Soft cap on pooled reusable objects (write queues and the like).
    pub freelist_capacity: usize,
    /// Set TCP_NODELAY on accepted and outbound TCP streams.
    pub tcp_nodelay: bool,
    /// Capacity of the readiness event batch per poll.
    pub events_capacity: usize,
    /// Per-server cap on concurrently accepted streams. 0 = unlimited.
    /// Over the cap, freshly accepted sockets are closed during the drain.
    pub max_connections_per_server: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            max_servers: 16,
            backlog: 128,
            pool_capacity: 40 * 1024,
            pool_low_water: 128,
            freelist_capacity: 100,
            tcp_nodelay: false,
            events_capacity: 1024,
            max_connections_per_server: 0,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_streams == 0 || self.max_streams >= (1 << 24) {
            return Err(crate::error::Error::Setup(
                "max_streams must be > 0 and < 2^24".into(),
            ));
        }
        if self.max_servers == 0 || self.max_servers >= (1 << 24) {
            return Err(crate::error::Error::Setup(
                "max_servers must be > 0 and < 2^24".into(),
            ));
        }
        if self.pool_low_water == 0 {
            return Err(crate::error::Error::Setup(
                "pool_low_water must be > 0".into(),
            ));
        }
        if self.pool_capacity <= self.pool_low_water {
            return Err(crate::error::Error::Setup(
                "pool_capacity must exceed pool_low_water".into(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(crate::error::Error::Setup(
                "events_capacity must be > 0".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(crate::error::Error::Setup("backlog must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use netline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .max_streams(4096)
///     .backlog(256)
///     .pool(64 * 1024, 256)
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

    // ── Stream settings ──────────────────────────────────────────────

    /// Set the maximum number of concurrent streams.
    pub fn max_streams(mut self, n: u32) -> Self {
        self.config.max_streams = n;
        self
    }

    /// Set the maximum number of concurrent servers.
    pub fn max_servers(mut self, n: u32) -> Self {
        self.config.max_servers = n;
        self
    }

    /// Enable or disable TCP_NODELAY on TCP streams.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    // ── Server settings ──────────────────────────────────────────────

    /// Set the listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Cap concurrently accepted streams per server. 0 = unlimited.
    pub fn max_connections_per_server(mut self, n: u32) -> Self {
        self.config.max_connections_per_server = n;
        self
    }

    // ── Buffer settings ──────────────────────────────────────────────

    /// Set the shared read slab capacity and low-water mark.
    pub fn pool(mut self, capacity: usize, low_water: usize) -> Self {
        self.config.pool_capacity = capacity;
        self.config.pool_low_water = low_water;
        self
    }

    /// Set the soft cap on pooled reusable objects.
    pub fn freelist_capacity(mut self, n: usize) -> Self {
        self.config.freelist_capacity = n;
        self
    }

    /// Set the readiness event batch capacity.
    pub fn events_capacity(mut self, n: usize) -> Self {
        self.config.events_capacity = n;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
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
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_streams_rejected() {
        let mut config = Config::default();
        config.max_streams = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_must_exceed_low_water() {
        let mut config = Config::default();
        config.pool_capacity = 64;
        config.pool_low_water = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_round_trip() {
        let config = ConfigBuilder::new()
            .max_streams(64)
            .backlog(16)
            .pool(8192, 64)
            .build()
            .unwrap();
        assert_eq!(config.max_streams, 64);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.pool_capacity, 8192);
    }
}
