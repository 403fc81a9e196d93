use crate::error::{Result, TunnelError};
use std::time::Duration;

/// Tunables for a `FrameConn`.
///
/// The defaults are the protocol's normative values; the knobs exist mainly
/// so tests can compress the timing windows.
///
/// # Examples
///
/// ```rust
/// use fmux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.inbound_queue_chunks, 128);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval at which the writer emits Ping frames.
    pub keep_alive_interval: Duration,
    /// How stale the last sent ping or last received pong may become before
    /// the supervisor declares the peer dead.
    pub liveness_timeout: Duration,
    /// Watchdog applied while waiting for the leading varint of the next
    /// frame. Cleared once the frame has started arriving.
    pub read_idle_timeout: Duration,
    /// Bound on each stream's inbound chunk queue. A peer that keeps sending
    /// past a full queue gets its stream reset.
    pub inbound_queue_chunks: usize,
    /// Bound on stream IDs dialled by the peer but not yet accepted locally.
    pub accept_backlog: usize,
    /// Deadline for the TCP dial a `Stream::proxy` performs on behalf of the
    /// peer.
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            read_idle_timeout: Duration::from_secs(30),
            inbound_queue_chunks: 128,
            accept_backlog: 128,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TunnelError::ProtocolError(
                "keep-alive interval cannot be zero".to_string(),
            ));
        }

        if self.liveness_timeout <= self.keep_alive_interval {
            return Err(TunnelError::ProtocolError(
                "liveness timeout must exceed the keep-alive interval".to_string(),
            ));
        }

        if self.read_idle_timeout <= self.keep_alive_interval {
            // The peer's pings are what keep an idle transport from tripping
            // the read watchdog.
            return Err(TunnelError::ProtocolError(
                "read idle timeout must exceed the keep-alive interval".to_string(),
            ));
        }

        if self.inbound_queue_chunks == 0 {
            return Err(TunnelError::ProtocolError(
                "inbound queue cannot be zero-length".to_string(),
            ));
        }

        if self.accept_backlog == 0 {
            return Err(TunnelError::ProtocolError(
                "accept backlog cannot be zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for custom `Config` instances.
///
/// ```rust
/// use fmux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .keep_alive_interval(Duration::from_millis(500))
///     .liveness_timeout(Duration::from_secs(2))
///     .read_idle_timeout(Duration::from_secs(3))
///     .build()
///     .expect("valid configuration");
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness_timeout = timeout;
        self
    }

    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_idle_timeout = timeout;
        self
    }

    pub fn inbound_queue_chunks(mut self, chunks: usize) -> Self {
        self.config.inbound_queue_chunks = chunks;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
