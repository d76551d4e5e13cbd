//! Engine configuration.

/// Reactor backend driving a loop's I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorKind {
    /// io_uring submission/completion rings. Linux 5.6+.
    CompletionRing,
    /// epoll readiness multiplexing. Linux.
    Readiness,
    /// `polling`-based selector. Anywhere.
    Portable,
}

/// Configuration for a [`TpcEngine`](crate::TpcEngine) and its loops.
#[derive(Clone)]
pub struct Config {
    /// Reactor backend for every loop.
    pub reactor: ReactorKind,
    /// Number of event loops. 0 = number of CPUs.
    pub eventloops: usize,
    /// Busy-poll the reactor instead of parking.
    pub spin: bool,
    /// Pin each loop thread to a CPU core.
    pub pin_to_core: bool,
    /// First core index used when pinning; loop `i` lands on `core_offset + i`.
    pub core_offset: usize,
    /// Submission ring entries (completion-ring backend). Power of two.
    pub ring_size: u32,
    /// Initial capacity of each socket's receive accumulator.
    pub recv_buffer_capacity: usize,
    /// Soft byte budget for a socket's outbound queue; `write` returns
    /// false past it until flush progress is made.
    pub outbound_limit_bytes: usize,
    /// Frames declaring more than this are a protocol error.
    pub max_frame_size: usize,
    /// Thread-name prefix for loop threads.
    pub name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reactor: ReactorKind::Readiness,
            eventloops: 0,
            spin: false,
            pin_to_core: false,
            core_offset: 0,
            ring_size: 1024,
            recv_buffer_capacity: 16384,
            outbound_limit_bytes: 1 << 20,
            max_frame_size: 1 << 24,
            name: "spindle".to_string(),
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        use crate::error::Error;
        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "ring_size must be > 0 and a power of two".into(),
            ));
        }
        if self.recv_buffer_capacity < crate::frame::HEADER_BYTES {
            return Err(Error::InvalidConfig(
                "recv_buffer_capacity must hold at least a frame header".into(),
            ));
        }
        if self.max_frame_size < crate::frame::HEADER_BYTES {
            return Err(Error::InvalidConfig(
                "max_frame_size must be at least the frame header".into(),
            ));
        }
        if self.outbound_limit_bytes == 0 {
            return Err(Error::InvalidConfig(
                "outbound_limit_bytes must be > 0".into(),
            ));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Loop settings ────────────────────────────────────────────────

    /// Set the reactor backend.
    pub fn reactor(mut self, kind: ReactorKind) -> Self {
        self.config.reactor = kind;
        self
    }

    /// Set the number of event loops. 0 = number of CPUs.
    pub fn eventloops(mut self, n: usize) -> Self {
        self.config.eventloops = n;
        self
    }

    /// Busy-poll instead of parking.
    pub fn spin(mut self, enable: bool) -> Self {
        self.config.spin = enable;
        self
    }

    /// Enable or disable CPU core pinning.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.pin_to_core = enable;
        self
    }

    /// Set the starting CPU core index for pinning.
    pub fn core_offset(mut self, offset: usize) -> Self {
        self.config.core_offset = offset;
        self
    }

    /// Set the thread-name prefix.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    // ── I/O settings ─────────────────────────────────────────────────

    /// Set the submission ring size (completion-ring backend).
    pub fn ring_size(mut self, n: u32) -> Self {
        self.config.ring_size = n;
        self
    }

    /// Set the initial receive accumulator capacity.
    pub fn recv_buffer_capacity(mut self, n: usize) -> Self {
        self.config.recv_buffer_capacity = n;
        self
    }

    /// Set the outbound backpressure byte budget.
    pub fn outbound_limit_bytes(mut self, n: usize) -> Self {
        self.config.outbound_limit_bytes = n;
        self
    }

    /// Set the maximum accepted frame size.
    pub fn max_frame_size(mut self, n: usize) -> Self {
        self.config.max_frame_size = n;
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
    fn rejects_non_power_of_two_ring() {
        let config = ConfigBuilder::new().ring_size(1000).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_tiny_recv_buffer() {
        let config = ConfigBuilder::new().recv_buffer_capacity(8).build();
        assert!(config.is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .reactor(ReactorKind::Portable)
            .eventloops(2)
            .spin(true)
            .outbound_limit_bytes(4096)
            .build()
            .unwrap();
        assert_eq!(config.reactor, ReactorKind::Portable);
        assert_eq!(config.eventloops, 2);
        assert!(config.spin);
        assert_eq!(config.outbound_limit_bytes, 4096);
    }
}
