use std::io;
use std::sync::Arc;
use std::time::Duration;

use super::channel::SharedMemoryChannel;

pub const DEFAULT_SLOTS: usize = 256;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub const ENV_SEND_SLOTS: &str = "SHM_RPC_SEND_SLOTS";
pub const ENV_RECEIVE_SLOTS: &str = "SHM_RPC_RECEIVE_SLOTS";

/// Sizing of the two queues of a channel, seen from the creating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Chunks in the `{name}-S` segment (creator → opener).
    pub send_slots: usize,
    /// Chunks in the `{name}-R` segment (opener → creator).
    pub receive_slots: usize,
    /// How long a sender waits for a free chunk before failing.
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_slots: DEFAULT_SLOTS,
            receive_slots: DEFAULT_SLOTS,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    /// Defaults overridden by `SHM_RPC_SEND_SLOTS` / `SHM_RPC_RECEIVE_SLOTS`.
    /// Values that are not a positive power of two are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = slots_from_env(ENV_SEND_SLOTS) {
            config.send_slots = n;
        }
        if let Some(n) = slots_from_env(ENV_RECEIVE_SLOTS) {
            config.receive_slots = n;
        }
        config
    }
}

fn slots_from_env(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 && n.is_power_of_two() => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring slot count that is not a positive power of two");
            None
        }
    }
}

/// Builds either endpoint of a channel.
///
/// The Host calls [`create`](Self::create); the worker it spawned calls
/// [`open`](Self::open) with the same name.
pub struct ChannelBuilder {
    name: String,
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ChannelConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_send_slots(mut self, slots: usize) -> Self {
        self.config.send_slots = slots;
        self
    }

    pub fn with_receive_slots(mut self, slots: usize) -> Self {
        self.config.receive_slots = slots;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Create both segments and return the creating endpoint.
    pub fn create(self) -> io::Result<Arc<SharedMemoryChannel>> {
        SharedMemoryChannel::create(&self.name, &self.config)
    }

    /// Attach to segments created by the peer, with reversed roles.
    pub fn open(self) -> io::Result<Arc<SharedMemoryChannel>> {
        SharedMemoryChannel::open(&self.name, &self.config)
    }
}
