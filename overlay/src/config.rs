use crate::Error;
use ringsim_runtime::Mode;
use std::time::Duration;

/// Configuration for a [crate::Network].
#[derive(Clone, Debug)]
pub struct Config {
    /// Time source of the underlying scheduler.
    pub mode: Mode,

    /// Seed for every random choice the network makes (latency sampling and loss).
    pub seed: u64,

    /// How long a sender waits for the next hop to acknowledge a request.
    pub ack_timeout: Duration,

    /// How long the origin of a request waits for its reply.
    pub reply_timeout: Duration,

    /// How long a node that missed an ack is avoided.
    pub suspect_window: Duration,

    /// How long a leaving node keeps serving lookups before it is evicted.
    pub grace_period: Duration,

    /// Attempts made by a join before giving up.
    pub join_attempts: usize,

    /// Delay between join attempts.
    pub join_retry_delay: Duration,

    /// Maximum number of nodes a request may visit.
    pub max_hops: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Virtual,
            seed: 0,
            ack_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(10),
            suspect_window: Duration::from_secs(30),
            grace_period: Duration::from_secs(1),
            join_attempts: 3,
            join_retry_delay: Duration::from_millis(500),
            max_hops: 64,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.ack_timeout.is_zero() {
            return Err(Error::InvalidConfig("ack_timeout must be positive".into()));
        }
        if self.ack_timeout >= self.reply_timeout {
            return Err(Error::InvalidConfig(
                "ack_timeout must be shorter than reply_timeout".into(),
            ));
        }
        if self.join_attempts == 0 {
            return Err(Error::InvalidConfig("join_attempts must be positive".into()));
        }
        if self.max_hops == 0 {
            return Err(Error::InvalidConfig("max_hops must be positive".into()));
        }
        Ok(())
    }
}
