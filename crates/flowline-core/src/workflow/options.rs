use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Tunables for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Single attempt, no reconnects
    pub no_retry: bool,
    /// Reconnects allowed after the first attempt
    pub max_retries: u32,
    /// Backoff base
    pub retry_delay: Duration,
    /// Backoff cap
    pub max_retry_delay: Duration,
    /// Silence after which a stream is treated as dead
    pub inactivity_timeout: Duration,
    /// How often the watchdog checks for silence
    pub heartbeat_interval: Duration,
    /// Begin at this step; earlier steps are recorded as skipped
    pub start_from_step: Option<String>,
    /// Capacity of the caller's event queue
    pub event_buffer: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            no_retry: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            start_from_step: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ExecutionOptions {
    pub fn without_retries(mut self) -> Self {
        self.no_retry = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn starting_from(mut self, step: impl Into<String>) -> Self {
        self.start_from_step = Some(step.into());
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: if self.no_retry { 0 } else { self.max_retries },
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `min(base * 2^(n-1), max)` for retry `n >= 1`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }
}
