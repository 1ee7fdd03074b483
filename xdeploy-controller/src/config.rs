use std::time::Duration;

/// Tunables for the XDeployment controller loop
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of workers draining the queue
    pub workers: usize,
    /// Upper bound for every store and driver call
    pub driver_timeout: Duration,
    /// First retry delay after a transient failure
    pub backoff_base: Duration,
    /// Ceiling for the retry delay
    pub backoff_max: Duration,
    /// Requeue interval once a resource has converged
    pub resync_interval: Duration,
    /// Requeue interval while children are starting or being replaced
    pub rollout_poll_interval: Duration,
    /// Requeue interval for a resource whose spec failed validation
    pub invalid_spec_retry: Duration,
    /// How long a replacement may stay unready before the rollout moves on
    pub progress_deadline: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            driver_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
            resync_interval: Duration::from_secs(5 * 60),
            rollout_poll_interval: Duration::from_secs(5),
            invalid_spec_retry: Duration::from_secs(5 * 60),
            progress_deadline: Duration::from_secs(10 * 60),
        }
    }
}
