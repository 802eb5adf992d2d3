use std::time::Duration;

/// The configuration of the consistency engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many recently played entries are kept per user
    pub history_capacity: usize,
    /// How long an operation may wait for its locks before failing with a timeout
    pub lock_timeout: Duration,
    /// How many times a cascade deletion re-collects its lock set before giving up
    pub cascade_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Enough to fill the recently played shelf of any client
            history_capacity: 50,
            // Operations hold locks for microseconds, waiting longer than
            // this means something is stuck
            lock_timeout: Duration::from_secs(5),
            // A referrer set rarely changes more than once mid-acquisition
            cascade_retries: 3,
        }
    }
}
