//! Retry delays between delivery attempts.

use std::time::Duration;

use crate::error::{OutboxError, OutboxResult};

/// Ordered list of per-attempt retry delays.
///
/// After the n-th failed attempt the entry waits `series[n - 1]`. Once the
/// attempt count runs past the end of the list, the last delay is reused.
/// With the series `[1s, 5s, 30s]`:
/// - 1st failure: 1s
/// - 2nd failure: 5s
/// - 3rd failure and later: 30s
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSeries {
    delays: Vec<Duration>,
}

impl BackoffSeries {
    /// Create a series from explicit delays. The series must not be empty.
    pub fn new(delays: Vec<Duration>) -> OutboxResult<Self> {
        if delays.is_empty() {
            return Err(OutboxError::config("backoff series must not be empty"));
        }
        Ok(Self { delays })
    }

    /// Create a series from millisecond values.
    pub fn from_millis(millis: &[u64]) -> OutboxResult<Self> {
        Self::new(millis.iter().copied().map(Duration::from_millis).collect())
    }

    /// Parse a comma-separated list of milliseconds, e.g. `"1000, 5000, 30000"`.
    pub fn parse(value: &str) -> OutboxResult<Self> {
        let mut millis = Vec::new();
        for part in value.split(',').map(str::trim) {
            if part.is_empty() {
                return Err(OutboxError::config(format!(
                    "backoff series {:?} contains an empty value",
                    value
                )));
            }
            let ms = part.parse::<u64>().map_err(|_| {
                OutboxError::config(format!(
                    "backoff series value {:?} is not a non-negative integer of milliseconds",
                    part
                ))
            })?;
            millis.push(ms);
        }
        Self::from_millis(&millis)
    }

    /// Delay to wait after `attempts` failed attempts (1-based).
    ///
    /// `attempts = 0` is treated like the first attempt.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let index = (attempts.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for BackoffSeries {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(120),
            ],
        }
    }
}
