//! Rate limiting: the token-bucket primitive and the named service that
//! bundles per-endpoint buckets.

mod bucket;
mod limiter;
mod writer;

pub use bucket::{BucketConfig, Grant, TokenBucket};
pub use limiter::RateLimiter;
pub use writer::RateLimitedWriter;

use serde::{Deserialize, Serialize};

/// The unit a configured `flowRate` is expressed in. Normalized to
/// tokens/second at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Day,
    Hour,
    Minute,
    #[default]
    Second,
    Msec,
}

impl TimeUnit {
    /// Converts a rate in tokens per this unit into tokens per second.
    pub fn rate_per_second(self, flow_rate: f64) -> f64 {
        flow_rate / self.seconds()
    }

    fn seconds(self) -> f64 {
        match self {
            TimeUnit::Day => 86_400.0,
            TimeUnit::Hour => 3_600.0,
            TimeUnit::Minute => 60.0,
            TimeUnit::Second => 1.0,
            TimeUnit::Msec => 0.001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimeUnit;

    #[test]
    fn time_unit_normalization() {
        assert_eq!(TimeUnit::Second.rate_per_second(5.0), 5.0);
        assert_eq!(TimeUnit::Minute.rate_per_second(60.0), 1.0);
        assert_eq!(TimeUnit::Hour.rate_per_second(7200.0), 2.0);
        assert_eq!(TimeUnit::Day.rate_per_second(86_400.0), 1.0);
        assert_eq!(TimeUnit::Msec.rate_per_second(1.0), 1000.0);
    }
}
