use std::sync::Arc;

use async_trait::async_trait;

use super::{RateLimitedWriter, TokenBucket};
use crate::component::Component;
use crate::config::RateLimiterConfig;
use crate::Error;

/// A named service bundling up to three token buckets: new connections, new
/// requests, and outbound data bytes.
///
/// Endpoints consult the connection bucket at accept time and the request
/// bucket per parsed request; the data bucket is applied by wrapping the
/// outbound side of the connection with [`wrap_writer`](Self::wrap_writer).
/// A missing bucket admits everything.
pub struct RateLimiter {
    name: String,
    connections: Option<Arc<TokenBucket>>,
    requests: Option<Arc<TokenBucket>>,
    data: Option<Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: &RateLimiterConfig) -> Result<Self, Error> {
        fn build(
            tuning: &Option<crate::config::BucketTuning>,
        ) -> Result<Option<Arc<TokenBucket>>, Error> {
            tuning
                .as_ref()
                .map(|tuning| TokenBucket::new(tuning.bucket_config()).map(Arc::new))
                .transpose()
        }
        Ok(Self {
            name: name.into(),
            connections: build(&config.connections)?,
            requests: build(&config.requests)?,
            data: build(&config.data)?,
        })
    }

    /// Admission check for a new connection: one token from the connections
    /// bucket. Waits its turn in the queue if the bucket allows queueing.
    pub async fn check_connection(&self) -> bool {
        match &self.connections {
            Some(bucket) => bucket.acquire(1).await.done,
            None => true,
        }
    }

    /// Admission check for a new request, as above for the requests bucket.
    pub async fn check_request(&self) -> bool {
        match &self.requests {
            Some(bucket) => bucket.acquire(1).await.done,
            None => true,
        }
    }

    /// Wraps a stream so writes debit the data bucket before flowing
    /// downstream. Without a data bucket the wrapper is a passthrough.
    pub fn wrap_writer<W>(&self, inner: W) -> RateLimitedWriter<W> {
        RateLimitedWriter::new(inner, self.data.clone())
    }

    /// Whether outbound data is subject to throttling.
    pub fn limits_data(&self) -> bool {
        self.data.is_some()
    }
}

#[async_trait]
impl Component for RateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn impl_stop(&self, _will_reload: bool) -> Result<(), Error> {
        for bucket in [&self.connections, &self.requests, &self.data]
            .into_iter()
            .flatten()
        {
            bucket.deny_all();
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("connections", &self.connections.is_some())
            .field("requests", &self.requests.is_some())
            .field("data", &self.data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketTuning;
    use crate::limit::TimeUnit;

    fn limiter(requests: Option<BucketTuning>) -> RateLimiter {
        RateLimiter::new(
            "limiter",
            &RateLimiterConfig {
                connections: None,
                requests,
                data: None,
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn missing_bucket_admits_everything() {
        let limiter = limiter(None);
        for _ in 0..1000 {
            assert!(limiter.check_connection().await);
            assert!(limiter.check_request().await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_denies_queued_requests() {
        let limiter = Arc::new(limiter(Some(BucketTuning {
            max_burst_size: 1,
            flow_rate: 1.0,
            time_unit: TimeUnit::Minute,
            max_queue_size: Some(10),
            max_queue_grant_size: None,
        })));
        assert!(limiter.check_request().await);

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_request().await })
        };
        tokio::task::yield_now().await;

        limiter.impl_stop(false).await.unwrap();
        assert!(!queued.await.unwrap());
        assert!(!limiter.check_request().await);
    }
}
