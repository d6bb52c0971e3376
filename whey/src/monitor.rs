//! The memory monitor service.
//!
//! Periodically samples process memory and, if a configured bound stays
//! exceeded for the whole grace period, fires the host exit hook. Between
//! samples it sleeps for the check period, or a shrinking slice of the
//! remaining grace time (floored at one second) while over limit, so the
//! trip fires close to the deadline rather than one full period late.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::component::{Component, StopSignal, Threadlet};
use crate::config::MemoryMonitorConfig;
use crate::problem::ExitHook;
use crate::Error;

/// One memory sample, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    /// Allocated (virtual) memory; checked against `maxHeapBytes`.
    pub heap_bytes: u64,
    /// Resident set; checked against `maxRssBytes`.
    pub rss_bytes: u64,
}

type Sampler = Arc<dyn Fn() -> MemorySample + Send + Sync>;

pub struct MemoryMonitor {
    name: String,
    config: MemoryMonitorConfig,
    exit_hook: ExitHook,
    sampler: Sampler,
    threadlet: Threadlet,
}

impl MemoryMonitor {
    /// A monitor sampling the current process via `sysinfo`.
    pub fn new(name: impl Into<String>, config: MemoryMonitorConfig, exit_hook: ExitHook) -> Self {
        Self::with_sampler(name, config, exit_hook, Arc::new(sysinfo_sample))
    }

    /// A monitor with an injected sampler, for embedders and tests.
    pub fn with_sampler(
        name: impl Into<String>,
        config: MemoryMonitorConfig,
        exit_hook: ExitHook,
        sampler: Sampler,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            exit_hook,
            sampler,
            threadlet: Threadlet::new(),
        }
    }
}

fn sysinfo_sample() -> MemorySample {
    let mut system = sysinfo::System::new();
    system.refresh_all();
    let process = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| system.process(pid).map(|p| (p.virtual_memory(), p.memory())));
    match process {
        Some((heap_bytes, rss_bytes)) => MemorySample {
            heap_bytes,
            rss_bytes,
        },
        None => MemorySample {
            heap_bytes: 0,
            rss_bytes: 0,
        },
    }
}

async fn run(
    name: String,
    config: MemoryMonitorConfig,
    exit_hook: ExitHook,
    sampler: Sampler,
    signal: StopSignal,
) {
    let mut over_since: Option<Instant> = None;
    loop {
        if signal.should_stop() {
            return;
        }
        let sample = sampler();
        let over = config
            .max_rss_bytes
            .is_some_and(|max| sample.rss_bytes > max)
            || config
                .max_heap_bytes
                .is_some_and(|max| sample.heap_bytes > max);

        let sleep_for = if over {
            let since = *over_since.get_or_insert_with(|| {
                warn!(
                    monitor = %name,
                    rss = sample.rss_bytes,
                    heap = sample.heap_bytes,
                    "memory over limit, grace period running"
                );
                Instant::now()
            });
            let elapsed = since.elapsed();
            if elapsed >= config.grace_period {
                error!(
                    monitor = %name,
                    rss = sample.rss_bytes,
                    heap = sample.heap_bytes,
                    "memory over limit past grace period, requesting host exit"
                );
                (exit_hook)();
                return;
            }
            let remaining = config.grace_period - elapsed;
            config
                .check_period
                .min((remaining / 2).max(Duration::from_secs(1)))
        } else {
            if over_since.take().is_some() {
                info!(monitor = %name, "memory back within limits");
            } else {
                debug!(
                    monitor = %name,
                    rss = sample.rss_bytes,
                    heap = sample.heap_bytes,
                    "memory sample"
                );
            }
            config.check_period
        };

        if signal.race(tokio::time::sleep(sleep_for)).await.is_none() {
            return;
        }
    }
}

#[async_trait]
impl Component for MemoryMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn impl_start(&self, _is_reload: bool) -> Result<(), Error> {
        self.threadlet.start(run(
            self.name.clone(),
            self.config.clone(),
            self.exit_hook.clone(),
            self.sampler.clone(),
            self.threadlet.signal(),
        ))
    }

    async fn impl_stop(&self, _will_reload: bool) -> Result<(), Error> {
        self.threadlet.stop().await
    }
}
