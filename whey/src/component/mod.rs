//! The supervised component lifecycle.
//!
//! Every long-running element (endpoints, services, applications, log
//! sinks) implements [`Component`] and is driven through one state
//! machine: `uninitialized -> initialized -> running -> stopped`. A
//! [`Supervised`] wrapper serializes transitions and makes each phase
//! idempotent; the [`ComponentTree`] orders phases across the whole
//! system and implements in-place reload.

mod registry;
mod threadlet;
mod tree;

pub use registry::AppRegistry;
pub use threadlet::{StopSignal, Threadlet};
pub use tree::{ComponentTree, Environment, TreeEvent};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::Error;

/// One lifecycle-managed entity.
///
/// The `impl_*` methods hold the component's own behavior and are only ever
/// called through [`Supervised`], which guarantees they run at most once
/// per phase and never concurrently. `impl_init` is sensing only (read
/// files, validate references); side effects that accept work belong in
/// `impl_start`.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn impl_init(&self, is_reload: bool) -> Result<(), Error> {
        let _ = is_reload;
        Ok(())
    }

    async fn impl_start(&self, is_reload: bool) -> Result<(), Error> {
        let _ = is_reload;
        Ok(())
    }

    async fn impl_stop(&self, will_reload: bool) -> Result<(), Error> {
        let _ = will_reload;
        Ok(())
    }
}

/// Lifecycle phase of a [`Supervised`] component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Wraps a [`Component`] with the serialized, idempotent state machine.
pub struct Supervised {
    component: Arc<dyn Component>,
    phase: tokio::sync::Mutex<Phase>,
}

impl Supervised {
    pub fn new(component: Arc<dyn Component>) -> Self {
        Self {
            component,
            phase: tokio::sync::Mutex::new(Phase::Uninitialized),
        }
    }

    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.lock().await
    }

    pub async fn init(&self, is_reload: bool) -> Result<(), Error> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Uninitialized => {
                debug!(component = self.component.name(), "init");
                self.component.impl_init(is_reload).await?;
                *phase = Phase::Initialized;
                Ok(())
            }
            Phase::Initialized => Ok(()),
            other => Err(Error::lifecycle(format!(
                "cannot init {} while {:?}",
                self.component.name(),
                other
            ))),
        }
    }

    pub async fn start(&self, is_reload: bool) -> Result<(), Error> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Initialized => {
                debug!(component = self.component.name(), "start");
                self.component.impl_start(is_reload).await?;
                *phase = Phase::Running;
                Ok(())
            }
            Phase::Running => Ok(()),
            other => Err(Error::lifecycle(format!(
                "cannot start {} while {:?}",
                self.component.name(),
                other
            ))),
        }
    }

    /// Stops the component. A component that never started transitions
    /// straight to `stopped` without its `impl_stop` being called; stopping
    /// an already-stopped component is a no-op.
    pub async fn stop(&self, will_reload: bool) -> Result<(), Error> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Running => {
                debug!(component = self.component.name(), will_reload, "stop");
                self.component.impl_stop(will_reload).await?;
                *phase = Phase::Stopped;
                Ok(())
            }
            Phase::Stopped => Ok(()),
            Phase::Uninitialized | Phase::Initialized => {
                *phase = Phase::Stopped;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Supervised {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervised")
            .field("name", &self.component.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inits: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inits: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Component for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn impl_init(&self, _is_reload: bool) -> Result<(), Error> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn impl_start(&self, _is_reload: bool) -> Result<(), Error> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn impl_stop(&self, _will_reload: bool) -> Result<(), Error> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn phases_run_once_each() {
        let component = Counting::new();
        let supervised = Supervised::new(component.clone());

        supervised.init(false).await.unwrap();
        supervised.init(false).await.unwrap();
        supervised.start(false).await.unwrap();
        supervised.start(false).await.unwrap();
        supervised.stop(false).await.unwrap();
        supervised.stop(false).await.unwrap();

        assert_eq!(component.inits.load(Ordering::SeqCst), 1);
        assert_eq!(component.starts.load(Ordering::SeqCst), 1);
        assert_eq!(component.stops.load(Ordering::SeqCst), 1);
        assert_eq!(supervised.phase().await, Phase::Stopped);
    }

    #[tokio::test]
    async fn start_requires_init() {
        let supervised = Supervised::new(Counting::new());
        assert!(supervised.start(false).await.is_err());
    }

    #[tokio::test]
    async fn stop_before_start_skips_impl() {
        let component = Counting::new();
        let supervised = Supervised::new(component.clone());
        supervised.init(false).await.unwrap();
        supervised.stop(false).await.unwrap();
        assert_eq!(component.stops.load(Ordering::SeqCst), 0);
        assert_eq!(supervised.phase().await, Phase::Stopped);
    }
}
