use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Error;

/// A cooperative background task owned by a component.
///
/// The component spawns its main future with [`start`](Self::start); the
/// future polls [`StopSignal`] at its suspension points. [`stop`](Self::stop)
/// raises the flag and resolves only after the main future has returned.
pub struct Threadlet {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Threadlet {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            handle: Mutex::new(None),
        }
    }

    /// The stop signal to hand into the main future.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop.subscribe(),
        }
    }

    /// Spawns the main future. Starting an already-running threadlet is a
    /// lifecycle error.
    pub fn start<F>(&self, main: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.lock();
        if handle.is_some() {
            return Err(Error::lifecycle("threadlet already running"));
        }
        self.stop.send_replace(false);
        *handle = Some(tokio::spawn(main));
        Ok(())
    }

    /// Whether a stop has been requested.
    pub fn should_stop(&self) -> bool {
        *self.stop.borrow()
    }

    /// Raises the stop flag without waiting.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Raises the stop flag and waits for the main future to return. A
    /// main future that panicked surfaces here as a lifecycle error, so
    /// the owning component's `stop` propagates it to the supervisor.
    pub async fn stop(&self) -> Result<(), Error> {
        self.stop.send_replace(true);
        let handle = self.lock().take();
        match handle {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(()) => Ok(()),
                Err(error) if error.is_cancelled() => Ok(()),
                Err(error) => Err(Error::lifecycle(format!(
                    "background task panicked: {error}"
                ))),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Threadlet {
    fn default() -> Self {
        Self::new()
    }
}

/// The main future's view of its threadlet: poll for, wait on, or race
/// against the stop request.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn should_stop(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when a stop is requested (immediately if it already was).
    pub async fn when_stop_requested(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the threadlet is gone; treat as a stop.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Runs a future, abandoning it if a stop is requested first. Pending
    /// sleeps wake immediately on stop.
    pub async fn race<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            out = fut => Some(out),
            _ = self.when_stop_requested() => None,
        }
    }
}
