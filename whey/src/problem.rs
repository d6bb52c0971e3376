//! The last-resort handler for problems that escape task boundaries.
//!
//! One [`ProblemHandler`] is constructed before the component tree and
//! passed into it explicitly; there is no global. Fatal problems are
//! recorded, written straight to stderr (the log pipeline itself may be the
//! casualty), held for a short flush delay, and then the host exit hook
//! fires. The hook fires exactly once, no matter how many tasks fail
//! together.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// The host's exit hook. The default process hook exits with status 1.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Upper bound on recorded problems; the record is a short diagnostic
/// ring, not a log.
const MAX_RECORDED_PROBLEMS: usize = 10;

const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(250);

/// One recorded problem.
#[derive(Debug, Clone)]
pub struct Problem {
    pub context: String,
    pub message: String,
    pub at: SystemTime,
}

pub struct ProblemHandler {
    exit_hook: ExitHook,
    flush_delay: Duration,
    problems: Mutex<Vec<Problem>>,
    tripped: AtomicBool,
}

impl ProblemHandler {
    pub fn new(exit_hook: ExitHook) -> Self {
        Self {
            exit_hook,
            flush_delay: DEFAULT_FLUSH_DELAY,
            problems: Mutex::new(Vec::new()),
            tripped: AtomicBool::new(false),
        }
    }

    /// An exit hook that terminates the process with status 1.
    pub fn process_exit_hook() -> ExitHook {
        Arc::new(|| std::process::exit(1))
    }

    pub fn with_flush_delay(mut self, flush_delay: Duration) -> Self {
        self.flush_delay = flush_delay;
        self
    }

    /// Records a problem without treating it as fatal.
    pub fn record(&self, context: impl Into<String>, error: &(dyn fmt::Display + Sync)) {
        let mut problems = self.lock();
        if problems.len() < MAX_RECORDED_PROBLEMS {
            problems.push(Problem {
                context: context.into(),
                message: error.to_string(),
                at: SystemTime::now(),
            });
        }
    }

    /// A copy of the problems recorded so far.
    pub fn snapshot(&self) -> Vec<Problem> {
        self.lock().clone()
    }

    /// Whether the exit hook has fired.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Handles a problem nothing else caught: record, write to stderr,
    /// wait briefly for logs to flush, then fire the exit hook. Only the
    /// first fatal problem trips the hook.
    pub async fn handle_fatal(&self, context: &str, error: &(dyn fmt::Display + Sync)) {
        self.record(context, error);
        eprintln!("fatal problem in {context}: {error}");
        tokio::time::sleep(self.flush_delay).await;
        if !self.tripped.swap(true, Ordering::SeqCst) {
            (self.exit_hook)();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Problem>> {
        self.problems.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProblemHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProblemHandler")
            .field("problems", &self.lock().len())
            .field("tripped", &self.tripped())
            .finish()
    }
}
