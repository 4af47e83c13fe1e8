use crate::core::pipeline::ErrorCallback;
use crate::error::PipelineError;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};

/// Single funnel for worker failures of one session.
///
/// The first error outside of shutdown reaches the callback and marks the
/// session failed; every later error, and every error seen once shutdown has
/// begun, is only logged.
pub(crate) struct ErrorReporter {
    on_error: ErrorCallback,
    shutting_down: AtomicBool,
    failed: AtomicBool,
}

impl ErrorReporter {
    pub(crate) fn new(on_error: Option<ErrorCallback>) -> Self {
        let on_error = on_error.unwrap_or_else(|| {
            Box::new(|e: PipelineError| error!("Subprocess pipeline failed: {e}"))
        });
        Self {
            on_error,
            shutting_down: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Returns `true` if the callback was invoked.
    pub(crate) fn report(&self, e: PipelineError) -> bool {
        if self.is_shutting_down() {
            debug!("Ignoring error during shutdown: {e}");
            return false;
        }
        if self.failed.swap(true, Ordering::AcqRel) {
            debug!("Session already failed, ignoring: {e}");
            return false;
        }
        (self.on_error)(e);
        true
    }
}
