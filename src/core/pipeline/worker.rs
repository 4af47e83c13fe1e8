use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{error, warn};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A named OS thread whose completion can be awaited with a deadline.
pub(crate) struct Worker {
    name: String,
    handle: JoinHandle<()>,
    // Disconnects when the thread body returns or unwinds
    done: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: String, f: F) -> Result<Worker>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_sender, done) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _done = done_sender;
            f();
        });
        match handle {
            Ok(handle) => Ok(Worker { name, handle, done }),
            Err(source) => {
                error!("Thread[{name}] failed to start: {source}");
                Err(Error::ThreadSpawn { name, source })
            }
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on this worker's thread.
    pub(crate) fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    /// Waits up to `timeout` for the thread body to return.
    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        if self.is_current() {
            return false;
        }
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Joins the thread if it finishes within `timeout`, otherwise detaches it.
    ///
    /// Never waits on the calling thread itself. Returns `true` if joined.
    pub(crate) fn release(self, timeout: Duration) -> bool {
        if !self.wait_finished(timeout) {
            if !self.is_current() {
                warn!("Thread[{}] still busy after {timeout:?}, detaching", self.name);
            }
            return false;
        }
        if self.handle.join().is_err() {
            error!("Thread[{}] panicked", self.name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_release_joins_finished_worker() {
        let worker = Worker::spawn("test-worker".to_string(), || {}).unwrap();
        assert_eq!(worker.name(), "test-worker");
        assert!(worker.release(Duration::from_secs(5)));
    }

    #[test]
    fn test_release_detaches_busy_worker() {
        let (sender, receiver) = mpsc::channel::<()>();
        let worker = Worker::spawn("busy-worker".to_string(), move || {
            let _ = receiver.recv();
        })
        .unwrap();
        assert!(!worker.release(Duration::from_millis(20)));
        drop(sender);
    }

    #[test]
    fn test_panicking_worker_counts_as_finished() {
        let worker = Worker::spawn("panicking-worker".to_string(), || panic!("boom")).unwrap();
        assert!(worker.wait_finished(Duration::from_secs(5)));
        assert!(worker.release(Duration::ZERO));
    }

    #[test]
    fn test_worker_does_not_wait_on_itself() {
        let (sender, receiver) = crossbeam_channel::bounded::<Worker>(1);
        let (result_sender, result_receiver) = crossbeam_channel::bounded::<bool>(1);
        let worker = Worker::spawn("self-release".to_string(), move || {
            if let Ok(me) = receiver.recv() {
                let _ = result_sender.send(me.release(Duration::from_secs(5)));
            }
        })
        .unwrap();
        sender.send(worker).unwrap();
        assert_eq!(result_receiver.recv_timeout(Duration::from_secs(5)), Ok(false));
    }
}
