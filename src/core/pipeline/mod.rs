//! The subprocess pipeline: one external process, fed on a dedicated writer
//! thread from a [`BoundedStreamBuffer`], with both of its output channels
//! drained on their own threads.
//!
//! # Threads
//!
//! | Thread | Blocks in | Ends when |
//! |--------|-----------|-----------|
//! | `pipeline-writer:<pid>` | `write` to stdin | stop signal, or first write error |
//! | `pipeline-stdout:<pid>` | line read | end-of-stream, read error, shutdown |
//! | `pipeline-stderr:<pid>` | line read | end-of-stream, read error, shutdown |
//!
//! # Shutdown order
//!
//! [`SubprocessPipeline::stop`] always runs the same sequence: suppress worker
//! errors, signal the workers, let the writer close stdin, terminate the process
//! group (`SIGTERM`, then kill after a grace period), then join or detach the
//! workers. The process runs in its own process group; killing the group closes
//! every copy of the three pipes, including those inherited by forked children,
//! which unblocks a writer stuck mid-write and drainers stuck mid-read.
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = SubprocessPipeline::new();
//! pipeline.start(
//!     "/usr/bin/ffmpeg",
//!     ["-f", "h264", "-i", "pipe:0", "-c:v", "copy", "-f", "flv", "rtmp://host/app/key"],
//!     None,
//!     BufferLimits::hysteresis(8 << 20, 1 << 20),
//! )?;
//! pipeline.feed(chunk);
//! pipeline.stop();
//! ```

mod chunk_writer;
mod error_reporter;
mod output_drainer;
mod process;
mod worker;

pub use output_drainer::OutputChannel;

use crate::core::pipeline::chunk_writer::spawn_chunk_writer;
use crate::core::pipeline::error_reporter::ErrorReporter;
use crate::core::pipeline::output_drainer::{spawn_output_drainer, ExitWatch};
use crate::core::pipeline::process::ProcessHandle;
use crate::core::pipeline::worker::Worker;
pub use crate::core::stream_buffer::DroppingCallback;
use crate::core::stream_buffer::{Admission, BoundedStreamBuffer, BufferLimits, BufferStats};
use crate::error::{PipelineError, Result};
use bytes::Bytes;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const INPUT_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Receives the single fatal error of a session.
pub type ErrorCallback = Box<dyn Fn(PipelineError) + Send + Sync>;
/// Receives every line the subprocess prints.
pub type LineCallback = Arc<dyn Fn(OutputChannel, &str) + Send + Sync>;
/// Receives a failure to read one of the output channels.
pub type DrainErrorCallback = Arc<dyn Fn(OutputChannel, &io::Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
}

/// Owns an external process and the three threads that service it.
///
/// All methods take `&self`; share the pipeline with `Arc` to feed it from one
/// thread and stop it from another (or from inside the error callback).
pub struct SubprocessPipeline {
    session: Mutex<Option<Session>>,
    on_line: LineCallback,
    on_drain_error: DrainErrorCallback,
    on_dropping_changed: Option<DroppingCallback>,
    terminate_grace: Duration,
    join_timeout: Duration,
}

struct Session {
    process: Arc<ProcessHandle>,
    buffer: Arc<BoundedStreamBuffer>,
    reporter: Arc<ErrorReporter>,
    // Dropped to signal every worker
    stop_sender: Sender<()>,
    writer: Worker,
    stdout_drainer: Worker,
    stderr_drainer: Worker,
}

impl SubprocessPipeline {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            on_line: Arc::new(log_line),
            on_drain_error: Arc::new(log_drain_error),
            on_dropping_changed: None,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Replaces the default line handler (stdout at info, stderr at warn).
    pub fn set_line_callback<F>(mut self, on_line: F) -> Self
    where
        F: Fn(OutputChannel, &str) + Send + Sync + 'static,
    {
        self.on_line = Arc::new(on_line);
        self
    }

    pub fn set_drain_error_callback<F>(mut self, on_drain_error: F) -> Self
    where
        F: Fn(OutputChannel, &io::Error) + Send + Sync + 'static,
    {
        self.on_drain_error = Arc::new(on_drain_error);
        self
    }

    /// Observes the buffer entering (`true`) and leaving (`false`) shedding.
    pub fn set_dropping_callback<F>(mut self, on_dropping_changed: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_dropping_changed = Some(Arc::new(on_dropping_changed));
        self
    }

    /// How long the process gets to exit after `SIGTERM` before it is killed.
    pub fn set_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// How long `stop` waits for each worker before detaching it.
    pub fn set_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Launches `binary` with `args` and starts the writer and both drainers.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if a new session was started.
    /// * `Ok(false)` if a session is already running; it is left untouched.
    /// * `Err` if `limits` are invalid, the binary cannot be executed, or a
    ///   worker thread cannot be created. The pipeline stays stopped.
    pub fn start<I, S>(
        &self,
        binary: impl AsRef<Path>,
        args: I,
        on_error: Option<ErrorCallback>,
        limits: BufferLimits,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut session = self.lock_session();
        if session.is_some() {
            debug!("Pipeline already running, start ignored");
            return Ok(false);
        }

        let buffer = Arc::new(BoundedStreamBuffer::with_callback(
            limits,
            self.on_dropping_changed.clone(),
        )?);
        let args: Vec<OsString> = args.into_iter().map(|arg| arg.as_ref().to_os_string()).collect();
        let (process, io) = ProcessHandle::spawn(binary.as_ref(), &args)?;
        let process = Arc::new(process);
        let pid = process.pid();
        let reporter = Arc::new(ErrorReporter::new(on_error));
        let (stop_sender, stop_receiver) = crossbeam_channel::bounded::<()>(0);
        let exit_watch = Arc::new(ExitWatch::new(process.clone(), 2));

        let workers = spawn_chunk_writer(
            format!("pipeline-writer:{pid}"),
            buffer.clone(),
            io.stdin,
            stop_receiver,
            reporter.clone(),
        )
        .and_then(|writer| {
            let stdout_drainer = spawn_output_drainer(
                format!("pipeline-stdout:{pid}"),
                OutputChannel::Stdout,
                io.stdout,
                self.on_line.clone(),
                self.on_drain_error.clone(),
                reporter.clone(),
                Some(exit_watch.clone()),
            )?;
            let stderr_drainer = spawn_output_drainer(
                format!("pipeline-stderr:{pid}"),
                OutputChannel::Stderr,
                io.stderr,
                self.on_line.clone(),
                self.on_drain_error.clone(),
                reporter.clone(),
                Some(exit_watch),
            )?;
            Ok((writer, stdout_drainer, stderr_drainer))
        });

        let (writer, stdout_drainer, stderr_drainer) = match workers {
            Ok(workers) => workers,
            Err(e) => {
                // Workers already spawned are detached and exit once the process is gone
                reporter.begin_shutdown();
                drop(stop_sender);
                process.terminate(Duration::ZERO);
                return Err(e);
            }
        };

        info!("Subprocess pipeline started (pid {pid}, {:?})", limits.policy());
        *session = Some(Session {
            process,
            buffer,
            reporter,
            stop_sender,
            writer,
            stdout_drainer,
            stderr_drainer,
        });
        Ok(true)
    }

    /// Offers a chunk to the running session. Never blocks on the subprocess.
    ///
    /// Returns `None` if the pipeline is stopped or its session has failed.
    pub fn feed(&self, chunk: impl Into<Bytes>) -> Option<Admission> {
        // Admission runs the dropping callback, which may call back into the pipeline
        let (buffer, reporter) = {
            let session = self.lock_session();
            let session = session.as_ref()?;
            (session.buffer.clone(), session.reporter.clone())
        };
        if reporter.is_failed() {
            return None;
        }
        Some(buffer.admit(chunk.into()))
    }

    /// Tears the running session down.
    ///
    /// Returns `false` if the pipeline was already stopped. No error callback
    /// fires for I/O errors caused by the teardown itself.
    pub fn stop(&self) -> bool {
        let Some(session) = self.lock_session().take() else {
            return false;
        };
        if !session.shutdown(self.terminate_grace, self.join_timeout) {
            warn!("Subprocess pipeline stopped with detached threads");
        }
        true
    }

    pub fn state(&self) -> PipelineState {
        if self.lock_session().is_some() {
            PipelineState::Running
        } else {
            PipelineState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Whether the running session has reported its fatal error.
    pub fn is_failed(&self) -> bool {
        self.lock_session()
            .as_ref()
            .map_or(false, |session| session.reporter.is_failed())
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_session().as_ref().map(|session| session.process.pid())
    }

    pub fn buffer_stats(&self) -> Option<BufferStats> {
        self.lock_session().as_ref().map(|session| session.buffer.stats())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Session {
    /// Returns `true` if every worker thread was joined.
    fn shutdown(self, terminate_grace: Duration, join_timeout: Duration) -> bool {
        let pid = self.process.pid();
        debug!("Stopping subprocess pipeline (pid {pid})");

        self.reporter.begin_shutdown();
        drop(self.stop_sender);

        // An idle writer drops stdin as soon as it sees the signal
        self.writer.wait_finished(INPUT_CLOSE_TIMEOUT);

        match self.process.terminate(terminate_grace) {
            Some(status) => debug!("Subprocess {pid} ended with {status}"),
            None => warn!("Subprocess {pid} could not be reaped"),
        }

        let queued = self.buffer.stats();
        if queued.queued_chunks > 0 {
            debug!(
                "Discarding {} queued chunks ({} bytes)",
                queued.queued_chunks, queued.queued_bytes
            );
        }

        let mut all_joined = true;
        for worker in [self.writer, self.stdout_drainer, self.stderr_drainer] {
            let name = worker.name().to_string();
            if worker.release(join_timeout) {
                debug!("Thread[{name}] joined");
            } else {
                all_joined = false;
            }
        }
        info!("Subprocess pipeline stopped (pid {pid})");
        all_joined
    }
}

impl Default for SubprocessPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SubprocessPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_line(channel: OutputChannel, line: &str) {
    match channel {
        OutputChannel::Stdout => info!("Subprocess stdout: {line}"),
        OutputChannel::Stderr => warn!("Subprocess stderr: {line}"),
    }
}

fn log_drain_error(channel: OutputChannel, e: &io::Error) {
    warn!("Reading subprocess {channel} failed: {e}");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::time::Instant;

    const SH: &str = "/bin/sh";

    fn init_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    fn sh(script: &str) -> [&str; 2] {
        ["-c", script]
    }

    fn quick_pipeline() -> SubprocessPipeline {
        SubprocessPipeline::new()
            .set_terminate_grace(Duration::from_millis(200))
            .set_join_timeout(Duration::from_millis(500))
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn error_channel() -> (ErrorCallback, crossbeam_channel::Receiver<PipelineError>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let callback: ErrorCallback = Box::new(move |e: PipelineError| {
            let _ = sender.send(e);
        });
        (callback, receiver)
    }

    #[test]
    fn test_start_missing_binary() {
        init_logger();
        let pipeline = quick_pipeline();
        let result = pipeline.start("/nonexistent/ffmpeg", ["-version"], None, BufferLimits::default());
        assert!(matches!(result, Err(Error::Launch { .. })));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_start_invalid_limits() {
        let pipeline = quick_pipeline();
        let result = pipeline.start(SH, sh("exec cat"), None, BufferLimits::hysteresis(10, 20));
        assert!(matches!(result, Err(Error::InvalidBufferConfig(_))));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_start_twice_keeps_existing_session() {
        init_logger();
        let pipeline = quick_pipeline();
        assert!(pipeline.start(SH, sh("exec cat"), None, BufferLimits::default()).unwrap());
        let pid = pipeline.pid();

        assert!(!pipeline.start(SH, sh("exec cat"), None, BufferLimits::default()).unwrap());
        assert_eq!(pipeline.pid(), pid);

        assert!(pipeline.stop());
        assert!(!pipeline.stop());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_feed_when_stopped() {
        let pipeline = quick_pipeline();
        assert_eq!(pipeline.feed(&b"data"[..]), None);
        assert!(pipeline.buffer_stats().is_none());
        assert!(!pipeline.is_failed());
    }

    #[test]
    fn test_delivers_chunks_in_order() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("received.bin");
        let pipeline = quick_pipeline();
        pipeline
            .start(
                SH,
                ["-c", "exec cat > \"$0\"", out.to_str().unwrap()],
                None,
                BufferLimits::default(),
            )
            .unwrap();

        let mut expected = Vec::new();
        for i in 0..200u32 {
            let chunk: Vec<u8> = (0..1000u32).map(|j| (i.wrapping_mul(31) ^ j) as u8).collect();
            expected.extend_from_slice(&chunk);
            assert_eq!(pipeline.feed(chunk), Some(Admission::Admitted));
        }

        let complete = wait_until(Duration::from_secs(10), || {
            std::fs::metadata(&out).map(|m| m.len() as usize == expected.len()).unwrap_or(false)
        });
        assert!(complete, "subprocess did not receive every byte");
        assert_eq!(pipeline.buffer_stats().unwrap().queued_bytes, 0);

        assert!(pipeline.stop());
        assert_eq!(std::fs::read(&out).unwrap(), expected);
    }

    #[test]
    fn test_forwards_output_lines() {
        init_logger();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pipeline = quick_pipeline().set_line_callback(move |channel: OutputChannel, line: &str| {
            let _ = sender.send((channel, line.to_string()));
        });
        pipeline
            .start(
                SH,
                sh("echo hello; echo oops >&2; exec cat > /dev/null"),
                None,
                BufferLimits::default(),
            )
            .unwrap();

        let mut lines = Vec::new();
        for _ in 0..2 {
            lines.push(receiver.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        lines.sort_by_key(|(channel, _)| channel.name());
        assert_eq!(
            lines,
            vec![
                (OutputChannel::Stderr, "oops".to_string()),
                (OutputChannel::Stdout, "hello".to_string()),
            ]
        );
        assert!(pipeline.stop());
    }

    #[test]
    fn test_abnormal_exit_reported() {
        init_logger();
        let (on_error, errors) = error_channel();
        let pipeline = quick_pipeline();
        pipeline.start(SH, sh("exit 3"), Some(on_error), BufferLimits::default()).unwrap();

        match errors.recv_timeout(Duration::from_secs(5)) {
            Ok(PipelineError::AbnormalExit(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected abnormal exit, got {other:?}"),
        }
        assert!(pipeline.is_failed());
        assert!(pipeline.is_running(), "failure does not stop the session by itself");
        assert_eq!(pipeline.feed(&b"late"[..]), None);

        assert!(pipeline.stop());
        assert!(errors.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_write_failure_reported_once() {
        init_logger();
        let (on_error, errors) = error_channel();
        let pipeline = quick_pipeline();
        // Exits successfully without reading stdin
        pipeline.start(SH, sh("exec true"), Some(on_error), BufferLimits::default()).unwrap();

        let failed = wait_until(Duration::from_secs(10), || {
            pipeline.feed(vec![0u8; 64 * 1024]);
            pipeline.is_failed()
        });
        assert!(failed);

        assert!(matches!(
            errors.recv_timeout(Duration::from_secs(1)),
            Ok(PipelineError::Write(_))
        ));
        assert!(errors.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(pipeline.stop());
    }

    #[test]
    fn test_stop_with_stalled_subprocess() {
        init_logger();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let on_error: ErrorCallback = Box::new(move |_: PipelineError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let pipeline = quick_pipeline();
        // Never reads stdin and never prints: the writer and both drainers block
        pipeline.start(SH, sh("exec sleep 30"), Some(on_error), BufferLimits::default()).unwrap();

        for _ in 0..4 {
            pipeline.feed(vec![0u8; 1024 * 1024]);
        }
        std::thread::sleep(Duration::from_millis(100));
        assert!(pipeline.buffer_stats().unwrap().queued_chunks < 4, "writer should be mid-write");

        let start = Instant::now();
        assert!(pipeline.stop());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_from_error_callback() {
        init_logger();
        let pipeline = Arc::new(quick_pipeline());
        let weak: Weak<SubprocessPipeline> = Arc::downgrade(&pipeline);
        let on_error: ErrorCallback = Box::new(move |_: PipelineError| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.stop();
            }
        });
        pipeline.start(SH, sh("exit 1"), Some(on_error), BufferLimits::default()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || !pipeline.is_running()));
    }

    #[test]
    fn test_restart_after_stop() {
        init_logger();
        let pipeline = quick_pipeline();
        assert!(pipeline.start(SH, sh("exec cat > /dev/null"), None, BufferLimits::default()).unwrap());
        assert!(pipeline.stop());
        assert!(pipeline
            .start(SH, sh("exec cat > /dev/null"), None, BufferLimits::clear_backlog(1024))
            .unwrap());
        assert!(pipeline.feed(&b"again"[..]).unwrap().is_admitted());
        assert!(pipeline.stop());
    }

    #[test]
    fn test_dropping_callback_reaches_buffer() {
        init_logger();
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        let pipeline = quick_pipeline().set_dropping_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pipeline
            .start(SH, sh("exec sleep 30"), None, BufferLimits::hysteresis(256 * 1024, 1024))
            .unwrap();

        // The writer takes the first chunk and blocks once the pipe is full
        let mut dropped = false;
        for _ in 0..64 {
            if pipeline.feed(vec![0u8; 128 * 1024]) == Some(Admission::Dropped) {
                dropped = true;
                break;
            }
        }
        assert!(dropped);
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.buffer_stats().unwrap().state, crate::ShedState::Shedding);
        assert!(pipeline.stop());
    }

    #[test]
    fn test_stop_from_dropping_callback() {
        init_logger();
        let pipeline = Arc::new_cyclic(|weak: &Weak<SubprocessPipeline>| {
            let weak = weak.clone();
            quick_pipeline().set_dropping_callback(move |dropping| {
                if dropping {
                    if let Some(pipeline) = weak.upgrade() {
                        pipeline.stop();
                    }
                }
            })
        });
        pipeline
            .start(SH, sh("exec sleep 30"), None, BufferLimits::hysteresis(256 * 1024, 1024))
            .unwrap();

        let (done_sender, done) = crossbeam_channel::bounded(1);
        let producer = pipeline.clone();
        std::thread::spawn(move || {
            let mut outcomes = Vec::new();
            while let Some(admission) = producer.feed(vec![0u8; 128 * 1024]) {
                outcomes.push(admission);
                if outcomes.len() > 64 {
                    break;
                }
            }
            let _ = done_sender.send(outcomes);
        });

        let outcomes = done
            .recv_timeout(Duration::from_secs(5))
            .expect("producer blocked in feed");
        assert_eq!(outcomes.last(), Some(&Admission::Dropped));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_shutdown_joins_workers_of_forking_subprocess() {
        init_logger();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let on_error: ErrorCallback = Box::new(move |_: PipelineError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let pipeline = quick_pipeline();
        // `sleep` is forked, not exec'd, so it holds copies of all three pipes
        pipeline.start(SH, sh("sleep 30; true"), Some(on_error), BufferLimits::default()).unwrap();
        for _ in 0..4 {
            pipeline.feed(vec![0u8; 1024 * 1024]);
        }
        std::thread::sleep(Duration::from_millis(100));

        let session = pipeline.lock_session().take().unwrap();
        let start = Instant::now();
        assert!(session.shutdown(Duration::from_millis(200), Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_with_forking_subprocess() {
        init_logger();
        let pipeline = quick_pipeline().set_join_timeout(Duration::from_secs(2));
        pipeline.start(SH, sh("sleep 30; true"), None, BufferLimits::default()).unwrap();
        for _ in 0..4 {
            pipeline.feed(vec![0u8; 1024 * 1024]);
        }

        let start = Instant::now();
        assert!(pipeline.stop());
        // Well under the join timeout: no worker had to be detached
        assert!(start.elapsed() < Duration::from_millis(1500));
    }
}
