use crate::core::pipeline::error_reporter::ErrorReporter;
use crate::core::pipeline::process::ProcessHandle;
use crate::core::pipeline::worker::Worker;
use crate::core::pipeline::{DrainErrorCallback, LineCallback};
use crate::error::{PipelineError, Result};
use log::{debug, info};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EXIT_POLL_ATTEMPTS: u32 = 50;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Diagnostic output channel of the subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl OutputChannel {
    pub fn name(&self) -> &'static str {
        match self {
            OutputChannel::Stdout => "stdout",
            OutputChannel::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a drainer loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainEnd {
    Eof,
    Failed,
    Shutdown,
}

/// Detects the subprocess exiting on its own once all its output channels close.
pub(crate) struct ExitWatch {
    process: Arc<ProcessHandle>,
    open_channels: AtomicUsize,
}

impl ExitWatch {
    pub(crate) fn new(process: Arc<ProcessHandle>, channels: usize) -> Self {
        Self {
            process,
            open_channels: AtomicUsize::new(channels),
        }
    }

    /// Called once per channel; the last close checks the exit status.
    pub(crate) fn channel_closed(&self, reporter: &ErrorReporter) {
        if self.open_channels.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        for _ in 0..EXIT_POLL_ATTEMPTS {
            if reporter.is_shutting_down() {
                return;
            }
            // The lock is released before reporting so the callback may stop the pipeline
            let status = self.process.try_wait();
            match status {
                Ok(Some(status)) if status.success() => {
                    info!("Subprocess {} exited normally", self.process.pid());
                    return;
                }
                Ok(Some(status)) => {
                    reporter.report(PipelineError::AbnormalExit(status));
                    return;
                }
                Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    reporter.report(PipelineError::ExitStatusUnavailable(e));
                    return;
                }
            }
        }
        debug!(
            "Subprocess {} closed its output but is still running",
            self.process.pid()
        );
    }
}

pub(crate) fn spawn_output_drainer<R>(
    name: String,
    channel: OutputChannel,
    output: R,
    on_line: LineCallback,
    on_drain_error: DrainErrorCallback,
    reporter: Arc<ErrorReporter>,
    exit_watch: Option<Arc<ExitWatch>>,
) -> Result<Worker>
where
    R: Read + Send + 'static,
{
    Worker::spawn(name, move || {
        let end = run_output_drainer(channel, output, &on_line, &on_drain_error, &reporter);
        debug!("Subprocess {channel} drainer finished: {end:?}");
        if end != DrainEnd::Shutdown {
            if let Some(exit_watch) = exit_watch {
                exit_watch.channel_closed(&reporter);
            }
        }
    })
}

/// Forwards each line of `output` until end-of-stream.
///
/// Lines are split on `\n`, stripped of trailing `\r`/`\n` and decoded lossily,
/// since encoders print progress with carriage returns and raw bytes.
pub(crate) fn run_output_drainer<R: Read>(
    channel: OutputChannel,
    output: R,
    on_line: &LineCallback,
    on_drain_error: &DrainErrorCallback,
    reporter: &ErrorReporter,
) -> DrainEnd {
    let mut reader = BufReader::new(output);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return DrainEnd::Eof,
            Ok(_) => {
                if reporter.is_shutting_down() {
                    return DrainEnd::Shutdown;
                }
                let text = String::from_utf8_lossy(&line);
                on_line(channel, text.trim_end_matches(&['\r', '\n'][..]));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if reporter.is_shutting_down() {
                    debug!("Reading subprocess {channel} stopped by shutdown: {e}");
                    return DrainEnd::Shutdown;
                }
                on_drain_error(channel, &e);
                return DrainEnd::Failed;
            }
        }
    }
}
