use crate::error::{Error, Result};
use log::{debug, warn};
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// The three standard channels of a launched process.
pub(crate) struct ProcessIo {
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
}

/// Owns the external process. Shared between the pipeline (termination) and
/// the drainers (exit detection).
pub(crate) struct ProcessHandle {
    child: Mutex<Child>,
    pid: u32,
}

impl ProcessHandle {
    pub(crate) fn spawn(binary: &Path, args: &[OsString]) -> Result<(ProcessHandle, ProcessIo)> {
        debug!("Execute {} {:?}", binary.display(), args);
        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so teardown also reaches children holding the pipes
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|source| Error::Launch {
                binary: binary.to_path_buf(),
                source,
            })?;

        let io = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => ProcessIo { stdin, stdout, stderr },
            (stdin, stdout, _) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::MissingStdio(if stdin.is_none() {
                    "stdin"
                } else if stdout.is_none() {
                    "stdout"
                } else {
                    "stderr"
                }));
            }
        };

        let pid = child.id();
        Ok((
            ProcessHandle {
                child: Mutex::new(child),
                pid,
            },
            io,
        ))
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.lock_child().try_wait()
    }

    /// Asks the process group to exit, forcing it after `grace`, and reaps the
    /// process. Whatever is left of the group is killed afterwards, which closes
    /// every remaining copy of the pipes.
    pub(crate) fn terminate(&self, grace: Duration) -> Option<ExitStatus> {
        let mut child = self.lock_child();
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => self.end_child(&mut child, grace),
        };
        self.signal_group(Signal::Kill);
        status
    }

    fn end_child(&self, child: &mut Child, grace: Duration) -> Option<ExitStatus> {
        if !grace.is_zero() && self.signal_group(Signal::Term) {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => return Some(status),
                    Ok(None) => std::thread::sleep(TERMINATE_POLL_INTERVAL),
                    Err(e) => {
                        warn!("Polling subprocess {} failed: {e}", self.pid);
                        break;
                    }
                }
            }
            debug!("Subprocess {} ignored termination request, killing", self.pid);
        }

        self.signal_group(Signal::Kill);
        if let Err(e) = child.kill() {
            // InvalidInput means it already exited
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("Killing subprocess {} failed: {e}", self.pid);
            }
        }
        match child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Reaping subprocess {} failed: {e}", self.pid);
                None
            }
        }
    }

    /// Returns `true` if the signal was delivered to at least one process.
    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) -> bool {
        let Ok(pgid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        let signal = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill has no memory-safety preconditions. The group was created
        // for this child and the caller holds the child lock.
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret != 0 {
            let e = io::Error::last_os_error();
            // ESRCH: the whole group is gone
            if e.raw_os_error() != Some(libc::ESRCH) {
                debug!("Signal {signal} to process group {} failed: {e}", self.pid);
            }
        }
        ret == 0
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) -> bool {
        false
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
