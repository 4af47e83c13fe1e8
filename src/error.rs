use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid buffer configuration: {0}")]
    InvalidBufferConfig(#[from] BufferConfigError),

    #[error("Failed to launch {}: {source}", binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Subprocess {0} was not captured")]
    MissingStdio(&'static str),

    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferConfigError {
    #[error("threshold {threshold} exceeds capacity {capacity}")]
    ThresholdExceedsCapacity { threshold: usize, capacity: usize },
}

/// Fatal errors of a running pipeline session.
///
/// These never travel back through `feed` or `stop`; they are delivered once to
/// the session's error callback and mark the session as failed.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Writing chunk to subprocess failed: {0}")]
    Write(#[source] io::Error),

    #[error("Subprocess exited abnormally: {0}")]
    AbnormalExit(ExitStatus),

    #[error("Subprocess exit status unavailable: {0}")]
    ExitStatusUnavailable(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("Destination URL is empty")]
    EmptyUrl,

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] Error),

    #[error("Upload failed: {0}")]
    Failed(#[source] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
