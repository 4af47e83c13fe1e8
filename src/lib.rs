//! Push a live byte stream through an external process without ever blocking
//! the producer.
//!
//! The producer hands chunks to a [`SubprocessPipeline`]. A bounded buffer with
//! hysteresis decides per chunk whether to keep it; a dedicated writer thread
//! moves kept chunks into the process's stdin, and two more threads drain its
//! stdout and stderr. [`SubprocessPipeline::stop`] tears the whole session down
//! even when the process has stopped reading.
//!
//! With the `rtmp` feature (default) the [`rtmp`] module wires this up to FFmpeg
//! for RTMP publishing.

pub mod core;
pub mod error;
#[cfg(feature = "rtmp")]
pub mod rtmp;

pub use crate::core::chunk_source::{ChunkSource, SourceEnd, SourceHandle, VideoUploader};
pub use crate::core::pipeline::{
    DrainErrorCallback, DroppingCallback, ErrorCallback, LineCallback, OutputChannel,
    PipelineState, SubprocessPipeline,
};
pub use crate::core::stream_buffer::{
    Admission, BoundedStreamBuffer, BufferLimits, BufferStats, ShedState, SheddingPolicy,
};
pub use crate::error::{BufferConfigError, Error, PipelineError, Result, UploadError};
#[cfg(feature = "rtmp")]
pub use crate::rtmp::ffmpeg_args::RtmpOutput;
#[cfg(feature = "rtmp")]
pub use crate::rtmp::rtmp_uploader::{FfmpegRtmpUploader, UploadBuilder, UploadHandle};
