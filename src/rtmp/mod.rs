//! The **RTMP** module publishes a live H.264 byte stream to an RTMP endpoint by
//! piping it into an external FFmpeg process (`-f h264 -i pipe:0 -c:v copy -f flv`).
//! FFmpeg does the FLV muxing and the RTMP handshake; this crate only keeps it fed.
//!
//! ## Key Components
//!
//! - `RtmpOutput`: The FFmpeg argument list for one destination URL
//! - `FfmpegRtmpUploader`: A `SubprocessPipeline` that logs FFmpeg's output
//! - `UploadBuilder` / `UploadHandle`: Upload a recorded file at a live pace
//!
//! ## Backpressure Management
//!
//! | State | Entered when | Behavior |
//! |-------|--------------|----------|
//! | Normal | queued < capacity | Every chunk enqueued |
//! | Shedding | queued ≥ capacity (8MB default) | New chunks dropped |
//! | Normal again | queued < threshold (1MB default) | Enqueueing resumes |
//!
//! The producer never blocks on FFmpeg or the network. A stalled connection
//! costs at most `capacity` bytes of memory and a gap in the stream.
//!
//! # Example
//!
//! ```rust,ignore
//! // Live source: push chunks as they are produced
//! let uploader = FfmpegRtmpUploader::new();
//! uploader.start(
//!     "/usr/bin/ffmpeg",
//!     &RtmpOutput::new("rtmp://localhost/live/stream1"),
//!     None,
//!     BufferLimits::default(),
//! )?;
//! while let Some(chunk) = encoder.next_chunk() {
//!     uploader.send_video(chunk);
//! }
//! uploader.stop();
//!
//! // Recorded file: one chunk every 100 ms
//! let handle = UploadBuilder::new()
//!     .ffmpeg("/usr/bin/ffmpeg")
//!     .url("rtmp://localhost/live/stream1")
//!     .input_file("video.h264")
//!     .start()?;
//! handle.wait()?;
//! ```
//!
//! **Feature Flag**: Only available when the `rtmp` feature is enabled.

pub mod ffmpeg_args;
pub mod rtmp_uploader;
