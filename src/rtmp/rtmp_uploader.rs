use crate::core::chunk_source::{ChunkSource, SourceEnd, SourceHandle, VideoUploader};
use crate::core::chunk_source::{DEFAULT_CHUNK_SIZE, DEFAULT_READ_INTERVAL};
use crate::core::pipeline::{ErrorCallback, OutputChannel, SubprocessPipeline};
use crate::core::stream_buffer::{Admission, BufferLimits, DEFAULT_CAPACITY, DEFAULT_THRESHOLD};
use crate::error::{PipelineError, UploadError};
use crate::rtmp::ffmpeg_args::RtmpOutput;
use bytes::Bytes;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Publishes an H.264 byte stream to an RTMP endpoint through an FFmpeg process.
pub struct FfmpegRtmpUploader {
    pipeline: SubprocessPipeline,
}

impl Default for FfmpegRtmpUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRtmpUploader {
    pub fn new() -> Self {
        Self::with_pipeline(SubprocessPipeline::new().set_line_callback(log_ffmpeg_line))
    }

    /// Uses a pipeline configured by the caller (callbacks, timeouts).
    pub fn with_pipeline(pipeline: SubprocessPipeline) -> Self {
        Self { pipeline }
    }

    /// Launches `ffmpeg` publishing to `output`.
    ///
    /// Returns `Ok(false)` if an upload is already running.
    pub fn start(
        &self,
        ffmpeg: impl AsRef<Path>,
        output: &RtmpOutput,
        on_error: Option<ErrorCallback>,
        limits: BufferLimits,
    ) -> Result<bool, UploadError> {
        let args = output.to_args()?;
        let started = self.pipeline.start(ffmpeg, args, on_error, limits)?;
        if started {
            info!("Uploading to {}", output.url());
        }
        Ok(started)
    }

    pub fn send_video(&self, chunk: impl Into<Bytes>) -> Option<Admission> {
        self.pipeline.feed(chunk)
    }

    pub fn stop(&self) -> bool {
        self.pipeline.stop()
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_running()
    }

    pub fn pipeline(&self) -> &SubprocessPipeline {
        &self.pipeline
    }
}

impl VideoUploader for FfmpegRtmpUploader {
    fn send_video(&self, chunk: Bytes) -> Option<Admission> {
        self.pipeline.feed(chunk)
    }

    fn is_running(&self) -> bool {
        self.pipeline.is_running()
    }

    fn stop(&self) -> bool {
        self.pipeline.stop()
    }
}

fn log_ffmpeg_line(channel: OutputChannel, line: &str) {
    match channel {
        OutputChannel::Stdout => info!("FFmpeg stdout: {line}"),
        OutputChannel::Stderr => warn!("FFmpeg stderr: {line}"),
    }
}

/// A builder for uploading a recorded H.264 file to an RTMP endpoint at a
/// live pace.
///
/// # Example
///
/// ```rust,ignore
/// let handle = UploadBuilder::new()
///     .ffmpeg("/usr/bin/ffmpeg")
///     .url("rtmp://localhost/live/stream1")
///     .input_file("video.h264")
///     .start()?;
///
/// handle.wait()?;
/// ```
pub struct UploadBuilder {
    ffmpeg: Option<PathBuf>,
    output: Option<RtmpOutput>,
    input_file: Option<PathBuf>,
    limits: BufferLimits,
    chunk_size: usize,
    read_interval: Duration,
    terminate_grace: Option<Duration>,
}

impl Default for UploadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadBuilder {
    /// Defaults: 8 MiB buffer with a 1 MiB resume threshold, 128 000 byte
    /// chunks every 100 ms.
    pub fn new() -> Self {
        Self {
            ffmpeg: None,
            output: None,
            input_file: None,
            limits: BufferLimits::hysteresis(DEFAULT_CAPACITY, DEFAULT_THRESHOLD),
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_interval: DEFAULT_READ_INTERVAL,
            terminate_grace: None,
        }
    }

    /// Path of the FFmpeg executable.
    pub fn ffmpeg(mut self, path: impl AsRef<Path>) -> Self {
        self.ffmpeg = Some(path.as_ref().to_path_buf());
        self
    }

    /// Destination URL with the default FFmpeg arguments.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.output = Some(RtmpOutput::new(url));
        self
    }

    /// Destination with customised FFmpeg arguments. Replaces [`url`](Self::url).
    pub fn output(mut self, output: RtmpOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn input_file(mut self, path: impl AsRef<Path>) -> Self {
        self.input_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn buffer_limits(mut self, limits: BufferLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn read_interval(mut self, read_interval: Duration) -> Self {
        self.read_interval = read_interval;
        self
    }

    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = Some(grace);
        self
    }

    /// Starts FFmpeg and the file reader.
    ///
    /// # Errors
    ///
    /// Returns `UploadError` if:
    /// - `ffmpeg`, `url` or `input_file` is missing
    /// - the input file does not exist
    /// - the URL is empty
    /// - FFmpeg cannot be launched
    pub fn start(self) -> Result<UploadHandle, UploadError> {
        let ffmpeg = self.ffmpeg.ok_or(UploadError::MissingParameter("ffmpeg"))?;
        let output = self.output.ok_or(UploadError::MissingParameter("url"))?;
        let input_file = self
            .input_file
            .ok_or(UploadError::MissingParameter("input_file"))?;

        if !input_file.is_file() {
            return Err(UploadError::InputNotFound { path: input_file });
        }
        // Fail before launching anything
        output.to_args()?;
        let source = ChunkSource::open(&input_file)?
            .set_chunk_size(self.chunk_size)
            .set_read_interval(self.read_interval);

        let mut pipeline = SubprocessPipeline::new().set_line_callback(log_ffmpeg_line);
        if let Some(grace) = self.terminate_grace {
            pipeline = pipeline.set_terminate_grace(grace);
        }
        let uploader = Arc::new(FfmpegRtmpUploader::with_pipeline(pipeline));

        let failure: Arc<Mutex<Option<PipelineError>>> = Arc::default();
        let on_error: ErrorCallback = {
            let uploader = Arc::downgrade(&uploader);
            let failure = failure.clone();
            Box::new(move |e: PipelineError| {
                error!("Upload failed: {e}");
                if let Ok(mut failure) = failure.lock() {
                    failure.get_or_insert(e);
                }
                if let Some(uploader) = uploader.upgrade() {
                    uploader.stop();
                }
            })
        };
        uploader.start(&ffmpeg, &output, Some(on_error), self.limits)?;

        let source = match source.start(uploader.clone()) {
            Ok(source) => source,
            Err(e) => {
                uploader.stop();
                return Err(e.into());
            }
        };

        Ok(UploadHandle {
            uploader,
            source: Some(source),
            failure,
        })
    }
}

/// A running file upload.
///
/// Dropping the handle stops the reader and FFmpeg.
pub struct UploadHandle {
    uploader: Arc<FfmpegRtmpUploader>,
    source: Option<SourceHandle>,
    failure: Arc<Mutex<Option<PipelineError>>>,
}

impl UploadHandle {
    pub fn is_running(&self) -> bool {
        self.uploader.is_running()
    }

    pub fn uploader(&self) -> &FfmpegRtmpUploader {
        &self.uploader
    }

    /// Stops reading and tears FFmpeg down.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Blocks until the whole file was handed to FFmpeg or the upload failed.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the file was read to the end. Otherwise the first error of
    /// the FFmpeg session or the reader.
    pub fn wait(mut self) -> Result<(), UploadError> {
        let end = match self.source.take() {
            Some(source) => source.wait(),
            None => SourceEnd::Cancelled,
        };
        self.uploader.stop();

        if let Some(e) = self.take_failure() {
            return Err(UploadError::Failed(e));
        }
        match end {
            SourceEnd::ReadFailed(e) => Err(UploadError::Io(e)),
            _ => Ok(()),
        }
    }

    fn take_failure(&self) -> Option<PipelineError> {
        match self.failure.lock() {
            Ok(mut failure) => failure.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        self.uploader.stop();
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
