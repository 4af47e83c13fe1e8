use crate::core::pipeline::SubprocessPipeline;
use crate::core::stream_buffer::Admission;
use crate::error::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One second of 1000 kbit/s video.
pub const DEFAULT_CHUNK_SIZE: usize = (1_000 << 10) / 8;
pub const DEFAULT_READ_INTERVAL: Duration = Duration::from_millis(100);

/// Anything that accepts encoded video chunks without blocking the caller.
pub trait VideoUploader: Send + Sync {
    /// Returns `None` once the uploader no longer accepts data.
    fn send_video(&self, chunk: Bytes) -> Option<Admission>;

    fn is_running(&self) -> bool;

    /// Returns `false` if the uploader was already stopped.
    fn stop(&self) -> bool;
}

impl VideoUploader for SubprocessPipeline {
    fn send_video(&self, chunk: Bytes) -> Option<Admission> {
        self.feed(chunk)
    }

    fn is_running(&self) -> bool {
        SubprocessPipeline::is_running(self)
    }

    fn stop(&self) -> bool {
        SubprocessPipeline::stop(self)
    }
}

/// Why a [`ChunkSource`] stopped reading.
#[derive(Debug)]
pub enum SourceEnd {
    /// The reader reached end-of-stream; the uploader was stopped.
    Exhausted,
    /// The uploader stopped or refused a chunk.
    UploaderStopped,
    /// Reading failed; the uploader was stopped.
    ReadFailed(io::Error),
    /// [`SourceHandle::stop`] was called.
    Cancelled,
    /// The reading thread panicked.
    Panicked,
}

/// Chunks handed to the uploader, split by admission outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ChunkTally {
    sent: u64,
    shed: u64,
}

impl ChunkTally {
    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Dropped => self.shed += 1,
            Admission::Admitted | Admission::Flushed { .. } => self.sent += 1,
        }
    }
}

/// Reads fixed-size chunks at a fixed pace and hands them to an uploader.
pub struct ChunkSource<R> {
    reader: R,
    chunk_size: usize,
    read_interval: Duration,
}

impl ChunkSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ChunkSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_interval: DEFAULT_READ_INTERVAL,
        }
    }

    /// Bytes per chunk. The last chunk of a stream may be shorter. Zero is
    /// treated as one.
    pub fn set_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Pause between two chunks.
    pub fn set_read_interval(mut self, read_interval: Duration) -> Self {
        self.read_interval = read_interval;
        self
    }

    /// Feeds `uploader` on the calling thread until one of the [`SourceEnd`]
    /// conditions. A message on (or disconnect of) `cancel` ends the loop at
    /// the next pause.
    pub fn run<U>(&mut self, uploader: &U, cancel: &Receiver<()>) -> SourceEnd
    where
        U: VideoUploader + ?Sized,
    {
        let mut tally = ChunkTally::default();
        let end = loop {
            if !uploader.is_running() {
                break SourceEnd::UploaderStopped;
            }

            let chunk = match self.read_chunk() {
                Ok(chunk) if chunk.is_empty() => {
                    uploader.stop();
                    break SourceEnd::Exhausted;
                }
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Reading video source failed: {e}");
                    uploader.stop();
                    break SourceEnd::ReadFailed(e);
                }
            };

            match uploader.send_video(chunk) {
                None => break SourceEnd::UploaderStopped,
                Some(admission) => tally.record(admission),
            }

            match cancel.recv_timeout(self.read_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break SourceEnd::Cancelled,
            }
        };
        info!(
            "Video source ended ({end:?}): {} chunks sent, {} shed",
            tally.sent, tally.shed
        );
        end
    }

    fn read_chunk(&mut self) -> io::Result<Bytes> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut chunk)?;
        Ok(Bytes::from(chunk))
    }
}

impl<R: Read + Send + 'static> ChunkSource<R> {
    /// Runs the source on its own thread.
    pub fn start<U>(mut self, uploader: Arc<U>) -> Result<SourceHandle>
    where
        U: VideoUploader + ?Sized + 'static,
    {
        let (cancel_sender, cancel) = crossbeam_channel::bounded::<()>(1);
        let name = "chunk-source".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(uploader.as_ref(), &cancel))
            .map_err(|source| Error::ThreadSpawn { name, source })?;
        Ok(SourceHandle {
            cancel: Some(cancel_sender),
            handle: Some(handle),
        })
    }
}

/// Controls a [`ChunkSource`] running on its own thread.
pub struct SourceHandle {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<SourceEnd>>,
}

impl SourceHandle {
    /// Asks the source to end at its next pause. Does not stop the uploader.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Blocks until the source ends.
    pub fn wait(mut self) -> SourceEnd {
        self.join()
    }

    fn join(&mut self) -> SourceEnd {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(end)) => end,
            Some(Err(_)) => {
                warn!("Video source thread panicked");
                SourceEnd::Panicked
            }
            None => SourceEnd::Cancelled,
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            let end = self.join();
            debug!("Video source handle dropped: {end:?}");
        }
    }
}
