use crate::core::pipeline::error_reporter::ErrorReporter;
use crate::core::pipeline::worker::Worker;
use crate::core::stream_buffer::BoundedStreamBuffer;
use crate::error::{PipelineError, Result};
use crossbeam_channel::Receiver;
use log::debug;
use std::io::Write;
use std::sync::Arc;

/// Starts the thread that moves admitted chunks into the subprocess input.
///
/// Writes can block for as long as the subprocess (or the network behind it)
/// stalls, so they never run on the producer's thread.
pub(crate) fn spawn_chunk_writer<W>(
    name: String,
    buffer: Arc<BoundedStreamBuffer>,
    input: W,
    stop: Receiver<()>,
    reporter: Arc<ErrorReporter>,
) -> Result<Worker>
where
    W: Write + Send + 'static,
{
    Worker::spawn(name, move || {
        let written = run_chunk_writer(&buffer, input, &stop, &reporter);
        debug!("Chunk writer finished after {written} bytes");
    })
}

/// Writes chunks in admission order until stopped or a write fails.
///
/// Dropping `input` on return closes the subprocess's input channel.
pub(crate) fn run_chunk_writer<W: Write>(
    buffer: &BoundedStreamBuffer,
    mut input: W,
    stop: &Receiver<()>,
    reporter: &ErrorReporter,
) -> u64 {
    let mut written = 0u64;
    while let Some(chunk) = buffer.take_or_stop(stop) {
        if reporter.is_shutting_down() {
            break;
        }
        if let Err(e) = input.write_all(&chunk).and_then(|_| input.flush()) {
            reporter.report(PipelineError::Write(e));
            break;
        }
        written += chunk.len() as u64;
    }
    written
}
