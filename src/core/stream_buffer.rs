// src/core/stream_buffer.rs - Bounded chunk buffer between a producer and the subprocess writer
//
// Core features:
// - Hysteresis shedding (Normal/Shedding) with separate enter and leave levels
// - Optional clear-backlog policy that gives up old data to stop falling behind
// - Size accounting covers in-flight chunks: added at admission, removed at hand-off
// - Admission never blocks and never fails; overload shows up as `Admission::Dropped`

use crate::error::BufferConfigError;
use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 8 * 1024 * 1024; // 8MB
pub const DEFAULT_THRESHOLD: usize = 1024 * 1024; // 1MB

/// Invoked with `true` when shedding starts and `false` when it stops.
pub type DroppingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// How the buffer sheds load once `capacity` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheddingPolicy {
    /// Reject new chunks until the buffer has drained below `threshold`.
    Hysteresis { threshold: usize },
    /// Discard everything still queued and keep only the newest chunk.
    /// The state stays `Normal` and the dropping callback never fires.
    ClearBacklog,
}

/// Capacity and shedding policy of one buffer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    capacity: usize,
    policy: SheddingPolicy,
}

impl BufferLimits {
    pub fn hysteresis(capacity: usize, threshold: usize) -> Self {
        Self {
            capacity,
            policy: SheddingPolicy::Hysteresis { threshold },
        }
    }

    pub fn clear_backlog(capacity: usize) -> Self {
        Self {
            capacity,
            policy: SheddingPolicy::ClearBacklog,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> SheddingPolicy {
        self.policy
    }

    /// Checks `threshold <= capacity`. Negative sizes cannot be expressed.
    pub fn validate(&self) -> Result<(), BufferConfigError> {
        match self.policy {
            SheddingPolicy::Hysteresis { threshold } if threshold > self.capacity => {
                Err(BufferConfigError::ThresholdExceedsCapacity {
                    threshold,
                    capacity: self.capacity,
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self::hysteresis(DEFAULT_CAPACITY, DEFAULT_THRESHOLD)
    }
}

/// Shedding state of a hysteresis buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedState {
    Normal,   // every chunk is admitted
    Shedding, // chunks are rejected until the buffer drains below threshold
}

impl ShedState {
    /// Applies one admission to the state machine.
    ///
    /// `pre_size` is the buffered size observed before the chunk was counted.
    /// Returns the next state and whether the chunk is admitted.
    pub fn on_admission(self, pre_size: usize, capacity: usize, threshold: usize) -> (ShedState, bool) {
        let state = if pre_size >= capacity {
            ShedState::Shedding
        } else {
            self
        };

        match state {
            ShedState::Normal => (ShedState::Normal, true),
            ShedState::Shedding if pre_size >= threshold => (ShedState::Shedding, false),
            // Drained below threshold while shedding
            ShedState::Shedding => (ShedState::Normal, true),
        }
    }

    pub fn is_shedding(self) -> bool {
        self == ShedState::Shedding
    }
}

/// Outcome of offering a chunk to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued for the writer
    Admitted,
    /// Queued for the writer after the whole backlog was discarded
    Flushed { discarded_bytes: usize },
    /// Shed; the chunk will never reach the writer
    Dropped,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Dropped)
    }
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    /// Bytes admitted but not yet handed to the writer
    pub queued_bytes: usize,
    pub queued_chunks: usize,
    pub dropped_chunks: u64,
    pub dropped_bytes: u64,
    pub state: ShedState,
}

/// Thread-safe chunk buffer that decouples a producer from a slow consumer.
///
/// The producer calls [`admit`](Self::admit); the consumer takes chunks with
/// [`take_or_stop`](Self::take_or_stop) or the `try_`/`timeout` variants. Chunks
/// come out strictly in admission order. Admission is safe from several
/// producers at once: the size is tracked atomically and shedding transitions
/// are applied with compare-and-swap, so each one is logged exactly once.
pub struct BoundedStreamBuffer {
    limits: BufferLimits,
    size: AtomicUsize,
    state: AtomicCell<ShedState>,
    sender: Sender<Bytes>,
    receiver: Receiver<Bytes>,
    dropped_chunks: AtomicU64,
    dropped_bytes: AtomicU64,
    on_dropping_changed: Option<DroppingCallback>,
}

impl BoundedStreamBuffer {
    pub fn new(limits: BufferLimits) -> Result<Self, BufferConfigError> {
        Self::with_callback(limits, None)
    }

    pub fn with_callback(
        limits: BufferLimits,
        on_dropping_changed: Option<DroppingCallback>,
    ) -> Result<Self, BufferConfigError> {
        limits.validate()?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        Ok(Self {
            limits,
            size: AtomicUsize::new(0),
            state: AtomicCell::new(ShedState::Normal),
            sender,
            receiver,
            dropped_chunks: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
            on_dropping_changed,
        })
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Offers a chunk. Never blocks.
    pub fn admit(&self, chunk: Bytes) -> Admission {
        let len = chunk.len();
        let pre_size = self.size.fetch_add(len, Ordering::AcqRel);

        match self.limits.policy {
            SheddingPolicy::Hysteresis { threshold } => {
                if !self.apply_hysteresis(pre_size, threshold) {
                    self.size.fetch_sub(len, Ordering::AcqRel);
                    self.record_drop(1, len);
                    return Admission::Dropped;
                }
                self.enqueue(chunk);
                Admission::Admitted
            }
            SheddingPolicy::ClearBacklog => {
                if pre_size < self.limits.capacity {
                    self.enqueue(chunk);
                    return Admission::Admitted;
                }
                let (chunks, discarded_bytes) = self.clear_backlog();
                warn!("{discarded_bytes} bytes were dropped ({chunks} chunks)");
                self.enqueue(chunk);
                Admission::Flushed { discarded_bytes }
            }
        }
    }

    /// Takes the oldest chunk, waiting until one is admitted or `stop` fires.
    ///
    /// `stop` fires when it receives a message or all of its senders are dropped.
    pub fn take_or_stop(&self, stop: &Receiver<()>) -> Option<Bytes> {
        select! {
            recv(self.receiver) -> chunk => chunk.ok().map(|chunk| self.hand_off(chunk)),
            recv(stop) -> _ => None,
        }
    }

    pub fn try_take(&self) -> Option<Bytes> {
        self.receiver.try_recv().ok().map(|chunk| self.hand_off(chunk))
    }

    pub fn take_timeout(&self, timeout: Duration) -> Option<Bytes> {
        match self.receiver.recv_timeout(timeout) {
            Ok(chunk) => Some(self.hand_off(chunk)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Bytes admitted and not yet handed off
    pub fn current_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ShedState {
        self.state.load()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            queued_bytes: self.current_size(),
            queued_chunks: self.receiver.len(),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    /// Runs the state machine for one admission and reports whether the chunk is kept.
    fn apply_hysteresis(&self, pre_size: usize, threshold: usize) -> bool {
        let mut current = self.state.load();
        loop {
            let (next, admitted) = current.on_admission(pre_size, self.limits.capacity, threshold);
            if next == current {
                return admitted;
            }
            match self.state.compare_exchange(current, next) {
                Ok(_) => {
                    self.report_transition(next, pre_size);
                    return admitted;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn report_transition(&self, state: ShedState, pre_size: usize) {
        match state {
            ShedState::Shedding => warn!(
                "Buffer reached {pre_size} bytes (capacity {}), dropping chunks",
                self.limits.capacity
            ),
            ShedState::Normal => info!("Buffer drained to {pre_size} bytes, accepting chunks again"),
        }
        if let Some(callback) = &self.on_dropping_changed {
            callback(state.is_shedding());
        }
    }

    fn enqueue(&self, chunk: Bytes) {
        // The buffer holds its own receiver, so sending cannot fail
        let _ = self.sender.send(chunk);
    }

    /// Removes every chunk queued at the time of the call.
    fn clear_backlog(&self) -> (usize, usize) {
        let mut chunks = 0;
        let mut bytes = 0;
        for _ in 0..self.receiver.len() {
            let Ok(chunk) = self.receiver.try_recv() else {
                break;
            };
            self.size.fetch_sub(chunk.len(), Ordering::AcqRel);
            chunks += 1;
            bytes += chunk.len();
        }
        self.record_drop(chunks, bytes);
        (chunks, bytes)
    }

    fn hand_off(&self, chunk: Bytes) -> Bytes {
        self.size.fetch_sub(chunk.len(), Ordering::AcqRel);
        chunk
    }

    fn record_drop(&self, chunks: usize, bytes: usize) {
        self.dropped_chunks.fetch_add(chunks as u64, Ordering::Relaxed);
        self.dropped_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for BoundedStreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedStreamBuffer")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish()
    }
}
