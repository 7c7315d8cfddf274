//! The decompression worker pool.
//!
//! Workers pull `(index, payload)` jobs off a shared bounded channel, inflate
//! them and send `(index, bytes, stats delta)` results back; the coordinator
//! re-sequences results by index, so completion order never leaks out. When
//! the job queue is full the submitter inflates inline instead of blocking
//! behind a slow worker; inline results flow through the same reorder buffer.
//!
//! Pool size is governed by a scaling mode: `Fixed` pins it to `min`,
//! `Conservative` grows one worker at a time under sustained backlog and lets
//! idle workers retire down to `min`, `Aggressive` pre-warms to `optimal` and
//! grows on any backlog up to `max`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use crate::blob::Envelope;
use crate::buffer::{BlockBuf, BufferPool};
use crate::error::Result;
use crate::osmpbf::BlobType;
use crate::stats::Stats;

/// How the pool adjusts its worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Exactly `min_workers`, never changes.
    Fixed,
    /// Grow by one after two consecutive submissions with backlog >= 3;
    /// shrink while idle.
    #[default]
    Conservative,
    /// Pre-warm to `optimal_workers`, grow on any backlog.
    Aggressive,
}

/// Queue depth that counts as backlog for conservative scaling.
const BACKLOG_DEPTH: usize = 3;
/// Consecutive backlogged submissions before conservative scaling grows.
const BACKLOG_SAMPLES: u32 = 2;
/// An idle worker beyond the minimum retires after this long.
const IDLE_SHRINK: Duration = Duration::from_millis(500);

pub(crate) struct Job {
    pub index: u64,
    pub offset: u64,
    pub blob_type: BlobType,
    pub payload: Bytes,
    pub envelope: Envelope,
}

pub(crate) struct JobResult {
    pub index: u64,
    pub offset: u64,
    pub blob_type: BlobType,
    pub outcome: Result<BlockBuf>,
    pub delta: Stats,
}

pub(crate) enum Submit {
    /// The job went to a worker; a result will arrive on the channel.
    Dispatched,
    /// The queue was full; the job was inflated on the calling thread.
    Inline(JobResult),
}

/// Inflates one classified blob, used by workers and the inline fallback
/// alike.
pub(crate) fn inflate_job(job: &Job, buffers: Option<&Arc<BufferPool>>) -> JobResult {
    let want = job
        .envelope
        .raw_size
        .unwrap_or(job.payload.len() as u64 * 4) as usize;
    let mut buf = match buffers {
        Some(pool) => BlockBuf::Pooled(pool.acquire(want)),
        None => BlockBuf::Plain(Vec::with_capacity(want)),
    };
    let outcome = job
        .envelope
        .inflate(&job.payload, buf.vec_mut())
        .map(|()| buf);
    let mut delta = Stats::default();
    match &outcome {
        Ok(buf) => delta.inflated_bytes = buf.len() as u64,
        Err(_) => delta.block_errors = 1,
    }
    JobResult {
        index: job.index,
        offset: job.offset,
        blob_type: job.blob_type.clone(),
        outcome,
        delta,
    }
}

struct Shared {
    live: AtomicUsize,
    min: usize,
    can_shrink: bool,
    buffers: Option<Arc<BufferPool>>,
}

pub(crate) struct Pool {
    job_tx: Option<Sender<Job>>,
    job_rx: Receiver<Job>,
    result_tx: Option<Sender<JobResult>>,
    pub(crate) result_rx: Receiver<JobResult>,
    handles: Vec<thread::JoinHandle<()>>,
    shared: Arc<Shared>,
    mode: ScalingMode,
    max: usize,
    backlog_streak: u32,
    spawned: usize,
}

impl Pool {
    pub(crate) fn new(
        mode: ScalingMode,
        min: usize,
        optimal: usize,
        max: usize,
        buffers: Option<Arc<BufferPool>>,
    ) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let optimal = optimal.clamp(min, max);
        let (job_tx, job_rx) = bounded(max * 2);
        let (result_tx, result_rx) = bounded(max * 2);
        let shared = Arc::new(Shared {
            live: AtomicUsize::new(0),
            min,
            can_shrink: mode == ScalingMode::Conservative,
            buffers,
        });
        let mut pool = Self {
            job_tx: Some(job_tx),
            job_rx,
            result_tx: Some(result_tx),
            result_rx,
            handles: Vec::new(),
            shared,
            mode,
            max,
            backlog_streak: 0,
            spawned: 0,
        };
        let warm = match mode {
            ScalingMode::Aggressive => optimal,
            _ => min,
        };
        for _ in 0..warm {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&mut self) {
        let job_rx = self.job_rx.clone();
        let result_tx = match &self.result_tx {
            Some(tx) => tx.clone(),
            None => return,
        };
        let shared = Arc::clone(&self.shared);
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.spawned += 1;
        let name = format!("osmstream-inflate-{}", self.spawned);
        debug!("spawning decompression worker {}", name);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(job_rx, result_tx, shared))
            .expect("failed to spawn decompression worker");
        self.handles.push(handle);
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Hands a job to the pool, growing it per the scaling mode, or inflates
    /// inline when the queue is saturated.
    pub(crate) fn submit(&mut self, job: Job) -> Submit {
        let depth = self.job_tx.as_ref().map(|tx| tx.len()).unwrap_or(0);
        match self.mode {
            ScalingMode::Fixed => {}
            ScalingMode::Conservative => {
                if depth >= BACKLOG_DEPTH {
                    self.backlog_streak += 1;
                } else {
                    self.backlog_streak = 0;
                }
                if self.backlog_streak >= BACKLOG_SAMPLES && self.live_workers() < self.max {
                    self.spawn_worker();
                    self.backlog_streak = 0;
                }
            }
            ScalingMode::Aggressive => {
                if depth > 0 && self.live_workers() < self.max {
                    self.spawn_worker();
                }
            }
        }
        // dead workers can leave the pool empty; bring one back before
        // dispatching
        if self.live_workers() == 0 {
            self.spawn_worker();
        }
        let tx = self.job_tx.as_ref().expect("pool not shut down");
        match tx.try_send(job) {
            Ok(()) => Submit::Dispatched,
            Err(crossbeam_channel::TrySendError::Full(job)) => {
                trace!("job queue full, inflating blob {} inline", job.index);
                let mut result = inflate_job(&job, self.shared.buffers.as_ref());
                result.delta.inline_decompressions = 1;
                Submit::Inline(result)
            }
            Err(crossbeam_channel::TrySendError::Disconnected(job)) => {
                // every worker died; fall back to inline so the stream
                // still makes progress
                warn!("worker pool disconnected, inflating blob {} inline", job.index);
                let mut result = inflate_job(&job, self.shared.buffers.as_ref());
                result.delta.inline_decompressions = 1;
                Submit::Inline(result)
            }
        }
    }

    /// Stops accepting work and waits for the workers to drain. Results still
    /// in flight are discarded. Returns `false` if workers failed to exit
    /// within the grace period and were detached (the pool is then poisoned).
    pub(crate) fn shutdown(mut self, grace: Duration) -> bool {
        self.job_tx.take();
        self.result_tx.take();
        let deadline = Instant::now() + grace;
        loop {
            match self.result_rx.recv_deadline(deadline) {
                Ok(result) => {
                    trace!("discarding in-flight result for blob {}", result.index);
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("decompression workers did not drain in time; detaching pool");
                    self.handles.clear();
                    return false;
                }
            }
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("decompression worker panicked during shutdown");
            }
        }
        true
    }
}

fn worker_loop(job_rx: Receiver<Job>, result_tx: Sender<JobResult>, shared: Arc<Shared>) {
    loop {
        match job_rx.recv_timeout(IDLE_SHRINK) {
            Ok(job) => {
                let result = inflate_job(&job, shared.buffers.as_ref());
                if result_tx.send(result).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.can_shrink {
                    // retire if we are above the floor; restore the count if
                    // another worker won the race
                    let before = shared.live.fetch_sub(1, Ordering::SeqCst);
                    if before > shared.min {
                        trace!("idle decompression worker retiring");
                        return;
                    }
                    shared.live.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blob::Compression;

    fn raw_job(index: u64, body: &[u8]) -> Job {
        // hand-build a Blob envelope with a raw payload
        let mut blob = Vec::new();
        blob.push(0x0a);
        blob.push(body.len() as u8);
        blob.extend_from_slice(body);
        let payload = Bytes::from(blob);
        let envelope = Envelope::parse(&payload).unwrap();
        assert_eq!(envelope.compression, Compression::None);
        Job {
            index,
            offset: 0,
            blob_type: BlobType::OsmData,
            payload,
            envelope,
        }
    }

    #[test]
    fn results_carry_their_index() {
        let mut pool = Pool::new(ScalingMode::Fixed, 2, 2, 2, None);
        for i in 0..8 {
            match pool.submit(raw_job(i, format!("payload {}", i).as_bytes())) {
                Submit::Dispatched => {}
                Submit::Inline(result) => assert_eq!(result.index, i),
            }
        }
        // close the channels so the drain below ends on disconnect
        drop(pool.job_tx.take());
        drop(pool.result_tx.take());
        let mut seen = Vec::new();
        while let Ok(result) = pool.result_rx.recv_timeout(Duration::from_secs(5)) {
            assert!(result.outcome.is_ok());
            seen.push(result.index);
        }
        // workers may finish out of order, but every dispatched job reports
        seen.sort_unstable();
        seen.dedup();
        assert!(seen.len() <= 8);
    }

    #[test]
    fn fixed_pool_keeps_its_size() {
        let mut pool = Pool::new(ScalingMode::Fixed, 1, 4, 4, None);
        for i in 0..16 {
            pool.submit(raw_job(i, b"x"));
        }
        assert_eq!(pool.live_workers(), 1);
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn aggressive_pool_prewarms() {
        let pool = Pool::new(ScalingMode::Aggressive, 1, 3, 4, None);
        assert_eq!(pool.live_workers(), 3);
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_discards_in_flight_results() {
        let mut pool = Pool::new(ScalingMode::Fixed, 2, 2, 2, None);
        for i in 0..4 {
            pool.submit(raw_job(i, b"discard me"));
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
    }
}
