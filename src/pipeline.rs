//! The pipeline coordinator: framing → classification → decompression →
//! decoded blocks, surfaced as an ordered event stream.
//!
//! The coordinator runs on the caller's thread and drives all stages; only
//! decompression may run on pool workers. Results are re-sequenced by blob
//! index before anything reaches the consumer, so the event stream is
//! deterministic for a given input and configuration regardless of worker
//! timing. Per-block failures become `Event::Error` entries in their slot of
//! the sequence; only framing-level failures end the stream early.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::blob::Envelope;
use crate::block::DecodedBlock;
use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::osmpbf::{BlobRecord, FramingReader};
use crate::parallel::{inflate_job, Job, JobResult, Pool, ScalingMode, Submit};
use crate::source::ChunkSource;
use crate::stats::Stats;

/// How long `shutdown` waits for workers before detaching them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pipeline tuning knobs. The defaults stream inline (no worker threads)
/// with a 256 KiB read chunk.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stop cleanly after this many blobs.
    pub max_blob_limit: Option<u64>,
    /// Stop requesting source chunks once this many bytes were read.
    pub read_threshold: Option<u64>,
    /// Emit per-stage diagnostics to the logger.
    pub verbose: bool,
    /// Decompress on a worker pool instead of the coordinator thread.
    pub decompression_workers: bool,
    pub min_workers: usize,
    pub optimal_workers: usize,
    pub max_workers: usize,
    pub scaling_mode: ScalingMode,
    /// Source read chunk size in bytes.
    pub high_water_mark: usize,
    /// Reuse decompression buffers across blocks.
    pub buffer_pool: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_blob_limit: None,
            read_threshold: None,
            verbose: false,
            decompression_workers: false,
            min_workers: 1,
            optimal_workers: 2,
            max_workers: 4,
            scaling_mode: ScalingMode::default(),
            high_water_mark: 256 * 1024,
            buffer_pool: false,
        }
    }
}

impl Config {
    pub fn max_blob_limit(mut self, limit: u64) -> Self {
        self.max_blob_limit = Some(limit);
        self
    }

    pub fn read_threshold(mut self, threshold: u64) -> Self {
        self.read_threshold = Some(threshold);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn decompression_workers(mut self, enabled: bool) -> Self {
        self.decompression_workers = enabled;
        self
    }

    pub fn workers(mut self, min: usize, optimal: usize, max: usize) -> Self {
        self.min_workers = min;
        self.optimal_workers = optimal;
        self.max_workers = max;
        self
    }

    pub fn scaling_mode(mut self, mode: ScalingMode) -> Self {
        self.scaling_mode = mode;
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn buffer_pool(mut self, enabled: bool) -> Self {
        self.buffer_pool = enabled;
        self
    }
}

/// What the pipeline tells its consumer.
#[derive(Debug)]
pub enum Event {
    /// First event of every run.
    Start {
        descriptor: Option<String>,
        size: Option<u64>,
    },
    /// Bytes pulled from the source so far. Emitted whenever the count
    /// moved; not aligned to block boundaries.
    Progress { bytes_read: u64 },
    /// A decoded block, strictly in file order.
    BlobReady(DecodedBlock),
    /// A failed blob (`index` set) or a fatal stream failure (`index`
    /// empty, the stream ends after it).
    Error { index: Option<u64>, error: Error },
    /// Last event of every run, emitted exactly once.
    End { elapsed: Duration, blobs: u64 },
}

/// Cancels the pipeline from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// The streaming pipeline. Iterate it to drive all stages.
pub struct Pipeline<S> {
    framing: FramingReader<S>,
    pool: Option<Pool>,
    buffers: Option<Arc<BufferPool>>,
    reorder: BTreeMap<u64, JobResult>,
    next_emit: u64,
    ingested: u64,
    in_flight: usize,
    max_in_flight: usize,
    pending: VecDeque<Event>,
    cancel: Arc<AtomicBool>,
    started: bool,
    ended: bool,
    source_done: bool,
    started_at: Instant,
    stats: Stats,
    last_progress: u64,
    verbose: bool,
}

impl<S: ChunkSource> Pipeline<S> {
    pub fn new(source: S, config: Config) -> Self {
        let buffers = config.buffer_pool.then(|| Arc::new(BufferPool::default()));
        let pool = config.decompression_workers.then(|| {
            Pool::new(
                config.scaling_mode,
                config.min_workers,
                config.optimal_workers,
                config.max_workers,
                buffers.clone(),
            )
        });
        let max_in_flight = config.max_workers.max(config.min_workers).max(1) + 1;
        let framing = FramingReader::new(source, config.high_water_mark)
            .with_max_blobs(config.max_blob_limit)
            .with_read_threshold(config.read_threshold);
        Self {
            framing,
            pool,
            buffers,
            reorder: BTreeMap::new(),
            next_emit: 0,
            ingested: 0,
            in_flight: 0,
            max_in_flight,
            pending: VecDeque::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            started: false,
            ended: false,
            source_done: false,
            started_at: Instant::now(),
            stats: Stats::default(),
            last_progress: 0,
            verbose: config.verbose,
        }
    }

    /// A handle that cancels this pipeline from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Requests teardown; the next iteration emits the final `End`.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Counters accumulated so far; complete once `End` was seen.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Narrows the event stream to decoded blocks.
    pub fn blocks(self) -> Blocks<S> {
        Blocks { pipeline: self }
    }

    fn queue_progress(&mut self) {
        let bytes_read = self.framing.bytes_read();
        if bytes_read != self.last_progress {
            self.last_progress = bytes_read;
            self.stats.bytes_read = bytes_read;
            self.pending.push_back(Event::Progress { bytes_read });
        }
    }

    fn queue_end(&mut self) {
        self.queue_progress();
        let elapsed = self.started_at.elapsed();
        info!(
            "pipeline finished: {} blobs in {:.3}s",
            self.stats.blobs,
            elapsed.as_secs_f64()
        );
        self.pending.push_back(Event::End {
            elapsed,
            blobs: self.stats.blobs,
        });
        self.ended = true;
    }

    fn finish(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown(SHUTDOWN_GRACE);
        }
        self.queue_end();
    }

    fn teardown_cancelled(&mut self) {
        debug!("pipeline cancelled, tearing down");
        self.framing.close();
        self.reorder.clear();
        self.in_flight = 0;
        self.finish();
    }

    fn fatal(&mut self, error: Error) {
        // hand over every settled in-order block first; only results
        // stranded behind a still-in-flight gap are dropped
        while self.emit_next() {}
        self.pending.push_back(Event::Error { index: None, error });
        self.framing.close();
        self.reorder.clear();
        self.in_flight = 0;
        self.finish();
    }

    /// Turns a framed record into a reorder-buffer entry: dispatched to the
    /// pool, inflated inline, or an immediate per-block error.
    fn ingest(&mut self, record: BlobRecord) {
        self.stats.blobs += 1;
        self.ingested += 1;
        if self.verbose {
            debug!(
                "blob {}: type {}, {} payload bytes",
                record.index,
                record.blob_type.as_str(),
                record.payload.len()
            );
        }
        let envelope = match Envelope::parse(&record.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.stats.block_errors += 1;
                self.reorder.insert(
                    record.index,
                    JobResult {
                        index: record.index,
                        offset: record.offset,
                        blob_type: record.blob_type,
                        outcome: Err(error),
                        delta: Stats::default(),
                    },
                );
                return;
            }
        };
        let job = Job {
            index: record.index,
            offset: record.offset,
            blob_type: record.blob_type,
            payload: record.payload,
            envelope,
        };
        match &mut self.pool {
            Some(pool) => match pool.submit(job) {
                Submit::Dispatched => self.in_flight += 1,
                Submit::Inline(result) => self.settle(result),
            },
            None => {
                let result = inflate_job(&job, self.buffers.as_ref());
                self.settle(result);
            }
        }
    }

    fn settle(&mut self, result: JobResult) {
        self.stats += result.delta;
        // bytes_read is tracked by the framing reader, not the deltas
        self.stats.bytes_read = self.last_progress;
        self.reorder.insert(result.index, result);
    }

    /// Moves the next in-order result out of the reorder buffer into an
    /// event. One block per call: emission points stay a pure function of
    /// the input, not of worker timing.
    fn emit_next(&mut self) -> bool {
        let Some(result) = self.reorder.remove(&self.next_emit) else {
            return false;
        };
        self.next_emit += 1;
        match result.outcome {
            Ok(buf) => {
                self.stats.blocks_decoded += 1;
                self.pending.push_back(Event::BlobReady(DecodedBlock::new(
                    result.index,
                    result.offset,
                    result.blob_type,
                    buf,
                )));
            }
            Err(error) => {
                self.pending.push_back(Event::Error {
                    index: Some(result.index),
                    error,
                });
            }
        }
        true
    }

    /// How far ahead of the emission point records may be framed. The
    /// reorder buffer is bounded by the same window.
    fn window_open(&self) -> bool {
        if self.pool.is_none() {
            // inline inflation completes immediately; stay exactly one
            // record ahead
            self.ingested == self.next_emit
        } else {
            self.ingested < self.next_emit + self.max_in_flight as u64
        }
    }

    /// Advances the pipeline until at least one event is queued.
    fn pump(&mut self) {
        loop {
            // frame records up to the window; the window depends only on
            // what was already emitted, never on worker completion order
            while !self.source_done && self.window_open() {
                match self.framing.next_record() {
                    Ok(Some(record)) => {
                        self.ingest(record);
                        self.queue_progress();
                    }
                    Ok(None) => {
                        self.source_done = true;
                        self.queue_progress();
                    }
                    Err(error) => {
                        self.queue_progress();
                        self.fatal(error);
                        return;
                    }
                }
            }

            if self.emit_next() {
                return;
            }
            if !self.pending.is_empty() {
                return;
            }

            if self.in_flight > 0 {
                let pool = self.pool.as_mut().expect("in-flight jobs imply a pool");
                match pool.result_rx.recv() {
                    Ok(result) => {
                        self.in_flight -= 1;
                        self.settle(result);
                    }
                    Err(_) => {
                        self.in_flight = 0;
                        self.fatal(Error::DecompressionFailed(
                            "worker pool disconnected".into(),
                        ));
                        return;
                    }
                }
                continue;
            }

            if self.source_done {
                // indices are dense, so a buffered result can only be the
                // next one; never stall on it
                if let Some((&index, _)) = self.reorder.iter().next() {
                    self.next_emit = index;
                    continue;
                }
                self.finish();
                return;
            }
        }
    }
}

impl<S: ChunkSource> Iterator for Pipeline<S> {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.ended {
                return None;
            }
            if !self.started {
                self.started = true;
                return Some(Event::Start {
                    descriptor: self.framing.source().descriptor(),
                    size: self.framing.source().size_hint(),
                });
            }
            if self.cancel.load(Ordering::SeqCst) {
                self.teardown_cancelled();
                continue;
            }
            self.pump();
        }
    }
}

impl<S> Drop for Pipeline<S> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown(SHUTDOWN_GRACE);
        }
    }
}

/// Adapter over [`Pipeline`] yielding only decoded blocks and errors.
pub struct Blocks<S> {
    pipeline: Pipeline<S>,
}

impl<S> Blocks<S> {
    pub fn stats(&self) -> &Stats {
        &self.pipeline.stats
    }
}

impl<S: ChunkSource> Iterator for Blocks<S> {
    type Item = Result<DecodedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.pipeline.next()? {
                Event::BlobReady(block) => return Some(Ok(block)),
                Event::Error { error, .. } => return Some(Err(error)),
                _ => {}
            }
        }
    }
}
