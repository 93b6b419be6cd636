pub mod decode;
pub mod features;
pub mod key;
pub mod spectrum;
pub mod tags;
pub mod tempo;
pub mod watchdog;

use crate::cache::{CacheError, ContentCache, content_hash};
use crate::library::TrackLibrary;
use crate::model::{AnalysisMode, ExtractionResult, IngestFile, ProgressEvent};
use crate::pool::queue::{PendingTask, QueueCounts, TaskQueue};
use crate::pool::{PoolError, PoolStats, TaskTimeout, WorkerEvent, WorkerPool};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use decode::{DecodeError, PreparedAudio};
use features::ExtractionSettings;
use key::KeyEstimator;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tempo::TempoEstimator;
use thiserror::Error;
use watchdog::Watchdog;

/// How long the driver waits for a worker event before re-checking
/// deadlines and the watchdog.
const EVENT_TICK: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// What a worker receives for one task.
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub track_id: u64,
    pub file_name: String,
    pub bytes: Arc<[u8]>,
}

/// Turns file bytes into an extraction result. Runs on worker threads and
/// reports coarse progress through `progress(percent, status)`.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        input: &ExtractionInput,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ExtractionResult, AnalyzeError>;
}

/// The production extractor: decode, window, then run the ordered tempo and
/// key strategies.
pub struct FeatureExtractor {
    settings: ExtractionSettings,
    tempo: Vec<Box<dyn TempoEstimator>>,
    key: Vec<Box<dyn KeyEstimator>>,
}

impl FeatureExtractor {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self::with_strategies(settings, tempo::default_strategies(), key::default_strategies())
    }

    pub fn with_strategies(
        settings: ExtractionSettings,
        tempo: Vec<Box<dyn TempoEstimator>>,
        key: Vec<Box<dyn KeyEstimator>>,
    ) -> Self {
        Self {
            settings,
            tempo,
            key,
        }
    }
}

impl Extractor for FeatureExtractor {
    fn extract(
        &self,
        input: &ExtractionInput,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ExtractionResult, AnalyzeError> {
        log::debug!("Analyzing: {}", input.file_name);
        progress(10, "decoding");
        let audio = decode::decode_bytes(Arc::clone(&input.bytes), &input.file_name)?;

        progress(30, "preparing window");
        let prepared = PreparedAudio::new(audio, self.settings.mode);

        Ok(features::extract_from_audio(
            &prepared,
            &self.settings,
            &self.tempo,
            &self.key,
            progress,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerOptions {
    pub workers: usize,
    pub max_restarts: u32,
    pub timeout: TaskTimeout,
    pub watchdog_grace: Duration,
    /// Mode recorded on fallback results built from tags alone
    pub mode: AnalysisMode,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            workers: crate::pool::detect_workers(None),
            max_restarts: 3,
            timeout: TaskTimeout::default(),
            watchdog_grace: Duration::from_secs(30),
            mode: AnalysisMode::default(),
        }
    }
}

/// Outcome counts for one `process_all` run. Cache hits count as completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub cache_hits: usize,
}

/// Long-lived analysis service: cache lookup, queueing, worker dispatch and
/// library updates. Construct once and share by reference.
pub struct Analyzer {
    cache: Arc<ContentCache>,
    library: Arc<RwLock<TrackLibrary>>,
    queue: TaskQueue,
    pool: Mutex<WorkerPool>,
    events: Receiver<WorkerEvent>,
    progress_tx: Option<Sender<ProgressEvent>>,
    watchdog: Mutex<Watchdog>,
    batch: Mutex<BatchSummary>,
    run: Mutex<()>,
    options: AnalyzerOptions,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Analyzer {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        cache: Arc<ContentCache>,
        library: Arc<RwLock<TrackLibrary>>,
        options: AnalyzerOptions,
    ) -> Result<Self, AnalyzeError> {
        let pool = WorkerPool::new(options.workers, extractor, options.max_restarts)?;
        let events = pool.events();
        Ok(Self {
            cache,
            library,
            queue: TaskQueue::new(),
            pool: Mutex::new(pool),
            events,
            progress_tx: None,
            watchdog: Mutex::new(Watchdog::new(options.watchdog_grace)),
            batch: Mutex::new(BatchSummary::default()),
            run: Mutex::new(()),
            options,
        })
    }

    /// Publish progress events on `tx`.
    pub fn with_progress(mut self, tx: Sender<ProgressEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn library(&self) -> Arc<RwLock<TrackLibrary>> {
        Arc::clone(&self.library)
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    fn library_mut(&self) -> RwLockWriteGuard<'_, TrackLibrary> {
        self.library.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, task_id: u64, track_id: u64, percent: u8, status: &str) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(ProgressEvent {
                task_id,
                track_id,
                percent,
                status: status.to_string(),
            });
        }
    }

    /// Admit a file. A cache hit completes the track immediately; otherwise
    /// a task is queued for the next `process_all`. Returns the track id.
    pub fn submit(&self, file: IngestFile) -> u64 {
        let hash = content_hash(&file.bytes);
        let size = file.bytes.len() as u64;
        let track_id = self.library_mut().add_placeholder(
            &file.file_name,
            &file.source,
            file.folder.clone(),
            Some(Arc::clone(&file.bytes)),
        );

        if let Some(cached) = self.cache.get(&hash, size) {
            log::debug!("Cache hit for {}", file.file_name);
            let tags = tags::read_tags(&file.bytes, &file.file_name);
            let merged = features::merge_tags(cached, &tags);
            self.library_mut().complete(track_id, &merged);
            let task_id = self.queue.record_completed(track_id, &file.file_name);
            self.emit(task_id, track_id, 100, "cached");
            let mut batch = relock(&self.batch);
            batch.completed += 1;
            batch.cache_hits += 1;
            return track_id;
        }

        let task_id = self
            .queue
            .enqueue(track_id, &file.file_name, file.bytes, hash);
        self.emit(task_id, track_id, 0, "queued");
        track_id
    }

    /// Drive the queue until nothing is pending or in flight. Completion
    /// order follows the workers, not submission.
    pub fn process_all(&self) -> BatchSummary {
        let _run = relock(&self.run);

        loop {
            self.expire_deadlines(Instant::now());
            self.fill_slots();
            if self.queue.is_idle() {
                break;
            }

            match self.events.recv_timeout(EVENT_TICK) {
                Ok(event) => {
                    self.handle_event(event);
                    while let Ok(event) = self.events.try_recv() {
                        self.handle_event(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                // the pool owns a sender, so this only happens mid-teardown
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.sweep_stalled();
            if relock(&self.pool).healthy() == 0 {
                self.fail_stranded();
            }
        }

        // free contexts whose stale results already arrived
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        self.sweep_stalled();

        let summary = std::mem::take(&mut *relock(&self.batch));
        log::info!(
            "Batch done: {} completed ({} cached), {} failed",
            summary.completed,
            summary.cache_hits,
            summary.failed
        );
        summary
    }

    fn fill_slots(&self) {
        let mut pool = relock(&self.pool);
        while pool.available() > 0 {
            let Some(task) = self.queue.pop_pending() else {
                break;
            };
            let input = ExtractionInput {
                track_id: task.track_id,
                file_name: task.file_name.clone(),
                bytes: Arc::clone(&task.bytes),
            };
            let deadline = Instant::now() + self.options.timeout.for_size(task.bytes.len());
            match pool.dispatch(task.task_id, input) {
                Ok(context) => {
                    let (task_id, track_id) = (task.task_id, task.track_id);
                    if self.queue.start(task, context, deadline) {
                        self.emit(task_id, track_id, 5, "dispatched");
                    } else {
                        // cancelled between pop and start; nothing would ever free the slot
                        pool.abandon(context, task_id, "task cancelled before start");
                    }
                }
                Err(e) => {
                    log::debug!("Dispatch of task {} deferred: {e}", task.task_id);
                    self.queue.requeue_front(task);
                    break;
                }
            }
        }
    }

    fn handle_event(&self, event: WorkerEvent) {
        relock(&self.pool).handle_event(&event);

        match event {
            WorkerEvent::Progress {
                task_id,
                percent,
                status,
                ..
            } => {
                if self.queue.set_progress(task_id, percent) {
                    if let Some(item) = self.queue.get(task_id) {
                        self.emit(task_id, item.track_id, item.progress, &status);
                    }
                }
            }
            WorkerEvent::Finished {
                task_id, outcome, ..
            } => {
                let Some(flight) = self.queue.take_in_flight(task_id) else {
                    log::debug!("Dropping result for untracked task {task_id}");
                    return;
                };
                match outcome {
                    Ok(result) => self.resolve_result(&flight.task, result),
                    Err(msg) => {
                        self.resolve_failure(&flight.task, format!("Extraction failed: {msg}"))
                    }
                }
            }
            WorkerEvent::Crashed {
                task_id, message, ..
            } => {
                let Some(flight) = self.queue.take_in_flight(task_id) else {
                    log::debug!("Dropping crash report for untracked task {task_id}");
                    return;
                };
                self.mark_failed(&flight.task, format!("Worker crashed: {message}"));
            }
        }
    }

    fn expire_deadlines(&self, now: Instant) {
        for task_id in self.queue.expired(now) {
            let Some(flight) = self.queue.take_in_flight(task_id) else {
                continue;
            };
            let limit = self.options.timeout.for_size(flight.task.bytes.len());
            // the stuck thread is abandoned; its eventual result no longer matches
            relock(&self.pool).abandon(flight.context, task_id, "task timed out");
            self.resolve_failure(
                &flight.task,
                format!("Timed out after {}s", limit.as_secs()),
            );
        }
    }

    fn resolve_result(&self, task: &PendingTask, result: ExtractionResult) {
        if result.is_valid() {
            if let Err(e) = self.cache.put(
                &task.content_hash,
                task.bytes.len() as u64,
                &task.file_name,
                &result,
            ) {
                log::warn!("Could not cache result for {}: {e}", task.file_name);
            }
        }

        let tags = tags::read_tags(&task.bytes, &task.file_name);
        let merged = features::merge_tags(result, &tags);
        if merged.is_valid() {
            self.mark_completed(task, &merged, "completed");
        } else {
            self.mark_failed(
                task,
                format!(
                    "Invalid analysis result (bpm {:.1}, key {})",
                    merged.bpm, merged.key
                ),
            );
        }
    }

    /// Extraction failures and timeouts degrade to the placeholder result;
    /// tags can still make that usable.
    fn resolve_failure(&self, task: &PendingTask, reason: String) {
        let tags = tags::read_tags(&task.bytes, &task.file_name);
        let fallback =
            features::merge_tags(ExtractionResult::placeholder(self.options.mode), &tags);
        if fallback.is_valid() {
            log::warn!("{}: {reason}; using tagged values", task.file_name);
            self.mark_completed(task, &fallback, "completed from tags");
        } else {
            self.mark_failed(task, reason);
        }
    }

    fn mark_completed(&self, task: &PendingTask, result: &ExtractionResult, status: &str) {
        let applied = self.library_mut().complete(task.track_id, result);
        self.queue.complete(task.task_id);
        if !applied {
            log::debug!("{} was removed before its result landed", task.file_name);
            return;
        }
        relock(&self.batch).completed += 1;
        self.emit(task.task_id, task.track_id, 100, status);
    }

    fn mark_failed(&self, task: &PendingTask, reason: String) {
        let applied = self.library_mut().fail(task.track_id, &reason);
        self.queue.fail(task.task_id, reason.clone());
        if !applied {
            log::debug!("{} was removed before it failed", task.file_name);
            return;
        }
        log::warn!("{}: {reason}", task.file_name);
        relock(&self.batch).failed += 1;
        self.emit(task.task_id, task.track_id, 100, "failed");
    }

    /// Every context is unhealthy, so nothing pending can ever run.
    fn fail_stranded(&self) {
        while let Some(task) = self.queue.pop_pending() {
            self.mark_failed(&task, "No healthy worker contexts left".to_string());
        }
    }

    /// Force-fail tracks left analyzing with no task behind them. Returns
    /// their ids.
    pub fn sweep_stalled(&self) -> Vec<u64> {
        let active = self.queue.active_track_ids();
        let resolved = {
            let mut dog = relock(&self.watchdog);
            let mut library = self.library_mut();
            dog.sweep(&mut library, &active, Instant::now())
        };
        relock(&self.batch).failed += resolved.len();
        for &track_id in &resolved {
            // no task backs these tracks
            self.emit(0, track_id, 100, "failed");
        }
        resolved
    }

    /// Drop all queued and in-flight work and remove the affected tracks.
    /// Running extractions finish in the background and are discarded.
    pub fn cancel_all(&self) -> usize {
        let cleared = self.queue.clear();
        {
            // free the contexts now instead of waiting on whatever they run
            let mut pool = relock(&self.pool);
            for &(context, task_id) in &cleared.running {
                pool.abandon(context, task_id, "task cancelled");
            }
        }
        let mut ids = cleared.track_ids;
        let mut library = self.library_mut();
        ids.extend(library.analyzing_ids());
        ids.sort_unstable();
        ids.dedup();
        let removed = library.remove_many(&ids);
        log::info!("Cancelled analysis of {removed} tracks");
        removed
    }

    pub fn pool_stats(&self) -> PoolStats {
        let queued = self.queue.counts().pending;
        relock(&self.pool).stats(queued)
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.queue.counts()
    }
}
