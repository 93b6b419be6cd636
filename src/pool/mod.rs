//! Bounded worker pool.
//!
//! Each execution context is one OS thread with its own job channel; all
//! contexts report on a shared event channel. A context runs one job at a
//! time, so the number of executing extractions never exceeds the number
//! of contexts. A panicking extractor takes its thread down with it; the
//! pool respawns the context until it has used up its restart budget, after
//! which the context is marked unhealthy and skipped by dispatch.

pub mod queue;

use crate::analyzer::{ExtractionInput, Extractor};
use crate::model::ExtractionResult;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Hard cap on contexts regardless of machine size.
pub const MAX_WORKERS: usize = 8;
/// Memory budget assumed per context when sizing the pool.
pub const MB_PER_WORKER: u64 = 256;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("No idle healthy context")]
    NoCapacity,
}

/// `clamp(min(cores - 1, memory_mb / 256), 1, 8)`
pub fn recommended_workers(cores: usize, memory_mb: u64) -> usize {
    let by_cores = cores.saturating_sub(1);
    let by_memory = usize::try_from(memory_mb / MB_PER_WORKER).unwrap_or(usize::MAX);
    by_cores.min(by_memory).clamp(1, MAX_WORKERS)
}

/// Apply [`recommended_workers`] to this machine. `memory_ceiling_mb` caps
/// the detected available memory when set.
pub fn detect_workers(memory_ceiling_mb: Option<u64>) -> usize {
    let cores = thread::available_parallelism().map_or(1, |n| n.get());
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let available_mb = sys.available_memory() / (1024 * 1024);
    let memory_mb = match memory_ceiling_mb {
        Some(ceiling) if available_mb > 0 => available_mb.min(ceiling),
        Some(ceiling) => ceiling,
        None if available_mb > 0 => available_mb,
        // platforms where sysinfo can't see memory fall back to core count
        None => MB_PER_WORKER * MAX_WORKERS as u64,
    };
    let workers = recommended_workers(cores, memory_mb);
    log::debug!("Sizing pool: {cores} cores, {memory_mb} MB available -> {workers} workers");
    workers
}

/// Per-file deadline: a fixed base plus an allowance per MiB of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTimeout {
    pub base: Duration,
    pub per_mib: Duration,
}

impl Default for TaskTimeout {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            per_mib: Duration::from_secs(2),
        }
    }
}

impl TaskTimeout {
    pub fn for_size(&self, bytes: usize) -> Duration {
        let mib = bytes as f64 / (1024.0 * 1024.0);
        self.base + self.per_mib.mul_f64(mib)
    }
}

#[derive(Debug)]
pub enum WorkerEvent {
    Progress {
        context: usize,
        task_id: u64,
        percent: u8,
        status: String,
    },
    Finished {
        context: usize,
        task_id: u64,
        outcome: Result<ExtractionResult, String>,
    },
    /// The extractor panicked; the context's thread has exited.
    Crashed {
        context: usize,
        task_id: u64,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub available: usize,
    pub queued: usize,
    pub restarted: u64,
    /// Threads left behind on a timeout or cancel
    pub abandoned: u64,
    pub unhealthy: usize,
}

struct Job {
    task_id: u64,
    input: ExtractionInput,
}

struct Context {
    id: usize,
    job_tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    busy: Option<u64>,
    restarts: u32,
    healthy: bool,
}

pub struct WorkerPool {
    extractor: Arc<dyn Extractor>,
    contexts: Vec<Context>,
    event_tx: Sender<WorkerEvent>,
    event_rx: Receiver<WorkerEvent>,
    max_restarts: u32,
    restarted: u64,
    abandoned: u64,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn spawn_worker(
    id: usize,
    extractor: Arc<dyn Extractor>,
    events: Sender<WorkerEvent>,
) -> Result<(Sender<Job>, JoinHandle<()>), PoolError> {
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
    let handle = thread::Builder::new()
        .name(format!("mixlab-worker-{id}"))
        .spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let task_id = job.task_id;
                let progress = |percent: u8, status: &str| {
                    let _ = events.send(WorkerEvent::Progress {
                        context: id,
                        task_id,
                        percent,
                        status: status.to_string(),
                    });
                };
                let run = catch_unwind(AssertUnwindSafe(|| {
                    extractor.extract(&job.input, &progress)
                }));
                match run {
                    Ok(outcome) => {
                        let _ = events.send(WorkerEvent::Finished {
                            context: id,
                            task_id,
                            outcome: outcome.map_err(|e| e.to_string()),
                        });
                    }
                    Err(payload) => {
                        let _ = events.send(WorkerEvent::Crashed {
                            context: id,
                            task_id,
                            message: panic_message(payload.as_ref()),
                        });
                        return;
                    }
                }
            }
        })?;
    Ok((job_tx, handle))
}

impl WorkerPool {
    pub fn new(
        size: usize,
        extractor: Arc<dyn Extractor>,
        max_restarts: u32,
    ) -> Result<Self, PoolError> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let mut contexts = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let (job_tx, handle) = spawn_worker(id, Arc::clone(&extractor), event_tx.clone())?;
            contexts.push(Context {
                id,
                job_tx: Some(job_tx),
                handle: Some(handle),
                busy: None,
                restarts: 0,
                healthy: true,
            });
        }
        log::debug!("Worker pool started with {} contexts", contexts.len());
        Ok(Self {
            extractor,
            contexts,
            event_tx,
            event_rx,
            max_restarts,
            restarted: 0,
            abandoned: 0,
        })
    }

    /// Receiver for worker events. Clones share one stream.
    pub fn events(&self) -> Receiver<WorkerEvent> {
        self.event_rx.clone()
    }

    pub fn size(&self) -> usize {
        self.contexts.len()
    }

    pub fn available(&self) -> usize {
        self.contexts
            .iter()
            .filter(|c| c.healthy && c.busy.is_none())
            .count()
    }

    pub fn healthy(&self) -> usize {
        self.contexts.iter().filter(|c| c.healthy).count()
    }

    /// Hand a job to the first idle healthy context. Returns its id.
    pub fn dispatch(&mut self, task_id: u64, input: ExtractionInput) -> Result<usize, PoolError> {
        let idx = self
            .contexts
            .iter()
            .position(|c| c.healthy && c.busy.is_none())
            .ok_or(PoolError::NoCapacity)?;
        let ctx = &mut self.contexts[idx];
        let sent = ctx
            .job_tx
            .as_ref()
            .is_some_and(|tx| tx.send(Job { task_id, input }).is_ok());
        if !sent {
            // thread is gone without reporting; treat it like a crash
            self.restart(idx, "worker thread exited unexpectedly");
            return Err(PoolError::NoCapacity);
        }
        ctx.busy = Some(task_id);
        Ok(ctx.id)
    }

    /// Update context bookkeeping for an event. Must be called for every
    /// event, including those for tasks the caller no longer tracks.
    pub fn handle_event(&mut self, event: &WorkerEvent) {
        match *event {
            WorkerEvent::Progress { .. } => {}
            WorkerEvent::Finished {
                context, task_id, ..
            } => {
                if let Some(ctx) = self.contexts.get_mut(context) {
                    if ctx.busy == Some(task_id) {
                        ctx.busy = None;
                    }
                }
            }
            WorkerEvent::Crashed {
                context,
                task_id,
                ref message,
            } => {
                let current = self.contexts.get(context).and_then(|c| c.busy);
                if current == Some(task_id) {
                    self.restart(context, message);
                }
            }
        }
    }

    /// Replace a context whose thread died. Counts against the context's
    /// restart budget; once spent the context is marked unhealthy.
    pub fn restart(&mut self, context: usize, reason: &str) {
        self.replace(context, reason, true);
    }

    /// Give up on `task_id` if `context` is still running it and put a fresh
    /// thread in its place. The old thread finishes on its own and its events
    /// no longer match the busy slot. Abandoning a live thread is not a crash,
    /// so the restart budget is untouched. Returns false when the context had
    /// already moved on.
    pub fn abandon(&mut self, context: usize, task_id: u64, reason: &str) -> bool {
        match self.contexts.get(context) {
            Some(ctx) if ctx.busy == Some(task_id) => {
                self.replace(context, reason, false);
                true
            }
            _ => false,
        }
    }

    fn replace(&mut self, context: usize, reason: &str, crashed: bool) {
        let max_restarts = self.max_restarts;
        let Some(ctx) = self.contexts.get_mut(context) else {
            return;
        };
        ctx.busy = None;
        ctx.job_tx = None;
        if let Some(handle) = ctx.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        if crashed && ctx.restarts >= max_restarts {
            ctx.healthy = false;
            log::error!(
                "Worker context {context} exceeded {max_restarts} restarts ({reason}); marking unhealthy"
            );
            return;
        }

        match spawn_worker(context, Arc::clone(&self.extractor), self.event_tx.clone()) {
            Ok((job_tx, handle)) => {
                ctx.job_tx = Some(job_tx);
                ctx.handle = Some(handle);
                if crashed {
                    ctx.restarts += 1;
                    self.restarted += 1;
                    log::warn!(
                        "Restarted worker context {context} ({}/{max_restarts}): {reason}",
                        ctx.restarts
                    );
                } else {
                    self.abandoned += 1;
                    log::warn!("Replaced worker context {context}: {reason}");
                }
            }
            Err(e) => {
                ctx.healthy = false;
                log::error!("Could not respawn worker context {context}: {e}");
            }
        }
    }

    pub fn stats(&self, queued: usize) -> PoolStats {
        PoolStats {
            total: self.contexts.len(),
            busy: self.contexts.iter().filter(|c| c.busy.is_some()).count(),
            available: self.available(),
            queued,
            restarted: self.restarted,
            abandoned: self.abandoned,
            unhealthy: self.contexts.iter().filter(|c| !c.healthy).count(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for ctx in &mut self.contexts {
            ctx.job_tx = None;
        }
        for ctx in &mut self.contexts {
            // busy threads may be stuck in a long extraction; leave them detached
            if ctx.busy.is_none() {
                if let Some(handle) = ctx.handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}
