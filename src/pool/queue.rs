//! Task bookkeeping for the analysis pipeline.
//!
//! Admission is FIFO through `pending`; completion order is whatever the
//! workers produce. A task's status only moves forward, except that
//! [`TaskQueue::clear`] drops pending and processing items outright.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: u64,
    pub track_id: u64,
    pub file_name: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
}

/// Work waiting for a free context.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task_id: u64,
    pub track_id: u64,
    pub file_name: String,
    pub bytes: Arc<[u8]>,
    pub content_hash: String,
}

/// A task handed to a context, with the deadline it must beat.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: PendingTask,
    pub context: usize,
    pub deadline: Instant,
}

/// What [`TaskQueue::clear`] dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleared {
    pub track_ids: Vec<u64>,
    /// `(context, task_id)` for every dropped in-flight task
    pub running: Vec<(usize, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    items: BTreeMap<u64, QueueItem>,
    pending: VecDeque<PendingTask>,
    in_flight: HashMap<u64, InFlight>,
}

impl QueueState {
    fn admit(&mut self, track_id: u64, file_name: &str, status: TaskStatus) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.items.insert(
            id,
            QueueItem {
                id,
                track_id,
                file_name: file_name.to_string(),
                status,
                progress: if status == TaskStatus::Completed { 100 } else { 0 },
                error: None,
            },
        );
        id
    }

    fn transition(&mut self, task_id: u64, to: TaskStatus) -> bool {
        match self.items.get_mut(&task_id) {
            Some(item) if to.rank() > item.status.rank() => {
                item.status = to;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // every mutation below leaves the state consistent between statements
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a task for extraction. Returns the task id.
    pub fn enqueue(
        &self,
        track_id: u64,
        file_name: &str,
        bytes: Arc<[u8]>,
        content_hash: String,
    ) -> u64 {
        let mut state = self.lock();
        let task_id = state.admit(track_id, file_name, TaskStatus::Pending);
        state.pending.push_back(PendingTask {
            task_id,
            track_id,
            file_name: file_name.to_string(),
            bytes,
            content_hash,
        });
        task_id
    }

    /// Record a task that completed without extraction (cache hit).
    pub fn record_completed(&self, track_id: u64, file_name: &str) -> u64 {
        self.lock().admit(track_id, file_name, TaskStatus::Completed)
    }

    pub fn pop_pending(&self) -> Option<PendingTask> {
        self.lock().pending.pop_front()
    }

    /// Put a task back at the head after a failed dispatch.
    pub fn requeue_front(&self, task: PendingTask) {
        let mut state = self.lock();
        if state.items.contains_key(&task.task_id) {
            state.pending.push_front(task);
        }
    }

    /// Move a popped task into the in-flight set. Returns false when the task
    /// was cancelled in between.
    pub fn start(&self, task: PendingTask, context: usize, deadline: Instant) -> bool {
        let mut state = self.lock();
        let task_id = task.task_id;
        if !state.transition(task_id, TaskStatus::Processing) {
            return false;
        }
        state.in_flight.insert(
            task_id,
            InFlight {
                task,
                context,
                deadline,
            },
        );
        true
    }

    /// Update progress. Returns false for tasks no longer tracked.
    pub fn set_progress(&self, task_id: u64, percent: u8) -> bool {
        let mut state = self.lock();
        if !state.in_flight.contains_key(&task_id) {
            return false;
        }
        match state.items.get_mut(&task_id) {
            Some(item) => {
                item.progress = item.progress.max(percent.min(100));
                true
            }
            None => false,
        }
    }

    /// Take a task out of the in-flight set. `None` means the result belongs
    /// to a task that was cancelled or already resolved.
    pub fn take_in_flight(&self, task_id: u64) -> Option<InFlight> {
        self.lock().in_flight.remove(&task_id)
    }

    pub fn complete(&self, task_id: u64) -> bool {
        let mut state = self.lock();
        if !state.transition(task_id, TaskStatus::Completed) {
            return false;
        }
        if let Some(item) = state.items.get_mut(&task_id) {
            item.progress = 100;
        }
        true
    }

    pub fn fail(&self, task_id: u64, error: impl Into<String>) -> bool {
        let mut state = self.lock();
        if !state.transition(task_id, TaskStatus::Failed) {
            return false;
        }
        if let Some(item) = state.items.get_mut(&task_id) {
            item.error = Some(error.into());
        }
        true
    }

    /// In-flight tasks whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<u64> {
        let state = self.lock();
        let mut ids: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every pending and processing item. Results that later arrive
    /// for these tasks find nothing to update; the contexts still running
    /// them are reported so the caller can reclaim them.
    pub fn clear(&self) -> Cleared {
        let mut state = self.lock();
        let mut cleared = Cleared::default();
        cleared
            .track_ids
            .extend(state.pending.drain(..).map(|t| t.track_id));
        for (task_id, flight) in state.in_flight.drain() {
            cleared.track_ids.push(flight.task.track_id);
            cleared.running.push((flight.context, task_id));
        }
        state.items.retain(|_, item| item.status.is_terminal());
        cleared.track_ids.sort_unstable();
        cleared.track_ids.dedup();
        cleared.running.sort_unstable();
        cleared
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Track ids with a pending or in-flight task.
    pub fn active_track_ids(&self) -> HashSet<u64> {
        let state = self.lock();
        state
            .pending
            .iter()
            .map(|t| t.track_id)
            .chain(state.in_flight.values().map(|f| f.task.track_id))
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.lock();
        let mut counts = QueueCounts::default();
        for item in state.items.values() {
            match item.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn get(&self, task_id: u64) -> Option<QueueItem> {
        self.lock().items.get(&task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn enqueue(queue: &TaskQueue, track_id: u64) -> u64 {
        queue.enqueue(track_id, "a.mp3", Arc::from(vec![0u8; 4]), format!("h{track_id}"))
    }

    #[test]
    fn test_admission_is_fifo() {
        let queue = TaskQueue::new();
        let a = enqueue(&queue, 1);
        let b = enqueue(&queue, 2);
        assert_eq!(queue.pop_pending().unwrap().task_id, a);
        assert_eq!(queue.pop_pending().unwrap().task_id, b);
        assert!(queue.pop_pending().is_none());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let queue = TaskQueue::new();
        let id = enqueue(&queue, 1);
        let task = queue.pop_pending().unwrap();
        assert!(queue.start(task, 0, Instant::now()));
        assert!(queue.complete(id));
        assert!(!queue.fail(id, "late"));
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::Completed);
        assert!(queue.get(id).unwrap().error.is_none());
    }

    #[test]
    fn test_progress_only_for_tracked_tasks() {
        let queue = TaskQueue::new();
        let id = enqueue(&queue, 1);
        assert!(!queue.set_progress(id, 10), "not started yet");
        let task = queue.pop_pending().unwrap();
        queue.start(task, 0, Instant::now());
        assert!(queue.set_progress(id, 40));
        assert!(queue.set_progress(id, 20));
        assert_eq!(queue.get(id).unwrap().progress, 40);
    }

    #[test]
    fn test_clear_drops_pending_and_processing() {
        let queue = TaskQueue::new();
        let done = enqueue(&queue, 1);
        let task = queue.pop_pending().unwrap();
        queue.start(task, 0, Instant::now());
        queue.take_in_flight(done);
        queue.complete(done);

        let running = enqueue(&queue, 2);
        let task = queue.pop_pending().unwrap();
        queue.start(task, 1, Instant::now());
        enqueue(&queue, 3);
        enqueue(&queue, 4);

        let cleared = queue.clear();
        assert_eq!(cleared.track_ids, vec![2, 3, 4]);
        assert_eq!(cleared.running, vec![(1, running)]);
        let counts = queue.counts();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.completed, 1);
        assert!(queue.is_idle());
        assert!(queue.take_in_flight(running).is_none());
    }

    #[test]
    fn test_start_after_clear_is_refused() {
        let queue = TaskQueue::new();
        enqueue(&queue, 1);
        let task = queue.pop_pending().unwrap();
        queue.clear();
        assert!(!queue.start(task, 0, Instant::now()));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_expired_deadlines() {
        let queue = TaskQueue::new();
        let now = Instant::now();
        let late = enqueue(&queue, 1);
        let on_time = enqueue(&queue, 2);
        let t = queue.pop_pending().unwrap();
        queue.start(t, 0, now);
        let t = queue.pop_pending().unwrap();
        queue.start(t, 1, now + Duration::from_secs(60));
        assert_eq!(queue.expired(now + Duration::from_secs(1)), vec![late]);
        assert!(!queue.expired(now + Duration::from_secs(61)).is_empty());
        assert!(queue.get(on_time).is_some());
    }

    #[test]
    fn test_cache_hit_recorded_as_completed() {
        let queue = TaskQueue::new();
        let id = queue.record_completed(7, "b.flac");
        let item = queue.get(id).unwrap();
        assert_eq!(item.status, TaskStatus::Completed);
        assert_eq!(item.progress, 100);
        assert!(queue.is_idle());
    }
}
