use crate::library::TrackLibrary;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Resolves tracks stuck in the analyzing state with nothing queued for them.
///
/// A track is an orphan while it is flagged analyzing but has no pending or
/// in-flight task. Orphans that stay that way for the grace period are failed.
#[derive(Debug)]
pub struct Watchdog {
    grace: Duration,
    orphan_since: HashMap<u64, Instant>,
}

impl Watchdog {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            orphan_since: HashMap::new(),
        }
    }

    /// Returns the ids of tracks that were force-failed.
    pub fn sweep(
        &mut self,
        library: &mut TrackLibrary,
        active: &HashSet<u64>,
        now: Instant,
    ) -> Vec<u64> {
        let orphans: Vec<u64> = library
            .analyzing_ids()
            .into_iter()
            .filter(|id| !active.contains(id))
            .collect();

        self.orphan_since.retain(|id, _| orphans.contains(id));

        let mut resolved = Vec::new();
        for id in orphans {
            let since = *self.orphan_since.entry(id).or_insert(now);
            let stalled = now.saturating_duration_since(since);
            if stalled >= self.grace {
                log::warn!("Track {id} stalled in analysis for {stalled:?}; marking failed");
                library.fail(
                    id,
                    format!(
                        "Analysis stalled: no active task for {}s",
                        stalled.as_secs()
                    ),
                );
                self.orphan_since.remove(&id);
                resolved.push(id);
            }
        }
        resolved
    }

    pub fn watched(&self) -> usize {
        self.orphan_since.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphan_failed_after_grace() {
        let mut lib = TrackLibrary::new();
        let orphan = lib.add_placeholder("a.wav", "a.wav", None, None);
        let queued = lib.add_placeholder("b.wav", "b.wav", None, None);
        let active: HashSet<u64> = [queued].into_iter().collect();

        let mut dog = Watchdog::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(dog.sweep(&mut lib, &active, t0).is_empty());
        assert_eq!(dog.watched(), 1);
        assert!(dog.sweep(&mut lib, &active, t0 + Duration::from_secs(5)).is_empty());

        let failed = dog.sweep(&mut lib, &active, t0 + Duration::from_secs(10));
        assert_eq!(failed, vec![orphan]);
        let track = lib.get(orphan).unwrap();
        assert!(!track.is_analyzing);
        assert!(track.error.as_deref().unwrap().starts_with("Analysis stalled"));
        assert!(lib.get(queued).unwrap().is_analyzing);
    }

    #[test]
    fn test_track_that_regains_a_task_is_forgotten() {
        let mut lib = TrackLibrary::new();
        let id = lib.add_placeholder("a.wav", "a.wav", None, None);
        let mut dog = Watchdog::new(Duration::from_secs(10));
        let t0 = Instant::now();
        dog.sweep(&mut lib, &HashSet::new(), t0);

        let active: HashSet<u64> = [id].into_iter().collect();
        dog.sweep(&mut lib, &active, t0 + Duration::from_secs(8));
        assert_eq!(dog.watched(), 0);

        // the grace period restarts from the next time it is orphaned
        assert!(dog.sweep(&mut lib, &HashSet::new(), t0 + Duration::from_secs(12)).is_empty());
    }
}
