//! The in-memory track library: every admitted track, whatever its state.

use crate::model::{ExtractionResult, Track, TrackSnapshot};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// Error attached to tracks restored from a snapshot without their audio.
pub const NEEDS_REANALYSIS: &str = "needs re-analysis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TrackState {
    Analyzed,
    Analyzing,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SortKey {
    #[default]
    Name,
    Bpm,
    Key,
    Energy,
    Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryFilter {
    pub state: Option<TrackState>,
    /// Matches the folder label exactly
    pub folder: Option<String>,
    /// Case-insensitive substring of the track name
    pub name: Option<String>,
}

impl LibraryFilter {
    fn matches(&self, t: &Track) -> bool {
        let state_ok = match self.state {
            None => true,
            Some(TrackState::Analyzed) => t.is_analyzed(),
            Some(TrackState::Analyzing) => t.is_analyzing,
            Some(TrackState::Failed) => !t.is_analyzing && t.error.is_some(),
        };
        let folder_ok = self.folder.as_deref().is_none_or(|f| t.folder_label() == f);
        let name_ok = self
            .name
            .as_deref()
            .is_none_or(|n| t.name.to_lowercase().contains(&n.to_lowercase()));
        state_ok && folder_ok && name_ok
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LibraryCounts {
    pub total: usize,
    pub analyzed: usize,
    pub analyzing: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct TrackLibrary {
    tracks: Vec<Track>,
    next_id: u64,
}

impl TrackLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a track in the analyzing state. Returns its id.
    pub fn add_placeholder(
        &mut self,
        name: &str,
        source: &str,
        folder: Option<String>,
        audio: Option<Arc<[u8]>>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.tracks
            .push(Track::placeholder(id, name, source, folder, audio));
        id
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Apply a finished result. Returns false if the track was removed.
    pub fn complete(&mut self, id: u64, result: &ExtractionResult) -> bool {
        match self.get_mut(id) {
            Some(track) => {
                track.apply(result);
                true
            }
            None => false,
        }
    }

    pub fn fail(&mut self, id: u64, message: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(track) => {
                track.fail(message);
                true
            }
            None => false,
        }
    }

    /// Drop a track and its audio reference.
    pub fn remove(&mut self, id: u64) -> Option<Track> {
        let idx = self.tracks.iter().position(|t| t.id == id)?;
        Some(self.tracks.remove(idx))
    }

    pub fn remove_many(&mut self, ids: &[u64]) -> usize {
        let before = self.tracks.len();
        self.tracks.retain(|t| !ids.contains(&t.id));
        before - self.tracks.len()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Tracks in admission order.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn analyzed(&self) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_analyzed())
            .cloned()
            .collect()
    }

    pub fn analyzing_ids(&self) -> Vec<u64> {
        self.tracks
            .iter()
            .filter(|t| t.is_analyzing)
            .map(|t| t.id)
            .collect()
    }

    /// Filtered, sorted view. Ties keep admission order.
    pub fn view(&self, filter: &LibraryFilter, sort: SortKey, descending: bool) -> Vec<&Track> {
        let mut out: Vec<&Track> = self.tracks.iter().filter(|t| filter.matches(t)).collect();
        out.sort_by(|a, b| {
            let ord = match sort {
                SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                SortKey::Bpm => a.bpm.total_cmp(&b.bpm),
                SortKey::Key => compare_keys(a, b),
                SortKey::Energy => a.energy.total_cmp(&b.energy),
                SortKey::Duration => a.duration.total_cmp(&b.duration),
            };
            if descending { ord.reverse() } else { ord }
        });
        out
    }

    pub fn counts(&self) -> LibraryCounts {
        let mut counts = LibraryCounts {
            total: self.tracks.len(),
            ..Default::default()
        };
        for t in &self.tracks {
            if t.is_analyzing {
                counts.analyzing += 1;
            } else if t.is_analyzed() {
                counts.analyzed += 1;
            } else if t.error.is_some() {
                counts.failed += 1;
            }
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<TrackSnapshot> {
        self.tracks.iter().map(TrackSnapshot::from).collect()
    }

    /// Recreate tracks from a snapshot. Without their bytes they cannot be
    /// used for matching until re-analyzed, so each carries an error.
    pub fn restore(&mut self, snapshots: &[TrackSnapshot]) -> usize {
        for snap in snapshots {
            let id = if self.get(snap.id).is_some() {
                self.next_id + 1
            } else {
                snap.id
            };
            self.next_id = self.next_id.max(id);

            let mut track = Track::placeholder(id, &snap.name, &snap.source, None, None);
            track.bpm = snap.bpm;
            track.key = snap.key.clone();
            track.duration = snap.duration;
            track.is_analyzing = false;
            track.error = Some(NEEDS_REANALYSIS.to_string());
            self.tracks.push(track);
        }
        snapshots.len()
    }
}

/// Wheel position first, then minor before major.
fn compare_keys(a: &Track, b: &Track) -> Ordering {
    let pos = |t: &Track| t.parsed_key().map(|k| (k.camelot_number(), k.camelot_letter()));
    match (pos(a), pos(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalysisMode;

    fn result(bpm: f64, key: &str, energy: f64) -> ExtractionResult {
        let mut r = ExtractionResult::placeholder(AnalysisMode::Full);
        r.bpm = bpm;
        r.key = key.to_string();
        r.energy = energy;
        r.duration = 200.0;
        r
    }

    fn library() -> TrackLibrary {
        let mut lib = TrackLibrary::new();
        let a = lib.add_placeholder("Bravo.mp3", "House/Bravo.mp3", Some("House".into()), None);
        let b = lib.add_placeholder("alpha.mp3", "Techno/alpha.mp3", Some("Techno".into()), None);
        let c = lib.add_placeholder("Charlie.mp3", "House/Charlie.mp3", Some("House".into()), None);
        lib.add_placeholder("Delta.mp3", "Delta.mp3", None, None);
        lib.complete(a, &result(128.0, "Am", 0.7));
        lib.complete(b, &result(122.0, "C", 0.9));
        lib.fail(c, "decode error");
        lib
    }

    #[test]
    fn test_counts() {
        let counts = library().counts();
        assert_eq!(
            counts,
            LibraryCounts {
                total: 4,
                analyzed: 2,
                analyzing: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_filter_and_sort() {
        let lib = library();
        let names = |v: Vec<&Track>| v.iter().map(|t| t.name.clone()).collect::<Vec<_>>();

        let by_name = lib.view(&LibraryFilter::default(), SortKey::Name, false);
        assert_eq!(
            names(by_name),
            vec!["alpha.mp3", "Bravo.mp3", "Charlie.mp3", "Delta.mp3"]
        );

        let analyzed = LibraryFilter {
            state: Some(TrackState::Analyzed),
            ..Default::default()
        };
        assert_eq!(
            names(lib.view(&analyzed, SortKey::Bpm, true)),
            vec!["Bravo.mp3", "alpha.mp3"]
        );

        let house = LibraryFilter {
            folder: Some("House".into()),
            name: Some("CHAR".into()),
            ..Default::default()
        };
        assert_eq!(names(lib.view(&house, SortKey::Name, false)), vec!["Charlie.mp3"]);
    }

    #[test]
    fn test_remove_releases_audio() {
        let mut lib = TrackLibrary::new();
        let bytes: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);
        let id = lib.add_placeholder("a", "a", None, Some(Arc::clone(&bytes)));
        assert_eq!(Arc::strong_count(&bytes), 2);
        lib.remove(id);
        assert_eq!(Arc::strong_count(&bytes), 1);
        assert!(lib.is_empty());
    }

    #[test]
    fn test_snapshot_restore_yields_placeholders() {
        let lib = library();
        let snaps = lib.snapshot();
        let json = serde_json::to_string(&snaps).unwrap();
        let back: Vec<TrackSnapshot> = serde_json::from_str(&json).unwrap();

        let mut restored = TrackLibrary::new();
        assert_eq!(restored.restore(&back), 4);
        let bravo = restored.get(1).unwrap();
        assert_eq!(bravo.bpm, 128.0);
        assert_eq!(bravo.key, "Am");
        assert!(!bravo.is_analyzing);
        assert!(!bravo.is_analyzed());
        assert_eq!(bravo.error.as_deref(), Some(NEEDS_REANALYSIS));

        // new admissions never collide with restored ids
        let fresh = restored.add_placeholder("new", "new", None, None);
        assert_eq!(fresh, 5);
    }
}
