//! End-to-end analysis pipeline tests with scripted extractors.

use mixlab::analyzer::{AnalyzeError, Analyzer, AnalyzerOptions, ExtractionInput, Extractor};
use mixlab::cache::ContentCache;
use mixlab::db::Database;
use mixlab::library::TrackLibrary;
use mixlab::model::{AnalysisMode, ExtractionResult, IngestFile, ProgressEvent};
use mixlab::pool::TaskTimeout;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Behaviour is picked from the file name prefix:
/// `slow` sleeps briefly, `linger` for a few hundred milliseconds and `hang`
/// for seconds, `panic` panics,
/// `fail` returns an error and `bad` returns an unusable result.
#[derive(Default)]
struct Scripted {
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Extractor for Scripted {
    fn extract(
        &self,
        input: &ExtractionInput,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ExtractionResult, AnalyzeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let outcome = self.run(input, progress);
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

impl Scripted {
    fn run(
        &self,
        input: &ExtractionInput,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ExtractionResult, AnalyzeError> {
        let name = input.file_name.as_str();
        progress(50, "working");
        if name.starts_with("slow") {
            thread::sleep(Duration::from_millis(60));
        } else if name.starts_with("linger") {
            thread::sleep(Duration::from_millis(400));
        } else if name.starts_with("hang") {
            thread::sleep(Duration::from_secs(2));
        } else if name.starts_with("panic") {
            panic!("decoder blew up");
        } else if name.starts_with("fail") {
            return Err(AnalyzeError::Extraction("unsupported codec".into()));
        }

        let mut result = ExtractionResult::placeholder(AnalysisMode::Full);
        if !name.starts_with("bad") {
            result.bpm = 120.0 + input.bytes.len() as f64 % 10.0;
            result.key = "Am".to_string();
            result.confidence = 0.9;
            result.key_confidence = 0.9;
            result.energy = 0.6;
            result.duration = 240.0;
        }
        Ok(result)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn options(workers: usize) -> AnalyzerOptions {
    AnalyzerOptions {
        workers,
        max_restarts: 3,
        timeout: TaskTimeout::default(),
        watchdog_grace: Duration::from_secs(30),
        mode: AnalysisMode::Full,
    }
}

fn setup(
    extractor: Arc<Scripted>,
    cache: Arc<ContentCache>,
    opts: AnalyzerOptions,
) -> (Analyzer, Arc<RwLock<TrackLibrary>>) {
    let library = Arc::new(RwLock::new(TrackLibrary::new()));
    let analyzer = Analyzer::new(extractor, cache, Arc::clone(&library), opts).unwrap();
    (analyzer, library)
}

/// Distinct, non-audio content per name so every file hashes differently.
fn file(name: &str) -> IngestFile {
    let bytes = format!("not really audio: {name}").into_bytes();
    IngestFile::new(bytes, name)
}

#[test]
fn test_batch_resolves_every_track() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        options(2),
    );

    let ids: Vec<u64> = ["a.wav", "b.wav", "c.mp3"]
        .into_iter()
        .map(|n| analyzer.submit(file(n)))
        .collect();
    let summary = analyzer.process_all();

    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    let library = library.read().unwrap();
    for id in ids {
        let t = library.get(id).unwrap();
        assert!(t.is_analyzed(), "{t:?}");
        assert_eq!(t.key, "Am");
    }
    let counts = analyzer.queue_counts();
    assert_eq!((counts.pending, counts.processing), (0, 0));
    assert_eq!(counts.completed, 3);
}

#[test]
fn test_same_bytes_are_extracted_once() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        options(1),
    );

    analyzer.submit(file("track.wav"));
    analyzer.process_all();
    assert_eq!(extractor.calls(), 1);

    // same content under another name is still a hit
    let renamed = IngestFile::new(file("track.wav").bytes, "renamed.wav");
    let id = analyzer.submit(renamed);
    let summary = analyzer.process_all();

    assert_eq!(extractor.calls(), 1);
    assert_eq!(summary.cache_hits, 1);
    assert_eq!(summary.completed, 1);
    let library = library.read().unwrap();
    let first = &library.tracks()[0];
    let second = library.get(id).unwrap();
    assert!(second.is_analyzed());
    assert_eq!(first.bpm, second.bpm);
}

#[test]
fn test_durable_cache_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cache.db");

    let first = Arc::new(Scripted::default());
    {
        let cache = Arc::new(ContentCache::with_database(Database::open(&db_path).unwrap()));
        let (analyzer, _) = setup(Arc::clone(&first), cache, options(1));
        analyzer.submit(file("persist.flac"));
        analyzer.process_all();
    }
    assert_eq!(first.calls(), 1);

    let second = Arc::new(Scripted::default());
    let cache = Arc::new(ContentCache::with_database(Database::open(&db_path).unwrap()));
    let (analyzer, library) = setup(Arc::clone(&second), cache, options(1));
    let id = analyzer.submit(file("persist.flac"));
    let summary = analyzer.process_all();

    assert_eq!(second.calls(), 0);
    assert_eq!(summary.cache_hits, 1);
    assert!(library.read().unwrap().get(id).unwrap().is_analyzed());
}

#[test]
fn test_invalid_result_fails_and_is_not_cached() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        options(1),
    );

    let id = analyzer.submit(file("bad.wav"));
    let summary = analyzer.process_all();
    assert_eq!(summary.failed, 1);
    {
        let library = library.read().unwrap();
        let t = library.get(id).unwrap();
        assert!(!t.is_analyzing);
        assert!(t.error.as_deref().unwrap().starts_with("Invalid analysis result"));
    }
    assert_eq!(analyzer.cache().stats().unwrap().entries, 0);

    // not cached, so a resubmit runs the extractor again
    analyzer.submit(file("bad.wav"));
    analyzer.process_all();
    assert_eq!(extractor.calls(), 2);
}

#[test]
fn test_concurrency_never_exceeds_worker_count() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, _) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        options(2),
    );

    for i in 0..8 {
        analyzer.submit(file(&format!("slow-{i}.wav")));
    }
    assert_eq!(analyzer.pool_stats().queued, 8);
    let summary = analyzer.process_all();

    assert_eq!(summary.completed, 8);
    assert_eq!(extractor.calls(), 8);
    let peak = extractor.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak {peak}");

    let stats = analyzer.pool_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.queued, 0);
}

#[test]
fn test_failures_do_not_affect_siblings() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        options(2),
    );

    let ok1 = analyzer.submit(file("one.wav"));
    let crashed = analyzer.submit(file("panic.wav"));
    let errored = analyzer.submit(file("fail.wav"));
    let ok2 = analyzer.submit(file("two.wav"));
    let summary = analyzer.process_all();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 2);

    let library = library.read().unwrap();
    assert!(library.get(ok1).unwrap().is_analyzed());
    assert!(library.get(ok2).unwrap().is_analyzed());

    let crash = library.get(crashed).unwrap();
    assert!(!crash.is_analyzing);
    assert!(crash.error.as_deref().unwrap().contains("decoder blew up"));

    let err = library.get(errored).unwrap();
    assert!(err.error.as_deref().unwrap().starts_with("Extraction failed"));

    // the crashed context was respawned
    let stats = analyzer.pool_stats();
    assert_eq!(stats.restarted, 1);
    assert_eq!(stats.unhealthy, 0);
}

#[test]
fn test_timeout_fails_the_track_and_frees_the_slot() {
    let extractor = Arc::new(Scripted::default());
    let mut opts = options(1);
    opts.timeout = TaskTimeout {
        base: Duration::from_millis(150),
        per_mib: Duration::ZERO,
    };
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        opts,
    );

    let stuck = analyzer.submit(file("hang.wav"));
    let after = analyzer.submit(file("after.wav"));
    let summary = analyzer.process_all();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    let library = library.read().unwrap();
    let t = library.get(stuck).unwrap();
    assert!(!t.is_analyzing);
    assert!(t.error.as_deref().unwrap().starts_with("Timed out"));
    assert!(library.get(after).unwrap().is_analyzed());
}

#[test]
fn test_cancel_all_leaves_nothing_behind() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        options(1),
    );
    let analyzer = Arc::new(analyzer);

    for i in 0..5 {
        analyzer.submit(file(&format!("hang-{i}.wav")));
    }
    let driver = {
        let analyzer = Arc::clone(&analyzer);
        thread::spawn(move || analyzer.process_all())
    };
    thread::sleep(Duration::from_millis(100));

    let removed = analyzer.cancel_all();
    driver.join().unwrap();

    assert_eq!(removed, 5);
    let counts = analyzer.queue_counts();
    assert_eq!((counts.pending, counts.processing), (0, 0));
    let library = library.read().unwrap();
    assert!(library.is_empty());
    assert!(library.analyzing_ids().is_empty());
}

#[test]
fn test_watchdog_fails_orphaned_tracks() {
    let extractor = Arc::new(Scripted::default());
    let mut opts = options(1);
    opts.watchdog_grace = Duration::ZERO;
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        opts,
    );

    // analyzing flag with no task behind it
    let orphan = library
        .write()
        .unwrap()
        .add_placeholder("orphan.wav", "orphan.wav", None, None);
    let queued = analyzer.submit(file("queued.wav"));

    let resolved = analyzer.sweep_stalled();
    assert_eq!(resolved, vec![orphan]);
    {
        let library = library.read().unwrap();
        let t = library.get(orphan).unwrap();
        assert!(!t.is_analyzing);
        assert!(t.error.as_deref().unwrap().starts_with("Analysis stalled"));
        assert!(library.get(queued).unwrap().is_analyzing);
    }

    let summary = analyzer.process_all();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert!(library.read().unwrap().analyzing_ids().is_empty());
}

fn short_deadline(workers: usize, millis: u64) -> AnalyzerOptions {
    let mut opts = options(workers);
    opts.timeout = TaskTimeout {
        base: Duration::from_millis(millis),
        per_mib: Duration::ZERO,
    };
    opts
}

#[test]
fn test_repeated_timeouts_keep_the_pool_alive() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        short_deadline(1, 100),
    );

    // more timeouts than the restart budget allows crashes
    for i in 0..5 {
        analyzer.submit(file(&format!("hang-{i}.wav")));
    }
    let ok = analyzer.submit(file("ok.wav"));
    let summary = analyzer.process_all();

    assert_eq!(summary.failed, 5);
    assert_eq!(summary.completed, 1);
    assert!(library.read().unwrap().get(ok).unwrap().is_analyzed());

    let stats = analyzer.pool_stats();
    assert_eq!(stats.unhealthy, 0);
    assert_eq!(stats.restarted, 0);
    assert_eq!(stats.abandoned, 5);
}

#[test]
fn test_cancel_frees_the_context_of_a_stuck_task() {
    let extractor = Arc::new(Scripted::default());
    let (analyzer, library) = setup(
        Arc::clone(&extractor),
        Arc::new(ContentCache::in_memory()),
        short_deadline(1, 500),
    );
    let analyzer = Arc::new(analyzer);

    analyzer.submit(file("hang.wav"));
    let driver = {
        let analyzer = Arc::clone(&analyzer);
        thread::spawn(move || analyzer.process_all())
    };
    thread::sleep(Duration::from_millis(100));
    analyzer.cancel_all();
    driver.join().unwrap();

    let ok = analyzer.submit(file("ok.wav"));
    let started = Instant::now();
    let summary = analyzer.process_all();

    // the hung extraction keeps sleeping for seconds; the new batch must not wait on it
    assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
    assert_eq!(summary.completed, 1);
    assert!(library.read().unwrap().get(ok).unwrap().is_analyzed());
    assert_eq!(analyzer.pool_stats().abandoned, 1);
}

fn events_for(events: &[ProgressEvent], track_id: u64) -> Vec<(u8, String)> {
    events
        .iter()
        .filter(|e| e.track_id == track_id)
        .map(|e| (e.percent, e.status.clone()))
        .collect()
}

#[test]
fn test_progress_stream() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let library = Arc::new(RwLock::new(TrackLibrary::new()));
    let analyzer = Analyzer::new(
        Arc::new(Scripted::default()),
        Arc::new(ContentCache::in_memory()),
        Arc::clone(&library),
        options(1),
    )
    .unwrap()
    .with_progress(tx);
    let analyzer = Arc::new(analyzer);

    // a fresh file walks from queued to complete
    let id = analyzer.submit(file("fresh.wav"));
    analyzer.process_all();
    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    let steps = events_for(&events, id);
    assert_eq!(steps.first().map(|s| s.1.as_str()), Some("queued"));
    assert_eq!(steps.last().map(|s| s.0), Some(100));
    assert!(steps.windows(2).all(|w| w[0].0 <= w[1].0), "{steps:?}");
    let task_id = events[0].task_id;
    assert!(events.iter().all(|e| e.task_id == task_id));

    // a cache hit reports completion at once
    let hit = analyzer.submit(file("fresh.wav"));
    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert_eq!(events_for(&events, hit), vec![(100, "cached".to_string())]);
    assert_eq!(events.len(), 1);

    // a cancelled task's late result stays silent
    let late = analyzer.submit(file("linger.wav"));
    let driver = {
        let analyzer = Arc::clone(&analyzer);
        thread::spawn(move || analyzer.process_all())
    };
    thread::sleep(Duration::from_millis(100));
    analyzer.cancel_all();
    driver.join().unwrap();
    let before: Vec<ProgressEvent> = rx.try_iter().collect();
    assert!(before.iter().all(|e| e.percent < 100), "{before:?}");

    thread::sleep(Duration::from_millis(600));
    analyzer.process_all();
    let after: Vec<ProgressEvent> = rx.try_iter().collect();
    assert!(events_for(&after, late).is_empty(), "{after:?}");
    assert!(library.read().unwrap().get(late).is_none());
}

#[test]
fn test_watchdog_failures_reach_the_progress_stream() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let library = Arc::new(RwLock::new(TrackLibrary::new()));
    let mut opts = options(1);
    opts.watchdog_grace = Duration::ZERO;
    let analyzer = Analyzer::new(
        Arc::new(Scripted::default()),
        Arc::new(ContentCache::in_memory()),
        Arc::clone(&library),
        opts,
    )
    .unwrap()
    .with_progress(tx);

    let orphan = library
        .write()
        .unwrap()
        .add_placeholder("orphan.wav", "orphan.wav", None, None);
    assert_eq!(analyzer.sweep_stalled(), vec![orphan]);

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert_eq!(events_for(&events, orphan), vec![(100, "failed".to_string())]);
}
