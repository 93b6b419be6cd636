use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use mixlab::analyzer::{Analyzer, BatchSummary, FeatureExtractor};
use mixlab::cache::ContentCache;
use mixlab::config::AppConfig;
use mixlab::library::{LibraryFilter, SortKey, TrackLibrary, TrackState};
use mixlab::mashup::duplicates::DuplicateGroup;
use mixlab::mashup::{MashupCandidate, MashupOptions};
use mixlab::model::{AnalysisMode, BeatStorage, BpmTolerance, SegmentDensity, Track, TrackSnapshot};
use mixlab::setlist::curve::EnergyCurve;
use mixlab::setlist::{GeneratedSet, SetOptions};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Parser)]
#[command(name = "mixlab", version, about = "DJ library analyzer and mashup finder")]
struct Cli {
    /// Path to the SQLite cache database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that analyzes audio first.
#[derive(Args, Clone)]
struct AnalyzeArgs {
    /// Audio files or directories to analyze
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Worker contexts (0 = config / auto sizing)
    #[arg(short = 'j', long, default_value = "0")]
    jobs: usize,

    #[arg(long, value_enum)]
    mode: Option<AnalysisMode>,

    #[arg(long, value_enum)]
    segments: Option<SegmentDensity>,

    #[arg(long, value_enum)]
    beats: Option<BeatStorage>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze audio files and list the results
    Analyze {
        #[command(flatten)]
        args: AnalyzeArgs,

        /// Only show tracks in this state
        #[arg(long, value_enum)]
        status: Option<TrackState>,

        /// Only show tracks whose name contains this text
        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value = "name")]
        sort: SortKey,

        #[arg(long)]
        desc: bool,

        /// Write a session snapshot (JSON) to this file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Rank pairs of tracks that mix well together
    Mashups {
        #[command(flatten)]
        args: AnalyzeArgs,

        #[arg(short, long, value_enum)]
        tolerance: Option<BpmTolerance>,

        /// Only pair tracks from different folders
        #[arg(long)]
        cross_folder: bool,

        /// Restrict pairs to these folders (at most two)
        #[arg(long, num_args = 1..=2)]
        pin: Vec<String>,

        /// Number of results
        #[arg(short = 'n', long, default_value = "25")]
        limit: usize,
    },

    /// Generate a set following an energy curve
    Set {
        #[command(flatten)]
        args: AnalyzeArgs,

        /// Target length in minutes
        #[arg(short, long, default_value = "60")]
        minutes: f64,

        #[arg(short, long, value_enum, default_value = "build")]
        curve: EnergyCurve,

        /// Ignore keys when scoring transitions
        #[arg(long)]
        no_harmonic: bool,

        /// Seed for reproducible sets
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Find duplicate files and numbered versions
    Duplicates {
        #[command(flatten)]
        args: AnalyzeArgs,
    },

    /// Show tracks from a session snapshot
    Restore {
        /// Snapshot file written by `analyze --snapshot`
        file: PathBuf,
    },

    /// Inspect or maintain the analysis cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count and age range
    Stats,
    /// Remove entries older than N days
    Prune {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Remove every entry
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .clone()
        .or(config.db_path.clone())
        .unwrap_or_else(mixlab::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    if let Commands::Restore { file } = &cli.command {
        return restore(file, cli.json);
    }

    let db = mixlab::db::Database::open(&db_path).context("Failed to open database")?;
    let cache = Arc::new(ContentCache::with_database(db));

    match cli.command {
        Commands::Cache { action } => {
            run_cache_action(&cache, action, config.cache_max_age_days, cli.json)?
        }
        Commands::Restore { .. } => {}
        command => {
            match cache.prune(config.cache_max_age_days) {
                Ok(0) => {}
                Ok(n) => log::info!(
                    "Pruned {n} cache entries older than {} days",
                    config.cache_max_age_days
                ),
                Err(e) => log::warn!("Cache prune failed: {e}"),
            }
            run_analysis_command(command, &config, cache, cli.json)?;
        }
    }

    Ok(())
}

fn run_analysis_command(
    command: Commands,
    config: &AppConfig,
    cache: Arc<ContentCache>,
    json: bool,
) -> Result<()> {
    match command {
        Commands::Analyze {
            args,
            status,
            name,
            sort,
            desc,
            snapshot,
        } => {
            let (library, summary) = analyze(&args, config, cache)?;
            let library = read_library(&library)?;
            if let Some(path) = snapshot {
                let contents = serde_json::to_string_pretty(&library.snapshot())?;
                std::fs::write(&path, contents)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                log::info!("Snapshot written to {}", path.display());
            }

            let filter = LibraryFilter {
                state: status,
                folder: None,
                name,
            };
            let view = library.view(&filter, sort, desc);
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_track_table(&view);
                println!();
                print_summary(&summary);
            }
        }

        Commands::Mashups {
            args,
            tolerance,
            cross_folder,
            pin,
            limit,
        } => {
            let (library, summary) = analyze(&args, config, cache)?;
            let options = MashupOptions {
                tolerance: tolerance.unwrap_or(config.bpm_tolerance),
                cross_folder,
                pinned_folders: pin,
                limit: Some(limit),
            };
            let candidates =
                mixlab::mashup::find_mashups(read_library(&library)?.tracks(), &options);
            if json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else {
                print_summary(&summary);
                println!();
                print_mashup_table(&candidates);
            }
        }

        Commands::Set {
            args,
            minutes,
            curve,
            no_harmonic,
            seed,
        } => {
            let (library, _) = analyze(&args, config, cache)?;
            let options = SetOptions {
                target_duration: minutes * 60.0,
                curve,
                harmonic: !no_harmonic,
            };
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let set = mixlab::setlist::generate_set(
                read_library(&library)?.tracks(),
                &options,
                &mut rng,
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&set)?);
            } else {
                print_set(&set);
            }
        }

        Commands::Duplicates { args } => {
            let (library, _) = analyze(&args, config, cache)?;
            let groups =
                mixlab::mashup::duplicates::find_duplicates(&read_library(&library)?.analyzed());
            if json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
            } else {
                print_duplicates(&groups);
            }
        }

        Commands::Cache { .. } | Commands::Restore { .. } => {}
    }
    Ok(())
}

fn read_library(
    library: &RwLock<TrackLibrary>,
) -> Result<std::sync::RwLockReadGuard<'_, TrackLibrary>> {
    library
        .read()
        .map_err(|_| anyhow!("Track library lock poisoned"))
}

/// Scan, submit and drain. Returns the shared library once every file has
/// been resolved.
fn analyze(
    args: &AnalyzeArgs,
    config: &AppConfig,
    cache: Arc<ContentCache>,
) -> Result<(Arc<RwLock<TrackLibrary>>, BatchSummary)> {
    let scan = mixlab::scanner::scan(&args.paths).context("Scan failed")?;
    if scan.files.is_empty() {
        anyhow::bail!("No supported audio files found");
    }

    let mut settings = config.extraction_settings();
    settings.mode = args.mode.unwrap_or(settings.mode);
    settings.segment_density = args.segments.unwrap_or(settings.segment_density);
    settings.beat_storage = args.beats.unwrap_or(settings.beat_storage);

    let mut options = config.analyzer_options();
    options.mode = settings.mode;
    if args.jobs > 0 {
        options.workers = args.jobs;
    }
    log::info!(
        "Analyzing {} files with {} workers ({} mode)",
        scan.files.len(),
        options.workers,
        settings.mode.as_str()
    );

    let library = Arc::new(RwLock::new(TrackLibrary::new()));
    let (tx, rx) = crossbeam_channel::unbounded();
    let analyzer = Analyzer::new(
        Arc::new(FeatureExtractor::new(settings)),
        cache,
        Arc::clone(&library),
        options,
    )
    .context("Failed to start worker pool")?
    .with_progress(tx);

    let pb = ProgressBar::new(scan.files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .context("Invalid progress template")?
        .progress_chars("#>-"),
    );
    let bar = pb.clone();
    let progress = std::thread::spawn(move || {
        for event in rx {
            if event.percent >= 100 {
                bar.inc(1);
            }
            bar.set_message(event.status);
        }
    });

    for file in scan.files {
        analyzer.submit(file);
    }
    let summary = analyzer.process_all();

    // dropping the analyzer closes the progress stream
    drop(analyzer);
    let _ = progress.join();
    pb.finish_with_message(format!(
        "Done: {} analyzed ({} cached), {} failed",
        summary.completed, summary.cache_hits, summary.failed
    ));

    Ok((library, summary))
}

fn run_cache_action(
    cache: &ContentCache,
    action: CacheAction,
    default_days: u32,
    json: bool,
) -> Result<()> {
    match action {
        CacheAction::Stats => {
            let stats = cache.stats().context("Failed to read cache stats")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Entries:         {}", stats.entries);
                println!("Bytes analyzed:  {}", stats.total_bytes_analyzed);
                let fmt = |t: Option<chrono::DateTime<chrono::Utc>>| {
                    t.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
                };
                println!("Oldest:          {}", fmt(stats.oldest));
                println!("Newest:          {}", fmt(stats.newest));
            }
        }
        CacheAction::Prune { days } => {
            let days = days.unwrap_or(default_days);
            let removed = cache.prune(days).context("Prune failed")?;
            println!("Removed {removed} entries older than {days} days");
        }
        CacheAction::Clear => {
            let removed = cache.clear().context("Clear failed")?;
            println!("Removed {removed} entries");
        }
    }
    Ok(())
}

fn restore(file: &Path, json: bool) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let snapshots: Vec<TrackSnapshot> =
        serde_json::from_str(&contents).context("Invalid snapshot file")?;
    let mut library = TrackLibrary::new();
    library.restore(&snapshots);

    let view = library.view(&LibraryFilter::default(), SortKey::Name, false);
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_track_table(&view);
        println!();
        println!(
            "{} tracks restored; re-run analyze with the original files to use them",
            view.len()
        );
    }
    Ok(())
}

/// Truncate to `width` characters, marking the cut with "...".
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let cut: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}

fn key_label(key: &str) -> String {
    match mixlab::model::Key::parse(key) {
        Some(k) => format!("{k} ({})", k.camelot()),
        None => key.to_string(),
    }
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "Analysis complete: {} analyzed ({} from cache), {} failed",
        summary.completed, summary.cache_hits, summary.failed
    );
}

fn print_track_table(tracks: &[&Track]) {
    println!(
        "{:<36} {:>6} {:<10} {:>5} {:>6}  {}",
        "Track", "BPM", "Key", "Eng", "Min", "Status"
    );
    println!("{}", "-".repeat(80));

    for t in tracks {
        let status = if t.is_analyzing {
            "analyzing".to_string()
        } else if let Some(err) = &t.error {
            truncate(err, 40)
        } else {
            "ok".to_string()
        };
        println!(
            "{:<36} {:>6.1} {:<10} {:>5.2} {:>6.1}  {}",
            truncate(&t.name, 36),
            t.bpm,
            key_label(&t.key),
            t.energy,
            t.duration / 60.0,
            status
        );
    }
}

fn print_mashup_table(candidates: &[MashupCandidate]) {
    println!(
        "{:<28} {:<28} {:>4} {:>5} {:>7} {:<7} {:<11} {:<12}",
        "Track 1", "Track 2", "PM", "dBPM", "Pitch%", "Tier", "Badge", "Difficulty"
    );
    println!("{}", "-".repeat(110));

    for c in candidates {
        println!(
            "{:<28} {:<28} {:>4} {:>5.1} {:>+7.1} {:<7} {:<11} {:<12}{}",
            truncate(&c.track1.name, 28),
            truncate(&c.track2.name, 28),
            c.perfect_match,
            c.bpm_difference,
            c.pitch.percent,
            c.harmonic_tier.to_string(),
            c.match_badge.as_str(),
            c.difficulty.as_str(),
            if c.half_time { "  (half-time)" } else { "" },
        );
    }

    println!();
    println!("PM=Perfect-Match score  dBPM=BPM difference  Pitch%=change to track 2");
}

fn print_set(set: &GeneratedSet) {
    println!(
        "{:>3} {:<36} {:>6} {:<10} {:>5} {:>6} {:>6}",
        "#", "Track", "BPM", "Key", "Eng", "Target", "Min"
    );
    println!("{}", "-".repeat(80));

    for (i, t) in set.tracks.iter().enumerate() {
        println!(
            "{:>3} {:<36} {:>6.1} {:<10} {:>5.2} {:>6.2} {:>6.1}",
            i + 1,
            truncate(&t.name, 36),
            t.bpm,
            key_label(&t.key),
            t.energy,
            t.target_energy,
            t.duration / 60.0
        );
    }

    println!();
    println!(
        "Total: {:.1} min, {} transitions, average transition score {:.2}",
        set.total_duration / 60.0,
        set.transitions.len(),
        set.average_transition_score
    );
    let clashes = set.transitions.iter().filter(|t| !t.key_compatible).count();
    if clashes > 0 {
        println!("{clashes} transitions are not key-compatible");
    }
}

fn print_duplicates(groups: &[DuplicateGroup]) {
    if groups.is_empty() {
        println!("No duplicates found");
        return;
    }
    for g in groups {
        println!("{} ({:?})", g.base_name, g.kind);
        for name in &g.names {
            println!("    {name}");
        }
    }
}
