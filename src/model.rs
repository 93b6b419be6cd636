use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Configuration enums
// =============================================================================

/// How much of a track the extractor looks at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    /// 15 seconds centered on the middle of the track
    Quick,
    /// 30 seconds from the start
    #[default]
    Full,
    /// 45 seconds from the start
    HighPrecision,
}

impl AnalysisMode {
    pub fn window_secs(self) -> f64 {
        match self {
            AnalysisMode::Quick => 15.0,
            AnalysisMode::Full => 30.0,
            AnalysisMode::HighPrecision => 45.0,
        }
    }

    /// (start, length) of the analysis window in seconds for a track of
    /// `duration` seconds. Tracks shorter than the window are used whole.
    pub fn window(self, duration: f64) -> (f64, f64) {
        let len = self.window_secs();
        if duration <= len {
            return (0.0, duration.max(0.0));
        }
        match self {
            AnalysisMode::Quick => ((duration / 2.0 - len / 2.0).max(0.0), len),
            AnalysisMode::Full | AnalysisMode::HighPrecision => (0.0, len),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Quick => "quick",
            AnalysisMode::Full => "full",
            AnalysisMode::HighPrecision => "high-precision",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentDensity {
    Light,
    #[default]
    Standard,
    Detailed,
}

impl SegmentDensity {
    pub fn count(self) -> usize {
        match self {
            SegmentDensity::Light => 4,
            SegmentDensity::Standard => 8,
            SegmentDensity::Detailed => 16,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BeatStorage {
    None,
    #[default]
    Count,
    Full,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BpmTolerance {
    Strict,
    #[default]
    Normal,
    Flexible,
    Creative,
}

impl BpmTolerance {
    /// Maximum direct BPM difference for a pair to be considered.
    pub fn bpm(self) -> f64 {
        match self {
            BpmTolerance::Strict => 2.0,
            BpmTolerance::Normal => 5.0,
            BpmTolerance::Flexible => 10.0,
            BpmTolerance::Creative => 15.0,
        }
    }
}

// =============================================================================
// Musical key
// =============================================================================

/// Pitch class (chromatic note, octave-independent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PitchClass {
    C,
    Cs,
    D,
    Ds,
    E,
    F,
    Fs,
    G,
    Gs,
    A,
    As,
    B,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::Cs,
        PitchClass::D,
        PitchClass::Ds,
        PitchClass::E,
        PitchClass::F,
        PitchClass::Fs,
        PitchClass::G,
        PitchClass::Gs,
        PitchClass::A,
        PitchClass::As,
        PitchClass::B,
    ];

    pub fn from_index(idx: usize) -> Self {
        Self::ALL[idx % 12]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            PitchClass::C => "C",
            PitchClass::Cs => "C#",
            PitchClass::D => "D",
            PitchClass::Ds => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::Fs => "F#",
            PitchClass::G => "G",
            PitchClass::Gs => "G#",
            PitchClass::A => "A",
            PitchClass::As => "A#",
            PitchClass::B => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Major,
    Minor,
}

/// Root + mode. Displays as "Am", "F#m", "C".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub root: PitchClass,
    pub mode: Mode,
}

impl Key {
    pub fn new(root: PitchClass, mode: Mode) -> Self {
        Self { root, mode }
    }

    /// Parse a key from the spellings found in tags and analysis output:
    /// "Am", "C#", "Bbm", "F# minor", "Cmaj", "E♭m", or Camelot codes ("8A").
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(key) = Self::from_camelot_code(s) {
            return Some(key);
        }

        let mut chars = s.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let base: i32 = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };

        let rest: String = chars.collect();
        let (offset, rest) = match rest.chars().next() {
            Some('#') | Some('♯') => (1, &rest[rest.chars().next().map_or(0, char::len_utf8)..]),
            Some('b') | Some('♭') => (-1, &rest[rest.chars().next().map_or(0, char::len_utf8)..]),
            _ => (0, rest.as_str()),
        };

        let mode = match rest.trim().to_ascii_lowercase().as_str() {
            "" | "maj" | "major" => Mode::Major,
            "m" | "min" | "minor" => Mode::Minor,
            _ => return None,
        };

        let root = PitchClass::from_index((base + offset).rem_euclid(12) as usize);
        Some(Self { root, mode })
    }

    fn from_camelot_code(s: &str) -> Option<Self> {
        let (idx, letter) = s.char_indices().last()?;
        let letter = letter.to_ascii_uppercase();
        let digits = &s[..idx];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let number: u8 = digits.parse().ok()?;
        if !(1..=12).contains(&number) {
            return None;
        }
        // Inverse of the major numbering below (7 is its own inverse mod 12).
        let major_pc = (7 * (number as i32 - 8)).rem_euclid(12) as usize;
        match letter {
            'B' => Some(Self::new(PitchClass::from_index(major_pc), Mode::Major)),
            'A' => Some(Self::new(PitchClass::from_index(major_pc + 9), Mode::Minor)),
            _ => None,
        }
    }

    /// Position on the 12-step wheel (1-12). Minor keys share the number of
    /// their relative major.
    pub fn camelot_number(self) -> u8 {
        let major_pc = match self.mode {
            Mode::Major => self.root.index(),
            Mode::Minor => (self.root.index() + 3) % 12,
        };
        (((major_pc * 7) % 12 + 7) % 12 + 1) as u8
    }

    pub fn camelot_letter(self) -> char {
        match self.mode {
            Mode::Major => 'B',
            Mode::Minor => 'A',
        }
    }

    pub fn camelot(self) -> String {
        format!("{}{}", self.camelot_number(), self.camelot_letter())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Mode::Major => write!(f, "{}", self.root.name()),
            Mode::Minor => write!(f, "{}m", self.root.name()),
        }
    }
}

// =============================================================================
// Extraction output
// =============================================================================

/// Key string used when no key could be determined.
pub const UNKNOWN_KEY: &str = "Unknown";

/// Upper bound on a believable tempo.
pub const MAX_BPM: f64 = 300.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    /// Local energy (0-1)
    pub energy: f64,
    /// Local loudness in dBFS
    pub loudness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub bpm: f64,
    pub key: String,
    /// Tempo confidence (0-1)
    pub confidence: f64,
    pub key_confidence: f64,
    pub energy: f64,
    pub danceability: f64,
    /// None when beat storage is disabled
    pub beat_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub beat_times: Vec<f64>,
    pub duration: f64,
    pub spectral_centroid: f64,
    pub segments: Vec<Segment>,
    pub analysis_mode: AnalysisMode,
    pub analyzed_duration: f64,
}

impl ExtractionResult {
    /// The well-formed result every failure degrades to.
    pub fn placeholder(mode: AnalysisMode) -> Self {
        Self {
            bpm: 0.0,
            key: UNKNOWN_KEY.to_string(),
            confidence: 0.0,
            key_confidence: 0.0,
            energy: 0.0,
            danceability: 0.0,
            beat_count: None,
            beat_times: Vec::new(),
            duration: 0.0,
            spectral_centroid: 0.0,
            segments: Vec::new(),
            analysis_mode: mode,
            analyzed_duration: 0.0,
        }
    }

    /// BPM within (0, 300] and a recognized key. Only valid results are
    /// cached or marked analyzed.
    pub fn is_valid(&self) -> bool {
        self.bpm.is_finite()
            && self.bpm > 0.0
            && self.bpm <= MAX_BPM
            && Key::parse(&self.key).is_some()
    }
}

/// Emitted on the progress stream for every task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub task_id: u64,
    pub track_id: u64,
    pub percent: u8,
    pub status: String,
}

/// One file handed over by ingestion.
#[derive(Debug, Clone)]
pub struct IngestFile {
    pub bytes: Arc<[u8]>,
    pub file_name: String,
    /// Path or other origin reference, kept on the track
    pub source: String,
    pub folder: Option<String>,
}

impl IngestFile {
    pub fn new(bytes: impl Into<Arc<[u8]>>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            bytes: bytes.into(),
            source: file_name.clone(),
            file_name,
            folder: None,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

// =============================================================================
// Tracks
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: u64,
    pub name: String,
    /// Where the bytes came from (path or file name)
    pub source: String,
    /// Folder path hint relative to the ingestion root
    pub folder: Option<String>,
    pub duration: f64,
    pub bpm: f64,
    pub key: String,
    pub confidence: f64,
    pub key_confidence: f64,
    pub energy: f64,
    pub danceability: f64,
    pub beat_count: Option<u32>,
    pub analysis_mode: Option<AnalysisMode>,
    pub analyzed_duration: f64,
    pub segments: Vec<Segment>,
    #[serde(skip)]
    pub audio: Option<Arc<[u8]>>,
    pub error: Option<String>,
    pub is_analyzing: bool,
}

impl Track {
    /// A freshly admitted track, waiting for analysis.
    pub fn placeholder(
        id: u64,
        name: impl Into<String>,
        source: impl Into<String>,
        folder: Option<String>,
        audio: Option<Arc<[u8]>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            source: source.into(),
            folder,
            duration: 0.0,
            bpm: 0.0,
            key: String::new(),
            confidence: 0.0,
            key_confidence: 0.0,
            energy: 0.0,
            danceability: 0.0,
            beat_count: None,
            analysis_mode: None,
            analyzed_duration: 0.0,
            segments: Vec::new(),
            audio,
            error: None,
            is_analyzing: true,
        }
    }

    pub fn apply(&mut self, result: &ExtractionResult) {
        self.duration = result.duration;
        self.bpm = result.bpm;
        self.key = result.key.clone();
        self.confidence = result.confidence;
        self.key_confidence = result.key_confidence;
        self.energy = result.energy;
        self.danceability = result.danceability;
        self.beat_count = result.beat_count;
        self.analysis_mode = Some(result.analysis_mode);
        self.analyzed_duration = result.analyzed_duration;
        self.segments = result.segments.clone();
        self.error = None;
        self.is_analyzing = false;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.is_analyzing = false;
    }

    pub fn is_analyzed(&self) -> bool {
        !self.is_analyzing && self.error.is_none() && self.bpm > 0.0 && !self.key.is_empty()
    }

    pub fn parsed_key(&self) -> Option<Key> {
        Key::parse(&self.key)
    }

    /// Leading segment of the folder hint, or "" when there is none.
    pub fn folder_label(&self) -> &str {
        self.folder
            .as_deref()
            .and_then(|f| f.split(['/', '\\']).find(|seg| !seg.is_empty()))
            .unwrap_or("")
    }
}

/// Minimal per-track record handed to session storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: u64,
    pub name: String,
    pub source: String,
    pub bpm: f64,
    pub key: String,
    pub duration: f64,
}

impl From<&Track> for TrackSnapshot {
    fn from(t: &Track) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            source: t.source.clone(),
            bpm: t.bpm,
            key: t.key.clone(),
            duration: t.duration,
        }
    }
}
