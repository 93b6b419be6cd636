//! Grouping of tracks that are the same recording: byte-for-byte re-imports
//! and numbered versions of one song.

use crate::model::Track;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Maximum BPM spread for an exact duplicate group.
const EXACT_BPM_SPREAD: f64 = 1.0;

/// Audio-ish file extension at the end of a name.
static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[A-Za-z0-9]{1,5}$").unwrap());

/// Trailing version marker: `V1`, `v2`, `(V3)`, `Ver. 4`, `Version 5`, `(6)`
/// or a bare 1-2 digit number after a separator.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        [\s_\-]*
        (?:
            \(\s*(?:v|ver\.?|version)\s*(?P<paren_v>\d+)\s*\)
          | \b(?:v|ver\.?|version)\s*(?P<v>\d+)
          | \(\s*(?P<paren>\d+)\s*\)
          | [\s_\-](?P<bare>\d{1,2})
        )
        \s*$",
    )
    .unwrap()
});

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedName {
    /// Lowercased name without extension or version marker
    pub base: String,
    pub version: Option<u32>,
}

fn is_year(digits: &str) -> bool {
    digits.len() == 4 && digits.parse::<u32>().is_ok_and(|y| (1900..=2099).contains(&y))
}

pub fn normalize_name(name: &str) -> NormalizedName {
    let stem = EXTENSION_RE.replace(name.trim(), "");
    let mut base = stem.to_string();
    let mut version = None;

    if let Some(caps) = VERSION_RE.captures(&stem) {
        let digits = ["paren_v", "v", "paren", "bare"]
            .iter()
            .find_map(|g| caps.name(g))
            .map(|m| m.as_str());
        match (digits, caps.get(0)) {
            (Some(d), Some(whole)) if !is_year(d) && whole.start() > 0 => {
                version = d.parse().ok();
                base = stem[..whole.start()].to_string();
            }
            _ => {}
        }
    }

    let base = WHITESPACE_RE
        .replace_all(base.trim_end_matches(['-', '_', ' ']).trim(), " ")
        .to_lowercase();
    NormalizedName { base, version }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateKind {
    /// Numbered versions of one song
    Version,
    /// The same file admitted more than once
    Exact,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub kind: DuplicateKind,
    pub base_name: String,
    pub track_ids: Vec<u64>,
    pub names: Vec<String>,
}

/// Group tracks by normalized name. Groups come out in order of their first
/// member; a version marker anywhere in the group makes it a version group.
pub fn find_duplicates(tracks: &[Track]) -> Vec<DuplicateGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<(&Track, NormalizedName)>> = HashMap::new();
    for track in tracks {
        let norm = normalize_name(&track.name);
        if norm.base.is_empty() {
            continue;
        }
        let members = groups.entry(norm.base.clone()).or_insert_with(|| {
            order.push(norm.base.clone());
            Vec::new()
        });
        members.push((track, norm));
    }

    let mut out = Vec::new();
    for base in order {
        let Some(members) = groups.remove(&base) else {
            continue;
        };
        if members.len() < 2 {
            continue;
        }
        let kind = if members.iter().any(|(_, n)| n.version.is_some()) {
            DuplicateKind::Version
        } else if is_exact(&members) {
            DuplicateKind::Exact
        } else {
            continue;
        };
        out.push(DuplicateGroup {
            kind,
            base_name: base,
            track_ids: members.iter().map(|(t, _)| t.id).collect(),
            names: members.iter().map(|(t, _)| t.name.clone()).collect(),
        });
    }
    out
}

fn is_exact(members: &[(&Track, NormalizedName)]) -> bool {
    let Some((first, _)) = members.first() else {
        return false;
    };
    let (lo, hi) = members
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (t, _)| {
            (lo.min(t.bpm), hi.max(t.bpm))
        });
    members
        .iter()
        .all(|(t, _)| t.name == first.name && t.key == first.key)
        && hi - lo <= EXACT_BPM_SPREAD
}
