use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use lofty::probe::Probe;
use std::io::Cursor;

/// Values a tagging tool may already have written into the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddedTags {
    pub bpm: Option<f64>,
    pub key: Option<String>,
}

impl EmbeddedTags {
    pub fn is_empty(&self) -> bool {
        self.bpm.is_none() && self.key.is_none()
    }
}

/// Read BPM and key tags from in-memory file bytes. Returns empty tags on
/// failure; tag reading never fails an analysis.
pub fn read_tags(bytes: &[u8], file_name: &str) -> EmbeddedTags {
    let tagged_file = match Probe::new(Cursor::new(bytes))
        .guess_file_type()
        .map_err(lofty::error::LoftyError::from)
        .and_then(|probe| probe.read())
    {
        Ok(f) => f,
        Err(e) => {
            log::debug!("Could not read tags from {file_name}: {e}");
            return EmbeddedTags::default();
        }
    };

    let Some(tag) = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())
    else {
        return EmbeddedTags::default();
    };

    let bpm = tag
        .get_string(&ItemKey::Bpm)
        .or_else(|| tag.get_string(&ItemKey::IntegerBpm))
        .and_then(parse_bpm);
    let key = tag
        .get_string(&ItemKey::InitialKey)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string());

    EmbeddedTags { bpm, key }
}

/// Tag BPMs show up as "128", "127.98", or "128 BPM".
fn parse_bpm(raw: &str) -> Option<f64> {
    let digits = raw.trim().trim_end_matches(|c: char| c.is_alphabetic() || c.is_whitespace());
    digits
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|b| b.is_finite() && *b > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bpm_variants() {
        assert_eq!(parse_bpm("128"), Some(128.0));
        assert_eq!(parse_bpm(" 127.98 "), Some(127.98));
        assert_eq!(parse_bpm("128 BPM"), Some(128.0));
        assert_eq!(parse_bpm("0"), None);
        assert_eq!(parse_bpm("fast"), None);
    }

    #[test]
    fn test_garbage_bytes_give_empty_tags() {
        let tags = read_tags(&[1, 2, 3, 4], "x.mp3");
        assert!(tags.is_empty());
    }
}
