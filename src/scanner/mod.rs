use crate::SUPPORTED_EXTENSIONS;
use crate::model::IngestFile;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Path not found: {0}")]
    NotFound(String),
}

pub struct ScanResult {
    /// Files in walk order, ready to submit
    pub files: Vec<IngestFile>,
    pub errors: u64,
}

pub fn is_supported(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Folder hint for a file: its parent directory relative to the scan root,
/// or `None` when it sits directly in the root.
pub fn folder_hint(root: &Path, file: &Path) -> Option<String> {
    let parent = file.parent()?;
    let rel = parent.strip_prefix(root).ok()?;
    let hint = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!hint.is_empty()).then_some(hint)
}

/// Collect supported audio files under `paths` (files or directories) and
/// read their bytes.
pub fn scan(paths: &[PathBuf]) -> Result<ScanResult, ScanError> {
    // First pass: collect all audio file paths with their scan root
    let mut audio_files: Vec<(PathBuf, PathBuf)> = Vec::new();
    for root in paths {
        if !root.exists() {
            return Err(ScanError::NotFound(root.display().to_string()));
        }
        if root.is_file() {
            if is_supported(root) {
                let parent = root.parent().map(Path::to_path_buf).unwrap_or_default();
                audio_files.push((parent, root.clone()));
            }
            continue;
        }
        for entry in WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && is_supported(entry.path()) {
                audio_files.push((root.clone(), entry.into_path()));
            }
        }
    }

    let pb = ProgressBar::new(audio_files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message("Reading...");

    let mut result = ScanResult {
        files: Vec::with_capacity(audio_files.len()),
        errors: 0,
    };
    for (root, path) in &audio_files {
        match std::fs::read(path) {
            Ok(bytes) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut file = IngestFile::new(Arc::<[u8]>::from(bytes), file_name)
                    .with_source(path.display().to_string());
                file.folder = folder_hint(root, path);
                result.files.push(file);
            }
            Err(e) => {
                log::warn!("Error reading {}: {}", path.display(), e);
                result.errors += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    log::info!(
        "Found {} audio files ({} unreadable)",
        result.files.len(),
        result.errors
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_hint() {
        let root = Path::new("/music");
        assert_eq!(
            folder_hint(root, Path::new("/music/House/Deep/a.mp3")).as_deref(),
            Some("House/Deep")
        );
        assert_eq!(folder_hint(root, Path::new("/music/a.mp3")), None);
        assert_eq!(folder_hint(root, Path::new("/elsewhere/a.mp3")), None);
    }

    #[test]
    fn test_scan_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Techno")).unwrap();
        std::fs::write(dir.path().join("Techno/b.wav"), b"bytes").unwrap();
        std::fs::write(dir.path().join("a.MP3"), b"more").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let result = scan(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(result.errors, 0);
        let names: Vec<&str> = result.files.iter().map(|f| f.file_name.as_str()).collect();
        // byte order puts "Techno" before "a.MP3"
        assert_eq!(names, vec!["b.wav", "a.MP3"]);
        let techno = result.files.iter().find(|f| f.file_name == "b.wav").unwrap();
        assert_eq!(techno.folder.as_deref(), Some("Techno"));
        assert_eq!(&*techno.bytes, b"bytes");
    }

    #[test]
    fn test_missing_path() {
        assert!(matches!(
            scan(&[PathBuf::from("/definitely/not/here")]),
            Err(ScanError::NotFound(_))
        ));
    }
}
