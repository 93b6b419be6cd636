pub mod analyzer;
pub mod cache;
pub mod config;
pub mod db;
pub mod library;
pub mod mashup;
pub mod model;
pub mod pool;
pub mod scanner;
pub mod setlist;

/// Audio file extensions we accept from the ingestion side
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "wav", "aif", "aiff", "m4a", "aac",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "mixlab";
