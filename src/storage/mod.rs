//! # Storage Module
//!
//! Decides where recordings go.
//!
//! ## Plain English
//!
//! Every time recording starts (or the game changes resolution mid-way) we
//! need a fresh output name. This module:
//! 1. Creates the output folder
//! 2. Generates unique names with date/time
//! 3. Names them after what the encoder writes: a file, or a folder of frames

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::WideCaptureResult;

// ============================================
// STORAGE MANAGER
// ============================================

/// Hands out output paths inside one directory.
pub struct StorageManager {
    /// Root directory for recordings
    output_directory: PathBuf,

    /// File name prefix
    stem: String,
}

impl StorageManager {
    /// Creates a storage manager, creating the directory if needed.
    pub fn new(output_directory: &str, stem: &str) -> WideCaptureResult<Self> {
        let path = PathBuf::from(output_directory);

        if !path.exists() {
            log::info!("Creating output directory: {:?}", path);
        }
        ensure_directory(&path)?;

        Ok(Self {
            output_directory: path,
            stem: stem.to_string(),
        })
    }

    /// Generates a path for a new recording.
    ///
    /// Format: `<stem>_YYYYMMDD_HHMMSS[.<extension>]`, with `_2`, `_3`, ...
    /// appended when that name is already taken. Without an extension the
    /// path names a directory.
    pub fn next_output_path(&self, extension: Option<&str>) -> PathBuf {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = format!("{}_{}", self.stem, timestamp);
        let name = |base: &str| match extension {
            Some(ext) => format!("{}.{}", base, ext),
            None => base.to_string(),
        };

        let mut candidate = self.output_directory.join(name(&base));
        let mut suffix = 2;
        while candidate.exists() {
            candidate = self
                .output_directory
                .join(name(&format!("{}_{}", base, suffix)));
            suffix += 1;
        }
        candidate
    }

    /// Returns the output directory.
    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }
}

// ============================================
// UTILITY FUNCTIONS
// ============================================

/// Ensures a directory exists.
pub fn ensure_directory(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Returns a human-readable size.
pub fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

// ============================================
// TESTS
// ============================================
