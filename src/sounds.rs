use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use thiserror::Error;

use crate::audio::write_tone_wav;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["wav", "mp3", "ogg"];
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_SOUND: &str = "default.wav";
pub const SOUNDS_URL_PREFIX: &str = "/sounds/";

#[derive(Debug, Error)]
pub enum SoundError {
    #[error("no selected file")]
    MissingFile,
    #[error("invalid file type; allowed: wav, mp3, ogg")]
    InvalidType,
    #[error("file exceeds the {MAX_UPLOAD_BYTES} byte limit")]
    TooLarge,
    #[error("failed to store sound: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory of custom alarm sounds.
#[derive(Debug, Clone)]
pub struct SoundLibrary {
    dir: PathBuf,
}

impl SoundLibrary {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create sounds directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names of the stored sounds with an allowed extension, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && is_allowed(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Stores an upload under its sanitized name, replacing any file of the
    /// same name. Returns the stored name.
    pub fn save_upload(&self, filename: &str, data: &[u8]) -> Result<String, SoundError> {
        if filename.trim().is_empty() {
            return Err(SoundError::MissingFile);
        }
        let name = secure_filename(filename);
        if !is_allowed(&name) {
            return Err(SoundError::InvalidType);
        }
        if data.len() > MAX_UPLOAD_BYTES {
            return Err(SoundError::TooLarge);
        }
        fs::write(self.dir.join(&name), data)?;
        info!("stored sound {name} ({} bytes)", data.len());
        Ok(name)
    }

    /// Maps a sound reference (a bare file name or a `/sounds/<name>` URL) to
    /// a file inside the library. Anything that would escape the directory or
    /// does not exist resolves to `None`.
    pub fn resolve(&self, sound: &str) -> Option<PathBuf> {
        let raw = sound.trim();
        let name = raw.strip_prefix(SOUNDS_URL_PREFIX).unwrap_or(raw);
        if name.is_empty() || secure_filename(name) != name || !is_allowed(name) {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// Writes the 440 Hz fallback sound when it is missing. Returns whether a
    /// file was created.
    pub fn ensure_default_sound(&self) -> Result<bool> {
        let path = self.dir.join(DEFAULT_SOUND);
        if path.exists() {
            return Ok(false);
        }
        write_tone_wav(&path, 440.0, 0.8, Duration::from_secs(1))?;
        info!("created default sound at {}", path.display());
        Ok(true)
    }
}

pub fn sound_url(name: &str) -> String {
    format!("{SOUNDS_URL_PREFIX}{name}")
}

/// Reduces an uploaded name to a plain ASCII file name: no directories,
/// whitespace folded to `_`, and no leading or trailing dots.
pub fn secure_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
        .collect::<String>();
    cleaned.trim_matches(['.', '_']).to_string()
}

fn is_allowed(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}
