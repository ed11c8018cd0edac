//! Client-side persistence: session records and downloaded results.

use crate::model::SessionRecord;
use crate::session::SessionStore;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "sheetflow";

/// Root data directory for this client.
pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine the platform data directory")?;
    Ok(base.join(APP_DIR))
}

/// Session records stored as one JSON file per session id.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn in_data_dir() -> Result<Self> {
        let dir = data_dir()?.join("sessions");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self::new(dir))
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids are opaque; keep the filename flat.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            })
            .collect();
        self.dir.join(format!("session-{}.json", safe))
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(&record.session_id);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.path_for(session_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let record = serde_json::from_str(&text)
            .with_context(|| format!("corrupt session record {}", path.display()))?;
        Ok(Some(record))
    }

    fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// Default location for a downloaded result when the caller gave no path.
pub fn default_result_path(filename: &str) -> Result<PathBuf> {
    let dir = data_dir()?.join("results");
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result.bin".to_string());
    Ok(dir.join(format!("translated-{}", name)))
}

/// Write downloaded result bytes, creating parent directories as needed.
pub fn save_result(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
