// Timestamped run log for post-hoc timing of a pipeline run.
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

use crate::utils::file::append_file;

/// Append-only record of configuration and stage boundaries. Write failures
/// are reported once as warnings and never interrupt the pipeline.
pub struct RunLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RunLog {
    pub fn open(path: &Path) -> Self {
        let file = match append_file(path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot open run log {}: {}. Continuing without it.", path.display(), e);
                None
            }
        };
        RunLog {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, message: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        let Some(file) = guard.as_mut() else {
            return;
        };
        let line = format!("[{}] {}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            warn!("Run log {} is no longer writable: {}", self.path.display(), e);
            *guard = None;
        }
    }
}
