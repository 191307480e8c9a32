//! File-backed dead-letter store using JSON lines.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::{CoreError, DeadLetter, DeadLetterStore};

fn backend<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::Backend(err.to_string())
}

/// Dead letters appended to `<path>/<stream>_dead_letters.jsonl`.
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    stream: String,
    letters: Mutex<Vec<DeadLetter>>,
}

impl FileDeadLetterStore {
    /// Open the store, loading letters already on disk.
    ///
    /// # Errors
    ///
    /// [`CoreError::Backend`] if the directory cannot be created or the file cannot be parsed.
    pub fn open(path: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path).map_err(backend)?;
        let store = Self {
            path,
            stream: stream.into(),
            letters: Mutex::new(Vec::new()),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}_dead_letters.jsonl", self.stream))
    }

    fn load_from_disk(&self) -> Result<(), CoreError> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).open(&file_path).map_err(backend)?;
        let mut letters = self.letters.lock();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(backend)?;
            if line.trim().is_empty() {
                continue;
            }
            letters.push(serde_json::from_str(&line).map_err(backend)?);
        }
        Ok(())
    }

    fn append_to_disk(&self, letter: &DeadLetter) -> Result<(), CoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())
            .map_err(backend)?;
        let line = serde_json::to_string(letter).map_err(backend)?;
        writeln!(file, "{line}").map_err(backend)
    }
}

impl DeadLetterStore for FileDeadLetterStore {
    fn deliver(&self, letter: DeadLetter) -> Result<(), CoreError> {
        let mut letters = self.letters.lock();
        self.append_to_disk(&letter)?;
        letters.push(letter);
        Ok(())
    }

    fn fetch(&self, since_ms: Option<u128>, limit: usize) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .iter()
            .filter(|l| since_ms.is_none_or(|s| l.dead_lettered_at >= s))
            .take(limit)
            .cloned()
            .collect()
    }
}
