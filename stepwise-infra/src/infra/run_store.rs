use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum RunStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid run id")]
    InvalidKey,
    #[error("Run record must be a JSON object with a string id")]
    InvalidRecord,
    #[error("Run already exists: {0}")]
    AlreadyExists(String),
    #[error("Run not found: {0}")]
    NotFound(String),
}

/// One JSON file per run under `base_path`.
pub struct RunStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, RunStoreError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf, RunStoreError> {
        if run_id.is_empty()
            || run_id.contains("..")
            || run_id.contains('/')
            || run_id.contains('\\')
        {
            return Err(RunStoreError::InvalidKey);
        }
        Ok(self.base_path.join(format!("{}.json", run_id)))
    }

    /// Persist a new record. The record's `id` field names the file.
    pub fn create(&self, record: &Value) -> Result<String, RunStoreError> {
        let run_id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or(RunStoreError::InvalidRecord)?
            .to_string();
        let path = self.run_path(&run_id)?;

        let _guard = self.write_lock.lock();
        if path.exists() {
            return Err(RunStoreError::AlreadyExists(run_id));
        }
        write_atomic(&path, record)?;
        Ok(run_id)
    }

    /// Merge the top-level fields of `patch` into the stored record.
    pub fn update(&self, run_id: &str, patch: &Value) -> Result<Value, RunStoreError> {
        let patch = patch.as_object().ok_or(RunStoreError::InvalidRecord)?;
        let path = self.run_path(run_id)?;

        let _guard = self.write_lock.lock();
        if !path.exists() {
            return Err(RunStoreError::NotFound(run_id.to_string()));
        }
        let mut record: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        let fields = record
            .as_object_mut()
            .ok_or(RunStoreError::InvalidRecord)?;
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
        write_atomic(&path, &record)?;
        Ok(record)
    }

    pub fn load(&self, run_id: &str) -> Result<Option<Value>, RunStoreError> {
        let path = self.run_path(run_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// All records whose `sessionId` matches, oldest first.
    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<Value>, RunStoreError> {
        let mut runs = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: Value = match fs::read_to_string(&path)
                .map_err(RunStoreError::from)
                .and_then(|c| serde_json::from_str(&c).map_err(RunStoreError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    // Skip corrupted records
                    warn!(path = %path.display(), error = %e, "Skipping unreadable run record");
                    continue;
                }
            };
            if record.get("sessionId").and_then(Value::as_str) == Some(session_id) {
                runs.push(record);
            }
        }

        runs.sort_by(|a, b| {
            let a = a.get("startedAt").and_then(Value::as_str).unwrap_or_default();
            let b = b.get("startedAt").and_then(Value::as_str).unwrap_or_default();
            a.cmp(b)
        });
        Ok(runs)
    }
}

fn write_atomic(path: &Path, record: &Value) -> Result<(), RunStoreError> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        let json = serde_json::to_string_pretty(record)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
