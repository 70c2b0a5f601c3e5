use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use super::{check_revision, DraftMedia, JobStore};
use crate::error::StoreError;
use crate::jobs::{GenerationJob, JobId};

const JOBS_KEY: &str = "jobs";
const DRAFTS_KEY: &str = "drafts";

/// Job store backed by a single pretty-printed JSON document.
///
/// Every write re-reads the document, touches only its own row and replaces
/// the file with the merged result while holding an exclusive lock on a
/// sidecar `<path>.lock`, so store instances in any number of processes can
/// share a path. Replacement goes through a temp file and a rename; readers
/// never see a partial document and do not take the lock.
#[derive(Debug)]
pub struct JsonFileJobStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn draft_media(&self, content_draft_id: &str) -> Result<Option<DraftMedia>, StoreError> {
        let document = read_json_object(&self.path)?;
        row(&document, DRAFTS_KEY, content_draft_id)
    }

    fn with_document<T>(
        &self,
        mutate: impl FnOnce(&mut Map<String, Value>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock_exclusive()?;
        let mut document = read_json_object(&self.path)?;
        let result = mutate(&mut document)?;
        write_json_object(&self.path, &document)?;
        Ok(result)
    }

    /// The lock is released when the returned handle is dropped.
    fn lock_exclusive(&self) -> Result<File, StoreError> {
        std::fs::create_dir_all(parent_dir(&self.path)).map_err(StoreError::storage)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(StoreError::storage)?;
        FileExt::lock_exclusive(&file).map_err(StoreError::storage)?;
        Ok(file)
    }
}

impl JobStore for JsonFileJobStore {
    fn create_job(&self, job: &GenerationJob) -> Result<u64, StoreError> {
        self.with_document(|document| {
            let key = job.id.to_string();
            if row::<GenerationJob>(document, JOBS_KEY, &key)?.is_some() {
                return Err(StoreError::AlreadyExists(job.id));
            }
            let stored = GenerationJob {
                revision: 1,
                ..job.clone()
            };
            put_row(document, JOBS_KEY, &key, &stored)?;
            Ok(1)
        })
    }

    fn load_job(&self, id: JobId) -> Result<Option<GenerationJob>, StoreError> {
        let document = read_json_object(&self.path)?;
        row(&document, JOBS_KEY, &id.to_string())
    }

    fn save_job(&self, job: &GenerationJob) -> Result<u64, StoreError> {
        self.with_document(|document| {
            let key = job.id.to_string();
            let Some(stored) = row::<GenerationJob>(document, JOBS_KEY, &key)? else {
                return Err(StoreError::NotFound(job.id));
            };
            check_revision(&stored, job)?;
            let revision = job.revision + 1;
            let updated = GenerationJob {
                revision,
                ..job.clone()
            };
            put_row(document, JOBS_KEY, &key, &updated)?;
            Ok(revision)
        })
    }

    fn update_content_draft_media(
        &self,
        content_draft_id: &str,
        media: &DraftMedia,
    ) -> Result<(), StoreError> {
        self.with_document(|document| put_row(document, DRAFTS_KEY, content_draft_id, media))
    }
}

fn row<T: DeserializeOwned>(
    document: &Map<String, Value>,
    section: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(value) = document
        .get(section)
        .and_then(Value::as_object)
        .and_then(|rows| rows.get(key))
    else {
        return Ok(None);
    };
    serde_json::from_value(value.clone())
        .map(Some)
        .map_err(StoreError::storage)
}

fn put_row<T: Serialize>(
    document: &mut Map<String, Value>,
    section: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(StoreError::storage)?;
    let rows = document
        .entry(section)
        .or_insert_with(|| Value::Object(Map::new()));
    if !rows.is_object() {
        *rows = Value::Object(Map::new());
    }
    if let Some(rows) = rows.as_object_mut() {
        rows.insert(key.to_string(), value);
    }
    Ok(())
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => return Err(StoreError::storage(err)),
    };
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw).map_err(StoreError::storage)?;
    Ok(parsed.as_object().cloned().unwrap_or_default())
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> Result<(), StoreError> {
    let body = serde_json::to_string_pretty(&Value::Object(payload.clone()))
        .map_err(StoreError::storage)?;
    let mut temp = NamedTempFile::new_in(parent_dir(path)).map_err(StoreError::storage)?;
    temp.write_all(body.as_bytes()).map_err(StoreError::storage)?;
    temp.as_file().sync_all().map_err(StoreError::storage)?;
    temp.persist(path).map_err(StoreError::storage)?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
