use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const FORMAT_VERSION: u32 = 1;

/// What survives a restart for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub source: PathBuf,
    pub output: PathBuf,
    pub duration: String,
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobListFile {
    version: u32,
    jobs: Vec<PersistedJob>,
}

/// Ordered job list kept in a single JSON file
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved jobs in file order. A missing file is an empty list.
    pub fn load(&self) -> Result<Vec<PersistedJob>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No job list at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let file: JobListFile = serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        if file.version != FORMAT_VERSION {
            return Err(StoreError::Version(file.version));
        }

        info!("Loaded {} job(s) from {}", file.jobs.len(), self.path.display());
        Ok(file.jobs)
    }

    /// Replace the saved list. Saving nothing removes the file.
    pub fn save(&self, jobs: &[PersistedJob]) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if jobs.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => {
                    debug!("Removed empty job list {}", self.path.display());
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(write_err(e)),
            };
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let json = serde_json::to_string_pretty(&JobListFile {
            version: FORMAT_VERSION,
            jobs: jobs.to_vec(),
        })?;

        // write-then-rename so a crash mid-save keeps the previous list
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        info!("Saved {} job(s) to {}", jobs.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// The store lives as long as the returned dir
    fn scratch_store() -> (TempDir, JobStore) {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("nested").join("jobs.json"));
        (dir, store)
    }

    fn job(n: u32) -> PersistedJob {
        PersistedJob {
            source: PathBuf::from(format!("/in/{}.mkv", n)),
            output: PathBuf::from(format!("/out/{}.mp4", n)),
            duration: "00:01:00".to_string(),
            command: format!("ffmpeg -i /in/{n}.mkv /out/{n}.mp4"),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, store) = scratch_store();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_keeps_order() {
        let (_dir, store) = scratch_store();
        let jobs = vec![job(3), job(1), job(2)];
        store.save(&jobs).unwrap();
        assert_eq!(store.load().unwrap(), jobs);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_saving_nothing_removes_file() {
        let (_dir, store) = scratch_store();
        store.save(&[job(1)]).unwrap();
        assert!(store.path().exists());
        store.save(&[]).unwrap();
        assert!(!store.path().exists());
        // and again, with nothing to remove
        store.save(&[]).unwrap();
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let (_dir, store) = scratch_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), r#"{"version": 7, "jobs": []}"#).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Version(7))));
    }

    #[test]
    fn test_corrupt_file_is_a_parse_error() {
        let (_dir, store) = scratch_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "[[[").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
    }
}
