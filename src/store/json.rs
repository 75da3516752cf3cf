//! File-backed state store.
//!
//! Records live under the state directory as `contexts/{id}.json`,
//! `mappings/{id}.json`, and `jobs/{context_id}.json`. Writes go to a
//! temporary sibling first and are renamed into place.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{ContextId, FailoverJob, NetworkMapping, VmContext};

use super::{FailoverStore, StoreError};

const CONTEXTS: &str = "contexts";
const MAPPINGS: &str = "mappings";
const JOBS: &str = "jobs";

/// Stores each record as a pretty-printed JSON document.
#[derive(Clone, Debug)]
pub struct JsonStateStore {
    root: Utf8PathBuf,
}

impl JsonStateStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// State directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn read<T: DeserializeOwned>(&self, section: &str, id: &str) -> Result<Option<T>, StoreError> {
        let dir_path = self.root.join(section);
        let file_name = document_name(&dir_path, id)?;
        let path = dir_path.join(&file_name);

        let dir = match Dir::open_ambient_dir(&dir_path, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&dir_path, &err)),
        };
        let contents = match dir.read_to_string(&file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, &err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StoreError::Parse {
                path,
                message: err.to_string(),
            })
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        section: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let dir_path = self.root.join(section);
        let file_name = document_name(&dir_path, id)?;
        let path = dir_path.join(&file_name);
        let rendered = serde_json::to_string_pretty(value).map_err(|err| StoreError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;

        Dir::create_ambient_dir_all(&dir_path, ambient_authority())
            .map_err(|err| io_error(&dir_path, &err))?;
        let dir = Dir::open_ambient_dir(&dir_path, ambient_authority())
            .map_err(|err| io_error(&dir_path, &err))?;

        let staging = format!(".{file_name}.tmp");
        dir.write(&staging, rendered)
            .map_err(|err| io_error(&dir_path.join(&staging), &err))?;
        dir.rename(&staging, &dir, &file_name)
            .map_err(|err| io_error(&path, &err))
    }
}

fn document_name(dir: &Utf8Path, id: &str) -> Result<String, StoreError> {
    let trimmed = id.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\'])
    {
        return Err(StoreError::Io {
            path: dir.to_path_buf(),
            message: format!("identifier {id:?} cannot be used as a file name"),
        });
    }
    Ok(format!("{trimmed}.json"))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

impl FailoverStore for JsonStateStore {
    fn context(&self, context_id: &ContextId) -> Result<VmContext, StoreError> {
        self.read(CONTEXTS, context_id)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "context",
                id: context_id.to_string(),
            })
    }

    fn save_context(&self, context: &VmContext) -> Result<(), StoreError> {
        self.write(CONTEXTS, &context.context_id, context)
    }

    fn network_mappings(&self, context_id: &ContextId) -> Result<Vec<NetworkMapping>, StoreError> {
        Ok(self.read(MAPPINGS, context_id)?.unwrap_or_default())
    }

    fn save_network_mappings(
        &self,
        context_id: &ContextId,
        mappings: &[NetworkMapping],
    ) -> Result<(), StoreError> {
        self.write(MAPPINGS, context_id, mappings)
    }

    fn jobs(&self, context_id: &ContextId) -> Result<Vec<FailoverJob>, StoreError> {
        Ok(self.read(JOBS, context_id)?.unwrap_or_default())
    }

    fn save_job(&self, job: &FailoverJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs(&job.context_id)?;
        match jobs.iter_mut().find(|existing| existing.job_id == job.job_id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.write(JOBS, &job.context_id, &jobs)
    }
}
