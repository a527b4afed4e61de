//! File-backed project registry.
//!
//! The whole map is persisted as one JSON document. Writes go to a sibling
//! temp file that is renamed over the real path, so a reader (or a restart
//! after a crash) only ever sees a complete document.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use appforge_process::{ProjectId, ProjectPatch, ProjectRecord};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::error::RegistryError;

pub type ProjectMap = BTreeMap<ProjectId, ProjectRecord>;

/// Older state files stored a bare list of records.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum StoredDocument {
    Map(ProjectMap),
    List(Vec<ProjectRecord>),
}

fn parse_document(raw: &[u8]) -> Result<ProjectMap, serde_json::Error> {
    let doc = serde_json::from_slice::<StoredDocument>(raw)?;
    Ok(match doc {
        StoredDocument::Map(map) => map,
        StoredDocument::List(list) => list.into_iter().map(|r| (r.id.clone(), r)).collect(),
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "registry".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read the registry document. Never fails: a missing file is an empty map,
/// an unreadable or corrupt one is logged, replaced with an empty document and
/// treated as empty.
pub async fn load(path: &Path) -> ProjectMap {
    let raw = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ProjectMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read registry, starting empty");
            return ProjectMap::new();
        }
    };

    match parse_document(&raw) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt registry, resetting to empty");
            let empty = ProjectMap::new();
            if let Err(e) = save(path, &empty).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to heal corrupt registry");
            }
            empty
        }
    }
}

/// Atomically replace the registry document with `map`.
pub async fn save(path: &Path, map: &ProjectMap) -> Result<(), RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let data = serde_json::to_vec_pretty(map)?;
    let tmp = tmp_path(path);
    let mut f = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
    f.write_all(&data).await.map_err(io_err)?;
    f.flush().await.map_err(io_err)?;
    f.sync_all().await.map_err(io_err)?;
    drop(f);

    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// Shared handle to the in-memory registry plus its backing file.
///
/// Mutations are applied to a copy, persisted, and only then committed in
/// memory: if the save fails the caller gets the error and nothing changes.
#[derive(Clone, Debug)]
pub struct Registry {
    path: Arc<PathBuf>,
    inner: Arc<Mutex<ProjectMap>>,
}

impl Registry {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = load(&path).await;
        tracing::info!(path = %path.display(), projects = map.len(), "registry loaded");
        Self {
            path: Arc::new(path),
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, id: &ProjectId) -> Option<ProjectRecord> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn list_all(&self) -> Vec<ProjectRecord> {
        self.inner.lock().await.values().cloned().collect()
    }

    /// Ports held by tracked projects.
    pub async fn ports(&self) -> BTreeSet<u16> {
        self.inner.lock().await.values().map(|r| r.port).collect()
    }

    pub async fn put(&self, record: ProjectRecord) -> Result<(), RegistryError> {
        let mut map = self.inner.lock().await;
        let mut next = map.clone();
        next.insert(record.id.clone(), record);
        save(&self.path, &next).await?;
        *map = next;
        Ok(())
    }

    /// Merge `patch` into the record for `id`. `Ok(None)` if the id is unknown.
    pub async fn update(
        &self,
        id: &ProjectId,
        patch: &ProjectPatch,
    ) -> Result<Option<ProjectRecord>, RegistryError> {
        let mut map = self.inner.lock().await;
        let Some(current) = map.get(id) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        updated.apply(patch);

        let mut next = map.clone();
        next.insert(id.clone(), updated.clone());
        save(&self.path, &next).await?;
        *map = next;
        Ok(Some(updated))
    }

    /// Apply several patches and persist once. Unknown ids are skipped.
    pub async fn update_many(
        &self,
        patches: &[(ProjectId, ProjectPatch)],
    ) -> Result<Vec<ProjectRecord>, RegistryError> {
        let mut map = self.inner.lock().await;
        let mut next = map.clone();
        let mut out = Vec::with_capacity(patches.len());
        for (id, patch) in patches {
            if let Some(rec) = next.get_mut(id) {
                rec.apply(patch);
                out.push(rec.clone());
            }
        }
        save(&self.path, &next).await?;
        *map = next;
        Ok(out)
    }
}
