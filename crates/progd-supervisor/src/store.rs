use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use progd_process::Catalog;
use tokio::{io::AsyncWriteExt, sync::RwLock};

use crate::error::{Result, SupervisorError};

// Single-file JSON catalog. Reads share the lock; every
// load-mutate-save triple holds it exclusively.
#[derive(Debug)]
pub struct CatalogStore {
    path: PathBuf,
    lock: RwLock<()>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("catalog"));
    name.push(".tmp");
    path.with_file_name(name)
}

async fn read_catalog(path: &Path) -> Result<Catalog> {
    let data = match tokio::fs::read(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Catalog::default()),
        Err(e) => {
            return Err(SupervisorError::io(
                format!("failed to read {}", path.display()),
                e,
            ));
        }
    };
    serde_json::from_slice(&data).map_err(|source| SupervisorError::CorruptCatalog {
        path: path.to_path_buf(),
        source,
    })
}

async fn write_catalog(path: &Path, catalog: &Catalog) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            SupervisorError::io(format!("failed to create {}", parent.display()), e)
        })?;
    }

    let data = serde_json::to_vec_pretty(catalog).map_err(|e| {
        SupervisorError::io(
            "failed to serialize catalog",
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;

    let tmp = tmp_path(path);
    let res = write_and_rename(&tmp, path, &data).await;
    if res.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    res
}

async fn write_and_rename(tmp: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut f = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| SupervisorError::io("failed to create temp file", e))?;
    f.write_all(data)
        .await
        .map_err(|e| SupervisorError::io("failed to write temp file", e))?;
    f.flush()
        .await
        .map_err(|e| SupervisorError::io("failed to flush temp file", e))?;
    f.sync_all()
        .await
        .map_err(|e| SupervisorError::io("failed to sync temp file", e))?;
    drop(f);

    tokio::fs::rename(tmp, path).await.map_err(|e| {
        SupervisorError::io(format!("failed to persist {}", path.display()), e)
    })
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub async fn load(&self) -> Result<Catalog> {
        let _guard = self.lock.read().await;
        read_catalog(&self.path).await
    }

    pub async fn save(&self, catalog: &Catalog) -> Result<()> {
        let _guard = self.lock.write().await;
        self.persist(catalog).await
    }

    // Load, apply `f`, save; all under the write lock. Nothing is written
    // when `f` fails.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Catalog) -> Result<T>) -> Result<T> {
        let _guard = self.lock.write().await;
        let mut catalog = read_catalog(&self.path).await?;
        let out = f(&mut catalog)?;
        self.persist(&catalog).await?;
        Ok(out)
    }

    pub async fn export(&self, path: &Path, catalog: &Catalog) -> Result<()> {
        write_catalog(path, catalog).await
    }

    // Parses a catalog file without persisting it. Unlike `load`, a missing
    // file is an error.
    pub async fn import(&self, path: &Path) -> Result<Catalog> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(SupervisorError::io(
                format!("failed to read {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        read_catalog(path).await
    }

    async fn persist(&self, catalog: &Catalog) -> Result<()> {
        write_catalog(&self.path, catalog).await.inspect_err(|err| {
            tracing::error!(path = %self.path.display(), %err, "catalog write failed");
        })
    }
}
