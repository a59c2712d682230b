//! On-disk tier: one JSON file per entry under `<root>/<category>/`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use super::error::CacheError;
use super::key::CacheCategory;

/// File contents of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DiskEntry {
    pub key: String,
    pub label: String,
    /// Unix milliseconds.
    pub stored_at: u64,
    pub ttl_ms: u64,
    pub value: Value,
}

/// A file found while scanning a category directory. `entry` is `None` when
/// the file does not parse.
pub(crate) struct Scanned {
    pub path: PathBuf,
    pub hash: String,
    pub entry: Option<DiskEntry>,
}

#[derive(Debug)]
pub(crate) struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, category: CacheCategory, hash: &str) -> PathBuf {
        self.root.join(category.as_str()).join(format!("{hash}.json"))
    }

    /// Reads an entry; a missing file is `Ok(None)`.
    pub async fn read(&self, category: CacheCategory, hash: &str) -> Result<Option<DiskEntry>, CacheError> {
        let path = self.path(category, hash);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheError::io(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| CacheError::serialize(path.display().to_string(), err))
    }

    /// Writes through a temp file and rename, so readers never see a
    /// partial entry and the last writer wins.
    pub async fn write(&self, category: CacheCategory, entry: &DiskEntry) -> Result<(), CacheError> {
        let path = self.path(category, &entry.key);
        let dir = self.root.join(category.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| CacheError::io(&dir, err))?;

        let data = serde_json::to_vec(entry).map_err(|err| CacheError::serialize(&entry.label, err))?;
        let suffix: u64 = rand::thread_rng().r#gen();
        let tmp = path.with_extension(format!("tmp.{suffix:016x}"));
        fs::write(&tmp, &data)
            .await
            .map_err(|err| CacheError::io(&tmp, err))?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::io(&path, err));
        }
        Ok(())
    }

    pub async fn remove(&self, category: CacheCategory, hash: &str) -> Result<bool, CacheError> {
        remove_file(&self.path(category, hash)).await
    }

    /// Every `.json` file of a category. A missing directory is empty.
    pub async fn scan(&self, category: CacheCategory) -> Result<Vec<Scanned>, CacheError> {
        let dir = self.root.join(category.as_str());
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(&dir, err)),
        };

        let mut found = Vec::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|err| CacheError::io(&dir, err))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string) else {
                continue;
            };
            let entry = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice(&bytes).ok(),
                // Removed by a concurrent writer or sweep.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheError::io(&path, err)),
            };
            found.push(Scanned { path, hash, entry });
        }
        Ok(found)
    }
}

pub(crate) async fn remove_file(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(path, err)),
    }
}
