//! Embedding gallery and its write-through file store.
//!
//! On disk the gallery is one JSON document with two index-aligned arrays,
//! `embeddings` and `identities`. Every mutation rewrites the whole file
//! through a temp file in the same directory, and the in-memory copy is only
//! replaced once that write has succeeded.

use crate::types::{Embedding, Identity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write gallery {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid gallery file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// Outcome of an upsert, with the index the entry now occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(usize),
    Replaced(usize),
}

/// Ordered (identity, embedding) pairs with unique identities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, identity: &Identity) -> Option<&Embedding> {
        self.entries
            .iter()
            .find(|e| &e.identity == identity)
            .map(|e| &e.embedding)
    }

    /// Insert, or overwrite the embedding of an identity already present.
    pub fn upsert(&mut self, identity: Identity, embedding: Embedding) -> Upsert {
        match self.entries.iter().position(|e| e.identity == identity) {
            Some(idx) => {
                self.entries[idx].embedding = embedding;
                Upsert::Replaced(idx)
            }
            None => {
                self.entries.push(GalleryEntry {
                    identity,
                    embedding,
                });
                Upsert::Inserted(self.entries.len() - 1)
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct GalleryFile {
    embeddings: Vec<Embedding>,
    identities: Vec<String>,
}

/// Load a gallery file. A missing file is an empty gallery.
pub fn read_gallery(path: &Path) -> Result<Gallery, GalleryError> {
    if !path.exists() {
        return Ok(Gallery::new());
    }

    let data = fs::read(path).map_err(|source| GalleryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: GalleryFile =
        serde_json::from_slice(&data).map_err(|err| GalleryError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

    if file.embeddings.len() != file.identities.len() {
        return Err(GalleryError::Corrupt {
            path: path.to_path_buf(),
            message: format!(
                "{} embeddings but {} identities",
                file.embeddings.len(),
                file.identities.len()
            ),
        });
    }

    let mut gallery = Gallery::new();
    for (token, embedding) in file.identities.into_iter().zip(file.embeddings) {
        let identity = Identity::from_token(token).ok_or_else(|| GalleryError::Corrupt {
            path: path.to_path_buf(),
            message: "blank identity token".into(),
        })?;
        if let Upsert::Replaced(idx) = gallery.upsert(identity, embedding) {
            tracing::warn!(path = %path.display(), index = idx, "duplicate identity in gallery file; keeping the later entry");
        }
    }
    Ok(gallery)
}

/// Rewrite the gallery file atomically.
pub fn write_gallery(path: &Path, gallery: &Gallery) -> Result<(), GalleryError> {
    let write_err = |source| GalleryError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let file = GalleryFile {
        embeddings: gallery.entries.iter().map(|e| e.embedding.clone()).collect(),
        identities: gallery
            .entries
            .iter()
            .map(|e| e.identity.as_str().to_string())
            .collect(),
    };
    let serialized = serde_json::to_vec(&file).map_err(|err| GalleryError::Corrupt {
        path: path.to_path_buf(),
        message: format!("serialize: {err}"),
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(&serialized).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

/// Process-wide gallery handle: one in-memory copy kept in step with one file.
pub struct GalleryStore {
    path: PathBuf,
    current: Mutex<Gallery>,
}

impl GalleryStore {
    /// Open the store, loading the file if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let path = path.into();
        let gallery = read_gallery(&path)?;
        tracing::info!(path = %path.display(), identities = gallery.len(), "gallery loaded");
        Ok(Self {
            path,
            current: Mutex::new(gallery),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the in-memory gallery.
    pub fn snapshot(&self) -> Gallery {
        self.lock().clone()
    }

    /// Re-read the file and adopt it as the in-memory copy.
    ///
    /// On failure the previous in-memory copy is kept.
    pub fn reload(&self) -> Result<Gallery, GalleryError> {
        let mut current = self.lock();
        let fresh = read_gallery(&self.path)?;
        *current = fresh.clone();
        Ok(fresh)
    }

    /// Upsert one identity and persist the result before adopting it.
    pub fn upsert(&self, identity: Identity, embedding: Embedding) -> Result<Upsert, GalleryError> {
        let mut current = self.lock();
        let mut next = current.clone();
        let outcome = next.upsert(identity.clone(), embedding);
        write_gallery(&self.path, &next)?;
        *current = next;
        tracing::info!(
            identity = %identity,
            ?outcome,
            identities = current.len(),
            "gallery updated"
        );
        Ok(outcome)
    }

    fn lock(&self) -> MutexGuard<'_, Gallery> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::embedding_filled;
    use tempfile::TempDir;

    fn id(token: &str) -> Identity {
        Identity::from_token(token).unwrap()
    }

    #[test]
    fn test_upsert_replaces_by_identity() {
        let mut gallery = Gallery::new();
        assert_eq!(gallery.upsert(id("A"), embedding_filled(0.1)), Upsert::Inserted(0));
        assert_eq!(gallery.upsert(id("B"), embedding_filled(0.2)), Upsert::Inserted(1));
        assert_eq!(gallery.upsert(id("A"), embedding_filled(0.3)), Upsert::Replaced(0));
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.get(&id("A")), Some(&embedding_filled(0.3)));
    }

    #[test]
    fn test_missing_file_is_empty_gallery() {
        let tmp = TempDir::new().unwrap();
        let gallery = read_gallery(&tmp.path().join("nope.json")).unwrap();
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_file_uses_parallel_arrays() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gallery.json");
        let mut gallery = Gallery::new();
        gallery.upsert(id("USR-AAAAAA"), embedding_filled(0.5));
        write_gallery(&path, &gallery).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["identities"], serde_json::json!(["USR-AAAAAA"]));
        assert_eq!(raw["embeddings"][0].as_array().unwrap().len(), 128);

        assert_eq!(read_gallery(&path).unwrap(), gallery);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gallery.json");
        let body = serde_json::json!({
            "embeddings": [vec![0.0f32; 128], vec![0.0f32; 128]],
            "identities": ["USR-AAAAAA"],
        });
        fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(matches!(read_gallery(&path), Err(GalleryError::Corrupt { .. })));
    }

    #[test]
    fn test_store_is_write_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gallery.json");
        let store = GalleryStore::open(&path).unwrap();
        store.upsert(id("USR-AAAAAA"), embedding_filled(0.1)).unwrap();
        store.upsert(id("USR-BBBBBB"), embedding_filled(0.2)).unwrap();
        store.upsert(id("USR-AAAAAA"), embedding_filled(0.9)).unwrap();

        assert_eq!(store.len(), 2);
        let on_disk = read_gallery(&path).unwrap();
        assert_eq!(on_disk, store.snapshot());
        assert_eq!(on_disk.get(&id("USR-AAAAAA")), Some(&embedding_filled(0.9)));
    }

    #[test]
    fn test_failed_write_keeps_memory_copy() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        // Parent of the gallery path is a regular file, so every write fails.
        let store = GalleryStore {
            path: blocker.join("gallery.json"),
            current: Mutex::new(Gallery::new()),
        };
        let result = store.upsert(id("USR-AAAAAA"), embedding_filled(0.1));
        assert!(matches!(result, Err(GalleryError::Write { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_reload_sees_external_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gallery.json");
        let store = GalleryStore::open(&path).unwrap();

        let mut other = Gallery::new();
        other.upsert(id("USR-CCCCCC"), embedding_filled(0.3));
        write_gallery(&path, &other).unwrap();

        assert!(store.is_empty());
        assert_eq!(store.reload().unwrap().len(), 1);
        assert_eq!(store.len(), 1);
    }
}
