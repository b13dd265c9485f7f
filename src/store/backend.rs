// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::StoreError;

use super::{EpisodeId, PodcastId, Tables};

/// Number of hex digits naming an artwork blob
const BLOB_NAME_LENGTH: usize = 32;

/// Durable storage behind a [`Store`](super::Store)
///
/// A backend only ever sees complete snapshots: `commit` either persists the
/// whole table set or fails, in which case the store keeps its previous state.
pub trait Backend: Send + Sync {
    /// Load the last committed snapshot
    fn load(&self) -> Result<Tables, StoreError>;

    /// Persist a snapshot
    fn commit(&self, tables: &Tables) -> Result<(), StoreError>;
}

/// Non-durable backend, used for tests and throwaway sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Tables, StoreError> {
        Ok(Tables::default())
    }

    fn commit(&self, _tables: &Tables) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    library: &'a Tables,
    /// Artwork owner to blob name
    artwork: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Document {
    library: Tables,
    #[serde(default)]
    artwork: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct BlobIndex {
    /// Artwork last written per owner, with the blob holding it
    written: HashMap<String, (Bytes, String)>,
    /// Blobs referenced by the last committed document
    committed: BTreeSet<String>,
}

/// Backend storing the library as a single JSON document.
///
/// Artwork is kept out of the document: each image is written once to a
/// content-addressed blob in the `<library>.artwork` directory next to it,
/// and the document only names the blob.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    blobs: Mutex<BlobIndex>,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            blobs: Mutex::new(BlobIndex::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artwork_dir(&self) -> PathBuf {
        self.path.with_extension("artwork")
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        self.path.with_file_name(name)
    }

    /// Make sure every artwork in `tables` has a blob; returns owner to blob
    fn store_artwork(&self, tables: &Tables) -> Result<BTreeMap<String, String>, StoreError> {
        let dir = self.artwork_dir();
        let mut index = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);

        let mut written = HashMap::new();
        let mut refs = BTreeMap::new();
        for (owner, bytes) in artwork_of(tables) {
            let blob = match index.written.get(&owner) {
                // Same allocation as last time, so the blob is already there
                Some((previous, blob)) if same_allocation(previous, bytes) => blob.clone(),
                _ => {
                    let blob = blob_name(bytes);
                    write_blob(&dir, &blob, bytes)?;
                    blob
                }
            };
            written.insert(owner.clone(), (bytes.clone(), blob.clone()));
            refs.insert(owner, blob);
        }
        index.written = written;
        Ok(refs)
    }

    /// Delete blobs the committed document no longer names
    fn prune_artwork(&self, refs: &BTreeMap<String, String>) {
        let referenced: BTreeSet<String> = refs.values().cloned().collect();
        let mut index = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        if index.committed == referenced {
            return;
        }

        if let Ok(entries) = std::fs::read_dir(self.artwork_dir()) {
            for entry in entries.filter_map(Result::ok) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if referenced.contains(&name) {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => debug!(blob = %name, "removed unused artwork"),
                    Err(e) => warn!(blob = %name, error = %e, "could not remove unused artwork"),
                }
            }
        }
        index.committed = referenced;
    }
}

impl Backend for JsonFileBackend {
    fn load(&self) -> Result<Tables, StoreError> {
        if !self.path.exists() {
            return Ok(Tables::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| StoreError::ReadFailed {
            path: self.path.clone(),
            source: e,
        })?;

        let document: Document =
            serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
                path: self.path.clone(),
                source: e,
            })?;

        let mut tables = document.library;
        let dir = self.artwork_dir();
        let mut index = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        for (owner, blob) in document.artwork {
            // Artwork is decoration; a lost blob only costs the image
            let bytes = match std::fs::read(dir.join(&blob)) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!(owner = %owner, blob = %blob, error = %e, "could not read artwork");
                    continue;
                }
            };
            if attach_artwork(&mut tables, &owner, bytes.clone()) {
                index.committed.insert(blob.clone());
                index.written.insert(owner, (bytes, blob));
            } else {
                debug!(owner = %owner, "artwork for unknown record");
            }
        }
        Ok(tables)
    }

    fn commit(&self, tables: &Tables) -> Result<(), StoreError> {
        let artwork = self.store_artwork(tables)?;
        let json = serde_json::to_string_pretty(&DocumentRef {
            library: tables,
            artwork: &artwork,
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        // Write next to the library and rename over it so readers never see
        // a half-written document.
        let partial = self.partial_path();
        std::fs::write(&partial, json).map_err(|e| StoreError::WriteFailed {
            path: partial.clone(),
            source: e,
        })?;
        std::fs::rename(&partial, &self.path).map_err(|e| StoreError::WriteFailed {
            path: self.path.clone(),
            source: e,
        })?;

        self.prune_artwork(&artwork);
        Ok(())
    }
}

fn same_allocation(a: &Bytes, b: &Bytes) -> bool {
    a.as_ptr() == b.as_ptr() && a.len() == b.len()
}

fn blob_name(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(BLOB_NAME_LENGTH);
    for byte in digest.iter().take(BLOB_NAME_LENGTH / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn write_blob(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let path = dir.join(name);
    if path.is_file() {
        return Ok(());
    }
    let write_failed = |source| StoreError::WriteFailed {
        path: path.clone(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(write_failed)?;
    let partial = dir.join(format!("{name}.partial"));
    std::fs::write(&partial, bytes).map_err(write_failed)?;
    std::fs::rename(&partial, &path).map_err(write_failed)
}

/// Every artwork in the tables, keyed by its owner
fn artwork_of(tables: &Tables) -> Vec<(String, &Bytes)> {
    let podcasts = tables
        .podcasts
        .values()
        .filter_map(|p| Some((format!("podcast-{}", p.id), p.artwork.as_ref()?)));
    let episodes = tables
        .episodes
        .values()
        .filter_map(|e| Some((format!("episode-{}", e.id), e.artwork.as_ref()?)));
    let chapters = tables.chapters.values().flatten().filter_map(|c| {
        Some((
            format!("chapter-{}-{}", c.episode_id, c.start_time),
            c.artwork.as_ref()?,
        ))
    });
    podcasts.chain(episodes).chain(chapters).collect()
}

/// Put loaded artwork back on its owner; false if the owner is unknown
fn attach_artwork(tables: &mut Tables, owner: &str, bytes: Bytes) -> bool {
    let mut parts = owner.split('-');
    let kind = parts.next();
    let Some(id) = parts.next().and_then(|id| id.parse::<u64>().ok()) else {
        return false;
    };

    let slot = match (kind, parts.next()) {
        (Some("podcast"), None) => tables
            .podcasts
            .get_mut(&PodcastId(id))
            .map(|p| &mut p.artwork),
        (Some("episode"), None) => tables
            .episodes
            .get_mut(&EpisodeId(id))
            .map(|e| &mut e.artwork),
        (Some("chapter"), Some(start)) => {
            let Ok(start) = start.parse::<u32>() else {
                return false;
            };
            tables
                .chapters
                .get_mut(&EpisodeId(id))
                .and_then(|chapters| chapters.iter_mut().find(|c| c.start_time == start))
                .map(|c| &mut c.artwork)
        }
        _ => None,
    };

    match slot {
        Some(slot) => {
            *slot = Some(bytes);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewPodcast, Store};
    use tempfile::tempdir;

    fn new_podcast(title: &str) -> NewPodcast {
        NewPodcast {
            title: title.to_string(),
            author: None,
            description: None,
            feed_url: format!("https://example.com/{title}.xml"),
            image_url: None,
            playback_rate: 1.0,
        }
    }

    #[test]
    fn load_missing_file_returns_empty_tables() {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("library.json"));

        let tables = backend.load().unwrap();
        assert!(tables.podcasts.is_empty());
        assert!(tables.episodes.is_empty());
    }

    #[test]
    fn committed_library_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        let store = Store::open(JsonFileBackend::new(&path)).unwrap();
        let id = store
            .transaction(|tables| Ok(tables.insert_podcast(new_podcast("daily"))))
            .unwrap();
        drop(store);

        let reopened = Store::open(JsonFileBackend::new(&path)).unwrap();
        let podcast = reopened.read(|tables| tables.podcast(id).cloned()).unwrap();
        assert_eq!(podcast.title, "daily");
    }

    #[test]
    fn ids_keep_increasing_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        let store = Store::open(JsonFileBackend::new(&path)).unwrap();
        let first = store
            .transaction(|tables| Ok(tables.insert_podcast(new_podcast("a"))))
            .unwrap();
        drop(store);

        let reopened = Store::open(JsonFileBackend::new(&path)).unwrap();
        let second = reopened
            .transaction(|tables| Ok(tables.insert_podcast(new_podcast("b"))))
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn commit_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        let backend = JsonFileBackend::new(&path);

        backend.commit(&Tables::default()).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("library.json.partial").exists());
    }

    #[test]
    fn corrupt_library_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = JsonFileBackend::new(&path).load();
        assert!(matches!(result, Err(StoreError::JsonParseFailed { .. })));
    }

    fn blobs(backend_path: &Path) -> Vec<String> {
        let dir = JsonFileBackend::new(backend_path).artwork_dir();
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn artwork_is_kept_out_of_the_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        let cover = Bytes::from(vec![7u8; 200_000]);

        let store = Store::open(JsonFileBackend::new(&path)).unwrap();
        let id = store
            .transaction(|tables| {
                let id = tables.insert_podcast(new_podcast("daily"));
                tables.podcast_mut(id)?.artwork = Some(cover.clone());
                Ok(id)
            })
            .unwrap();
        store
            .transaction(|tables| {
                tables.podcast_mut(id)?.playback_rate = 1.5;
                Ok(())
            })
            .unwrap();
        drop(store);

        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size < 4096, "library is {size} bytes");
        assert_eq!(blobs(&path).len(), 1);

        let reopened = Store::open(JsonFileBackend::new(&path)).unwrap();
        let podcast = reopened.read(|tables| tables.podcast(id).cloned()).unwrap();
        assert_eq!(podcast.artwork, Some(cover));
        assert_eq!(podcast.playback_rate, 1.5);
    }

    #[test]
    fn replaced_artwork_drops_the_old_blob() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        let store = Store::open(JsonFileBackend::new(&path)).unwrap();
        let id = store
            .transaction(|tables| {
                let id = tables.insert_podcast(new_podcast("daily"));
                tables.podcast_mut(id)?.artwork = Some(Bytes::from_static(b"old cover"));
                Ok(id)
            })
            .unwrap();
        let before = blobs(&path);

        store
            .transaction(|tables| {
                tables.podcast_mut(id)?.artwork = Some(Bytes::from_static(b"new cover"));
                Ok(())
            })
            .unwrap();
        let after = blobs(&path);

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
        assert_ne!(before, after);
    }

    #[test]
    fn missing_blob_only_loses_the_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        let store = Store::open(JsonFileBackend::new(&path)).unwrap();
        let id = store
            .transaction(|tables| {
                let id = tables.insert_podcast(new_podcast("daily"));
                tables.podcast_mut(id)?.artwork = Some(Bytes::from_static(b"cover"));
                Ok(id)
            })
            .unwrap();
        drop(store);
        std::fs::remove_dir_all(JsonFileBackend::new(&path).artwork_dir()).unwrap();

        let reopened = Store::open(JsonFileBackend::new(&path)).unwrap();
        let podcast = reopened.read(|tables| tables.podcast(id).cloned()).unwrap();
        assert_eq!(podcast.title, "daily");
        assert_eq!(podcast.artwork, None);
    }
}
