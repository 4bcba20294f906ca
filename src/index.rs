// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Change-index store.
//!
//! The __change index__ records size and modification time of every file that
//! was part of the last successful synchronization. Comparing the index against
//! the current state of the synchronization root yields the __change delta__,
//! i.e., exactly the files that must be sent to, or removed from, the running
//! component.
//!
//! # Persistence
//!
//! The index lives at `.devsync/file-index.json` under the synchronization
//! root. Nothing but [`IndexStore`] reads or writes that file. Saving writes a
//! temporary file first, and renames it over the index, so a crash mid-write
//! leaves the previous index intact. The push pipeline only saves after the
//! platform confirmed the transfer, so a failed push is retried with the same
//! delta next time.

use crate::{
    ignore_rules::IgnoreSet,
    path::{index_path, internal_dir, relative_key},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{read_to_string, remove_file, rename, write},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Current version of the index file layout.
pub const INDEX_VERSION: u32 = 1;

/// Metadata recorded for one synchronized file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub size: u64,
    pub modified: SystemTime,
}

/// Snapshot of synchronized files keyed by `/` separated relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub version: u32,
    pub files: BTreeMap<String, IndexEntry>,
}

impl Default for FileIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            files: BTreeMap::new(),
        }
    }
}

impl FileIndex {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.files.get(path)
    }
}

/// Files that changed since the last synchronization.
///
/// # Invariant
///
/// - The three sets are pairwise disjoint.
/// - Ignored paths never appear in any set.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeDelta {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Files that must be copied to the component.
    pub fn to_transfer(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }

    /// Total number of changed paths.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Owner of the change-index file of one synchronization root.
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    /// Construct new index store for synchronization root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the persisted index file.
    pub fn index_path(&self) -> PathBuf {
        index_path(&self.root)
    }

    /// Load persisted index.
    ///
    /// A missing index file yields an empty index.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError::ReadIndex`] if index file cannot be read.
    /// - Return [`IndexError::Corrupt`] if index file cannot be parsed.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self) -> Result<FileIndex> {
        let path = self.index_path();
        let content = match read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no index at {}, starting empty", path.display());
                return Ok(FileIndex::default());
            }
            Err(err) => {
                return Err(IndexError::ReadIndex {
                    source: err,
                    index_path: path,
                })
            }
        };

        serde_json::from_str(&content).map_err(|err| IndexError::Corrupt {
            source: err,
            index_path: path,
        })
    }

    /// Walk synchronization root, and record every non-ignored file.
    ///
    /// Ignored directories are pruned without descending into them. Files that
    /// vanish while walking are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError::RootNotAccessible`] if the root cannot be read.
    /// - Return [`IndexError::Walk`] if a directory under the root cannot be
    ///   read.
    #[instrument(skip(self, ignore), level = "debug")]
    pub fn snapshot(&self, ignore: &IgnoreSet) -> Result<FileIndex> {
        if let Err(err) = self.root.read_dir() {
            return Err(IndexError::RootNotAccessible {
                source: err,
                root: self.root.clone(),
            });
        }

        let mut index = FileIndex::default();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !ignore.is_ignored(entry.path())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if is_vanished(&err) => {
                    debug!("skip vanished path while walking: {err}");
                    continue;
                }
                Err(err) => {
                    return Err(IndexError::Walk {
                        path: err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                        source: err,
                    })
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(key) = relative_key(&self.root, entry.path()) else {
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) if is_vanished(&err) => continue,
                Err(err) => {
                    return Err(IndexError::Walk {
                        path: entry.path().to_path_buf(),
                        source: err,
                    })
                }
            };

            index.files.insert(
                key,
                IndexEntry {
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            );
        }

        Ok(index)
    }

    /// Compute change delta of synchronization root against `index`.
    ///
    /// Returns the delta together with the snapshot it was computed from, so
    /// the caller can persist exactly what was transferred.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError`] if the synchronization root cannot be walked.
    #[instrument(skip(self, index, ignore), level = "debug")]
    pub fn diff(&self, index: &FileIndex, ignore: &IgnoreSet) -> Result<(ChangeDelta, FileIndex)> {
        let current = self.snapshot(ignore)?;
        let delta = compare(index, &current, ignore);
        debug!(
            "delta: {} added, {} modified, {} deleted",
            delta.added.len(),
            delta.modified.len(),
            delta.deleted.len()
        );

        Ok((delta, current))
    }

    /// Treat every non-ignored file as added, bypassing the persisted index.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError`] if the synchronization root cannot be walked.
    #[instrument(skip(self, ignore), level = "debug")]
    pub fn full(&self, ignore: &IgnoreSet) -> Result<(ChangeDelta, FileIndex)> {
        let current = self.snapshot(ignore)?;
        let delta = ChangeDelta {
            added: current.files.keys().cloned().collect(),
            ..Default::default()
        };

        Ok((delta, current))
    }

    /// Persist index atomically.
    ///
    /// Entries whose file no longer exists under the synchronization root are
    /// dropped before writing.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError::WriteIndex`] if the index cannot be written.
    #[instrument(skip(self, index), level = "debug")]
    pub fn save(&self, index: &FileIndex) -> Result<()> {
        let mut index = index.clone();
        index.version = INDEX_VERSION;
        index.files.retain(|key, _| {
            let exists = self.root.join(key).is_file();
            if !exists {
                warn!("drop index entry for vanished file {key}");
            }
            exists
        });

        let dir = internal_dir(&self.root);
        mkdirp::mkdirp(&dir).map_err(|err| IndexError::WriteIndex {
            source: err,
            index_path: dir.clone(),
        })?;

        let path = self.index_path();
        let temp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&index).map_err(IndexError::Serialize)?;
        write(&temp, json).map_err(|err| IndexError::WriteIndex {
            source: err,
            index_path: temp.clone(),
        })?;
        rename(&temp, &path).map_err(|err| IndexError::WriteIndex {
            source: err,
            index_path: path.clone(),
        })?;
        info!("saved index of {} files to {}", index.len(), path.display());

        Ok(())
    }

    /// Forget persisted index, so the next push synchronizes everything.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError::WriteIndex`] if the index exists but cannot be
    ///   removed.
    #[instrument(skip(self), level = "debug")]
    pub fn reset(&self) -> Result<()> {
        let path = self.index_path();
        match remove_file(&path) {
            Ok(()) => {
                info!("removed index at {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IndexError::WriteIndex {
                source: err,
                index_path: path,
            }),
        }
    }
}

/// Classify every path of `current` against `previous`.
///
/// Previously indexed paths that are ignored now are neither deleted nor kept.
pub fn compare(previous: &FileIndex, current: &FileIndex, ignore: &IgnoreSet) -> ChangeDelta {
    let mut delta = ChangeDelta::default();
    for (key, entry) in &current.files {
        match previous.files.get(key) {
            None => {
                delta.added.insert(key.clone());
            }
            Some(old) if old != entry => {
                delta.modified.insert(key.clone());
            }
            Some(_) => {}
        }
    }

    for key in previous.files.keys() {
        if !current.files.contains_key(key) && !ignore.is_ignored(key) {
            delta.deleted.insert(key.clone());
        }
    }

    delta
}

fn is_vanished(err: &walkdir::Error) -> bool {
    err.depth() > 0
        && err
            .io_error()
            .is_some_and(|err| err.kind() == ErrorKind::NotFound)
}

/// Change-index error types.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Synchronization root is missing or unreadable.
    #[error("synchronization root {:?} is not accessible", root.display())]
    RootNotAccessible {
        #[source]
        source: std::io::Error,
        root: PathBuf,
    },

    /// Directory under synchronization root cannot be walked.
    #[error("failed to walk {:?}", path.display())]
    Walk {
        #[source]
        source: walkdir::Error,
        path: PathBuf,
    },

    /// Index file cannot be read.
    #[error("failed to read index at {:?}", index_path.display())]
    ReadIndex {
        #[source]
        source: std::io::Error,
        index_path: PathBuf,
    },

    /// Index file content is not a valid index.
    #[error("index at {:?} is corrupt", index_path.display())]
    Corrupt {
        #[source]
        source: serde_json::Error,
        index_path: PathBuf,
    },

    /// Index cannot be serialized.
    #[error(transparent)]
    Serialize(serde_json::Error),

    /// Index file cannot be written.
    #[error("failed to write index at {:?}", index_path.display())]
    WriteIndex {
        #[source]
        source: std::io::Error,
        index_path: PathBuf,
    },
}

impl IndexError {
    /// Whether the synchronization root itself is gone or unreadable.
    pub fn is_root_lost(&self) -> bool {
        match self {
            Self::RootNotAccessible { .. } => true,
            Self::Walk { path, .. } => !path.exists(),
            _ => false,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = IndexError> = std::result::Result<T, E>;
