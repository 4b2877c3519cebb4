/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! An in-memory content-addressed store of file bytes and directory trees.
//!
//! Nothing stored is ever mutated. Every operation that "changes" a tree records a new tree and
//! returns its digest.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use knot_metrics::scoped_metric;

mod digest;
mod glob;
mod path;
mod snapshot;
mod tree;

pub use digest::{Digest, Fingerprint, EMPTY_DIGEST, EMPTY_FINGERPRINT};
pub use glob::{GlobExpansionConjunction, PathGlobs, PreparedPathGlobs, StrictGlobMatching};
pub use path::RelativePath;
pub use snapshot::{
    AddPrefix, CreateDigest, CreateDigestEntry, DigestContents, DigestEntries, DigestEntry,
    DigestSubset, FileContent, MergeDigests, Paths, RemovePrefix, Snapshot,
};
pub use tree::{DigestTrie, Directory, Entry, File, TypedPath};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} is not present in the store")]
    MissingDigest(Digest),
    #[error("invalid fingerprint {input:?}: {message}")]
    InvalidFingerprint { input: String, message: String },
    #[error("invalid path {}: {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },
    #[error("{} is declared more than once with different contents", .0.display())]
    DuplicatePath(PathBuf),
    #[error("cannot merge digests: conflicting entries at {}: {details}", .path.display())]
    MergeConflict { path: PathBuf, details: String },
    #[error("cannot strip prefix {prefix} from {digest}: {reason}")]
    PrefixMismatch {
        prefix: String,
        digest: Digest,
        reason: String,
    },
    #[error("invalid glob {glob:?}: {message}")]
    InvalidGlob { glob: String, message: String },
    #[error("unmatched glob(s) from {origin}: {}", .globs.join(", "))]
    UnmatchedGlobs { origin: String, globs: Vec<String> },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_owned(),
        source,
    }
}

#[derive(Default)]
struct Inner {
    files: DashMap<Digest, Bytes>,
    trees: DashMap<Digest, DigestTrie>,
}

/// Cheap to clone; clones share the same storage.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("files", &self.inner.files.len())
            .field("trees", &self.inner.trees.len())
            .finish()
    }
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn store_file_bytes(&self, bytes: Bytes) -> Digest {
        let digest = Digest::of_bytes(&bytes);
        if !digest.is_empty() {
            self.inner.files.entry(digest).or_insert(bytes);
        }
        digest
    }

    pub fn load_file_bytes(&self, digest: Digest) -> Result<Bytes, StoreError> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        self.inner
            .files
            .get(&digest)
            .map(|bytes| bytes.value().clone())
            .ok_or(StoreError::MissingDigest(digest))
    }

    fn has_file(&self, digest: Digest) -> bool {
        digest.is_empty() || self.inner.files.contains_key(&digest)
    }

    pub fn record_tree(&self, tree: DigestTrie) -> Digest {
        let digest = tree.digest();
        if !digest.is_empty() {
            self.inner.trees.entry(digest).or_insert(tree);
        }
        digest
    }

    pub fn load_tree(&self, digest: Digest) -> Result<DigestTrie, StoreError> {
        if digest.is_empty() {
            return Ok(DigestTrie::empty());
        }
        self.inner
            .trees
            .get(&digest)
            .map(|tree| tree.value().clone())
            .ok_or(StoreError::MissingDigest(digest))
    }

    pub fn create_digest(&self, request: &CreateDigest) -> Result<Digest, StoreError> {
        let mut paths = Vec::with_capacity(request.0.len());
        for entry in &request.0 {
            paths.push(match entry {
                CreateDigestEntry::File(file) => TypedPath::File {
                    path: RelativePath::new(&file.path)?,
                    digest: self.store_file_bytes(file.content.clone()),
                    is_executable: file.is_executable,
                },
                CreateDigestEntry::FileEntry {
                    path,
                    digest,
                    is_executable,
                } => {
                    if !self.has_file(*digest) {
                        return Err(StoreError::MissingDigest(*digest));
                    }
                    TypedPath::File {
                        path: RelativePath::new(path)?,
                        digest: *digest,
                        is_executable: *is_executable,
                    }
                }
                CreateDigestEntry::Directory(path) => TypedPath::Dir(RelativePath::new(path)?),
            });
        }
        Ok(self.record_tree(DigestTrie::from_paths(paths)?))
    }

    pub fn merge(&self, request: &MergeDigests) -> Result<Digest, StoreError> {
        let trees = request
            .0
            .iter()
            .map(|digest| self.load_tree(*digest))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.record_tree(DigestTrie::merge(trees)?))
    }

    pub fn add_prefix(&self, request: &AddPrefix) -> Result<Digest, StoreError> {
        let prefix = RelativePath::new(&request.prefix)?;
        let tree = self.load_tree(request.digest)?;
        Ok(self.record_tree(tree.add_prefix(&prefix)))
    }

    pub fn remove_prefix(&self, request: &RemovePrefix) -> Result<Digest, StoreError> {
        let prefix = RelativePath::new(&request.prefix)?;
        let tree = self.load_tree(request.digest)?;
        Ok(self.record_tree(tree.remove_prefix(&prefix)?))
    }

    pub fn subset(&self, request: &DigestSubset) -> Result<Digest, StoreError> {
        let globs = request.globs.parse()?;
        let tree = self.load_tree(request.digest)?;
        Ok(self.record_tree(tree.subset(&globs)?))
    }

    pub fn contents(&self, digest: Digest) -> Result<DigestContents, StoreError> {
        let tree = self.load_tree(digest)?;
        let mut files = Vec::new();
        let mut missing = None;
        tree.walk(&mut |path, entry| {
            if let Entry::File(file) = entry {
                match self.load_file_bytes(file.digest()) {
                    Ok(content) => files.push(FileContent {
                        path: path.to_owned(),
                        content,
                        is_executable: file.is_executable(),
                    }),
                    Err(e) => {
                        missing.get_or_insert(e);
                    }
                }
            }
        });
        match missing {
            Some(e) => Err(e),
            None => Ok(DigestContents(files)),
        }
    }

    /// Every file and empty directory of a digest, in path order. File bytes need not be present.
    pub fn entries(&self, digest: Digest) -> Result<DigestEntries, StoreError> {
        let tree = self.load_tree(digest)?;
        let mut entries = Vec::new();
        tree.walk(&mut |path, entry| match entry {
            Entry::File(file) => entries.push(DigestEntry::File {
                path: path.to_owned(),
                digest: file.digest(),
                is_executable: file.is_executable(),
            }),
            Entry::Directory(dir) if dir.tree().is_empty() => {
                entries.push(DigestEntry::EmptyDirectory(path.to_owned()))
            }
            Entry::Directory(_) => {}
        });
        Ok(DigestEntries(entries))
    }

    pub fn snapshot(&self, digest: Digest) -> Result<Snapshot, StoreError> {
        Ok(Snapshot::from_tree(&self.load_tree(digest)?))
    }

    /// Reads every file under `root` matching `globs` into the store.
    pub fn capture(&self, root: &Path, globs: &PathGlobs) -> Result<Snapshot, StoreError> {
        scoped_metric!("store_capture");
        let paths = globs.parse()?.expand(root)?;
        debug!(root = %root.display(), files = paths.len(), "capturing");
        let mut typed = Vec::with_capacity(paths.len());
        for path in paths {
            let absolute = root.join(&path);
            let content = fs::read(&absolute).map_err(io_error(&absolute))?;
            let metadata = fs::metadata(&absolute).map_err(io_error(&absolute))?;
            typed.push(TypedPath::File {
                digest: self.store_file_bytes(Bytes::from(content)),
                is_executable: is_executable(&metadata),
                path,
            });
        }
        let tree = DigestTrie::from_paths(typed)?;
        self.record_tree(tree.clone());
        Ok(Snapshot::from_tree(&tree))
    }

    /// Writes the tree to `destination`, creating it if needed. Existing files are overwritten.
    pub fn materialize(&self, digest: Digest, destination: &Path) -> Result<(), StoreError> {
        scoped_metric!("store_materialize");
        let tree = self.load_tree(digest)?;
        fs::create_dir_all(destination).map_err(io_error(destination))?;
        let mut result = Ok(());
        tree.walk(&mut |path, entry| {
            if result.is_err() {
                return;
            }
            let target = destination.join(path);
            result = match entry {
                Entry::Directory(_) => fs::create_dir_all(&target).map_err(io_error(&target)),
                Entry::File(file) => self
                    .load_file_bytes(file.digest())
                    .and_then(|bytes| fs::write(&target, &bytes).map_err(io_error(&target)))
                    .and_then(|_| set_executable(&target, file.is_executable())),
            };
        });
        result
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_error(path))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), StoreError> {
    Ok(())
}
