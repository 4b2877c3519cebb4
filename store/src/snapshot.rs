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

//! Values exchanged with the store. Every one of them is a plain, hashable product so that rules
//! can request them and memoize on them.

use std::path::PathBuf;

use bytes::Bytes;

use crate::{glob::PathGlobs, tree::DigestTrie, Digest};

/// A directory digest together with its enumerated paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub digest: Digest,
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

impl Snapshot {
    pub fn from_tree(tree: &DigestTrie) -> Snapshot {
        Snapshot {
            digest: tree.digest(),
            files: tree.files(),
            dirs: tree.directories(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileContent {
    pub path: PathBuf,
    pub content: Bytes,
    pub is_executable: bool,
}

impl FileContent {
    pub fn new<P: Into<PathBuf>, B: Into<Bytes>>(path: P, content: B) -> FileContent {
        FileContent {
            path: path.into(),
            content: content.into(),
            is_executable: false,
        }
    }

    pub fn executable(mut self) -> FileContent {
        self.is_executable = true;
        self
    }
}

/// Every file of a digest, in path order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DigestContents(pub Vec<FileContent>);

impl DigestContents {
    pub fn iter(&self) -> impl Iterator<Item = &FileContent> {
        self.0.iter()
    }
}

/// A file or empty directory of a digest. Unlike `DigestContents`, file bytes are not loaded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DigestEntry {
    File {
        path: PathBuf,
        digest: Digest,
        is_executable: bool,
    },
    EmptyDirectory(PathBuf),
}

impl DigestEntry {
    pub fn path(&self) -> &PathBuf {
        match self {
            DigestEntry::File { path, .. } | DigestEntry::EmptyDirectory(path) => path,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DigestEntries(pub Vec<DigestEntry>);

impl DigestEntries {
    pub fn iter(&self) -> impl Iterator<Item = &DigestEntry> {
        self.0.iter()
    }
}

/// The files and directories matching some globs, found without reading any file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Paths {
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CreateDigestEntry {
    File(FileContent),
    /// A file whose bytes are already in the store.
    FileEntry {
        path: PathBuf,
        digest: Digest,
        is_executable: bool,
    },
    Directory(PathBuf),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CreateDigest(pub Vec<CreateDigestEntry>);

impl From<Vec<FileContent>> for CreateDigest {
    fn from(files: Vec<FileContent>) -> CreateDigest {
        CreateDigest(files.into_iter().map(CreateDigestEntry::File).collect())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MergeDigests(pub Vec<Digest>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddPrefix {
    pub digest: Digest,
    pub prefix: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemovePrefix {
    pub digest: Digest,
    pub prefix: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DigestSubset {
    pub digest: Digest,
    pub globs: PathGlobs,
}
