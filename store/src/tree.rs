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

//! Immutable directory trees addressed by the digest of their canonical serialization.

use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{glob::PreparedPathGlobs, Digest, RelativePath, StoreError, EMPTY_DIGEST};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct File {
    name: String,
    digest: Digest,
    is_executable: bool,
}

impl File {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Directory {
    name: String,
    tree: DigestTrie,
}

impl Directory {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> Digest {
        self.tree.digest
    }

    pub fn tree(&self) -> &DigestTrie {
        &self.tree
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Entry {
    File(File),
    Directory(Directory),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::File(f) => &f.name,
            Entry::Directory(d) => &d.name,
        }
    }

    fn describe(&self) -> String {
        match self {
            Entry::File(f) if f.is_executable => format!("executable file {}", f.digest),
            Entry::File(f) => format!("file {}", f.digest),
            Entry::Directory(d) => format!("directory {}", d.digest()),
        }
    }
}

/// One path to place in a tree under construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypedPath {
    File {
        path: RelativePath,
        digest: Digest,
        is_executable: bool,
    },
    Dir(RelativePath),
}

impl TypedPath {
    pub fn path(&self) -> &RelativePath {
        match self {
            TypedPath::File { path, .. } => path,
            TypedPath::Dir(path) => path,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Leaf {
    File { digest: Digest, is_executable: bool },
    Dir,
}

/// A directory tree. Entries are sorted by name and subtrees are shared between tries.
#[derive(Clone)]
pub struct DigestTrie {
    entries: Arc<[Entry]>,
    digest: Digest,
}

impl PartialEq for DigestTrie {
    fn eq(&self, other: &DigestTrie) -> bool {
        self.digest == other.digest
    }
}

impl Eq for DigestTrie {}

impl Hash for DigestTrie {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state)
    }
}

impl fmt::Debug for DigestTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DigestTrie({})", self.digest)
    }
}

impl Default for DigestTrie {
    fn default() -> DigestTrie {
        DigestTrie::empty()
    }
}

impl DigestTrie {
    pub fn empty() -> DigestTrie {
        DigestTrie {
            entries: Vec::new().into(),
            digest: EMPTY_DIGEST,
        }
    }

    /// Builds a trie from paths in any order. Parent directories are implied. The same file may be
    /// listed more than once only with identical contents.
    pub fn from_paths(paths: Vec<TypedPath>) -> Result<DigestTrie, StoreError> {
        let mut split = Vec::with_capacity(paths.len());
        for typed in &paths {
            let components: Vec<String> = typed
                .path()
                .components()
                .into_iter()
                .map(str::to_owned)
                .collect();
            let leaf = match typed {
                TypedPath::File {
                    digest,
                    is_executable,
                    ..
                } => {
                    if components.is_empty() {
                        return Err(StoreError::InvalidPath {
                            path: PathBuf::new(),
                            reason: "names the root directory, not a file",
                        });
                    }
                    Leaf::File {
                        digest: *digest,
                        is_executable: *is_executable,
                    }
                }
                // The root always exists.
                TypedPath::Dir(_) if components.is_empty() => continue,
                TypedPath::Dir(_) => Leaf::Dir,
            };
            split.push((components, leaf));
        }
        let items = split.iter().map(|(c, leaf)| (&c[..], *leaf)).collect();
        DigestTrie::build(Path::new(""), items)
    }

    fn build<'a>(prefix: &Path, items: Vec<(&'a [String], Leaf)>) -> Result<DigestTrie, StoreError> {
        let mut by_name: BTreeMap<&'a str, Vec<(&'a [String], Leaf)>> = BTreeMap::new();
        for (components, leaf) in items {
            by_name
                .entry(components[0].as_str())
                .or_default()
                .push((&components[1..], leaf));
        }

        let mut entries = Vec::with_capacity(by_name.len());
        for (name, children) in by_name {
            let path = prefix.join(name);
            let mut file = None;
            let mut is_dir = false;
            let mut nested = Vec::new();
            for (rest, leaf) in children {
                match leaf {
                    Leaf::File {
                        digest,
                        is_executable,
                    } if rest.is_empty() => match file {
                        Some(existing) if existing != (digest, is_executable) => {
                            return Err(StoreError::DuplicatePath(path));
                        }
                        _ => file = Some((digest, is_executable)),
                    },
                    Leaf::Dir if rest.is_empty() => is_dir = true,
                    leaf => nested.push((rest, leaf)),
                }
            }
            match file {
                Some(_) if is_dir || !nested.is_empty() => {
                    return Err(StoreError::DuplicatePath(path));
                }
                Some((digest, is_executable)) => entries.push(Entry::File(File {
                    name: name.to_owned(),
                    digest,
                    is_executable,
                })),
                None => entries.push(Entry::Directory(Directory {
                    name: name.to_owned(),
                    tree: DigestTrie::build(&path, nested)?,
                })),
            }
        }
        Ok(DigestTrie::from_sorted(entries))
    }

    fn from_sorted(entries: Vec<Entry>) -> DigestTrie {
        let digest = serialized_digest(&entries);
        DigestTrie {
            entries: entries.into(),
            digest,
        }
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visits every entry depth first, in path order.
    pub fn walk<F: FnMut(&Path, &Entry)>(&self, f: &mut F) {
        self.walk_under(Path::new(""), f)
    }

    fn walk_under<F: FnMut(&Path, &Entry)>(&self, prefix: &Path, f: &mut F) {
        for entry in self.entries.iter() {
            let path = prefix.join(entry.name());
            f(&path, entry);
            if let Entry::Directory(d) = entry {
                d.tree.walk_under(&path, f);
            }
        }
    }

    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.walk(&mut |path, entry| {
            if let Entry::File(_) = entry {
                files.push(path.to_owned());
            }
        });
        files
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        self.walk(&mut |path, entry| {
            if let Entry::Directory(_) = entry {
                dirs.push(path.to_owned());
            }
        });
        dirs
    }

    pub fn entry(&self, path: &RelativePath) -> Option<&Entry> {
        let mut tree = self;
        let mut found: Option<&Entry> = None;
        for name in path.components() {
            if let Some(Entry::Directory(d)) = found {
                tree = &d.tree;
            } else if found.is_some() {
                return None;
            }
            let idx = tree
                .entries
                .binary_search_by(|e| e.name().cmp(name))
                .ok()?;
            found = Some(&tree.entries[idx]);
        }
        found
    }

    /// Merges trees. Identical files collapse; anything else present at the same path in more than
    /// one tree is a conflict unless both are directories, which merge recursively.
    pub fn merge(trees: Vec<DigestTrie>) -> Result<DigestTrie, StoreError> {
        DigestTrie::merge_under(Path::new(""), trees)
    }

    fn merge_under(prefix: &Path, mut trees: Vec<DigestTrie>) -> Result<DigestTrie, StoreError> {
        trees.retain(|t| !t.is_empty());
        trees.sort_by_key(|t| t.digest);
        trees.dedup();
        match trees.len() {
            0 => return Ok(DigestTrie::empty()),
            1 => return Ok(trees.remove(0)),
            _ => {}
        }

        let mut by_name: BTreeMap<&str, Vec<&Entry>> = BTreeMap::new();
        for tree in &trees {
            for entry in tree.entries.iter() {
                by_name.entry(entry.name()).or_default().push(entry);
            }
        }

        let mut entries = Vec::with_capacity(by_name.len());
        for (name, candidates) in by_name {
            let path = prefix.join(name);
            let conflict = || StoreError::MergeConflict {
                path: path.clone(),
                details: candidates
                    .iter()
                    .map(|c| c.describe())
                    .collect::<Vec<_>>()
                    .join(" vs "),
            };
            match candidates[0] {
                Entry::File(_) => {
                    if candidates.iter().any(|c| *c != candidates[0]) {
                        return Err(conflict());
                    }
                    entries.push(candidates[0].clone());
                }
                Entry::Directory(_) => {
                    let mut subtrees = Vec::with_capacity(candidates.len());
                    for candidate in &candidates {
                        match candidate {
                            Entry::Directory(d) => subtrees.push(d.tree.clone()),
                            Entry::File(_) => return Err(conflict()),
                        }
                    }
                    entries.push(Entry::Directory(Directory {
                        name: name.to_owned(),
                        tree: DigestTrie::merge_under(&path, subtrees)?,
                    }));
                }
            }
        }
        Ok(DigestTrie::from_sorted(entries))
    }

    /// Nests this tree under `prefix`.
    pub fn add_prefix(&self, prefix: &RelativePath) -> DigestTrie {
        let mut tree = self.clone();
        for name in prefix.components().into_iter().rev() {
            tree = DigestTrie::from_sorted(vec![Entry::Directory(Directory {
                name: name.to_owned(),
                tree,
            })]);
        }
        tree
    }

    /// The subtree at `prefix`. Fails if the tree holds anything outside of it.
    pub fn remove_prefix(&self, prefix: &RelativePath) -> Result<DigestTrie, StoreError> {
        let mut tree = self.clone();
        let mut walked = PathBuf::new();
        for name in prefix.components() {
            let next = match &tree.entries[..] {
                [] => return Ok(DigestTrie::empty()),
                [Entry::Directory(d)] if d.name == name => d.tree.clone(),
                entries => {
                    let location = if walked.as_os_str().is_empty() {
                        "the root directory".to_owned()
                    } else {
                        format!("directory {}", walked.display())
                    };
                    let others: Vec<&str> = entries
                        .iter()
                        .map(Entry::name)
                        .filter(|n| *n != name)
                        .collect();
                    let has_dir = entries
                        .iter()
                        .any(|e| matches!(e, Entry::Directory(d) if d.name == name));
                    let reason = if has_dir {
                        format!("{} contained non-matching entries: {}", location, others.join(", "))
                    } else {
                        format!("{} didn't contain a directory named {}", location, name)
                    };
                    return Err(StoreError::PrefixMismatch {
                        prefix: prefix.to_string(),
                        digest: self.digest,
                        reason,
                    });
                }
            };
            walked.push(name);
            tree = next;
        }
        Ok(tree)
    }

    /// The files and directories matching `globs`, with their parents. A matched directory is
    /// included whole, minus anything excluded.
    pub fn subset(&self, globs: &PreparedPathGlobs) -> Result<DigestTrie, StoreError> {
        let mut paths = Vec::new();
        self.subset_under(Path::new(""), globs, false, &mut paths)?;
        DigestTrie::from_paths(paths)
    }

    fn subset_under(
        &self,
        prefix: &Path,
        globs: &PreparedPathGlobs,
        ancestor_matched: bool,
        paths: &mut Vec<TypedPath>,
    ) -> Result<(), StoreError> {
        for entry in self.entries.iter() {
            let path = prefix.join(entry.name());
            if globs.is_excluded(&path) {
                continue;
            }
            let included = ancestor_matched || globs.matches(&path);
            match entry {
                Entry::File(f) if included => paths.push(TypedPath::File {
                    path: RelativePath::new(&path)?,
                    digest: f.digest,
                    is_executable: f.is_executable,
                }),
                Entry::File(_) => {}
                Entry::Directory(d) => {
                    if included {
                        paths.push(TypedPath::Dir(RelativePath::new(&path)?));
                    }
                    d.tree.subset_under(&path, globs, included, paths)?;
                }
            }
        }
        Ok(())
    }
}

fn serialized_digest(entries: &[Entry]) -> Digest {
    let mut bytes = Vec::new();
    for entry in entries {
        let (tag, digest, is_executable) = match entry {
            Entry::File(f) => (b'f', f.digest, f.is_executable),
            Entry::Directory(d) => (b'd', d.digest(), false),
        };
        bytes.push(tag);
        bytes.extend_from_slice(&(entry.name().len() as u32).to_be_bytes());
        bytes.extend_from_slice(entry.name().as_bytes());
        bytes.extend_from_slice(&digest.hash.0);
        bytes.extend_from_slice(&(digest.size_bytes as u64).to_be_bytes());
        bytes.push(is_executable as u8);
    }
    Digest::of_bytes(&bytes)
}
