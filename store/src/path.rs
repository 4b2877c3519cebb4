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

use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use crate::StoreError;

/// A normalized path that stays inside the directory it is relative to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, StoreError> {
        let path = path.as_ref();
        let invalid = |reason| StoreError::InvalidPath {
            path: path.to_owned(),
            reason,
        };
        let mut normalized = Vec::new();
        for component in path.components() {
            match component {
                Component::Prefix(_) => return Err(invalid("has a drive or UNC prefix")),
                Component::RootDir => return Err(invalid("is absolute")),
                Component::CurDir => continue,
                Component::ParentDir => {
                    if normalized.pop().is_none() {
                        return Err(invalid("escapes its root"));
                    }
                }
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| invalid("is not valid UTF-8"))?;
                    normalized.push(name);
                }
            }
        }
        Ok(RelativePath(normalized.iter().collect()))
    }

    pub fn empty() -> RelativePath {
        RelativePath(PathBuf::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// The path's components. Always valid UTF-8 after `new`.
    pub fn components(&self) -> Vec<&str> {
        self.0
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect()
    }

    pub fn join(&self, other: &RelativePath) -> RelativePath {
        RelativePath(self.0.join(&other.0))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
