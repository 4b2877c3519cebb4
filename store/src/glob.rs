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

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use crate::{snapshot::Paths, RelativePath, StoreError};

/// What to do when an include glob matches nothing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StrictGlobMatching {
    /// Fail, naming the origin of the globs in the error.
    Error(String),
    /// Log a warning naming the origin.
    Warn(String),
    Ignore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlobExpansionConjunction {
    /// Every include glob must match something.
    AllMatch,
    /// At least one include glob must match something.
    AnyMatch,
}

/// A set of include globs and `!`-prefixed exclude globs, relative to some root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathGlobs {
    globs: Vec<String>,
    strict_match_behavior: StrictGlobMatching,
    conjunction: GlobExpansionConjunction,
}

impl PathGlobs {
    pub fn new<I, S>(globs: I) -> PathGlobs
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PathGlobs {
            globs: globs.into_iter().map(Into::into).collect(),
            strict_match_behavior: StrictGlobMatching::Ignore,
            conjunction: GlobExpansionConjunction::AnyMatch,
        }
    }

    pub fn with_strict_match(mut self, behavior: StrictGlobMatching) -> PathGlobs {
        self.strict_match_behavior = behavior;
        self
    }

    pub fn with_conjunction(mut self, conjunction: GlobExpansionConjunction) -> PathGlobs {
        self.conjunction = conjunction;
        self
    }

    pub fn globs(&self) -> &[String] {
        &self.globs
    }

    pub fn parse(&self) -> Result<PreparedPathGlobs, StoreError> {
        let mut include = Vec::new();
        let mut exclude = GlobSetBuilder::new();
        for glob in &self.globs {
            if let Some(negated) = glob.strip_prefix('!') {
                exclude.add(build_glob(negated)?.glob().clone());
            } else {
                include.push(PreparedGlob {
                    pattern: glob.clone(),
                    matcher: build_glob(glob)?,
                });
            }
        }
        let exclude = exclude.build().map_err(|e| StoreError::InvalidGlob {
            glob: self.globs.join(", "),
            message: e.to_string(),
        })?;
        Ok(PreparedPathGlobs {
            include,
            exclude,
            strict_match_behavior: self.strict_match_behavior.clone(),
            conjunction: self.conjunction,
        })
    }
}

fn build_glob(pattern: &str) -> Result<GlobMatcher, StoreError> {
    let invalid = |message: String| StoreError::InvalidGlob {
        glob: pattern.to_owned(),
        message,
    };
    let trimmed = pattern.trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(invalid("globs may not be empty".to_owned()));
    }
    if trimmed.starts_with('/') {
        return Err(invalid("globs must be relative".to_owned()));
    }
    if trimmed.split('/').any(|part| part == "..") {
        return Err(invalid("globs may not escape their root".to_owned()));
    }
    let glob = GlobBuilder::new(trimmed)
        .literal_separator(true)
        .build()
        .map_err(|e| invalid(e.to_string()))?;
    Ok(glob.compile_matcher())
}

#[derive(Debug)]
struct PreparedGlob {
    pattern: String,
    matcher: GlobMatcher,
}

/// Compiled form of `PathGlobs`.
#[derive(Debug)]
pub struct PreparedPathGlobs {
    include: Vec<PreparedGlob>,
    exclude: GlobSet,
    strict_match_behavior: StrictGlobMatching,
    conjunction: GlobExpansionConjunction,
}

impl PreparedPathGlobs {
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.is_match(path)
    }

    pub fn matches(&self, path: &Path) -> bool {
        !self.is_excluded(path) && self.include.iter().any(|g| g.matcher.is_match(path))
    }

    /// Whether a change at `path` could alter the expansion of these globs: either the path itself
    /// matches, or it is a directory some include glob could descend into.
    pub fn could_match_under(&self, path: &Path) -> bool {
        if self.matches(path) {
            return true;
        }
        if self.is_excluded(path) {
            return false;
        }
        self.include.iter().any(|g| {
            let literal_prefix: PathBuf = Path::new(&g.pattern)
                .components()
                .take_while(|c| !c.as_os_str().to_string_lossy().contains(&['*', '?', '[', '{'][..]))
                .collect();
            literal_prefix.starts_with(path) || path.starts_with(&literal_prefix)
        })
    }

    /// Walks `root` and returns every file matching these globs, sorted.
    ///
    /// Symlinks are not followed and are never matched.
    pub fn expand(&self, root: &Path) -> Result<Vec<RelativePath>, StoreError> {
        let (files, _) = self.walk(root, false)?;
        Ok(files)
    }

    /// Like `expand`, but also returns the matching directories, without reading any contents.
    pub fn expand_paths(&self, root: &Path) -> Result<Paths, StoreError> {
        let (files, dirs) = self.walk(root, true)?;
        Ok(Paths {
            files: files.into_iter().map(RelativePath::into_path_buf).collect(),
            dirs: dirs.into_iter().map(RelativePath::into_path_buf).collect(),
        })
    }

    fn walk(
        &self,
        root: &Path,
        with_dirs: bool,
    ) -> Result<(Vec<RelativePath>, Vec<RelativePath>), StoreError> {
        let mut matched = vec![false; self.include.len()];
        let mut paths = Vec::new();
        let mut dirs = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_owned();
                StoreError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            let is_dir = entry.file_type().is_dir();
            if !entry.file_type().is_file() && !(with_dirs && is_dir) {
                continue;
            }
            let relative = match entry.path().strip_prefix(root) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            if self.is_excluded(relative) {
                continue;
            }
            let mut any = false;
            for (idx, glob) in self.include.iter().enumerate() {
                if glob.matcher.is_match(relative) {
                    matched[idx] = true;
                    any = true;
                }
            }
            if !any {
                continue;
            }
            let path = RelativePath::new(relative)?;
            if is_dir {
                dirs.push(path);
            } else {
                paths.push(path);
            }
        }
        paths.sort();
        dirs.sort();
        self.check_unmatched(&matched)?;
        Ok((paths, dirs))
    }

    fn check_unmatched(&self, matched: &[bool]) -> Result<(), StoreError> {
        let origin = match &self.strict_match_behavior {
            StrictGlobMatching::Ignore => return Ok(()),
            StrictGlobMatching::Error(origin) | StrictGlobMatching::Warn(origin) => origin,
        };
        let unmatched: Vec<String> = self
            .include
            .iter()
            .zip(matched)
            .filter(|(_, matched)| !**matched)
            .map(|(glob, _)| glob.pattern.clone())
            .collect();
        let failed = match self.conjunction {
            GlobExpansionConjunction::AllMatch => !unmatched.is_empty(),
            GlobExpansionConjunction::AnyMatch => {
                !self.include.is_empty() && unmatched.len() == self.include.len()
            }
        };
        if !failed {
            return Ok(());
        }
        if let StrictGlobMatching::Warn(_) = self.strict_match_behavior {
            warn!(%origin, globs = ?unmatched, "unmatched globs");
            return Ok(());
        }
        Err(StoreError::UnmatchedGlobs {
            origin: origin.clone(),
            globs: unmatched,
        })
    }
}
