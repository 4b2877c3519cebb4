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

use knot_store::{Digest, RelativePath, Store};
use tracing::info;

use crate::failure::Failure;

/// Side effects on the build root. Only goal rules should write to it.
#[derive(Clone, Debug)]
pub struct Workspace {
    store: Store,
    build_root: PathBuf,
}

impl Workspace {
    pub(crate) fn new(store: Store, build_root: PathBuf) -> Workspace {
        Workspace { store, build_root }
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Writes the files of `digest` under the build root, or under `path_prefix` inside it.
    pub async fn write_digest(&self, digest: Digest, path_prefix: Option<&Path>) -> Result<(), Failure> {
        let destination = match path_prefix {
            Some(prefix) => self.build_root.join(RelativePath::new(prefix)?),
            None => self.build_root.clone(),
        };
        info!(%digest, destination = %destination.display(), "writing to the workspace");
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.materialize(digest, &destination)).await??;
        Ok(())
    }
}
