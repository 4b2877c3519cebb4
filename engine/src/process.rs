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

//! Hermetic local process execution.

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::future;
use knot_metrics::scoped_metric;
use knot_store::{
    CreateDigest, CreateDigestEntry, Digest, MergeDigests, PathGlobs, RelativePath, Store,
    StoreError, EMPTY_DIGEST,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Semaphore,
};
use tracing::{debug, info};

use crate::failure::Failure;

/// Exit code reported for a process killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessCacheScope {
    Always,
    /// Failing results are not kept across sessions.
    Successful,
    /// Runs once per session.
    PerSession,
}

/// A process to run in a sandbox containing exactly `input_digest`.
///
/// The description is for humans and does not take part in equality.
#[derive(Clone, Debug)]
pub struct Process {
    pub argv: Vec<String>,
    pub description: String,
    pub input_digest: Digest,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub output_files: Vec<PathBuf>,
    pub output_directories: Vec<PathBuf>,
    pub timeout: Option<Duration>,
    pub cache_scope: ProcessCacheScope,
}

impl Process {
    pub fn new<I, S>(argv: I) -> Process
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        Process {
            description: argv.join(" "),
            argv,
            input_digest: EMPTY_DIGEST,
            working_directory: None,
            env: BTreeMap::new(),
            output_files: Vec::new(),
            output_directories: Vec::new(),
            timeout: None,
            cache_scope: ProcessCacheScope::Successful,
        }
    }

    pub fn description<S: Into<String>>(mut self, description: S) -> Process {
        self.description = description.into();
        self
    }

    pub fn input_digest(mut self, digest: Digest) -> Process {
        self.input_digest = digest;
        self
    }

    pub fn working_directory<P: Into<PathBuf>>(mut self, dir: P) -> Process {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Process {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn output_files<I: IntoIterator<Item = P>, P: Into<PathBuf>>(mut self, files: I) -> Process {
        self.output_files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn output_directories<I: IntoIterator<Item = P>, P: Into<PathBuf>>(
        mut self,
        dirs: I,
    ) -> Process {
        self.output_directories
            .extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Process {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache_scope(mut self, scope: ProcessCacheScope) -> Process {
        self.cache_scope = scope;
        self
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Process) -> bool {
        self.argv == other.argv
            && self.input_digest == other.input_digest
            && self.working_directory == other.working_directory
            && self.env == other.env
            && self.output_files == other.output_files
            && self.output_directories == other.output_directories
            && self.timeout == other.timeout
            && self.cache_scope == other.cache_scope
    }
}

impl Eq for Process {}

impl Hash for Process {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.argv.hash(state);
        self.input_digest.hash(state);
        self.working_directory.hash(state);
        self.env.hash(state);
        self.output_files.hash(state);
        self.output_directories.hash(state);
        self.timeout.hash(state);
        self.cache_scope.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FallibleProcessResult {
    pub stdout: Bytes,
    pub stdout_digest: Digest,
    pub stderr: Bytes,
    pub stderr_digest: Digest,
    pub exit_code: i32,
    pub output_digest: Digest,
}

/// The result of a process that exited successfully.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessResult {
    pub stdout: Bytes,
    pub stdout_digest: Digest,
    pub stderr: Bytes,
    pub stderr_digest: Digest,
    pub output_digest: Digest,
}

impl FallibleProcessResult {
    /// Fails unless the process exited with 0.
    pub fn check(self, description: &str) -> Result<ProcessResult, Failure> {
        if self.exit_code != 0 {
            return Err(Failure::throw(format!(
                "Process '{}' failed with exit code {}.\nstdout:\n{}\nstderr:\n{}",
                description,
                self.exit_code,
                tail(&self.stdout),
                tail(&self.stderr)
            )));
        }
        Ok(ProcessResult {
            stdout: self.stdout,
            stdout_digest: self.stdout_digest,
            stderr: self.stderr,
            stderr_digest: self.stderr_digest,
            output_digest: self.output_digest,
        })
    }
}

const TAIL_LINES: usize = 20;

fn tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n")
}

/// Runs processes, at most `parallelism` at a time.
#[derive(Clone)]
pub struct CommandRunner {
    store: Store,
    permits: Arc<Semaphore>,
}

impl CommandRunner {
    pub fn new(store: Store, parallelism: usize) -> CommandRunner {
        CommandRunner {
            store,
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    pub async fn run(&self, process: Process) -> Result<FallibleProcessResult, Failure> {
        if process.argv.is_empty() {
            return Err(Failure::throw("a process needs at least one argument"));
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Failure::throw("the process runner was shut down"))?;
        scoped_metric!("process_execution");

        let sandbox = tempfile::Builder::new().prefix("knot-sandbox-").tempdir()?;
        let root = sandbox.path().to_owned();
        {
            let store = self.store.clone();
            let root = root.clone();
            let digest = process.input_digest;
            tokio::task::spawn_blocking(move || store.materialize(digest, &root)).await??;
        }
        let workdir = match &process.working_directory {
            Some(dir) => root.join(RelativePath::new(dir)?),
            None => root.clone(),
        };
        for file in &process.output_files {
            if let Some(parent) = workdir.join(RelativePath::new(file)?).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        for dir in &process.output_directories {
            std::fs::create_dir_all(workdir.join(RelativePath::new(dir)?))?;
        }

        info!(description = %process.description, "running process");
        let mut command = Command::new(&process.argv[0]);
        command
            .args(&process.argv[1..])
            .env_clear()
            .envs(&process.env)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| {
            Failure::throw(format!(
                "failed to start '{}': {}",
                process.description, err
            ))
        })?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let outcome = {
            let out = child
                .stdout
                .take()
                .ok_or_else(|| Failure::throw("stdout was not captured"))?;
            let err = child
                .stderr
                .take()
                .ok_or_else(|| Failure::throw("stderr was not captured"))?;
            let readers = future::try_join(drain(out, stdout.clone()), drain(err, stderr.clone()));
            let finished = future::try_join(child.wait(), readers);
            match process.timeout {
                Some(timeout) => tokio::time::timeout(timeout, finished).await.ok(),
                None => Some(finished.await),
            }
        };
        let stdout = std::mem::take(&mut *stdout.lock());
        let mut stderr = std::mem::take(&mut *stderr.lock());
        let exit_code = match outcome {
            Some(finished) => exit_code(&finished?.0),
            None => {
                debug!(description = %process.description, "timed out");
                if let Err(err) = child.kill().await {
                    debug!(description = %process.description, %err, "could not kill");
                }
                if !stderr.is_empty() && !stderr.ends_with(b"\n") {
                    stderr.push(b'\n');
                }
                stderr.extend_from_slice(
                    format!(
                        "Exceeded timeout of {:.1} seconds when executing local process: {}",
                        process.timeout.unwrap_or_default().as_secs_f64(),
                        process.description
                    )
                    .as_bytes(),
                );
                TIMEOUT_EXIT_CODE
            }
        };

        let store = self.store.clone();
        let outputs = (process.output_files, process.output_directories);
        let output_digest = tokio::task::spawn_blocking(move || {
            capture_outputs(&store, &workdir, &outputs.0, &outputs.1)
        })
        .await??;
        let stdout = Bytes::from(stdout);
        let stderr = Bytes::from(stderr);
        Ok(FallibleProcessResult {
            stdout_digest: self.store.store_file_bytes(stdout.clone()),
            stdout,
            stderr_digest: self.store.store_file_bytes(stderr.clone()),
            stderr,
            exit_code,
            output_digest,
        })
    }
}

/// Copies everything `reader` produces into `buffer` as it arrives, so that a process cut short
/// by its timeout still reports what it wrote.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.lock().extend_from_slice(&chunk[..read]);
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Snapshots the declared outputs that the process actually produced.
fn capture_outputs(
    store: &Store,
    workdir: &Path,
    files: &[PathBuf],
    dirs: &[PathBuf],
) -> Result<Digest, StoreError> {
    // Declared outputs are literal paths.
    let literal = |path: &Path| globset::escape(&path.to_string_lossy());
    let mut globs: Vec<String> = files.iter().map(|f| literal(f.as_path())).collect();
    globs.extend(dirs.iter().map(|d| format!("{}/**", literal(d.as_path()))));
    let captured = if globs.is_empty() {
        EMPTY_DIGEST
    } else {
        store.capture(workdir, &PathGlobs::new(globs))?.digest
    };
    let empty_dirs = CreateDigest(
        dirs.iter()
            .filter(|d| workdir.join(d).is_dir())
            .map(|d| CreateDigestEntry::Directory(d.clone()))
            .collect(),
    );
    let empty_dirs = store.create_digest(&empty_dirs)?;
    store.merge(&MergeDigests(vec![captured, empty_dirs]))
}
