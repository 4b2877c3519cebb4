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

//! The goal rules behind each subcommand.

use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use bytes::Bytes;
use knot_engine::{Context, Failure, FallibleProcessResult, Goal, Process, Rule, Tasks};
use knot_store::{Digest, PathGlobs, Snapshot};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListGoal {
    pub files: Vec<PathBuf>,
}

impl Goal for ListGoal {
    fn exit_code(&self) -> i32 {
        0
    }
}

impl fmt::Display for ListGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for file in &self.files {
            writeln!(f, "{}", file.display())?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DigestGoal {
    pub digest: Digest,
}

impl Goal for DigestGoal {
    fn exit_code(&self) -> i32 {
        0
    }
}

impl fmt::Display for DigestGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.digest)
    }
}

/// Everything `knot run` needs, gathered from the command line and environment up front so the
/// goal itself only reads its params.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub inputs: PathGlobs,
    pub outputs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunGoal {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    /// Files written back to the build root. Empty when the process failed.
    pub written: Vec<PathBuf>,
}

impl Goal for RunGoal {
    fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

async fn list(ctx: Context, (globs,): (PathGlobs,)) -> Result<ListGoal, Failure> {
    let snapshot: Snapshot = ctx.get(globs).await?;
    Ok(ListGoal {
        files: snapshot.files,
    })
}

async fn digest(ctx: Context, (globs,): (PathGlobs,)) -> Result<DigestGoal, Failure> {
    Ok(DigestGoal {
        digest: ctx.get(globs).await?,
    })
}

async fn run(ctx: Context, (request,): (RunRequest,)) -> Result<RunGoal, Failure> {
    let input_digest: Digest = ctx.get(request.inputs).await?;
    let mut process = Process::new(request.argv)
        .input_digest(input_digest)
        .output_files(request.outputs);
    for (key, value) in request.env {
        process = process.env(key, value);
    }
    if let Some(timeout) = request.timeout {
        process = process.timeout(timeout);
    }

    let result: FallibleProcessResult = ctx.get(process).await?;
    let written = if result.exit_code == 0 {
        ctx.workspace()
            .write_digest(result.output_digest, None)
            .await?;
        ctx.store().snapshot(result.output_digest)?.files
    } else {
        debug!(exit_code = result.exit_code, "not writing outputs of a failed process");
        Vec::new()
    };
    Ok(RunGoal {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        written,
    })
}

pub fn tasks() -> Tasks {
    let mut tasks = Tasks::new();
    tasks
        .rule(
            Rule::new("list", list)
                .get::<Snapshot, PathGlobs>()
                .goal(),
        )
        .rule(Rule::new("digest", digest).get::<Digest, PathGlobs>().goal())
        .rule(
            Rule::new("run", run)
                .get::<Digest, PathGlobs>()
                .get::<FallibleProcessResult, Process>()
                .goal(),
        )
        .query::<ListGoal, (PathGlobs,)>()
        .query::<DigestGoal, (PathGlobs,)>()
        .query::<RunGoal, (RunRequest,)>();
    tasks
}
