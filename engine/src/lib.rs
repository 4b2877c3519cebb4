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

//! The dynamic half of the engine: running rules on demand, memoizing what they computed and
//! recomputing only what changed.
//!
//! ```ignore
//! let mut tasks = Tasks::new();
//! tasks
//!     .rule(Rule::new("count_files", |ctx: Context, (globs,): (PathGlobs,)| async move {
//!         let snapshot: Snapshot = ctx.get(globs).await?;
//!         Ok(FileCount(snapshot.files.len()))
//!     }).get::<Snapshot, PathGlobs>())
//!     .query::<FileCount, (PathGlobs,)>();
//! let scheduler = Scheduler::new(tasks, Store::new(), ExecutionConfig::default())?;
//! let count: FileCount = scheduler
//!     .session()
//!     .product_request(Params::new(vec![Value::new(PathGlobs::new(vec!["src/**"]))]))
//!     .await?;
//! ```

mod context;
mod failure;
pub mod graph;
mod intrinsics;
mod nodes;
mod process;
mod rule;
mod scheduler;
mod workspace;

pub use context::Context;
pub use failure::Failure;
pub use graph::{InvalidationResult, RunId};
pub use nodes::{NodeKey, Task};
pub use process::{
    CommandRunner, FallibleProcessResult, Process, ProcessCacheScope, ProcessResult,
    TIMEOUT_EXIT_CODE,
};
pub use rule::{Goal, Rule, RuleArgs, Tasks};
pub use scheduler::{ExecutionConfig, Request, Scheduler, Session};
pub use workspace::Workspace;
