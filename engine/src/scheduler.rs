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
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future;
use knot_metrics::scoped_metric;
use knot_rules::{Params, Product, Query, RuleGraph, RuleGraphError, TypeId, UnionMembership, Value};
use knot_store::{PathGlobs, Store};
use tracing::{debug, info};

use crate::{
    context::Context,
    failure::Failure,
    graph::{Graph, InvalidationResult, RunId},
    intrinsics::intrinsics,
    nodes::NodeKey,
    process::CommandRunner,
    rule::{RuleFn, Tasks},
};

#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// Where source files are read from and goals write to.
    pub build_root: PathBuf,
    pub process_parallelism: usize,
    /// How long a requester waits before retrying a node that was invalidated under it.
    pub invalidation_delay: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> ExecutionConfig {
        ExecutionConfig {
            build_root: PathBuf::from("."),
            process_parallelism: num_cpus::get(),
            invalidation_delay: Duration::from_millis(10),
        }
    }
}

/// State shared by every session of a scheduler.
pub(crate) struct Core {
    pub(crate) rule_graph: RuleGraph,
    pub(crate) rules: Vec<RuleFn>,
    pub(crate) unions: UnionMembership,
    pub(crate) store: Store,
    pub(crate) graph: Graph<NodeKey>,
    pub(crate) runner: CommandRunner,
    pub(crate) build_root: PathBuf,
}

pub struct Scheduler {
    core: Arc<Core>,
    next_run_id: AtomicU32,
}

impl Scheduler {
    /// Compiles the rule graph for `tasks` plus the intrinsics.
    pub fn new(tasks: Tasks, store: Store, config: ExecutionConfig) -> Result<Scheduler, RuleGraphError> {
        let (mut rules, queries, unions) = tasks.into_parts();
        rules.extend(intrinsics());
        let signatures = rules.iter().map(|r| r.signature().clone()).collect();
        let rule_graph = RuleGraph::compile(signatures, queries, &unions)?;
        debug!(entries = rule_graph.len(), "compiled rule graph");
        Ok(Scheduler {
            core: Arc::new(Core {
                rule_graph,
                rules: rules.iter().map(|r| r.func().clone()).collect(),
                unions,
                runner: CommandRunner::new(store.clone(), config.process_parallelism),
                store,
                graph: Graph::new(config.invalidation_delay),
                build_root: config.build_root,
            }),
            next_run_id: AtomicU32::new(0),
        })
    }

    pub fn session(&self) -> Session {
        Session {
            core: self.core.clone(),
            run_id: RunId(self.next_run_id.fetch_add(1, Ordering::SeqCst)),
        }
    }

    pub fn rule_graph(&self) -> &RuleGraph {
        &self.core.rule_graph
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    /// Invalidates every node reading files through `PathGlobs` that a change to one of `paths`
    /// could affect. Paths are relative to the build root, or absolute under it.
    pub fn invalidate_files<P: AsRef<Path>>(&self, paths: &[P]) -> InvalidationResult {
        let build_root = &self.core.build_root;
        let changed: Vec<&Path> = paths
            .iter()
            .map(|p| {
                let p = p.as_ref();
                p.strip_prefix(build_root).unwrap_or(p)
            })
            .collect();
        let result = self.core.graph.invalidate_from_roots(|node| match node {
            NodeKey::Task(task) => task
                .params()
                .find::<PathGlobs>()
                .and_then(|globs| globs.parse().ok())
                .map_or(false, |globs| {
                    changed.iter().any(|path| globs.could_match_under(path))
                }),
            NodeKey::ExecuteProcess(_) => false,
        });
        info!(
            cleared = result.cleared,
            dirtied = result.dirtied,
            "invalidated changed files"
        );
        result
    }

    /// Number of nodes in the memo graph.
    pub fn graph_len(&self) -> usize {
        self.core.graph.len()
    }

    pub fn visualize<W: io::Write>(&self, out: W) -> io::Result<()> {
        self.core.graph.visualize(out)
    }
}

/// A request for a product from a set of params.
#[derive(Clone, Debug)]
pub struct Request {
    pub product: TypeId,
    pub params: Params,
}

impl Request {
    pub fn new<O: 'static>(params: Params) -> Request {
        Request {
            product: TypeId::of::<O>(),
            params,
        }
    }
}

/// One run of requests against a scheduler. Uncacheable rules run once per session.
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
    run_id: RunId,
}

impl Session {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub async fn product_request<O: Product>(&self, params: Params) -> Result<O, Failure> {
        let value = self.request(Request::new::<O>(params)).await?;
        value.downcast::<O>().ok_or_else(|| {
            Failure::throw(format!(
                "expected a {} but got a {}",
                TypeId::of::<O>(),
                value.type_id()
            ))
        })
    }

    /// Runs every request concurrently. Results are in request order.
    pub async fn execute(&self, requests: Vec<Request>) -> Vec<Result<Value, Failure>> {
        scoped_metric!("session_execute");
        future::join_all(requests.into_iter().map(|request| self.request(request))).await
    }

    async fn request(&self, request: Request) -> Result<Value, Failure> {
        let query = Query::new(request.product, request.params.type_ids());
        let root = self.core.rule_graph.root(&query).ok_or_else(|| {
            Failure::throw(format!("No installed query computes {}", query))
        })?;
        Context::new(self.core.clone(), self.run_id)
            .select(root, request.params)
            .await
    }
}
