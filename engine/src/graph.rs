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

//! A memoizing graph of dynamically discovered computations.
//!
//! In the terms of "Build Systems a la Carte" this is both the scheduler (nodes are run on demand,
//! suspending on their dependencies) and the rebuilder (verifying traces of dependency generations
//! to decide whether a dirty node must re-run).

use std::{
    any::Any,
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    hash::Hash,
    io,
    panic::AssertUnwindSafe,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use petgraph::{
    dot::{Config, Dot},
    stable_graph::{NodeIndex, StableDiGraph},
    visit::EdgeRef,
    Direction,
};
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type EntryId = NodeIndex<u32>;

/// How many times a request is retried when what it asked for is invalidated before completing.
pub const MAX_RETRIES: usize = 8;

/// Identifies a session. Uncacheable nodes run at most once per run id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u32);

/// Bumped every time a node completes with a value different from its previous one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u32);

impl Generation {
    fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

/// Distinguishes one run of an entry from a later one, so a stale run can't complete a cleared
/// entry. Never reused, even across `Graph::clear`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RunToken(u64);

#[async_trait]
pub trait Node: Clone + fmt::Debug + fmt::Display + Eq + Hash + Send + Sync + 'static {
    type Context: NodeContext<Node = Self>;
    type Item: Clone + fmt::Debug + Eq + Send + Sync + 'static;
    type Error: NodeError;

    async fn run(self, context: Self::Context) -> Result<Self::Item, Self::Error>;

    fn cacheable(&self) -> bool {
        true
    }

    /// Lets a cacheable node decline to keep a particular successful result across sessions.
    fn cacheable_item(&self, _item: &Self::Item) -> bool {
        true
    }
}

pub trait NodeError: Clone + fmt::Debug + Send + Sync + 'static {
    fn invalidated() -> Self;
    fn cyclic(path: Vec<String>) -> Self;
    fn panicked(message: String) -> Self;
    fn is_invalidated(&self) -> bool;
}

pub trait NodeContext: Clone + Send + Sync + 'static {
    type Node: Node;

    fn graph(&self) -> &Graph<Self::Node>;

    /// The entry on whose behalf requests are made, if any. Roots have none.
    fn entry_id(&self) -> Option<EntryId>;

    /// A context for running the given entry.
    fn clone_for(&self, entry_id: EntryId) -> Self;

    fn run_id(&self) -> RunId;
}

type NodeResult<N> = Result<<N as Node>::Item, <N as Node>::Error>;
type NodeOutput<N> = (NodeResult<N>, Generation);
type Waiter<N> = Shared<BoxFuture<'static, NodeOutput<N>>>;

enum EntryState<N: Node> {
    NotStarted {
        run_token: RunToken,
        generation: Generation,
        previous: Option<NodeResult<N>>,
    },
    Running {
        run_token: RunToken,
        generation: Generation,
        previous: Option<NodeResult<N>>,
        waiter: Waiter<N>,
        // A dependency was invalidated while this ran.
        dirty: bool,
    },
    Completed {
        run_token: RunToken,
        generation: Generation,
        result: NodeResult<N>,
        dep_generations: Vec<(EntryId, Generation)>,
        dirty: bool,
        run_id: RunId,
        uncacheable: bool,
        uncacheable_deps: bool,
    },
}

struct Entry<N: Node> {
    node: N,
    state: EntryState<N>,
}

impl<N: Node> Entry<N> {
    fn generation(&self) -> Generation {
        match &self.state {
            EntryState::NotStarted { generation, .. }
            | EntryState::Running { generation, .. }
            | EntryState::Completed { generation, .. } => *generation,
        }
    }

    fn state_name(&self) -> &'static str {
        match &self.state {
            EntryState::NotStarted { .. } => "not started",
            EntryState::Running { .. } => "running",
            EntryState::Completed { dirty: true, .. } => "dirty",
            EntryState::Completed { result: Err(_), .. } => "failed",
            EntryState::Completed { .. } => "completed",
        }
    }

    fn clear(&mut self, run_token: RunToken) {
        let (generation, previous) = match &mut self.state {
            EntryState::NotStarted {
                generation,
                previous,
                ..
            }
            | EntryState::Running {
                generation,
                previous,
                ..
            } => (*generation, previous.take()),
            EntryState::Completed {
                generation, result, ..
            } => (*generation, Some(result.clone())),
        };
        self.state = EntryState::NotStarted {
            run_token,
            generation,
            previous,
        };
    }

    fn dirty(&mut self) {
        match &mut self.state {
            EntryState::Running { dirty, .. } | EntryState::Completed { dirty, .. } => {
                *dirty = true
            }
            EntryState::NotStarted { .. } => {}
        }
    }
}

struct InnerGraph<N: Node> {
    nodes: HashMap<N, EntryId>,
    pg: StableDiGraph<Entry<N>, (), u32>,
    next_token: u64,
}

impl<N: Node> InnerGraph<N> {
    fn fresh_token(&mut self) -> RunToken {
        self.next_token += 1;
        RunToken(self.next_token)
    }

    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(id) = self.nodes.get(&node) {
            return *id;
        }
        let run_token = self.fresh_token();
        let id = self.pg.add_node(Entry {
            node: node.clone(),
            state: EntryState::NotStarted {
                run_token,
                generation: Generation::default(),
                previous: None,
            },
        });
        self.nodes.insert(node, id);
        id
    }

    /// If adding `src -> dst` would close a cycle, the cycle starting and ending at `src`.
    fn cycle_path(&self, src: EntryId, dst: EntryId) -> Option<Vec<EntryId>> {
        if src == dst {
            return Some(vec![src, dst]);
        }
        let mut parents = HashMap::new();
        let mut seen = HashSet::new();
        seen.insert(dst);
        let mut queue = VecDeque::new();
        queue.push_back(dst);
        while let Some(current) = queue.pop_front() {
            for next in self.pg.neighbors_directed(current, Direction::Outgoing) {
                if next == src {
                    let mut path = vec![current];
                    let mut cursor = current;
                    while let Some(parent) = parents.get(&cursor) {
                        path.push(*parent);
                        cursor = *parent;
                    }
                    path.push(src);
                    path.reverse();
                    path.push(src);
                    return Some(path);
                }
                if seen.insert(next) {
                    parents.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn remove_dependencies(&mut self, id: EntryId) {
        let edges: Vec<_> = self
            .pg
            .edges_directed(id, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in edges {
            self.pg.remove_edge(edge);
        }
    }

    fn is_running(&self, id: EntryId, token: RunToken) -> bool {
        matches!(
            self.pg.node_weight(id),
            Some(Entry { state: EntryState::Running { run_token, .. }, .. }) if *run_token == token
        )
    }
}

enum Observed<N: Node> {
    Ready(NodeOutput<N>),
    Wait(Waiter<N>),
    Failed(N::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

pub struct Graph<N: Node> {
    inner: Mutex<InnerGraph<N>>,
    invalidation_delay: Duration,
}

impl<N: Node> Graph<N> {
    pub fn new(invalidation_delay: Duration) -> Graph<N> {
        Graph {
            inner: Mutex::new(InnerGraph {
                nodes: HashMap::new(),
                pg: StableDiGraph::default(),
                next_token: 0,
            }),
            invalidation_delay,
        }
    }

    /// Requests `node` on behalf of `context.entry_id()`, recording the dependency edge.
    ///
    /// Transparently retries, up to `MAX_RETRIES` times, if the node is invalidated while it is
    /// being computed.
    pub async fn get(&self, context: &N::Context, node: N) -> NodeResult<N> {
        self.get_with_generation(context, node).await.0
    }

    fn get_with_generation<'a>(
        &'a self,
        context: &'a N::Context,
        node: N,
    ) -> BoxFuture<'a, NodeOutput<N>> {
        async move {
            let mut retries = 0;
            loop {
                let observed = {
                    let mut inner = self.inner.lock();
                    Self::observe(&mut inner, context, node.clone())
                };
                let output = match observed {
                    Observed::Ready(output) => output,
                    Observed::Wait(waiter) => waiter.await,
                    Observed::Failed(err) => return (Err(err), Generation::default()),
                };
                match &output.0 {
                    Err(err) if err.is_invalidated() && retries < MAX_RETRIES => {
                        retries += 1;
                        debug!(node = %node, retries, "invalidated while running, retrying");
                        tokio::time::sleep(self.invalidation_delay).await;
                    }
                    _ => return output,
                }
            }
        }
        .boxed()
    }

    fn observe(inner: &mut InnerGraph<N>, context: &N::Context, node: N) -> Observed<N> {
        let dst = inner.ensure_entry(node);
        if let Some(src) = context.entry_id() {
            if let Some(path) = inner.cycle_path(src, dst) {
                let path = path
                    .into_iter()
                    .map(|id| inner.pg[id].node.to_string())
                    .collect();
                return Observed::Failed(N::Error::cyclic(path));
            }
            inner.pg.update_edge(src, dst, ());
        }

        let run_id = context.run_id();
        let (previous, clean_with, generation) = match &inner.pg[dst].state {
            EntryState::Running { waiter, .. } => return Observed::Wait(waiter.clone()),
            EntryState::Completed {
                result,
                generation,
                dep_generations,
                dirty,
                run_id: completed_in,
                uncacheable,
                uncacheable_deps,
                ..
            } => {
                let same_run = *completed_in == run_id;
                if !*dirty && (same_run || !(*uncacheable || *uncacheable_deps)) {
                    return Observed::Ready((result.clone(), *generation));
                }
                let clean_with = if *uncacheable && !same_run {
                    None
                } else {
                    Some(dep_generations.clone())
                };
                (Some(result.clone()), clean_with, *generation)
            }
            EntryState::NotStarted {
                generation,
                previous,
                ..
            } => (previous.clone(), None, *generation),
        };

        let run_token = inner.fresh_token();
        let (sender, receiver) = oneshot::channel::<NodeOutput<N>>();
        let waiter = receiver
            .map(move |output| output.unwrap_or_else(|_| (Err(N::Error::invalidated()), generation)))
            .boxed()
            .shared();
        let entry = &mut inner.pg[dst];
        entry.state = EntryState::Running {
            run_token,
            generation,
            previous,
            waiter: waiter.clone(),
            dirty: false,
        };
        let node = entry.node.clone();
        let context = context.clone_for(dst);
        trace!(node = %node, "starting");
        tokio::spawn(async move {
            let graph = context.graph();
            let cleaned = match clean_with {
                Some(deps) => graph.dependencies_unchanged(&context, deps).await,
                None => false,
            };
            let result = if cleaned {
                debug!(node = %node, "cleaned");
                None
            } else {
                graph.prepare_run(dst, run_token);
                let run = AssertUnwindSafe(node.clone().run(context.clone())).catch_unwind();
                Some(run.await.unwrap_or_else(|payload| {
                    Err(N::Error::panicked(format!(
                        "{} panicked: {}",
                        node,
                        panic_message(&*payload)
                    )))
                }))
            };
            let output = graph.complete(dst, run_token, run_id, &node, result);
            // Requesters may have gone away.
            let _ = sender.send(output);
        });
        Observed::Wait(waiter)
    }

    /// Re-requests the previous dependencies of a dirty entry in order, stopping at the first
    /// whose generation moved.
    async fn dependencies_unchanged(
        &self,
        context: &N::Context,
        deps: Vec<(EntryId, Generation)>,
    ) -> bool {
        for (dep, expected) in deps {
            let node = match self.inner.lock().pg.node_weight(dep) {
                Some(entry) => entry.node.clone(),
                None => return false,
            };
            let (result, generation) = self.get_with_generation(context, node).await;
            if result.is_err() || generation != expected {
                return false;
            }
        }
        true
    }

    fn prepare_run(&self, id: EntryId, run_token: RunToken) {
        let mut inner = self.inner.lock();
        if inner.is_running(id, run_token) {
            inner.remove_dependencies(id);
        }
    }

    /// Records the outcome of a run. `None` means the previous result was verified clean.
    fn complete(
        &self,
        id: EntryId,
        run_token: RunToken,
        run_id: RunId,
        node: &N,
        result: Option<NodeResult<N>>,
    ) -> NodeOutput<N> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (previous, generation, dirty) = match inner.pg.node_weight_mut(id) {
            Some(Entry {
                state:
                    EntryState::Running {
                        run_token: current,
                        previous,
                        generation,
                        dirty,
                        ..
                    },
                ..
            }) if *current == run_token => (previous.take(), *generation, *dirty),
            _ => return (Err(N::Error::invalidated()), Generation::default()),
        };

        let cleaned = result.is_none();
        let result = match result.or_else(|| previous.clone()) {
            Some(result) => result,
            None => Err(N::Error::invalidated()),
        };
        let invalidated = matches!(&result, Err(err) if err.is_invalidated());
        if dirty || invalidated {
            inner.pg[id].state = EntryState::NotStarted {
                run_token,
                generation,
                previous,
            };
            return (Err(N::Error::invalidated()), generation);
        }

        let generation = match (&previous, &result) {
            _ if cleaned => generation,
            (Some(Ok(old)), Ok(new)) if old == new => generation,
            _ => generation.next(),
        };
        let mut dep_generations = Vec::new();
        let mut uncacheable_deps = false;
        for dep in inner.pg.neighbors_directed(id, Direction::Outgoing) {
            let entry = &inner.pg[dep];
            if let EntryState::Completed {
                uncacheable,
                uncacheable_deps: transitive,
                ..
            } = &entry.state
            {
                uncacheable_deps |= *uncacheable || *transitive;
            }
            dep_generations.push((dep, entry.generation()));
        }
        // Neighbors come out most recent first.
        dep_generations.reverse();
        let uncacheable =
            !node.cacheable() || matches!(&result, Ok(item) if !node.cacheable_item(item));

        inner.pg[id].state = EntryState::Completed {
            run_token,
            generation,
            result: result.clone(),
            dep_generations,
            dirty: false,
            run_id,
            uncacheable,
            uncacheable_deps,
        };
        (result, generation)
    }

    /// Clears every started node matching `predicate` and dirties everything that transitively
    /// depends on one.
    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(&self, predicate: P) -> InvalidationResult {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let roots: Vec<EntryId> = inner
            .pg
            .node_indices()
            .filter(|id| {
                let entry = &inner.pg[*id];
                !matches!(entry.state, EntryState::NotStarted { .. }) && predicate(&entry.node)
            })
            .collect();
        let root_set: HashSet<EntryId> = roots.iter().copied().collect();

        let mut dependents = HashSet::new();
        let mut queue: VecDeque<EntryId> = roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            for dependent in inner.pg.neighbors_directed(id, Direction::Incoming) {
                if !root_set.contains(&dependent) && dependents.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        for id in &roots {
            let run_token = inner.fresh_token();
            inner.pg[*id].clear(run_token);
            inner.remove_dependencies(*id);
        }
        for id in &dependents {
            inner.pg[*id].dirty();
        }
        InvalidationResult {
            cleared: roots.len(),
            dirtied: dependents.len(),
        }
    }

    /// The generation of `node`, if it has ever been requested.
    pub fn generation(&self, node: &N) -> Option<Generation> {
        let inner = self.inner.lock();
        inner.nodes.get(node).map(|id| inner.pg[*id].generation())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pg.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every node. Runs in flight complete as invalidated.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.pg.clear();
    }

    pub fn visualize<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        let inner = self.inner.lock();
        let labeled = inner.pg.map(
            |_, entry| format!("{} ({})", entry.node, entry.state_name()),
            |_, _| "",
        );
        write!(out, "{}", Dot::with_config(&labeled, &[Config::EdgeNoLabel]))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
