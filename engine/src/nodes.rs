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

//! The kinds of node the scheduler memoizes.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use async_trait::async_trait;
use futures::future;
use knot_rules::{Entry, EntryId as RuleEntryId, Params, Value};
use tracing::debug;

use crate::{
    context::Context,
    failure::Failure,
    graph::Node,
    process::{FallibleProcessResult, Process, ProcessCacheScope},
};

/// A rule applied to the params it uses.
///
/// Identity is the rule and its params. The rule graph entry only says how to compute the inputs,
/// so the same rule reached from different queries shares one node.
#[derive(Clone, Debug)]
pub struct Task {
    pub(crate) entry: RuleEntryId,
    pub(crate) rule_index: usize,
    pub(crate) params: Params,
    pub(crate) rule: String,
    pub(crate) cacheable: bool,
}

impl PartialEq for Task {
    fn eq(&self, other: &Task) -> bool {
        self.rule_index == other.rule_index && self.params == other.params
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rule_index.hash(state);
        self.params.hash(state);
    }
}

impl Task {
    pub fn params(&self) -> &Params {
        &self.params
    }

    async fn run(self, context: Context) -> Result<Value, Failure> {
        let core = context.core().clone();
        let rule = match core.rule_graph.entry(self.entry) {
            Entry::Rule(rule) => rule,
            Entry::Param(t) => {
                return Err(Failure::throw(format!("{} is a param, not a rule", t)));
            }
        };
        debug!(rule = %self.rule, params = ?self.params, "running");
        let inputs = future::try_join_all(
            rule.inputs()
                .iter()
                .map(|input| context.select(*input, self.params.clone())),
        )
        .await
        .map_err(|failure| failure.with_frame(&self.rule))?;
        let func = core.rules[rule.rule()].clone();
        let name = self.rule;
        func(context.for_task(self.entry, self.params), inputs)
            .await
            .map_err(|failure| failure.with_frame(&name))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Task(Box<Task>),
    ExecuteProcess(Box<Process>),
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Task(task) => write!(f, "{}({:?})", task.rule, task.params),
            NodeKey::ExecuteProcess(process) => write!(f, "Process({})", process.description),
        }
    }
}

#[async_trait]
impl Node for NodeKey {
    type Context = Context;
    type Item = Value;
    type Error = Failure;

    async fn run(self, context: Context) -> Result<Value, Failure> {
        match self {
            NodeKey::Task(task) => (*task).run(context).await,
            NodeKey::ExecuteProcess(process) => {
                let runner = context.core().runner.clone();
                Ok(Value::new(runner.run(*process).await?))
            }
        }
    }

    fn cacheable(&self) -> bool {
        match self {
            NodeKey::Task(task) => task.cacheable,
            NodeKey::ExecuteProcess(process) => process.cache_scope != ProcessCacheScope::PerSession,
        }
    }

    fn cacheable_item(&self, item: &Value) -> bool {
        match self {
            NodeKey::ExecuteProcess(process) if process.cache_scope == ProcessCacheScope::Successful => {
                item.downcast_ref::<FallibleProcessResult>()
                    .map_or(false, |result| result.exit_code == 0)
            }
            _ => true,
        }
    }
}
