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

use std::sync::Arc;

use futures::future;
use knot_rules::{
    DependencyKey, Entry, EntryId as RuleEntryId, FieldSet, Params, Product, RuleEntry, Target,
    TypeId, UnionGet, UnionMembership, Value,
};
use knot_store::Store;

use crate::{
    failure::Failure,
    graph::{EntryId, Graph, NodeContext, RunId},
    nodes::{NodeKey, Task},
    process::Process,
    scheduler::Core,
    workspace::Workspace,
};

/// The rule entry and params of the task a context runs on behalf of.
#[derive(Clone)]
struct Frame {
    entry: RuleEntryId,
    params: Params,
}

/// What a running rule can do besides compute: issue gets, and reach the engine's services.
#[derive(Clone)]
pub struct Context {
    core: Arc<Core>,
    run_id: RunId,
    entry_id: Option<EntryId>,
    frame: Option<Frame>,
}

impl Context {
    pub(crate) fn new(core: Arc<Core>, run_id: RunId) -> Context {
        Context {
            core,
            run_id,
            entry_id: None,
            frame: None,
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub(crate) fn for_task(&self, entry: RuleEntryId, params: Params) -> Context {
        Context {
            frame: Some(Frame { entry, params }),
            ..self.clone()
        }
    }

    /// Computes `O` from `input` and the params of the calling rule.
    pub async fn get<O: Product, I: Product>(&self, input: I) -> Result<O, Failure> {
        let key = DependencyKey::new(TypeId::of::<O>(), TypeId::of::<I>());
        let (frame, rule) = self.calling_rule()?;
        let signature = self.core.rule_graph.rule(rule.rule());
        if !signature.declares_get(&key) {
            return Err(Failure::throw(format!(
                "{} issued {}, which it did not declare",
                signature.name, key
            )));
        }
        let dependency = rule.get(&key).ok_or_else(|| {
            Failure::throw(format!("no rule computes {} for {}", key, signature.name))
        })?;
        let params = frame.params.clone().with(Value::new(input));
        let value = self.select(dependency, params).await?;
        downcast(value)
    }

    /// Computes `O` from each input concurrently. Results are in input order.
    pub async fn multi_get<O: Product, I: Product>(&self, inputs: Vec<I>) -> Result<Vec<O>, Failure> {
        future::try_join_all(inputs.into_iter().map(|input| self.get::<O, I>(input))).await
    }

    /// Computes `O` from `member`, a value of any type registered as a member of the union `U`.
    pub async fn get_union<O: Product, U: 'static>(&self, member: Value) -> Result<O, Failure> {
        let get = UnionGet {
            product: TypeId::of::<O>(),
            union: TypeId::of::<U>(),
        };
        let (frame, rule) = self.calling_rule()?;
        let signature = self.core.rule_graph.rule(rule.rule());
        if !signature.declares_union_get(&get) {
            return Err(Failure::throw(format!(
                "{} issued {}, which it did not declare",
                signature.name, get
            )));
        }
        let member_type = member.type_id();
        if !self.core.unions.is_member(get.union, member_type) {
            return Err(Failure::throw(format!(
                "{} is not a member of the union {}",
                member_type, get.union
            )));
        }
        let dependency = rule.union_get(&get, member_type).ok_or_else(|| {
            Failure::throw(format!(
                "no installed rule computes {} for {}, a member of the union {}",
                get.product, member_type, get.union
            ))
        })?;
        let params = frame.params.clone().with(member);
        let value = self.select(dependency, params).await?;
        downcast(value)
    }

    /// The field sets of the union `U` that apply to `target`.
    pub fn field_sets<U: 'static>(
        &self,
        target: &Target,
        allow_ambiguous: bool,
    ) -> Result<Vec<Value>, Failure> {
        Ok(self
            .core
            .unions
            .field_sets(TypeId::of::<U>(), target, allow_ambiguous)?)
    }

    /// The field set `F` of `target`, if `F` is a member of `U` and applies to it.
    pub fn field_set<U: 'static, F: FieldSet>(&self, target: &Target) -> Result<Option<F>, Failure> {
        Ok(self
            .field_sets::<U>(target, true)?
            .into_iter()
            .find_map(|v| v.downcast::<F>()))
    }

    pub fn union_membership(&self) -> &UnionMembership {
        &self.core.unions
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.core.store.clone(), self.core.build_root.clone())
    }

    pub(crate) async fn execute_process(&self, process: Process) -> Result<Value, Failure> {
        self.core
            .graph
            .get(self, NodeKey::ExecuteProcess(Box::new(process)))
            .await
    }

    /// Computes the value of a rule graph entry from (a superset of) the params it uses.
    pub(crate) async fn select(&self, entry: RuleEntryId, params: Params) -> Result<Value, Failure> {
        match self.core.rule_graph.entry(entry) {
            Entry::Param(type_id) => params.find_value(*type_id).cloned().ok_or_else(|| {
                Failure::throw(format!("{} was expected to be one of the params", type_id))
            }),
            Entry::Rule(rule) => {
                let signature = self.core.rule_graph.rule(rule.rule());
                let task = Task {
                    entry,
                    rule_index: rule.rule(),
                    params: params.restrict(rule.used_params()),
                    rule: signature.name.clone(),
                    cacheable: signature.cacheable,
                };
                self.core
                    .graph
                    .get(self, NodeKey::Task(Box::new(task)))
                    .await
            }
        }
    }

    fn calling_rule(&self) -> Result<(&Frame, &RuleEntry), Failure> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| Failure::throw("a Get may only be issued from within a rule"))?;
        match self.core.rule_graph.entry(frame.entry) {
            Entry::Rule(rule) => Ok((frame, rule)),
            Entry::Param(t) => Err(Failure::throw(format!("{} is a param, not a rule", t))),
        }
    }
}

fn downcast<O: Product>(value: Value) -> Result<O, Failure> {
    value.downcast::<O>().ok_or_else(|| {
        Failure::throw(format!(
            "expected a {} but got a {}",
            TypeId::of::<O>(),
            value.type_id()
        ))
    })
}

impl NodeContext for Context {
    type Node = NodeKey;

    fn graph(&self) -> &Graph<NodeKey> {
        &self.core.graph
    }

    fn entry_id(&self) -> Option<EntryId> {
        self.entry_id
    }

    fn clone_for(&self, entry_id: EntryId) -> Context {
        Context {
            core: self.core.clone(),
            run_id: self.run_id,
            entry_id: Some(entry_id),
            frame: None,
        }
    }

    fn run_id(&self) -> RunId {
        self.run_id
    }
}
