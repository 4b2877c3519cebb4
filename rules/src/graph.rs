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

//! Compiles rule signatures into a static graph.
//!
//! A *slot* is a request for a product given a set of available param types (and, for `Get`s, the
//! param type the `Get` provides). Compilation explores every slot reachable from the queries,
//! then:
//!
//! 1. computes which slots are satisfiable. Positional inputs need a finite derivation (a least
//!    fixpoint), while `Get`s are assumed satisfiable until shown otherwise (a greatest fixpoint),
//!    so that rules may recurse through their own `Get`s but never through their inputs;
//! 2. drops candidates whose inputs can only be derived through the slot they compute, and `Get`
//!    candidates that ignore the param the `Get` provides, repeating 1 and 2 until stable;
//! 3. picks, for each reachable slot, the satisfiable candidate consuming the fewest params.
//!    A tie is an ambiguity.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt,
};

use thiserror::Error;
use tracing::warn;

use knot_metrics::scoped_metric;

use crate::{
    rules::{DependencyKey, Query, RuleKind, RuleSignature, UnionGet},
    types::{display_types, ParamTypes, TypeId},
    unions::UnionMembership,
};

pub type EntryId = usize;

/// Every problem found while compiling, one message per problem.
#[derive(Error, Debug)]
#[error("{}", .0.join("\n\n"))]
pub struct RuleGraphError(pub Vec<String>);

#[derive(Clone, Debug)]
pub enum Entry {
    /// The value is one of the params.
    Param(TypeId),
    Rule(RuleEntry),
}

#[derive(Clone, Debug)]
pub struct RuleEntry {
    rule: usize,
    used_params: ParamTypes,
    inputs: Vec<EntryId>,
    gets: HashMap<DependencyKey, EntryId>,
    union_gets: HashMap<(UnionGet, TypeId), EntryId>,
}

impl RuleEntry {
    pub fn rule(&self) -> usize {
        self.rule
    }

    /// The param types this entry needs, transitively. Nothing else may affect its result.
    pub fn used_params(&self) -> &ParamTypes {
        &self.used_params
    }

    pub fn inputs(&self) -> &[EntryId] {
        &self.inputs
    }

    pub fn get(&self, key: &DependencyKey) -> Option<EntryId> {
        self.gets.get(key).copied()
    }

    pub fn union_get(&self, get: &UnionGet, member: TypeId) -> Option<EntryId> {
        self.union_gets.get(&(*get, member)).copied()
    }
}

#[derive(Debug)]
pub struct RuleGraph {
    rules: Vec<RuleSignature>,
    entries: Vec<Entry>,
    roots: BTreeMap<Query, EntryId>,
    unreachable: Vec<usize>,
}

impl RuleGraph {
    pub fn compile(
        rules: Vec<RuleSignature>,
        queries: Vec<Query>,
        unions: &UnionMembership,
    ) -> Result<RuleGraph, RuleGraphError> {
        scoped_metric!("compile_rule_graph");
        let mut errors = Vec::new();
        let mut identities = HashSet::new();
        for rule in &rules {
            if !identities.insert(rule.identity()) {
                errors.push(format!("The rule {} is registered more than once.", rule));
            }
        }
        if !errors.is_empty() {
            return Err(RuleGraphError(errors));
        }

        let mut builder = Builder::new(&rules, unions);
        let root_slots: Vec<Slot> = queries
            .iter()
            .map(|q| Slot {
                product: q.product,
                params: q.params.clone(),
                provided: None,
            })
            .collect();
        let root_ids = builder.explore(&root_slots);
        let sat = builder.resolve();
        let approximate_used = builder.used_params(&sat, None);

        let mut selected: Vec<Option<usize>> = vec![None; builder.slots.len()];
        let mut reachable = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for (query, &id) in queries.iter().zip(&root_ids) {
            if sat[id] {
                if seen.insert(id) {
                    queue.push_back(id);
                }
            } else {
                errors.push(builder.explain(query, id, &sat));
            }
        }
        while let Some(id) = queue.pop_front() {
            match builder.select(id, &sat, &approximate_used) {
                Ok(ci) => {
                    selected[id] = Some(ci);
                    reachable.push(id);
                    for dep in builder.candidates[id][ci].dependencies(&sat) {
                        if seen.insert(dep) {
                            queue.push_back(dep);
                        }
                    }
                }
                Err(tied) => errors.push(builder.ambiguity(id, &tied)),
            }
        }
        if !errors.is_empty() {
            return Err(RuleGraphError(errors));
        }

        let used = builder.used_params(&sat, Some(&selected));
        let index: HashMap<usize, EntryId> = reachable
            .iter()
            .enumerate()
            .map(|(entry, slot)| (*slot, entry))
            .collect();
        let mut entries = Vec::with_capacity(reachable.len());
        let mut selected_rules = HashSet::new();
        for &id in &reachable {
            let ci = match selected[id] {
                Some(ci) => ci,
                None => continue,
            };
            entries.push(match &builder.candidates[id][ci] {
                Candidate::Param(t) => Entry::Param(*t),
                Candidate::Rule {
                    rule,
                    inputs,
                    gets,
                    union_gets,
                } => {
                    selected_rules.insert(*rule);
                    Entry::Rule(RuleEntry {
                        rule: *rule,
                        used_params: used[id].clone(),
                        inputs: inputs.iter().map(|s| index[s]).collect(),
                        gets: gets.iter().map(|(key, s)| (*key, index[s])).collect(),
                        union_gets: union_gets
                            .iter()
                            .filter_map(|(get, member, s)| {
                                index.get(s).map(|entry| ((*get, *member), *entry))
                            })
                            .collect(),
                    })
                }
            });
        }

        let roots = queries
            .into_iter()
            .zip(root_ids)
            .map(|(query, id)| (query, index[&id]))
            .collect();
        let unreachable: Vec<usize> = (0..rules.len())
            .filter(|r| !selected_rules.contains(r) && rules[*r].kind != RuleKind::Intrinsic)
            .collect();
        for r in &unreachable {
            warn!(rule = %rules[*r], "rule is not reachable from any query");
        }

        Ok(RuleGraph {
            rules,
            entries,
            roots,
            unreachable,
        })
    }

    pub fn root(&self, query: &Query) -> Option<EntryId> {
        self.roots.get(query).copied()
    }

    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.roots.keys()
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id]
    }

    pub fn rule(&self, idx: usize) -> &RuleSignature {
        &self.rules[idx]
    }

    pub fn rules(&self) -> &[RuleSignature] {
        &self.rules
    }

    pub fn used_params(&self, id: EntryId) -> ParamTypes {
        match &self.entries[id] {
            Entry::Param(t) => std::iter::once(*t).collect(),
            Entry::Rule(r) => r.used_params.clone(),
        }
    }

    pub fn unreachable_rules(&self) -> impl Iterator<Item = &RuleSignature> {
        self.unreachable.iter().map(move |r| &self.rules[*r])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn label(&self, id: EntryId) -> String {
        match &self.entries[id] {
            Entry::Param(t) => format!("param {}", t),
            Entry::Rule(r) => format!(
                "{} for ({})",
                self.rules[r.rule].name,
                display_types(&r.used_params)
            ),
        }
    }
}

impl fmt::Display for RuleGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (query, root) in &self.roots {
            writeln!(f, "{} <- {}", query, self.label(*root))?;
        }
        let mut rendered: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, entry) in self.entries.iter().enumerate() {
            let rule_entry = match entry {
                Entry::Rule(r) => r,
                Entry::Param(_) => continue,
            };
            rendered.entry(self.label(id)).or_insert_with(|| {
                let signature = &self.rules[rule_entry.rule];
                let mut lines: Vec<String> = signature
                    .inputs
                    .iter()
                    .zip(&rule_entry.inputs)
                    .map(|(input, dep)| format!("{} <- {}", input, self.label(*dep)))
                    .collect();
                let mut gets: Vec<String> = rule_entry
                    .gets
                    .iter()
                    .map(|(key, dep)| format!("{} <- {}", key, self.label(*dep)))
                    .chain(rule_entry.union_gets.iter().map(|((get, member), dep)| {
                        format!("{} as {} <- {}", get, member, self.label(*dep))
                    }))
                    .collect();
                gets.sort();
                lines.extend(gets);
                lines
            });
        }
        for (label, lines) in rendered {
            writeln!(f, "{}", label)?;
            for line in lines {
                writeln!(f, "  {}", line)?;
            }
        }
        for rule in self.unreachable_rules() {
            writeln!(f, "unreachable: {}", rule)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Slot {
    product: TypeId,
    params: ParamTypes,
    /// The param a `Get` adds. The chosen rule must consume it.
    provided: Option<TypeId>,
}

#[derive(Clone, Debug)]
enum Candidate {
    Param(TypeId),
    Rule {
        rule: usize,
        inputs: Vec<usize>,
        gets: Vec<(DependencyKey, usize)>,
        union_gets: Vec<(UnionGet, TypeId, usize)>,
    },
}

impl Candidate {
    /// Inputs and `Get`s must all be satisfiable. Union members that are not are simply skipped.
    fn deps_satisfied(&self, inputs_sat: &[bool], gets_sat: &[bool]) -> bool {
        match self {
            Candidate::Param(_) => true,
            Candidate::Rule { inputs, gets, .. } => {
                inputs.iter().all(|s| inputs_sat[*s]) && gets.iter().all(|(_, s)| gets_sat[*s])
            }
        }
    }

    fn inputs_satisfied(&self, sat: &[bool]) -> bool {
        match self {
            Candidate::Param(_) => true,
            Candidate::Rule { inputs, .. } => inputs.iter().all(|s| sat[*s]),
        }
    }

    fn dependencies(&self, sat: &[bool]) -> Vec<usize> {
        match self {
            Candidate::Param(_) => Vec::new(),
            Candidate::Rule {
                inputs,
                gets,
                union_gets,
                ..
            } => inputs
                .iter()
                .copied()
                .chain(gets.iter().map(|(_, s)| *s))
                .chain(
                    union_gets
                        .iter()
                        .map(|(_, _, s)| *s)
                        .filter(|s| sat[*s]),
                )
                .collect(),
        }
    }
}

struct Builder<'a> {
    rules: &'a [RuleSignature],
    unions: &'a UnionMembership,
    producers: HashMap<TypeId, Vec<usize>>,
    slots: Vec<Slot>,
    slot_ids: HashMap<Slot, usize>,
    candidates: Vec<Vec<Candidate>>,
    excluded: HashSet<(usize, usize)>,
}

impl<'a> Builder<'a> {
    fn new(rules: &'a [RuleSignature], unions: &'a UnionMembership) -> Builder<'a> {
        let mut producers: HashMap<TypeId, Vec<usize>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            producers.entry(rule.product).or_default().push(idx);
        }
        Builder {
            rules,
            unions,
            producers,
            slots: Vec::new(),
            slot_ids: HashMap::new(),
            candidates: Vec::new(),
            excluded: HashSet::new(),
        }
    }

    fn intern(&mut self, slot: Slot, queue: &mut VecDeque<usize>) -> usize {
        if let Some(id) = self.slot_ids.get(&slot) {
            return *id;
        }
        let id = self.slots.len();
        self.slots.push(slot.clone());
        self.slot_ids.insert(slot, id);
        self.candidates.push(Vec::new());
        queue.push_back(id);
        id
    }

    fn explore(&mut self, roots: &[Slot]) -> Vec<usize> {
        let mut queue = VecDeque::new();
        let root_ids = roots
            .iter()
            .map(|slot| self.intern(slot.clone(), &mut queue))
            .collect();
        while let Some(id) = queue.pop_front() {
            let slot = self.slots[id].clone();
            // Params shadow rules.
            let candidates = if slot.params.contains(&slot.product) {
                vec![Candidate::Param(slot.product)]
            } else {
                let producers = self
                    .producers
                    .get(&slot.product)
                    .cloned()
                    .unwrap_or_default();
                producers
                    .into_iter()
                    .map(|rule| self.rule_candidate(rule, &slot.params, &mut queue))
                    .collect()
            };
            self.candidates[id] = candidates;
        }
        root_ids
    }

    fn rule_candidate(
        &mut self,
        rule: usize,
        params: &ParamTypes,
        queue: &mut VecDeque<usize>,
    ) -> Candidate {
        let rules = self.rules;
        let unions = self.unions;
        let signature = &rules[rule];
        let inputs = signature
            .inputs
            .iter()
            .map(|input| {
                let slot = Slot {
                    product: *input,
                    params: params.clone(),
                    provided: None,
                };
                self.intern(slot, queue)
            })
            .collect();
        let gets = signature
            .gets
            .iter()
            .map(|key| {
                let mut with_param = params.clone();
                with_param.insert(key.param);
                let slot = Slot {
                    product: key.product,
                    params: with_param,
                    provided: Some(key.param),
                };
                (*key, self.intern(slot, queue))
            })
            .collect();
        let mut union_gets = Vec::new();
        for get in &signature.union_gets {
            for member in unions.members(get.union) {
                let mut with_member = params.clone();
                with_member.insert(*member);
                let slot = Slot {
                    product: get.product,
                    params: with_member,
                    provided: Some(*member),
                };
                union_gets.push((*get, *member, self.intern(slot, queue)));
            }
        }
        Candidate::Rule {
            rule,
            inputs,
            gets,
            union_gets,
        }
    }

    fn viable<'b>(
        &'b self,
        id: usize,
        sat: &'b [bool],
    ) -> impl Iterator<Item = (usize, &'b Candidate)> + 'b {
        self.candidates[id]
            .iter()
            .enumerate()
            .filter(move |(ci, c)| {
                !self.excluded.contains(&(id, *ci)) && c.deps_satisfied(sat, sat)
            })
    }

    /// Greatest fixpoint over `Get`s of the least fixpoint over inputs: every `Get` is assumed
    /// satisfiable until the inputs show otherwise.
    fn satisfiable(&self) -> Vec<bool> {
        let mut assumed = vec![true; self.slots.len()];
        loop {
            let sat = self.derivable(&assumed, None);
            if sat == assumed {
                return sat;
            }
            assumed = sat;
        }
    }

    /// Least fixpoint: the slots with a finite derivation through inputs, given which `Get`s are
    /// satisfiable. `removed` is never derivable.
    fn derivable(&self, gets_sat: &[bool], removed: Option<usize>) -> Vec<bool> {
        let mut sat = vec![false; self.slots.len()];
        loop {
            let mut changed = false;
            for id in 0..self.slots.len() {
                if sat[id] || Some(id) == removed {
                    continue;
                }
                let derived = self.candidates[id].iter().enumerate().any(|(ci, c)| {
                    !self.excluded.contains(&(id, ci)) && c.deps_satisfied(&sat, gets_sat)
                });
                if derived {
                    sat[id] = true;
                    changed = true;
                }
            }
            if !changed {
                return sat;
            }
        }
    }

    fn candidate_used(&self, candidate: &Candidate, used: &[ParamTypes], sat: &[bool]) -> ParamTypes {
        match candidate {
            Candidate::Param(t) => std::iter::once(*t).collect(),
            Candidate::Rule {
                inputs,
                gets,
                union_gets,
                ..
            } => {
                let mut consumed = ParamTypes::new();
                for s in inputs {
                    consumed.extend(used[*s].iter().copied());
                }
                for (key, s) in gets {
                    consumed.extend(used[*s].iter().copied().filter(|t| *t != key.param));
                }
                for (_, member, s) in union_gets {
                    if sat[*s] {
                        consumed.extend(used[*s].iter().copied().filter(|t| t != member));
                    }
                }
                consumed
            }
        }
    }

    /// Least fixpoint of consumed params, over the selected candidates when given and over every
    /// viable candidate otherwise.
    fn used_params(&self, sat: &[bool], selected: Option<&[Option<usize>]>) -> Vec<ParamTypes> {
        let mut used = vec![ParamTypes::new(); self.slots.len()];
        loop {
            let mut changed = false;
            for id in 0..self.slots.len() {
                if !sat[id] {
                    continue;
                }
                let consumed = match selected {
                    Some(selected) => match selected[id] {
                        Some(ci) => self.candidate_used(&self.candidates[id][ci], &used, sat),
                        None => continue,
                    },
                    None => {
                        let mut consumed = ParamTypes::new();
                        for (_, c) in self.viable(id, sat) {
                            consumed.extend(self.candidate_used(c, &used, sat));
                        }
                        consumed
                    }
                };
                if consumed != used[id] {
                    used[id] = consumed;
                    changed = true;
                }
            }
            if !changed {
                return used;
            }
        }
    }

    /// Alternates satisfiability and consumption until no more candidates are dropped.
    fn resolve(&mut self) -> Vec<bool> {
        loop {
            let sat = self.satisfiable();
            let used = self.used_params(&sat, None);
            let mut dropped = Vec::new();
            for id in 0..self.slots.len() {
                if !sat[id] {
                    continue;
                }
                let viable: Vec<(usize, &Candidate)> = self.viable(id, &sat).collect();
                if viable.len() > 1 {
                    let without = self.derivable(&sat, Some(id));
                    dropped.extend(
                        viable
                            .iter()
                            .filter(|(_, c)| !c.inputs_satisfied(&without))
                            .map(|(ci, _)| (id, *ci)),
                    );
                }
                if let Some(provided) = self.slots[id].provided {
                    dropped.extend(
                        viable
                            .iter()
                            .filter(|(_, c)| {
                                !self.candidate_used(c, &used, &sat).contains(&provided)
                            })
                            .map(|(ci, _)| (id, *ci)),
                    );
                }
            }
            if dropped.is_empty() {
                return sat;
            }
            self.excluded.extend(dropped);
        }
    }

    fn select(&self, id: usize, sat: &[bool], used: &[ParamTypes]) -> Result<usize, Vec<usize>> {
        let viable: Vec<(usize, usize)> = self
            .viable(id, sat)
            .map(|(ci, c)| (ci, self.candidate_used(c, used, sat).len()))
            .collect();
        let fewest = viable.iter().map(|(_, n)| *n).min().unwrap_or(0);
        let best: Vec<usize> = viable
            .into_iter()
            .filter(|(_, n)| *n == fewest)
            .map(|(ci, _)| ci)
            .collect();
        if best.len() == 1 {
            Ok(best[0])
        } else {
            Err(best)
        }
    }

    fn describe(&self, candidate: &Candidate) -> String {
        match candidate {
            Candidate::Param(t) => format!("param {}", t),
            Candidate::Rule { rule, .. } => self.rules[*rule].to_string(),
        }
    }

    fn ambiguity(&self, id: usize, tied: &[usize]) -> String {
        let slot = &self.slots[id];
        let mut message = format!(
            "Ambiguous rules to compute {} with parameter types ({}):",
            slot.product,
            display_types(&slot.params)
        );
        for ci in tied {
            message.push_str("\n  ");
            message.push_str(&self.describe(&self.candidates[id][*ci]));
        }
        message
    }

    fn explain(&self, query: &Query, id: usize, sat: &[bool]) -> String {
        let mut message = format!("No rule can compute {}:", query);
        if self.candidates[id].is_empty() {
            message.push_str(&format!("\n  no installed rule returns {}", query.product));
        }
        for (ci, candidate) in self.candidates[id].iter().enumerate() {
            let (rule, inputs, gets) = match candidate {
                Candidate::Rule {
                    rule, inputs, gets, ..
                } => (*rule, inputs, gets),
                Candidate::Param(_) => continue,
            };
            let signature = &self.rules[rule];
            let mut missing: Vec<String> = signature
                .inputs
                .iter()
                .zip(inputs)
                .filter(|(_, s)| !sat[**s])
                .map(|(input, _)| input.to_string())
                .collect();
            missing.extend(
                gets.iter()
                    .filter(|(_, s)| !sat[*s])
                    .map(|(key, _)| key.to_string()),
            );
            if missing.is_empty() && self.excluded.contains(&(id, ci)) {
                missing.push("does not consume the provided param".to_owned());
            }
            message.push_str(&format!(
                "\n  {} cannot satisfy: {}",
                signature,
                missing.join(", ")
            ));
        }
        message
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::unions::UnionRule;

    struct A;
    struct B;
    struct C;
    struct D;
    struct X;
    struct Lint;
    struct Member1;
    struct Member2;

    fn t<T: 'static>() -> TypeId {
        TypeId::of::<T>()
    }

    fn rule(name: &str, product: TypeId, inputs: Vec<TypeId>) -> RuleSignature {
        RuleSignature::new(name, product, inputs)
    }

    fn with_get(mut rule: RuleSignature, product: TypeId, param: TypeId) -> RuleSignature {
        rule.gets.push(DependencyKey::new(product, param));
        rule
    }

    fn compile(rules: Vec<RuleSignature>, queries: Vec<Query>) -> Result<RuleGraph, RuleGraphError> {
        RuleGraph::compile(rules, queries, &UnionMembership::new())
    }

    #[test]
    fn simple_chain() {
        let graph = compile(
            vec![
                rule("make_b", t::<B>(), vec![t::<A>()]),
                rule("make_c", t::<C>(), vec![t::<B>()]),
            ],
            vec![Query::new(t::<C>(), vec![t::<A>()])],
        )
        .unwrap();
        insta::assert_snapshot!(graph.to_string(), @r###"
        C for (A) <- make_c for (A)
        make_b for (A)
          A <- param A
        make_c for (A)
          B <- make_b for (A)
        "###);
    }

    #[test]
    fn get_must_consume_its_param() {
        let graph = compile(
            vec![
                rule("make_b", t::<B>(), vec![t::<A>()]),
                rule("make_b_from_x", t::<B>(), vec![t::<X>()]),
                with_get(rule("make_c", t::<C>(), vec![t::<A>()]), t::<B>(), t::<X>()),
            ],
            vec![Query::new(t::<C>(), vec![t::<A>()])],
        )
        .unwrap();
        insta::assert_snapshot!(graph.to_string(), @r###"
        C for (A) <- make_c for (A)
        make_b_from_x for (X)
          X <- param X
        make_c for (A)
          A <- param A
          Get(B, X) <- make_b_from_x for (X)
        unreachable: make_b(A) -> B
        "###);
    }

    #[test]
    fn unused_params_are_not_part_of_the_key() {
        let graph = compile(
            vec![
                rule("make_b", t::<B>(), vec![t::<A>()]),
                rule("make_c", t::<C>(), vec![t::<B>()]),
            ],
            vec![Query::new(t::<C>(), vec![t::<A>(), t::<X>()])],
        )
        .unwrap();
        let root = graph
            .root(&Query::new(t::<C>(), vec![t::<A>(), t::<X>()]))
            .unwrap();
        let expected: ParamTypes = vec![t::<A>()].into_iter().collect();
        assert_eq!(graph.used_params(root), expected);
    }

    #[test]
    fn params_shadow_rules() {
        let graph = compile(
            vec![rule("make_b", t::<B>(), vec![t::<A>()])],
            vec![Query::new(t::<B>(), vec![t::<B>()])],
        )
        .unwrap();
        let root = graph.root(&Query::new(t::<B>(), vec![t::<B>()])).unwrap();
        assert!(matches!(graph.entry(root), Entry::Param(p) if *p == t::<B>()));
        assert_eq!(graph.unreachable_rules().count(), 1);
    }

    #[test]
    fn recursion_through_gets() {
        let graph = compile(
            vec![with_get(rule("fib", t::<B>(), vec![t::<A>()]), t::<B>(), t::<A>())],
            vec![Query::new(t::<B>(), vec![t::<A>()])],
        )
        .unwrap();
        let root = graph.root(&Query::new(t::<B>(), vec![t::<A>()])).unwrap();
        match graph.entry(root) {
            Entry::Rule(entry) => {
                let key = DependencyKey::new(t::<B>(), t::<A>());
                let recursive = entry.get(&key).expect("get resolved");
                assert!(matches!(graph.entry(recursive), Entry::Rule(r) if r.rule() == 0));
            }
            Entry::Param(_) => panic!("expected a rule"),
        }
    }

    #[test]
    fn ambiguous_rules() {
        let err = compile(
            vec![
                rule("b_from_a", t::<B>(), vec![t::<A>()]),
                rule("b_from_x", t::<B>(), vec![t::<X>()]),
            ],
            vec![Query::new(t::<B>(), vec![t::<A>(), t::<X>()])],
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r###"
        Ambiguous rules to compute B with parameter types (A, X):
          b_from_a(A) -> B
          b_from_x(X) -> B
        "###);
    }

    #[test]
    fn fewer_params_break_ties() {
        let graph = compile(
            vec![
                rule("b_from_a", t::<B>(), vec![t::<A>()]),
                rule("b_from_a_and_x", t::<B>(), vec![t::<A>(), t::<X>()]),
            ],
            vec![Query::new(t::<B>(), vec![t::<A>(), t::<X>()])],
        )
        .unwrap();
        let root = graph
            .root(&Query::new(t::<B>(), vec![t::<A>(), t::<X>()]))
            .unwrap();
        assert!(matches!(graph.entry(root), Entry::Rule(r) if r.rule() == 0));
    }

    #[test]
    fn unsatisfiable_query() {
        let err = compile(
            vec![rule("make_c", t::<C>(), vec![t::<B>()])],
            vec![
                Query::new(t::<C>(), vec![t::<A>()]),
                Query::new(t::<D>(), vec![t::<A>()]),
            ],
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r###"
        No rule can compute C for (A):
          make_c(B) -> C cannot satisfy: B

        No rule can compute D for (A):
          no installed rule returns D
        "###);
    }

    #[test]
    fn cycles_through_inputs_are_unsatisfiable() {
        let err = compile(
            vec![
                rule("b_from_c", t::<B>(), vec![t::<C>()]),
                rule("c_from_b", t::<C>(), vec![t::<B>()]),
            ],
            vec![Query::new(t::<B>(), vec![t::<A>()])],
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r###"
        No rule can compute B for (A):
          b_from_c(C) -> B cannot satisfy: C
        "###);
    }

    #[test]
    fn converters_back_to_a_product_do_not_compete_with_its_producer() {
        // Digest from globs, Snapshot from Digest, and Digest back from Snapshot.
        let graph = compile(
            vec![
                rule("path_globs_to_digest", t::<B>(), vec![t::<A>()]),
                rule("digest_to_snapshot", t::<C>(), vec![t::<B>()]),
                rule("snapshot_to_digest", t::<B>(), vec![t::<C>()]),
            ],
            vec![
                Query::new(t::<B>(), vec![t::<A>()]),
                Query::new(t::<C>(), vec![t::<A>()]),
            ],
        )
        .unwrap();
        insta::assert_snapshot!(graph.to_string(), @r###"
        B for (A) <- path_globs_to_digest for (A)
        C for (A) <- digest_to_snapshot for (A)
        digest_to_snapshot for (A)
          B <- path_globs_to_digest for (A)
        path_globs_to_digest for (A)
          A <- param A
        unreachable: snapshot_to_digest(C) -> B
        "###);
    }

    #[test]
    fn inputs_may_reach_a_product_another_way() {
        let graph = compile(
            vec![
                rule("c_from_b", t::<C>(), vec![t::<B>()]),
                rule("b_from_c", t::<B>(), vec![t::<C>()]),
                rule("b_from_a", t::<B>(), vec![t::<A>()]),
            ],
            vec![Query::new(t::<C>(), vec![t::<A>()])],
        )
        .unwrap();
        let root = graph.root(&Query::new(t::<C>(), vec![t::<A>()])).unwrap();
        let input = match graph.entry(root) {
            Entry::Rule(entry) => entry.inputs()[0],
            Entry::Param(_) => panic!("expected a rule"),
        };
        assert!(matches!(graph.entry(input), Entry::Rule(r) if r.rule() == 2));
    }

    #[test]
    fn duplicate_rules() {
        let err = compile(
            vec![
                rule("make_b", t::<B>(), vec![t::<A>()]),
                rule("make_b", t::<B>(), vec![t::<A>()]),
            ],
            vec![],
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The rule make_b(A) -> B is registered more than once."
        );
    }

    #[test]
    fn union_members_without_rules_are_skipped() {
        let mut unions = UnionMembership::new();
        unions.add(UnionRule::new::<Lint, Member1>());
        unions.add(UnionRule::new::<Lint, Member2>());
        let mut lint = rule("lint", t::<C>(), vec![t::<A>()]);
        lint.union_gets.push(UnionGet {
            product: t::<B>(),
            union: t::<Lint>(),
        });
        let graph = RuleGraph::compile(
            vec![lint, rule("lint_member1", t::<B>(), vec![t::<Member1>()])],
            vec![Query::new(t::<C>(), vec![t::<A>()])],
            &unions,
        )
        .unwrap();
        let root = graph.root(&Query::new(t::<C>(), vec![t::<A>()])).unwrap();
        let get = UnionGet {
            product: t::<B>(),
            union: t::<Lint>(),
        };
        match graph.entry(root) {
            Entry::Rule(entry) => {
                assert!(entry.union_get(&get, t::<Member1>()).is_some());
                assert!(entry.union_get(&get, t::<Member2>()).is_none());
            }
            Entry::Param(_) => panic!("expected a rule"),
        }
    }
}
