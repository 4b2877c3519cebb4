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

use std::fmt;

use crate::types::{display_types, ParamTypes, TypeId};

/// A `Get(product, param)` a rule may issue while running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey {
    pub product: TypeId,
    pub param: TypeId,
}

impl DependencyKey {
    pub fn new(product: TypeId, param: TypeId) -> DependencyKey {
        DependencyKey { product, param }
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Get({}, {})", self.product, self.param)
    }
}

/// A `Get(product, union)` whose param is any member of the union.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnionGet {
    pub product: TypeId,
    pub union: TypeId,
}

impl fmt::Display for UnionGet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Get({}, union {})", self.product, self.union)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Task,
    /// A top level entry point. Never cached.
    Goal,
    /// Built into the engine.
    Intrinsic,
}

/// The static description of a rule: everything the graph compiler needs to know about it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleSignature {
    pub name: String,
    pub product: TypeId,
    pub inputs: Vec<TypeId>,
    pub gets: Vec<DependencyKey>,
    pub union_gets: Vec<UnionGet>,
    pub cacheable: bool,
    pub kind: RuleKind,
}

impl RuleSignature {
    pub fn new<S: Into<String>>(name: S, product: TypeId, inputs: Vec<TypeId>) -> RuleSignature {
        RuleSignature {
            name: name.into(),
            product,
            inputs,
            gets: Vec::new(),
            union_gets: Vec::new(),
            cacheable: true,
            kind: RuleKind::Task,
        }
    }

    pub fn declares_get(&self, key: &DependencyKey) -> bool {
        self.gets.contains(key)
    }

    pub fn declares_union_get(&self, get: &UnionGet) -> bool {
        self.union_gets.contains(get)
    }

    /// Two rules with the same identity may not both be registered.
    pub fn identity(&self) -> (&str, TypeId, &[TypeId]) {
        (&self.name, self.product, &self.inputs)
    }
}

impl fmt::Display for RuleSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) -> {}",
            self.name,
            display_types(&self.inputs),
            self.product
        )
    }
}

/// A root the graph must be able to compute from exactly these param types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Query {
    pub product: TypeId,
    pub params: ParamTypes,
}

impl Query {
    pub fn new<I: IntoIterator<Item = TypeId>>(product: TypeId, params: I) -> Query {
        Query {
            product,
            params: params.into_iter().collect(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for ({})", self.product, display_types(&self.params))
    }
}
