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

//! The static half of the engine: what rules exist, what they consume and produce, and which rule
//! computes which product from which params.

pub mod graph;
mod rules;
pub mod target;
mod types;
mod unions;

pub use graph::{Entry, EntryId, RuleEntry, RuleGraph, RuleGraphError};
pub use rules::{DependencyKey, Query, RuleKind, RuleSignature, UnionGet};
pub use target::{
    Address, AmbiguousImplementations, Field, FieldSet, InvalidFieldException, Target, Targets,
};
pub use types::{display_types, ParamTypes, Params, Product, TypeId, Value};
pub use unions::{FieldSetError, UnionMembership, UnionRule};
