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

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::{
    target::{AmbiguousImplementations, FieldSet, InvalidFieldException, Target},
    types::{TypeId, Value},
};

/// Declares `member` as one of the implementations of the union `union`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnionRule {
    pub union: TypeId,
    pub member: TypeId,
}

impl UnionRule {
    pub fn new<U: 'static, M: 'static>() -> UnionRule {
        UnionRule {
            union: TypeId::of::<U>(),
            member: TypeId::of::<M>(),
        }
    }
}

#[derive(Clone, Copy)]
struct FieldSetFactory {
    is_applicable: fn(&Target) -> bool,
    create: fn(&Target) -> Result<Value, InvalidFieldException>,
}

fn create_field_set<F: FieldSet>(target: &Target) -> Result<Value, InvalidFieldException> {
    F::create(target).map(Value::new)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldSetError {
    #[error(transparent)]
    Ambiguous(#[from] AmbiguousImplementations),
    #[error(transparent)]
    InvalidField(#[from] InvalidFieldException),
}

/// Which types implement which unions, in registration order.
#[derive(Clone, Default)]
pub struct UnionMembership {
    members: BTreeMap<TypeId, Vec<TypeId>>,
    field_sets: HashMap<TypeId, FieldSetFactory>,
}

impl UnionMembership {
    pub fn new() -> UnionMembership {
        UnionMembership::default()
    }

    pub fn add(&mut self, rule: UnionRule) {
        let members = self.members.entry(rule.union).or_default();
        if !members.contains(&rule.member) {
            members.push(rule.member);
        }
    }

    /// Registers a field set as a member of `union`, so that it can be computed from targets.
    pub fn add_field_set<F: FieldSet>(&mut self, union: TypeId) {
        self.add(UnionRule {
            union,
            member: TypeId::of::<F>(),
        });
        self.field_sets.insert(
            TypeId::of::<F>(),
            FieldSetFactory {
                is_applicable: F::is_applicable,
                create: create_field_set::<F>,
            },
        );
    }

    pub fn members(&self, union: TypeId) -> &[TypeId] {
        self.members.get(&union).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_union(&self, union: TypeId) -> bool {
        self.members.contains_key(&union)
    }

    pub fn is_member(&self, union: TypeId, member: TypeId) -> bool {
        self.members(union).contains(&member)
    }

    pub fn unions(&self) -> impl Iterator<Item = (&TypeId, &Vec<TypeId>)> {
        self.members.iter()
    }

    /// The field sets of `union` that apply to `target`, in registration order.
    ///
    /// Unless `allow_ambiguous`, more than one applicable implementation is an error. None is an
    /// empty result.
    pub fn field_sets(
        &self,
        union: TypeId,
        target: &Target,
        allow_ambiguous: bool,
    ) -> Result<Vec<Value>, FieldSetError> {
        let applicable: Vec<(TypeId, FieldSetFactory)> = self
            .members(union)
            .iter()
            .filter_map(|member| self.field_sets.get(member).map(|f| (*member, *f)))
            .filter(|(_, factory)| (factory.is_applicable)(target))
            .collect();
        if applicable.len() > 1 && !allow_ambiguous {
            return Err(AmbiguousImplementations {
                union: union.name(),
                address: target.address().clone(),
                candidates: applicable.iter().map(|(t, _)| t.name()).collect(),
            }
            .into());
        }
        let mut field_sets = Vec::with_capacity(applicable.len());
        for (_, factory) in applicable {
            field_sets.push((factory.create)(target)?);
        }
        Ok(field_sets)
    }
}

impl std::fmt::Debug for UnionMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.members.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::target::{Address, Field};

    struct Lint;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Sources(Vec<String>);
    impl Field for Sources {
        const ALIAS: &'static str = "sources";
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct SkipLint(bool);
    impl Field for SkipLint {
        const ALIAS: &'static str = "skip_lint";
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Formatter(Sources);
    impl FieldSet for Formatter {
        fn required_fields() -> Vec<TypeId> {
            vec![TypeId::of::<Sources>()]
        }

        fn create(target: &Target) -> Result<Self, InvalidFieldException> {
            Ok(Formatter(target.require::<Sources>()?.clone()))
        }

        fn opt_out(target: &Target) -> bool {
            target.get::<SkipLint>().map_or(false, |s| s.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Checker(Sources);
    impl FieldSet for Checker {
        fn required_fields() -> Vec<TypeId> {
            vec![TypeId::of::<Sources>()]
        }

        fn create(target: &Target) -> Result<Self, InvalidFieldException> {
            Ok(Checker(target.require::<Sources>()?.clone()))
        }
    }

    fn target(skip: bool) -> Target {
        Target::new("library", Address::new("lib", "lib"))
            .with_field(Sources(vec!["a.rs".to_owned()]))
            .with_field(SkipLint(skip))
    }

    #[test]
    fn members_in_registration_order() {
        let mut unions = UnionMembership::new();
        unions.add(UnionRule::new::<Lint, Checker>());
        unions.add(UnionRule::new::<Lint, Formatter>());
        unions.add(UnionRule::new::<Lint, Checker>());
        assert_eq!(
            unions.members(TypeId::of::<Lint>()),
            &[TypeId::of::<Checker>(), TypeId::of::<Formatter>()]
        );
        assert!(unions.is_member(TypeId::of::<Lint>(), TypeId::of::<Formatter>()));
        assert!(unions.members(TypeId::of::<Sources>()).is_empty());
    }

    #[test]
    fn applicable_field_sets() {
        let mut unions = UnionMembership::new();
        unions.add_field_set::<Formatter>(TypeId::of::<Lint>());
        let lint = TypeId::of::<Lint>();

        let found = unions.field_sets(lint, &target(false), false).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].downcast_ref::<Formatter>().is_some());

        assert!(unions.field_sets(lint, &target(true), false).unwrap().is_empty());

        let bare = Target::new("resources", Address::new("res", "res"));
        assert!(unions.field_sets(lint, &bare, false).unwrap().is_empty());
    }

    #[test]
    fn ambiguity_is_an_error_unless_allowed() {
        let mut unions = UnionMembership::new();
        unions.add_field_set::<Formatter>(TypeId::of::<Lint>());
        unions.add_field_set::<Checker>(TypeId::of::<Lint>());
        let lint = TypeId::of::<Lint>();

        let err = unions.field_sets(lint, &target(false), false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "multiple implementations of Lint apply to lib:lib: Formatter, Checker"
        );
        assert_eq!(unions.field_sets(lint, &target(false), true).unwrap().len(), 2);
    }
}
