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

//! Declaring rules: an async function from a tuple of inputs to one product, plus the gets it
//! may issue.

use std::{fmt, future::Future, sync::Arc};

use futures::future::{self, BoxFuture, FutureExt, TryFutureExt};
use knot_rules::{
    DependencyKey, FieldSet, Product, Query, RuleKind, RuleSignature, TypeId, UnionGet,
    UnionMembership, UnionRule, Value,
};

use crate::{context::Context, failure::Failure};

pub(crate) type RuleFuture = BoxFuture<'static, Result<Value, Failure>>;
pub(crate) type RuleFn = Arc<dyn Fn(Context, Vec<Value>) -> RuleFuture + Send + Sync>;

/// A tuple of products a rule takes as its inputs, or a query takes as its params.
pub trait RuleArgs: Sized + Send + 'static {
    fn type_ids() -> Vec<TypeId>;

    fn from_values(values: Vec<Value>) -> Option<Self>;
}

macro_rules! impl_rule_args {
    ($($name:ident),*) => {
        impl<$($name: Product),*> RuleArgs for ($($name,)*) {
            fn type_ids() -> Vec<TypeId> {
                vec![$(TypeId::of::<$name>()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Option<Self> {
                let mut values = values.into_iter();
                Some(($(values.next()?.downcast::<$name>()?,)*))
            }
        }
    };
}

impl_rule_args!();
impl_rule_args!(A);
impl_rule_args!(A, B);
impl_rule_args!(A, B, C);
impl_rule_args!(A, B, C, D);

/// The product of a goal rule.
pub trait Goal: Product {
    fn exit_code(&self) -> i32;
}

#[derive(Clone)]
pub struct Rule {
    signature: RuleSignature,
    func: RuleFn,
}

impl Rule {
    pub fn new<A, O, F, Fut>(name: &str, func: F) -> Rule
    where
        A: RuleArgs,
        O: Product,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Failure>> + Send + 'static,
    {
        let func: RuleFn = Arc::new(move |context, values| match A::from_values(values) {
            Some(args) => func(context, args).map_ok(Value::new).boxed(),
            None => future::ready(Err(Failure::throw(
                "rule inputs did not have their declared types",
            )))
            .boxed(),
        });
        Rule {
            signature: RuleSignature::new(name, TypeId::of::<O>(), A::type_ids()),
            func,
        }
    }

    /// Declares `Get(O, I)`.
    pub fn get<O: 'static, I: 'static>(mut self) -> Rule {
        let key = DependencyKey::new(TypeId::of::<O>(), TypeId::of::<I>());
        if !self.signature.gets.contains(&key) {
            self.signature.gets.push(key);
        }
        self
    }

    /// Declares `Get(O, U)` for every member of the union `U`.
    pub fn get_union<O: 'static, U: 'static>(mut self) -> Rule {
        let get = UnionGet {
            product: TypeId::of::<O>(),
            union: TypeId::of::<U>(),
        };
        if !self.signature.union_gets.contains(&get) {
            self.signature.union_gets.push(get);
        }
        self
    }

    pub fn uncacheable(mut self) -> Rule {
        self.signature.cacheable = false;
        self
    }

    /// Marks a rule producing a `Goal` as a top level entry point.
    pub fn goal(mut self) -> Rule {
        self.signature.kind = RuleKind::Goal;
        self.uncacheable()
    }

    pub(crate) fn intrinsic(mut self) -> Rule {
        self.signature.kind = RuleKind::Intrinsic;
        self
    }

    pub fn signature(&self) -> &RuleSignature {
        &self.signature
    }

    pub(crate) fn func(&self) -> &RuleFn {
        &self.func
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rule({})", self.signature)
    }
}

/// Everything a scheduler is built from.
#[derive(Debug, Default)]
pub struct Tasks {
    rules: Vec<Rule>,
    queries: Vec<Query>,
    unions: UnionMembership,
}

impl Tasks {
    pub fn new() -> Tasks {
        Tasks::default()
    }

    pub fn rule(&mut self, rule: Rule) -> &mut Tasks {
        self.rules.push(rule);
        self
    }

    /// Declares that `O` may be requested from a session given params of the types in `P`.
    pub fn query<O: 'static, P: RuleArgs>(&mut self) -> &mut Tasks {
        let query = Query::new(TypeId::of::<O>(), P::type_ids());
        if !self.queries.contains(&query) {
            self.queries.push(query);
        }
        self
    }

    pub fn union_rule<U: 'static, M: 'static>(&mut self) -> &mut Tasks {
        self.unions.add(UnionRule::new::<U, M>());
        self
    }

    /// Registers `F` as a member of `U` that targets can be matched against.
    pub fn field_set<U: 'static, F: FieldSet>(&mut self) -> &mut Tasks {
        self.unions.add_field_set::<F>(TypeId::of::<U>());
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub(crate) fn into_parts(self) -> (Vec<Rule>, Vec<Query>, UnionMembership) {
        (self.rules, self.queries, self.unions)
    }
}
