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
    any::Any,
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Identity of a type that flows through the rule graph.
///
/// Ordered by name so that everything listing types is deterministic across runs.
#[derive(Clone, Copy)]
pub struct TypeId {
    id: std::any::TypeId,
    full_name: &'static str,
}

impl TypeId {
    pub fn of<T: 'static>() -> TypeId {
        TypeId {
            id: std::any::TypeId::of::<T>(),
            full_name: std::any::type_name::<T>(),
        }
    }

    /// The type name without module paths, e.g. `Vec<Digest>`.
    pub fn name(&self) -> String {
        let mut out = String::with_capacity(self.full_name.len());
        let mut path = String::new();
        for c in self.full_name.chars() {
            if c.is_alphanumeric() || c == '_' || c == ':' {
                path.push(c);
            } else {
                out.push_str(path.rsplit("::").next().unwrap_or(""));
                path.clear();
                out.push(c);
            }
        }
        out.push_str(path.rsplit("::").next().unwrap_or(""));
        out
    }

    pub fn full_name(&self) -> &'static str {
        self.full_name
    }
}

impl PartialEq for TypeId {
    fn eq(&self, other: &TypeId) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeId {}

impl Hash for TypeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for TypeId {
    fn partial_cmp(&self, other: &TypeId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeId {
    fn cmp(&self, other: &TypeId) -> Ordering {
        self.full_name
            .cmp(other.full_name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub type ParamTypes = BTreeSet<TypeId>;

pub fn display_types<'a, I: IntoIterator<Item = &'a TypeId>>(types: I) -> String {
    types
        .into_iter()
        .map(TypeId::name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Anything that can be a rule input, output or param.
pub trait Product: Clone + fmt::Debug + Hash + Eq + Send + Sync + 'static {}

impl<T> Product for T where T: Clone + fmt::Debug + Hash + Eq + Send + Sync + 'static {}

trait DynProduct: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynProduct) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn dyn_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T: Product> DynProduct for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynProduct) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| other == self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state)
    }

    fn dyn_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A type-erased product, cheap to clone.
#[derive(Clone)]
pub struct Value {
    type_id: TypeId,
    inner: Arc<dyn DynProduct>,
}

impl Value {
    pub fn new<T: Product>(value: T) -> Value {
        Value {
            type_id: TypeId::of::<T>(),
            inner: Arc::new(value),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        (*self.inner).as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: Product>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.type_id == other.type_id
            && (Arc::ptr_eq(&self.inner, &other.inner) || (*self.inner).dyn_eq(&*other.inner))
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        (*self.inner).dyn_hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (*self.inner).dyn_fmt(f)
    }
}

/// At most one value per type, kept sorted by type.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new<I: IntoIterator<Item = Value>>(values: I) -> Params {
        let mut params = Params::default();
        for value in values {
            params.put(value);
        }
        params
    }

    /// Adds `value`, replacing any value of the same type.
    pub fn put(&mut self, value: Value) {
        match self
            .0
            .binary_search_by(|v| v.type_id().cmp(&value.type_id()))
        {
            Ok(idx) => self.0[idx] = value,
            Err(idx) => self.0.insert(idx, value),
        }
    }

    pub fn with(mut self, value: Value) -> Params {
        self.put(value);
        self
    }

    pub fn find_value(&self, type_id: TypeId) -> Option<&Value> {
        self.0
            .binary_search_by(|v| v.type_id().cmp(&type_id))
            .ok()
            .map(|idx| &self.0[idx])
    }

    pub fn find<T: 'static>(&self) -> Option<&T> {
        self.find_value(TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.find_value(type_id).is_some()
    }

    pub fn type_ids(&self) -> ParamTypes {
        self.0.iter().map(Value::type_id).collect()
    }

    /// Only the values whose types are in `types`.
    pub fn restrict(&self, types: &ParamTypes) -> Params {
        Params(
            self.0
                .iter()
                .filter(|v| types.contains(&Value::type_id(v)))
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Params(")?;
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", value)?;
        }
        write!(f, ")")
    }
}
