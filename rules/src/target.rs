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

//! Targets are typed bags of fields. Field sets are the views rules actually consume.

use std::fmt;

use thiserror::Error;

use crate::types::{Params, Product, TypeId, Value};

/// `spec_path:target_name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub spec_path: String,
    pub target_name: String,
}

impl Address {
    pub fn new<P: Into<String>, N: Into<String>>(spec_path: P, target_name: N) -> Address {
        Address {
            spec_path: spec_path.into(),
            target_name: target_name.into(),
        }
    }

    /// Parses `path:name`. A bare `path` names the target named after its last directory.
    pub fn parse(address: &str) -> Address {
        match address.rsplit_once(':') {
            Some((path, name)) => Address::new(path, name),
            None => {
                let name = address.rsplit('/').next().unwrap_or(address);
                Address::new(address, name)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.spec_path, self.target_name)
    }
}

/// A typed attribute of a target.
pub trait Field: Product {
    const ALIAS: &'static str;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("the `{field}` field is required by the {alias} target at {address}")]
pub struct InvalidFieldException {
    pub address: Address,
    pub alias: &'static str,
    pub field: &'static str,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "multiple implementations of {union} apply to {address}: {}",
    .candidates.join(", ")
)]
pub struct AmbiguousImplementations {
    pub union: String,
    pub address: Address,
    pub candidates: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Target {
    alias: &'static str,
    address: Address,
    fields: Params,
}

impl Target {
    pub fn new(alias: &'static str, address: Address) -> Target {
        Target {
            alias,
            address,
            fields: Params::default(),
        }
    }

    pub fn with_field<F: Field>(mut self, field: F) -> Target {
        self.fields.put(Value::new(field));
        self
    }

    pub fn alias(&self) -> &'static str {
        self.alias
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn get<F: Field>(&self) -> Option<&F> {
        self.fields.find::<F>()
    }

    pub fn require<F: Field>(&self) -> Result<&F, InvalidFieldException> {
        self.get::<F>().ok_or_else(|| InvalidFieldException {
            address: self.address.clone(),
            alias: self.alias,
            field: F::ALIAS,
        })
    }

    pub fn has_field<F: Field>(&self) -> bool {
        self.has_field_type(TypeId::of::<F>())
    }

    pub fn has_field_type(&self, field: TypeId) -> bool {
        self.fields.contains(field)
    }

    pub fn has_fields(&self, fields: &[TypeId]) -> bool {
        fields.iter().all(|f| self.has_field_type(*f))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.alias, self.address)
    }
}

/// The targets of a request, in the order they were given.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Targets(pub Vec<Target>);

/// A read-only view of the fields of a target that some rule consumes.
pub trait FieldSet: Product + Sized {
    fn required_fields() -> Vec<TypeId>;

    fn create(target: &Target) -> Result<Self, InvalidFieldException>;

    /// Lets a field set refuse a target that has every required field.
    fn opt_out(_target: &Target) -> bool {
        false
    }

    fn is_applicable(target: &Target) -> bool {
        target.has_fields(&Self::required_fields()) && !Self::opt_out(target)
    }
}
