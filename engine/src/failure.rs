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

use knot_rules::{AmbiguousImplementations, FieldSetError, InvalidFieldException};
use knot_store::StoreError;

use crate::graph::NodeError;

/// Why a node did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A dependency was invalidated while the node was running. The graph retries a bounded number
    /// of times before handing this to the requester.
    Invalidated,
    Throw {
        message: String,
        /// Rules the failure propagated through, innermost first.
        engine_traceback: Vec<String>,
    },
}

impl Failure {
    pub fn throw<S: Into<String>>(message: S) -> Failure {
        Failure::Throw {
            message: message.into(),
            engine_traceback: Vec::new(),
        }
    }

    /// Records that the failure passed through `rule`.
    pub fn with_frame(self, rule: &str) -> Failure {
        match self {
            Failure::Invalidated => Failure::Invalidated,
            Failure::Throw {
                message,
                mut engine_traceback,
            } => {
                engine_traceback.push(rule.to_owned());
                Failure::Throw {
                    message,
                    engine_traceback,
                }
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Failure::Invalidated => "exhausted retries due to changed files",
            Failure::Throw { message, .. } => message,
        }
    }

    pub fn engine_traceback(&self) -> &[String] {
        match self {
            Failure::Invalidated => &[],
            Failure::Throw {
                engine_traceback, ..
            } => engine_traceback,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;
        let traceback = self.engine_traceback();
        if !traceback.is_empty() {
            write!(f, "\n\nEngine traceback:")?;
            for rule in traceback {
                write!(f, "\n  in {}", rule)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

impl NodeError for Failure {
    fn invalidated() -> Failure {
        Failure::Invalidated
    }

    fn cyclic(path: Vec<String>) -> Failure {
        Failure::throw(format!(
            "Dependency graph contained a cycle:\n  {}",
            path.join("\n  -> ")
        ))
    }

    fn panicked(message: String) -> Failure {
        Failure::throw(message)
    }

    fn is_invalidated(&self) -> bool {
        *self == Failure::Invalidated
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Failure {
        Failure::throw(err.to_string())
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Failure {
        Failure::throw(err.to_string())
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Failure {
        Failure::throw(format!("{:#}", err))
    }
}

impl From<InvalidFieldException> for Failure {
    fn from(err: InvalidFieldException) -> Failure {
        Failure::throw(err.to_string())
    }
}

impl From<AmbiguousImplementations> for Failure {
    fn from(err: AmbiguousImplementations) -> Failure {
        Failure::throw(err.to_string())
    }
}

impl From<FieldSetError> for Failure {
    fn from(err: FieldSetError) -> Failure {
        Failure::throw(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Failure {
    fn from(err: tokio::task::JoinError) -> Failure {
        Failure::throw(format!("blocking task failed: {}", err))
    }
}
