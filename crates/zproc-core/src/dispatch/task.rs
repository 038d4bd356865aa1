//! Task types and the task function registry.
//!
//! Worker entrypoints are ordinary named functions looked up by name; a
//! dispatch ships only the name and value arguments, never code.

use crate::error::{Result, ZprocError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A contiguous slice of one dispatch's input, assigned to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub task_id: String,
    pub fn_name: String,
    pub worker_id: usize,
    /// Input position of `items[0]`.
    pub start_index: usize,
    pub items: Vec<Value>,
    /// Extra positional arguments passed to every invocation.
    pub common_args: Vec<Value>,
}

/// Result of one input item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        value: Value,
    },
    Err {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Cancelled,
}

impl Outcome {
    pub(crate) fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Outcome::Ok { value },
            Err(ZprocError::User { message, detail }) => Outcome::Err { message, detail },
            Err(other) => Outcome::Err {
                message: other.to_string(),
                detail: None,
            },
        }
    }

    /// Re-raise on the driver side at the item's output position.
    pub(crate) fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Ok { value } => Ok(value),
            Outcome::Err { message, detail } => Err(ZprocError::User { message, detail }),
            Outcome::Cancelled => Err(ZprocError::Cancelled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub index: usize,
    pub outcome: Outcome,
}

/// What a worker writes back under its done key when its chunk completes or
/// is abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub task_id: String,
    pub worker_id: usize,
    /// One entry per assigned item, in chunk order.
    pub results: Vec<ItemOutcome>,
}

/// Signature of a registered task function: the input item plus the
/// dispatch's common arguments.
pub type TaskFn = Box<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

/// Table of task functions a worker process can execute.
#[derive(Default)]
pub struct TaskRegistry {
    fns: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task function under a name. Replaces any previous
    /// function with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, task_fn: F) -> &mut Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Box::new(task_fn));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Result<&TaskFn> {
        self.fns.get(name).ok_or_else(|| ZprocError::UnknownTask {
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.fns.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("fns", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_roundtrips_user_failure() {
        let outcome = Outcome::from_result(Err(ZprocError::User {
            message: "bad item".to_string(),
            detail: Some("trace".to_string()),
        }));
        match outcome.into_result() {
            Err(ZprocError::User { message, detail }) => {
                assert_eq!(message, "bad item");
                assert_eq!(detail.as_deref(), Some("trace"));
            }
            other => panic!("expected User, got {:?}", other),
        }
    }

    #[test]
    fn test_outcome_cancelled() {
        assert!(matches!(
            Outcome::Cancelled.into_result(),
            Err(ZprocError::Cancelled)
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register("square", |item, _args| {
            let x = item.as_i64().unwrap_or(0);
            Ok(json!(x * x))
        });

        let square = registry.get("square").unwrap();
        assert_eq!(square(&json!(4), &[]).unwrap(), json!(16));
        assert!(matches!(
            registry.get("cube").map(|_| ()),
            Err(ZprocError::UnknownTask { name }) if name == "cube"
        ));
    }

    #[test]
    fn test_chunk_result_serialization() {
        let result = ChunkResult {
            task_id: "42-0".to_string(),
            worker_id: 1,
            results: vec![ItemOutcome {
                index: 3,
                outcome: Outcome::Ok { value: json!(9) },
            }],
        };
        let value = serde_json::to_value(&result).unwrap();
        let back: ChunkResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.results, result.results);
    }
}
