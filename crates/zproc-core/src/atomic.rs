//! Named atomic handlers.
//!
//! Instead of shipping serialized closures to the server, callers register
//! handlers by name before the server starts and invoke them remotely with
//! plain value arguments. A handler receives a [`StateView`], a mutable
//! window onto a working copy of the state, and whatever it changes commits
//! as a single revision, with no other request interleaving.

use crate::error::{Result, ZprocError};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Mutable window onto the state during an atomic handler call.
///
/// Mutations are applied to a working copy; the server diffs the copy
/// against the pre-state after the handler returns and commits the deltas
/// at one revision.
pub struct StateView<'a> {
    entries: &'a mut HashMap<String, Value>,
}

impl<'a> StateView<'a> {
    pub(crate) fn new(entries: &'a mut HashMap<String, Value>) -> Self {
        Self { entries }
    }

    /// Read a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Write a value, returning the previous one if any.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    /// Remove a key, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current working state.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.clone()
    }
}

/// Signature of a registered atomic handler: positional args, keyword args,
/// and a mutable view of the state. The returned value flows back to the
/// caller; an error is packaged as a typed user failure.
pub type AtomicHandler =
    Box<dyn Fn(&mut StateView<'_>, &[Value], &Map<String, Value>) -> Result<Value> + Send + Sync>;

/// Table of atomic handlers, registered up front and immutable once the
/// server starts.
#[derive(Default)]
pub struct AtomicRegistry {
    handlers: HashMap<String, AtomicHandler>,
}

impl AtomicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name. Replaces any previous handler with
    /// the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut StateView<'_>, &[Value], &Map<String, Value>) -> Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Result<&AtomicHandler> {
        self.handlers
            .get(name)
            .ok_or_else(|| ZprocError::UnknownHandler {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for AtomicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_invoke() {
        let mut registry = AtomicRegistry::new();
        registry.register("incr", |view, args, _kwargs| {
            let key = args[0].as_str().unwrap_or("counter");
            let current = view.get(key).and_then(Value::as_i64).unwrap_or(0);
            view.set(key, json!(current + 1));
            Ok(json!(current + 1))
        });

        let mut entries = HashMap::new();
        entries.insert("counter".to_string(), json!(41));
        let mut view = StateView::new(&mut entries);

        let handler = registry.get("incr").unwrap();
        let out = handler(&mut view, &[json!("counter")], &Map::new()).unwrap();

        assert_eq!(out, json!(42));
        assert_eq!(entries.get("counter"), Some(&json!(42)));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = AtomicRegistry::new();
        assert!(matches!(
            registry.get("nope").map(|_| ()),
            Err(ZprocError::UnknownHandler { name }) if name == "nope"
        ));
    }

    #[test]
    fn test_state_view_ops() {
        let mut entries = HashMap::new();
        let mut view = StateView::new(&mut entries);

        assert!(view.is_empty());
        assert_eq!(view.set("a", json!(1)), None);
        assert_eq!(view.set("a", json!(2)), Some(json!(1)));
        assert!(view.contains("a"));
        assert_eq!(view.len(), 1);
        assert_eq!(view.remove("a"), Some(json!(2)));
        assert!(!view.contains("a"));
    }
}
