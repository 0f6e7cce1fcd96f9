use crate::error::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Scope-bound key/value store. Values are opaque JSON; reads proceed
/// concurrently, writes take the exclusive lock. The happens-before
/// guarantee between nodes comes from the executor, not from here.
#[derive(Debug, Clone, Default)]
pub struct ScopedCache {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl ScopedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn put_as<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.put(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// The three cache tiers of one pipeline run. Module and task caches are
/// created on first use so planning-time and run-time consumers of the
/// same scope observe the same store; everything is dropped with the run.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    pipeline: ScopedCache,
    modules: DashMap<String, ScopedCache>,
    tasks: DashMap<String, ScopedCache>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(&self) -> ScopedCache {
        self.pipeline.clone()
    }

    pub fn module(&self, module: &str) -> ScopedCache {
        self.modules.entry(module.to_string()).or_default().clone()
    }

    /// Task caches are keyed `module/task`; task names only need to be
    /// unique within their module.
    pub fn task(&self, module: &str, task: &str) -> ScopedCache {
        self.tasks
            .entry(format!("{}/{}", module, task))
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let cache = ScopedCache::new();
        cache.put("token", Value::String("abc.def".to_string()));
        assert_eq!(cache.get("token"), Some(Value::String("abc.def".to_string())));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_typed_accessors() {
        let cache = ScopedCache::new();
        cache.put_as("port", &6443u16).unwrap();
        assert_eq!(cache.get_as::<u16>("port"), Some(6443));
        assert_eq!(cache.get_as::<String>("port"), None);
    }

    #[test]
    fn test_clone_shares_storage() {
        let cache = ScopedCache::new();
        let alias = cache.clone();
        alias.put("k", Value::Bool(true));
        assert!(cache.contains_key("k"));
    }

    #[test]
    fn test_registry_scopes_are_distinct() {
        let registry = CacheRegistry::new();
        registry.module("etcd").put("k", Value::Bool(true));
        assert!(!registry.module("network").contains_key("k"));
        assert!(registry.module("etcd").contains_key("k"));

        registry.task("etcd", "install").put("k", Value::Bool(true));
        assert!(!registry.task("etcd", "pki").contains_key("k"));
    }

    #[test]
    fn test_same_scope_name_shares_cache() {
        let registry = CacheRegistry::new();
        registry.module("control-plane").put("join-token", Value::Null);
        assert!(registry.module("control-plane").contains_key("join-token"));
    }
}
