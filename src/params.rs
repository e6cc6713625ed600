//! Vehicle configuration parameters.
//!
//! Parameters are stored copy-on-write as `Arc<ConfigParam>`: a change
//! builds a new version, swaps it into the store and publishes it on the
//! change channel. Holders of a `Weak` to an older version see it vanish
//! once nothing else keeps it alive.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// A named parameter with its instance values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigParam {
    pub name: String,
    pub instances: BTreeMap<String, String>,
}

impl ConfigParam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: BTreeMap::new(),
        }
    }

    /// JSON payload announcing this parameter's current instances.
    pub fn encode(&self) -> String {
        let mut body = serde_json::Map::new();
        body.insert(self.name.clone(), serde_json::json!(self.instances));
        serde_json::json!({ "config": body }).to_string()
    }
}

pub struct ParamStore {
    params: RwLock<BTreeMap<String, Arc<ConfigParam>>>,
    changes: broadcast::Sender<Arc<ConfigParam>>,
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            params: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConfigParam>> {
        self.params.read().get(name).cloned()
    }

    pub fn get_value(&self, name: &str, instance: &str) -> Option<String> {
        self.params
            .read()
            .get(name)
            .and_then(|p| p.instances.get(instance).cloned())
    }

    /// Set one instance of a parameter, creating the parameter if needed.
    /// Publishes the new version when the value actually changed.
    pub fn set_value(&self, name: &str, instance: &str, value: &str) -> Arc<ConfigParam> {
        let updated = {
            let mut params = self.params.write();
            let current = params.get(name).cloned();
            if let Some(param) = &current {
                if param.instances.get(instance).map(String::as_str) == Some(value) {
                    return param.clone();
                }
            }
            let mut next = current
                .map(|p| (*p).clone())
                .unwrap_or_else(|| ConfigParam::new(name));
            next.instances.insert(instance.to_string(), value.to_string());
            let next = Arc::new(next);
            params.insert(name.to_string(), next.clone());
            next
        };
        tracing::debug!(param = name, instance, "config parameter changed");
        // No receivers is fine.
        let _ = self.changes.send(updated.clone());
        updated
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ConfigParam>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_value_publishes_new_version() {
        let store = ParamStore::new();
        let mut rx = store.subscribe();
        let v1 = store.set_value("vehicle", "id", "DEMO1");
        let got = rx.try_recv().unwrap();
        assert!(Arc::ptr_eq(&v1, &got));
        assert_eq!(store.get_value("vehicle", "id").as_deref(), Some("DEMO1"));
    }

    #[test]
    fn unchanged_value_is_not_published() {
        let store = ParamStore::new();
        store.set_value("vehicle", "id", "DEMO1");
        let mut rx = store.subscribe();
        store.set_value("vehicle", "id", "DEMO1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replaced_version_is_released() {
        let store = ParamStore::new();
        let weak = Arc::downgrade(&store.set_value("vehicle", "id", "A"));
        assert!(weak.upgrade().is_some());
        store.set_value("vehicle", "id", "B");
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn encode_lists_instances() {
        let mut param = ConfigParam::new("vehicle");
        param.instances.insert("id".into(), "DEMO1".into());
        let v: serde_json::Value = serde_json::from_str(&param.encode()).unwrap();
        assert_eq!(v["config"]["vehicle"]["id"], "DEMO1");
    }
}
