//! Metric registry with per-client change tracking.
//!
//! Every metric carries a modified bitset. Each WebSocket client owns one
//! bit (its [`Modifier`]); setting a metric marks it modified for every
//! client, and encoding for a client clears that client's bit. This lets any
//! number of clients pull their own incremental updates from one store.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

/// Number of modifier bits available.
pub const MAX_MODIFIERS: usize = 64;

/// A client's change-tracking token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Modifier(u8);

impl Modifier {
    fn mask(self) -> u64 {
        1u64 << self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("all {MAX_MODIFIERS} metric modifiers are in use")]
    ModifiersExhausted,
}

struct Metric {
    value: Value,
    modified: u64,
}

#[derive(Default)]
struct Inner {
    metrics: BTreeMap<String, Metric>,
    allocated: u64,
}

#[derive(Default)]
pub struct MetricRegistry {
    inner: RwLock<Inner>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric value. Returns `true` if the value changed (or the metric
    /// is new), in which case it is marked modified for every client.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        let mut inner = self.inner.write();
        match inner.metrics.get_mut(name) {
            Some(metric) if metric.value == value => false,
            Some(metric) => {
                metric.value = value;
                metric.modified = u64::MAX;
                true
            }
            None => {
                inner.metrics.insert(
                    name.to_string(),
                    Metric {
                        value,
                        modified: u64::MAX,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().metrics.get(name).map(|m| m.value.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current values of all metrics.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .read()
            .metrics
            .iter()
            .map(|(name, m)| (name.clone(), m.value.clone()))
            .collect()
    }

    /// Allocate a modifier bit for a new client.
    pub fn register_modifier(&self) -> Result<Modifier, MetricsError> {
        let mut inner = self.inner.write();
        let free = (!inner.allocated).trailing_zeros() as usize;
        if free >= MAX_MODIFIERS {
            return Err(MetricsError::ModifiersExhausted);
        }
        let modifier = Modifier(free as u8);
        inner.allocated |= modifier.mask();
        for metric in inner.metrics.values_mut() {
            metric.modified &= !modifier.mask();
        }
        Ok(modifier)
    }

    pub fn release_modifier(&self, modifier: Modifier) {
        self.inner.write().allocated &= !modifier.mask();
    }

    /// Serialize metrics for `modifier`: all of them, or only those modified
    /// since its last encode. Clears the modifier's bit on everything
    /// included. Returns `None` when there is nothing to send.
    pub fn encode(&self, modifier: Modifier, all: bool) -> Option<String> {
        let mask = modifier.mask();
        let mut inner = self.inner.write();
        let mut out = Map::new();
        for (name, metric) in inner.metrics.iter_mut() {
            if all || metric.modified & mask != 0 {
                metric.modified &= !mask;
                out.insert(name.clone(), metric.value.clone());
            }
        }
        if out.is_empty() {
            return None;
        }
        Some(serde_json::json!({ "metrics": out }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(payload: &str) -> Map<String, Value> {
        let v: Value = serde_json::from_str(payload).unwrap();
        v["metrics"].as_object().unwrap().clone()
    }

    #[test]
    fn set_reports_changes_only() {
        let reg = MetricRegistry::new();
        assert!(reg.set("v.b.soc", 80));
        assert!(!reg.set("v.b.soc", 80));
        assert!(reg.set("v.b.soc", 81));
        assert_eq!(reg.get("v.b.soc"), Some(Value::from(81)));
    }

    #[test]
    fn incremental_encode_tracks_each_modifier() {
        let reg = MetricRegistry::new();
        reg.set("a", 1);
        reg.set("b", 2);
        let m1 = reg.register_modifier().unwrap();
        let m2 = reg.register_modifier().unwrap();
        assert_ne!(m1, m2);

        // Fresh modifiers start clean.
        assert!(reg.encode(m1, false).is_none());

        reg.set("a", 10);
        let update = decode(&reg.encode(m1, false).unwrap());
        assert_eq!(update.len(), 1);
        assert_eq!(update["a"], Value::from(10));
        assert!(reg.encode(m1, false).is_none());

        // m2 still sees the change.
        assert_eq!(decode(&reg.encode(m2, false).unwrap()).len(), 1);
    }

    #[test]
    fn full_encode_includes_everything_and_clears() {
        let reg = MetricRegistry::new();
        let m = reg.register_modifier().unwrap();
        reg.set("a", 1);
        reg.set("b", "x");
        let all = decode(&reg.encode(m, true).unwrap());
        assert_eq!(all, reg.snapshot());
        assert!(reg.encode(m, false).is_none());
    }

    #[test]
    fn empty_registry_encodes_nothing() {
        let reg = MetricRegistry::new();
        let m = reg.register_modifier().unwrap();
        assert!(reg.encode(m, true).is_none());
    }

    #[test]
    fn modifiers_are_bounded_and_reusable() {
        let reg = MetricRegistry::new();
        let mods: Vec<_> = (0..MAX_MODIFIERS)
            .map(|_| reg.register_modifier().unwrap())
            .collect();
        assert!(matches!(
            reg.register_modifier(),
            Err(MetricsError::ModifiersExhausted)
        ));
        reg.release_modifier(mods[5]);
        assert_eq!(reg.register_modifier().unwrap(), mods[5]);
    }
}
