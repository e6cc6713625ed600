use std::sync::{Arc, Weak};

use crate::metrics::{MetricRegistry, Modifier};
use crate::params::ConfigParam;

/// One unit of work for a push actor.
///
/// Ownership is per case: an `Event` owns its name and a `Message` its text,
/// both released when the job is freed; a `Config` only holds a weak reference to the parameter
/// version it announces, so the parameter's owner stays in charge of its
/// lifetime. A version released before the job is processed is skipped.
#[derive(Debug, Clone, Default)]
pub enum TxJob {
    #[default]
    None,
    Event(String),
    MetricsAll,
    MetricsUpdate,
    Config(Weak<ConfigParam>),
    /// Raw text, sent unchanged.
    Message(String),
}

impl TxJob {
    pub fn config(param: &Arc<ConfigParam>) -> Self {
        TxJob::Config(Arc::downgrade(param))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, TxJob::None)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TxJob::None => "none",
            TxJob::Event(_) => "event",
            TxJob::MetricsAll => "metrics_all",
            TxJob::MetricsUpdate => "metrics_update",
            TxJob::Config(_) => "config",
            TxJob::Message(_) => "message",
        }
    }

    /// Serialize the job's payload for the client owning `modifier`.
    /// Returns `None` when there is nothing to transmit.
    pub fn encode(&self, metrics: &MetricRegistry, modifier: Modifier) -> Option<String> {
        match self {
            TxJob::None => None,
            TxJob::Event(name) => Some(serde_json::json!({ "event": name }).to_string()),
            TxJob::Message(text) if text.is_empty() => None,
            TxJob::Message(text) => Some(text.clone()),
            TxJob::MetricsAll => metrics.encode(modifier, true),
            TxJob::MetricsUpdate => metrics.encode(modifier, false),
            TxJob::Config(param) => match param.upgrade() {
                Some(param) => Some(param.encode()),
                None => {
                    tracing::debug!("config parameter released before transmission, skipping");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_encodes_name() {
        let metrics = MetricRegistry::new();
        let m = metrics.register_modifier().unwrap();
        let payload = TxJob::Event("vehicle.locked".into()).encode(&metrics, m).unwrap();
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["event"], "vehicle.locked");
    }

    #[test]
    fn message_is_sent_verbatim() {
        let metrics = MetricRegistry::new();
        let m = metrics.register_modifier().unwrap();
        let job = TxJob::Message("notify: charge complete".into());
        assert_eq!(job.encode(&metrics, m).as_deref(), Some("notify: charge complete"));
        assert_eq!(job.kind(), "message");
        assert!(TxJob::Message(String::new()).encode(&metrics, m).is_none());
    }

    #[test]
    fn released_config_encodes_nothing() {
        let metrics = MetricRegistry::new();
        let m = metrics.register_modifier().unwrap();
        let param = Arc::new(ConfigParam::new("vehicle"));
        let job = TxJob::config(&param);
        assert!(job.encode(&metrics, m).is_some());
        drop(param);
        assert!(job.encode(&metrics, m).is_none());
    }

    #[test]
    fn none_encodes_nothing() {
        let metrics = MetricRegistry::new();
        let m = metrics.register_modifier().unwrap();
        assert!(TxJob::None.encode(&metrics, m).is_none());
        assert_eq!(TxJob::default().kind(), "none");
    }
}
