use crate::prelude::StageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Session counters shared by every shard and cell worker.
pub struct MetricsRecorder {
    inner: Mutex<Metrics>,
}

#[derive(Default)]
struct Metrics {
    processed: u64,
    duplicates: u64,
    errors: BTreeMap<String, u64>,
    categories: BTreeMap<String, u64>,
    seals: BTreeMap<String, u64>,
    omissions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub errors: BTreeMap<String, u64>,
    pub categories: BTreeMap<String, u64>,
    pub seals: BTreeMap<String, u64>,
    pub omissions: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.get(kind).copied().unwrap_or(0)
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::default()),
        }
    }

    pub fn record_processed(&self, categories: &[String]) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.processed += 1;
            for label in categories {
                *metrics.categories.entry(label.clone()).or_default() += 1;
            }
        }
    }

    pub fn record_duplicate(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.duplicates += 1;
        }
    }

    pub fn record_error(&self, error: &StageError) {
        self.record_error_kind(error.kind());
    }

    pub fn record_error_kind(&self, kind: &str) {
        if let Ok(mut metrics) = self.inner.lock() {
            *metrics.errors.entry(kind.to_string()).or_default() += 1;
        }
    }

    pub fn record_seal(&self, reason: &str) {
        if let Ok(mut metrics) = self.inner.lock() {
            *metrics.seals.entry(reason.to_string()).or_default() += 1;
        }
    }

    pub fn record_omission(&self, feature: &str, reason: &str) {
        if let Ok(mut metrics) = self.inner.lock() {
            *metrics
                .omissions
                .entry(format!("{}:{}", feature, reason))
                .or_default() += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            MetricsSnapshot {
                processed: metrics.processed,
                duplicates: metrics.duplicates,
                errors: metrics.errors.clone(),
                categories: metrics.categories.clone(),
                seals: metrics.seals.clone(),
                omissions: metrics.omissions.clone(),
            }
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_label() {
        let metrics = MetricsRecorder::new();
        metrics.record_processed(&["df17".into(), "tc19".into()]);
        metrics.record_processed(&["df17".into()]);
        metrics.record_error(&StageError::UnitConversion("x".into()));
        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.categories["df17"], 2);
        assert_eq!(snap.error_count("unit_conversion"), 1);
        assert_eq!(snap.error_count("malformed_message"), 0);
    }
}
