//! Process-local counter registry backing `GET /metrics`.
//!
//! Counters are keyed by `name` or `name{label="value",…}` and rendered as a
//! flat JSON object, which is all the surface the control plane exposes.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub const WORKSPACE_GC_TOTAL: &str = "workspace_gc_total";
pub const EVIDENCE_GC_TOTAL: &str = "evidence_gc_total";
pub const RUNS_TOTAL: &str = "runs_total";
pub const WORKSPACES_OPENED_TOTAL: &str = "workspaces_opened_total";
pub const WORKSPACES_REAPED_TOTAL: &str = "workspaces_reaped_total";
pub const EVIDENCE_BUNDLES_TOTAL: &str = "evidence_bundles_total";

#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.incr_labeled(name, &[]);
    }

    pub fn incr_labeled(&self, name: &str, labels: &[(&str, &str)]) {
        let key = Self::key(name, labels);
        *self.counters.write().entry(key).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.read().clone()
    }

    fn key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect();
        format!("{name}{{{}}}", rendered.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counters_are_distinct() {
        let metrics = Metrics::new();
        metrics.incr(WORKSPACE_GC_TOTAL);
        metrics.incr_labeled(RUNS_TOTAL, &[("status", "succeeded")]);
        metrics.incr_labeled(RUNS_TOTAL, &[("status", "succeeded")]);
        metrics.incr_labeled(RUNS_TOTAL, &[("status", "failed")]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get(WORKSPACE_GC_TOTAL), Some(&1));
        assert_eq!(snapshot.get("runs_total{status=\"succeeded\"}"), Some(&2));
        assert_eq!(snapshot.get("runs_total{status=\"failed\"}"), Some(&1));
    }
}
