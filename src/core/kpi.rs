//! Recovered conditions
//!
//! Counts conditions the engine worked around (e.g. a kernel message
//! interrupting a command echo) so they can be reported as KPIs.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

/// One occurrence of a recovered condition
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredEvent {
    /// Condition name, e.g. `shell fixup: NAME [TEXT]`
    pub condition: String,
    /// Where it happened (wait context prefix)
    pub origin: String,
    /// When
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Default)]
struct Inner {
    counts: BTreeMap<String, u64>,
    events: Vec<RecoveredEvent>,
}

/// Counter of recovered conditions per distinct name
#[derive(Debug, Default)]
pub struct RecoveredConditions {
    inner: Mutex<Inner>,
}

impl RecoveredConditions {
    /// Empty counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence; returns the new count for `condition`
    pub fn record(&self, origin: &str, condition: &str) -> u64 {
        let mut inner = self.inner.lock();
        let count = inner.counts.entry(condition.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        inner.events.push(RecoveredEvent {
            condition: condition.to_string(),
            origin: origin.to_string(),
            timestamp: Local::now(),
        });
        tracing::info!("{}: recovered condition #{} {}", origin, count, condition);
        count
    }

    /// Occurrences of a condition
    pub fn count(&self, condition: &str) -> u64 {
        self.inner.lock().counts.get(condition).copied().unwrap_or(0)
    }

    /// Occurrences of every condition
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.inner.lock().counts.clone()
    }

    /// Every occurrence, in order
    pub fn events(&self) -> Vec<RecoveredEvent> {
        self.inner.lock().events.clone()
    }

    /// Total occurrences
    pub fn total(&self) -> u64 {
        self.inner.lock().counts.values().sum()
    }

    /// KPI report as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "counts": inner.counts,
            "events": inner.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_condition() {
        let kpi = RecoveredConditions::new();
        assert_eq!(kpi.record("tc", "shell fixup: kmsg [WARNING disk slow]"), 1);
        assert_eq!(kpi.record("tc", "shell fixup: kmsg [WARNING disk slow]"), 2);
        assert_eq!(kpi.record("tc", "shell fixup: kmsg [usb 1-1: reset]"), 1);

        assert_eq!(kpi.count("shell fixup: kmsg [WARNING disk slow]"), 2);
        assert_eq!(kpi.count("unknown"), 0);
        assert_eq!(kpi.total(), 3);
        assert_eq!(kpi.events().len(), 3);
        assert_eq!(
            kpi.to_json()["counts"]["shell fixup: kmsg [usb 1-1: reset]"],
            1
        );
    }
}
