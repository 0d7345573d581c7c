//! Running scheduler counters.
//!
//! Centralizes counter updates from the dispatch and signal paths; reads are
//! point-in-time snapshots and never block scheduling.

use std::sync::{Arc, Mutex};

use playback_types::MetricsSnapshot;

#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
    enabled: bool,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
            enabled,
        }
    }

    pub fn on_submitted(&self) {
        self.bump(|m| m.submitted += 1);
    }

    pub fn on_completed(&self) {
        self.bump(|m| m.completed += 1);
    }

    pub fn on_failed(&self) {
        self.bump(|m| m.failed += 1);
    }

    pub fn on_interrupted(&self) {
        self.bump(|m| m.interrupted += 1);
    }

    pub fn on_back_to_back_group(&self) {
        self.bump(|m| m.back_to_back_groups += 1);
    }

    /// Current counter values (all zero when collection is disabled).
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|m| *m).unwrap_or_default()
    }

    fn bump(&self, update: impl FnOnce(&mut MetricsSnapshot)) {
        if !self.enabled {
            return;
        }
        if let Ok(mut m) = self.inner.lock() {
            update(&mut m);
        }
    }
}
