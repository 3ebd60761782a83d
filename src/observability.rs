use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::driver::StepOutcome;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub modules: BTreeMap<String, ModuleMetrics>,
    pub total_duration_ms: f64,
    pub hits: u64,
    pub runs: u64,
    pub blocked: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct ModuleMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_step(&self, module: &str) -> StepTimer {
        StepTimer {
            module: module.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_outcome(&self, outcome: StepOutcome) {
        if let Ok(mut guard) = self.inner.lock() {
            match outcome {
                StepOutcome::Hit => guard.hits += 1,
                StepOutcome::Ran => guard.runs += 1,
                StepOutcome::Blocked => guard.blocked += 1,
            }
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StepTimer {
    module: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StepTimer {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.modules.entry(self.module.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            module = self.module.as_str(),
            duration_ms, "Step duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        hits = snapshot.hits,
        runs = snapshot.runs,
        blocked = snapshot.blocked,
        "Run metrics summary"
    );
    for (module, metrics) in &snapshot.modules {
        info!(
            module = module.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Module metrics"
        );
    }
}
