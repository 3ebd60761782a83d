//! Sequential step execution with history-backed reuse.
//!
//! Steps have no declared dependencies; later steps read what earlier steps
//! wrote into shared paths. A cached result is therefore only trusted while
//! every earlier step in the same run was itself reproduced from history.
//! The first step that runs or is blocked turns caching off for the rest of
//! the run.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cache::{self, CacheDecision};
use crate::descriptor::{Descriptor, StepSpec};
use crate::history::HistoryStore;
use crate::module::{Module, ModuleRegistry};
use crate::observability::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    /// Outputs reused from history.
    Hit,
    /// Module executed.
    Ran,
    /// Module was not ready; nothing produced.
    Blocked,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Hit => "hit",
            StepOutcome::Ran => "ran",
            StepOutcome::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub label: String,
    pub module: String,
    pub fingerprint: String,
    pub outcome: StepOutcome,
    pub outputs: Vec<PathBuf>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn outcomes(&self) -> Vec<StepOutcome> {
        self.steps.iter().map(|step| step.outcome).collect()
    }

    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|step| step.outcome == outcome).count()
    }

    pub fn all_hits(&self) -> bool {
        self.steps.iter().all(|step| step.outcome == StepOutcome::Hit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannedAction {
    Reuse,
    Execute,
    Block,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PlannedAction::Reuse => "reuse",
            PlannedAction::Execute => "execute",
            PlannedAction::Block => "block",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub index: usize,
    pub label: String,
    pub descriptor: Descriptor,
    pub action: PlannedAction,
    pub outputs: Vec<PathBuf>,
}

pub struct ExecutionDriver<'a> {
    registry: &'a ModuleRegistry,
    history: HistoryStore,
    caching_valid: bool,
    metrics: MetricsCollector,
}

impl<'a> ExecutionDriver<'a> {
    pub fn new(registry: &'a ModuleRegistry, history: HistoryStore) -> Self {
        Self {
            registry,
            history,
            caching_valid: true,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn caching_valid(&self) -> bool {
        self.caching_valid
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn into_history(self) -> HistoryStore {
        self.history
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Runs every step in order. The history is pruned and saved after each
    /// step, including a step whose module fails; the failure then aborts the
    /// remaining steps.
    pub fn run(&mut self, steps: &[StepSpec]) -> Result<RunReport> {
        self.metrics.reset();
        let started = Instant::now();
        let mut report = RunReport::default();

        for (index, spec) in steps.iter().enumerate() {
            let step = self.run_step(index, spec);
            let saved = self
                .history
                .prune_and_save()
                .with_context(|| format!("Failed to save history after step {}", index + 1));
            let step = step?;
            saved?;
            report.steps.push(step);
        }

        self.metrics.record_total_duration(started.elapsed());
        Ok(report)
    }

    #[instrument(name = "step", skip(self, spec), fields(label = %spec.label()))]
    fn run_step(&mut self, index: usize, spec: &StepSpec) -> Result<StepReport> {
        let label = spec.label();
        let descriptor = Descriptor::from_spec(spec)
            .with_context(|| format!("Invalid step {} ('{}')", index + 1, label))?;
        let fingerprint = descriptor.fingerprint();
        let timer = self.metrics.start_step(&descriptor.module);

        let module = self
            .registry
            .create(&descriptor)
            .with_context(|| format!("Failed to construct step {} ('{}')", index + 1, label))?;
        info!(module = %descriptor, %fingerprint, "Module");

        let (outcome, outputs) = match self.check_cache(&descriptor, module.as_ref()) {
            Some(outputs) => (StepOutcome::Hit, outputs),
            None => self
                .execute(module.as_ref())
                .with_context(|| format!("Step {} ('{}') failed", index + 1, label))?,
        };

        match outcome {
            StepOutcome::Hit => info!(%outcome, "Using cached data"),
            StepOutcome::Ran => {
                for path in &outputs {
                    self.history.record(path.clone(), descriptor.clone());
                }
                self.invalidate_cache(index);
            }
            StepOutcome::Blocked => {
                warn!(%outcome, "Module not ready");
                self.invalidate_cache(index);
            }
        }
        self.metrics.record_outcome(outcome);

        Ok(StepReport {
            index,
            label,
            module: descriptor.module,
            fingerprint,
            outcome,
            outputs,
            duration: timer.elapsed(),
        })
    }

    fn check_cache(&self, descriptor: &Descriptor, module: &dyn Module) -> Option<Vec<PathBuf>> {
        if !self.caching_valid {
            return None;
        }
        match cache::decide(descriptor, module.output_files(), &self.history) {
            CacheDecision::Hit(outputs) => Some(outputs),
            CacheDecision::Miss { missing } => {
                tracing::debug!(?missing, "Cache miss");
                None
            }
        }
    }

    fn execute(&self, module: &dyn Module) -> Result<(StepOutcome, Vec<PathBuf>)> {
        if !module.ready() {
            return Ok((StepOutcome::Blocked, Vec::new()));
        }
        info!(module = module.name(), "Running");
        module.run()?;
        info!(module = module.name(), outcome = %StepOutcome::Ran, "Done");
        Ok((StepOutcome::Ran, module.output_files().to_vec()))
    }

    fn invalidate_cache(&mut self, index: usize) {
        if self.caching_valid {
            info!(step = index + 1, "Caching disabled for remaining steps");
        }
        self.caching_valid = false;
    }

    /// Predicts each step's action without running anything. Steps after the
    /// first predicted miss are reported as `Execute`: their readiness depends
    /// on outputs that do not exist yet.
    pub fn plan(&self, steps: &[StepSpec]) -> Result<Vec<PlannedStep>> {
        let mut caching_valid = self.caching_valid;
        let mut planned = Vec::with_capacity(steps.len());

        for (index, spec) in steps.iter().enumerate() {
            let label = spec.label();
            let descriptor = Descriptor::from_spec(spec)
                .with_context(|| format!("Invalid step {} ('{}')", index + 1, label))?;
            let module = self
                .registry
                .create(&descriptor)
                .with_context(|| format!("Failed to construct step {} ('{}')", index + 1, label))?;
            let outputs = module.output_files().to_vec();

            let action = if !caching_valid {
                PlannedAction::Execute
            } else if cache::decide(&descriptor, &outputs, &self.history).is_hit() {
                PlannedAction::Reuse
            } else {
                caching_valid = false;
                if module.ready() {
                    PlannedAction::Execute
                } else {
                    PlannedAction::Block
                }
            };

            planned.push(PlannedStep {
                index,
                label,
                descriptor,
                action,
                outputs,
            });
        }

        Ok(planned)
    }
}
