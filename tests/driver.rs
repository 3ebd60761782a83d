use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use stepcache::descriptor::StepSpec;
use stepcache::driver::{ExecutionDriver, PlannedAction, StepOutcome};
use stepcache::history::{HISTORY_FILE, HistoryStore};
use stepcache::module::{Module, ModuleParameters, ModuleRegistry};
use tempfile::tempdir;

struct Download {
    url: String,
    outputs: Vec<PathBuf>,
}

impl Module for Download {
    fn name(&self) -> &str {
        "Download"
    }

    fn ready(&self) -> bool {
        true
    }

    fn output_files(&self) -> &[PathBuf] {
        &self.outputs
    }

    fn run(&self) -> Result<()> {
        for output in &self.outputs {
            fs::write(output, self.url.as_bytes())?;
        }
        Ok(())
    }
}

struct Resize {
    input: PathBuf,
    outputs: Vec<PathBuf>,
}

impl Module for Resize {
    fn name(&self) -> &str {
        "Resize"
    }

    fn ready(&self) -> bool {
        self.input.exists()
    }

    fn output_files(&self) -> &[PathBuf] {
        &self.outputs
    }

    fn run(&self) -> Result<()> {
        let mut data = fs::read(&self.input)?;
        data.extend_from_slice(b"-small");
        for output in &self.outputs {
            fs::write(output, &data)?;
        }
        Ok(())
    }
}

fn string_param(params: &ModuleParameters, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing '{key}'"))
}

fn outputs_param(params: &ModuleParameters) -> Vec<PathBuf> {
    params
        .get("outputs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

fn build_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("Download", |params| {
        Ok(Box::new(Download {
            url: string_param(&params, "url")?,
            outputs: outputs_param(&params),
        }))
    });
    registry.register("Resize", |params| {
        Ok(Box::new(Resize {
            input: PathBuf::from(string_param(&params, "input")?),
            outputs: outputs_param(&params),
        }))
    });
    registry
}

struct Workspace {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join("cache")).unwrap();
        Self { _temp: temp, root }
    }

    fn path(&self, relative: &str) -> String {
        self.root.join(relative).to_string_lossy().to_string()
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("cache").join(HISTORY_FILE)
    }

    fn run(&self, registry: &ModuleRegistry, steps: &[StepSpec]) -> Vec<StepOutcome> {
        let history = HistoryStore::load_or_cold(self.history_path()).unwrap();
        let mut driver = ExecutionDriver::new(registry, history);
        driver.run(steps).unwrap().outcomes()
    }

    fn download_resize(&self, url: &str) -> Vec<StepSpec> {
        steps(json!([
            {
                "type": "Download",
                "name": "fetch",
                "url": url,
                "outputs": [self.path("cache/a.bin")],
            },
            {
                "type": "Resize",
                "name": "shrink",
                "input": self.path("cache/a.bin"),
                "outputs": [self.path("cache/a_small.bin")],
            },
        ]))
    }
}

fn steps(value: Value) -> Vec<StepSpec> {
    serde_json::from_value(value).unwrap()
}

fn snapshot_dir(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let data = fs::read(&path).unwrap();
            (path, data)
        })
        .collect();
    entries.sort();
    entries
}

#[test]
fn staleness_propagates_past_an_unchanged_step() {
    let ws = Workspace::new();
    let registry = build_registry();

    assert_eq!(
        ws.run(&registry, &ws.download_resize("http://a")),
        [StepOutcome::Ran, StepOutcome::Ran]
    );
    assert_eq!(
        ws.run(&registry, &ws.download_resize("http://a")),
        [StepOutcome::Hit, StepOutcome::Hit]
    );
    assert_eq!(
        ws.run(&registry, &ws.download_resize("http://b")),
        [StepOutcome::Ran, StepOutcome::Ran]
    );
    assert_eq!(
        fs::read_to_string(ws.root.join("cache/a_small.bin")).unwrap(),
        "http://b-small"
    );
}

#[test]
fn second_run_touches_nothing() {
    let ws = Workspace::new();
    let registry = build_registry();
    let program = ws.download_resize("http://a");
    ws.run(&registry, &program);
    let before = snapshot_dir(&ws.root.join("cache"));

    assert!(ws.run(&registry, &program).iter().all(|o| *o == StepOutcome::Hit));
    assert_eq!(snapshot_dir(&ws.root.join("cache")), before);
}

#[test]
fn blocked_step_forces_later_steps_to_execute() {
    let ws = Workspace::new();
    let registry = build_registry();
    let program = steps(json!([
        { "module": "Resize", "input": ws.path("missing.bin"), "outputs": [ws.path("never.bin")] },
        { "module": "Download", "url": "http://a", "outputs": [ws.path("cache/a.bin")] },
    ]));

    assert_eq!(
        ws.run(&registry, &program),
        [StepOutcome::Blocked, StepOutcome::Ran]
    );
    // The download is cached and unchanged, but the blocked step in front of
    // it still disables reuse.
    assert_eq!(
        ws.run(&registry, &program),
        [StepOutcome::Blocked, StepOutcome::Ran]
    );
    assert!(!ws.root.join("never.bin").exists());
}

#[test]
fn presentation_fields_do_not_affect_reuse() {
    let ws = Workspace::new();
    let registry = build_registry();
    let out = ws.path("cache/a.bin");

    ws.run(
        &registry,
        &steps(json!([{ "module": "Download", "name": "a", "id": 1, "x": 0, "y": 0, "url": "http://a", "outputs": [out] }])),
    );
    assert_eq!(
        ws.run(
            &registry,
            &steps(json!([{ "module": "Download", "name": "renamed", "id": 2, "x": 50, "y": 90, "url": "http://a", "outputs": [out] }])),
        ),
        [StepOutcome::Hit]
    );
    assert_eq!(
        ws.run(
            &registry,
            &steps(json!([{ "module": "Download", "name": "renamed", "url": "http://c", "outputs": [out] }])),
        ),
        [StepOutcome::Ran]
    );
}

#[test]
fn deleted_artifact_is_pruned_and_rebuilt() {
    let ws = Workspace::new();
    let registry = build_registry();
    let program = ws.download_resize("http://a");
    ws.run(&registry, &program);

    let small = ws.root.join("cache/a_small.bin");
    fs::remove_file(&small).unwrap();

    let history = HistoryStore::load(ws.history_path()).unwrap();
    let mut driver = ExecutionDriver::new(&registry, history);
    let report = driver.run(&program[..1]).unwrap();
    assert_eq!(report.outcomes(), [StepOutcome::Hit]);
    assert!(!driver.history().contains(&small));
    assert!(!HistoryStore::load(ws.history_path()).unwrap().contains(&small));

    assert_eq!(
        ws.run(&registry, &program),
        [StepOutcome::Hit, StepOutcome::Ran]
    );
    assert!(small.exists());
}

#[test]
fn malformed_history_means_cold_cache() {
    let ws = Workspace::new();
    let registry = build_registry();
    let program = ws.download_resize("http://a");
    ws.run(&registry, &program);

    fs::write(ws.history_path(), "{ this is not json").unwrap();
    assert_eq!(
        ws.run(&registry, &program),
        [StepOutcome::Ran, StepOutcome::Ran]
    );
    assert_eq!(HistoryStore::load(ws.history_path()).unwrap().len(), 2);
}

#[test]
fn plan_mirrors_staleness_without_side_effects() {
    let ws = Workspace::new();
    let registry = build_registry();
    ws.run(&registry, &ws.download_resize("http://a"));

    let history = HistoryStore::load(ws.history_path()).unwrap();
    let driver = ExecutionDriver::new(&registry, history);

    let unchanged: Vec<_> = driver
        .plan(&ws.download_resize("http://a"))
        .unwrap()
        .into_iter()
        .map(|step| step.action)
        .collect();
    assert_eq!(unchanged, [PlannedAction::Reuse, PlannedAction::Reuse]);

    let changed: Vec<_> = driver
        .plan(&ws.download_resize("http://z"))
        .unwrap()
        .into_iter()
        .map(|step| step.action)
        .collect();
    assert_eq!(changed, [PlannedAction::Execute, PlannedAction::Execute]);
    assert_eq!(
        fs::read_to_string(ws.root.join("cache/a.bin")).unwrap(),
        "http://a"
    );
}
