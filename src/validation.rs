use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::descriptor::Descriptor;
use crate::module::ModuleRegistry;
use crate::program::Program;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks every step can be turned into a module, without running anything.
pub fn validate_program(program: &Program, registry: &ModuleRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut producers: HashMap<PathBuf, usize> = HashMap::new();

    for (idx, spec) in program.steps.iter().enumerate() {
        let position = format!("Step {} ('{}')", idx + 1, spec.label());

        let descriptor = match Descriptor::from_spec(spec) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                report.errors.push(format!("{position}: {err}"));
                continue;
            }
        };

        if !registry.contains(&descriptor.module) {
            report.errors.push(format!(
                "{position}: unknown module '{}'",
                descriptor.module
            ));
            continue;
        }

        let module = match registry.create(&descriptor) {
            Ok(module) => module,
            Err(err) => {
                report
                    .errors
                    .push(format!("{position}: failed to instantiate module: {err:#}"));
                continue;
            }
        };

        if module.output_files().is_empty() {
            report.warnings.push(format!(
                "{position}: declares no outputs and will run on every invocation"
            ));
        }

        for output in module.output_files() {
            if let Some(previous) = producers.insert(output.clone(), idx) {
                report.warnings.push(format!(
                    "{position}: output {} is also produced by step {}",
                    output.display(),
                    previous + 1
                ));
            }
        }
    }

    report
}
