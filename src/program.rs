use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::descriptor::StepSpec;

/// An ordered list of steps loaded from a program file.
#[derive(Debug, Clone)]
pub struct Program {
    pub path: PathBuf,
    pub steps: Vec<StepSpec>,
}

impl Program {
    /// Parses the whole file up front. JSON by default; `.yaml`/`.yml`
    /// files are read as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read program file: {}", path.display()))?;
        let steps = Self::parse(&content, is_yaml(path))
            .with_context(|| format!("Failed to parse program file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            steps,
        })
    }

    pub fn parse(content: &str, yaml: bool) -> Result<Vec<StepSpec>> {
        let steps = if yaml {
            serde_yaml::from_str(content).context("Expected a YAML list of step mappings")?
        } else {
            serde_json::from_str(content).context("Expected a JSON array of step objects")?
        };
        Ok(steps)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}
