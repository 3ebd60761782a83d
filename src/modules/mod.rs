use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::module::{Module, ModuleParameters, ModuleRegistry};

pub fn register_defaults(registry: &mut ModuleRegistry) {
    registry.register("WriteText", |params| {
        Ok(Box::new(WriteTextModule::from_params(params)?))
    });
    registry.register("Copy", |params| {
        Ok(Box::new(CopyModule::from_params(params)?))
    });
    registry.register("Concat", |params| {
        Ok(Box::new(ConcatModule::from_params(params)?))
    });
    registry.register("Touch", |params| {
        Ok(Box::new(TouchModule::from_params(params)?))
    });
}

/// Writes `text` to every output.
///
/// Parameters are normalized before construction, so text that looks like a
/// number or boolean is written in its normalized form: `"007"` writes `7`,
/// `"1.50"` writes `1.5` and `"TRUE"` writes `true`.
struct WriteTextModule {
    text: String,
    outputs: Vec<PathBuf>,
}

impl WriteTextModule {
    fn from_params(mut params: ModuleParameters) -> Result<Self> {
        let text = take_text(&mut params, "text")
            .ok_or_else(|| anyhow!("WriteText module requires 'text' parameter"))?;
        let outputs = take_outputs(&mut params, "WriteText")?;
        reject_unknown(&params, "WriteText")?;
        Ok(Self { text, outputs })
    }
}

impl Module for WriteTextModule {
    fn name(&self) -> &str {
        "WriteText"
    }

    fn ready(&self) -> bool {
        true
    }

    fn output_files(&self) -> &[PathBuf] {
        &self.outputs
    }

    fn run(&self) -> Result<()> {
        for output in &self.outputs {
            write_output(output, self.text.as_bytes())?;
        }
        Ok(())
    }
}

/// Copies `input` to every output. Not ready until `input` exists.
struct CopyModule {
    input: PathBuf,
    outputs: Vec<PathBuf>,
}

impl CopyModule {
    fn from_params(mut params: ModuleParameters) -> Result<Self> {
        let input = take_text(&mut params, "input")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Copy module requires 'input' parameter"))?;
        let outputs = take_outputs(&mut params, "Copy")?;
        reject_unknown(&params, "Copy")?;
        Ok(Self { input, outputs })
    }
}

impl Module for CopyModule {
    fn name(&self) -> &str {
        "Copy"
    }

    fn ready(&self) -> bool {
        self.input.is_file()
    }

    fn output_files(&self) -> &[PathBuf] {
        &self.outputs
    }

    fn run(&self) -> Result<()> {
        let data = fs::read(&self.input)
            .with_context(|| format!("Failed to read input file: {}", self.input.display()))?;
        for output in &self.outputs {
            write_output(output, &data)?;
        }
        Ok(())
    }
}

/// Joins `inputs` in order into every output. Not ready until all inputs exist.
struct ConcatModule {
    inputs: Vec<PathBuf>,
    separator: String,
    outputs: Vec<PathBuf>,
}

impl ConcatModule {
    fn from_params(mut params: ModuleParameters) -> Result<Self> {
        let inputs = take_paths(&mut params, "inputs")?;
        if inputs.is_empty() {
            bail!("Concat module requires a non-empty 'inputs' parameter");
        }
        let separator = take_text(&mut params, "separator").unwrap_or_default();
        let outputs = take_outputs(&mut params, "Concat")?;
        reject_unknown(&params, "Concat")?;
        Ok(Self {
            inputs,
            separator,
            outputs,
        })
    }
}

impl Module for ConcatModule {
    fn name(&self) -> &str {
        "Concat"
    }

    fn ready(&self) -> bool {
        self.inputs.iter().all(|input| input.is_file())
    }

    fn output_files(&self) -> &[PathBuf] {
        &self.outputs
    }

    fn run(&self) -> Result<()> {
        let mut buffer = Vec::new();
        for (idx, input) in self.inputs.iter().enumerate() {
            if idx > 0 {
                buffer.extend_from_slice(self.separator.as_bytes());
            }
            let data = fs::read(input)
                .with_context(|| format!("Failed to read input file: {}", input.display()))?;
            buffer.extend_from_slice(&data);
        }
        for output in &self.outputs {
            write_output(output, &buffer)?;
        }
        Ok(())
    }
}

/// Creates empty outputs.
struct TouchModule {
    outputs: Vec<PathBuf>,
}

impl TouchModule {
    fn from_params(mut params: ModuleParameters) -> Result<Self> {
        let outputs = take_outputs(&mut params, "Touch")?;
        reject_unknown(&params, "Touch")?;
        Ok(Self { outputs })
    }
}

impl Module for TouchModule {
    fn name(&self) -> &str {
        "Touch"
    }

    fn ready(&self) -> bool {
        true
    }

    fn output_files(&self) -> &[PathBuf] {
        &self.outputs
    }

    fn run(&self) -> Result<()> {
        for output in &self.outputs {
            write_output(output, &[])?;
        }
        Ok(())
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    fs::write(path, data)
        .with_context(|| format!("Failed to write output file: {}", path.display()))
}

/// Normalization may have turned `"42"` into a number; modules that want
/// text take it back in its normalized spelling.
fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn take_text(params: &mut ModuleParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(scalar_text)
}

fn take_paths(params: &mut ModuleParameters, key: &str) -> Result<Vec<PathBuf>> {
    match params.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match scalar_text(item.clone()) {
                Some(text) => Ok(PathBuf::from(text)),
                None => Err(anyhow!("'{key}' entries must be paths, found {item}")),
            })
            .collect(),
        Some(other) => match scalar_text(other.clone()) {
            Some(text) => Ok(vec![PathBuf::from(text)]),
            None => bail!("'{key}' must be a path or a list of paths, found {other}"),
        },
    }
}

fn take_outputs(params: &mut ModuleParameters, module: &str) -> Result<Vec<PathBuf>> {
    let outputs = take_paths(params, "outputs")?;
    if outputs.is_empty() {
        bail!("{module} module requires a non-empty 'outputs' parameter");
    }
    Ok(outputs)
}

fn reject_unknown(params: &ModuleParameters, module: &str) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = params.keys().map(String::as_str).collect();
    bail!("{module} module got unexpected parameter(s): {}", names.join(", "))
}
