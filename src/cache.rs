use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::descriptor::Descriptor;
use crate::history::HistoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    /// Every declared output exists and was produced by an identical descriptor.
    Hit(Vec<PathBuf>),
    Miss { missing: Vec<PathBuf> },
}

impl CacheDecision {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheDecision::Hit(_))
    }
}

/// Artifacts recorded for `descriptor` that are still present on disk.
pub fn done_files<'a>(descriptor: &Descriptor, history: &'a HistoryStore) -> BTreeSet<&'a Path> {
    history
        .iter()
        .filter(|(path, entry)| entry.descriptor == *descriptor && path.exists())
        .map(|(path, _)| path.as_path())
        .collect()
}

/// A module that declares no outputs never hits: there is nothing on disk
/// that could stand in for running it.
pub fn decide(
    descriptor: &Descriptor,
    output_files: &[PathBuf],
    history: &HistoryStore,
) -> CacheDecision {
    if output_files.is_empty() {
        return CacheDecision::Miss {
            missing: Vec::new(),
        };
    }

    let done = done_files(descriptor, history);
    let missing: Vec<PathBuf> = output_files
        .iter()
        .filter(|path| !done.contains(path.as_path()))
        .cloned()
        .collect();

    if missing.is_empty() {
        CacheDecision::Hit(output_files.to_vec())
    } else {
        CacheDecision::Miss { missing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleParameters;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn descriptor(module: &str, width: i64) -> Descriptor {
        let mut params = ModuleParameters::new();
        params.insert("width".into(), json!(width));
        Descriptor::new(module, params)
    }

    #[test]
    fn hit_requires_matching_descriptor_and_existing_file() {
        let temp = tempdir().unwrap();
        let out = temp.path().join("out.bin");
        fs::write(&out, b"x").unwrap();

        let mut history = HistoryStore::empty(temp.path().join(".history"));
        history.record(&out, descriptor("Resize", 64));

        let outputs = vec![out.clone()];
        assert_eq!(
            decide(&descriptor("Resize", 64), &outputs, &history),
            CacheDecision::Hit(outputs.clone())
        );
        assert!(!decide(&descriptor("Resize", 32), &outputs, &history).is_hit());
        assert!(!decide(&descriptor("Crop", 64), &outputs, &history).is_hit());

        fs::remove_file(&out).unwrap();
        assert_eq!(
            decide(&descriptor("Resize", 64), &outputs, &history),
            CacheDecision::Miss {
                missing: outputs.clone()
            }
        );
    }

    #[test]
    fn partial_outputs_are_a_miss() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a.bin");
        let b = temp.path().join("b.bin");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut history = HistoryStore::empty(temp.path().join(".history"));
        history.record(&a, descriptor("Split", 2));
        history.record(&b, descriptor("Split", 3));

        let decision = decide(&descriptor("Split", 2), &[a.clone(), b.clone()], &history);
        assert_eq!(decision, CacheDecision::Miss { missing: vec![b] });
        assert_eq!(
            done_files(&descriptor("Split", 2), &history),
            BTreeSet::from([a.as_path()])
        );
    }

    #[test]
    fn no_declared_outputs_never_hits() {
        let history = HistoryStore::empty("unused");
        assert!(!decide(&descriptor("Notify", 1), &[], &history).is_hit());
    }
}
