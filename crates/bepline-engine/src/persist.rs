//! Serializable records for the cross-build stores and their JSON files.
//!
//! Records are order-independent: targets are listed once, sorted, artifacts
//! are sorted by relative path, and target sets refer to both by index.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use bepline_util::fs::write_atomic;

use crate::artifact::{ArtifactRecord, OutputArtifact};
use crate::error::EngineError;
use crate::fetch::RemoteFetcher;
use crate::remote::RemoteOutputArtifacts;
use crate::tracker::{TargetSet, TrackedOutputArtifacts};

/// One target set and the artifacts it owns, as indices into the record's
/// target and artifact lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSetEntry {
    pub target_indices: Vec<usize>,
    pub artifact_indices: Vec<usize>,
}

/// Serialized form of [`TrackedOutputArtifacts`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOutputsRecord {
    #[serde(default)]
    pub top_level_targets: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub target_sets_to_artifact_sets: Vec<TargetSetEntry>,
}

/// Serialized form of [`RemoteOutputArtifacts`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOutputsRecord {
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

/// The state file: both stores side by side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default)]
    pub tracked: TrackedOutputsRecord,
    #[serde(default)]
    pub remote: RemoteOutputsRecord,
}

impl TrackedOutputArtifacts {
    pub fn to_record(&self) -> TrackedOutputsRecord {
        let grouped = self.target_sets_to_artifacts();

        let mut targets: Vec<String> = grouped.keys().flatten().cloned().collect();
        targets.sort();
        targets.dedup();
        let target_index: BTreeMap<&str, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();

        // Already ordered by relative path.
        let artifacts: Vec<&OutputArtifact> = self.artifacts().collect();
        let artifact_index: BTreeMap<&str, usize> = artifacts
            .iter()
            .enumerate()
            .map(|(i, a)| (a.relative_path(), i))
            .collect();

        let entries = grouped
            .iter()
            .map(|(target_set, owned)| {
                let mut target_indices: Vec<usize> = target_set
                    .iter()
                    .filter_map(|t| target_index.get(t.as_str()).copied())
                    .collect();
                target_indices.sort_unstable();
                let mut artifact_indices: Vec<usize> = owned
                    .iter()
                    .filter_map(|a| artifact_index.get(a.relative_path()).copied())
                    .collect();
                artifact_indices.sort_unstable();
                TargetSetEntry {
                    target_indices,
                    artifact_indices,
                }
            })
            .collect();

        TrackedOutputsRecord {
            top_level_targets: targets,
            output_artifacts: artifacts.iter().map(|a| a.to_record()).collect(),
            target_sets_to_artifact_sets: entries,
        }
    }

    /// Rebuild a tracker from its record, binding remote artifacts to `fetcher`.
    ///
    /// # Errors
    /// Returns an error if an entry refers to a target or artifact index the
    /// record does not contain.
    pub fn from_record(record: TrackedOutputsRecord, fetcher: &Arc<dyn RemoteFetcher>) -> Result<Self, EngineError> {
        let artifacts: Vec<OutputArtifact> = record
            .output_artifacts
            .into_iter()
            .map(|r| OutputArtifact::from_record(r, fetcher))
            .collect();

        let mut grouped: Vec<(TargetSet, Vec<OutputArtifact>)> = Vec::new();
        for entry in &record.target_sets_to_artifact_sets {
            let targets = entry
                .target_indices
                .iter()
                .map(|&i| {
                    record.top_level_targets.get(i).cloned().ok_or_else(|| EngineError::Record {
                        message: format!("target index {i} out of range"),
                    })
                })
                .collect::<Result<TargetSet, _>>()?;
            let owned = entry
                .artifact_indices
                .iter()
                .map(|&i| {
                    artifacts.get(i).cloned().ok_or_else(|| EngineError::Record {
                        message: format!("artifact index {i} out of range"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            grouped.push((targets, owned));
        }
        Ok(Self::from_target_sets(
            grouped.iter().map(|(t, a)| (t, a.as_slice())),
        ))
    }
}

impl RemoteOutputArtifacts {
    pub fn to_record(&self) -> RemoteOutputsRecord {
        RemoteOutputsRecord {
            artifacts: self
                .artifacts()
                .map(|a| OutputArtifact::Remote(a.clone()).to_record())
                .collect(),
        }
    }

    /// Rebuild the store from its record. Local entries are skipped.
    pub fn from_record(record: RemoteOutputsRecord, fetcher: &Arc<dyn RemoteFetcher>) -> Self {
        let artifacts: Vec<OutputArtifact> = record
            .artifacts
            .into_iter()
            .map(|r| OutputArtifact::from_record(r, fetcher))
            .collect();
        Self::default().append_new_outputs(&artifacts)
    }
}

/// Write `value` as pretty JSON, atomically.
///
/// # Errors
/// Returns an error if encoding fails or the file cannot be written.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| EngineError::State {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Read a JSON record; a missing file yields `T::default()`.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or decoded.
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, EngineError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(EngineError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| EngineError::State {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::artifact::tests::{local, remote};
    use crate::fetch::UnavailableFetcher;

    fn fetcher() -> Arc<dyn RemoteFetcher> {
        Arc::new(UnavailableFetcher)
    }

    fn targets(labels: &[&str]) -> TargetSet {
        labels.iter().map(|l| (*l).to_owned()).collect()
    }

    fn sample() -> TrackedOutputArtifacts {
        let mut outputs = BTreeMap::new();
        outputs.insert(targets(&["//b", "//a"]), vec![local("k8/bin/z"), local("k8/bin/a")]);
        outputs.insert(targets(&["//c"]), vec![remote("k8/bin/c.jar", "hc", 7)]);
        TrackedOutputArtifacts::default().append_new_outputs(&outputs)
    }

    #[test]
    fn record_is_sorted_and_indexed() {
        let record = sample().to_record();
        assert_eq!(record.top_level_targets, ["//a", "//b", "//c"]);
        let paths: Vec<&str> = record.output_artifacts.iter().map(ArtifactRecord::relative_path).collect();
        assert_eq!(paths, ["k8/bin/a", "k8/bin/c.jar", "k8/bin/z"]);
        assert_eq!(
            record.target_sets_to_artifact_sets,
            vec![
                TargetSetEntry {
                    target_indices: vec![0, 1],
                    artifact_indices: vec![0, 2],
                },
                TargetSetEntry {
                    target_indices: vec![2],
                    artifact_indices: vec![1],
                },
            ]
        );
    }

    #[test]
    fn tracker_survives_record() {
        let tracker = sample();
        let restored = TrackedOutputArtifacts::from_record(tracker.to_record(), &fetcher()).unwrap();
        assert_eq!(restored, tracker);
        assert!(restored.has_remote_outputs());
    }

    #[test]
    fn bad_index_is_rejected() {
        let mut record = sample().to_record();
        record.target_sets_to_artifact_sets.push(TargetSetEntry {
            target_indices: vec![9],
            artifact_indices: vec![0],
        });
        let err = TrackedOutputArtifacts::from_record(record, &fetcher()).unwrap_err();
        assert!(err.to_string().contains("target index 9"), "error was: {err}");
    }

    #[test]
    fn remote_store_survives_record() {
        let store = RemoteOutputArtifacts::default()
            .append_new_outputs(&[remote("k8/bin/a.jar", "h1", 3), remote("k8/bin/b.jar", "h2", 4)]);
        let restored = RemoteOutputArtifacts::from_record(store.to_record(), &fetcher());
        assert_eq!(restored, store);
    }

    #[test]
    fn state_file_round_trip_and_missing_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".bepline").join("tracked.json");

        let empty: StateRecord = load_json(&path).unwrap();
        assert_eq!(empty, StateRecord::default());

        let state = StateRecord {
            tracked: sample().to_record(),
            remote: RemoteOutputsRecord::default(),
        };
        save_json(&path, &state).unwrap();
        let loaded: StateRecord = load_json(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracked.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = load_json::<StateRecord>(&path).unwrap_err();
        assert!(err.to_string().contains("invalid tracked state"), "error was: {err}");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn record_is_independent_of_insertion_order(
                paths in proptest::collection::btree_set("k8/bin/[a-z]{1,4}", 1..8),
            ) {
                let forward: Vec<OutputArtifact> = paths.iter().map(|p| local(p)).collect();
                let backward: Vec<OutputArtifact> = forward.iter().rev().cloned().collect();
                let build = |artifacts: Vec<OutputArtifact>| {
                    let mut outputs = BTreeMap::new();
                    outputs.insert(targets(&["//t"]), artifacts);
                    TrackedOutputArtifacts::default().append_new_outputs(&outputs).to_record()
                };
                prop_assert_eq!(build(forward), build(backward));
            }
        }
    }
}
