//! Output artifacts tracked across builds against the top-level targets that
//! produced them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use crate::artifact::OutputArtifact;
use crate::path::{configuration_mnemonic, OutputPaths};

/// The set of top-level target labels that jointly produced some artifacts.
pub type TargetSet = BTreeSet<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedArtifact {
    targets: TargetSet,
    artifact: OutputArtifact,
}

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by output-root relative path; a path is owned by one target set.
    by_path: BTreeMap<String, TrackedArtifact>,
    mnemonics: OnceLock<BTreeSet<String>>,
}

/// Long-lived, copy-on-write store of build outputs.
///
/// Every mutation returns a new value. Clones are cheap and share the
/// underlying snapshot, so readers holding an older value keep seeing it
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct TrackedOutputArtifacts {
    inner: Arc<Inner>,
}

impl PartialEq for TrackedOutputArtifacts {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.by_path == other.inner.by_path
    }
}

impl Eq for TrackedOutputArtifacts {}

impl TrackedOutputArtifacts {
    fn from_map(by_path: BTreeMap<String, TrackedArtifact>) -> Self {
        Self {
            inner: Arc::new(Inner {
                by_path,
                mnemonics: OnceLock::new(),
            }),
        }
    }

    /// Build a tracker from target sets and the artifacts they own.
    ///
    /// When one path is listed under several target sets, the sets are merged.
    pub fn from_target_sets<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a TargetSet, &'a [OutputArtifact])>,
    {
        let mut by_path: BTreeMap<String, TrackedArtifact> = BTreeMap::new();
        for (targets, artifacts) in entries {
            for artifact in artifacts {
                by_path
                    .entry(artifact.relative_path().to_owned())
                    .and_modify(|t| t.targets.extend(targets.iter().cloned()))
                    .or_insert_with(|| TrackedArtifact {
                        targets: targets.clone(),
                        artifact: artifact.clone(),
                    });
            }
        }
        Self::from_map(by_path)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.by_path.is_empty()
    }

    /// Number of tracked artifacts.
    pub fn len(&self) -> usize {
        self.inner.by_path.len()
    }

    /// Merge the outputs of a newer build.
    ///
    /// Every incoming artifact becomes authoritative for its relative path,
    /// replacing whatever was tracked there. Every other tracked artifact
    /// loses the incoming targets from its target set and is dropped once the
    /// set is empty.
    pub fn append_new_outputs(&self, new_outputs: &BTreeMap<TargetSet, Vec<OutputArtifact>>) -> Self {
        let new_targets: TargetSet = new_outputs.keys().flatten().cloned().collect();
        let incoming = Self::from_target_sets(new_outputs.iter().map(|(t, a)| (t, a.as_slice())));

        let mut by_path = incoming.inner.by_path.clone();
        let mut dropped = 0usize;
        for (path, tracked) in &self.inner.by_path {
            if by_path.contains_key(path) {
                continue;
            }
            let targets: TargetSet = tracked.targets.difference(&new_targets).cloned().collect();
            if targets.is_empty() {
                dropped = dropped.saturating_add(1);
                continue;
            }
            by_path.insert(
                path.clone(),
                TrackedArtifact {
                    targets,
                    artifact: tracked.artifact.clone(),
                },
            );
        }
        tracing::debug!(
            incoming = incoming.len(),
            dropped,
            total = by_path.len(),
            "appended build outputs"
        );
        Self::from_map(by_path)
    }

    /// Keep only the targets in `tracked_targets`; artifacts left with no
    /// owning target are dropped.
    pub fn remove_untracked_outputs(&self, tracked_targets: &TargetSet) -> Self {
        let by_path: BTreeMap<String, TrackedArtifact> = self
            .inner
            .by_path
            .iter()
            .filter_map(|(path, tracked)| {
                let targets: TargetSet = tracked
                    .targets
                    .intersection(tracked_targets)
                    .cloned()
                    .collect();
                (!targets.is_empty()).then(|| {
                    (
                        path.clone(),
                        TrackedArtifact {
                            targets,
                            artifact: tracked.artifact.clone(),
                        },
                    )
                })
            })
            .collect();
        tracing::debug!(
            kept = by_path.len(),
            removed = self.len().saturating_sub(by_path.len()),
            "pruned untracked outputs"
        );
        Self::from_map(by_path)
    }

    /// Look up an artifact by output-root relative path.
    ///
    /// On a miss, one alternate spelling is tried per [`OutputPaths::alternate_paths`].
    pub fn find_output_artifact(&self, paths: &OutputPaths, relative_path: &str) -> Option<&OutputArtifact> {
        paths
            .lookup(&self.inner.by_path, relative_path)
            .map(|t| &t.artifact)
    }

    /// Look up an artifact by execution-root relative path, such as
    /// `bazel-out/k8-opt/bin/app`. Paths outside an output root are never found.
    pub fn find_output_artifact_for_exec_path(&self, paths: &OutputPaths, exec_path: &str) -> Option<&OutputArtifact> {
        let relative_path = paths.strip_exec_root(exec_path)?;
        self.find_output_artifact(paths, relative_path)
    }

    /// Find a generated file by its path below `genfiles`, in any tracked
    /// configuration.
    pub fn resolve_genfiles_path(&self, paths: &OutputPaths, genfiles_relative_path: &str) -> Option<&OutputArtifact> {
        self.configuration_mnemonics().iter().find_map(|mnemonic| {
            self.find_output_artifact(paths, &format!("{mnemonic}/genfiles/{genfiles_relative_path}"))
        })
    }

    /// Configuration mnemonics of all tracked artifacts, computed once per
    /// snapshot.
    pub fn configuration_mnemonics(&self) -> &BTreeSet<String> {
        self.inner.mnemonics.get_or_init(|| {
            self.inner
                .by_path
                .keys()
                .map(|path| configuration_mnemonic(path).to_owned())
                .collect()
        })
    }

    pub fn has_remote_outputs(&self) -> bool {
        self.inner.by_path.values().any(|t| t.artifact.is_remote())
    }

    /// Tracked artifacts grouped by their owning target set.
    pub fn target_sets_to_artifacts(&self) -> BTreeMap<TargetSet, Vec<OutputArtifact>> {
        let mut grouped: BTreeMap<TargetSet, Vec<OutputArtifact>> = BTreeMap::new();
        for tracked in self.inner.by_path.values() {
            grouped
                .entry(tracked.targets.clone())
                .or_default()
                .push(tracked.artifact.clone());
        }
        grouped
    }

    /// All tracked artifacts ordered by relative path.
    pub fn artifacts(&self) -> impl Iterator<Item = &OutputArtifact> {
        self.inner.by_path.values().map(|t| &t.artifact)
    }

    /// The target set owning `relative_path`, if tracked.
    pub fn owning_targets(&self, relative_path: &str) -> Option<&TargetSet> {
        self.inner.by_path.get(relative_path).map(|t| &t.targets)
    }
}
