//! Queries over a parsed stream's file-set graph.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::artifact::{ArtifactParser, OutputArtifact};
use crate::bep::{FileSetEntry, ParsedBepOutput};

/// An artifact with every output group and top-level target that reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BepArtifactData {
    pub artifact: OutputArtifact,
    pub output_groups: BTreeSet<String>,
    pub top_level_targets: BTreeSet<String>,
}

impl BepArtifactData {
    /// Merge metadata from another occurrence of the same artifact.
    fn update(&mut self, other: BepArtifactData) {
        self.output_groups.extend(other.output_groups);
        self.top_level_targets.extend(other.top_level_targets);
    }
}

/// Materializes artifacts from a [`ParsedBepOutput`] using an [`ArtifactParser`].
///
/// Every query returns each artifact key at most once, in stream order.
pub struct ArtifactResolver<'a> {
    output: &'a ParsedBepOutput,
    parser: &'a dyn ArtifactParser,
}

impl<'a> ArtifactResolver<'a> {
    pub fn new(output: &'a ParsedBepOutput, parser: &'a dyn ArtifactParser) -> Self {
        Self { output, parser }
    }

    fn parse_entry(&self, entry: &FileSetEntry, filter: &dyn Fn(&str) -> bool) -> Vec<OutputArtifact> {
        entry
            .set
            .files
            .iter()
            .filter_map(|file| {
                self.parser.parse_artifact(
                    file,
                    &entry.configuration_mnemonic,
                    filter,
                    self.output.sync_start_time_millis(),
                )
            })
            .collect()
    }

    fn collect<'e>(
        &self,
        entries: impl IntoIterator<Item = &'e FileSetEntry>,
        filter: &dyn Fn(&str) -> bool,
    ) -> Vec<OutputArtifact> {
        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for entry in entries {
            for artifact in self.parse_entry(entry, filter) {
                if seen.insert(artifact.key()) {
                    artifacts.push(artifact);
                }
            }
        }
        artifacts
    }

    /// Artifacts of every file set in the stream.
    pub fn all_artifacts(&self, filter: &dyn Fn(&str) -> bool) -> Vec<OutputArtifact> {
        self.collect(self.output.entries(), filter)
    }

    /// Artifacts in the file sets `label` produced directly. Child sets, which
    /// hold the outputs of dependencies, are not followed.
    pub fn artifacts_for_target(&self, label: &str, filter: &dyn Fn(&str) -> bool) -> Vec<OutputArtifact> {
        let entries = self
            .output
            .target_sets(label)
            .iter()
            .filter_map(|id| self.output.entry(id));
        self.collect(entries, filter)
    }

    /// Artifacts in the transitive closure of the file sets `group` names.
    pub fn artifacts_for_output_group(&self, group: &str, filter: &dyn Fn(&str) -> bool) -> Vec<OutputArtifact> {
        self.artifacts_for_output_groups(&[group], filter)
    }

    /// Artifacts in the transitive closure of the file sets any of `groups`
    /// names.
    ///
    /// Breadth-first from the groups' direct sets; a set is marked visited
    /// when it is queued, so a child shared by several parents is read once.
    pub fn artifacts_for_output_groups(&self, groups: &[&str], filter: &dyn Fn(&str) -> bool) -> Vec<OutputArtifact> {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        for group in groups {
            for id in self.output.output_group_sets(group) {
                if visited.insert(id) {
                    queue.push_back(id);
                }
            }
        }

        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            let Some(entry) = self.output.entry(id) else {
                continue;
            };
            order.push(entry);
            for child in &entry.set.children {
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        self.collect(order, filter)
    }

    /// Every artifact keyed by [`OutputArtifact::key`], with the output
    /// groups and targets of all the sets it appears in.
    pub fn full_artifact_data(&self) -> BTreeMap<String, BepArtifactData> {
        let mut data: BTreeMap<String, BepArtifactData> = BTreeMap::new();
        for entry in self.output.entries() {
            for artifact in self.parse_entry(entry, &|_: &str| true) {
                let item = BepArtifactData {
                    artifact,
                    output_groups: entry.output_groups.clone(),
                    top_level_targets: entry.targets.clone(),
                };
                match data.get_mut(&item.artifact.key()) {
                    Some(existing) => existing.update(item),
                    None => {
                        data.insert(item.artifact.key(), item);
                    }
                }
            }
        }
        data
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use bepline_stream::{EventRecord, FileDescriptor};

    use super::*;
    use crate::artifact::DefaultArtifactParser;
    use crate::bep::tests::{diamond, parse_records};
    use crate::fetch::UnavailableFetcher;
    use crate::path::OutputPaths;

    fn parser() -> DefaultArtifactParser {
        DefaultArtifactParser::new(
            OutputPaths::default(),
            vec!["bytestream".to_owned()],
            Arc::new(UnavailableFetcher),
        )
    }

    fn keys(artifacts: &[OutputArtifact]) -> Vec<String> {
        artifacts.iter().map(OutputArtifact::key).collect()
    }

    fn everything(_: &str) -> bool {
        true
    }

    #[test]
    fn scenario_all_artifacts() {
        let output = parse_records(vec![
            EventRecord::started(1000),
            EventRecord::configuration("cfg1", "k8-opt"),
            EventRecord::named_set("s1", vec![FileDescriptor::named("out/bin/app")], &[]),
            EventRecord::target_completed("//pkg:app", "cfg1", &[("default", &["s1"])]),
        ])
        .unwrap();
        let parser = parser();
        let artifacts = ArtifactResolver::new(&output, &parser).all_artifacts(&everything);
        assert_eq!(artifacts.len(), 1);
        let artifact = artifacts.first().unwrap();
        assert_eq!(artifact.key(), "out/bin/app");
        assert_eq!(artifact.configuration_mnemonic(), "k8-opt");
    }

    #[test]
    fn group_query_follows_diamond_once() {
        let output = parse_records(diamond()).unwrap();
        let parser = parser();
        let artifacts = ArtifactResolver::new(&output, &parser).artifacts_for_output_group("default", &everything);
        assert_eq!(keys(&artifacts), ["out/a", "out/b", "out/c", "out/d1", "out/d2"]);
    }

    #[test]
    fn target_query_is_direct_only() {
        let output = parse_records(diamond()).unwrap();
        let parser = parser();
        let artifacts = ArtifactResolver::new(&output, &parser).artifacts_for_target("//pkg:a", &everything);
        assert_eq!(keys(&artifacts), ["out/a"]);
    }

    #[test]
    fn unknown_group_and_target_are_empty() {
        let output = parse_records(diamond()).unwrap();
        let parser = parser();
        let resolver = ArtifactResolver::new(&output, &parser);
        assert!(resolver.artifacts_for_output_group("nope", &everything).is_empty());
        assert!(resolver.artifacts_for_target("//nope", &everything).is_empty());
    }

    #[test]
    fn several_groups_share_visited_sets() {
        let output = parse_records(vec![
            EventRecord::named_set("shared", vec![FileDescriptor::named("out/shared")], &[]),
            EventRecord::named_set("x", vec![FileDescriptor::named("out/x")], &["shared"]),
            EventRecord::named_set("y", vec![FileDescriptor::named("out/y")], &["shared"]),
            EventRecord::target_completed("//t:t", "c", &[("gx", &["x"]), ("gy", &["y"])]),
        ])
        .unwrap();
        let parser = parser();
        let artifacts = ArtifactResolver::new(&output, &parser).artifacts_for_output_groups(&["gx", "gy"], &everything);
        assert_eq!(keys(&artifacts), ["out/x", "out/y", "out/shared"]);
    }

    #[test]
    fn duplicate_files_across_sets_appear_once() {
        let output = parse_records(vec![
            EventRecord::named_set("a", vec![FileDescriptor::named("out/same")], &[]),
            EventRecord::named_set("b", vec![FileDescriptor::named("out/same")], &[]),
        ])
        .unwrap();
        let parser = parser();
        let artifacts = ArtifactResolver::new(&output, &parser).all_artifacts(&everything);
        assert_eq!(keys(&artifacts), ["out/same"]);
    }

    #[test]
    fn full_data_unions_groups_and_targets() {
        let output = parse_records(vec![
            EventRecord::configuration("c", "k8"),
            EventRecord::named_set("a", vec![FileDescriptor::named("out/lib.jar")], &[]),
            EventRecord::named_set("b", vec![FileDescriptor::named("out/lib.jar")], &[]),
            EventRecord::target_completed("//a:a", "c", &[("default", &["a"])]),
            EventRecord::target_completed("//b:b", "c", &[("sources", &["b"])]),
        ])
        .unwrap();
        let parser = parser();
        let data = ArtifactResolver::new(&output, &parser).full_artifact_data();
        assert_eq!(data.len(), 1);
        let entry = data.get("out/lib.jar").unwrap();
        assert_eq!(entry.output_groups.iter().collect::<Vec<_>>(), ["default", "sources"]);
        assert_eq!(entry.top_level_targets.iter().collect::<Vec<_>>(), ["//a:a", "//b:b"]);
    }

    #[test]
    fn full_data_includes_transitive_membership() {
        let output = parse_records(diamond()).unwrap();
        let parser = parser();
        let data = ArtifactResolver::new(&output, &parser).full_artifact_data();
        let d1 = data.get("out/d1").unwrap();
        assert!(d1.output_groups.contains("default"));
        assert!(d1.top_level_targets.contains("//pkg:a"));
        assert_eq!(d1.artifact.configuration_mnemonic(), "k8-opt");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn rejecting_filter_empties_every_query(suffix in "[a-z]{1,8}") {
                let output = parse_records(diamond()).unwrap();
                let parser = parser();
                let resolver = ArtifactResolver::new(&output, &parser);
                let needle = format!(".{suffix}.never");
                let filter = move |p: &str| p.ends_with(&needle);
                prop_assert!(resolver.all_artifacts(&filter).is_empty());
                prop_assert!(resolver.artifacts_for_target("//pkg:a", &filter).is_empty());
                prop_assert!(resolver.artifacts_for_output_group("default", &filter).is_empty());
            }

            #[test]
            fn group_query_is_superset_of_target_query(keep_d in any::<bool>()) {
                let output = parse_records(diamond()).unwrap();
                let parser = parser();
                let resolver = ArtifactResolver::new(&output, &parser);
                let filter = move |p: &str| keep_d || !p.starts_with("out/d");
                let direct = keys(&resolver.artifacts_for_target("//pkg:a", &filter));
                let closure = keys(&resolver.artifacts_for_output_group("default", &filter));
                for key in &direct {
                    prop_assert!(closure.contains(key));
                }
                prop_assert_eq!(closure.len(), if keep_d { 5 } else { 3 });
            }
        }
    }
}
