//! Single-pass construction of the build's file-set graph from its event stream.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use bepline_config::StreamSettings;
use bepline_stream::{Event, EventStreamReader, FileDescriptor, StreamError, TargetEvent};

/// A named set of files and the child sets it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedFileSet {
    pub id: String,
    pub files: Vec<FileDescriptor>,
    pub children: Vec<String>,
}

/// Outcome reported by the stream's `buildFinished` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub overall_success: bool,
    pub exit_code_name: String,
    pub exit_code: i32,
}

/// A file set together with the metadata of the targets that reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileSetEntry {
    pub(crate) set: NamedFileSet,
    pub(crate) configuration_mnemonic: String,
    pub(crate) output_groups: BTreeSet<String>,
    pub(crate) targets: BTreeSet<String>,
}

/// Immutable result of reading one build event stream to its end.
///
/// File sets keep the order in which the stream first mentioned them, so two
/// parses of the same bytes compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBepOutput {
    sync_start_time_millis: i64,
    configurations: BTreeMap<String, String>,
    file_sets: Vec<FileSetEntry>,
    set_index: HashMap<String, usize>,
    output_group_sets: BTreeMap<String, Vec<String>>,
    target_sets: BTreeMap<String, Vec<String>>,
    build_result: Option<BuildResult>,
}

impl ParsedBepOutput {
    /// Consume an event stream and build its graph.
    ///
    /// # Errors
    /// Returns the first stream error, or `StreamError::UnresolvedFileSet` if
    /// a group, target or file set names a set the stream never defines. No
    /// partial output is produced in either case.
    pub fn parse<I>(events: I) -> Result<Self, StreamError>
    where
        I: IntoIterator<Item = Result<Event, StreamError>>,
    {
        let mut builder = GraphBuilder::default();
        for event in events {
            builder.accept(event?);
        }
        builder.finish()
    }

    /// Open and parse a stream file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed.
    pub fn parse_path(path: &Path, settings: &StreamSettings) -> Result<Self, StreamError> {
        Self::parse(EventStreamReader::open(path, settings)?)
    }

    /// Start time of the build, in epoch milliseconds; 0 if not reported.
    pub fn sync_start_time_millis(&self) -> i64 {
        self.sync_start_time_millis
    }

    pub fn build_result(&self) -> Option<&BuildResult> {
        self.build_result.as_ref()
    }

    /// Distinct mnemonics of every configuration the stream declared.
    pub fn configuration_mnemonics(&self) -> BTreeSet<&str> {
        self.configurations.values().map(String::as_str).collect()
    }

    /// All file sets in stream order.
    pub fn file_sets(&self) -> impl Iterator<Item = &NamedFileSet> {
        self.file_sets.iter().map(|e| &e.set)
    }

    pub fn file_set(&self, id: &str) -> Option<&NamedFileSet> {
        self.entry(id).map(|e| &e.set)
    }

    /// Configuration mnemonic associated with a file set; empty when no
    /// target reaches it.
    pub fn file_set_mnemonic(&self, id: &str) -> Option<&str> {
        self.entry(id).map(|e| e.configuration_mnemonic.as_str())
    }

    pub(crate) fn entry(&self, id: &str) -> Option<&FileSetEntry> {
        self.set_index.get(id).and_then(|&i| self.file_sets.get(i))
    }

    pub(crate) fn entries(&self) -> &[FileSetEntry] {
        &self.file_sets
    }

    /// File sets an output group names directly.
    pub fn output_group_sets(&self, group: &str) -> &[String] {
        self.output_group_sets.get(group).map_or(&[], Vec::as_slice)
    }

    /// File sets a target produced directly.
    pub fn target_sets(&self, label: &str) -> &[String] {
        self.target_sets.get(label).map_or(&[], Vec::as_slice)
    }

    pub fn output_groups(&self) -> impl Iterator<Item = &str> {
        self.output_group_sets.keys().map(String::as_str)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.target_sets.keys().map(String::as_str)
    }
}

/// A file set slot, created on first mention and filled when the set's own
/// event arrives.
#[derive(Debug, Default)]
struct PendingSet {
    set: Option<NamedFileSet>,
    configuration_id: Option<String>,
    output_groups: BTreeSet<String>,
    targets: BTreeSet<String>,
    first_referrer: Option<String>,
    top_level: bool,
}

#[derive(Debug, Default)]
struct GraphBuilder {
    sync_start_time_millis: i64,
    configurations: BTreeMap<String, String>,
    sets: Vec<PendingSet>,
    set_index: HashMap<String, usize>,
    ids: Vec<String>,
    output_group_sets: BTreeMap<String, Vec<String>>,
    target_sets: BTreeMap<String, Vec<String>>,
    top_level: Vec<String>,
    build_result: Option<BuildResult>,
    events: u64,
}

impl GraphBuilder {
    fn slot(&mut self, id: &str) -> &mut PendingSet {
        let index = match self.set_index.get(id) {
            Some(&i) => i,
            None => {
                let i = self.sets.len();
                self.sets.push(PendingSet::default());
                self.ids.push(id.to_owned());
                self.set_index.insert(id.to_owned(), i);
                i
            }
        };
        // The index was either found in or just pushed onto `sets`.
        #[allow(clippy::indexing_slicing)]
        &mut self.sets[index]
    }

    fn accept(&mut self, event: Event) {
        self.events = self.events.saturating_add(1);
        match event {
            Event::Started { start_time_millis } => {
                self.sync_start_time_millis = start_time_millis;
            }
            Event::Configuration { id, mnemonic } => {
                self.configurations.insert(id, mnemonic);
            }
            Event::NamedSetOfFiles { id, files, children } => {
                let slot = self.slot(&id);
                if slot.set.is_some() {
                    tracing::debug!(id = %id, "named file set redefined; keeping the latest");
                }
                slot.set = Some(NamedFileSet { id, files, children });
            }
            Event::TargetCompleted(target) | Event::TargetConfigured(target) => {
                self.accept_target(&target);
            }
            Event::BuildFinished(finished) => {
                self.build_result = Some(BuildResult {
                    overall_success: finished.overall_success,
                    exit_code_name: finished.exit_code_name,
                    exit_code: finished.exit_code,
                });
            }
            Event::TestResult(_) | Event::OptionsParsed(_) | Event::Other => {}
        }
    }

    /// Record the target's direct sets. Each list gains an id once; the
    /// slot's own group and target sets say whether it is already listed.
    fn accept_target(&mut self, target: &TargetEvent) {
        for group in &target.output_groups {
            for id in &group.file_sets {
                let slot = self.slot(id);
                if target.configuration_id.is_some() {
                    slot.configuration_id.clone_from(&target.configuration_id);
                }
                let new_in_group = slot.output_groups.insert(group.name.clone());
                let new_for_target = slot.targets.insert(target.label.clone());
                let new_top_level = !std::mem::replace(&mut slot.top_level, true);
                slot.first_referrer
                    .get_or_insert_with(|| format!("target {}", target.label));

                if new_in_group {
                    self.output_group_sets
                        .entry(group.name.clone())
                        .or_default()
                        .push(id.clone());
                }
                if new_for_target {
                    self.target_sets
                        .entry(target.label.clone())
                        .or_default()
                        .push(id.clone());
                }
                if new_top_level {
                    self.top_level.push(id.clone());
                }
            }
        }
    }

    fn validate(&self) -> Result<(), StreamError> {
        for (id, pending) in self.ids.iter().zip(&self.sets) {
            match &pending.set {
                Some(set) => {
                    if let Some(child) = set.children.iter().find(|c| !self.is_defined(c)) {
                        return Err(StreamError::UnresolvedFileSet {
                            id: child.clone(),
                            referenced_by: format!("file set {id}"),
                        });
                    }
                }
                None => {
                    return Err(StreamError::UnresolvedFileSet {
                        id: id.clone(),
                        referenced_by: pending
                            .first_referrer
                            .clone()
                            .unwrap_or_else(|| "an output group".to_owned()),
                    });
                }
            }
        }
        Ok(())
    }

    fn is_defined(&self, id: &str) -> bool {
        self.set_index
            .get(id)
            .and_then(|&i| self.sets.get(i))
            .is_some_and(|p| p.set.is_some())
    }

    /// Only top-level sets carry configuration, group and target data in the
    /// stream. Push it down to the sets they reach, breadth-first; a set that
    /// already has a configuration keeps it.
    fn fill_transitive_data(&mut self) {
        let mut queue: VecDeque<String> = self.top_level.iter().cloned().collect();
        let mut visited: BTreeSet<String> = self.top_level.iter().cloned().collect();

        while let Some(id) = queue.pop_front() {
            let Some(parent) = self.set_index.get(&id).and_then(|&i| self.sets.get(i)) else {
                continue;
            };
            let children = parent.set.as_ref().map(|s| s.children.clone()).unwrap_or_default();
            let configuration_id = parent.configuration_id.clone();
            let output_groups = parent.output_groups.clone();
            let targets = parent.targets.clone();

            for child in children {
                if !visited.insert(child.clone()) {
                    continue;
                }
                let slot = self.slot(&child);
                if slot.configuration_id.is_none() {
                    slot.configuration_id.clone_from(&configuration_id);
                }
                slot.output_groups.extend(output_groups.iter().cloned());
                slot.targets.extend(targets.iter().cloned());
                queue.push_back(child);
            }
        }
    }

    fn finish(mut self) -> Result<ParsedBepOutput, StreamError> {
        self.validate()?;
        self.fill_transitive_data();

        let configurations = self.configurations;
        let mut file_sets = Vec::with_capacity(self.sets.len());
        for pending in self.sets {
            let Some(set) = pending.set else {
                continue;
            };
            let configuration_mnemonic = match pending.configuration_id.as_deref() {
                Some(config) => configurations.get(config).cloned().unwrap_or_else(|| {
                    tracing::debug!(set = %set.id, configuration = config, "file set names an unknown configuration");
                    String::new()
                }),
                None => String::new(),
            };
            file_sets.push(FileSetEntry {
                set,
                configuration_mnemonic,
                output_groups: pending.output_groups,
                targets: pending.targets,
            });
        }
        let set_index = file_sets
            .iter()
            .enumerate()
            .map(|(i, e)| (e.set.id.clone(), i))
            .collect();

        tracing::debug!(
            events = self.events,
            file_sets = file_sets.len(),
            targets = self.target_sets.len(),
            output_groups = self.output_group_sets.len(),
            "built file set graph"
        );
        Ok(ParsedBepOutput {
            sync_start_time_millis: self.sync_start_time_millis,
            configurations,
            file_sets,
            set_index,
            output_group_sets: self.output_group_sets,
            target_sets: self.target_sets,
            build_result: self.build_result,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use bepline_stream::{write_delimited, EventRecord};

    use super::*;

    pub(crate) fn parse_records(records: Vec<EventRecord>) -> Result<ParsedBepOutput, StreamError> {
        ParsedBepOutput::parse(records.into_iter().map(|r| Ok(Event::from(r))))
    }

    fn file(name: &str) -> FileDescriptor {
        FileDescriptor::named(name)
    }

    /// A → {B, C}, B → {D}, C → {D}; the group "default" of //pkg:a names A.
    pub(crate) fn diamond() -> Vec<EventRecord> {
        vec![
            EventRecord::started(1000),
            EventRecord::configuration("cfg1", "k8-opt"),
            EventRecord::named_set("D", vec![file("out/d1"), file("out/d2")], &[]),
            EventRecord::named_set("B", vec![file("out/b")], &["D"]),
            EventRecord::named_set("C", vec![file("out/c")], &["D"]),
            EventRecord::named_set("A", vec![file("out/a")], &["B", "C"]),
            EventRecord::target_completed("//pkg:a", "cfg1", &[("default", &["A"])]),
        ]
    }

    #[test]
    fn scenario_single_target() {
        let output = parse_records(vec![
            EventRecord::started(1000),
            EventRecord::configuration("cfg1", "k8-opt"),
            EventRecord::named_set("s1", vec![file("out/bin/app")], &[]),
            EventRecord::target_completed("//pkg:app", "cfg1", &[("default", &["s1"])]),
        ])
        .unwrap();
        assert_eq!(output.sync_start_time_millis(), 1000);
        assert_eq!(output.output_group_sets("default"), ["s1"]);
        assert_eq!(output.target_sets("//pkg:app"), ["s1"]);
        assert_eq!(output.file_set_mnemonic("s1"), Some("k8-opt"));
        assert_eq!(output.configuration_mnemonics().into_iter().collect::<Vec<_>>(), ["k8-opt"]);
    }

    #[test]
    fn parsing_is_deterministic() {
        let first = parse_records(diamond()).unwrap();
        let second = parse_records(diamond()).unwrap();
        assert_eq!(first, second);
        let ids: Vec<&str> = first.file_sets().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["D", "B", "C", "A"]);
    }

    #[test]
    fn metadata_flows_to_descendants() {
        let output = parse_records(diamond()).unwrap();
        for id in ["A", "B", "C", "D"] {
            assert_eq!(output.file_set_mnemonic(id), Some("k8-opt"), "set {id}");
            let entry = output.entry(id).unwrap();
            assert!(entry.output_groups.contains("default"), "set {id}");
            assert!(entry.targets.contains("//pkg:a"), "set {id}");
        }
        assert_eq!(output.target_sets("//pkg:a"), ["A"]);
    }

    #[test]
    fn descendant_keeps_its_own_configuration() {
        let output = parse_records(vec![
            EventRecord::configuration("host", "k8-opt-exec"),
            EventRecord::configuration("target", "arm64-fastbuild"),
            EventRecord::named_set("tool", vec![file("out/tool")], &[]),
            EventRecord::named_set("app", vec![file("out/app")], &["tool"]),
            EventRecord::target_completed("//tools:tool", "host", &[("default", &["tool"])]),
            EventRecord::target_completed("//pkg:app", "target", &[("default", &["app"])]),
        ])
        .unwrap();
        assert_eq!(output.file_set_mnemonic("tool"), Some("k8-opt-exec"));
        assert_eq!(output.file_set_mnemonic("app"), Some("arm64-fastbuild"));
    }

    #[test]
    fn unreached_set_has_empty_mnemonic() {
        let output = parse_records(vec![
            EventRecord::configuration("cfg1", "k8-opt"),
            EventRecord::named_set("orphan", vec![file("out/x")], &[]),
        ])
        .unwrap();
        assert_eq!(output.file_set_mnemonic("orphan"), Some(""));
    }

    #[test]
    fn configuration_may_follow_target() {
        let output = parse_records(vec![
            EventRecord::named_set("s1", vec![file("out/app")], &[]),
            EventRecord::target_completed("//pkg:app", "cfg1", &[("default", &["s1"])]),
            EventRecord::configuration("cfg1", "k8-dbg"),
        ])
        .unwrap();
        assert_eq!(output.file_set_mnemonic("s1"), Some("k8-dbg"));
    }

    #[test]
    fn missing_group_set_is_an_error() {
        let err = parse_records(vec![
            EventRecord::named_set("s1", vec![file("out/app")], &[]),
            EventRecord::target_completed("//pkg:app", "cfg1", &[("default", &["s1", "s9"])]),
        ])
        .unwrap_err();
        let StreamError::UnresolvedFileSet { id, referenced_by } = err else {
            panic!("expected unresolved file set, got {err:?}");
        };
        assert_eq!(id, "s9");
        assert_eq!(referenced_by, "target //pkg:app");
    }

    #[test]
    fn missing_child_set_is_an_error() {
        let err = parse_records(vec![EventRecord::named_set("A", vec![], &["ghost"])]).unwrap_err();
        assert!(
            matches!(&err, StreamError::UnresolvedFileSet { id, referenced_by } if id == "ghost" && referenced_by == "file set A"),
            "got {err:?}"
        );
    }

    #[test]
    fn stream_error_aborts_parse() {
        let events = vec![
            Ok(Event::Started { start_time_millis: 1 }),
            Err(StreamError::Truncated { offset: 12 }),
        ];
        let err = ParsedBepOutput::parse(events).unwrap_err();
        assert!(matches!(err, StreamError::Truncated { offset: 12 }));
    }

    #[test]
    fn redefined_set_keeps_position() {
        let output = parse_records(vec![
            EventRecord::named_set("s1", vec![file("out/old")], &[]),
            EventRecord::named_set("s2", vec![file("out/two")], &[]),
            EventRecord::named_set("s1", vec![file("out/new")], &[]),
        ])
        .unwrap();
        let ids: Vec<&str> = output.file_sets().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s1", "s2"]);
        assert_eq!(output.file_set("s1").unwrap().files, vec![file("out/new")]);
    }

    #[test]
    fn group_membership_is_deduplicated() {
        let output = parse_records(vec![
            EventRecord::named_set("s1", vec![file("out/a")], &[]),
            EventRecord::target_completed("//a:a", "c", &[("default", &["s1"]), ("extra", &["s1"])]),
            EventRecord::target_completed("//b:b", "c", &[("default", &["s1"])]),
        ])
        .unwrap();
        assert_eq!(output.output_group_sets("default"), ["s1"]);
        assert_eq!(output.output_group_sets("extra"), ["s1"]);
        assert_eq!(output.targets().collect::<Vec<_>>(), ["//a:a", "//b:b"]);
        assert!(output.output_group_sets("missing").is_empty());
    }

    #[test]
    fn many_top_level_sets_parse_in_order() {
        let n: usize = 50_000;
        let mut records = Vec::with_capacity(n.saturating_mul(2));
        for i in 0..n {
            let id = format!("s{i}");
            records.push(EventRecord::named_set(&id, vec![file(&format!("out/{i}"))], &[]));
            records.push(EventRecord::target_completed(
                &format!("//pkg:t{i}"),
                "c",
                &[("default", &[id.as_str()]), ("all", &[id.as_str()])],
            ));
        }
        records.push(EventRecord::target_completed("//pkg:t0", "c", &[("default", &["s0"])]));

        let output = parse_records(records).unwrap();
        let default = output.output_group_sets("default");
        assert_eq!(default.len(), n);
        assert_eq!(default.first().map(String::as_str), Some("s0"));
        assert_eq!(default.last().map(String::as_str), Some("s49999"));
        assert_eq!(output.output_group_sets("all").len(), n);
        assert_eq!(output.target_sets("//pkg:t0"), ["s0"]);
        assert_eq!(output.targets().count(), n);
    }

    #[test]
    fn records_build_result() {
        let output = parse_records(vec![EventRecord::build_finished(false, "BUILD_FAILURE", 1)]).unwrap();
        assert_eq!(
            output.build_result(),
            Some(&BuildResult {
                overall_success: false,
                exit_code_name: "BUILD_FAILURE".to_owned(),
                exit_code: 1,
            })
        );
    }

    #[test]
    fn parse_path_reads_delimited_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.bep");
        let mut bytes = Vec::new();
        for record in diamond() {
            write_delimited(&mut bytes, &record).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();

        let from_file = ParsedBepOutput::parse_path(&path, &StreamSettings::default()).unwrap();
        assert_eq!(from_file, parse_records(diamond()).unwrap());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chain_order_is_preserved(len in 1usize..20) {
                let ids: Vec<String> = (0..len).map(|i| format!("s{i}")).collect();
                let mut records = Vec::new();
                for (i, id) in ids.iter().enumerate() {
                    let child = ids.get(i + 1).map(String::as_str);
                    let children: Vec<&str> = child.into_iter().collect();
                    let descriptor = vec![file(&format!("out/{id}"))];
                    records.push(EventRecord::named_set(id, descriptor, &children));
                }
                let first_id = ids.first().unwrap();
                records.push(EventRecord::configuration("c", "k8"));
                records.push(EventRecord::target_completed("//t:t", "c", &[("g", &[first_id.as_str()])]));

                let output = parse_records(records.clone()).unwrap();
                let seen: Vec<String> = output.file_sets().map(|s| s.id.clone()).collect();
                prop_assert_eq!(&seen, &ids);
                for id in &ids {
                    prop_assert_eq!(output.file_set_mnemonic(id), Some("k8"));
                }
                prop_assert_eq!(output, parse_records(records).unwrap());
            }
        }
    }
}
