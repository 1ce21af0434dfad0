//! Build event records as they appear on the wire, and the typed events
//! consumers work with.
//!
//! Records follow the BEP JSON mapping: camelCase field names, an `id` object
//! whose single populated member names the event kind, and int64 values that
//! may be encoded either as JSON strings or numbers. Fields this crate does not
//! model are ignored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One build event exactly as framed in the stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(default)]
    pub id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<StartedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_set_of_files: Option<NamedSetPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<TargetPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<TargetPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_parsed: Option<OptionsParsedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<BuildFinishedPayload>,
}

/// The event id. Exactly one member is populated in a well-formed record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<EmptyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_set: Option<NamedSetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_configured: Option<TargetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_completed: Option<TargetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TargetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_parsed: Option<EmptyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_finished: Option<EmptyId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyId {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationId {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedSetId {
    #[serde(default)]
    pub id: String,
}

/// Id shared by target-configured, target-completed and test-result events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetId {
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedPayload {
    #[serde(default, with = "int64")]
    pub start_time_millis: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationPayload {
    #[serde(default)]
    pub mnemonic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedSetPayload {
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default)]
    pub file_sets: Vec<NamedSetId>,
}

/// Payload of both `configured` and `completed` target events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_group: Vec<OutputGroupPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputGroupPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_sets: Vec<NamedSetId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultPayload {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub test_action_output: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsParsedPayload {
    #[serde(default)]
    pub startup_options: Vec<String>,
    #[serde(default)]
    pub explicit_startup_options: Vec<String>,
    #[serde(default)]
    pub cmd_line: Vec<String>,
    #[serde(default)]
    pub explicit_cmd_line: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFinishedPayload {
    #[serde(default)]
    pub overall_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<ExitCodePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodePayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub code: i32,
}

/// A logical output file as declared in the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_prefix: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "int64::opt")]
    pub length: Option<i64>,
}

impl FileDescriptor {
    /// A descriptor with only a name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Attach a URI.
    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_owned());
        self
    }

    /// Attach path-prefix components.
    pub fn with_prefix(mut self, prefix: &[&str]) -> Self {
        self.path_prefix = prefix.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    /// Attach a content digest and size.
    pub fn with_digest(mut self, digest: &str, length: i64) -> Self {
        self.digest = Some(digest.to_owned());
        self.length = Some(length);
        self
    }

    /// The path-prefix components and name joined with `/`.
    ///
    /// `None` when the descriptor has no name.
    pub fn prefixed_path(&self) -> Option<String> {
        if self.name.is_empty() {
            return None;
        }
        let mut parts: Vec<&str> = self
            .path_prefix
            .iter()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .collect();
        parts.push(self.name.trim_start_matches('/'));
        Some(parts.join("/"))
    }

    /// The scheme of the URI, if the descriptor has a parseable one.
    pub fn uri_scheme(&self) -> Option<String> {
        let uri = self.uri.as_deref()?;
        url::Url::parse(uri).ok().map(|u| u.scheme().to_owned())
    }

    /// Resolve the descriptor to a path on the local filesystem.
    ///
    /// A `file:` URI maps to its path. A descriptor without a URI maps to its
    /// prefixed path. Any other URI, or an unparseable one, has no local path.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self.uri.as_deref() {
            Some(uri) => {
                let parsed = url::Url::parse(uri).ok()?;
                if parsed.scheme() != "file" {
                    return None;
                }
                parsed.to_file_path().ok()
            }
            None => self.prefixed_path().map(PathBuf::from),
        }
    }
}

/// A named output group and the file sets it directly references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputGroup {
    pub name: String,
    pub file_sets: Vec<String>,
}

/// A target-configured or target-completed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEvent {
    pub label: String,
    /// Raw kind string, e.g. `"java_library rule"`. Empty when not reported.
    pub kind: String,
    /// Configuration id in effect for the target, if the event names one.
    pub configuration_id: Option<String>,
    pub output_groups: Vec<OutputGroup>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResultEvent {
    pub label: String,
    /// BEP status name, e.g. `"PASSED"`.
    pub status: String,
    pub outputs: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsParsed {
    pub startup_options: Vec<String>,
    pub explicit_startup_options: Vec<String>,
    pub cmd_line: Vec<String>,
    pub explicit_cmd_line: Vec<String>,
    pub tool_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFinished {
    pub overall_success: bool,
    pub exit_code_name: String,
    pub exit_code: i32,
}

/// A build event, reduced to the kinds bepline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started {
        start_time_millis: i64,
    },
    Configuration {
        id: String,
        mnemonic: String,
    },
    NamedSetOfFiles {
        id: String,
        files: Vec<FileDescriptor>,
        children: Vec<String>,
    },
    TargetConfigured(TargetEvent),
    TargetCompleted(TargetEvent),
    TestResult(TestResultEvent),
    OptionsParsed(OptionsParsed),
    BuildFinished(BuildFinished),
    /// Any other kind, or a recognised id whose payload is absent (aborted).
    Other,
}

impl From<EventRecord> for Event {
    fn from(record: EventRecord) -> Self {
        let EventRecord {
            id,
            started,
            configuration,
            named_set_of_files,
            configured,
            completed,
            test_result,
            options_parsed,
            finished,
        } = record;

        if let (Some(_), Some(payload)) = (id.started, started) {
            return Event::Started {
                start_time_millis: payload.start_time_millis,
            };
        }
        if let (Some(config_id), Some(payload)) = (id.configuration, configuration) {
            return Event::Configuration {
                id: config_id.id,
                mnemonic: payload.mnemonic,
            };
        }
        if let (Some(set_id), Some(payload)) = (id.named_set, named_set_of_files) {
            return Event::NamedSetOfFiles {
                id: set_id.id,
                files: payload.files,
                children: payload.file_sets.into_iter().map(|s| s.id).collect(),
            };
        }
        if let (Some(target), Some(payload)) = (id.target_configured, configured) {
            return Event::TargetConfigured(target_event(target, payload));
        }
        if let (Some(target), Some(payload)) = (id.target_completed, completed) {
            return Event::TargetCompleted(target_event(target, payload));
        }
        if let (Some(target), Some(payload)) = (id.test_result, test_result) {
            return Event::TestResult(TestResultEvent {
                label: target.label,
                status: payload.status,
                outputs: payload.test_action_output,
            });
        }
        if let (Some(_), Some(payload)) = (id.options_parsed, options_parsed) {
            return Event::OptionsParsed(OptionsParsed {
                startup_options: payload.startup_options,
                explicit_startup_options: payload.explicit_startup_options,
                cmd_line: payload.cmd_line,
                explicit_cmd_line: payload.explicit_cmd_line,
                tool_tag: payload.tool_tag,
            });
        }
        if let (Some(_), Some(payload)) = (id.build_finished, finished) {
            let exit = payload.exit_code.unwrap_or_default();
            return Event::BuildFinished(BuildFinished {
                overall_success: payload.overall_success,
                exit_code_name: exit.name,
                exit_code: exit.code,
            });
        }
        Event::Other
    }
}

fn target_event(id: TargetId, payload: TargetPayload) -> TargetEvent {
    TargetEvent {
        label: id.label,
        kind: payload.target_kind,
        configuration_id: id.configuration.map(|c| c.id).filter(|c| !c.is_empty()),
        output_groups: payload
            .output_group
            .into_iter()
            .map(|g| OutputGroup {
                name: g.name,
                file_sets: g.file_sets.into_iter().map(|s| s.id).collect(),
            })
            .collect(),
        success: payload.success,
    }
}

fn set_ids(ids: &[&str]) -> Vec<NamedSetId> {
    ids.iter()
        .map(|id| NamedSetId {
            id: (*id).to_owned(),
        })
        .collect()
}

/// Constructors for well-formed records.
impl EventRecord {
    pub fn started(start_time_millis: i64) -> Self {
        Self {
            id: EventId {
                started: Some(EmptyId {}),
                ..EventId::default()
            },
            started: Some(StartedPayload { start_time_millis }),
            ..Self::default()
        }
    }

    pub fn configuration(id: &str, mnemonic: &str) -> Self {
        Self {
            id: EventId {
                configuration: Some(ConfigurationId { id: id.to_owned() }),
                ..EventId::default()
            },
            configuration: Some(ConfigurationPayload {
                mnemonic: mnemonic.to_owned(),
                platform_name: String::new(),
            }),
            ..Self::default()
        }
    }

    pub fn named_set(id: &str, files: Vec<FileDescriptor>, children: &[&str]) -> Self {
        Self {
            id: EventId {
                named_set: Some(NamedSetId { id: id.to_owned() }),
                ..EventId::default()
            },
            named_set_of_files: Some(NamedSetPayload {
                files,
                file_sets: set_ids(children),
            }),
            ..Self::default()
        }
    }

    /// A successful target-completed event; `groups` pairs group names with set ids.
    pub fn target_completed(label: &str, configuration_id: &str, groups: &[(&str, &[&str])]) -> Self {
        Self {
            id: EventId {
                target_completed: Some(TargetId {
                    label: label.to_owned(),
                    configuration: Some(ConfigurationId {
                        id: configuration_id.to_owned(),
                    }),
                }),
                ..EventId::default()
            },
            completed: Some(TargetPayload {
                target_kind: String::new(),
                success: true,
                output_group: groups
                    .iter()
                    .map(|(name, sets)| OutputGroupPayload {
                        name: (*name).to_owned(),
                        file_sets: set_ids(sets),
                    })
                    .collect(),
            }),
            ..Self::default()
        }
    }

    pub fn target_configured(label: &str, target_kind: &str) -> Self {
        Self {
            id: EventId {
                target_configured: Some(TargetId {
                    label: label.to_owned(),
                    configuration: None,
                }),
                ..EventId::default()
            },
            configured: Some(TargetPayload {
                target_kind: target_kind.to_owned(),
                success: false,
                output_group: Vec::new(),
            }),
            ..Self::default()
        }
    }

    /// Set the target kind on a target-completed record.
    pub fn with_target_kind(mut self, target_kind: &str) -> Self {
        if let Some(payload) = self.completed.as_mut() {
            payload.target_kind = target_kind.to_owned();
        }
        self
    }

    pub fn test_result(label: &str, status: &str, outputs: Vec<FileDescriptor>) -> Self {
        Self {
            id: EventId {
                test_result: Some(TargetId {
                    label: label.to_owned(),
                    configuration: None,
                }),
                ..EventId::default()
            },
            test_result: Some(TestResultPayload {
                status: status.to_owned(),
                test_action_output: outputs,
            }),
            ..Self::default()
        }
    }

    pub fn options_parsed(startup: &[&str], explicit_cmd_line: &[&str]) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
        Self {
            id: EventId {
                options_parsed: Some(EmptyId {}),
                ..EventId::default()
            },
            options_parsed: Some(OptionsParsedPayload {
                startup_options: owned(startup),
                explicit_startup_options: owned(startup),
                cmd_line: owned(explicit_cmd_line),
                explicit_cmd_line: owned(explicit_cmd_line),
                tool_tag: String::new(),
            }),
            ..Self::default()
        }
    }

    pub fn build_finished(overall_success: bool, exit_code_name: &str, exit_code: i32) -> Self {
        Self {
            id: EventId {
                build_finished: Some(EmptyId {}),
                ..EventId::default()
            },
            finished: Some(BuildFinishedPayload {
                overall_success,
                exit_code: Some(ExitCodePayload {
                    name: exit_code_name.to_owned(),
                    code: exit_code,
                }),
            }),
            ..Self::default()
        }
    }
}

/// int64 fields arrive as JSON strings in the canonical mapping and as
/// numbers from some producers; both are accepted.
mod int64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(i64),
        Str(String),
    }

    fn parse<E: serde::de::Error>(repr: Repr) -> Result<i64, E> {
        match repr {
            Repr::Num(n) => Ok(n),
            Repr::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid int64 string \"{s}\""))),
        }
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        parse(Repr::deserialize(deserializer)?)
    }

    pub mod opt {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_i64(*v),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<i64>, D::Error> {
            Option::<super::Repr>::deserialize(deserializer)?
                .map(super::parse::<D::Error>)
                .transpose()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn decode(json: &str) -> Event {
        let record: EventRecord = serde_json::from_str(json).unwrap();
        Event::from(record)
    }

    #[test]
    fn started_accepts_string_millis() {
        let event = decode(r#"{"id":{"started":{}},"started":{"uuid":"u","startTimeMillis":"1000"}}"#);
        assert_eq!(
            event,
            Event::Started {
                start_time_millis: 1000
            }
        );
    }

    #[test]
    fn started_accepts_numeric_millis() {
        let event = decode(r#"{"id":{"started":{}},"started":{"startTimeMillis":42}}"#);
        assert_eq!(event, Event::Started { start_time_millis: 42 });
    }

    #[test]
    fn rejects_garbage_int64() {
        let result: Result<EventRecord, _> =
            serde_json::from_str(r#"{"id":{"started":{}},"started":{"startTimeMillis":"soon"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn named_set_keeps_children() {
        let event = decode(
            r#"{"id":{"namedSet":{"id":"0"}},
                "namedSetOfFiles":{"files":[{"name":"app","uri":"file:///out/app","pathPrefix":["bazel-out","k8-fastbuild","bin"]}],
                                   "fileSets":[{"id":"1"},{"id":"2"}]}}"#,
        );
        let Event::NamedSetOfFiles { id, files, children } = event else {
            panic!("expected named set, got {event:?}");
        };
        assert_eq!(id, "0");
        assert_eq!(children, vec!["1", "2"]);
        assert_eq!(files.len(), 1);
        assert_eq!(
            files.first().and_then(FileDescriptor::prefixed_path).as_deref(),
            Some("bazel-out/k8-fastbuild/bin/app")
        );
    }

    #[test]
    fn target_completed_carries_groups_and_configuration() {
        let event = decode(
            r#"{"id":{"targetCompleted":{"label":"//pkg:app","configuration":{"id":"cfg1"}}},
                "completed":{"success":true,"outputGroup":[{"name":"default","fileSets":[{"id":"s1"}]}]}}"#,
        );
        let Event::TargetCompleted(target) = event else {
            panic!("expected target completed, got {event:?}");
        };
        assert_eq!(target.label, "//pkg:app");
        assert_eq!(target.configuration_id.as_deref(), Some("cfg1"));
        assert_eq!(
            target.output_groups,
            vec![OutputGroup {
                name: "default".to_owned(),
                file_sets: vec!["s1".to_owned()],
            }]
        );
        assert!(target.success);
    }

    #[test]
    fn aborted_target_is_other() {
        let event = decode(
            r#"{"id":{"targetCompleted":{"label":"//pkg:app"}},"aborted":{"reason":"SKIPPED"}}"#,
        );
        assert_eq!(event, Event::Other);
    }

    #[test]
    fn unknown_kind_is_other() {
        let event = decode(r#"{"id":{"progress":{"opaqueCount":3}},"progress":{"stdout":"x"}}"#);
        assert_eq!(event, Event::Other);
    }

    #[test]
    fn constructed_records_survive_json() {
        let record = EventRecord::named_set(
            "s1",
            vec![FileDescriptor::named("lib.jar").with_digest("abc", 12)],
            &["s2"],
        );
        let text = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn local_path_from_file_uri() {
        let file = FileDescriptor::named("app").with_uri("file:///work/bazel-out/bin/app");
        assert_eq!(file.local_path(), Some(PathBuf::from("/work/bazel-out/bin/app")));
        assert_eq!(file.uri_scheme().as_deref(), Some("file"));
    }

    #[test]
    fn local_path_decodes_percent_escapes() {
        let file = FileDescriptor::named("a b").with_uri("file:///out/a%20b");
        assert_eq!(file.local_path(), Some(PathBuf::from("/out/a b")));
    }

    #[test]
    fn local_path_without_uri_joins_prefix() {
        let file = FileDescriptor::named("foo/bar.h").with_prefix(&["bazel-out", "k8-opt", "bin"]);
        assert_eq!(
            file.local_path(),
            Some(PathBuf::from("bazel-out/k8-opt/bin/foo/bar.h"))
        );
    }

    #[test]
    fn remote_uri_has_no_local_path() {
        let file = FileDescriptor::named("app").with_uri("bytestream://cache:443/blobs/abc/12");
        assert_eq!(file.local_path(), None);
        assert_eq!(file.uri_scheme().as_deref(), Some("bytestream"));
    }

    #[test]
    fn unparseable_uri_has_no_local_path() {
        let file = FileDescriptor::named("app").with_uri("::not a uri::");
        assert_eq!(file.local_path(), None);
        assert_eq!(file.uri_scheme(), None);
    }

    #[test]
    fn nameless_descriptor_has_no_prefixed_path() {
        assert_eq!(FileDescriptor::default().prefixed_path(), None);
        assert_eq!(FileDescriptor::default().local_path(), None);
    }
}
