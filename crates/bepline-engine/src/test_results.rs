//! Test results read from a build event stream.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use bepline_stream::{Event, StreamError, TargetEvent, TestResultEvent};

/// Outcome of one test target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    NoStatus,
    Passed,
    Flaky,
    Timeout,
    Failed,
    Incomplete,
    RemoteFailure,
    FailedToBuild,
    ToolHaltedBeforeTesting,
}

impl TestStatus {
    /// Map a BEP status name. Names this version does not know become
    /// [`TestStatus::NoStatus`].
    pub fn from_bep_name(name: &str) -> Self {
        match name {
            "PASSED" => Self::Passed,
            "FLAKY" => Self::Flaky,
            "TIMEOUT" => Self::Timeout,
            "FAILED" => Self::Failed,
            "INCOMPLETE" => Self::Incomplete,
            "REMOTE_FAILURE" => Self::RemoteFailure,
            "FAILED_TO_BUILD" => Self::FailedToBuild,
            "TOOL_HALTED_BEFORE_TESTING" => Self::ToolHaltedBeforeTesting,
            _ => Self::NoStatus,
        }
    }

    pub fn as_bep_name(self) -> &'static str {
        match self {
            Self::NoStatus => "NO_STATUS",
            Self::Passed => "PASSED",
            Self::Flaky => "FLAKY",
            Self::Timeout => "TIMEOUT",
            Self::Failed => "FAILED",
            Self::Incomplete => "INCOMPLETE",
            Self::RemoteFailure => "REMOTE_FAILURE",
            Self::FailedToBuild => "FAILED_TO_BUILD",
            Self::ToolHaltedBeforeTesting => "TOOL_HALTED_BEFORE_TESTING",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Passed | Self::Flaky)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_bep_name())
    }
}

/// The result of one test target, with its XML result files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub label: String,
    /// Rule name, e.g. `java_test`, when the stream reported one.
    pub target_kind: Option<String>,
    pub status: TestStatus,
    pub output_xml_files: BTreeSet<PathBuf>,
}

/// Strip the `" rule"` suffix BEP puts on rule kinds. Other kinds (files,
/// aliases) have no rule name.
fn rule_kind(kind: &str) -> Option<String> {
    kind.strip_suffix(" rule")
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}

fn record_kind(kinds: &mut HashMap<String, String>, target: &TargetEvent) {
    if let Some(kind) = rule_kind(&target.kind) {
        kinds.insert(target.label.clone(), kind);
    }
}

fn to_result(event: TestResultEvent, kinds: &HashMap<String, String>) -> TestResult {
    let output_xml_files = event
        .outputs
        .iter()
        .filter_map(|file| file.local_path())
        .filter(|path| path.to_string_lossy().ends_with(".xml"))
        .collect();
    TestResult {
        target_kind: kinds.get(&event.label).cloned(),
        status: TestStatus::from_bep_name(&event.status),
        label: event.label,
        output_xml_files,
    }
}

/// Collect every test result in the stream, in stream order.
///
/// A target's kind is taken from whichever configured or completed event for
/// its label came last before the result.
///
/// # Errors
/// Returns the first error the stream yields.
pub fn parse_test_results<I>(events: I) -> Result<Vec<TestResult>, StreamError>
where
    I: IntoIterator<Item = Result<Event, StreamError>>,
{
    let mut kinds: HashMap<String, String> = HashMap::new();
    let mut results = Vec::new();
    for event in events {
        match event? {
            Event::TargetConfigured(target) | Event::TargetCompleted(target) => record_kind(&mut kinds, &target),
            Event::TestResult(result) => results.push(to_result(result, &kinds)),
            _ => {}
        }
    }
    tracing::debug!(results = results.len(), "parsed test results");
    Ok(results)
}
