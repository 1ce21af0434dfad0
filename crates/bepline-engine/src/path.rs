//! Output-root relative path handling and the alternate-format lookup.

use std::collections::BTreeMap;

use bepline_config::PathSettings;

/// Output directory names and legacy segment names, taken from `[paths]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    output_roots: Vec<String>,
    alternate_segments: Vec<String>,
}

impl Default for OutputPaths {
    fn default() -> Self {
        Self::new(&PathSettings::default())
    }
}

impl OutputPaths {
    pub fn new(settings: &PathSettings) -> Self {
        Self {
            output_roots: settings.output_roots.clone(),
            alternate_segments: settings.alternate_segments.clone(),
        }
    }

    fn is_output_root(&self, component: &str) -> bool {
        self.output_roots.iter().any(|r| r == component)
    }

    fn is_alternate_segment(&self, component: &str) -> bool {
        self.alternate_segments.iter().any(|s| s == component)
    }

    /// The part of `path` below the first component naming an output root.
    ///
    /// `"/work/bazel-out/k8-opt/bin/app"` becomes `"k8-opt/bin/app"`. Returns
    /// `None` when no component names an output root or nothing follows it.
    pub fn strip_output_root(&self, path: &str) -> Option<String> {
        let parts: Vec<&str> = path
            .split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .collect();
        let root = parts.iter().position(|p| self.is_output_root(p))?;
        let rest = parts.get(root.saturating_add(1)..).unwrap_or_default();
        if rest.is_empty() {
            return None;
        }
        Some(rest.join("/"))
    }

    /// The output-root relative form of `path`, or `path` unchanged when it is
    /// not under an output root.
    pub fn relative_path(&self, path: &str) -> String {
        self.strip_output_root(path).unwrap_or_else(|| path.to_owned())
    }

    /// Strip a leading output root from an execution-root relative path.
    ///
    /// Unlike [`OutputPaths::strip_output_root`], the root must be the very
    /// first component: `"bazel-out/k8-opt/bin/a"` gives `"k8-opt/bin/a"`,
    /// `"src/bazel-out/a"` gives `None`.
    pub fn strip_exec_root<'a>(&self, exec_path: &'a str) -> Option<&'a str> {
        self.output_roots.iter().find_map(|root| {
            exec_path
                .strip_prefix(root.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .filter(|rest| !rest.is_empty())
        })
    }

    /// Candidate spellings of `relative_path` differing by exactly one legacy
    /// segment at the second path component.
    ///
    /// If the second component is a legacy segment, the only candidate drops
    /// it. Otherwise each legacy segment is tried as a new second component.
    pub fn alternate_paths(&self, relative_path: &str) -> Vec<String> {
        let mut parts = relative_path.splitn(3, '/');
        let (Some(first), Some(second)) = (parts.next(), parts.next()) else {
            return Vec::new();
        };
        if first.is_empty() || second.is_empty() {
            return Vec::new();
        }
        let rest = parts.next();

        if self.is_alternate_segment(second) {
            return match rest {
                Some(rest) if !rest.is_empty() => vec![format!("{first}/{rest}")],
                _ => Vec::new(),
            };
        }
        let tail = match rest {
            Some(rest) => format!("{second}/{rest}"),
            None => second.to_owned(),
        };
        self.alternate_segments
            .iter()
            .map(|segment| format!("{first}/{segment}/{tail}"))
            .collect()
    }

    /// Look `relative_path` up in a path-keyed map, retrying once with the
    /// alternate spellings on a miss.
    pub fn lookup<'m, V>(&self, map: &'m BTreeMap<String, V>, relative_path: &str) -> Option<&'m V> {
        if let Some(found) = map.get(relative_path) {
            return Some(found);
        }
        let (alternate, found) = self
            .alternate_paths(relative_path)
            .into_iter()
            .find_map(|alt| map.get(&alt).map(|v| (alt, v)))?;
        tracing::debug!(
            requested = relative_path,
            matched = %alternate,
            "output lookup matched an alternate path format"
        );
        Some(found)
    }
}

/// The configuration mnemonic encoded in an output-root relative path: its
/// first component.
pub fn configuration_mnemonic(relative_path: &str) -> &str {
    relative_path.split('/').next().unwrap_or_default()
}
