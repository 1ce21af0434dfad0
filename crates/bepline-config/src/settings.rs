//! The `bepline.toml` settings: output path layout, stream limits, remote
//! artifact access and the tracked-state location.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The `bepline.toml` settings file.
///
/// Every section is optional; an absent file yields [`Settings::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub state: StateSettings,
}

/// How output paths are keyed and matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSettings {
    /// Leading output directory names stripped to form output-root-relative keys.
    #[serde(default = "default_output_roots")]
    pub output_roots: Vec<String>,
    /// Second-component segment names the lookup heuristic may add or drop.
    #[serde(default = "default_alternate_segments")]
    pub alternate_segments: Vec<String>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            output_roots: default_output_roots(),
            alternate_segments: default_alternate_segments(),
        }
    }
}

fn default_output_roots() -> Vec<String> {
    vec!["bazel-out".to_owned(), "blaze-out".to_owned()]
}

fn default_alternate_segments() -> Vec<String> {
    vec!["bin".to_owned(), "genfiles".to_owned(), "testlogs".to_owned()]
}

/// Limits applied while reading an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Largest single message accepted, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_max_frame_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Remote artifact classification and fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// URI schemes whose files are treated as remote-hosted.
    #[serde(default = "default_schemes")]
    pub schemes: Vec<String>,
    /// Base URL of an HTTP content-addressed store (`{cas_url}/cas/{hash}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            schemes: default_schemes(),
            cas_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_schemes() -> Vec<String> {
    vec!["bytestream".to_owned()]
}

fn default_timeout_secs() -> u64 {
    60
}

/// Where cross-build state is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSettings {
    #[serde(default = "default_state_file")]
    pub file: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            file: default_state_file(),
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".bepline").join("tracked.json")
}

impl Settings {
    /// Read and parse a `bepline.toml` from the given path.
    /// Returns default settings if the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, contains invalid
    /// TOML, or fails validation.
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str_at(&content, path)
    }

    /// Parse settings from TOML text; `origin` is used in error messages.
    ///
    /// # Errors
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_str_at(content: &str, origin: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content).map_err(|e| SettingsError::Parse {
            path: origin.display().to_string(),
            source: e,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.stream.max_frame_bytes == 0 {
            return Err(SettingsError::Invalid {
                field: "stream.max_frame_bytes".to_owned(),
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.remote.timeout_secs == 0 {
            return Err(SettingsError::Invalid {
                field: "remote.timeout_secs".to_owned(),
                reason: "must be greater than zero".to_owned(),
            });
        }
        for segment in &self.paths.alternate_segments {
            if segment.is_empty() || segment.contains('/') {
                return Err(SettingsError::Invalid {
                    field: "paths.alternate_segments".to_owned(),
                    reason: format!("\"{segment}\" must be a single non-empty path component"),
                });
            }
        }
        for root in &self.paths.output_roots {
            if root.is_empty() || root.contains('/') {
                return Err(SettingsError::Invalid {
                    field: "paths.output_roots".to_owned(),
                    reason: format!("\"{root}\" must be a single non-empty path component"),
                });
            }
        }
        Ok(())
    }
}

/// Errors from loading `bepline.toml`.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the settings schema.
    #[error("invalid bepline.toml at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    /// A setting parsed but holds an unusable value.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    fn parse(content: &str) -> Result<Settings, SettingsError> {
        Settings::from_str_at(content, Path::new("bepline.toml"))
    }

    #[test]
    fn default_when_absent() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let settings = Settings::from_path(&dir.path().join("bepline.toml"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.paths.output_roots, vec!["bazel-out", "blaze-out"]);
        assert_eq!(
            settings.paths.alternate_segments,
            vec!["bin", "genfiles", "testlogs"]
        );
    }

    #[test]
    fn empty_file_is_default() {
        let settings = parse("").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn parse_partial_sections() {
        let settings = parse(
            r#"
[remote]
cas_url = "http://cache.internal:8080"

[state]
file = "out/state.json"
"#,
        )
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            settings.remote.cas_url.as_deref(),
            Some("http://cache.internal:8080")
        );
        assert_eq!(settings.remote.schemes, vec!["bytestream"]);
        assert_eq!(settings.state.file, PathBuf::from("out/state.json"));
        assert_eq!(settings.stream.max_frame_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("bepline.toml");
        fs::write(&path, "[stream]\nmax_frame_bytes = 1024\n").unwrap_or_else(|e| panic!("{e}"));
        let settings = Settings::from_path(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(settings.stream.max_frame_bytes, 1024);
    }

    #[test]
    fn rejects_unknown_section() {
        let err = parse("[bogus]\nx = 1\n").map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("invalid bepline.toml"), "error was: {err}");
    }

    #[test]
    fn rejects_zero_frame_limit() {
        let err = parse("[stream]\nmax_frame_bytes = 0\n").map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("stream.max_frame_bytes"), "error was: {err}");
    }

    #[test]
    fn rejects_zero_remote_timeout() {
        let err = parse("[remote]\ntimeout_secs = 0\n").map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("remote.timeout_secs"), "error was: {err}");
        assert!(parse("[remote]\ntimeout_secs = 1\n").is_ok());
    }

    #[test]
    fn rejects_multi_component_segment() {
        let err = parse("[paths]\nalternate_segments = [\"bin/x\"]\n")
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("paths.alternate_segments"), "error was: {err}");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn settings_round_trip(
                limit in 1u64..1_000_000_000,
                segment in "[a-z]{1,10}",
                timeout in 1u64..3600,
            ) {
                let mut original = Settings::default();
                original.stream.max_frame_bytes = limit;
                original.paths.alternate_segments = vec![segment];
                original.remote.timeout_secs = timeout;
                let text = toml::to_string_pretty(&original).unwrap_or_else(|e| panic!("{e}"));
                let reparsed = parse(&text).unwrap_or_else(|e| panic!("{e}"));
                prop_assert_eq!(original, reparsed);
            }
        }
    }
}
