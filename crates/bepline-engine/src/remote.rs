//! Remote artifacts kept across builds, keyed directly by relative path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bepline_util::hash::short_hash;

use crate::artifact::{OutputArtifact, RemoteArtifact};
use crate::path::OutputPaths;

/// Copy-on-write store of remote artifacts.
///
/// Unlike [`crate::TrackedOutputArtifacts`], conflicts are settled by sync
/// time: of two artifacts at one path, the more recently synced one is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutputArtifacts {
    by_path: Arc<BTreeMap<String, RemoteArtifact>>,
}

impl RemoteOutputArtifacts {
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &RemoteArtifact> {
        self.by_path.values()
    }

    /// Merge remote outputs of a newer build. Local artifacts are ignored.
    ///
    /// Per path, the incoming artifact replaces the stored one unless the
    /// stored one has a strictly later sync time.
    pub fn append_new_outputs<'a, I>(&self, outputs: I) -> Self
    where
        I: IntoIterator<Item = &'a OutputArtifact>,
    {
        let mut by_path = (*self.by_path).clone();
        for output in outputs {
            let OutputArtifact::Remote(incoming) = output else {
                continue;
            };
            let newer = by_path
                .get(incoming.relative_path())
                .is_none_or(|existing| existing.sync_time_millis() <= incoming.sync_time_millis());
            if newer {
                by_path.insert(incoming.relative_path().to_owned(), incoming.clone());
            }
        }
        Self {
            by_path: Arc::new(by_path),
        }
    }

    /// Keep only artifacts whose relative path satisfies `keep`.
    pub fn remove_untracked_outputs(&self, keep: impl Fn(&str) -> bool) -> Self {
        let by_path: BTreeMap<String, RemoteArtifact> = self
            .by_path
            .iter()
            .filter(|(path, _)| keep(path.as_str()))
            .map(|(path, artifact)| (path.clone(), artifact.clone()))
            .collect();
        Self {
            by_path: Arc::new(by_path),
        }
    }

    /// Look up a remote artifact by relative path, retrying once with an
    /// alternate path format.
    pub fn find_remote_output(&self, paths: &OutputPaths, relative_path: &str) -> Option<&RemoteArtifact> {
        paths.lookup(&self.by_path, relative_path)
    }
}

/// Local file name under which a remote artifact's contents are cached:
/// `{stem}_{hash8}.{ext}`, where the hash is taken over the artifact key so
/// same-named outputs of different packages do not collide.
pub fn cache_file_name(artifact: &RemoteArtifact) -> String {
    let key = artifact.relative_path();
    let hash = short_hash(key.as_bytes(), 8);
    let file = Path::new(key);
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file.extension() {
        Some(ext) => format!("{stem}_{hash}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{hash}"),
    }
}
