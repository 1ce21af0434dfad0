//! Output artifacts: files produced by a build, either on local disk or held
//! in a remote content-addressed store.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bepline_config::Settings;
use bepline_stream::FileDescriptor;
use bepline_util::fs::{file_len_or_zero, modified_millis_or_zero, normalize_path};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::fetch::{fetcher_for, RemoteFetcher};
use crate::path::OutputPaths;

/// A build output, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutputArtifact {
    Local(LocalArtifact),
    Remote(RemoteArtifact),
}

impl OutputArtifact {
    /// Identity used for caching and diffing: the filesystem path for local
    /// artifacts, the output-root relative path for remote ones.
    pub fn key(&self) -> String {
        match self {
            Self::Local(a) => a.key(),
            Self::Remote(a) => a.relative_path.clone(),
        }
    }

    /// Path below the output root, starting with the configuration mnemonic
    /// when the artifact lives under an output root.
    pub fn relative_path(&self) -> &str {
        match self {
            Self::Local(a) => &a.relative_path,
            Self::Remote(a) => &a.relative_path,
        }
    }

    /// Mnemonic of the configuration that produced the file set this artifact
    /// came from. Empty when unknown.
    pub fn configuration_mnemonic(&self) -> &str {
        match self {
            Self::Local(a) => &a.configuration_mnemonic,
            Self::Remote(a) => &a.configuration_mnemonic,
        }
    }

    /// Size in bytes; 0 means unknown.
    pub fn length(&self) -> u64 {
        match self {
            Self::Local(a) => a.length(),
            Self::Remote(a) => a.length,
        }
    }

    /// Modification time for local files, sync time for remote ones, in epoch
    /// milliseconds; 0 means unknown.
    pub fn last_modified_millis(&self) -> i64 {
        match self {
            Self::Local(a) => a.last_modified_millis(),
            Self::Remote(a) => a.sync_time_millis,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Open the artifact's contents.
    ///
    /// # Errors
    /// Returns an error if the local file cannot be opened or the remote
    /// content cannot be fetched.
    pub fn input_stream(&self) -> Result<Box<dyn Read + Send>, EngineError> {
        match self {
            Self::Local(a) => a.input_stream(),
            Self::Remote(a) => a.input_stream(),
        }
    }

    pub fn to_record(&self) -> ArtifactRecord {
        match self {
            Self::Local(a) => ArtifactRecord::Local {
                path: a.path.clone(),
                relative_path: a.relative_path.clone(),
                configuration_mnemonic: a.configuration_mnemonic.clone(),
            },
            Self::Remote(a) => ArtifactRecord::Remote {
                relative_path: a.relative_path.clone(),
                hash_id: a.hash_id.clone(),
                length: a.length,
                sync_time_millis: a.sync_time_millis,
                configuration_mnemonic: a.configuration_mnemonic.clone(),
            },
        }
    }

    /// Rebuild an artifact from its record. Remote artifacts are bound to
    /// `fetcher`.
    pub fn from_record(record: ArtifactRecord, fetcher: &Arc<dyn RemoteFetcher>) -> Self {
        match record {
            ArtifactRecord::Local {
                path,
                relative_path,
                configuration_mnemonic,
            } => Self::Local(LocalArtifact::new(&path, relative_path, &configuration_mnemonic)),
            ArtifactRecord::Remote {
                relative_path,
                hash_id,
                length,
                sync_time_millis,
                configuration_mnemonic,
            } => Self::Remote(RemoteArtifact::new(
                relative_path,
                hash_id,
                length,
                sync_time_millis,
                &configuration_mnemonic,
                Arc::clone(fetcher),
            )),
        }
    }
}

/// Serialized form of an [`OutputArtifact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRecord {
    Local {
        path: PathBuf,
        relative_path: String,
        #[serde(default)]
        configuration_mnemonic: String,
    },
    Remote {
        relative_path: String,
        hash_id: String,
        #[serde(default)]
        length: u64,
        #[serde(default)]
        sync_time_millis: i64,
        #[serde(default)]
        configuration_mnemonic: String,
    },
}

impl ArtifactRecord {
    pub fn relative_path(&self) -> &str {
        match self {
            Self::Local { relative_path, .. } | Self::Remote { relative_path, .. } => relative_path,
        }
    }
}

/// A file on the local filesystem.
///
/// Two instances naming the same normalized path are equal regardless of the
/// metadata attached to them.
#[derive(Debug, Clone)]
pub struct LocalArtifact {
    path: PathBuf,
    relative_path: String,
    configuration_mnemonic: String,
}

impl LocalArtifact {
    pub fn new(path: &Path, relative_path: String, configuration_mnemonic: &str) -> Self {
        Self {
            path: normalize_path(path),
            relative_path,
            configuration_mnemonic: configuration_mnemonic.to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Read from the filesystem on every call.
    pub fn length(&self) -> u64 {
        file_len_or_zero(&self.path)
    }

    /// Read from the filesystem on every call.
    pub fn last_modified_millis(&self) -> i64 {
        i64::try_from(modified_millis_or_zero(&self.path)).unwrap_or(i64::MAX)
    }

    fn input_stream(&self) -> Result<Box<dyn Read + Send>, EngineError> {
        let file = std::fs::File::open(&self.path).map_err(|source| EngineError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }
}

impl PartialEq for LocalArtifact {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for LocalArtifact {}

impl Hash for LocalArtifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

type ContentSlot = Arc<Mutex<Option<Arc<[u8]>>>>;

/// A file held in a remote content-addressed store.
///
/// Clones share one in-memory content cache.
#[derive(Clone)]
pub struct RemoteArtifact {
    relative_path: String,
    hash_id: String,
    length: u64,
    sync_time_millis: i64,
    configuration_mnemonic: String,
    fetcher: Arc<dyn RemoteFetcher>,
    content: ContentSlot,
}

impl fmt::Debug for RemoteArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteArtifact")
            .field("relative_path", &self.relative_path)
            .field("hash_id", &self.hash_id)
            .field("length", &self.length)
            .field("sync_time_millis", &self.sync_time_millis)
            .field("configuration_mnemonic", &self.configuration_mnemonic)
            .finish_non_exhaustive()
    }
}

impl RemoteArtifact {
    pub fn new(
        relative_path: String,
        hash_id: String,
        length: u64,
        sync_time_millis: i64,
        configuration_mnemonic: &str,
        fetcher: Arc<dyn RemoteFetcher>,
    ) -> Self {
        Self {
            relative_path,
            hash_id,
            length,
            sync_time_millis,
            configuration_mnemonic: configuration_mnemonic.to_owned(),
            fetcher,
            content: Arc::new(Mutex::new(None)),
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn hash_id(&self) -> &str {
        &self.hash_id
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn sync_time_millis(&self) -> i64 {
        self.sync_time_millis
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<[u8]>>> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_prefetched(&self) -> bool {
        self.slot().is_some()
    }

    /// Load the contents into memory if they are not there yet.
    ///
    /// Best effort: a failed fetch is logged and leaves the artifact to be
    /// fetched again by [`OutputArtifact::input_stream`].
    pub fn prefetch(&self) {
        if self.is_prefetched() {
            return;
        }
        match self.fetcher.fetch(&self.hash_id) {
            Ok(data) => {
                *self.slot() = Some(Arc::from(data));
            }
            Err(e) => {
                tracing::warn!(path = %self.relative_path, error = %e, "prefetch failed");
            }
        }
    }

    fn input_stream(&self) -> Result<Box<dyn Read + Send>, EngineError> {
        let cached = self.slot().clone();
        if let Some(data) = cached {
            return Ok(Box::new(Cursor::new(data)));
        }
        // Fetched without holding the lock so a concurrent prefetch is never blocked on I/O.
        let data: Arc<[u8]> = Arc::from(self.fetcher.fetch(&self.hash_id)?);
        *self.slot() = Some(Arc::clone(&data));
        Ok(Box::new(Cursor::new(data)))
    }
}

impl PartialEq for RemoteArtifact {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
            && self.hash_id == other.hash_id
            && self.length == other.length
            && self.sync_time_millis == other.sync_time_millis
            && self.configuration_mnemonic == other.configuration_mnemonic
    }
}

impl Eq for RemoteArtifact {}

impl Hash for RemoteArtifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.relative_path.hash(state);
        self.hash_id.hash(state);
        self.sync_time_millis.hash(state);
    }
}

/// Turns a file descriptor from the stream into an artifact.
///
/// Returns `None` for files that cannot be mapped to a usable location or
/// whose output-root relative path is rejected by `filter`.
pub trait ArtifactParser: Send + Sync {
    fn parse_artifact(
        &self,
        file: &FileDescriptor,
        configuration_mnemonic: &str,
        filter: &dyn Fn(&str) -> bool,
        sync_start_time_millis: i64,
    ) -> Option<OutputArtifact>;
}

/// Classifies files by URI scheme: schemes listed in `[remote] schemes` are
/// remote, everything with a local path is local.
#[derive(Debug, Clone)]
pub struct DefaultArtifactParser {
    paths: OutputPaths,
    remote_schemes: Vec<String>,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl DefaultArtifactParser {
    pub fn new(paths: OutputPaths, remote_schemes: Vec<String>, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self {
            paths,
            remote_schemes,
            fetcher,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            OutputPaths::new(&settings.paths),
            settings.remote.schemes.clone(),
            fetcher_for(&settings.remote),
        )
    }

    fn is_remote_scheme(&self, file: &FileDescriptor) -> bool {
        file.uri_scheme()
            .is_some_and(|scheme| self.remote_schemes.iter().any(|s| *s == scheme))
    }

    fn parse_remote(
        &self,
        file: &FileDescriptor,
        configuration_mnemonic: &str,
        filter: &dyn Fn(&str) -> bool,
        sync_start_time_millis: i64,
    ) -> Option<OutputArtifact> {
        let blob = file.uri.as_deref().and_then(blob_from_uri);
        let hash_id = file
            .digest
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| blob.as_ref().map(|(hash, _)| hash.clone()));
        let (Some(hash_id), Some(full_path)) = (hash_id, file.prefixed_path()) else {
            tracing::debug!(name = %file.name, uri = ?file.uri, "dropping remote output without a hash or path");
            return None;
        };
        let relative_path = self.paths.relative_path(&full_path);
        if !filter(&relative_path) {
            return None;
        }
        let length = file
            .length
            .and_then(|l| u64::try_from(l).ok())
            .or_else(|| blob.and_then(|(_, size)| size))
            .unwrap_or(0);
        Some(OutputArtifact::Remote(RemoteArtifact::new(
            relative_path,
            hash_id,
            length,
            sync_start_time_millis,
            configuration_mnemonic,
            Arc::clone(&self.fetcher),
        )))
    }
}

impl ArtifactParser for DefaultArtifactParser {
    fn parse_artifact(
        &self,
        file: &FileDescriptor,
        configuration_mnemonic: &str,
        filter: &dyn Fn(&str) -> bool,
        sync_start_time_millis: i64,
    ) -> Option<OutputArtifact> {
        if self.is_remote_scheme(file) {
            return self.parse_remote(file, configuration_mnemonic, filter, sync_start_time_millis);
        }
        let Some(path) = file.local_path() else {
            tracing::debug!(name = %file.name, uri = ?file.uri, "dropping output with no local path");
            return None;
        };
        let path = normalize_path(&path);
        let relative_path = self.paths.relative_path(&path.to_string_lossy());
        if !filter(&relative_path) {
            return None;
        }
        Some(OutputArtifact::Local(LocalArtifact::new(
            &path,
            relative_path,
            configuration_mnemonic,
        )))
    }
}

/// Hash and size from a `.../blobs/{hash}/{size}` URI.
fn blob_from_uri(uri: &str) -> Option<(String, Option<u64>)> {
    let parsed = url::Url::parse(uri).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let at = segments.iter().position(|s| *s == "blobs")?;
    let hash = segments.get(at.saturating_add(1)).filter(|h| !h.is_empty())?;
    let size = segments
        .get(at.saturating_add(2))
        .and_then(|s| s.parse().ok());
    Some(((*hash).to_owned(), size))
}
