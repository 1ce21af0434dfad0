//! Artifact graph, cross-build tracking and remote artifact store for bepline.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod bep;
pub mod error;
pub mod fetch;
pub mod flags;
pub mod path;
pub mod persist;
pub mod remote;
pub mod resolve;
pub mod test_results;
pub mod tracker;

pub use artifact::{
    ArtifactParser, ArtifactRecord, DefaultArtifactParser, LocalArtifact, OutputArtifact,
    RemoteArtifact,
};
pub use bep::{BuildResult, NamedFileSet, ParsedBepOutput};
pub use error::EngineError;
pub use fetch::{fetcher_for, HttpCasFetcher, RemoteFetcher, UnavailableFetcher};
pub use flags::{parse_build_flags, BuildFlags};
pub use path::OutputPaths;
pub use persist::{load_json, save_json, RemoteOutputsRecord, StateRecord, TrackedOutputsRecord};
pub use remote::{cache_file_name, RemoteOutputArtifacts};
pub use resolve::{ArtifactResolver, BepArtifactData};
pub use test_results::{parse_test_results, TestResult, TestStatus};
pub use tracker::{TargetSet, TrackedOutputArtifacts};
