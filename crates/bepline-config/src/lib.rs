//! Parse and validate `bepline.toml`.

#![forbid(unsafe_code)]

pub mod settings;

pub use settings::{PathSettings, RemoteSettings, Settings, SettingsError, StateSettings, StreamSettings};
