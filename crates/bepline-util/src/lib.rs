//! Hashing, filesystem, and path utilities shared by the bepline crates.

#![forbid(unsafe_code)]

pub mod error;
pub mod fs;
pub mod hash;
