//! Git transport for maintainer repositories.

pub mod client;
pub mod vcs;

pub use client::{GitClient, GitCredentials, PullResult};
pub use vcs::{GitUpdate, WorkingCopyState};
