//! Persistence adapters
//!
//! File-backed state that outlives the process: the per-cluster
//! configuration file holding SSH credentials.

pub mod cluster_file;

pub use cluster_file::SshCredentials;
