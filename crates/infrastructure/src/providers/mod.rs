//! Node provider implementations
//!
//! This module contains the production implementation of the NodeProvider
//! trait for Kubernetes-backed clusters.

pub mod kubernetes;
pub mod kubernetes_ssh;
pub mod kubernetes_wait;

pub use kubernetes::{KubernetesConfig, KubernetesConfigBuilder, KubernetesNodeProvider};
