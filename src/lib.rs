//! Self-hosted runner manager.
//!
//! Three long-lived processes share this crate: the manager mirrors the
//! runners registered against a GitHub target and serves them over HTTP,
//! the controller drives the lifecycle of runner pods in a Kubernetes
//! cluster, and the per-pod agent configures and supervises the runner
//! process itself.

pub mod agent;
pub mod api;
pub mod config;
pub mod controller;
pub mod errors;
pub mod github;
pub mod kube;
pub mod metrics;
pub mod runtime;
pub mod utils;
