//! Deploy Validator Library
//!
//! Validates a deployment in phases (pre-deployment, post-deployment,
//! continuous). Each phase runs an ordered list of checks, some inside
//! short-lived, quota-bounded test environments provisioned on the cluster
//! under test, and produces a structured report plus a process exit code.
//!
//! # Architecture
//!
//! ```text
//! runner.rs -> pipeline.rs -> checks/*.rs
//!                  |               |
//!           environment.rs -> tracker.rs -> cluster.rs (ClusterClient)
//!                  |
//!             resilience/ (retry + circuit breaker around every client call)
//! ```
//!
//! # Modules
//!
//! - `capability` - Cluster prerequisites a check can require
//! - `checks` - The `Check` trait, its registry, and built-in checks
//! - `cluster` - Cluster client surface and its error classification
//! - `config` - Process and pipeline configuration
//! - `context` - Per-run state shared by every component
//! - `environment` - Namespace-scoped test environments
//! - `kubectl` - `ClusterClient` backed by the kubectl binary
//! - `observability` - Logging and metrics
//! - `pipeline` - Phase scheduling and per-check lifecycle
//! - `progress` - Check status tracking and stall detection
//! - `reporter` - Run report and exit code
//! - `resilience` - Retry policy, circuit breakers, polling
//! - `runner` - The run invocation surface
//! - `tracker` - Dependency-ordered cleanup of provisioned resources

pub mod capability;
pub mod checks;
pub mod cluster;
pub mod config;
pub mod context;
pub mod environment;
pub mod kubectl;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod reporter;
pub mod resilience;
pub mod runner;
pub mod tracker;
