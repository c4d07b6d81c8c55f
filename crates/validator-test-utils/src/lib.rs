//! # Validator Test Utilities
//!
//! Shared test utilities for the Deploy Validator.
//!
//! ## Modules
//!
//! - `mock_cluster` - In-memory `ClusterClient` with fault injection
//! - `scripted_check` - Checks with a predetermined outcome
//! - `fixtures` - Pre-configured configuration for fast, deterministic runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use validator_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let cluster = MockCluster::new()
//!         .with_crd("certificates.cert-manager.io")
//!         .with_stuck_finalizers(ResourceKind::ConfigMap);
//!
//!     let mut registry = CheckRegistry::new();
//!     registry.register("ok", ScriptedCheck::pass().into_check());
//!
//!     let runner = Runner::new(fast_config(), pipeline, registry, cluster.client());
//!     let outcome = runner.run(RunRequest::new(Phase::PreDeployment)).await;
//!
//!     assert!(cluster.namespaces().is_empty());
//! }
//! ```

pub mod fixtures;
pub mod mock_cluster;
pub mod scripted_check;

pub use fixtures::*;
pub use mock_cluster::*;
pub use scripted_check::*;
