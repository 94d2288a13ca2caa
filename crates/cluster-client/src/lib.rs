//! Cluster access layer
//!
//! Everything the VM DHCP processes read from or write to the Kubernetes API
//! goes through [`ClusterClient`], so reconcilers can be exercised against
//! [`MockClusterClient`] (feature `test-util`) without an API server.
//!
//! - [`KubeClusterClient`]: `kube`-backed implementation
//! - [`leader`]: Lease-based leader election
//! - [`patch`]: merge-patch construction with optimistic concurrency

pub mod client;
pub mod error;
pub mod leader;
pub mod patch;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClient;
pub use error::ClusterError;
pub use leader::LeaderElector;
#[cfg(feature = "test-util")]
pub use mock::MockClusterClient;
