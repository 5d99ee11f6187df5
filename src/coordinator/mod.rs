//! Cluster coordinator
//!
//! The coordinator is responsible for:
//! - Instance membership (registration, epochs, failure)
//! - Space metadata (parsing, partitioning, replica placement)
//! - Configuration distribution to instances and clients
//! - Replica transfers after failures
//! - Lifecycle (startup, quiesce, shutdown) and state snapshots

pub mod control;
pub mod control_client;
pub mod distribution;
pub mod host;
pub mod metadata;
pub mod partition;
pub mod placement;
pub mod server;
pub mod snapshot;
pub mod space_desc;
pub mod state;

pub use control::ControlRequest;
pub use control_client::{ControlClient, ControlResponse};
pub use server::{CoordinatorServer, SharedCoordinator};
pub use state::{Coordinator, LifecycleState, ServiceLevel, Status};
