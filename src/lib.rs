//! # spacecoord
//!
//! Cluster coordinator for a searchable, hyperspace-hashed key-value store:
//! - Tracks storage instances as they register and fail
//! - Partitions each space into regions and places replicas on instances
//! - Pushes versioned configurations to instances and clients
//! - Moves replicas with transfers when instances fail
//! - Snapshots and restores its own state across restarts
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────┐  control port (JSON lines)
//! │ spacecoord-  ├──────────────────────────┐
//! │ ctl / admin  │                          │
//! └──────────────┘                  ┌───────▼────────┐
//!                                   │  Coordinator   │
//!                                   │ (single state, │
//!                                   │  one lock)     │
//!                                   └───────┬────────┘
//!             host port (text lines)        │
//!   ┌─────────────────┬─────────────────────┼──────────────┐
//!   │                 │                     │              │
//! ┌─▼──────────┐  ┌──▼─────────┐  ┌────────▼───┐  ┌──────▼─────┐
//! │ Instance 1 │  │ Instance 2 │  │ Instance 3 │  │  Client    │
//! └────────────┘  └────────────┘  └────────────┘  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! spacecoord serve \
//!   --bind 0.0.0.0 \
//!   --control-port 6970 \
//!   --host-port 1982
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Create a space from a description on stdin
//! echo "space kv key k attributes v auto 4 2" | spacecoord-ctl add-space
//!
//! # Inspect
//! spacecoord-ctl lst-spaces
//! spacecoord-ctl get-status
//!
//! # Orderly shutdown
//! spacecoord-ctl quiesce
//! spacecoord-ctl shutdown > state.json
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, CoordinatorServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
