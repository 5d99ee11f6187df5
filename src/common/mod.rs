//! Common utilities and types shared across spacecoord

pub mod audit;
pub mod config;
pub mod error;
pub mod utils;

pub use audit::{AuditEventType, AuditLogger};
pub use config::{Config, CoordinatorConfig};
pub use error::{Error, ErrorKind, Result};
pub use utils::{crc32, normalize_address, parse_host_port, random_state_id, TOKEN_LEN};
