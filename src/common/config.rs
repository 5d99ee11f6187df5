//! Configuration for the spacecoord coordinator

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load `spacecoord.toml` from the working directory (if present) and
    /// `SPACECOORD__*` environment overrides. Falls back to defaults.
    pub fn load() -> Self {
        match Self::load_from(Path::new("spacecoord.toml")) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring configuration file: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from an explicit file path plus environment overrides.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(::config::Environment::with_prefix("SPACECOORD").separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let c = &self.coordinator;
        if c.control_port != 0 && c.control_port == c.host_port {
            return Err(crate::Error::InvalidConfig(format!(
                "control and host listeners share port {}",
                c.control_port
            )));
        }
        Ok(())
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address both listeners bind to
    pub bind_addr: IpAddr,

    /// Port for JSON control connections
    pub control_port: u16,

    /// Port for daemon and client host connections
    pub host_port: u16,

    /// Snapshot to restore from at startup (coordinator starts in STARTUP)
    pub state_file: Option<PathBuf>,

    /// Where a successful `shutdown` writes its snapshot
    pub snapshot_path: Option<PathBuf>,

    /// JSON-lines audit log of administrative events
    pub audit_log: Option<PathBuf>,

    /// Seed for replica placement and quiesce ids (random when unset)
    pub rng_seed: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: 6970,
            host_port: 1982,
            state_file: None,
            snapshot_path: None,
            audit_log: None,
            rng_seed: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.control_port)
    }

    pub fn host_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.coordinator.control_port, 6970);
        assert_eq!(config.coordinator.host_addr().port(), 1982);
        assert!(config.coordinator.state_file.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[coordinator]\nbind_addr = \"127.0.0.1\"\ncontrol_port = 7000\nrng_seed = 42"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.coordinator.control_port, 7000);
        assert_eq!(config.coordinator.host_port, 1982);
        assert_eq!(config.coordinator.rng_seed, Some(42));
        assert_eq!(
            config.coordinator.control_addr(),
            "127.0.0.1:7000".parse().unwrap()
        );
    }

    #[test]
    fn test_shared_port_rejected() {
        let mut config = Config::default();
        config.coordinator.host_port = config.coordinator.control_port;
        assert!(config.validate().is_err());
    }
}
