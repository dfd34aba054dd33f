//! Device registry / config loader (§4.8, §3.1): parses the declarative
//! board file, enforces per-user access lists, and instantiates Devices.

use crate::error::ConfigError;
use crate::server::device::{BoardDriver, Device};
use crate::server::virtual_driver::VirtualDriver;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(rename = "board", default)]
    boards: Vec<BoardRecord>,
}

/// One configured board (§3.1).
#[derive(Debug, Clone, Deserialize)]
pub struct BoardRecord {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
    pub driver: String,
    pub console: String,
}

impl BoardRecord {
    /// `users = []` means world-accessible.
    pub fn permits(&self, user: &str) -> bool {
        self.users.is_empty() || self.users.iter().any(|u| u == user)
    }
}

pub struct Registry {
    boards: Vec<BoardRecord>,
}

/// First-existing-path search order (§4.8).
const CANDIDATE_PATHS: &[&str] = &["./.cdba", "/etc/cdba"];

impl Registry {
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path().ok_or(ConfigError::NotFound)?;
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: RegistryFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        for board in &file.boards {
            if board.driver != "virtual" {
                return Err(ConfigError::UnimplementedDriver {
                    name: board.name.clone(),
                    driver: board.driver.clone(),
                });
            }
        }
        Ok(Self { boards: file.boards })
    }

    /// Boards the given user may access, in file order (used by
    /// `LIST_DEVICES`).
    pub fn accessible_boards(&self, user: &str) -> Vec<&BoardRecord> {
        self.boards.iter().filter(|b| b.permits(user)).collect()
    }

    pub fn find(&self, name: &str, user: &str) -> Result<&BoardRecord, ConfigError> {
        let record = self
            .boards
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| ConfigError::NoSuchBoard(name.to_string()))?;
        if !record.permits(user) {
            return Err(ConfigError::NotAuthorized {
                user: user.to_string(),
                board: name.to_string(),
            });
        }
        Ok(record)
    }

    /// Build a `Device` for `name` on behalf of `user`, enforcing access
    /// control. Only the `virtual` driver is actually instantiated; other
    /// driver kinds are rejected at load time (see `load`).
    pub fn instantiate(&self, name: &str, user: &str) -> Result<Device, ConfigError> {
        let record = self.find(name, user)?;
        let driver: Box<dyn BoardDriver> = Box::new(VirtualDriver::new());
        Ok(Device::new(record.name.clone(), user.to_string(), driver))
    }
}

/// The effective operator identity for access control (§4.8, §6).
pub fn effective_user() -> String {
    std::env::var("CDBA_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "nobody".to_string())
}

pub fn default_config_path() -> Option<PathBuf> {
    CANDIDATE_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}
