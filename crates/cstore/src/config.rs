//! Configuration parsing for container storage.
//!
//! This module provides structures for parsing storage.conf files used by
//! containers-storage. Configuration files define the storage location, the
//! driver, and additional read-only image stores.
//!
//! # Overview
//!
//! Container storage configuration is typically found in:
//! - System-wide: `/etc/containers/storage.conf`
//! - User-specific: `~/.config/containers/storage.conf`
//!
//! # Configuration Structure
//!
//! A typical storage.conf file looks like:
//! ```toml
//! [storage]
//! driver = "overlay"
//! graphroot = "/var/lib/containers/storage"
//! runroot = "/run/containers/storage"
//!
//! [storage.options]
//! additionalimagestores = [
//!     "/usr/share/containers/storage"
//! ]
//! ```
//!
//! The same keys are also accepted at the top level of the file, and `root`,
//! `run_root` and `image_stores` may be used instead of the containers-storage
//! spellings.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Default bound on the length of a layer's ancestor chain.
pub const DEFAULT_MAX_LAYER_DEPTH: usize = 500;

/// Storage configuration, typically parsed from storage.conf files.
///
/// Missing keys take the values of [`StorageConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage driver name.
    pub driver: String,

    /// Primary storage root path.
    #[serde(alias = "graphroot")]
    pub root: PathBuf,

    /// Runtime root for transient data.
    #[serde(alias = "runroot")]
    pub run_root: PathBuf,

    /// Additional read-only image stores.
    pub image_stores: Vec<PathBuf>,

    /// Driver-independent options from the `[storage.options]` table.
    pub options: StorageOptions,

    /// Maximum number of layers in an ancestor chain.
    pub max_layer_depth: usize,
}

/// The `[storage.options]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Additional read-only image stores.
    #[serde(alias = "additional_image_stores")]
    pub additionalimagestores: Vec<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let rootless = !rustix::process::getuid().is_root();
        Self {
            driver: "overlay".to_string(),
            root: default_root(rootless, |k| env::var_os(k)),
            run_root: default_run_root(rootless, |k| env::var_os(k)),
            image_stores: Vec::new(),
            options: StorageOptions::default(),
            max_layer_depth: DEFAULT_MAX_LAYER_DEPTH,
        }
    }
}

impl StorageConfig {
    /// Parse storage configuration from TOML content.
    ///
    /// Both the `[storage]` table form and a flat form are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let mut table: toml::Table = content.parse()?;
        match table.remove("storage") {
            Some(toml::Value::Table(storage)) => toml::Value::Table(storage).try_into(),
            Some(other) => {
                table.insert("storage".to_string(), other);
                toml::Value::Table(table).try_into()
            }
            None => toml::Value::Table(table).try_into(),
        }
    }

    /// Read and parse a storage.conf file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_toml(&content)?)
    }

    /// Load the first configuration file found in the default search paths.
    ///
    /// Falls back to [`StorageConfig::default`] when none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn discover() -> Result<Self> {
        for path in Self::default_search_paths() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading storage configuration");
                return Self::from_file(&path);
            }
        }
        tracing::debug!("no storage configuration found, using defaults");
        Ok(Self::default())
    }

    /// Get the configuration file search paths, in priority order.
    ///
    /// 1. `$CONTAINERS_STORAGE_CONF`
    /// 2. `$XDG_CONFIG_HOME/containers/storage.conf`
    /// 3. `$HOME/.config/containers/storage.conf`
    /// 4. `/etc/containers/storage.conf`
    pub fn default_search_paths() -> Vec<PathBuf> {
        search_paths(|k| env::var_os(k))
    }

    /// All additional image stores, from both `image_stores` and
    /// `[storage.options] additionalimagestores`, without repeats.
    pub fn additional_image_stores(&self) -> Vec<&Path> {
        let mut stores: Vec<&Path> = Vec::new();
        for path in self
            .image_stores
            .iter()
            .chain(&self.options.additionalimagestores)
        {
            if !stores.contains(&path.as_path()) {
                stores.push(path);
            }
        }
        stores
    }
}

fn search_paths(var: impl Fn(&str) -> Option<OsString>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(conf) = var("CONTAINERS_STORAGE_CONF") {
        paths.push(PathBuf::from(conf));
    }
    if let Some(xdg) = var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("containers/storage.conf"));
    }
    if let Some(home) = var("HOME") {
        paths.push(PathBuf::from(home).join(".config/containers/storage.conf"));
    }
    paths.push(PathBuf::from("/etc/containers/storage.conf"));
    paths
}

fn default_root(rootless: bool, var: impl Fn(&str) -> Option<OsString>) -> PathBuf {
    if rootless {
        if let Some(data) = var("XDG_DATA_HOME") {
            return PathBuf::from(data).join("containers/storage");
        }
        if let Some(home) = var("HOME") {
            return PathBuf::from(home).join(".local/share/containers/storage");
        }
    }
    PathBuf::from("/var/lib/containers/storage")
}

fn default_run_root(rootless: bool, var: impl Fn(&str) -> Option<OsString>) -> PathBuf {
    if rootless {
        if let Some(runtime) = var("XDG_RUNTIME_DIR") {
            return PathBuf::from(runtime).join("containers");
        }
    }
    PathBuf::from("/run/containers/storage")
}
