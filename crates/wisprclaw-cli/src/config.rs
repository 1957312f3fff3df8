//! Config file loading.
//!
//! `config.toml` lives under the per-user config directory:
//!
//! ```toml
//! identity_path = "/home/me/.config/wisprclaw/identity/device.json"
//!
//! [gateway]
//! url = "https://gateway.example.com"
//! token = "…"
//! ```
//!
//! Command-line flags and `WISPRCLAW_*` variables override the file.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use wisprclaw_client::GatewayConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub identity_path: Option<PathBuf>,
    pub gateway: GatewayConfig,
}

impl FileConfig {
    /// `<config dir>/wisprclaw/config.toml`, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wisprclaw").join("config.toml"))
    }

    /// Load `path`. A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
