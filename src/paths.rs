//! Per-user file locations. Everything lives under an `esi-sync`
//! directory in the platform's config or data dir.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

const APP_DIR: &str = "esi-sync";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "esi-sync.yaml";

/// `$XDG_DATA_HOME/esi-sync`, or `~/.local/share/esi-sync` when the
/// platform has no data dir.
pub fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
    .map(|dir| dir.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine a data directory"))
}

/// `$XDG_CONFIG_HOME/esi-sync`.
pub fn config_dir() -> Option<PathBuf> {
  dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

/// Places a config file is looked for when none is given, in order.
pub fn config_candidates() -> Vec<PathBuf> {
  let mut candidates = vec![PathBuf::from(LOCAL_CONFIG)];
  candidates.extend(config_dir().map(|dir| dir.join("config.yaml")));
  candidates
}
