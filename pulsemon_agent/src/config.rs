//! Host identity persisted after enrollment: server URL, host id, bearer
//! token. Written only by `enroll`; read-only to the delivery pipeline.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub host_token: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub allow_insecure_localhost: bool,
}

/// A `NotFound` error here is the recoverable "not enrolled" state.
pub fn load(path: &Path) -> io::Result<Config> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
}

pub fn save(path: &Path, cfg: &Config) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = serde_json::to_string_pretty(cfg).map_err(io::Error::other)?;
    contents.push('\n');
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
