//! Persisted forward map, restored at master startup.
//!
//! Stored as JSON at `~/.mpf/forwards.json`:
//!
//! ```json
//! {"remotes": {"user@host": {"forwards": {"<master_port>": "<slave_port>"}}}}
//! ```
//!
//! Writes are atomic (temp file + rename) and the file is created with mode
//! 0600. Loading is lenient: a missing or unparseable file starts empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct Config {
    #[serde(default)]
    remotes: HashMap<String, RemoteConfig>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct RemoteConfig {
    /// master_port -> slave_port, both as decimal strings.
    #[serde(default)]
    forwards: HashMap<String, String>,
}

/// Owns the forwards file and serializes access to it.
pub struct Manager {
    path: PathBuf,
    cfg: Mutex<Config>,
}

impl Manager {
    /// Open the default store at `~/.mpf/forwards.json`, creating the
    /// directory if needed.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::State("could not determine home directory".into()))?;
        let dir = home.join(".mpf");
        std::fs::create_dir_all(&dir)?;
        Self::with_path(dir.join("forwards.json"))
    }

    /// Open a store at an explicit path (used by tests).
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let cfg = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
            Err(_) => Config::default(),
        };
        Ok(Self {
            path,
            cfg: Mutex::new(cfg),
        })
    }

    /// Record `master_port -> slave_port` for `remote` and save.
    pub fn add_forward(&self, remote: &str, slave_port: u16, master_port: u16) -> Result<()> {
        let mut cfg = self.cfg.lock().expect("state lock poisoned");
        cfg.remotes
            .entry(remote.to_string())
            .or_default()
            .forwards
            .insert(master_port.to_string(), slave_port.to_string());
        save(&self.path, &cfg)
    }

    /// Drop the `master_port` mapping for `remote` and save. Removing an
    /// unknown port is a no-op.
    pub fn remove_forward(&self, remote: &str, master_port: u16) -> Result<()> {
        let mut cfg = self.cfg.lock().expect("state lock poisoned");
        let Some(rc) = cfg.remotes.get_mut(remote) else {
            return Ok(());
        };
        rc.forwards.remove(&master_port.to_string());
        save(&self.path, &cfg)
    }

    /// All `(master_port, slave_port)` pairs recorded for `remote`, sorted
    /// by master port. Entries that fail to parse as ports are skipped.
    pub fn forwards(&self, remote: &str) -> Vec<(u16, u16)> {
        let cfg = self.cfg.lock().expect("state lock poisoned");
        let mut pairs: Vec<(u16, u16)> = cfg
            .remotes
            .get(remote)
            .map(|rc| {
                rc.forwards
                    .iter()
                    .filter_map(|(m, s)| Some((m.parse().ok()?, s.parse().ok()?)))
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort_unstable();
        pairs
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write the config atomically: temp file in the same directory, chmod
/// 0600, rename over the target.
fn save(path: &Path, cfg: &Config) -> Result<()> {
    let data = serde_json::to_vec_pretty(cfg).map_err(|e| Error::State(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_manager() -> (tempfile::TempDir, Manager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = Manager::with_path(dir.path().join("forwards.json")).expect("manager");
        (dir, mgr)
    }

    #[test]
    fn add_and_get_forwards() {
        let (_dir, mgr) = temp_manager();
        mgr.add_forward("user@host", 8080, 5000).unwrap();
        mgr.add_forward("user@host", 3000, 3000).unwrap();

        assert_eq!(mgr.forwards("user@host"), vec![(3000, 3000), (5000, 8080)]);
        assert!(mgr.forwards("other@host").is_empty());
    }

    #[test]
    fn remove_forward_is_idempotent() {
        let (_dir, mgr) = temp_manager();
        mgr.add_forward("user@host", 8080, 5000).unwrap();

        mgr.remove_forward("user@host", 5000).unwrap();
        assert!(mgr.forwards("user@host").is_empty());

        // Second removal and unknown-remote removal are no-ops.
        mgr.remove_forward("user@host", 5000).unwrap();
        mgr.remove_forward("nobody@nowhere", 5000).unwrap();
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("forwards.json");

        {
            let mgr = Manager::with_path(path.clone()).unwrap();
            mgr.add_forward("user@host", 9000, 9001).unwrap();
        }

        let mgr = Manager::with_path(path).unwrap();
        assert_eq!(mgr.forwards("user@host"), vec![(9001, 9000)]);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("forwards.json");
        std::fs::write(&path, b"{not json").unwrap();

        let mgr = Manager::with_path(path).unwrap();
        assert!(mgr.forwards("user@host").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, mgr) = temp_manager();
        mgr.add_forward("user@host", 1, 2).unwrap();

        let mode = std::fs::metadata(mgr.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
