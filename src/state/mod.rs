//! Persisted supervisor state.
//!
//! Grounded on `examples/original_source/src/qbouncer/service.py`'s
//! `_load_state`/`_save_state`: a small JSON document recording the last
//! mapped port and failure count, written with a restrictive mode so a
//! multi-user host can't read it, and tolerant of being missing or corrupt
//! on load (a fresh run just starts from `INITIALIZING`).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const STATE_VERSION: u32 = 1;

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Runtime state tracked across ticks and persisted to disk.
#[derive(Debug, Clone, Default)]
pub struct ServiceStateData {
    pub current_port: Option<u16>,
    pub consecutive_failures: u32,
    pub last_port_refresh: Option<DateTime<Utc>>,
    pub last_vpn_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    last_port: Option<u16>,
    last_refresh: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl ServiceStateData {
    /// Loads whatever state was persisted at `path`. Any error (missing
    /// file, bad permissions, malformed JSON) is logged and treated as "no
    /// state", never propagated — a fresh start is always a valid outcome.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("no state file found, starting fresh");
            return Self::default();
        }

        let read = std::fs::read_to_string(path).and_then(|contents| {
            serde_json::from_str::<PersistedState>(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        });

        match read {
            Ok(persisted) => {
                info!(
                    last_port = ?persisted.last_port,
                    last_refresh = ?persisted.last_refresh,
                    "loaded persisted state"
                );
                Self {
                    current_port: persisted.last_port,
                    consecutive_failures: persisted.consecutive_failures,
                    last_port_refresh: persisted.last_refresh,
                    last_vpn_check: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to load state file, starting fresh");
                Self::default()
            }
        }
    }

    /// Persists current state to `path`, creating its parent directory if
    /// needed. Failures are logged, not propagated: a supervisor that can't
    /// write its state file should keep running, not crash.
    pub fn save(&self, path: &Path) {
        if let Err(e) = self.try_save(path) {
            warn!(error = %e, "failed to save state file");
        }
    }

    fn try_save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            set_dir_mode(parent)?;
        }

        let persisted = PersistedState {
            version: STATE_VERSION,
            last_port: self.current_port,
            last_refresh: self.last_port_refresh,
            consecutive_failures: self.consecutive_failures,
        };
        let contents = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(path, contents)?;
        set_file_mode(path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let state = ServiceStateData::load(&path);
        assert_eq!(state.current_port, None);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn corrupt_file_yields_default_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let state = ServiceStateData::load(&path);
        assert_eq!(state.current_port, None);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = ServiceStateData::default();
        state.current_port = Some(51413);
        state.consecutive_failures = 2;
        state.last_port_refresh = Some(Utc::now());
        state.save(&path);

        let reloaded = ServiceStateData::load(&path);
        assert_eq!(reloaded.current_port, Some(51413));
        assert_eq!(reloaded.consecutive_failures, 2);
        assert!(reloaded.last_port_refresh.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        ServiceStateData::default().save(&path);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
    }
}
