//! Locations of the persisted state (config, index, fingerprints)

use std::path::{Path, PathBuf};

use crate::{APP_DIR, GenError, HOME_ENV, Result};

/// Resolve the data directory.
///
/// An explicit path wins, then `GENCLI_HOME`, then `<config dir>/gencli`.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| GenError::Config("Could not determine config directory".to_string()))
}

/// Get the config file path.
pub fn config_path(home: &Path) -> PathBuf {
    home.join("config.json")
}

/// Get the file index snapshot path.
pub fn index_path(home: &Path) -> PathBuf {
    home.join("index.json")
}

/// Get the fingerprint set path.
pub fn fingerprints_path(home: &Path) -> PathBuf {
    home.join("fingerprints.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_home_wins() {
        let home = resolve_home(Some(Path::new("/tmp/gencli-explicit"))).unwrap();
        assert_eq!(home, PathBuf::from("/tmp/gencli-explicit"));
    }

    #[test]
    fn test_state_files_live_under_home() {
        let home = Path::new("/data/gencli");
        assert_eq!(config_path(home), home.join("config.json"));
        assert_eq!(index_path(home), home.join("index.json"));
        assert_eq!(fingerprints_path(home), home.join("fingerprints.json"));
    }
}
