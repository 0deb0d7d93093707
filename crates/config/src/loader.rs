use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::FleetgateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["fleetgate.toml", "fleetgate.json"];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, discovery only looks there —
/// project-local and user-global paths are skipped. Each call replaces the
/// previous override (tests rely on this).
pub fn set_config_dir(path: PathBuf) {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.lock() {
        *guard = Some(path);
    }
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.lock().ok().and_then(|g| g.clone())
}

/// Load config from the given path (TOML or JSON by extension).
pub fn load_config(path: &Path) -> anyhow::Result<FleetgateConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./fleetgate.{toml,json}` (project-local)
/// 2. `~/.config/fleetgate/fleetgate.{toml,json}` (user-global)
///
/// Returns `FleetgateConfig::default()` if no config file is found; a file
/// that exists but fails to parse is logged and also falls back to defaults
/// so a bad edit can't keep the gateway down.
pub fn discover_and_load() -> FleetgateConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return FleetgateConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            FleetgateConfig::default()
        },
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
        // Override is set — don't fall through to other locations.
        return None;
    }

    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    // User-global: ~/.config/fleetgate/
    if let Some(dir) = home_dir().map(|h| h.join(".config").join("fleetgate")) {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<FleetgateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_env_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.toml");
        std::fs::write(&path, "[gateway]\nbind = \"127.0.0.1\"\nport = 9001\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.bind, "127.0.0.1");
        assert_eq!(cfg.gateway.port, 9001);
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.json");
        std::fs::write(&path, r#"{"gateway": {"port": 9002}}"#).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.port, 9002);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.ini");
        std::fs::write(&path, "x").unwrap();
        assert!(load_config(&path).is_err());
    }
}
