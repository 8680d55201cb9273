use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::LinkgateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "linkgate.toml",
    "linkgate.yaml",
    "linkgate.yml",
    "linkgate.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<LinkgateConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply env overrides.
///
/// Search order:
/// 1. `./linkgate.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/linkgate/linkgate.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `LinkgateConfig::default()` when nothing is found or the file
/// does not parse.
pub fn discover_and_load() -> LinkgateConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    LinkgateConfig::default()
                },
            }
        },
        None => {
            debug!("no config file found, using defaults");
            LinkgateConfig::default()
        },
    };
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config
}

/// Load an explicit path when given, otherwise run discovery.
pub fn load_or_discover(path: Option<&Path>) -> anyhow::Result<LinkgateConfig> {
    match path {
        Some(path) => {
            let mut config = load_config(path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok());
            Ok(config)
        },
        None => Ok(discover_and_load()),
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|dir| first_existing(&dir)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// `~/.config/linkgate/`.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("linkgate"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<LinkgateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
