use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    // 1. Current directory
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }

    // 2. ~/.parley/config.json
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".parley").join("config.json");
        if home_config.exists() {
            return home_config;
        }
    }

    // Default: ~/.parley/config.json (will use defaults if missing)
    dirs::home_dir()
        .map(|h| h.join(".parley").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Load configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Apply recognized environment overrides from an arbitrary (key, value)
/// iterator. Split out from `apply_process_env` so it can be tested without
/// mutating the process environment.
pub fn apply_env<I, K, V>(config: &mut Config, vars: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    for (key, value) in vars {
        let value: String = value.into();
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "GEMINI_API_KEY" => config.providers.gemini.api_key = value,
            "TAVILY_API_KEY" => config.tools.search.api_key = value,
            "PARLEY_INACTIVITY_THRESHOLD_SECS" => {
                if let Ok(secs) = value.parse() {
                    config.agents.inactivity_threshold_secs = secs;
                }
            }
            "PARLEY_REAPER_INTERVAL_SECS" => {
                if let Ok(secs) = value.parse() {
                    config.agents.reaper_interval_secs = secs;
                }
            }
            "PARLEY_FLUSH_INTERVAL_MS" => {
                if let Ok(ms) = value.parse() {
                    config.agents.flush_interval_ms = ms;
                }
            }
            _ => {}
        }
    }
}

/// Apply overrides from the real process environment.
pub fn apply_process_env(config: &mut Config) {
    apply_env(config, std::env::vars());
}
