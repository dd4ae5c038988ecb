use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://habits.db?mode=rwc";

/// Application settings read from Rocket's figment (`Rocket.toml` or
/// `ROCKET_*` environment variables).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Days older than this many days before today are swept before a summary read.
    pub retention_days: i64,
    pub session_hours: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            session_hours: 24,
        }
    }
}

pub fn load_environment() -> anyhow::Result<()> {
    let is_production =
        dotenvy::var("ROCKET_PROFILE").unwrap_or("development".to_string()) == "production";

    let env_files = if is_production {
        vec!["config/common.env", "config/prod.env", ".secrets.env"]
    } else {
        vec!["config/common.env", "config/dev.env", ".secrets.env"]
    };

    for env_file in env_files {
        load_env_file(env_file)?;
    }

    Ok(())
}

fn load_env_file(path: &str) -> anyhow::Result<()> {
    if !Path::new(path).exists() {
        warn!("Environment file {} not found, skipping", path);
        return Ok(());
    }

    dotenvy::from_filename_override(path)?;
    info!("Loaded environment from: {}", path);
    Ok(())
}

pub fn database_url() -> String {
    dotenvy::var("DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}
