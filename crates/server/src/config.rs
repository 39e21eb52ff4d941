use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub interpreter: String,
    pub execution_timeout: Duration,
    pub max_code_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/classroom.db".into(),
            interpreter: "python3".into(),
            execution_timeout: Duration::from_secs(5),
            max_code_bytes: 64 * 1024,
        }
    }
}

/// Optional keys accepted in `server.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    interpreter: Option<String>,
    execution_timeout_ms: Option<u64>,
    max_code_bytes: Option<usize>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Err(error) = apply_file_settings(&mut settings, &raw) {
            warn!(%error, "ignoring unreadable server.toml");
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub(crate) fn apply_file_settings(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw).context("invalid server.toml")?;
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.interpreter {
        settings.interpreter = v;
    }
    if let Some(v) = file_cfg.execution_timeout_ms {
        settings.execution_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.max_code_bytes {
        settings.max_code_bytes = v;
    }
    Ok(())
}

/// Later keys win, so the `APP__` forms override the short ones.
pub(crate) fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = lookup(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = lookup(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = lookup("APP__PYTHON_BIN") {
        settings.interpreter = v;
    }
    if let Some(v) = lookup("APP__EXECUTION_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(ms) => settings.execution_timeout = Duration::from_millis(ms),
            Err(_) => warn!(value = %v, "ignoring invalid APP__EXECUTION_TIMEOUT_MS"),
        }
    }
    if let Some(v) = lookup("APP__MAX_CODE_BYTES") {
        match v.parse::<usize>() {
            Ok(bytes) => settings.max_code_bytes = bytes,
            Err(_) => warn!(value = %v, "ignoring invalid APP__MAX_CODE_BYTES"),
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
