//! Load configuration from XDG `config.toml` and project `.env`, then apply to the
//! process environment with priority: **existing env > .env > XDG**.
//!
//! Typed access to the gateway's documented variables lives in [`Settings`].

mod env_file;
mod settings;
mod xdg_file;

pub use settings::{BreakerMode, Settings};

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads config from XDG `config.toml` and an optional project `.env`, then sets
/// environment variables only for keys that are **not** already set.
///
/// Precedence when a key is missing from the process environment:
/// 1. Value from project `.env` (current directory, or `override_dir` if given)
/// 2. Value from `~/.config/<app_name>/config.toml` `[env]` table
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_file::load_env_map(app_name)?;
    let dotenv_map = env_file::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    for (key, value) in dotenv_map.iter().chain(xdg_map.iter()) {
        if std::env::var(key).is_err() {
            // .env entries are visited first, so they win over XDG for the same key.
            std::env::set_var(key, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn existing_env_wins() {
        env::set_var("RELAY_CONFIG_TEST_EXISTING", "from_env");
        let _ = load_and_apply("relay", None);
        assert_eq!(
            env::var("RELAY_CONFIG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("RELAY_CONFIG_TEST_EXISTING");
    }

    #[test]
    fn load_and_apply_without_any_config_is_ok() {
        let r = load_and_apply("relay-config-nonexistent-app-xyz", None);
        assert!(r.is_ok());
    }

    #[test]
    fn dotenv_wins_over_missing_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "RELAY_CONFIG_TEST_DOTENV=hello\n").unwrap();
        env::remove_var("RELAY_CONFIG_TEST_DOTENV");
        load_and_apply("relay-config-nonexistent-app-xyz", Some(dir.path())).unwrap();
        assert_eq!(
            env::var("RELAY_CONFIG_TEST_DOTENV").as_deref(),
            Ok("hello")
        );
        env::remove_var("RELAY_CONFIG_TEST_DOTENV");
    }
}
