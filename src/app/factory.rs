use std::sync::Arc;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::{
    app::{
        remote::AppRemote,
        session::{SearchSessionOrchestrator, SessionOptions},
    },
    config::Config,
    progress::WsTransport,
    storage::{self, ResultSlot},
};

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Build a session orchestrator wired to the search API.
    ///
    /// `VDNA_ADDR` overrides the configured API address; `VDNA_BASIC_AUTH`
    /// (`user` or `user:password`) is sent with every HTTP request.
    pub fn create_session(paths: &AppPaths) -> Result<SearchSessionOrchestrator> {
        let mut config = Self::create_config(&paths.base_path)?;

        if let Ok(addr) = std::env::var("VDNA_ADDR") {
            log::info!("Using search api from VDNA_ADDR: {addr}");
            config.api_addr = addr;
            config.validate()?;
        }

        let remote = Arc::new(AppRemote::new(&config.api_addr, Self::parse_basic_auth()));
        let transport = WsTransport::new(&config.api_addr, &config.progress_path)
            .context("failed to build progress channel address")?;
        let results = ResultSlot::new(Arc::new(
            storage::BackendLocal::new(&paths.state_path)
                .context("failed to create state directory")?,
        ));

        Ok(SearchSessionOrchestrator::new(
            remote.clone(),
            remote,
            Arc::new(transport),
            results,
            SessionOptions::from(&config),
        ))
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;
        let state_path = format!("{base_path}/state");

        // Ensure base directory exists
        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths {
            base_path,
            state_path,
        })
    }

    pub fn create_config(base_path: &str) -> Result<Config> {
        Config::load_with(base_path).context("failed to load config")
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<String> {
        if let Ok(base_path) = std::env::var("VDNA_BASE_PATH") {
            return Ok(base_path);
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(format!("{}/.local/share/vdna", home.to_string_lossy()))
    }

    /// Parse basic authentication from environment
    fn parse_basic_auth() -> Option<(String, Option<String>)> {
        let raw = std::env::var("VDNA_BASIC_AUTH").ok()?;
        parse_basic_auth(&raw)
    }
}

fn parse_basic_auth(raw: &str) -> Option<(String, Option<String>)> {
    match raw.split_once(':') {
        None if !raw.is_empty() => Some((raw.to_string(), None)),
        Some((username, password)) if !username.is_empty() => {
            Some((username.to_string(), Some(password.to_string())))
        }
        _ => {
            log::warn!(
                "Invalid VDNA_BASIC_AUTH format. Expected 'username' or 'username:password'"
            );
            None
        }
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: String,
    /// Where the last search result is kept between runs
    pub state_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_auth() {
        assert_eq!(parse_basic_auth("alice"), Some(("alice".to_string(), None)));
        assert_eq!(
            parse_basic_auth("alice:s3:cret"),
            Some(("alice".to_string(), Some("s3:cret".to_string())))
        );
        assert_eq!(parse_basic_auth(":nouser"), None);
        assert_eq!(parse_basic_auth(""), None);
    }

    #[test]
    fn test_create_session_from_fresh_base_path() {
        let tmp = tempfile::tempdir().unwrap();
        let base_path = tmp.path().to_str().unwrap().to_string();
        let paths = AppPaths {
            state_path: format!("{base_path}/state"),
            base_path,
        };

        let session = AppFactory::create_session(&paths).unwrap();
        assert_eq!(
            session.status(),
            crate::app::session::SessionStatus::Idle
        );
        assert!(tmp.path().join("config.yaml").exists());
        assert!(tmp.path().join("state").is_dir());
    }
}
