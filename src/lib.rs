use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

pub mod calendar;
pub mod entries;
pub mod toggl;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("toggl error: {0}")]
    Client(#[from] toggl::ClientError),
    #[error("project lookup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to resolve project {project_id}: {source}")]
    ProjectLookup { project_id: i64, source: Arc<Error> },
}

/// What to do when a single project lookup fails.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectErrorPolicy {
    /// Fail the whole request.
    #[default]
    Fail,
    /// Treat the entry as having no project.
    Absent,
}

/// Toggl API configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TogglConfig {
    /// Base URL of the Toggl Track API.
    pub api_url: String,
    /// Size of the trailing window of time entries to fetch, in months.
    pub lookback_months: u32,
    /// Timeout for a single request to the Toggl API, in seconds.
    pub timeout_secs: u64,
    /// Behaviour when resolving a project fails.
    #[serde(default)]
    pub project_errors: ProjectErrorPolicy,
}

/// Calendar feed configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CalendarConfig {
    /// The calendar name shown by calendar clients.
    pub name: String,
    /// Domain used to build event UIDs.
    pub domain: String,
    /// Prefix prepended to the task reference found in an entry description.
    pub location_prefix: String,
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerConfig {
    /// Address on which the web server will listen.
    pub listen_addr: SocketAddr,
    /// Number of HTTP workers.
    pub workers: usize,
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Server configuration section.
    pub server: ServerConfig,
    /// Toggl configuration section.
    pub toggl: TogglConfig,
    /// Calendar configuration section.
    pub calendar: CalendarConfig,
}

impl AppConfig {
    /// Loads the application configuration from files in the `config/` directory and environment
    /// variables.
    pub fn load() -> Result<AppConfig> {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::info!("loading configuration using {} environment", app_env);

        let config = Config::builder()
            // Configuration defaults from `config/default.toml`.
            .add_source(File::with_name("config/default"))
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::with_name(&format!("config/{}", app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::with_name("config/local").required(false))
            // Config from environment variables.
            .add_source(Environment::default().separator("__"))
            // Config from environment variables prefixed with `TOGGL_ICAL_`.
            .add_source(
                Environment::with_prefix("TOGGL_ICAL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }
}
