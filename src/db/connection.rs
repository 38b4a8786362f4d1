use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::query::QueryExecutor;

/// Database used when a data source does not name one.
pub const DEFAULT_DATABASE: &str = "(default)";

/// Environment variable consulted for a credential blob when a profile does
/// not point at a service-account file.
pub const SERVICE_ACCOUNT_ENV: &str = "DOCFRAME_SERVICE_ACCOUNT";

/// Everything a backend needs to open a connection for one request.
#[derive(Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub project_id: String,
    pub database: Option<String>,
    /// Service-account credential JSON. Never logged.
    pub service_account: Option<String>,
}

impl ConnectOptions {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_service_account(mut self, blob: impl Into<String>) -> Self {
        self.service_account = Some(blob.into());
        self
    }

    pub fn database_id(&self) -> &str {
        self.database
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DATABASE)
    }

    pub fn display_string(&self) -> String {
        format!("{}/{}", self.project_id, self.database_id())
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("project_id", &self.project_id)
            .field("database", &self.database)
            .field(
                "service_account",
                &self.service_account.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectError {
    #[error("project id is required")]
    MissingProjectId,
    #[error("service account: {0}")]
    Credentials(String),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ListError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Metadata access to a document store, used by health checks.
pub trait DocumentStore: Send {
    /// Return the first collection, or `None` when the store has none.
    fn first_collection(&self) -> Result<Option<String>, ListError>;
}

/// Source of executors and stores for a document database.
pub trait DocumentBackend: Send + Sync {
    fn name(&self) -> &str;

    fn executor(&self, options: &ConnectOptions) -> Result<Box<dyn QueryExecutor>, ConnectError>;

    fn store(&self, options: &ConnectOptions) -> Result<Box<dyn DocumentStore>, ConnectError>;
}

/// A saved data source, stored in `datasources.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSourceProfile {
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub database: Option<String>,
    /// Path to a service-account JSON file.
    #[serde(default)]
    pub service_account_path: Option<PathBuf>,
}

impl DataSourceProfile {
    pub fn new(name: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project_id: project_id.into(),
            database: None,
            service_account_path: None,
        }
    }

    /// Build connection options, reading the service-account file if one is
    /// configured and otherwise falling back to [`SERVICE_ACCOUNT_ENV`].
    pub fn connect_options(&self) -> Result<ConnectOptions> {
        self.connect_options_with(std::env::var(SERVICE_ACCOUNT_ENV).ok())
    }

    fn connect_options_with(&self, env_blob: Option<String>) -> Result<ConnectOptions> {
        let service_account = match &self.service_account_path {
            Some(path) => Some(std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read service account file: {}", path.display())
            })?),
            None => env_blob.filter(|b| !b.trim().is_empty()),
        };
        Ok(ConnectOptions {
            project_id: self.project_id.clone(),
            database: self.database.clone(),
            service_account,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedProfiles {
    #[serde(default)]
    datasources: Vec<DataSourceProfile>,
}

pub fn profiles_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docframe")
        .join("datasources.toml")
}

pub fn load_profiles() -> Result<Vec<DataSourceProfile>> {
    load_profiles_from(&profiles_path())
}

pub fn load_profiles_from(path: &Path) -> Result<Vec<DataSourceProfile>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let saved: SavedProfiles =
        toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))?;
    Ok(saved.datasources)
}

pub fn save_profiles_to(path: &Path, profiles: &[DataSourceProfile]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let saved = SavedProfiles {
        datasources: profiles.to_vec(),
    };
    let content = toml::to_string_pretty(&saved)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Save `profile` to `path`, replacing any profile of the same name.
pub fn store_profile(path: &Path, profile: DataSourceProfile) -> Result<()> {
    let mut profiles = load_profiles_from(path)?;
    upsert_profile(&mut profiles, profile);
    save_profiles_to(path, &profiles)
}

fn upsert_profile(profiles: &mut Vec<DataSourceProfile>, profile: DataSourceProfile) {
    match profiles
        .iter_mut()
        .find(|p| p.name.eq_ignore_ascii_case(&profile.name))
    {
        Some(existing) => *existing = profile,
        None => profiles.push(profile),
    }
}

pub fn find_profile<'a>(
    profiles: &'a [DataSourceProfile],
    name: &str,
) -> Option<&'a DataSourceProfile> {
    profiles.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}
