//! Service settings.
//!
//! Each service keeps a `service.pgdev.yaml` next to its migrations. Every
//! key is optional; a missing file yields the defaults. A handful of
//! environment variables override the file so CI can tweak a run without
//! editing it.

use std::path::{Path, PathBuf};

use pgdev_types::{Endpoint, ServiceIdentity};
use serde::Deserialize;

/// Name of the settings file inside the service location.
pub const SETTINGS_FILE: &str = "service.pgdev.yaml";

/// Default `PostgreSQL` image.
pub const DEFAULT_IMAGE: &str = "postgres:16.1";

/// Port `PostgreSQL` listens on inside its container.
pub const POSTGRES_PORT: u16 = 5432;

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse settings YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override holds a value of the wrong type.
    #[error("invalid value for {var}: {value:?}")]
    InvalidOverride {
        /// Variable name.
        var: String,
        /// Offending value.
        value: String,
    },

    /// An override that must name something is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Settings key.
        field: &'static str,
    },

    /// The service declares no TCP endpoint to publish.
    #[error("service declares no tcp endpoint")]
    NoTcpEndpoint,
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Settings of one database service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServiceSettings {
    /// Database name. Defaults to the service name.
    pub database_name: Option<String>,

    /// Connect without SSL even to non-local addresses.
    pub without_ssl: bool,

    /// Re-apply migrations when their files change.
    pub watch: bool,

    /// Hide container output.
    pub silent: bool,

    /// Keep data across runs in `<location>/data` and leave the container
    /// running on stop.
    pub persist: bool,

    /// Skip migrations entirely.
    pub no_migration: bool,

    /// Migration tool, `sqlx` or `alembic`.
    pub migration_format: String,

    /// Migration directory, relative to the service location.
    pub migrations_dir: PathBuf,

    /// Directory mounted over alembic's `versions/`, relative to the service
    /// location.
    pub migration_version_dir: Option<PathBuf>,

    /// Alternative migration helper image.
    pub migration_image: Option<String>,

    /// Alternative `PostgreSQL` image.
    pub image: Option<String>,

    /// Host port the database is published on.
    pub port: u16,

    /// Declared endpoints.
    pub endpoints: Vec<Endpoint>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            database_name: None,
            without_ssl: false,
            watch: false,
            silent: false,
            persist: false,
            no_migration: false,
            migration_format: String::from("sqlx"),
            migrations_dir: PathBuf::from("migrations"),
            migration_version_dir: None,
            migration_image: None,
            image: None,
            port: POSTGRES_PORT,
            endpoints: vec![Endpoint::tcp()],
        }
    }
}

impl ServiceSettings {
    /// Load settings from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `PGDEV_DATABASE_NAME` overrides `database-name`
    /// - `PGDEV_PORT` overrides `port`
    /// - `PGDEV_WATCH` overrides `watch`
    /// - `PGDEV_NO_MIGRATION` overrides `no-migration`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::InvalidOverride`] for a malformed override.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load `service.pgdev.yaml` from `location`, falling back to defaults
    /// when the file does not exist.
    ///
    /// # Errors
    ///
    /// Same as [`ServiceSettings::from_file`].
    pub fn load(location: &Path) -> Result<Self, ConfigError> {
        let path = location.join(SETTINGS_FILE);
        if path.is_file() {
            Self::from_file(&path)
        } else {
            let mut settings = Self::default();
            settings.apply_env_overrides(|var| std::env::var(var).ok())?;
            Ok(settings)
        }
    }

    /// Parse settings from a YAML string and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::parse_yaml(yaml)?;
        settings.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    /// Parse settings without looking at the environment.
    fn parse_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty or comment-only file deserializes to null.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Option<Self> = serde_yml::from_str(yaml)?;
        Ok(settings.unwrap_or_default())
    }

    /// Override settings with values returned by `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOverride`] when a value cannot be parsed
    /// and [`ConfigError::Empty`] for an empty database name.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PGDEV_DATABASE_NAME") {
            if val.trim().is_empty() {
                return Err(ConfigError::Empty {
                    field: "database-name",
                });
            }
            self.database_name = Some(val);
        }
        if let Some(val) = lookup("PGDEV_PORT") {
            self.port = val.trim().parse().map_err(|_e: std::num::ParseIntError| {
                ConfigError::InvalidOverride {
                    var: String::from("PGDEV_PORT"),
                    value: val.clone(),
                }
            })?;
        }
        if let Some(val) = lookup("PGDEV_WATCH") {
            self.watch = parse_flag("PGDEV_WATCH", &val)?;
        }
        if let Some(val) = lookup("PGDEV_NO_MIGRATION") {
            self.no_migration = parse_flag("PGDEV_NO_MIGRATION", &val)?;
        }
        Ok(())
    }

    /// Database name for `identity`.
    pub fn database_name_for(&self, identity: &ServiceIdentity) -> String {
        self.database_name
            .clone()
            .unwrap_or_else(|| identity.name.clone())
    }

    /// The endpoint the database is published through.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoTcpEndpoint`] if none of the endpoints
    /// speaks TCP.
    pub fn tcp_endpoint(&self) -> Result<&Endpoint, ConfigError> {
        self.endpoints
            .iter()
            .find(|e| e.is_tcp())
            .ok_or(ConfigError::NoTcpEndpoint)
    }

    /// Image override, rejecting blank values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Empty`] if the image is set but blank.
    pub fn image(&self) -> Result<&str, ConfigError> {
        match self.image.as_deref() {
            None => Ok(DEFAULT_IMAGE),
            Some(image) if image.trim().is_empty() => Err(ConfigError::Empty { field: "image" }),
            Some(image) => Ok(image),
        }
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            var: var.to_owned(),
            value: value.to_owned(),
        }),
    }
}
