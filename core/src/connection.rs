//! Database connection target.
//!
//! A [`ConnectionTarget`] is built once from configuration and never changes. The
//! bootstrap owns it and hands it by reference to whatever opens connections.
//!
//! Its `Debug` and `Display` output never contain the password.

use crate::config::{self, ConfigError};
use std::fmt;

/// Environment keys read by [`ConnectionTarget::from_lookup`].
pub mod keys {
    /// Database user (required)
    pub const USER: &str = "BILLING_DB_USER";
    /// Database password (required)
    pub const PASSWORD: &str = "BILLING_DB_PASSWORD";
    /// Database name (required)
    pub const NAME: &str = "BILLING_DB_NAME";
    /// Database host (default [`super::DEFAULT_HOST`])
    pub const HOST: &str = "BILLING_DB_HOST";
    /// Database port (default [`super::DEFAULT_PORT`])
    pub const PORT: &str = "BILLING_DB_PORT";
}

/// Host used when `BILLING_DB_HOST` is not set.
pub const DEFAULT_HOST: &str = "billing-db";

/// Port used when `BILLING_DB_PORT` is not set.
pub const DEFAULT_PORT: u16 = 5432;

/// Coordinates of the billing database.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
}

impl ConnectionTarget {
    /// Create a target from explicit parts.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    /// Build a target from the process environment.
    ///
    /// # Errors
    ///
    /// See [`ConnectionTarget::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a target from an arbitrary key/value lookup.
    ///
    /// User, password and database name are required; host and port fall back to
    /// [`DEFAULT_HOST`] and [`DEFAULT_PORT`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for an absent required key and
    /// [`ConfigError::Invalid`] for a port that is not a valid `u16`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            user: config::required(&lookup, keys::USER)?,
            password: config::required(&lookup, keys::PASSWORD)?,
            database: config::required(&lookup, keys::NAME)?,
            host: config::optional(&lookup, keys::HOST).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: config::parsed_or(&lookup, keys::PORT, DEFAULT_PORT)?,
        })
    }

    /// Database host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Database port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Database user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Database password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Full connection URI, credentials included.
    ///
    /// Format: `postgresql://<user>:<password>@<host>:<port>/<dbname>`
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Connection URI with the password masked, safe for logs.
    #[must_use]
    pub fn redacted_uri(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted_uri())
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}
