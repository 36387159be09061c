use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

// Connection strings routinely embed passwords; never echo them back.
fn serialize_secret<S>(_secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("[REDACTED]")
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(SecretString::from(s))
}

/// Database engine behind a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// A relational data source that can be queried and introspected.
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
pub struct SourceConfig {
    #[validate(length(min = 1))]
    pub id: String,

    pub dialect: Dialect,

    /// Postgres connection URL or SQLite file path.
    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub connection: SecretString,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, dialect: Dialect, connection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dialect,
            connection: SecretString::from(connection.into()),
        }
    }

    pub fn connection_string(&self) -> &str {
        self.connection.expose_secret()
    }
}
