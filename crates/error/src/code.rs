use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following SLUICE-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Connection errors
/// - **2000-2999**: Query execution errors
/// - **3000-3999**: Configuration errors
/// - **5000-5999**: Internal/System errors
/// - **6000-6999**: Schema discovery errors
///
/// Codes are stable across versions (semver contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Connection Errors (1000-1999) ===
    /// SLUICE-1001: Data source id not configured
    SourceNotFound = 1001,
    /// SLUICE-1002: Network connection timeout
    ConnectionTimeout = 1002,
    /// SLUICE-1003: Connection could not be established or was lost
    ConnectionFailed = 1003,
    /// SLUICE-1004: Connection pool exhausted or database busy
    PoolExhausted = 1004,
    /// SLUICE-1005: Source dialect not supported
    UnsupportedSourceType = 1005,

    // === Query Errors (2000-2999) ===
    /// SLUICE-2001: Query failed during execution
    QueryFailed = 2001,
    /// SLUICE-2002: SQL syntax error
    SyntaxError = 2002,
    /// SLUICE-2003: Table not found
    TableNotFound = 2003,
    /// SLUICE-2004: Parameter could not be bound to the statement
    InvalidParameter = 2004,
    /// SLUICE-2005: Caller stopped waiting for a result
    QueryTimeout = 2005,

    // === Configuration Errors (3000-3999) ===
    /// SLUICE-3001: Configuration could not be parsed
    InvalidConfig = 3001,
    /// SLUICE-3002: Configuration failed validation
    SchemaViolation = 3002,
    /// SLUICE-3003: Missing required field in config
    MissingRequiredField = 3003,
    /// SLUICE-3004: Invalid connection string
    InvalidConnectionString = 3004,

    // === Internal Errors (5000-5999) ===
    /// SLUICE-5002: Serialization/deserialization failed
    SerializationFailed = 5002,
    /// SLUICE-5003: Unexpected internal state or panic in a worker
    InternalPanic = 5003,
    /// SLUICE-5004: Feature not implemented
    NotImplemented = 5004,
    /// SLUICE-5005: Scheduler stopped before the query ran
    SchedulerStopped = 5005,
    /// SLUICE-5006: I/O failure on the local host
    IoError = 5006,

    // === Discovery Errors (6000-6999) ===
    /// SLUICE-6001: Discovery aborted at a batch boundary
    DiscoveryAborted = 6001,
    /// SLUICE-6002: A table batch failed after exhausting retries
    BatchFailed = 6002,
    /// SLUICE-6003: A view's columns could not be read
    ViewIntrospectionFailed = 6003,

    /// SLUICE-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "SLUICE-2002")
    pub fn as_str(&self) -> String {
        format!("SLUICE-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Query,
            3000..=3999 => ErrorCategory::Config,
            6000..=6999 => ErrorCategory::Discovery,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("SLUICE-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::SourceNotFound),
            1002 => Ok(Self::ConnectionTimeout),
            1003 => Ok(Self::ConnectionFailed),
            1004 => Ok(Self::PoolExhausted),
            1005 => Ok(Self::UnsupportedSourceType),
            2001 => Ok(Self::QueryFailed),
            2002 => Ok(Self::SyntaxError),
            2003 => Ok(Self::TableNotFound),
            2004 => Ok(Self::InvalidParameter),
            2005 => Ok(Self::QueryTimeout),
            3001 => Ok(Self::InvalidConfig),
            3002 => Ok(Self::SchemaViolation),
            3003 => Ok(Self::MissingRequiredField),
            3004 => Ok(Self::InvalidConnectionString),
            5002 => Ok(Self::SerializationFailed),
            5003 => Ok(Self::InternalPanic),
            5004 => Ok(Self::NotImplemented),
            5005 => Ok(Self::SchedulerStopped),
            5006 => Ok(Self::IoError),
            6001 => Ok(Self::DiscoveryAborted),
            6002 => Ok(Self::BatchFailed),
            6003 => Ok(Self::ViewIntrospectionFailed),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Connection,
    Query,
    Config,
    Internal,
    Discovery,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::SourceNotFound.as_str(), "SLUICE-1001");
        assert_eq!(ErrorCode::SyntaxError.as_str(), "SLUICE-2002");
        assert_eq!(ErrorCode::Unknown.as_str(), "SLUICE-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("SLUICE-1001".to_string()).unwrap(),
            ErrorCode::SourceNotFound
        );
        assert_eq!(
            ErrorCode::try_from("SLUICE-6002".to_string()).unwrap(),
            ErrorCode::BatchFailed
        );
    }

    #[test]
    fn test_error_code_parsing_errors() {
        assert!(ErrorCode::try_from("INVALID".to_string()).is_err());
        assert!(ErrorCode::try_from("SLUICE-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("SLUICE-ABC".to_string()).is_err());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ErrorCode::SourceNotFound.category(),
            ErrorCategory::Connection
        );
        assert_eq!(ErrorCode::QueryFailed.category(), ErrorCategory::Query);
        assert_eq!(ErrorCode::InvalidConfig.category(), ErrorCategory::Config);
        assert_eq!(
            ErrorCode::SchedulerStopped.category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            ErrorCode::DiscoveryAborted.category(),
            ErrorCategory::Discovery
        );
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Internal);
    }
}
