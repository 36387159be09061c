use crate::{ErrorCode, SluiceError};

impl From<tokio_postgres::Error> for SluiceError {
    fn from(err: tokio_postgres::Error) -> Self {
        let Some(db_err) = err.as_db_error() else {
            // No server-side error: the socket, TLS or protocol layer failed.
            return SluiceError::new(ErrorCode::ConnectionFailed, err.to_string());
        };

        let state = db_err.code().code();
        let code = match state {
            s if s.starts_with("08") => ErrorCode::ConnectionFailed,
            s if s.starts_with("53") => ErrorCode::PoolExhausted,
            "57P01" | "57P02" | "57P03" => ErrorCode::ConnectionFailed,
            "57014" => ErrorCode::ConnectionTimeout,
            "42P01" => ErrorCode::TableNotFound,
            "42601" => ErrorCode::SyntaxError,
            "22P02" | "42804" => ErrorCode::InvalidParameter,
            _ => ErrorCode::QueryFailed,
        };
        SluiceError::new(code, db_err.message().to_string())
            .with_hint(format!("SQLSTATE {}", state))
    }
}

impl From<deadpool_postgres::PoolError> for SluiceError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        use deadpool_postgres::PoolError;
        if matches!(err, PoolError::Timeout(_)) {
            return SluiceError::new(ErrorCode::PoolExhausted, err.to_string());
        }
        match err {
            PoolError::Backend(e) => SluiceError::from(e),
            other => SluiceError::new(ErrorCode::ConnectionFailed, other.to_string()),
        }
    }
}

impl From<deadpool_sqlite::PoolError> for SluiceError {
    fn from(err: deadpool_sqlite::PoolError) -> Self {
        use deadpool_sqlite::PoolError;
        if matches!(err, PoolError::Timeout(_)) {
            return SluiceError::new(ErrorCode::PoolExhausted, err.to_string());
        }
        match err {
            PoolError::Backend(e) => SluiceError::from(e),
            other => SluiceError::new(ErrorCode::ConnectionFailed, other.to_string()),
        }
    }
}

impl From<deadpool_sqlite::InteractError> for SluiceError {
    fn from(err: deadpool_sqlite::InteractError) -> Self {
        match err {
            deadpool_sqlite::InteractError::Panic(payload) => {
                SluiceError::panicked("SQLite task", payload.as_ref())
            }
            deadpool_sqlite::InteractError::Aborted => {
                SluiceError::new(ErrorCode::ConnectionFailed, "SQLite task was aborted")
            }
        }
    }
}

impl From<rusqlite::Error> for SluiceError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode as SqliteCode;
        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked => ErrorCode::PoolExhausted,
                SqliteCode::CannotOpen | SqliteCode::NotADatabase => ErrorCode::ConnectionFailed,
                _ => ErrorCode::QueryFailed,
            },
            rusqlite::Error::InvalidParameterName(_)
            | rusqlite::Error::InvalidParameterCount(_, _)
            | rusqlite::Error::ToSqlConversionFailure(_) => ErrorCode::InvalidParameter,
            _ => ErrorCode::QueryFailed,
        };
        SluiceError::new(code, err.to_string())
    }
}

impl From<std::io::Error> for SluiceError {
    fn from(err: std::io::Error) -> Self {
        SluiceError::new(ErrorCode::IoError, err.to_string())
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<tokio::task::JoinError> for SluiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        SluiceError::new(ErrorCode::InternalPanic, err.to_string())
    }
}
