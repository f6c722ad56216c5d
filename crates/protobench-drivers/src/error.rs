//! Driver error types.

use protobench_core::DriverError;
use thiserror::Error;

/// Errors raised by the bundled drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// PostgreSQL client error.
    #[cfg(feature = "postgres")]
    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),

    /// MySQL client error.
    #[cfg(feature = "mysql")]
    #[error("mysql: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// The profile asks for something the driver cannot do.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A profile flag has a value the driver does not understand.
    #[error("invalid option '{key}': {message}")]
    InvalidOption { key: String, message: String },
}

impl From<Error> for DriverError {
    fn from(err: Error) -> Self {
        match err {
            #[cfg(feature = "postgres")]
            Error::Postgres(e) => postgres_error(e),
            #[cfg(feature = "mysql")]
            Error::Mysql(e) => mysql_error(e),
            other => DriverError::new(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
fn postgres_error(err: sqlx::Error) -> DriverError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned());
            let driver_err = DriverError::new(db.message());
            match code {
                Some(code) => driver_err.with_code(code),
                None => driver_err,
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            DriverError::connection_lost(format!("postgres: {}", err))
        }
        _ => DriverError::new(format!("postgres: {}", err)),
    }
}

#[cfg(feature = "mysql")]
fn mysql_error(err: mysql_async::Error) -> DriverError {
    match &err {
        mysql_async::Error::Server(server) => {
            DriverError::new(server.message.clone()).with_code(server.code.to_string())
        }
        mysql_async::Error::Io(_)
        | mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed) => {
            DriverError::connection_lost(format!("mysql: {}", err))
        }
        _ => DriverError::new(format!("mysql: {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_maps_to_plain_driver_error() {
        let err: DriverError = Error::Unsupported("compression".to_string()).into();
        assert_eq!(err.message(), "unsupported: compression");
        assert!(!err.is_connection_lost());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_io_error_loses_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: DriverError = Error::from(sqlx::Error::Io(io)).into();
        assert!(err.is_connection_lost());
    }
}
