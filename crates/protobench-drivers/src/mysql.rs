//! MySQL driver.
//!
//! Ad-hoc queries use the text protocol (`COM_QUERY`), prepared queries the
//! binary protocol (`COM_STMT_PREPARE` / `COM_STMT_EXECUTE`). Protocol
//! compression is negotiated when the profile asks for it.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Compression, Conn, OptsBuilder, Params, Row, Statement};
use protobench_core::{Connection, ConnectionProfile, Driver, DriverError, QueryOutput, Value};

use crate::error::Error;

/// Default MySQL port.
pub const DEFAULT_PORT: u16 = 3306;

/// Driver for MySQL servers.
#[derive(Debug, Clone, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    /// Create a MySQL driver.
    pub fn new() -> Self {
        Self
    }

    fn opts(profile: &ConnectionProfile) -> Result<OptsBuilder, Error> {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(profile.host())
            .tcp_port(profile.port())
            .user(Some(profile.user()))
            .pass(Some(profile.password()))
            .db_name(profile.database())
            // Stay on TCP so that local and remote servers speak the same protocol
            .prefer_socket(false);

        if profile.compression() {
            let level = match profile.flag("compression_level") {
                Some(level) => {
                    let level = level.parse::<u32>().ok().filter(|l| *l <= 9).ok_or_else(|| {
                        Error::InvalidOption {
                            key: "compression_level".to_string(),
                            message: format!("expected 0-9, got '{}'", level),
                        }
                    })?;
                    Compression::new(level)
                }
                None => Compression::default(),
            };
            opts = opts.compression(level);
        }
        if let Some(prefer) = profile.flag("prefer_socket") {
            opts = opts.prefer_socket(matches!(prefer, "true" | "1"));
        }
        Ok(opts)
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    type Connection = MySqlConnection;

    fn name(&self) -> &str {
        "mysql"
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<MySqlConnection, DriverError> {
        let conn = Conn::new(Self::opts(profile)?).await.map_err(Error::from)?;
        tracing::debug!(
            target = %profile.target(),
            compression = profile.compression(),
            "mysql connection established"
        );
        Ok(MySqlConnection { conn })
    }
}

/// A single MySQL connection.
pub struct MySqlConnection {
    conn: Conn,
}

#[async_trait]
impl Connection for MySqlConnection {
    type Statement = Statement;

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.conn.ping().await.map_err(Error::from)?;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryOutput, DriverError> {
        let rows: Vec<Row> = self.conn.query(sql).await.map_err(Error::from)?;
        Ok(output(rows))
    }

    async fn prepare(&mut self, sql: &str) -> Result<Statement, DriverError> {
        Ok(self.conn.prep(sql).await.map_err(Error::from)?)
    }

    async fn execute(
        &mut self,
        statement: &Statement,
        args: &[Value],
    ) -> Result<QueryOutput, DriverError> {
        let params = if args.is_empty() {
            Params::Empty
        } else {
            Params::Positional(args.iter().map(to_mysql).collect())
        };
        let rows: Vec<Row> = self
            .conn
            .exec(statement, params)
            .await
            .map_err(Error::from)?;
        Ok(output(rows))
    }

    async fn close(self) -> Result<(), DriverError> {
        self.conn.disconnect().await.map_err(Error::from)?;
        Ok(())
    }
}

fn to_mysql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::Int(i64::from(*b)),
        Value::Int(i) => mysql_async::Value::Int(*i),
        Value::Float(f) => mysql_async::Value::Double(*f),
        Value::Text(s) => mysql_async::Value::Bytes(s.clone().into_bytes()),
        Value::Bytes(b) => mysql_async::Value::Bytes(b.clone()),
    }
}

fn from_mysql(value: &mysql_async::Value) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(i) => Value::Int(*i),
        mysql_async::Value::UInt(u) => match i64::try_from(*u) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Text(u.to_string()),
        },
        mysql_async::Value::Float(f) => Value::Float(f64::from(*f)),
        mysql_async::Value::Double(f) => Value::Float(*f),
        mysql_async::Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::Text(text.to_string()),
            Err(_) => Value::Bytes(bytes.clone()),
        },
        other => Value::Text(other.as_sql(true).trim_matches('\'').to_string()),
    }
}

fn output(rows: Vec<Row>) -> QueryOutput {
    let scalar = rows
        .first()
        .and_then(|row| row.as_ref(0))
        .map(from_mysql)
        .unwrap_or_default();
    QueryOutput {
        rows: rows.len() as u64,
        scalar,
    }
}
