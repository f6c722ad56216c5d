//! Database drivers for protobench.
//!
//! Implements the core [`Driver`](protobench_core::Driver) trait over real
//! client libraries so the same benchmark can run against PostgreSQL and
//! MySQL servers, or against servers emulating their wire protocols.
//!
//! Enable with the `postgres` and `mysql` features (both on by default).

pub mod error;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::Error;

#[cfg(feature = "mysql")]
pub use mysql::MySqlDriver;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
