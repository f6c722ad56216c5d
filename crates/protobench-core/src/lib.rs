//! Protobench Core - orchestration and measurement for database client benchmarks.
//!
//! This crate measures what individual protocol choices cost a database
//! client: compressed vs. plain transport, ad-hoc vs. prepared execution,
//! native vs. emulating servers. Each choice is a [`ConnectionProfile`] or an
//! [`OperationSpec`]; the [`BenchmarkRunner`] drives one against the other and
//! the [`Comparator`] lines the results up.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use protobench_core::{
//!     BenchmarkRunner, Comparator, ComparatorConfig, ConnectionProfile, MockDriver,
//!     OperationSpec, RunConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = BenchmarkRunner::new(Arc::new(MockDriver::new()), RunConfig::sequential(1000));
//!     let mut comparator = Comparator::new(ComparatorConfig::default());
//!
//!     for compress in [false, true] {
//!         let profile = ConnectionProfile::builder("localhost", 3306)
//!             .user("root")
//!             .compression(compress)
//!             .build()?;
//!         let result = runner.run(profile, OperationSpec::scalar("select repeat('a', 1000)")).await?;
//!         comparator.add(if compress { "compressed" } else { "plain" }, result)?;
//!     }
//!
//!     let report = comparator.report()?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```

pub mod compare;
pub mod driver;
pub mod error;
pub mod mock;
pub mod operation;
pub mod pool;
pub mod profile;
pub mod runner;
pub mod session;
pub mod stats;
pub mod value;

pub use compare::{Comparator, ComparatorConfig, ComparisonReport, ReportEntry};
pub use driver::{Connection, Driver, DriverError, QueryOutput};
pub use error::{Error, ErrorKind, Result};
pub use mock::MockDriver;
pub use operation::{AcquireTiming, OperationDriver, OperationSpec, Sample, SampleFailure};
pub use pool::{ConnectionPool, PooledConnection};
pub use profile::{ConnectionProfile, PoolLimits, ProfileBuilder, ProtocolOptions};
pub use runner::{BenchmarkRunner, CancelHandle, RunConfig, RunResult, RunState, StopReason};
pub use session::{PreparedHandle, Session};
pub use stats::{format_latency, Summary};
pub use value::Value;
