//! Protobench Command-Line Client
//!
//! Runs benchmark plans against PostgreSQL or MySQL servers (or protocol
//! emulators) and prints a side-by-side comparison.

mod formatter;
mod plan;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use formatter::OutputFormat;
use plan::{DriverKind, Plan, Preset};
use protobench_core::runner::{DEFAULT_ITERATIONS, DEFAULT_MIN_SAMPLES};
use protobench_core::{
    AcquireTiming, BenchmarkRunner, CancelHandle, Comparator, ComparatorConfig, ComparisonReport,
    Driver, MockDriver, OperationSpec, RunConfig, Value,
};
use protobench_drivers::{MySqlDriver, PostgresDriver};

/// Protobench Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "protobench")]
#[command(version, about = "Compare database client protocol choices")]
pub struct Args {
    /// Benchmark plan (JSON); overrides every other benchmark option
    #[arg(short = 'p', long, env = "PROTOBENCH_PLAN")]
    pub plan: Option<PathBuf>,

    /// Built-in benchmark suite
    #[arg(long, value_enum, default_value = "query-vs-bind")]
    pub preset: Preset,

    /// Driver to benchmark through
    #[arg(short = 'd', long, value_enum, default_value = "mysql", env = "PROTOBENCH_DRIVER")]
    pub driver: DriverKind,

    /// Connection URL (defaults to the local `protocols` database)
    #[arg(short = 'u', long, env = "PROTOBENCH_URL")]
    pub url: Option<String>,

    /// Connection URL of the protocol emulator for `native-vs-emulated`
    #[arg(long, env = "PROTOBENCH_EMULATED_URL")]
    pub emulated_url: Option<String>,

    /// Benchmark a single SQL statement instead of a preset
    #[arg(long)]
    pub sql: Option<String>,

    /// Run `--sql` as a prepared statement
    #[arg(long, requires = "sql")]
    pub prepared: bool,

    /// Argument bound to the prepared statement (repeatable)
    #[arg(long = "arg", requires = "prepared")]
    pub args: Vec<String>,

    /// Expected value of the first column
    #[arg(long, requires = "sql")]
    pub expect: Option<String>,

    /// Timed iterations per benchmark [default: 1000 unless --duration is set]
    #[arg(short = 'n', long, env = "PROTOBENCH_ITERATIONS")]
    pub iterations: Option<u64>,

    /// Untimed warmup iterations
    #[arg(long, default_value_t = 10, env = "PROTOBENCH_WARMUP")]
    pub warmup: u64,

    /// Concurrent workers
    #[arg(short = 'c', long, default_value_t = 1, env = "PROTOBENCH_CONCURRENCY")]
    pub concurrency: usize,

    /// Stop each benchmark after this many seconds; with `-n` as well,
    /// whichever limit is reached first ends the run
    #[arg(long, env = "PROTOBENCH_DURATION")]
    pub duration: Option<u64>,

    /// Per-operation timeout in milliseconds
    #[arg(long, env = "PROTOBENCH_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Include pool acquisition in each sample
    #[arg(long)]
    pub include_acquire: bool,

    /// Abort a benchmark when more than this fraction of operations fail
    #[arg(long)]
    pub max_error_rate: Option<f64>,

    /// Allowed spread between sample counts, in percent
    #[arg(long, default_value_t = 0.0, env = "PROTOBENCH_TOLERANCE")]
    pub tolerance: f64,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        let iterations = match (self.iterations, self.duration) {
            (Some(n), _) => Some(n),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_ITERATIONS),
        };
        let mut config = RunConfig::default()
            .with_concurrency(self.concurrency)
            .with_iterations(iterations)
            .with_warmup(self.warmup)
            .with_duration(self.duration.map(Duration::from_secs))
            .with_timeout(self.timeout_ms.map(Duration::from_millis));
        if self.include_acquire {
            config = config.with_acquire_timing(AcquireTiming::Included);
        }
        if let Some(rate) = self.max_error_rate {
            config = config.with_max_error_rate(rate, DEFAULT_MIN_SAMPLES);
        }
        config
    }

    fn plan(&self) -> Result<Plan, plan::PlanError> {
        if let Some(path) = &self.plan {
            return Plan::load(path);
        }

        let url = self
            .url
            .as_deref()
            .unwrap_or_else(|| self.driver.default_url());
        let comparator = ComparatorConfig::default().with_tolerance_pct(self.tolerance);

        match &self.sql {
            Some(sql) => {
                let mut operation = if self.prepared {
                    OperationSpec::prepared(sql.as_str(), self.args.iter().map(|a| parse_arg(a)).collect())
                } else {
                    OperationSpec::scalar(sql.as_str())
                };
                if let Some(expected) = &self.expect {
                    operation = operation.expecting(parse_arg(expected));
                }
                let label = if self.prepared { "prepared" } else { "query" };
                Ok(Plan::single(
                    self.driver,
                    url,
                    label,
                    operation,
                    self.run_config(),
                    comparator,
                ))
            }
            None => Plan::preset(
                self.preset,
                self.driver,
                url,
                self.emulated_url.as_deref(),
                self.run_config(),
                comparator,
            ),
        }
    }
}

/// Integers bind as integers, everything else as text.
fn parse_arg(arg: &str) -> Value {
    match arg.parse::<i64>() {
        Ok(i) => Value::Int(i),
        Err(_) => Value::Text(arg.to_string()),
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing; logs go to stderr so reports on stdout stay parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("protobench=info")),
        )
        .init();

    let args = Args::parse();
    let formatter = formatter::create_formatter(args.format);

    if let Err(e) = run(args).await {
        eprintln!("{}", formatter.format_error(&e.to_string()));
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let plan = args.plan()?;
    let formatter = formatter::create_formatter(args.format);

    let cancel = CancelHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, draining in-flight operations");
            on_signal.cancel();
        }
    });

    let report = match plan.driver {
        DriverKind::Postgres => execute(PostgresDriver::new(), &plan, &cancel).await?,
        DriverKind::Mysql => execute(MySqlDriver::new(), &plan, &cancel).await?,
        DriverKind::Mock => {
            let driver = MockDriver::new()
                .with_scalar(123)
                .with_latency(Duration::from_micros(200))
                .with_jitter(Duration::from_micros(100));
            execute(driver, &plan, &cancel).await?
        }
    };

    println!("{}", formatter.format_report(&report));
    Ok(())
}

/// Run every benchmark of the plan in order and compare the results.
///
/// A benchmark that cannot start (refused connection, failed prepare) is
/// skipped; the others still run and are compared.
async fn execute<D: Driver>(
    driver: D,
    plan: &Plan,
    cancel: &CancelHandle,
) -> Result<ComparisonReport, Box<dyn std::error::Error>> {
    let driver = Arc::new(driver);
    let mut comparator = Comparator::new(plan.comparator);
    let mut skipped = Vec::new();

    for bench in plan.resolve()? {
        if cancel.is_cancelled() {
            break;
        }
        let runner = BenchmarkRunner::new(driver.clone(), bench.config)
            .with_cancel_handle(cancel.clone());
        match runner.run(bench.profile, bench.operation).await {
            Ok(result) => comparator.add(bench.label, result)?,
            Err(e) => {
                tracing::error!(label = %bench.label, error = %e, "benchmark skipped");
                skipped.push(bench.label);
            }
        }
    }

    if comparator.is_empty() {
        return Err(format!("no benchmark could run (skipped: {})", skipped.join(", ")).into());
    }
    if !skipped.is_empty() {
        tracing::warn!(skipped = ?skipped, "some benchmarks did not run");
    }
    Ok(comparator.report()?)
}
