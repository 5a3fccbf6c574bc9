//! proxy-orchestra - runs every line of a task file through a pool of workers,
//! each bound to one proxy from a proxy file.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use eyre::{Result, WrapErr};
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxy_orchestra::{
  load_lines, parse_worker_count, prompt_worker_count, DispatchConfig, PoolOptions, ProcessError, ResourcePool,
  ScanPolicy, Task, WorkerSupervisor,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanArg {
  Monotonic,
  Wraparound,
}

impl From<ScanArg> for ScanPolicy {
  fn from(arg: ScanArg) -> Self {
    match arg {
      ScanArg::Monotonic => ScanPolicy::Monotonic,
      ScanArg::Wraparound => ScanPolicy::Wraparound,
    }
  }
}

#[derive(Debug, Parser)]
#[command(name = "proxy-orchestra", about = "Process a batch of tasks over a pool of proxies", version)]
struct Cli {
  /// Line-delimited list of proxies
  #[arg(long, default_value = "proxies.txt")]
  resources: PathBuf,

  /// Line-delimited list of task payloads
  #[arg(long, default_value = "input.txt")]
  tasks: PathBuf,

  /// Maximum number of workers (prompted for when omitted)
  #[arg(short, long)]
  workers: Option<String>,

  /// Delay before a failed task is redelivered, in milliseconds
  #[arg(long, default_value_t = 2000)]
  retry_delay_ms: u64,

  /// Cooldown for a rate-limited proxy, in milliseconds
  #[arg(long, default_value_t = 60_000)]
  cooldown_ms: u64,

  /// How the proxy scan moves over the list
  #[arg(long, value_enum, default_value = "monotonic")]
  scan: ScanArg,

  /// Enable debug output
  #[arg(short, long)]
  verbose: bool,
}

/// `-v` forces debug output; otherwise `RUST_LOG` decides, falling back to info.
fn log_directives(verbose: bool, rust_log: Option<&str>) -> String {
  match (verbose, rust_log.map(str::trim)) {
    (true, _) => "debug".to_string(),
    (false, Some(directives)) if !directives.is_empty() => directives.to_string(),
    (false, _) => "info".to_string(),
  }
}

fn setup_logging(verbose: bool) {
  let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
  let directives = log_directives(verbose, rust_log.as_deref());
  let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_target(false).with_env_filter(filter).init();
}

/// Stand-in processor: logs the attempt and takes a second.
async fn demo_process(task: Task, proxy: String) -> Result<(), ProcessError> {
  info!(%proxy, %task, "Processing");
  tokio::time::sleep(Duration::from_secs(1)).await;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  setup_logging(cli.verbose);

  let proxies = load_lines(&cli.resources).wrap_err("Failed loading proxies")?;
  let inputs = load_lines(&cli.tasks).wrap_err("Failed loading tasks")?;

  let worker_count = match &cli.workers {
    Some(text) => parse_worker_count(text),
    None => prompt_worker_count(&mut io::stdin().lock(), &mut io::stdout()).wrap_err("Failed reading worker count")?,
  };

  let pool = ResourcePool::spawn(
    "proxies",
    proxies,
    PoolOptions::default().with_scan_policy(cli.scan.into()),
    Handle::current(),
  );
  let config = DispatchConfig::default()
    .with_worker_count(worker_count)
    .with_retry_delay(Duration::from_millis(cli.retry_delay_ms))
    .with_rate_limit_cooldown(Duration::from_millis(cli.cooldown_ms));

  let supervisor = WorkerSupervisor::new("proxy_orchestra", pool.clone(), demo_process, config, Handle::current());
  let tasks = inputs.into_iter().map(Task::from).collect();
  let report = supervisor.run(tasks).await?;

  pool.shutdown().await;
  info!(
    processed = report.processed(),
    dropped = report.retry.dropped.len(),
    unsettled = report.unsettled,
    "Run complete."
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rust_log_is_used_as_is_without_verbose() {
    assert_eq!(
      log_directives(false, Some("warn,proxy_orchestra=trace")),
      "warn,proxy_orchestra=trace"
    );
  }

  #[test]
  fn falls_back_to_info_when_rust_log_is_missing_or_blank() {
    assert_eq!(log_directives(false, None), "info");
    assert_eq!(log_directives(false, Some("  ")), "info");
  }

  #[test]
  fn verbose_flag_wins() {
    assert_eq!(log_directives(true, Some("warn")), "debug");
    assert_eq!(log_directives(true, None), "debug");
  }
}
