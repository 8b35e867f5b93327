use std::{io::Write, process::exit, time::Duration};

use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use tokio::runtime::Builder as RuntimeBuilder;
use tracing::log::{self, LevelFilter};

mod helpers;
mod mixing;

/// The default time a test waits on any single delivery
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 120_000; // 2 minutes

/// Settings shared by every mixing test
#[derive(Clone, Debug)]
struct IntegrationTestArgs {
    /// How long to wait on a single delivery before failing
    delivery_timeout: Duration,
}

/// A registered mixing test
#[derive(Clone)]
struct IntegrationTest {
    /// The test's path, e.g. `mixing::test_relay_round`
    pub name: &'static str,
    /// The test body
    pub test_fn: fn(&IntegrationTestArgs) -> Result<(), String>,
}

inventory::collect!(IntegrationTest);

/// Runs full mixing rounds over an in-memory deployment
#[derive(Clone, Parser, Debug)]
struct Args {
    /// Only run tests whose name starts with this prefix
    #[clap(short, long, value_parser)]
    filter: Option<String>,
    /// The delivery timeout in milliseconds
    #[clap(long, value_parser, default_value_t = DEFAULT_DELIVERY_TIMEOUT_MS)]
    timeout_ms: u64,
    /// Log at debug level
    #[clap(short, long, action)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);

    let runtime = RuntimeBuilder::new_multi_thread().enable_all().build().unwrap();
    let delivery_timeout = Duration::from_millis(args.timeout_ms);
    let test_args = IntegrationTestArgs { delivery_timeout };
    let filter = args.filter.unwrap_or_default();

    // Tests drive the cluster with `Handle::block_on`, which must not run on
    // a runtime worker
    let failures = runtime.spawn_blocking(move || {
        println!("\n{}\n", "Running mixing integration tests".blue());

        let mut failures = Vec::new();
        let mut n_run = 0;
        for test in inventory::iter::<IntegrationTest> {
            if !test.name.starts_with(&filter) {
                continue;
            }

            n_run += 1;
            print!("{}... ", test.name);
            if !report((test.test_fn)(&test_args)) {
                failures.push(test.name);
            }
        }

        println!("\n{} run, {} failed", n_run, failures.len());
        failures
    });

    let failures = runtime.block_on(failures).unwrap();
    if !failures.is_empty() {
        log::error!("{} {}", "failed:".red(), failures.join(", "));
        exit(1);
    }

    log::info!("{}", "all mixing tests passed".green());
}

/// Install the logger the nodes report through
fn init_logger(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    Builder::new()
        .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
        .filter(None, level)
        .init();
}

/// Print the outcome of one test, returning whether it passed
fn report(res: Result<(), String>) -> bool {
    match res {
        Ok(()) => {
            println!("{}", "ok".green());
            true
        },
        Err(e) => {
            println!("{}\n\t{e}", "FAILED".red());
            false
        },
    }
}
