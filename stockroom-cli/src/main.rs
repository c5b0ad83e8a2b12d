use std::num::NonZeroUsize;
use std::process;

use anyhow::{Context, bail};
use stockroom::{MemoryStore, PoolConfig};
use stockroom_cli::args::{Command, SimulateArgs, USAGE, parse_args};
use stockroom_cli::simulate::run_simulation;
use stockroom_cli::telemetry;

const MEMORY_SCHEME: &str = "memory://";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) if msg.is_empty() => {
            println!("{USAGE}");
            process::exit(0);
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    telemetry::init_tracing();

    if let Err(e) = run(command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Simulate(args) => simulate(args).await,
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let mut config = PoolConfig::load(args.config.as_deref())
        .context("failed to load pool configuration")?;
    if let Some(capacity) = args.capacity.and_then(NonZeroUsize::new) {
        config = config.with_capacity(capacity);
    }
    if !config.connect_target.starts_with(MEMORY_SCHEME) {
        bail!(
            "unsupported connect target '{}', only {MEMORY_SCHEME} stores are built in",
            config.connect_target
        );
    }

    let store = MemoryStore::new();
    let report = run_simulation(store.connector(&config), config, &args)
        .await
        .context("simulation failed")?;

    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{json}");
    Ok(())
}
