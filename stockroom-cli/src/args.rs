//! Command-line parsing.

use std::path::PathBuf;
use std::time::Duration;

pub const USAGE: &str = "\
Usage: stockroom simulate [options]

Seeds one offer, races requesters against it through a shared connection
pool and prints a JSON report on stdout.

Options:
  --config <file>            Pool configuration (JSON)
  --capacity <n>             Pool capacity, overrides config and environment
  --quantity <n>             Units on the seeded offer [default: 10]
  --requesters <n>           Concurrent requesters [default: 50]
  --attempts <n>             Redemption attempts per requester [default: 1]
  --offer-days <n>           Days until the seeded offer expires [default: 30]
  --sweep-interval-ms <ms>   Run the expiration sweep on this interval";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Simulate(SimulateArgs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulateArgs {
    pub config: Option<PathBuf>,
    pub capacity: Option<usize>,
    pub quantity: u32,
    pub requesters: usize,
    pub attempts: usize,
    pub offer_days: u32,
    pub sweep_interval: Option<Duration>,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            config: None,
            capacity: None,
            quantity: 10,
            requesters: 50,
            attempts: 1,
            offer_days: 30,
            sweep_interval: None,
        }
    }
}

/// Parse `argv`. An empty error message means help was requested.
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    // argv[0] is the binary
    match args.get(1).map(String::as_str) {
        Some("simulate") => {}
        Some("--help" | "-h") => return Err(String::new()),
        Some(other) => return Err(format!("unknown command: {other}")),
        None => return Err("missing command".to_string()),
    }

    let mut i = 2;

    let mut sim = SimulateArgs::default();
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" => sim.config = Some(PathBuf::from(value(args, &mut i, flag)?)),
            "--capacity" => {
                let capacity = parse_number(flag, value(args, &mut i, flag)?)?;
                if capacity == 0 {
                    return Err("--capacity must be positive".to_string());
                }
                sim.capacity = Some(capacity);
            }
            "--quantity" => sim.quantity = parse_number(flag, value(args, &mut i, flag)?)?,
            "--requesters" => sim.requesters = parse_number(flag, value(args, &mut i, flag)?)?,
            "--attempts" => sim.attempts = parse_number(flag, value(args, &mut i, flag)?)?,
            "--offer-days" => sim.offer_days = parse_number(flag, value(args, &mut i, flag)?)?,
            "--sweep-interval-ms" => {
                let ms: u64 = parse_number(flag, value(args, &mut i, flag)?)?;
                if ms == 0 {
                    return Err("--sweep-interval-ms must be positive".to_string());
                }
                sim.sweep_interval = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Command::Simulate(sim))
}

/// Value following `flag`, advancing the cursor past it.
fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("{flag} expects a non-negative integer, got '{raw}'"))
}
