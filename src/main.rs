//! Host side simulator for the `synci` coordinator.
//!
//! Loads a machine and workload description, runs it through the coordinator and prints the
//! accumulated counters. Exits with a non-zero status when a CPU executed stale instructions, a
//! scripted expectation failed or the machine did not settle.

mod config;
mod logger;
mod machine;
mod workload;

use config::{Config, StressConfig};
use getopts::Options;
use log::LevelFilter;
use machine::Machine;
use synci::{CpuIndex, RegistryError};

/// Used when no config file is given.
pub(crate) const REMOTE_WAKE: &str = include_str!("../configs/remote_wake.toml");

#[derive(Debug)]
pub enum SimError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Args(getopts::Fail),
    Registry(RegistryError),
    /// The description is well formed but does not make sense.
    Config(String),
    /// The CPU does not exist or is not a member of any domain.
    BadCpu(CpuIndex),
    /// A scripted execute found stale instructions.
    Stale { step: usize, cpu: CpuIndex, page: u64 },
    Expectation {
        step: usize,
        counter: &'static str,
        expected: u64,
        actual: u64,
    },
    /// A stress worker panicked.
    Worker(CpuIndex),
    /// Slots were still pending or pages still stale after every CPU passed through user resume.
    Inconsistent,
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimError::Io(e) => write!(f, "{e}"),
            SimError::Parse(e) => write!(f, "bad config: {e}"),
            SimError::Args(e) => write!(f, "{e}"),
            SimError::Registry(e) => write!(f, "bad domain layout: {e}"),
            SimError::Config(s) => write!(f, "bad config: {s}"),
            SimError::BadCpu(cpu) => write!(f, "CPU {cpu} is not online"),
            SimError::Stale { step, cpu, page } => {
                write!(f, "step {step}: CPU {cpu} executed stale page {page:#x}")
            }
            SimError::Expectation {
                step,
                counter,
                expected,
                actual,
            } => write!(f, "step {step}: expected {counter} == {expected}, got {actual}"),
            SimError::Worker(cpu) => write!(f, "worker for CPU {cpu} panicked"),
            SimError::Inconsistent => write!(f, "machine did not settle"),
        }
    }
}

impl std::error::Error for SimError {}

impl From<std::io::Error> for SimError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<toml::de::Error> for SimError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}

impl From<getopts::Fail> for SimError {
    fn from(value: getopts::Fail) -> Self {
        Self::Args(value)
    }
}

impl From<RegistryError> for SimError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

fn main() {
    if let Err(e) = logger::init(LevelFilter::Warn) {
        eprintln!("failed to install logger: {e}");
    }
    match run() {
        Ok(()) => {}
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

fn usage(program: &str, opts: &Options) -> String {
    let brief = format!("Usage: {program} [options] [CONFIG]");
    opts.usage(&brief)
}

fn run() -> Result<(), SimError> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("synci-sim", String::as_str);

    let mut opts = Options::new();
    opts.optopt("c", "config", "machine and workload description", "FILE");
    opts.optflagmulti("v", "verbose", "log more, may be repeated");
    opts.optflag("q", "quiet", "only log errors");
    opts.optflagopt("", "stress", "run a random workload instead of the scripted one", "ITERATIONS");
    opts.optopt("", "seed", "seed for the random workload", "SEED");
    opts.optflag("h", "help", "print this help menu");

    let matches = opts.parse(args.iter().skip(1))?;
    if matches.opt_present("h") {
        print!("{}", usage(program, &opts));
        return Ok(());
    }

    let path = matches.opt_str("c").or_else(|| matches.free.first().cloned());
    let text = match &path {
        Some(p) => std::fs::read_to_string(p)?,
        None => REMOTE_WAKE.to_string(),
    };
    let cfg = Config::parse(&text)?;

    let level = match (matches.opt_count("v"), matches.opt_present("q")) {
        (_, true) => LevelFilter::Error,
        (0, false) => cfg.log_level().unwrap_or(LevelFilter::Warn),
        (1, false) => LevelFilter::Info,
        (2, false) => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    logger::LOGGER.set_level(level);

    let mut stress = cfg.stress.clone();
    if matches.opt_present("stress") {
        let s = stress.get_or_insert_with(StressConfig::default);
        if let Some(n) = matches.opt_str("stress") {
            s.iterations = parse_number("stress", &n)?;
        }
    }
    if let Some(seed) = matches.opt_str("seed") {
        stress.get_or_insert_with(StressConfig::default).seed = parse_number("seed", &seed)?;
    }

    let machine = Machine::from_config(&cfg)?;
    log::info!(
        "{} CPU(s) loaded from {}",
        machine.cpu_count(),
        path.as_deref().unwrap_or("builtin remote wake scenario")
    );

    match &stress {
        Some(s) => {
            logger::LOGGER.set_thread_names(true);
            workload::stress(&machine, s)?;
        }
        None => workload::replay(&machine, &cfg.steps)?,
    }

    print!("{}", machine.coordinator().stats());
    if machine.violations() != 0 {
        log::error!("{} stale execution(s) observed", machine.violations());
        return Err(SimError::Inconsistent);
    }
    Ok(())
}

fn parse_number(name: &str, s: &str) -> Result<u64, SimError> {
    let r = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.map_err(|e| SimError::Config(format!("--{name} {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::parse_number;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("seed", "42").unwrap(), 42);
        assert_eq!(parse_number("seed", "0x2a").unwrap(), 42);
        assert!(parse_number("seed", "forty").is_err());
    }
}
