use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use log::{LevelFilter, Log, Metadata, Record};

use rvemu_linux_user::guest_space::GuestSpace;
use rvemu_linux_user::loader::load_program;

/// Load a RISC-V ELF64 executable into guest memory.
#[derive(Parser, Debug)]
#[command(name = "rvemu", version, about)]
struct Cli {
    /// Guest executable.
    program: PathBuf,

    /// Arguments for the guest program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Size of the reserved guest address space, in MiB.
    #[arg(long, default_value_t = 1024)]
    guest_size: usize,

    /// More log output (-v debug, -vv trace). Overrides RVEMU_LOG.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Plain stderr logger.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => env::var("RVEMU_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LevelFilter::Warn),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let space = match cli
        .guest_size
        .checked_mul(1 << 20)
        .map(GuestSpace::with_size)
    {
        Some(Ok(space)) => space,
        Some(Err(e)) => {
            eprintln!("rvemu: failed to reserve guest space: {e}");
            return ExitCode::from(2);
        }
        None => {
            eprintln!("rvemu: guest size {} MiB too large", cli.guest_size);
            return ExitCode::from(2);
        }
    };

    let mmu = match load_program(&cli.program, &space) {
        Ok(mmu) => mmu,
        Err(e) => {
            eprintln!("rvemu: {}: {e}", cli.program.display());
            return e.exit_code();
        }
    };
    log::debug!("guest argv: {:?}", cli.args);

    println!("entry: {:#x}", mmu.entry);
    println!("alloc: {:#x}", mmu.base);
    ExitCode::SUCCESS
}
