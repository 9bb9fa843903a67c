//! mcpflash CLI - Command-line tool for Microchip serial bootloaders.
//!
//! ## Features
//!
//! - Read the bootloader version
//! - Erase and program a hex firmware image
//! - Read back a flash CRC
//! - Jump to the application
//! - Environment variable and config file support

use clap::Parser;
use console::style;
use env_logger::Env;
use log::debug;
use mcpflash::CrcRange;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod commands;
mod config;

use config::{Config, ConfigError};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// mcpflash - Flash Microchip PIC devices through the serial bootloader.
///
/// Environment variables:
///   MCPFLASH_PORT   - Default serial port
///   MCPFLASH_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "mcpflash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port the bootloader is attached to.
    #[arg(env = "MCPFLASH_PORT")]
    port: Option<String>,

    /// Hex image to erase and program.
    #[arg(short, long, value_name = "PATH")]
    flash_file: Option<PathBuf>,

    /// Start the application after reading the version.
    #[arg(long)]
    run: bool,

    /// Read the device CRC over a hex address range, e.g. 9D000000:1000.
    #[arg(long, value_name = "ADDR:LEN", value_parser = parse_crc_range)]
    read_crc: Option<CrcRange>,

    /// Baud rate.
    #[arg(short, long, env = "MCPFLASH_BAUD")]
    baud: Option<u32>,

    /// List available serial ports and exit.
    #[arg(long)]
    list_ports: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
}

/// Errors classified for exit codes.
#[derive(Debug, Error)]
enum CliError {
    /// The command line is incomplete.
    #[error("{0}")]
    Usage(String),

    /// An explicitly requested config file is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Exit code for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
        };
    }

    match err.downcast_ref::<mcpflash::Error>() {
        Some(mcpflash::Error::TransportOpen { .. }) => 4,
        Some(mcpflash::Error::Interrupted) => 130,
        _ => 1,
    }
}

/// Parse `ADDR:LEN`, both hexadecimal with an optional `0x` prefix.
fn parse_crc_range(s: &str) -> Result<CrcRange, String> {
    let (address, length) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ADDR:LEN, got '{s}'"))?;

    Ok(CrcRange {
        address: parse_hex(address)?,
        length: parse_hex(length)?,
    })
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{s}' is not a hexadecimal number"));
    }
    u32::from_str_radix(digits, 16).map_err(|e| format!("'{s}': {e}"))
}

/// Resolve the serial port from the command line, environment or config.
fn get_port(cli: &Cli, config: &Config) -> anyhow::Result<String> {
    cli.port
        .clone()
        .or_else(|| config.connection.serial.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "No serial port given (pass PORT, set MCPFLASH_PORT or connection.serial)".into(),
            )
            .into()
        })
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    if cli.list_ports {
        return commands::ports::cmd_list_ports();
    }

    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path).map_err(CliError::from)?,
        None => Config::load(),
    };

    commands::flash::cmd_flash(cli, &config)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(2));
        },
    };

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);

    debug!(
        "mcpflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    mcpflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flash_invocation() {
        let cli = Cli::try_parse_from([
            "mcpflash",
            "/dev/ttyUSB0",
            "-f",
            "app.hex",
            "--read-crc",
            "9D000000:1000",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.flash_file, Some(PathBuf::from("app.hex")));
        assert_eq!(
            cli.read_crc,
            Some(CrcRange {
                address: 0x9D00_0000,
                length: 0x1000,
            })
        );
        assert_eq!(cli.verbose, 2);
        assert!(!cli.run);
    }

    #[test]
    fn test_parse_crc_range() {
        assert_eq!(
            parse_crc_range("0x1000:0X20"),
            Ok(CrcRange {
                address: 0x1000,
                length: 0x20,
            })
        );
        assert!(parse_crc_range("1000").is_err());
        assert!(parse_crc_range("1000:").is_err());
        assert!(parse_crc_range("+10:10").is_err());
        assert!(parse_crc_range("100000000:1").is_err());
    }

    #[test]
    fn test_get_port_prefers_command_line() {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyACM0".into());

        let cli = Cli::try_parse_from(["mcpflash", "COM3"]).unwrap();
        assert_eq!(get_port(&cli, &config).unwrap(), "COM3");
    }

    #[test]
    fn test_missing_port_is_usage_error() {
        let cli = Cli {
            port: None,
            flash_file: None,
            run: false,
            read_crc: None,
            baud: None,
            list_ports: false,
            verbose: 0,
            quiet: false,
            config_path: None,
        };

        let err = get_port(&cli, &Config::default()).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_exit_codes() {
        let open = anyhow::Error::from(mcpflash::Error::TransportOpen {
            port: "COM9".into(),
            reason: "not found".into(),
        });
        assert_eq!(exit_code(&open), 4);

        let interrupted = anyhow::Error::from(mcpflash::Error::Interrupted);
        assert_eq!(exit_code(&interrupted), 130);

        let timeout = anyhow::Error::from(mcpflash::Error::Timeout("no response".into()));
        assert_eq!(exit_code(&timeout), 1);

        let config = anyhow::Error::from(CliError::Config(ConfigError::Read {
            path: PathBuf::from("missing.toml"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }));
        assert_eq!(exit_code(&config), 3);
    }
}
