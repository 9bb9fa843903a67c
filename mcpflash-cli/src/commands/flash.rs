//! Bootloader session command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use mcpflash::port::DEFAULT_BAUD;
use mcpflash::{FlashPlan, FlashReport, Flasher, HexImage, Timing};

use crate::config::Config;
use crate::{Cli, get_port, use_fancy_output};

fn progress_bar(cli: &Cli, visible: bool) -> ProgressBar {
    if !visible || cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Percentage shown for `current` of `total` records.
pub(crate) fn percent(current: usize, total: usize) -> u64 {
    if total == 0 {
        return 100;
    }
    u64::try_from(current * 100 / total).unwrap_or(100)
}

/// Run one bootloader session: version, then run/flash/CRC as requested.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config) -> Result<()> {
    let port = get_port(cli, config)?;
    let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
    let timing = config.timing.apply(Timing::default());

    let image = match &cli.flash_file {
        Some(path) => {
            if !cli.quiet {
                eprintln!("{} Loading {}", style("»").cyan(), path.display());
            }
            let image = HexImage::from_file(path)
                .with_context(|| format!("Failed to load firmware {}", path.display()))?;
            Some(image)
        },
        None => None,
    };

    let plan = FlashPlan {
        image,
        run: cli.run,
        read_crc: cli.read_crc,
    };

    if !cli.quiet {
        eprintln!("{} Using {port} at {baud} baud", style("»").cyan());
    }
    let mut flasher = Flasher::open(&port, baud, timing)?;

    let pb = progress_bar(cli, plan.image.is_some() && !plan.run);
    pb.set_message("Flashing");

    let result = flasher.run(&plan, |current, total| {
        pb.set_position(percent(current, total));
    });

    if let Some(version) = flasher.session().version {
        println!("Bootloader version is {version}");
    }

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            return Err(err.into());
        },
    };
    pb.finish_and_clear();

    print_report(cli, &report);
    Ok(())
}

fn print_report(cli: &Cli, report: &FlashReport) {
    if let Some(crc) = report.crc {
        println!("CRC 0x{crc:04X}");
    }

    if cli.quiet {
        return;
    }

    if report.jumped {
        eprintln!("{} Application started", style("✓").green());
    }
    if report.erase_acknowledged.is_some() {
        eprintln!(
            "{} Flashed {}/{} records",
            style("✓").green(),
            report.records_written,
            report.total_records
        );
    }
}
