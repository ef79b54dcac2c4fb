use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use esploader::{
    run_update, ConnectOptions, Connection, Flasher, ProgressCallbacks, UpdateOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

#[derive(Debug, Parser)]
#[command(about, version)]
struct Args {
    /// Serial port connected to the target device
    #[arg(short = 'p', long, env = "ESPLOADER_PORT")]
    port: String,

    /// Baud rate to connect at
    #[arg(short = 'b', long, default_value = "115200")]
    baud: u32,

    /// Baud rate to switch to for the transfer, on chips that support it
    #[arg(long)]
    flash_baud: Option<u32>,

    /// Flash offset to write the image to
    #[arg(long, value_parser = parse_u32, default_value = "0x0")]
    offset: u32,

    /// Number of sync attempts before giving up
    #[arg(long, default_value = "10")]
    trials: u32,

    /// Skip verifying the written flash contents
    #[arg(long)]
    no_verify: bool,

    /// Delete the image file after a successful update
    #[arg(long)]
    delete_image: bool,

    /// Firmware image to write
    image: PathBuf,
}

fn parse_u32(input: &str) -> Result<u32, std::num::ParseIntError> {
    match input.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

/// Progress bar for the write
#[derive(Default)]
struct CliProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64)
            .with_message(format!("{addr:#x}"))
            .with_style(
                ProgressStyle::with_template(
                    "[{elapsed_precise}] [{wide_bar}] {bytes:>10}/{total_bytes:>10} {msg}",
                )
                .unwrap()
                .progress_chars("=> "),
            );
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

fn main() -> miette::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let connection = Connection::open(&args.port, args.baud)?;
    let mut flasher = Flasher::connect(
        connection,
        ConnectOptions {
            trials: args.trials,
            ..ConnectOptions::default()
        },
    )?;
    info!("Connected to {} on {}", flasher.chip(), args.port);

    if let Some(flash_baud) = args.flash_baud {
        if flash_baud > args.baud && flasher.chip().supports_change_baud() {
            flasher.change_baud(flash_baud)?;
            info!("Baud rate changed to {}", flash_baud);
        }
    }

    let mut progress = CliProgress::default();
    run_update(
        &mut flasher,
        &UpdateOptions {
            image: args.image,
            offset: args.offset,
            verify: !args.no_verify,
            delete_image: args.delete_image,
        },
        Some(&mut progress),
    )?;

    Ok(())
}
