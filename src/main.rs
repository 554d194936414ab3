//! Command-line front end
//!
//! Thin wrapper over the library: every subcommand opens the port, runs the
//! handshake, performs its transfer inside a session and ends the session.
//! Errors map to a nonzero exit code.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::error;

use odinflash::{session, ChipType, Destination, Session, UsbPort};

#[derive(Parser)]
#[command(name = "odinflash", version, about = "Flash devices booted into Odin download mode")]
struct Args {
    /// Extra pause after each transfer, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Reboot the device once the operation finishes.
    #[arg(long)]
    reboot: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Check whether a supported device is attached.
    Detect,
    /// Upload a partition table.
    FlashPit {
        /// Partition table file to upload.
        pit: PathBuf,
    },
    /// Download the partition table.
    DownloadPit {
        /// Where to store the downloaded table.
        output: PathBuf,
    },
    /// Upload a firmware file.
    Flash {
        /// Image to upload.
        file: PathBuf,
        /// Where the image goes on the device.
        #[arg(long, value_enum)]
        dest: Dest,
        /// Partition identifier from the device's partition table
        /// (phone destination only).
        #[arg(long)]
        file_id: Option<u32>,
    },
    /// Dump a raw chip region to a file.
    Dump {
        /// Where to store the dump.
        output: PathBuf,
        /// Memory device to dump.
        #[arg(long, value_enum)]
        chip: Chip,
        /// Chip index.
        #[arg(long, default_value_t = 0)]
        chip_id: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Dest {
    Phone,
    Modem,
}

impl From<Dest> for Destination {
    fn from(dest: Dest) -> Self {
        match dest {
            Dest::Phone => Destination::Phone,
            Dest::Modem => Destination::Modem,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Chip {
    Ram,
    Nand,
}

impl From<Chip> for ChipType {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Ram => ChipType::Ram,
            Chip::Nand => ChipType::Nand,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> odinflash::Result<()> {
    if let Cmd::Detect = args.command {
        let id = UsbPort::detect()?;
        println!("device detected: {id}");
        return Ok(());
    }

    let mut port = UsbPort::open(Duration::from_millis(args.delay))?;
    session::initialise(&mut port)?;
    let mut session = Session::begin(&mut port)?;

    let outcome = perform(&mut session, &args.command);

    // Try to end the session even after a failed transfer; the handle is
    // still usable after protocol-level errors.
    let ended = session.end(args.reboot);
    outcome?;
    ended
}

fn perform(session: &mut Session<'_, UsbPort>, command: &Cmd) -> odinflash::Result<()> {
    match command {
        Cmd::Detect => unreachable!("handled before the session opens"),
        Cmd::FlashPit { pit } => {
            let table = std::fs::read(pit)?;
            session.send_pit(&table)
        }
        Cmd::DownloadPit { output } => {
            let table = session.receive_pit()?;
            std::fs::write(output, table)?;
            println!("partition table saved to {}", output.display());
            Ok(())
        }
        Cmd::Flash {
            file,
            dest,
            file_id,
        } => {
            let mut file = File::open(file)?;
            session.send_file(&mut file, (*dest).into(), *file_id, print_percent)?;
            println!();
            Ok(())
        }
        Cmd::Dump {
            output,
            chip,
            chip_id,
        } => {
            let mut out = File::create(output)?;
            session.receive_dump((*chip).into(), *chip_id, &mut out)?;
            println!("dump saved to {}", output.display());
            Ok(())
        }
    }
}

fn print_percent(percent: u32) {
    print!("\r{percent}%");
    let _ = io::stdout().flush();
}
