use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;

use ark_bridge::{codec, BridgeConfig, DeviceAddress, DeviceSession, Enumerator, DEFAULT_BAUD};

#[derive(Parser, Debug)]
#[command(name = "ark-scan", about = "Find ARK bridges and talk to the I2C devices behind them")]
struct Args {
    /// Serial port to probe; repeat for several (default: every port)
    #[arg(short, long = "port")]
    ports: Vec<String>,
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    /// First I2C address to scan (e.g., 0x08)
    #[arg(long, default_value = "0x08", value_parser = parse_byte)]
    first: u8,
    /// One past the last I2C address to scan
    #[arg(long, default_value = "0x78", value_parser = parse_byte)]
    last: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List bridges and the I2C devices found on them
    Scan,
    /// Read bytes from one device
    Read {
        #[arg(long, default_value_t = 0)]
        bus: u8,
        #[arg(long, value_parser = parse_byte)]
        addr: u8,
        /// Start register; omit to continue from the device pointer
        #[arg(long, value_parser = parse_byte)]
        reg: Option<u8>,
        #[arg(long, default_value_t = 1)]
        len: usize,
    },
    /// Write hex bytes (e.g., F0 or 9B35) to one device
    Write {
        #[arg(long, default_value_t = 0)]
        bus: u8,
        #[arg(long, value_parser = parse_byte)]
        addr: u8,
        #[arg(long, value_parser = parse_byte)]
        reg: u8,
        data: String,
    },
}

fn parse_byte(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    ark_bridge::init_rust_logging();

    let config = BridgeConfig {
        baud: args.baud,
        ..BridgeConfig::from_env()
    };
    let enumerator = Enumerator::new(config);

    match args.command.unwrap_or(Command::Scan) {
        Command::Scan => {
            let scan = enumerator.enumerate(&args.ports, args.first..args.last);
            for device in &scan.devices {
                println!("{}", device.session().identity());
                for address in device.addresses() {
                    println!("  {}", address);
                }
            }
            for failure in &scan.failures {
                eprintln!("{}: {}", failure.port, failure.error);
            }
            if scan.is_empty() {
                bail!("no devices found");
            }
        }
        Command::Read { bus, addr, reg, len } => {
            let (mut session, target) = open(&enumerator, &args.ports, bus, addr)?;
            let data = session
                .read(&target, reg, len)
                .with_context(|| format!("reading {}", target))?;
            println!("{}", codec::spaced(&data));
            session.close()?;
        }
        Command::Write {
            bus,
            addr,
            reg,
            data,
        } => {
            let payload = codec::hex_to_bytes(&data)?;
            let (mut session, target) = open(&enumerator, &args.ports, bus, addr)?;
            let count = session
                .write(&target, reg, &payload)
                .with_context(|| format!("writing {}", target))?;
            println!("Wrote {} bytes to {}", count, target);
            session.close()?;
        }
    }
    Ok(())
}

/// Find the bridge with a device at (`bus`, `addr`) and release the others.
fn open(
    enumerator: &Enumerator,
    ports: &[String],
    bus: u8,
    addr: u8,
) -> Result<(DeviceSession, DeviceAddress)> {
    let mut chosen = None;
    for device in enumerator.enumerate(ports, [addr]).devices {
        let (mut session, addresses) = device.into_parts();
        match addresses.into_iter().find(|a| a.bus() == bus) {
            Some(target) if chosen.is_none() => chosen = Some((session, target)),
            _ => {
                if let Err(e) = session.close() {
                    warn!("closing {}: {}", session.identity(), e);
                }
            }
        }
    }
    chosen.with_context(|| format!("no device on bus {} at I2C address 0x{:02X}", bus, addr))
}
