//! Minimal CLI front-end for manually activating and exercising a CoW
//! target, in the spirit of the pack's small hand-rolled-argument-parsing
//! binaries (`nbdclient.rs`/`nbdsrv.rs`) rather than pulling in a
//! CLI-parsing crate for a handful of subcommands.

use std::env;
use std::process::ExitCode;

use cowtarget::Target;
use tracing::{error, info};

fn usage() -> &'static str {
    "usage: cowtargetctl <origin-path> <cow-path> <command> [args...]\n\
     commands:\n\
     \x20 read <sector> <length-bytes>\n\
     \x20 write <sector> <hex-byte>  (fills length-bytes with the repeated byte)"
}

fn init_tracing() {
    // RUST_LOG-driven, matching wormhole/src/bin/server/main.rs's
    // `tracing_subscriber::fmt()...init()` pattern.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("{}", usage());
        return ExitCode::FAILURE;
    }

    let target = match Target::activate(&args[0], &args[1]) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "activation failed");
            return ExitCode::FAILURE;
        }
    };

    let result = match args[2].as_str() {
        "read" if args.len() == 5 => run_read(&target, &args[3], &args[4]),
        "write" if args.len() == 5 => run_write(&target, &args[3], &args[4]),
        _ => {
            eprintln!("{}", usage());
            target.shutdown();
            return ExitCode::FAILURE;
        }
    };

    target.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn run_read(target: &Target, sector: &str, length: &str) -> cowtarget::Result<()> {
    let sector: u64 = sector.parse().map_err(|_| {
        cowtarget::Error::InvalidArgument(format!("not a sector number: {sector}"))
    })?;
    let length: usize = length.parse().map_err(|_| {
        cowtarget::Error::InvalidArgument(format!("not a byte length: {length}"))
    })?;
    let mut buf = vec![0u8; length];
    target.read(sector, &mut buf)?;
    info!(sector, length, "read ok");
    println!("{}", hex_encode(&buf));
    Ok(())
}

fn run_write(target: &Target, sector: &str, fill_byte: &str) -> cowtarget::Result<()> {
    let sector: u64 = sector.parse().map_err(|_| {
        cowtarget::Error::InvalidArgument(format!("not a sector number: {sector}"))
    })?;
    let byte = u8::from_str_radix(fill_byte.trim_start_matches("0x"), 16).map_err(|_| {
        cowtarget::Error::InvalidArgument(format!("not a hex byte: {fill_byte}"))
    })?;
    let buf = vec![byte; 512];
    target.write(sector, &buf)?;
    info!(sector, "write ok");
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
