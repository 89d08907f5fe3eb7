//! Pushes configuration commands to a board on a serial device and prints
//! what it answers.
//!
//! The tty must already be set to the board's baud rate (e.g. `stty -F
//! /dev/ttyUSB0 115200 raw`).
//!
//! Usage:
//!   serial_config /dev/ttyUSB0 "wifi HomeNet secret" "name Garage" config
//!   serial_config /dev/ttyUSB0 --pins --listen 10

use std::{env, time::Duration};

use anyhow::{bail, Context, Result};
use tokio::{fs::OpenOptions, signal, time};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iot_hub_service::serial::{
    session::PIN_COMMAND_GAP, LineKind, PinMap, SerialCommand, SerialSession,
};

const DEFAULT_LISTEN_SECS: u64 = 3;

struct Args {
    device: String,
    commands: Vec<SerialCommand>,
    pins: bool,
    listen: Duration,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let device = args
        .next()
        .context("usage: serial_config <device> [--pins] [--listen <secs>] [command...]")?;
    let mut parsed = Args {
        device,
        commands: Vec::new(),
        pins: false,
        listen: Duration::from_secs(DEFAULT_LISTEN_SECS),
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--pins" => parsed.pins = true,
            "--listen" => {
                let secs: u64 = args
                    .next()
                    .context("--listen needs a number of seconds")?
                    .parse()
                    .context("--listen must be a whole number of seconds")?;
                parsed.listen = Duration::from_secs(secs);
            }
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            command => parsed.commands.push(SerialCommand::parse(command)?),
        }
    }
    Ok(parsed)
}

fn marker(kind: LineKind) -> &'static str {
    match kind {
        LineKind::Success => "[ok]  ",
        LineKind::Error => "[err] ",
        LineKind::Warning => "[warn]",
        LineKind::Info => "      ",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = parse_args(env::args().skip(1))?;

    let port = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.device)
        .await
        .with_context(|| format!("failed to open {}", args.device))?;
    let mut session = SerialSession::new(port);
    info!(device = %args.device, "Serial port opened");

    for command in &args.commands {
        session.send(command).await?;
    }
    if args.pins {
        session.apply_pins(&PinMap::devkit(), PIN_COMMAND_GAP).await?;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let listen = args.listen;
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(listen) => {},
                _ = signal::ctrl_c() => {},
            }
            cancel.cancel();
        });
    }

    session
        .read_lines(&cancel, |kind, line| println!("{} {line}", marker(kind)))
        .await?;

    let config = session.config();
    println!();
    println!("Device name: {}", config.device_name.as_deref().unwrap_or("-"));
    println!("WiFi SSID:   {}", config.wifi_ssid.as_deref().unwrap_or("-"));
    println!("AP SSID:     {}", config.ap_ssid.as_deref().unwrap_or("-"));
    println!("Board:       {}", config.board);
    Ok(())
}
