use anyhow::{Context, Result};
use bluettibt_lib::ble::BluestTransport;
use bluettibt_lib::crypt::PlainLink;
use bluettibt_lib::device::{build_device, BluettiDevice};
use bluettibt_lib::fields::FieldValue;
use bluettibt_lib::protocol::DeviceCommand;
use bluettibt_lib::reader::DeviceReader;
use bluettibt_lib::transport::Transport;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::panic;
use std::sync::Arc;

mod commandline;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn parse_register_filter(spec: &str) -> Result<Vec<DeviceCommand>> {
    spec.split(',')
        .map(|part| {
            let (address, quantity) = part.trim().split_once(':').with_context(|| {
                format!("Invalid register spec '{part}', expected ADDRESS:QUANTITY")
            })?;
            let address = address
                .trim()
                .parse()
                .with_context(|| format!("Invalid register address '{address}'"))?;
            let quantity = quantity
                .trim()
                .parse()
                .with_context(|| format!("Invalid register quantity '{quantity}'"))?;
            DeviceCommand::read_holding_registers(address, quantity)
                .with_context(|| format!("Register range '{part}' out of bounds"))
        })
        .collect()
}

fn print_snapshot(data: &std::collections::HashMap<String, FieldValue>, json: bool) -> Result<()> {
    let sorted: BTreeMap<_, _> = data.iter().collect();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&sorted).with_context(|| "Cannot serialize snapshot")?
        );
    } else {
        for (field, value) in sorted {
            println!("{field}: {value}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    match args.command {
        CliCommands::Scan { duration } => {
            let transport = BluestTransport::new("")
                .await
                .with_context(|| "Cannot initialize Bluetooth adapter")?;
            let devices = transport
                .discover(duration)
                .await
                .with_context(|| "Scan failed")?;
            for advertisement in devices {
                let name = advertisement.name.as_deref().unwrap_or("<unknown>");
                let encrypted = if advertisement.has_encryption_marker() {
                    " [encrypted]"
                } else {
                    ""
                };
                println!("{name}{encrypted}");
                for (company_id, data) in &advertisement.manufacturer_data {
                    println!("  manufacturer 0x{company_id:04x}: {}", hex::encode(data));
                }
            }
        }
        CliCommands::Poll {
            device_type,
            serial,
            registers,
            json,
            interval,
        } => {
            let device = build_device(&device_type, &serial)
                .with_context(|| format!("Unsupported device type '{device_type}'"))?;
            let device: Arc<dyn BluettiDevice> = Arc::new(device);
            let transport = BluestTransport::new(&device.advertisement_name())
                .await
                .with_context(|| "Cannot initialize Bluetooth adapter")?;

            let mut reader = DeviceReader::new(Arc::new(transport), device, Box::new(PlainLink));
            reader.set_response_timeout(args.response_timeout);
            reader.set_polling_timeout(args.polling_timeout);
            reader.set_retries(args.retries);
            reader.set_persistent_conn(args.persistent);

            let filter = registers.as_deref().map(parse_register_filter).transpose()?;

            loop {
                match reader.poll(filter.as_deref()).await {
                    Some(data) => print_snapshot(&data, json)?,
                    None => warn!("No data received"),
                }
                match interval {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => break,
                }
            }
        }
    }

    Ok(())
}
