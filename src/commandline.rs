use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Scan for nearby devices and show their advertisement data
    Scan {
        /// How long to scan for advertisements (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        duration: Duration,
    },
    /// Poll a device and print one aggregated data snapshot
    Poll {
        /// Device model (e.g., AC70P, AC2A, Elite200V2)
        #[arg(short = 't', long)]
        device_type: String,

        /// Device serial number, as printed on the unit
        #[arg(short, long)]
        serial: String,

        /// Restrict polling to specific registers, as comma-separated
        /// ADDRESS:QUANTITY pairs (e.g., "102:1,140:2"); pack polling is
        /// skipped when this is given
        #[clap(long, short)]
        registers: Option<String>,

        /// Print the snapshot as JSON instead of plain text
        #[clap(long, action)]
        json: bool,

        /// Keep polling at this interval instead of exiting after one
        /// snapshot (e.g., "30s", "5m")
        #[clap(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
}

const fn about_text() -> &'static str {
    "bluetti power station command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a single register read (e.g., "5s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "5s")]
    pub response_timeout: Duration,

    /// Wall-clock timeout for one whole polling cycle (e.g., "45s", "1m")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "45s")]
    pub polling_timeout: Duration,

    /// Number of connection attempts before giving up
    #[arg(long, default_value = "5")]
    pub retries: u32,

    /// Keep the BLE connection open between polling cycles
    #[arg(long, action)]
    pub persistent: bool,
}
