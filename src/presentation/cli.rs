use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kinetic_ble")]
#[command(about = "Stream motion data from a BLE IMU sensor", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Use a synthetic sensor instead of the system Bluetooth adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List nearby sensors
    Scan,
    /// Connect and print samples
    Stream {
        /// Device id; defaults to the last connected device, then the first found
        #[arg(short, long)]
        device: Option<String>,
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Write the collected session as JSON on exit
        #[arg(short, long)]
        record: Option<PathBuf>,
    },
}
