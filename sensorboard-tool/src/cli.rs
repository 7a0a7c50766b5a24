use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use sensorboard::frame::Endian;

#[derive(Parser, Debug)]
#[command(name = "sbtool", version, about = "SB1.0 sensor board host tool")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a captured serial stream into JSON lines
    Decode(DecodeArgs),
    /// Run the board core against a synthetic tone and a simulated accelerometer
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Raw capture file; stdin if omitted
    pub input: Option<PathBuf>,

    /// Byte order of the board that produced the stream
    #[arg(long, value_enum, default_value_t = ByteOrder::Little)]
    pub endian: ByteOrder,

    /// Pretty-print each frame
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// HJSON simulation profile
    #[arg(short, long)]
    pub profile: Option<PathBuf>,

    /// Number of capture windows to run (overrides the profile)
    #[arg(short = 'n', long)]
    pub frames: Option<u32>,

    /// Tone frequency in Hz (overrides the profile)
    #[arg(long)]
    pub tone_hz: Option<f64>,

    /// Tone amplitude in ADC counts (overrides the profile)
    #[arg(long)]
    pub amplitude: Option<f64>,

    /// Write the raw frame stream here
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print one JSON line per cycle
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl From<ByteOrder> for Endian {
    fn from(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Little => Endian::Little,
            ByteOrder::Big => Endian::Big,
        }
    }
}
