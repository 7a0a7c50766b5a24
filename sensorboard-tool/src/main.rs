mod cli;
mod decode;
mod simulate;

use std::fs;
use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Decode(args) => decode::run(&args),
        Command::Simulate(args) => {
            let mut profile = match &args.profile {
                Some(path) => simulate::Profile::load(path)?,
                None => simulate::Profile::default(),
            };
            if let Some(frames) = args.frames {
                profile.frames = frames;
            }
            if let Some(tone_hz) = args.tone_hz {
                profile.tone_hz = tone_hz;
            }
            if let Some(amplitude) = args.amplitude {
                profile.amplitude = amplitude;
            }

            let outcome = simulate::run(&profile)?;

            if args.json {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                for report in &outcome.reports {
                    serde_json::to_writer(&mut out, report)?;
                    writeln!(out)?;
                }
            }
            if let Some(path) = &args.output {
                fs::write(path, &outcome.stream)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                log::info!("Wrote {} bytes to {}", outcome.stream.len(), path.display());
            }
            Ok(())
        }
    }
}
