use std::fs;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use sensorboard::frame::{FrameScanner, SummaryFrame};

use crate::cli::DecodeArgs;

/// Every complete frame in `bytes`; the scanner keeps the skip count.
pub fn scan(bytes: &[u8], scanner: &mut FrameScanner) -> Vec<SummaryFrame> {
    let mut frames = Vec::new();
    scanner.extend(bytes, |frame| frames.push(frame));
    frames
}

pub fn run(args: &DecodeArgs) -> Result<()> {
    let bytes = match &args.input {
        Some(path) => fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let mut scanner = FrameScanner::new(args.endian.into());
    let frames = scan(&bytes, &mut scanner);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for frame in &frames {
        if args.pretty {
            serde_json::to_writer_pretty(&mut out, frame)?;
        } else {
            serde_json::to_writer(&mut out, frame)?;
        }
        writeln!(out)?;
    }

    if scanner.skipped() > 0 {
        log::warn!("Skipped {} bytes while resynchronising", scanner.skipped());
    }
    log::info!("Decoded {} frames from {} bytes", frames.len(), bytes.len());
    Ok(())
}
