// Single device capture example
//
// Runs one edge- or pattern-triggered capture and prints the channel levels around the
// trigger, optionally writing the whole capture to CSV.

use clap::Parser;
use logic_analyzer_rs::{
    AnalyzerDriver, CaptureSession, DriverConfig, EdgeTrigger, LogicAnalyzer, PatternBuilder,
};
use polars::prelude::{CsvWriter, SerWriter};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "1.0")]
#[command(about = "Capture samples from one logic analyzer")]
struct Args {
    /// Serial port or host:port of the device
    connection: String,

    #[arg(short, long, default_value_t = 10_000_000, help = "Sampling frequency in Hz")]
    frequency: u32,

    #[arg(long, default_value_t = 512, help = "Samples kept before the trigger")]
    pre: u32,

    #[arg(long, default_value_t = 4096, help = "Samples captured after the trigger")]
    post: u32,

    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "0,1,2,3",
        help = "Channels to capture"
    )]
    channels: Vec<u8>,

    #[arg(short, long, default_value_t = 0, help = "Trigger channel (or first pattern channel)")]
    trigger: u8,

    #[arg(long, help = "Trigger on the falling edge")]
    falling: bool,

    #[arg(long, help = "Pattern to match from the trigger channel upwards, e.g. 1011")]
    pattern: Option<String>,

    #[arg(long, help = "Use the fast pattern trigger (at most 5 bits)")]
    fast: bool,

    #[arg(long, default_value_t = 0, help = "Number of additional bursts")]
    bursts: u8,

    #[arg(short, long, default_value_t = 30, help = "Seconds to wait for the trigger")]
    wait: u64,

    #[arg(short, long, help = "Write the capture to this CSV file")]
    output: Option<String>,

    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut analyzer = LogicAnalyzer::connect(&args.connection, DriverConfig::default())?;
    println!(
        "✓ Connected to {}",
        analyzer.device_version().unwrap_or_default()
    );

    let mut session = CaptureSession::new(args.frequency, args.pre, args.post)
        .with_channels(args.channels.iter().copied())
        .with_bursts(args.bursts);

    let pending = match &args.pattern {
        Some(pattern) => {
            let builder = pattern
                .chars()
                .try_fold(PatternBuilder::starting_at(args.trigger), |builder, c| match c {
                    '1' => Ok(builder.high()),
                    '0' => Ok(builder.low()),
                    other => Err(format!("Invalid pattern character '{}'", other)),
                })?;
            session.trigger = if args.fast {
                builder.fast()
            } else {
                builder.complex()
            };
            analyzer.start_pattern_capture(&session)?
        }
        None => {
            let edge = if args.falling {
                EdgeTrigger::falling(args.trigger)
            } else {
                EdgeTrigger::rising(args.trigger)
            };
            session = session.with_trigger(edge);
            analyzer.start_capture(&session)?
        }
    };

    println!("Waiting for trigger...");
    let capture = match pending.wait_timeout(Duration::from_secs(args.wait)) {
        Ok(outcome) => outcome?,
        Err(_) => {
            eprintln!("No trigger within {}s, aborting", args.wait);
            analyzer.stop_capture();
            return Ok(());
        }
    };

    println!(
        "Captured {} samples on {} channels at {} Hz\n",
        capture.samples.len(),
        capture.channel_count(),
        capture.frequency
    );

    let first = capture.pre_samples.saturating_sub(5) as usize;
    for index in first..(first + 10).min(capture.samples.len()) {
        let levels: String = (0..capture.channel_count())
            .map(|bit| if (capture.samples[index] >> bit) & 1 == 1 { '1' } else { '0' })
            .collect();
        println!("{:>12.9}s  {}", capture.sample_time(index), levels);
    }

    if let Some(path) = &args.output {
        let mut df = capture.to_dataframe()?;
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).finish(&mut df)?;
        println!("\nWrote {} rows to {}", df.height(), path);
    }

    Ok(())
}
