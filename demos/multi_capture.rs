// Multi-device capture example
//
// Connects two to five analyzers as one, triggers on a pattern seen by the first device
// and prints a summary of the merged capture. The trigger output of the first device
// must be wired to the trigger input of every other device.

use clap::Parser;
use logic_analyzer_rs::{
    AnalyzerDriver, CaptureSession, DriverConfig, MultiAnalyzer, PatternBuilder,
};
use polars::prelude::{CsvWriter, SerWriter};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "multi_capture")]
#[command(version = "1.0")]
#[command(about = "Capture from several logic analyzers as one")]
struct Args {
    /// Serial ports or host:port addresses, master first
    #[arg(required = true, num_args = 2..=5)]
    connections: Vec<String>,

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
        default_value = "0,1,24,25",
        help = "Channels to capture, numbered across all devices"
    )]
    channels: Vec<u8>,

    #[arg(
        short,
        long,
        default_value = "1",
        help = "Pattern matched from channel 0 upwards, e.g. 10"
    )]
    pattern: String,

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

    let connections: Vec<&str> = args.connections.iter().map(String::as_str).collect();
    let mut group = MultiAnalyzer::connect(&connections, DriverConfig::default())?;
    println!(
        "✓ Connected {} devices as {} ({} channels)",
        group.devices().len(),
        group.device_version().unwrap_or_default(),
        group.channel_count()
    );

    let trigger = args
        .pattern
        .chars()
        .try_fold(PatternBuilder::starting_at(0), |builder, c| match c {
            '1' => Ok(builder.high()),
            '0' => Ok(builder.low()),
            other => Err(format!("Invalid pattern character '{}'", other)),
        })?
        .complex();

    let session = CaptureSession::new(args.frequency, args.pre, args.post)
        .with_channels(args.channels.iter().copied())
        .with_trigger(trigger);

    let pending = group.start_pattern_capture(&session)?;
    println!("Waiting for trigger...");

    let capture = match pending.wait_timeout(Duration::from_secs(args.wait)) {
        Ok(outcome) => outcome?,
        Err(_) => {
            eprintln!("No trigger within {}s, aborting", args.wait);
            group.stop_capture();
            return Ok(());
        }
    };

    println!(
        "Merged {} samples on {} channels\n",
        capture.samples.len(),
        capture.channel_count()
    );
    for (bit, channel) in capture.channels.iter().enumerate() {
        let high = capture
            .channel_samples(bit)
            .map_or(0, |levels| levels.iter().filter(|level| **level == 1).count());
        println!("  {:<12} high in {} samples", channel.label(), high);
    }

    if let Some(path) = &args.output {
        let mut df = capture.to_dataframe()?;
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).finish(&mut df)?;
        println!("\nWrote {} rows to {}", df.height(), path);
    }

    Ok(())
}
