// Basic device discovery and connection example
//
// Lists attached analyzers, connects to the first one (or to the address given on the
// command line) and prints what the device reports about itself.

use logic_analyzer_rs::{detect_devices, AnalyzerDriver, ChannelMode, DriverConfig, LogicAnalyzer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Logic Analyzer Discovery Example");
    println!("================================\n");

    let connection = match std::env::args().nth(1) {
        Some(connection) => connection,
        None => {
            println!("1. Discovering attached analyzers...");
            let devices = detect_devices()?;
            if devices.is_empty() {
                println!("No analyzers found. Connect a device or pass host:port and try again.");
                return Ok(());
            }

            println!("Found {} device(s):", devices.len());
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "  {}. {} (serial {})",
                    i + 1,
                    device.port,
                    device.serial_number.as_deref().unwrap_or("unknown")
                );
            }
            println!();
            devices[0].port.clone()
        }
    };

    println!("2. Connecting to {}...", connection);
    let analyzer = LogicAnalyzer::connect(&connection, DriverConfig::default())?;
    println!("Successfully connected!");

    let info = analyzer.device_info();
    println!("\n3. Device information:");
    println!("  Version:    {}", info.name);
    println!("  Transport:  {:?}", analyzer.driver_type());
    println!("  Channels:   {}", info.channels);
    println!("  Frequency:  {} Hz .. {} Hz", info.min_frequency, info.max_frequency);
    println!("  Buffer:     {} bytes", info.buffer_size);

    println!("\n4. Sample limits per channel tier:");
    for (mode, limits) in ChannelMode::ALL.iter().zip(info.mode_limits.iter()) {
        println!(
            "  {:>2} channels: pre {}..{}, post {}..{}, total {}",
            mode.channel_span(),
            limits.min_pre_samples,
            limits.max_pre_samples,
            limits.min_post_samples,
            limits.max_post_samples,
            limits.max_total_samples()
        );
    }

    Ok(())
}
