//! # Logic Analyzer RS
//!
//! A Rust library for driving 24-channel logic analyzers over USB serial or TCP, alone or
//! as a synchronized group of up to five devices acting as one wide analyzer.
//!
//! ## Features
//!
//! - **Device discovery**: Uses `serialport` to find attached analyzers by USB id
//! - **Capture sessions**: Edge and pattern triggers, burst captures, per-tier limits
//! - **Asynchronous drain**: Samples are read on a background thread, the caller waits
//!   on a [`PendingCapture`] or passes its own completion handler
//! - **Multi-device capture**: Pattern trigger on the master, slaves follow through the
//!   external trigger line and their samples are bit-interleaved into one stream
//! - **DataFrame output**: Captures convert to a `polars` DataFrame
//!
//! ## Examples
//!
//! ### Single Device Capture
//!
//! ```rust,no_run
//! use logic_analyzer_rs::{
//!     AnalyzerDriver, CaptureSession, DriverConfig, EdgeTrigger, LogicAnalyzer,
//! };
//!
//! let mut analyzer = LogicAnalyzer::connect("/dev/ttyACM0", DriverConfig::default())?;
//! println!("Connected to {}", analyzer.device_version().unwrap_or_default());
//!
//! let session = CaptureSession::new(10_000_000, 512, 4096)
//!     .with_channels([0, 1, 2, 3])
//!     .with_trigger(EdgeTrigger::rising(0));
//!
//! let capture = analyzer.start_capture(&session)?.wait()?;
//! println!("Captured {} samples", capture.samples.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Pattern Trigger Across Two Devices
//!
//! ```rust,no_run
//! use logic_analyzer_rs::{
//!     AnalyzerDriver, CaptureSession, DriverConfig, MultiAnalyzer, PatternBuilder,
//! };
//!
//! let devices = ["/dev/ttyACM0", "/dev/ttyACM1"];
//! let mut group = MultiAnalyzer::connect(&devices, DriverConfig::default())?;
//!
//! let session = CaptureSession::new(50_000_000, 1000, 10_000)
//!     .with_channels([0, 1, 24, 25])
//!     .with_trigger(PatternBuilder::starting_at(0).high().low().complex());
//!
//! let capture = group.start_pattern_capture(&session)?.wait()?;
//! let df = capture.to_dataframe()?;
//! println!("{}", df.head(Some(5)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use logic_analyzer_rs::detect_devices;
//!
//! for device in detect_devices()? {
//!     println!("Found analyzer at {}", device.port);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analyzer;
pub mod config;
pub mod connector;
pub mod driver;
pub mod framing;
pub mod limits;
pub mod multi;
pub mod request;
pub mod result;
pub mod session;
pub mod transport;
pub mod version;

// Re-export the main types for convenience
pub use analyzer::{
    ConnectionFailure, DeviceConnectionError, DriverState, LogicAnalyzer, SettingsError,
    VoltageStatus,
};

pub use request::WifiSettings;

pub use multi::{merge_samples, MultiAnalyzer, MultiConnectError};

pub use driver::{
    AnalyzerDriver, CaptureError, CaptureFailure, CaptureOutcome, CompletionHandler,
    DriverType, ParamError, PendingCapture,
};

pub use session::{
    AnalyzerChannel, CaptureSession, EdgeTrigger, PatternBuilder, PatternTrigger, Trigger,
    TriggerType,
};

pub use limits::{CapacityProfile, CaptureLimits, ChannelMode, DeviceInfo};

pub use config::DriverConfig;

pub use connector::{detect_devices, DetectedDevice, Endpoint};

pub use result::CaptureResult;

pub use version::DeviceVersion;
