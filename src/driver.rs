//! Driver abstraction shared by the single-device and multi-device analyzers.

use crate::limits::{CaptureLimits, ChannelMode, DeviceInfo};
use crate::result::CaptureResult;
use crate::session::{CaptureSession, Trigger, TriggerType};
use crate::transport::TransportError;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Kind of driver that produced a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    Serial,
    Network,
    Multi,
}

/// A capture session the driver refuses before anything reaches the wire.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("No channels selected")]
    NoChannels,

    #[error("{0} channels selected, more than the device provides")]
    TooManyChannels(usize),

    #[error("Channel {channel} out of range (max {max})")]
    ChannelOutOfRange { channel: u8, max: u8 },

    #[error("Pre-trigger samples {value} outside {min}..={max}")]
    PreSamples { value: u32, min: u32, max: u32 },

    #[error("Post-trigger samples {value} outside {min}..={max}")]
    PostSamples { value: u32, min: u32, max: u32 },

    #[error("Total samples {value} exceed {max}")]
    TotalSamples { value: u64, max: u32 },

    #[error("Frequency {value} Hz outside {min}..={max} Hz")]
    Frequency { value: u32, min: u32, max: u32 },

    #[error("Loop count {0} exceeds 254")]
    LoopCount(u8),

    #[error("Burst measurement is not supported by the capture request")]
    BurstMeasurement,

    #[error("Trigger channel {channel} out of range (max {max})")]
    TriggerChannel { channel: u8, max: u8 },

    #[error("Trigger bit count {0} outside 1..=16")]
    TriggerBitCount(u8),

    #[error("Trigger pattern from channel {channel} over {bit_count} bits exceeds {limit} channels")]
    PatternSpan { channel: u8, bit_count: u8, limit: u8 },

    #[error("No channels fall on the master device")]
    MasterWithoutChannels,

    #[error("{0}")]
    WrongTriggerType(&'static str),
}

/// Synchronous outcome of a capture start.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Device is already capturing")]
    Busy,

    #[error("Bad capture parameters: {0}")]
    BadParams(#[from] ParamError),

    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

/// Why a started capture delivered no samples.
#[derive(Debug, thiserror::Error)]
pub enum CaptureFailure {
    #[error("Transport failed during capture: {0}")]
    Transport(#[from] TransportError),

    #[error("Capture aborted")]
    Aborted,

    #[error("No samples within the drain timeout")]
    DrainTimeout,

    #[error("Device announced {got} samples, expected at most {expected}")]
    UnexpectedLength { expected: u64, got: u32 },

    #[error("Capture abandoned before completion")]
    Abandoned,

    #[error("Timed out waiting for the capture result")]
    WaitTimeout,

    #[error("Device {tag}: {source}")]
    Device {
        tag: usize,
        source: Box<CaptureFailure>,
    },
}

pub type CaptureOutcome = Result<CaptureResult, CaptureFailure>;

/// Called exactly once per started capture, from the thread draining the device.
pub type CompletionHandler = Box<dyn FnOnce(CaptureOutcome) + Send + 'static>;

/// Receiving end of a started capture.
#[derive(Debug)]
pub struct PendingCapture {
    receiver: mpsc::Receiver<CaptureOutcome>,
}

impl PendingCapture {
    /// A pending capture together with the handler that completes it.
    pub fn channel() -> (Self, CompletionHandler) {
        let (sender, receiver) = mpsc::channel();
        let handler: CompletionHandler = Box::new(move |outcome| {
            // The receiver may already be gone; nobody is waiting then.
            let _ = sender.send(outcome);
        });
        (Self { receiver }, handler)
    }

    /// Block until the capture finishes.
    pub fn wait(self) -> CaptureOutcome {
        self.receiver
            .recv()
            .unwrap_or(Err(CaptureFailure::Abandoned))
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<CaptureOutcome, Self> {
        let start = Instant::now();
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::debug!("Capture still running after {:?}", start.elapsed());
                Err(self)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(Err(CaptureFailure::Abandoned)),
        }
    }

    /// Like [`wait_timeout`](Self::wait_timeout), giving up on the capture when time runs out.
    pub fn wait_for(self, timeout: Duration) -> CaptureOutcome {
        self.wait_timeout(timeout)
            .unwrap_or(Err(CaptureFailure::WaitTimeout))
    }

    /// `Err(self)` while the capture is still running.
    pub fn try_get(self) -> Result<CaptureOutcome, Self> {
        match self.receiver.try_recv() {
            Ok(outcome) => Ok(outcome),
            Err(mpsc::TryRecvError::Empty) => Err(self),
            Err(mpsc::TryRecvError::Disconnected) => Ok(Err(CaptureFailure::Abandoned)),
        }
    }
}

/// Common surface of every analyzer driver.
pub trait AnalyzerDriver: Send {
    /// Raw version string the device (or group) identified with.
    fn device_version(&self) -> Option<String>;

    fn channel_count(&self) -> u8;

    fn max_frequency(&self) -> u32;

    fn min_frequency(&self) -> u32 {
        ((u64::from(self.max_frequency()) * 2) / 65_535) as u32
    }

    fn buffer_size(&self) -> u32;

    fn driver_type(&self) -> DriverType;

    fn is_capturing(&self) -> bool;

    fn capture_mode(&self, channels: &[u8]) -> ChannelMode {
        ChannelMode::for_channels(channels)
    }

    fn limits(&self, channels: &[u8]) -> CaptureLimits;

    /// Limits of all three channel tiers.
    fn device_info(&self) -> DeviceInfo {
        let tier = |count: u8| self.limits(&(0..count).collect::<Vec<_>>());
        DeviceInfo {
            name: self
                .device_version()
                .unwrap_or_else(|| "Unknown".to_string()),
            max_frequency: self.max_frequency(),
            min_frequency: self.min_frequency(),
            channels: self.channel_count(),
            buffer_size: self.buffer_size(),
            mode_limits: [tier(8), tier(16), tier(24)],
        }
    }

    /// Start an edge-triggered capture; `on_complete` receives the outcome.
    fn start_capture_with(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError>;

    /// Start a complex or fast pattern-triggered capture.
    fn start_pattern_capture_with(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError>;

    /// Abort a running capture. `false` when nothing was running.
    fn stop_capture(&mut self) -> bool;

    fn start_capture(&mut self, session: &CaptureSession) -> Result<PendingCapture, CaptureError> {
        let (pending, handler) = PendingCapture::channel();
        self.start_capture_with(session, handler)?;
        Ok(pending)
    }

    fn start_pattern_capture(
        &mut self,
        session: &CaptureSession,
    ) -> Result<PendingCapture, CaptureError> {
        let (pending, handler) = PendingCapture::channel();
        self.start_pattern_capture_with(session, handler)?;
        Ok(pending)
    }
}

/// Time the device needs to recognise a pattern trigger, in nanoseconds.
const COMPLEX_TRIGGER_DELAY_NS: f64 = 50.0;
const FAST_TRIGGER_DELAY_NS: f64 = 30.0;

/// Samples a pattern-triggered capture is shifted by to cover the trigger
/// recognition delay. Edge triggers have none.
pub fn trigger_offset(frequency: u32, trigger: TriggerType) -> u32 {
    let delay = match trigger {
        TriggerType::Edge => return 0,
        TriggerType::Complex => COMPLEX_TRIGGER_DELAY_NS,
        TriggerType::Fast => FAST_TRIGGER_DELAY_NS,
    };
    let sample_period = 1_000_000_000.0 / f64::from(frequency.max(1));
    ((delay / sample_period) + 0.3).round_ties_even() as u32
}

/// Checks shared by every driver: channel list, sample window, frequency and trigger.
///
/// `trigger_channel_max` is inclusive; edge triggers may address the external
/// trigger input one past the last channel.
pub(crate) fn validate_session(
    session: &CaptureSession,
    channel_count: u8,
    limits: &CaptureLimits,
    min_frequency: u32,
    max_frequency: u32,
) -> Result<(), ParamError> {
    if session.channels.is_empty() {
        return Err(ParamError::NoChannels);
    }
    if session.channels.len() > usize::from(channel_count) {
        return Err(ParamError::TooManyChannels(session.channels.len()));
    }

    let max_channel = channel_count.saturating_sub(1);
    if let Some(channel) = session
        .channels
        .iter()
        .map(|c| c.number)
        .find(|number| *number > max_channel)
    {
        return Err(ParamError::ChannelOutOfRange {
            channel,
            max: max_channel,
        });
    }

    if session.measure_bursts {
        return Err(ParamError::BurstMeasurement);
    }

    match session.trigger {
        Trigger::Edge(edge) => {
            if edge.channel > channel_count {
                return Err(ParamError::TriggerChannel {
                    channel: edge.channel,
                    max: channel_count,
                });
            }
            if session.loop_count > 254 {
                return Err(ParamError::LoopCount(session.loop_count));
            }
        }
        Trigger::Complex(pattern) | Trigger::Fast(pattern) => {
            if !(1..=16).contains(&pattern.bit_count) {
                return Err(ParamError::TriggerBitCount(pattern.bit_count));
            }
            if pattern.channel > 15 {
                return Err(ParamError::TriggerChannel {
                    channel: pattern.channel,
                    max: 15,
                });
            }
            let limit = if matches!(session.trigger, Trigger::Complex(_)) {
                16
            } else {
                5
            };
            if u16::from(pattern.channel) + u16::from(pattern.bit_count) > limit {
                return Err(ParamError::PatternSpan {
                    channel: pattern.channel,
                    bit_count: pattern.bit_count,
                    limit: limit as u8,
                });
            }
        }
    }

    let pre = session.pre_trigger_samples;
    if pre < limits.min_pre_samples || pre > limits.max_pre_samples {
        return Err(ParamError::PreSamples {
            value: pre,
            min: limits.min_pre_samples,
            max: limits.max_pre_samples,
        });
    }

    let post = session.post_trigger_samples;
    if post < limits.min_post_samples || post > limits.max_post_samples {
        return Err(ParamError::PostSamples {
            value: post,
            min: limits.min_post_samples,
            max: limits.max_post_samples,
        });
    }

    let total = match session.trigger {
        Trigger::Edge(_) => session.requested_samples(),
        _ => u64::from(pre) + u64::from(post),
    };
    if total > u64::from(limits.max_total_samples()) {
        return Err(ParamError::TotalSamples {
            value: total,
            max: limits.max_total_samples(),
        });
    }

    if session.frequency < min_frequency || session.frequency > max_frequency {
        return Err(ParamError::Frequency {
            value: session.frequency,
            min: min_frequency,
            max: max_frequency,
        });
    }

    Ok(())
}
