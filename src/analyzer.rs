//! Driver for one analyzer attached over a serial port or a network socket.

use crate::config::DriverConfig;
use crate::connector::{ConnectorError, Endpoint};
use crate::driver::{
    self, AnalyzerDriver, CaptureError, CaptureFailure, CompletionHandler, DriverType, ParamError,
};
use crate::framing::{self, Command, ABORT_BYTE};
use crate::limits::{CapacityProfile, CaptureLimits};
use crate::request::{CaptureRequest, RequestError, WifiSettings};
use crate::result::CaptureResult;
use crate::session::{CaptureSession, Trigger};
use crate::transport::{read_exact_cancellable, read_line, Transport, TransportError};
use crate::version::DeviceVersion;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::instrument;

static FREQUENCY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^FREQ:([0-9]+)$").expect("Invalid frequency regex"));
static BUFFER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^BUFFER:([0-9]+)$").expect("Invalid buffer regex"));
static CHANNELS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CHANNELS:([0-9]+)$").expect("Invalid channels regex"));

const CAPTURE_STARTED: &str = "CAPTURE_STARTED";
const SETTINGS_SAVED: &str = "SETTINGS_SAVED";
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(5);

// Devices identifying below the extended-info version
const LEGACY_MAX_FREQUENCY: u32 = 100_000_000;
const LEGACY_CHANNEL_COUNT: u8 = 24;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionFailure {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Specified address/port '{0}' is invalid")]
    InvalidEndpoint(String),

    #[error(
        "Invalid device version '{found}', minimum supported version: {minimum}",
        minimum = DeviceVersion::MINIMUM
    )]
    UnsupportedVersion { found: String },

    #[error("Invalid device {field} response: '{line}'")]
    InvalidResponse { field: &'static str, line: String },

    #[error("Different device versions found. Master version: {baseline}, device version: {found}")]
    VersionMismatch {
        baseline: DeviceVersion,
        found: DeviceVersion,
    },
}

impl From<ConnectorError> for ConnectionFailure {
    fn from(error: ConnectorError) -> Self {
        match error {
            ConnectorError::Transport(e) => Self::Transport(e),
            ConnectorError::InvalidAddress(address) => Self::InvalidEndpoint(address),
            ConnectorError::Enumeration(e) => Self::Transport(TransportError::SerialPort(e)),
        }
    }
}

/// A device could not be opened or is not one the drivers can talk to.
#[derive(Debug, thiserror::Error)]
#[error("Error connecting to device {connection}: {cause}")]
pub struct DeviceConnectionError {
    pub connection: String,
    #[source]
    pub cause: ConnectionFailure,
}

impl DeviceConnectionError {
    pub fn new(connection: impl Into<String>, cause: impl Into<ConnectionFailure>) -> Self {
        Self {
            connection: connection.into(),
            cause: cause.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("WiFi settings can only be sent over a serial connection")]
    NetworkConnection,

    #[error("Only networked devices report their supply voltage")]
    NotNetworked,

    #[error("Device is not ready ({0:?})")]
    NotReady(DriverState),

    #[error("Invalid settings: {0}")]
    Record(#[from] RequestError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device answered '{0}'")]
    Rejected(String),
}

/// Supply readings of a battery powered WiFi device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageStatus {
    /// System supply in volts.
    pub vsys: f32,
    /// Whether USB power is present.
    pub usb_powered: bool,
}

impl VoltageStatus {
    /// Parse the `<volts>_<0|1>` status line.
    pub fn parse(line: &str) -> Option<Self> {
        let (vsys, usb) = line.split_once('_')?;
        let usb_powered = match usb {
            "1" => true,
            "0" => false,
            _ => return None,
        };
        Some(Self {
            vsys: vsys.parse().ok()?,
            usb_powered,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Handshaking,
    Idle,
    Capturing,
}

#[derive(Debug, Clone)]
struct Identity {
    line: String,
    version: DeviceVersion,
    profile: CapacityProfile,
    max_frequency: u32,
    channel_count: u8,
}

fn identify(link: &mut dyn Transport, timeout: Duration) -> Result<Identity, ConnectionFailure> {
    link.discard_buffers()?;
    link.write_all(&framing::encode_command(Command::Identify, &[]))
        .and_then(|()| link.flush())
        .map_err(TransportError::from)?;

    let line = read_line(link, timeout)?;
    log::debug!("Device identified as '{}'", line);

    let Some(version) = DeviceVersion::parse(&line).filter(DeviceVersion::is_supported) else {
        return Err(ConnectionFailure::UnsupportedVersion { found: line });
    };

    if !version.reports_extended_info() {
        return Ok(Identity {
            line,
            version,
            profile: CapacityProfile::Fixed,
            max_frequency: LEGACY_MAX_FREQUENCY,
            channel_count: LEGACY_CHANNEL_COUNT,
        });
    }

    let max_frequency = read_field(link, timeout, &FREQUENCY_REGEX, "frequency")?;
    let buffer_size = read_field(link, timeout, &BUFFER_REGEX, "buffer size")?;
    let channels = read_field(link, timeout, &CHANNELS_REGEX, "channel count")?;

    Ok(Identity {
        line,
        version,
        profile: CapacityProfile::Buffer { size: buffer_size },
        max_frequency,
        channel_count: channels.min(CaptureRequest::MAX_CHANNELS as u32) as u8,
    })
}

fn read_field(
    link: &mut dyn Transport,
    timeout: Duration,
    pattern: &Regex,
    field: &'static str,
) -> Result<u32, ConnectionFailure> {
    let line = read_line(link, timeout)?;
    let value = pattern
        .captures(&line)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse().ok());

    match value {
        Some(value) => Ok(value),
        None => Err(ConnectionFailure::InvalidResponse { field, line }),
    }
}

type SharedLink = Arc<Mutex<Option<Box<dyn Transport>>>>;

fn lock_link(link: &SharedLink) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send the abort byte, wait for the device to settle and reopen the transport.
fn abort(link: &mut dyn Transport, connection: &str, settle: Duration) -> bool {
    if let Err(e) = link.write_all(&[ABORT_BYTE]).and_then(|()| link.flush()) {
        log::warn!("Failed to send abort to {}: {}", connection, e);
    }
    thread::sleep(settle);

    match link.reopen() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Failed to reopen {}: {}", connection, e);
            false
        }
    }
}

/// Aborts the capture a device was running when the handle was taken, from any thread.
/// Once that capture has ended the handle does nothing.
///
/// Stopping never joins the sample drain, so a drain's completion path may stop other
/// devices through their handles.
#[derive(Clone)]
pub(crate) struct StopHandle {
    connection: String,
    link: SharedLink,
    state: Arc<Mutex<DriverState>>,
    cancel: Arc<AtomicBool>,
    settle: Duration,
}

impl StopHandle {
    /// Returns false when the device was not capturing.
    pub(crate) fn stop(&self) -> bool {
        // A start publishes its capture under the link lock
        let mut guard = lock_link(&self.link);
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != DriverState::Capturing || self.cancel.load(Ordering::Acquire) {
                return false;
            }
            *state = DriverState::Idle;
        }

        log::info!("Aborting capture on {}", self.connection);
        self.cancel.store(true, Ordering::Release);

        let reopened = guard
            .as_mut()
            .is_some_and(|link| abort(link.as_mut(), &self.connection, self.settle));
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = if reopened {
            DriverState::Idle
        } else {
            DriverState::Disconnected
        };
        true
    }
}

/// Reads one capture's sample stream on a dedicated thread.
struct Drain {
    reader: Box<dyn Transport>,
    expected: u64,
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
    state: Arc<Mutex<DriverState>>,
    result: CaptureResult,
}

impl Drain {
    #[instrument(skip_all, fields(expected = self.expected))]
    fn run(mut self, on_complete: CompletionHandler) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("drain_samples"), 0));

        let samples = self.read_samples();
        self.cancel.store(true, Ordering::Release);

        let next = match &samples {
            Err(CaptureFailure::Transport(_)) => DriverState::Disconnected,
            _ => DriverState::Idle,
        };
        {
            // A stop or dispose already moved the driver on
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == DriverState::Capturing {
                *state = next;
            }
        }

        let outcome = match samples {
            Ok(samples) => {
                log::info!("Received {} samples", samples.len());
                Ok(CaptureResult {
                    samples,
                    ..self.result
                })
            }
            Err(CaptureFailure::Aborted) => {
                log::debug!("Sample drain stopped by abort");
                Err(CaptureFailure::Aborted)
            }
            Err(e) => {
                log::error!("Capture failed: {}", e);
                Err(e)
            }
        };

        on_complete(outcome);
    }

    fn read_samples(&mut self) -> Result<Vec<u128>, CaptureFailure> {
        let mut prefix = [0u8; 4];
        self.read(&mut prefix)?;
        let count = u32::from_le_bytes(prefix);
        if u64::from(count) > self.expected {
            return Err(CaptureFailure::UnexpectedLength {
                expected: self.expected,
                got: count,
            });
        }

        let mut raw = vec![0u8; count as usize * 4];
        self.read(&mut raw)?;

        Ok(raw
            .chunks_exact(4)
            .map(|word| u128::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]])))
            .collect())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), CaptureFailure> {
        read_exact_cancellable(self.reader.as_mut(), buf, &self.cancel, self.deadline).map_err(
            |e| {
                if self.cancel.load(Ordering::Acquire) {
                    return CaptureFailure::Aborted;
                }
                match e {
                    TransportError::Cancelled => CaptureFailure::Aborted,
                    TransportError::Timeout { .. } => CaptureFailure::DrainTimeout,
                    other => CaptureFailure::Transport(other),
                }
            },
        )
    }
}

/// One analyzer.
///
/// ```no_run
/// use logic_analyzer_rs::{
///     AnalyzerDriver, CaptureSession, DriverConfig, EdgeTrigger, LogicAnalyzer,
/// };
/// use std::time::Duration;
///
/// let mut analyzer = LogicAnalyzer::connect("/dev/ttyACM0", DriverConfig::default())?;
/// let session = CaptureSession::new(10_000_000, 512, 1024)
///     .with_channels([0, 1, 2])
///     .with_trigger(EdgeTrigger::rising(0));
///
/// let capture = analyzer.start_capture(&session)?.wait_for(Duration::from_secs(5))?;
/// println!("{} samples", capture.samples.len());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct LogicAnalyzer {
    connection: String,
    endpoint: Option<Endpoint>,
    network: bool,
    config: DriverConfig,
    link: SharedLink,
    version_line: Option<String>,
    version: Option<DeviceVersion>,
    profile: CapacityProfile,
    max_frequency: u32,
    channel_count: u8,
    state: Arc<Mutex<DriverState>>,
    cancel: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
}

impl LogicAnalyzer {
    /// Open `connection` (a serial port name or `ip:port`) and identify the device.
    pub fn connect(connection: &str, config: DriverConfig) -> Result<Self, DeviceConnectionError> {
        let endpoint =
            Endpoint::parse(connection).map_err(|e| DeviceConnectionError::new(connection, e))?;
        let transport = endpoint
            .open(&config)
            .map_err(|e| DeviceConnectionError::new(connection, e))?;

        let mut analyzer = Self::unidentified(connection, endpoint.is_network(), transport, config);
        analyzer.endpoint = Some(endpoint);
        analyzer
            .handshake()
            .map_err(|e| DeviceConnectionError::new(connection, e))?;
        Ok(analyzer)
    }

    /// Identify a device on an already open transport. `connection` names the device
    /// in errors and decides whether it counts as networked.
    pub fn with_transport(
        connection: &str,
        transport: Box<dyn Transport>,
        config: DriverConfig,
    ) -> Result<Self, DeviceConnectionError> {
        let network = Endpoint::parse(connection).is_ok_and(|e| e.is_network());
        let mut analyzer = Self::unidentified(connection, network, transport, config);
        analyzer
            .handshake()
            .map_err(|e| DeviceConnectionError::new(connection, e))?;
        Ok(analyzer)
    }

    fn unidentified(
        connection: &str,
        network: bool,
        transport: Box<dyn Transport>,
        config: DriverConfig,
    ) -> Self {
        Self {
            connection: connection.to_string(),
            endpoint: None,
            network,
            config,
            link: Arc::new(Mutex::new(Some(transport))),
            version_line: None,
            version: None,
            profile: CapacityProfile::Fixed,
            max_frequency: LEGACY_MAX_FREQUENCY,
            channel_count: LEGACY_CHANNEL_COUNT,
            state: Arc::new(Mutex::new(DriverState::Disconnected)),
            cancel: Arc::new(AtomicBool::new(false)),
            drain: None,
        }
    }

    fn handshake(&mut self) -> Result<(), ConnectionFailure> {
        self.set_state(DriverState::Handshaking);

        let identity = match lock_link(&self.link).as_mut() {
            Some(link) => identify(link.as_mut(), self.config.response_timeout),
            None => Err(TransportError::ConnectionClosed.into()),
        };

        match identity {
            Ok(identity) => {
                log::info!(
                    "Connected to {} ({}): {} channels, {} Hz, {} byte buffer",
                    self.connection,
                    identity.version,
                    identity.channel_count,
                    identity.max_frequency,
                    identity.profile.buffer_size()
                );
                self.version_line = Some(identity.line);
                self.version = Some(identity.version);
                self.profile = identity.profile;
                self.max_frequency = identity.max_frequency;
                self.channel_count = identity.channel_count;
                self.set_state(DriverState::Idle);
                Ok(())
            }
            Err(e) => {
                log::warn!("Handshake with {} failed: {}", self.connection, e);
                self.set_state(DriverState::Disconnected);
                Err(e)
            }
        }
    }

    /// Reopen the connection and identify the device again, for instance after a
    /// drain lost the transport.
    pub fn reconnect(&mut self) -> Result<(), DeviceConnectionError> {
        self.stop_capture();
        self.join_drain();

        let reopened = {
            let mut guard = lock_link(&self.link);
            if let Some(link) = guard.as_mut() {
                link.reopen().map_err(ConnectionFailure::from)
            } else if let Some(endpoint) = &self.endpoint {
                match endpoint.open(&self.config) {
                    Ok(link) => {
                        *guard = Some(link);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            } else {
                Err(TransportError::ConnectionClosed.into())
            }
        };

        reopened
            .and_then(|()| self.handshake())
            .map_err(|e| DeviceConnectionError::new(self.connection.as_str(), e))
    }

    /// Close the connection. The driver stays usable only through [`reconnect`](Self::reconnect).
    pub fn dispose(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.set_state(DriverState::Disconnected);
        if lock_link(&self.link).take().is_some() {
            log::debug!("Closed {}", self.connection);
        }
        self.version_line = None;
        self.version = None;
        self.join_drain();
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn version(&self) -> Option<DeviceVersion> {
        self.version
    }

    pub fn state(&self) -> DriverState {
        *self.state_guard()
    }

    fn state_guard(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DriverState) {
        *self.state_guard() = state;
    }

    fn join_drain(&mut self) {
        if let Some(handle) = self.drain.take() {
            if handle.join().is_err() {
                log::error!("Sample drain of {} panicked", self.connection);
            }
        }
    }

    /// Drop the handle of a previous drain, joining it only when it already ended.
    fn reap_drain(&mut self) {
        if let Some(handle) = self.drain.take() {
            if handle.is_finished() && handle.join().is_err() {
                log::error!("Sample drain of {} panicked", self.connection);
            }
        }
    }

    /// A handle on the capture currently running, valid until the next start.
    pub(crate) fn stop_handle(&self) -> StopHandle {
        StopHandle {
            connection: self.connection.clone(),
            link: Arc::clone(&self.link),
            state: Arc::clone(&self.state),
            cancel: Arc::clone(&self.cancel),
            settle: self.config.abort_settle,
        }
    }

    /// Store WiFi credentials and the listening endpoint on the device. Only possible
    /// over the serial connection.
    #[instrument(skip(self, settings), fields(connection = %self.connection))]
    pub fn send_network_config(&mut self, settings: &WifiSettings) -> Result<(), SettingsError> {
        if self.network {
            return Err(SettingsError::NetworkConnection);
        }

        let frame = settings.to_frame()?;
        let reply = self.exchange(&frame, SETTINGS_TIMEOUT)?;
        if reply != SETTINGS_SAVED {
            return Err(SettingsError::Rejected(reply));
        }

        log::info!(
            "Stored WiFi settings for '{}' on {}, listening on {}:{}",
            settings.access_point,
            self.connection,
            settings.address,
            settings.port
        );
        Ok(())
    }

    /// Supply readings of a device connected over the network.
    pub fn voltage_status(&mut self) -> Result<VoltageStatus, SettingsError> {
        if !self.network {
            return Err(SettingsError::NotNetworked);
        }

        let frame = framing::encode_command(Command::VoltageStatus, &[]);
        let reply = self.exchange(&frame, self.config.response_timeout)?;
        VoltageStatus::parse(&reply).ok_or(SettingsError::Rejected(reply))
    }

    /// Write one frame to an idle device and read its one-line answer.
    fn exchange(&mut self, frame: &[u8], timeout: Duration) -> Result<String, SettingsError> {
        match self.state() {
            DriverState::Idle => {}
            other => return Err(SettingsError::NotReady(other)),
        }

        let mut guard = lock_link(&self.link);
        let link = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        link.write_all(frame)
            .and_then(|()| link.flush())
            .map_err(TransportError::from)?;
        Ok(read_line(link.as_mut(), timeout)?)
    }

    #[instrument(skip(self, on_complete), fields(connection = %self.connection))]
    fn start(
        &mut self,
        session: &CaptureSession,
        pattern: bool,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError> {
        match self.state() {
            DriverState::Idle => {}
            DriverState::Capturing => return Err(CaptureError::Busy),
            other => {
                return Err(CaptureError::HardwareError(format!(
                    "Device is not ready ({:?})",
                    other
                )))
            }
        }

        let expected_trigger = match (pattern, session.trigger) {
            (false, Trigger::Edge(_)) | (true, Trigger::Complex(_) | Trigger::Fast(_)) => None,
            (false, _) => Some("Edge capture needs an edge trigger"),
            (true, _) => Some("Pattern capture needs a pattern trigger"),
        };
        if let Some(message) = expected_trigger {
            return Err(ParamError::WrongTriggerType(message).into());
        }

        let channels = session.channel_numbers();
        let limits = self.limits(&channels);
        driver::validate_session(
            session,
            self.channel_count,
            &limits,
            self.min_frequency(),
            self.max_frequency,
        )?;

        let mut request = CaptureRequest::from_session(session)
            .map_err(|_| ParamError::TooManyChannels(channels.len()))?;
        let offset = driver::trigger_offset(session.frequency, session.trigger_type());
        request.pre_samples += offset;
        request.post_samples = request.post_samples.saturating_sub(offset);
        let expected = u64::from(request.pre_samples)
            + u64::from(request.post_samples) * (u64::from(request.loop_count) + 1);

        // Held until the drain runs
        let shared = Arc::clone(&self.link);
        let mut guard = lock_link(&shared);
        let link = guard
            .as_mut()
            .ok_or_else(|| CaptureError::HardwareError("Transport is closed".to_string()))?;
        let reader = link.try_clone_transport().map_err(|e| {
            CaptureError::UnexpectedError(format!(
                "Cannot share the transport with the drain: {}",
                e
            ))
        })?;

        log::debug!("Sending capture request {:?}", request);
        link.write_all(&request.to_frame())
            .and_then(|()| link.flush())
            .map_err(|e| {
                CaptureError::HardwareError(format!("Failed to send capture request: {}", e))
            })?;

        let ack = read_line(link.as_mut(), self.config.response_timeout).map_err(|e| {
            CaptureError::HardwareError(format!("No capture acknowledgement: {}", e))
        })?;
        if ack != CAPTURE_STARTED {
            return Err(CaptureError::HardwareError(format!(
                "Device answered '{}'",
                ack
            )));
        }

        self.reap_drain();
        self.cancel = Arc::new(AtomicBool::new(false));
        self.set_state(DriverState::Capturing);

        let job = Drain {
            reader,
            expected,
            cancel: Arc::clone(&self.cancel),
            deadline: self.config.drain_timeout.map(|timeout| Instant::now() + timeout),
            state: Arc::clone(&self.state),
            result: CaptureResult {
                source: self.driver_type(),
                samples: Vec::new(),
                channels: session.channels.clone(),
                trigger_channel: session.trigger.channel(),
                pre_samples: session.pre_trigger_samples,
                frequency: session.frequency,
                loop_count: request.loop_count,
            },
        };

        let spawned = thread::Builder::new()
            .name(format!("drain {}", self.connection))
            .spawn(move || job.run(on_complete));

        match spawned {
            Ok(handle) => {
                self.drain = Some(handle);
                log::info!(
                    "Capture started on {}, {} samples expected",
                    self.connection,
                    expected
                );
                Ok(())
            }
            Err(e) => {
                abort(link.as_mut(), &self.connection, self.config.abort_settle);
                self.set_state(DriverState::Idle);
                Err(CaptureError::UnexpectedError(format!(
                    "Cannot spawn the sample drain: {}",
                    e
                )))
            }
        }
    }
}

impl AnalyzerDriver for LogicAnalyzer {
    fn device_version(&self) -> Option<String> {
        self.version_line.clone()
    }

    fn channel_count(&self) -> u8 {
        self.channel_count
    }

    fn max_frequency(&self) -> u32 {
        self.max_frequency
    }

    fn buffer_size(&self) -> u32 {
        self.profile.buffer_size()
    }

    fn driver_type(&self) -> DriverType {
        if self.network {
            DriverType::Network
        } else {
            DriverType::Serial
        }
    }

    fn is_capturing(&self) -> bool {
        self.state() == DriverState::Capturing
    }

    fn limits(&self, channels: &[u8]) -> CaptureLimits {
        self.profile.limits(self.capture_mode(channels))
    }

    fn start_capture_with(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError> {
        self.start(session, false, on_complete)
    }

    fn start_pattern_capture_with(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError> {
        self.start(session, true, on_complete)
    }

    fn stop_capture(&mut self) -> bool {
        if !self.stop_handle().stop() {
            return false;
        }
        self.join_drain();
        true
    }
}

impl Drop for LogicAnalyzer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CaptureOutcome;
    use crate::limits::ChannelMode;
    use crate::session::{EdgeTrigger, PatternBuilder, TriggerType};
    use crate::transport::mock::MockTransport;
    use std::net::Ipv4Addr;

    fn test_config() -> DriverConfig {
        DriverConfig::default()
            .with_response_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(1))
            .with_abort_settle(Duration::ZERO)
    }

    fn connected(version: &str) -> (LogicAnalyzer, MockTransport) {
        let mock = MockTransport::device(version);
        let analyzer =
            LogicAnalyzer::with_transport("/dev/ttyACM0", Box::new(mock.clone()), test_config())
                .unwrap();
        mock.clear_written();
        (analyzer, mock)
    }

    fn edge_session() -> CaptureSession {
        CaptureSession::new(10_000_000, 512, 1024)
            .with_channels([0, 1, 2])
            .with_trigger(EdgeTrigger::rising(0))
    }

    fn wait(pending: crate::driver::PendingCapture) -> CaptureOutcome {
        pending.wait_for(Duration::from_secs(5))
    }

    #[test]
    fn test_handshake_sends_identify_frame() {
        let mock = MockTransport::device("V5_0");
        let analyzer =
            LogicAnalyzer::with_transport("/dev/ttyACM0", Box::new(mock.clone()), test_config())
                .unwrap();

        assert_eq!(mock.written(), vec![0x55, 0xAA, 0x00, 0xAA, 0x55]);
        assert_eq!(analyzer.state(), DriverState::Idle);
        assert_eq!(analyzer.version(), Some(DeviceVersion::new(5, 0)));
        assert_eq!(
            analyzer.device_version().as_deref(),
            Some("LOGIC_ANALYZER_PICO_V5_0")
        );
        assert_eq!(analyzer.driver_type(), DriverType::Serial);
    }

    #[test]
    fn test_legacy_device_uses_fixed_table() {
        let (analyzer, _mock) = connected("V5_1");
        assert_eq!(analyzer.channel_count(), 24);
        assert_eq!(analyzer.max_frequency(), 100_000_000);
        assert_eq!(analyzer.min_frequency(), 3_051);

        let info = analyzer.device_info();
        assert_eq!(
            info.mode_limits[0],
            CapacityProfile::Fixed.limits(ChannelMode::Channels8)
        );
        assert_eq!(info.mode_limits[2].max_pre_samples, 24_576);
        assert_eq!(info.buffer_size, CapacityProfile::FIXED_BUFFER_SIZE);
    }

    #[test]
    fn test_extended_identification() {
        let mock = MockTransport::device("V6_5");
        mock.push_line("FREQ:200000000");
        mock.push_line("BUFFER:393216");
        mock.push_line("CHANNELS:24");

        let analyzer =
            LogicAnalyzer::with_transport("10.0.0.7:4045", Box::new(mock), test_config()).unwrap();
        assert_eq!(analyzer.max_frequency(), 200_000_000);
        assert_eq!(analyzer.buffer_size(), 393_216);
        assert_eq!(analyzer.driver_type(), DriverType::Network);

        let limits = analyzer.limits(&[0, 3]);
        assert_eq!(limits.max_pre_samples, 39_321);
        assert_eq!(limits.max_post_samples, 393_214);
    }

    #[test]
    fn test_malformed_extended_line() {
        let mock = MockTransport::device("V6_5");
        mock.push_line("FREQ:200000000");
        mock.push_line("BUFFER:lots");

        let err = LogicAnalyzer::with_transport("/dev/ttyACM3", Box::new(mock), test_config())
            .err()
            .unwrap();
        assert_eq!(err.connection, "/dev/ttyACM3");
        assert!(matches!(
            err.cause,
            ConnectionFailure::InvalidResponse {
                field: "buffer size",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_old_firmware() {
        let mock = MockTransport::device("V4_9");
        let err = LogicAnalyzer::with_transport("/dev/ttyACM0", Box::new(mock), test_config())
            .err()
            .unwrap();
        assert!(matches!(
            err.cause,
            ConnectionFailure::UnsupportedVersion { .. }
        ));
    }

    #[test]
    fn test_silent_device_times_out() {
        let mock = MockTransport::new();
        let err = LogicAnalyzer::with_transport("/dev/ttyACM0", Box::new(mock), test_config())
            .err()
            .unwrap();
        assert!(matches!(
            err.cause,
            ConnectionFailure::Transport(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_bad_params_never_reach_the_wire() {
        let (mut analyzer, mock) = connected("V5_0");
        let session = CaptureSession::new(10_000_000, 1, 1024).with_channels([0, 1]);

        let err = analyzer.start_capture(&session).err().unwrap();
        assert!(matches!(
            err,
            CaptureError::BadParams(ParamError::PreSamples { value: 1, .. })
        ));
        assert!(mock.written().is_empty());
        assert_eq!(analyzer.state(), DriverState::Idle);
    }

    #[test]
    fn test_capture_end_to_end() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(CAPTURE_STARTED);
        mock.push_samples(&[0b001, 0b010, 0b111]);

        let pending = analyzer.start_capture(&edge_session()).unwrap();
        let capture = wait(pending).unwrap();

        let request = CaptureRequest::from_frame(&mock.written()).unwrap();
        assert_eq!(request.trigger_type, TriggerType::Edge);
        assert_eq!(request.trigger, 0);
        assert_eq!(request.inverted_or_count, 0);
        assert_eq!(request.channel_count, 3);
        assert_eq!(&request.channels[..4], &[0, 1, 2, 0]);
        assert_eq!(request.frequency, 10_000_000);
        assert_eq!(request.pre_samples, 512);
        assert_eq!(request.post_samples, 1024);

        assert_eq!(capture.samples, vec![0b001, 0b010, 0b111]);
        assert_eq!(capture.channel_count(), 3);
        assert_eq!(capture.pre_samples, 512);
        assert_eq!(capture.source, DriverType::Serial);
        assert_eq!(analyzer.state(), DriverState::Idle);
    }

    #[test]
    fn test_second_start_is_busy() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(CAPTURE_STARTED);

        let pending = analyzer.start_capture(&edge_session()).unwrap();
        assert!(analyzer.is_capturing());
        mock.clear_written();

        assert!(matches!(
            analyzer.start_capture(&edge_session()),
            Err(CaptureError::Busy)
        ));
        assert!(mock.written().is_empty());

        assert!(analyzer.stop_capture());
        assert!(matches!(wait(pending), Err(CaptureFailure::Aborted)));
    }

    #[test]
    fn test_stop_aborts_and_reopens() {
        let (mut analyzer, mock) = connected("V5_0");
        assert!(!analyzer.stop_capture());
        assert_eq!(mock.reopen_count(), 0);

        mock.push_line(CAPTURE_STARTED);
        let pending = analyzer.start_capture(&edge_session()).unwrap();
        mock.clear_written();

        assert!(analyzer.stop_capture());
        assert_eq!(mock.written(), vec![ABORT_BYTE]);
        assert_eq!(mock.reopen_count(), 1);
        assert_eq!(analyzer.state(), DriverState::Idle);
        assert!(matches!(wait(pending), Err(CaptureFailure::Aborted)));

        assert!(!analyzer.stop_capture());
        assert_eq!(mock.reopen_count(), 1);
    }

    #[test]
    fn test_rejected_request_is_a_hardware_error() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line("CAPTURE_ERROR");

        assert!(matches!(
            analyzer.start_capture(&edge_session()),
            Err(CaptureError::HardwareError(_))
        ));
        assert_eq!(analyzer.state(), DriverState::Idle);
    }

    #[test]
    fn test_lost_connection_reports_failure() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(CAPTURE_STARTED);

        let pending = analyzer.start_capture(&edge_session()).unwrap();
        mock.break_connection();

        assert!(matches!(
            wait(pending),
            Err(CaptureFailure::Transport(TransportError::Io(_)))
        ));
        assert_eq!(analyzer.state(), DriverState::Disconnected);
        assert!(matches!(
            analyzer.start_capture(&edge_session()),
            Err(CaptureError::HardwareError(_))
        ));

        mock.push_line("LOGIC_ANALYZER_PICO_V5_0");
        analyzer.reconnect().unwrap();
        assert_eq!(analyzer.state(), DriverState::Idle);
        assert_eq!(mock.reopen_count(), 1);
    }

    #[test]
    fn test_drain_timeout() {
        let mock = MockTransport::device("V5_0");
        let config = test_config().with_drain_timeout(Some(Duration::from_millis(20)));
        let mut analyzer =
            LogicAnalyzer::with_transport("/dev/ttyACM0", Box::new(mock.clone()), config).unwrap();
        mock.push_line(CAPTURE_STARTED);
        mock.push_bytes(&[3, 0, 0, 0, 1]);

        let pending = analyzer.start_capture(&edge_session()).unwrap();
        assert!(matches!(wait(pending), Err(CaptureFailure::DrainTimeout)));
        assert_eq!(analyzer.state(), DriverState::Idle);
    }

    #[test]
    fn test_oversized_sample_count() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(CAPTURE_STARTED);
        mock.push_bytes(&u32::MAX.to_le_bytes());

        let pending = analyzer.start_capture(&edge_session()).unwrap();
        assert!(matches!(
            wait(pending),
            Err(CaptureFailure::UnexpectedLength {
                expected: 1536,
                got: u32::MAX
            })
        ));
    }

    #[test]
    fn test_pattern_capture_shifts_window() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(CAPTURE_STARTED);
        mock.push_samples(&[0; 4]);

        let session = CaptureSession::new(100_000_000, 100, 1000)
            .with_channels([0, 1, 2, 3])
            .with_bursts(2)
            .with_trigger(PatternBuilder::starting_at(0).high().low().complex());

        // Edge entry point refuses pattern sessions
        assert!(matches!(
            analyzer.start_capture(&session),
            Err(CaptureError::BadParams(ParamError::WrongTriggerType(_)))
        ));

        let pending = analyzer.start_pattern_capture(&session).unwrap();
        let capture = wait(pending).unwrap();

        let request = CaptureRequest::from_frame(&mock.written()).unwrap();
        assert_eq!(request.trigger_type, TriggerType::Complex);
        assert_eq!(request.inverted_or_count, 2);
        assert_eq!(request.trigger_value, 0b01);
        assert_eq!(request.pre_samples, 105);
        assert_eq!(request.post_samples, 995);
        assert_eq!(request.loop_count, 0);

        assert_eq!(capture.pre_samples, 100);
        assert_eq!(capture.loop_count, 0);
    }

    #[test]
    fn test_dispose_releases_connection() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(CAPTURE_STARTED);
        let pending = analyzer.start_capture(&edge_session()).unwrap();

        drop(analyzer);
        assert!(matches!(wait(pending), Err(CaptureFailure::Aborted)));
        assert_eq!(mock.handle_count(), 1);
    }

    #[test]
    fn test_dispose_forgets_identity() {
        let (mut analyzer, mock) = connected("V5_0");
        analyzer.dispose();

        assert_eq!(analyzer.version(), None);
        assert_eq!(analyzer.device_version(), None);
        assert_eq!(analyzer.state(), DriverState::Disconnected);
        assert_eq!(mock.handle_count(), 1);
        assert!(matches!(
            analyzer.start_capture(&edge_session()),
            Err(CaptureError::HardwareError(_))
        ));
        assert!(mock.written().is_empty());
    }

    fn lab_settings() -> WifiSettings {
        WifiSettings::new("lab", "hunter2", Ipv4Addr::new(192, 168, 1, 20), 4045)
    }

    fn networked(version: &str) -> (LogicAnalyzer, MockTransport) {
        let mock = MockTransport::device(version);
        let analyzer =
            LogicAnalyzer::with_transport("10.0.0.7:4045", Box::new(mock.clone()), test_config())
                .unwrap();
        mock.clear_written();
        (analyzer, mock)
    }

    #[test]
    fn test_network_config_over_serial() {
        let (mut analyzer, mock) = connected("V5_0");
        mock.push_line(SETTINGS_SAVED);

        analyzer.send_network_config(&lab_settings()).unwrap();
        let payload = framing::decode(&mock.written()).unwrap();
        assert_eq!(payload[0], Command::NetworkSettings.id());
        assert_eq!(&payload[1..], &lab_settings().encode().unwrap()[..]);
        assert_eq!(analyzer.state(), DriverState::Idle);

        // Firmware built without WiFi
        mock.push_line("ERR_UNSUPPORTED");
        assert!(matches!(
            analyzer.send_network_config(&lab_settings()),
            Err(SettingsError::Rejected(reply)) if reply == "ERR_UNSUPPORTED"
        ));
    }

    #[test]
    fn test_network_config_refusals() {
        let (mut remote, remote_mock) = networked("V5_0");
        assert!(matches!(
            remote.send_network_config(&lab_settings()),
            Err(SettingsError::NetworkConnection)
        ));
        assert!(remote_mock.written().is_empty());

        let (mut analyzer, mock) = connected("V5_0");
        let long_name = WifiSettings {
            access_point: "x".repeat(40),
            ..lab_settings()
        };
        assert!(matches!(
            analyzer.send_network_config(&long_name),
            Err(SettingsError::Record(RequestError::InvalidText { max: 32, .. }))
        ));

        mock.push_line(CAPTURE_STARTED);
        let pending = analyzer.start_capture(&edge_session()).unwrap();
        mock.clear_written();
        assert!(matches!(
            analyzer.send_network_config(&lab_settings()),
            Err(SettingsError::NotReady(DriverState::Capturing))
        ));
        assert!(mock.written().is_empty());

        analyzer.stop_capture();
        assert!(matches!(wait(pending), Err(CaptureFailure::Aborted)));
    }

    #[test]
    fn test_voltage_status() {
        let (mut analyzer, mock) = networked("V5_0");
        mock.push_line("4.87_1");

        let status = analyzer.voltage_status().unwrap();
        assert!((status.vsys - 4.87).abs() < 1e-6);
        assert!(status.usb_powered);
        assert_eq!(mock.written(), vec![0x55, 0xAA, 0x03, 0xAA, 0x55]);

        mock.push_line("ERR_UNSUPPORTED");
        assert!(matches!(
            analyzer.voltage_status(),
            Err(SettingsError::Rejected(_))
        ));

        let (mut serial, serial_mock) = connected("V5_0");
        assert!(matches!(
            serial.voltage_status(),
            Err(SettingsError::NotNetworked)
        ));
        assert!(serial_mock.written().is_empty());
    }

    #[test]
    fn test_voltage_status_line() {
        assert_eq!(
            VoltageStatus::parse("3.30_0"),
            Some(VoltageStatus {
                vsys: 3.3,
                usb_powered: false
            })
        );
        assert_eq!(VoltageStatus::parse("3.30_2"), None);
        assert_eq!(VoltageStatus::parse("3.30"), None);
        assert_eq!(VoltageStatus::parse("volts_1"), None);
    }
}
