//! Several analyzers acting as one wide analyzer.
//!
//! Device 0 is the master: it evaluates the pattern trigger and drives the trigger
//! output wired to the external trigger input of every other device. Channels are
//! assigned to devices in blocks of the narrowest device's channel count, and the
//! per-device sample words are bit-interleaved back into one word per sample.

use crate::analyzer::{ConnectionFailure, DeviceConnectionError, LogicAnalyzer, StopHandle};
use crate::config::DriverConfig;
use crate::driver::{
    self, AnalyzerDriver, CaptureError, CaptureFailure, CaptureOutcome, CompletionHandler,
    DriverType, ParamError,
};
use crate::limits::{CaptureLimits, ChannelMode};
use crate::result::CaptureResult;
use crate::session::{AnalyzerChannel, CaptureSession, EdgeTrigger, Trigger};
use crate::transport::Transport;
use crate::version::DeviceVersion;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::instrument;

pub const MIN_DEVICES: usize = 2;
pub const MAX_DEVICES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum MultiConnectError {
    #[error("Invalid devices specified, {MIN_DEVICES} to {MAX_DEVICES} connection strings must be provided, got {0}")]
    InvalidDeviceCount(usize),

    #[error(transparent)]
    Device(#[from] DeviceConnectionError),
}

/// Bit-interleave per-device sample streams.
///
/// Each part is a device's samples with the number of channels it captured. For every
/// sample index the parts are masked to their width and packed from bit 0 upwards in
/// the given order. Streams of unequal length are cut to the shortest.
pub fn merge_samples(parts: &[(&[u128], usize)]) -> Vec<u128> {
    #[cfg(feature = "cpu-profiling")]
    let _zone = tracy_client::Client::running()
        .map(|client| client.span(tracy_client::span_location!("merge_samples"), 0));

    let length = parts
        .iter()
        .map(|(samples, _)| samples.len())
        .min()
        .unwrap_or(0);
    if parts.iter().any(|(samples, _)| samples.len() != length) {
        log::warn!(
            "Devices returned different sample counts {:?}, keeping {}",
            parts.iter().map(|(s, _)| s.len()).collect::<Vec<_>>(),
            length
        );
    }

    (0..length)
        .map(|index| {
            let mut word = 0u128;
            let mut bit = 0u32;
            for (samples, width) in parts {
                let mask = match *width {
                    0 => 0,
                    w if w >= 128 => u128::MAX,
                    w => (1u128 << w) - 1,
                };
                word |= (samples[index] & mask).checked_shl(bit).unwrap_or(0);
                bit = bit.saturating_add(*width as u32);
            }
            word
        })
        .collect()
}

struct AggregationState {
    /// Indexed by capture tag: master first, then the slaves that capture anything.
    parts: Vec<Option<Vec<u128>>>,
    widths: Vec<usize>,
    devices: Vec<usize>,
    on_complete: Option<CompletionHandler>,
    template: Option<CaptureResult>,
    /// Devices already capturing, stopped when another one fails.
    running: Vec<StopHandle>,
}

/// Collects the completions of one multi-device capture. Owned by that capture only.
struct Aggregation {
    state: Mutex<AggregationState>,
}

impl Aggregation {
    fn new(
        widths: Vec<usize>,
        devices: Vec<usize>,
        template: CaptureResult,
        on_complete: CompletionHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AggregationState {
                parts: vec![None; widths.len()],
                widths,
                devices,
                on_complete: Some(on_complete),
                template: Some(template),
                running: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(self: &Arc<Self>, tag: usize) -> CompletionHandler {
        let aggregation = Arc::clone(self);
        Box::new(move |outcome| aggregation.report(tag, outcome))
    }

    fn is_active(&self) -> bool {
        self.lock().on_complete.is_some()
    }

    /// End the capture without reporting; returns the caller's handler if it was still pending.
    fn cancel(&self) -> Option<CompletionHandler> {
        let mut state = self.lock();
        state.running.clear();
        state.on_complete.take()
    }

    /// Track a device that started capturing. False when the capture already ended.
    fn watch(&self, device: StopHandle) -> bool {
        let mut state = self.lock();
        if state.on_complete.is_none() {
            return false;
        }
        state.running.push(device);
        true
    }

    fn report(&self, tag: usize, outcome: CaptureOutcome) {
        let (on_complete, merged, running) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.on_complete.is_none() {
                return;
            }

            match outcome {
                Err(e) => {
                    let device = state.devices.get(tag).copied().unwrap_or(tag);
                    log::error!("Device {} failed, abandoning the capture: {}", device, e);
                    let failure = CaptureFailure::Device {
                        tag: device,
                        source: Box::new(e),
                    };
                    let running = std::mem::take(&mut state.running);
                    (state.on_complete.take(), Err(failure), running)
                }
                Ok(result) => {
                    if let Some(slot) = state.parts.get_mut(tag) {
                        *slot = Some(result.samples);
                    }
                    let reported = state.parts.iter().filter(|p| p.is_some()).count();
                    log::debug!("Device tag {} reported ({}/{})", tag, reported, state.parts.len());
                    if reported < state.parts.len() {
                        return;
                    }

                    let parts: Vec<(Vec<u128>, usize)> = state
                        .parts
                        .iter_mut()
                        .zip(&state.widths)
                        .map(|(part, width)| (part.take().unwrap_or_default(), *width))
                        .collect();
                    state.running.clear();
                    let merged = Ok((parts, state.template.take()));
                    (state.on_complete.take(), merged, Vec::new())
                }
            }
        };

        // Stop, merge and deliver without holding the lock
        for device in &running {
            device.stop();
        }
        let Some(on_complete) = on_complete else {
            return;
        };
        let outcome = merged.and_then(|(parts, template)| {
            let views: Vec<(&[u128], usize)> = parts
                .iter()
                .map(|(samples, width)| (samples.as_slice(), *width))
                .collect();
            let samples = merge_samples(&views);
            log::info!("Merged {} samples from {} devices", samples.len(), parts.len());
            template
                .map(|template| CaptureResult {
                    samples,
                    ..template
                })
                .ok_or(CaptureFailure::Abandoned)
        });
        on_complete(outcome);
    }
}

/// Two to five analyzers of the same firmware version driven as one.
pub struct MultiAnalyzer {
    devices: Vec<LogicAnalyzer>,
    version: DeviceVersion,
    aggregation: Option<Arc<Aggregation>>,
}

impl MultiAnalyzer {
    /// Connect to every device in order; the first connection string is the master.
    pub fn connect(connections: &[&str], config: DriverConfig) -> Result<Self, MultiConnectError> {
        Self::check_count(connections.len())?;
        Self::assemble(
            connections
                .iter()
                .map(|connection| LogicAnalyzer::connect(connection, config.clone())),
        )
    }

    /// Like [`connect`](Self::connect) over already open transports.
    pub fn with_transports(
        transports: Vec<(String, Box<dyn Transport>)>,
        config: DriverConfig,
    ) -> Result<Self, MultiConnectError> {
        Self::check_count(transports.len())?;
        Self::assemble(transports.into_iter().map(|(connection, transport)| {
            LogicAnalyzer::with_transport(&connection, transport, config.clone())
        }))
    }

    fn check_count(count: usize) -> Result<(), MultiConnectError> {
        if (MIN_DEVICES..=MAX_DEVICES).contains(&count) {
            Ok(())
        } else {
            Err(MultiConnectError::InvalidDeviceCount(count))
        }
    }

    /// Devices already connected are dropped, and so disconnected, on the first failure.
    fn assemble(
        devices: impl Iterator<Item = Result<LogicAnalyzer, DeviceConnectionError>>,
    ) -> Result<Self, MultiConnectError> {
        let mut connected: Vec<LogicAnalyzer> = Vec::new();
        let mut baseline: Option<DeviceVersion> = None;

        for device in devices {
            let device = device?;
            let Some(found) = device.version() else {
                return Err(DeviceConnectionError::new(
                    device.connection(),
                    ConnectionFailure::UnsupportedVersion {
                        found: device.device_version().unwrap_or_default(),
                    },
                )
                .into());
            };

            match baseline {
                None => baseline = Some(found),
                Some(baseline) if baseline != found => {
                    return Err(DeviceConnectionError::new(
                        device.connection(),
                        ConnectionFailure::VersionMismatch { baseline, found },
                    )
                    .into());
                }
                Some(_) => {}
            }
            connected.push(device);
        }

        let Some(version) = baseline else {
            return Err(MultiConnectError::InvalidDeviceCount(connected.len()));
        };

        log::info!(
            "Connected {} devices as one analyzer, firmware {}",
            connected.len(),
            version
        );
        Ok(Self {
            devices: connected,
            version,
            aggregation: None,
        })
    }

    pub fn devices(&self) -> &[LogicAnalyzer] {
        &self.devices
    }

    /// Channels assigned to each device.
    fn stride(&self) -> u8 {
        self.devices
            .iter()
            .map(AnalyzerDriver::channel_count)
            .min()
            .unwrap_or(0)
    }

    /// Group `channels` by device, keeping the caller's numbering.
    fn split_channels(&self, channels: &[AnalyzerChannel]) -> Vec<Vec<AnalyzerChannel>> {
        let stride = usize::from(self.stride());
        (0..self.devices.len())
            .map(|device| {
                let first = device * stride;
                channels
                    .iter()
                    .filter(|c| (first..first + stride).contains(&usize::from(c.number)))
                    .cloned()
                    .collect()
            })
            .collect()
    }

    /// Channel numbers as seen by device `device`.
    fn local_channels(&self, device: usize, channels: &[AnalyzerChannel]) -> Vec<AnalyzerChannel> {
        let first = device * usize::from(self.stride());
        channels
            .iter()
            .map(|c| AnalyzerChannel {
                number: (usize::from(c.number) - first) as u8,
                ..c.clone()
            })
            .collect()
    }

    fn split_numbers(&self, channels: &[u8]) -> Vec<Vec<u8>> {
        let stride = self.stride();
        (0..self.devices.len())
            .map(|device| {
                let first = device as u32 * u32::from(stride);
                channels
                    .iter()
                    .filter(|c| (first..first + u32::from(stride)).contains(&u32::from(**c)))
                    .map(|c| (u32::from(*c) - first) as u8)
                    .collect()
            })
            .collect()
    }

    #[instrument(skip(self, on_complete), fields(devices = self.devices.len()))]
    fn start_group(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError> {
        if self.is_capturing() {
            return Err(CaptureError::Busy);
        }

        let numbers = session.channel_numbers();
        let limits = self.limits(&numbers);
        driver::validate_session(
            session,
            self.channel_count(),
            &limits,
            self.min_frequency(),
            self.max_frequency(),
        )?;

        let layout = self.split_channels(&session.channels);
        if layout.first().is_none_or(Vec::is_empty) {
            return Err(ParamError::MasterWithoutChannels.into());
        }

        if self.devices.iter().any(AnalyzerDriver::is_capturing) {
            log::warn!("Stopping devices left running by a failed capture");
            self.stop_capture();
        }

        let offset = driver::trigger_offset(session.frequency, session.trigger_type());

        // Tag 0 is the master, slaves with channels follow in device order
        let participants: Vec<usize> = (0..self.devices.len())
            .filter(|device| !layout[*device].is_empty())
            .collect();
        let template = CaptureResult {
            source: DriverType::Multi,
            samples: Vec::new(),
            channels: participants
                .iter()
                .flat_map(|device| layout[*device].iter().cloned())
                .collect(),
            trigger_channel: session.trigger.channel(),
            pre_samples: session.pre_trigger_samples,
            frequency: session.frequency,
            loop_count: 0,
        };
        let aggregation = Aggregation::new(
            participants.iter().map(|device| layout[*device].len()).collect(),
            participants.clone(),
            template,
            on_complete,
        );

        // The master triggers everything else, so it starts last
        for (tag, &device) in participants.iter().enumerate().skip(1) {
            let external_input = self.devices[device].channel_count();
            let slave_session = CaptureSession {
                frequency: session.frequency,
                pre_trigger_samples: session.pre_trigger_samples + offset,
                post_trigger_samples: session.post_trigger_samples.saturating_sub(offset),
                loop_count: 0,
                measure_bursts: false,
                channels: self.local_channels(device, &layout[device]),
                trigger: Trigger::Edge(EdgeTrigger::rising(external_input)),
            };

            let started =
                self.devices[device].start_capture_with(&slave_session, aggregation.handler(tag));
            if let Err(e) = started {
                log::warn!("Device {} refused the capture: {}", device, e);
                aggregation.cancel();
                self.stop_capture();
                return Err(e);
            }
            if !self.watch_started(&aggregation, device) {
                return Ok(());
            }
        }

        let mut master_session = session.clone();
        master_session.channels = self.local_channels(0, &layout[0]);
        let started =
            self.devices[0].start_pattern_capture_with(&master_session, aggregation.handler(0));
        if let Err(e) = started {
            log::warn!("Master refused the capture: {}", e);
            aggregation.cancel();
            self.stop_capture();
            return Err(e);
        }
        if !self.watch_started(&aggregation, 0) {
            return Ok(());
        }

        log::info!(
            "Capture started on {} devices, trigger offset {} samples",
            participants.len(),
            offset
        );
        self.aggregation = Some(aggregation);
        Ok(())
    }

    /// Hand a started device to the aggregation. When the capture already ended, its
    /// outcome has been delivered and the group is stopped instead.
    fn watch_started(&mut self, aggregation: &Aggregation, device: usize) -> bool {
        if aggregation.watch(self.devices[device].stop_handle()) {
            return true;
        }
        log::debug!("Capture ended while device {} was starting", device);
        self.stop_capture();
        false
    }

    pub fn dispose(&mut self) {
        if let Some(aggregation) = self.aggregation.take() {
            aggregation.cancel();
        }
        for device in &mut self.devices {
            device.dispose();
        }
    }
}

impl AnalyzerDriver for MultiAnalyzer {
    fn device_version(&self) -> Option<String> {
        Some(format!(
            "MULTI_ANALYZER_{}_{}",
            self.version.major, self.version.minor
        ))
    }

    fn channel_count(&self) -> u8 {
        self.stride().saturating_mul(self.devices.len() as u8)
    }

    fn max_frequency(&self) -> u32 {
        self.devices
            .iter()
            .map(AnalyzerDriver::max_frequency)
            .min()
            .unwrap_or(0)
    }

    fn min_frequency(&self) -> u32 {
        self.devices
            .iter()
            .map(AnalyzerDriver::min_frequency)
            .max()
            .unwrap_or(0)
    }

    fn buffer_size(&self) -> u32 {
        self.devices
            .iter()
            .map(AnalyzerDriver::buffer_size)
            .min()
            .unwrap_or(0)
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Multi
    }

    fn is_capturing(&self) -> bool {
        self.aggregation
            .as_ref()
            .is_some_and(|aggregation| aggregation.is_active())
    }

    fn capture_mode(&self, channels: &[u8]) -> ChannelMode {
        self.split_numbers(channels)
            .iter()
            .map(|local| ChannelMode::for_channels(local))
            .max()
            .unwrap_or(ChannelMode::Channels8)
    }

    /// The envelope every device accepts for its share of `channels`.
    fn limits(&self, channels: &[u8]) -> CaptureLimits {
        self.devices
            .iter()
            .zip(self.split_numbers(channels))
            .map(|(device, local)| device.limits(&local))
            .reduce(|a, b| a.intersect(&b))
            .unwrap_or(CaptureLimits {
                min_pre_samples: 0,
                max_pre_samples: 0,
                min_post_samples: 0,
                max_post_samples: 0,
            })
    }

    /// Edge triggers cannot be propagated between devices; pattern sessions are
    /// forwarded to the pattern path.
    fn start_capture_with(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError> {
        if !session.trigger_type().is_pattern() {
            return Err(CaptureError::HardwareError(
                "Edge-triggered capture is not supported across multiple devices".to_string(),
            ));
        }
        self.start_group(session, on_complete)
    }

    fn start_pattern_capture_with(
        &mut self,
        session: &CaptureSession,
        on_complete: CompletionHandler,
    ) -> Result<(), CaptureError> {
        if !session.trigger_type().is_pattern() {
            return Err(
                ParamError::WrongTriggerType("Pattern capture needs a pattern trigger").into(),
            );
        }
        self.start_group(session, on_complete)
    }

    fn stop_capture(&mut self) -> bool {
        let pending = self
            .aggregation
            .take()
            .and_then(|aggregation| aggregation.cancel());

        let mut stopped = pending.is_some();
        for device in &mut self.devices {
            stopped |= device.stop_capture();
        }

        if let Some(on_complete) = pending {
            on_complete(Err(CaptureFailure::Aborted));
        }
        stopped
    }
}

impl Drop for MultiAnalyzer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PendingCapture;
    use crate::framing::ABORT_BYTE;
    use crate::limits::CapacityProfile;
    use crate::request::CaptureRequest;
    use crate::session::{PatternBuilder, TriggerType};
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    fn test_config() -> DriverConfig {
        DriverConfig::default()
            .with_response_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(1))
            .with_abort_settle(Duration::ZERO)
    }

    fn transports(mocks: &[MockTransport]) -> Vec<(String, Box<dyn Transport>)> {
        mocks
            .iter()
            .enumerate()
            .map(|(i, mock)| {
                let transport: Box<dyn Transport> = Box::new(mock.clone());
                (format!("/dev/ttyACM{}", i), transport)
            })
            .collect()
    }

    fn group(count: usize) -> (MultiAnalyzer, Vec<MockTransport>) {
        let mocks: Vec<MockTransport> = (0..count).map(|_| MockTransport::device("V5_0")).collect();
        let multi = MultiAnalyzer::with_transports(transports(&mocks), test_config()).unwrap();
        for mock in &mocks {
            mock.clear_written();
        }
        (multi, mocks)
    }

    fn pattern_session(channels: impl IntoIterator<Item = u8>) -> CaptureSession {
        CaptureSession::new(100_000_000, 100, 1000)
            .with_channels(channels)
            .with_trigger(PatternBuilder::starting_at(0).high().complex())
    }

    #[test]
    fn test_merge_formula() {
        let device0 = [0b1111_0101u128, 0b0000_0010];
        let device1 = [0b1010_0011u128, 0b1111_1101];
        let merged = merge_samples(&[(&device0, 3), (&device1, 4)]);

        for (index, word) in merged.iter().enumerate() {
            let expected = (device0[index] & 0b111) | ((device1[index] & 0b1111) << 3);
            assert_eq!(*word, expected);
        }
        assert_eq!(merged, vec![0b0011101, 0b1101010]);
    }

    #[test]
    fn test_merge_cuts_to_shortest() {
        let merged = merge_samples(&[(&[1, 1, 1], 1), (&[1, 0], 1)]);
        assert_eq!(merged, vec![0b11, 0b01]);
        assert!(merge_samples(&[]).is_empty());
    }

    #[test]
    fn test_merge_five_full_devices() {
        let full = [0xFF_FFFFu128];
        let parts: Vec<(&[u128], usize)> = (0..5).map(|_| (&full[..], 24)).collect();
        assert_eq!(merge_samples(&parts), vec![(1u128 << 120) - 1]);
    }

    fn device_result(samples: Vec<u128>) -> CaptureResult {
        CaptureResult {
            source: DriverType::Serial,
            samples,
            channels: Vec::new(),
            trigger_channel: 0,
            pre_samples: 0,
            frequency: 0,
            loop_count: 0,
        }
    }

    fn aggregate(order: &[usize]) -> CaptureOutcome {
        let (pending, handler) = PendingCapture::channel();
        let template = CaptureResult {
            source: DriverType::Multi,
            ..device_result(Vec::new())
        };
        let aggregation = Aggregation::new(vec![2, 3], vec![0, 1], template, handler);
        let results = [vec![0b01u128, 0b10], vec![0b101u128, 0b011]];

        for &tag in order {
            assert!(aggregation.is_active());
            aggregation.handler(tag)(Ok(device_result(results[tag].clone())));
        }
        assert!(!aggregation.is_active());
        pending.wait_for(Duration::from_secs(1))
    }

    #[test]
    fn test_completion_order_does_not_matter() {
        let in_order = aggregate(&[0, 1]).unwrap();
        let reversed = aggregate(&[1, 0]).unwrap();
        assert_eq!(in_order.samples, vec![0b10101, 0b01110]);
        assert_eq!(in_order.samples, reversed.samples);
        assert_eq!(in_order.source, DriverType::Multi);
    }

    #[test]
    fn test_device_failure_ends_aggregation() {
        let (pending, handler) = PendingCapture::channel();
        let aggregation = Aggregation::new(
            vec![1, 1],
            vec![0, 2],
            device_result(Vec::new()),
            handler,
        );

        aggregation.handler(1)(Err(CaptureFailure::DrainTimeout));
        // Late reports are ignored
        aggregation.handler(0)(Ok(device_result(vec![1])));

        match pending.wait_for(Duration::from_secs(1)) {
            Err(CaptureFailure::Device { tag, source }) => {
                assert_eq!(tag, 2);
                assert!(matches!(*source, CaptureFailure::DrainTimeout));
            }
            other => unreachable!("expected device failure, got {:?}", other),
        }
    }

    #[test]
    fn test_device_count_checked_before_connecting() {
        for count in [0, 1, 6] {
            let mocks: Vec<MockTransport> =
                (0..count).map(|_| MockTransport::device("V5_0")).collect();
            let err = MultiAnalyzer::with_transports(transports(&mocks), test_config())
                .err()
                .unwrap();
            assert!(matches!(err, MultiConnectError::InvalidDeviceCount(n) if n == count));
            assert!(mocks.iter().all(|mock| mock.written().is_empty()));
        }
    }

    #[test]
    fn test_version_mismatch_fails_construction() {
        let mocks = [MockTransport::device("V5_0"), MockTransport::device("V5_1")];
        let err = MultiAnalyzer::with_transports(transports(&mocks), test_config())
            .err()
            .unwrap();

        match err {
            MultiConnectError::Device(DeviceConnectionError { connection, cause }) => {
                assert_eq!(connection, "/dev/ttyACM1");
                assert!(matches!(
                    cause,
                    ConnectionFailure::VersionMismatch { baseline, found }
                        if baseline == DeviceVersion::new(5, 0) && found == DeviceVersion::new(5, 1)
                ));
            }
            other => unreachable!("expected a connection error, got {:?}", other),
        }
        assert!(mocks.iter().all(|mock| mock.handle_count() == 1));
    }

    #[test]
    fn test_group_capabilities() {
        let (multi, _mocks) = group(2);
        assert_eq!(multi.channel_count(), 48);
        assert_eq!(multi.device_version().as_deref(), Some("MULTI_ANALYZER_5_0"));
        assert_eq!(multi.driver_type(), DriverType::Multi);
        assert_eq!(multi.max_frequency(), 100_000_000);
        assert_eq!(multi.min_frequency(), 3_051);

        // Channel 40 is channel 16 of the second device
        assert_eq!(multi.capture_mode(&[0, 40]), ChannelMode::Channels24);
        assert_eq!(
            multi.limits(&[0, 40]),
            CapacityProfile::Fixed.limits(ChannelMode::Channels24)
        );
        assert_eq!(
            multi.limits(&[0, 30]),
            CapacityProfile::Fixed.limits(ChannelMode::Channels8)
        );
    }

    fn extended(frequency: u32, buffer: u32, channels: u8) -> MockTransport {
        let mock = MockTransport::device("V6_5");
        mock.push_line(&format!("FREQ:{}", frequency));
        mock.push_line(&format!("BUFFER:{}", buffer));
        mock.push_line(&format!("CHANNELS:{}", channels));
        mock
    }

    #[test]
    fn test_mixed_devices_share_the_narrowest_envelope() {
        let mocks = [
            extended(200_000_000, 393_216, 24),
            extended(100_000_000, 131_072, 16),
        ];
        let mut multi = MultiAnalyzer::with_transports(transports(&mocks), test_config()).unwrap();
        for mock in &mocks {
            mock.clear_written();
        }

        assert_eq!(multi.channel_count(), 32);
        assert_eq!(multi.buffer_size(), 131_072);
        assert_eq!(multi.max_frequency(), 100_000_000);
        // The slowest minimum, not the one derived from the group maximum
        assert_eq!(multi.devices()[0].min_frequency(), 6_103);
        assert_eq!(multi.devices()[1].min_frequency(), 3_051);
        assert_eq!(multi.min_frequency(), 6_103);

        // Channel 20 is channel 4 of the second device
        assert_eq!(multi.devices()[0].limits(&[0]).max_pre_samples, 39_321);
        assert_eq!(
            multi.limits(&[0, 20]),
            CaptureLimits {
                min_pre_samples: 2,
                max_pre_samples: 13_107,
                min_post_samples: 2,
                max_post_samples: 131_070,
            }
        );

        let session = CaptureSession::new(50_000_000, 20_000, 1000)
            .with_channels([0, 20])
            .with_trigger(PatternBuilder::starting_at(0).high().complex());
        assert!(matches!(
            multi.start_pattern_capture(&session),
            Err(CaptureError::BadParams(ParamError::PreSamples {
                value: 20_000,
                min: 2,
                max: 13_107
            }))
        ));

        let too_fast = CaptureSession {
            frequency: 150_000_000,
            pre_trigger_samples: 1000,
            ..session
        };
        assert!(matches!(
            multi.start_pattern_capture(&too_fast),
            Err(CaptureError::BadParams(ParamError::Frequency {
                max: 100_000_000,
                ..
            }))
        ));
        assert!(mocks.iter().all(|mock| mock.written().is_empty()));
    }

    #[test]
    fn test_edge_capture_unsupported() {
        let (mut multi, mocks) = group(2);
        let session = CaptureSession::new(100_000_000, 100, 1000).with_channels([0, 30]);
        assert!(matches!(
            multi.start_capture(&session),
            Err(CaptureError::HardwareError(_))
        ));
        assert!(mocks.iter().all(|mock| mock.written().is_empty()));
    }

    #[test]
    fn test_master_needs_channels() {
        let (mut multi, mocks) = group(2);
        assert!(matches!(
            multi.start_pattern_capture(&pattern_session([24, 25])),
            Err(CaptureError::BadParams(ParamError::MasterWithoutChannels))
        ));
        assert!(mocks.iter().all(|mock| mock.written().is_empty()));
    }

    #[test]
    fn test_group_capture_end_to_end() {
        let (mut multi, mocks) = group(3);
        for mock in &mocks[..2] {
            mock.push_line("CAPTURE_STARTED");
        }
        mocks[0].push_samples(&[0b01, 0b10, 0b11]);
        mocks[1].push_samples(&[0b1, 0b0, 0b1]);

        let session = pattern_session([]).with_named_channels(vec![
            AnalyzerChannel::named(0, "CLK"),
            AnalyzerChannel::new(1),
            AnalyzerChannel::named(25, "DATA"),
        ]);
        let pending = multi.start_pattern_capture(&session).unwrap();
        let capture = pending.wait_for(Duration::from_secs(5)).unwrap();

        assert_eq!(capture.samples, vec![0b101, 0b010, 0b111]);
        assert_eq!(
            capture.channels.iter().map(|c| c.number).collect::<Vec<_>>(),
            vec![0, 1, 25]
        );
        assert_eq!(capture.channels[2].label(), "DATA");
        assert_eq!(capture.source, DriverType::Multi);
        assert_eq!(capture.pre_samples, 100);
        assert!(!multi.is_capturing());

        let master = CaptureRequest::from_frame(&mocks[0].written()).unwrap();
        assert_eq!(master.trigger_type, TriggerType::Complex);
        assert_eq!((master.pre_samples, master.post_samples), (105, 995));
        assert_eq!(&master.channels[..2], &[0, 1]);

        let slave = CaptureRequest::from_frame(&mocks[1].written()).unwrap();
        assert_eq!(slave.trigger_type, TriggerType::Edge);
        assert_eq!(slave.trigger, 24);
        assert_eq!(slave.inverted_or_count, 0);
        assert_eq!((slave.pre_samples, slave.post_samples), (105, 995));
        assert_eq!(slave.channel_count, 1);
        assert_eq!(slave.channels[0], 1);
        assert_eq!(slave.loop_count, 0);

        // The third device has no channels and is left alone
        assert!(mocks[2].written().is_empty());
    }

    #[test]
    fn test_slave_refusal_stops_everything() {
        let (mut multi, mocks) = group(2);
        mocks[1].push_line("CAPTURE_ERROR");

        assert!(matches!(
            multi.start_pattern_capture(&pattern_session([0, 30])),
            Err(CaptureError::HardwareError(_))
        ));
        assert!(mocks[0].written().is_empty());
        assert!(!multi.is_capturing());
        assert!(multi.devices().iter().all(|d| !d.is_capturing()));
    }

    #[test]
    fn test_master_refusal_stops_started_slaves() {
        let (mut multi, mocks) = group(2);
        mocks[0].push_line("CAPTURE_ERROR");
        mocks[1].push_line("CAPTURE_STARTED");

        assert!(matches!(
            multi.start_pattern_capture(&pattern_session([0, 30])),
            Err(CaptureError::HardwareError(_))
        ));
        assert_eq!(mocks[1].written().last(), Some(&ABORT_BYTE));
        assert_eq!(mocks[1].reopen_count(), 1);
        assert!(multi.devices().iter().all(|d| !d.is_capturing()));
    }

    #[test]
    fn test_stop_fans_out() {
        let (mut multi, mocks) = group(2);
        for mock in &mocks {
            mock.push_line("CAPTURE_STARTED");
        }

        let pending = multi.start_pattern_capture(&pattern_session([0, 30])).unwrap();
        assert!(multi.is_capturing());
        assert!(matches!(
            multi.start_pattern_capture(&pattern_session([0, 30])),
            Err(CaptureError::Busy)
        ));

        assert!(multi.stop_capture());
        assert!(matches!(
            pending.wait_for(Duration::from_secs(1)),
            Err(CaptureFailure::Aborted)
        ));
        assert!(mocks.iter().all(|mock| mock.reopen_count() == 1));
        assert!(!multi.stop_capture());
    }

    #[test]
    fn test_lost_device_fails_the_group_capture() {
        let (mut multi, mocks) = group(2);
        for mock in &mocks {
            mock.push_line("CAPTURE_STARTED");
        }

        let pending = multi.start_pattern_capture(&pattern_session([0, 30])).unwrap();
        mocks[1].break_connection();

        match pending.wait_for(Duration::from_secs(5)) {
            Err(CaptureFailure::Device { tag, .. }) => assert_eq!(tag, 1),
            other => unreachable!("expected device failure, got {:?}", other),
        }
        assert!(!multi.is_capturing());

        // The master was aborted before the failure was reported
        assert!(multi.devices().iter().all(|d| !d.is_capturing()));
        assert_eq!(mocks[0].written().last(), Some(&ABORT_BYTE));
        assert_eq!(mocks[0].reopen_count(), 1);
        assert!(!multi.stop_capture());
    }
}
