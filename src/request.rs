//! Fixed-layout capture request record.
//!
//! Layout (little-endian, no padding):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | trigger type (0 edge, 1 complex, 2 fast) |
//! | 1 | 1 | trigger channel |
//! | 2 | 1 | inverted flag (edge) or trigger bit count (pattern) |
//! | 3 | 2 | trigger pattern |
//! | 5 | 24 | channel indices, unused slots zero |
//! | 29 | 1 | channel count |
//! | 30 | 4 | frequency |
//! | 34 | 4 | pre-trigger samples |
//! | 38 | 4 | post-trigger samples |
//! | 42 | 1 | loop count |
//! | 43 | 1 | channel mode |
//!
//! [`WifiSettings`] is the record carried by the network settings command.

use crate::framing::{self, Command};
use crate::limits::ChannelMode;
use crate::session::{CaptureSession, Trigger, TriggerType};
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error(
        "{0} channels requested, a request holds at most {max}",
        max = CaptureRequest::MAX_CHANNELS
    )]
    TooManyChannels(usize),

    #[error(
        "Request record must be {expected} bytes, got {actual}",
        expected = CaptureRequest::ENCODED_LEN
    )]
    InvalidLength { actual: usize },

    #[error("Unknown trigger type {0}")]
    UnknownTriggerType(u8),

    #[error("Unknown channel mode {0}")]
    UnknownChannelMode(u8),

    #[error("The {field} must be at most {max} ASCII characters")]
    InvalidText { field: &'static str, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub trigger_type: TriggerType,
    pub trigger: u8,
    pub inverted_or_count: u8,
    pub trigger_value: u16,
    pub channels: [u8; CaptureRequest::MAX_CHANNELS],
    pub channel_count: u8,
    pub frequency: u32,
    pub pre_samples: u32,
    pub post_samples: u32,
    pub loop_count: u8,
    pub capture_mode: ChannelMode,
}

impl CaptureRequest {
    pub const MAX_CHANNELS: usize = 24;
    pub const ENCODED_LEN: usize = 44;

    /// Build the record for `session`. The trigger variant decides the encoding of
    /// `inverted_or_count` and `trigger_value`; pattern captures never loop.
    pub fn from_session(session: &CaptureSession) -> Result<Self, RequestError> {
        let numbers = session.channel_numbers();
        if numbers.len() > Self::MAX_CHANNELS {
            return Err(RequestError::TooManyChannels(numbers.len()));
        }

        let mut channels = [0u8; Self::MAX_CHANNELS];
        channels[..numbers.len()].copy_from_slice(&numbers);

        let (inverted_or_count, trigger_value, loop_count) = match session.trigger {
            Trigger::Edge(edge) => (u8::from(edge.inverted), 0, session.loop_count),
            Trigger::Complex(pattern) | Trigger::Fast(pattern) => {
                (pattern.bit_count, pattern.pattern, 0)
            }
        };

        Ok(Self {
            trigger_type: session.trigger_type(),
            trigger: session.trigger.channel(),
            inverted_or_count,
            trigger_value,
            channels,
            channel_count: numbers.len() as u8,
            frequency: session.frequency,
            pre_samples: session.pre_trigger_samples,
            post_samples: session.post_trigger_samples,
            loop_count,
            capture_mode: ChannelMode::for_channels(&numbers),
        })
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0] = self.trigger_type.wire_id();
        bytes[1] = self.trigger;
        bytes[2] = self.inverted_or_count;
        bytes[3..5].copy_from_slice(&self.trigger_value.to_le_bytes());
        bytes[5..29].copy_from_slice(&self.channels);
        bytes[29] = self.channel_count;
        bytes[30..34].copy_from_slice(&self.frequency.to_le_bytes());
        bytes[34..38].copy_from_slice(&self.pre_samples.to_le_bytes());
        bytes[38..42].copy_from_slice(&self.post_samples.to_le_bytes());
        bytes[42] = self.loop_count;
        bytes[43] = self.capture_mode.wire_id();
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RequestError> {
        let bytes: &[u8; Self::ENCODED_LEN] = bytes
            .try_into()
            .map_err(|_| RequestError::InvalidLength {
                actual: bytes.len(),
            })?;

        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        let trigger_type =
            TriggerType::from_wire_id(bytes[0]).ok_or(RequestError::UnknownTriggerType(bytes[0]))?;
        let capture_mode = ChannelMode::ALL
            .get(usize::from(bytes[43]))
            .copied()
            .ok_or(RequestError::UnknownChannelMode(bytes[43]))?;

        let mut channels = [0u8; Self::MAX_CHANNELS];
        channels.copy_from_slice(&bytes[5..29]);

        Ok(Self {
            trigger_type,
            trigger: bytes[1],
            inverted_or_count: bytes[2],
            trigger_value: u16::from_le_bytes([bytes[3], bytes[4]]),
            channels,
            channel_count: bytes[29],
            frequency: u32_at(30),
            pre_samples: u32_at(34),
            post_samples: u32_at(38),
            loop_count: bytes[42],
            capture_mode,
        })
    }

    /// The framed start-capture command carrying this record.
    pub fn to_frame(&self) -> Vec<u8> {
        framing::encode_command(Command::StartCapture, &self.encode())
    }

    /// Recover a record from a framed start-capture command.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        let packet = framing::decode(frame).ok()?;
        let (&command, payload) = packet.split_first()?;
        if command != Command::StartCapture.id() {
            return None;
        }
        Self::decode(payload).ok()
    }
}

/// Access point credentials and listening endpoint stored by a WiFi-capable device.
///
/// Text fields are ASCII and zero terminated inside fixed 33, 64 and 16 byte slots. The
/// port sits at offset 114, aligned to two bytes, so offset 113 is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiSettings {
    pub access_point: String,
    pub password: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl WifiSettings {
    pub const ENCODED_LEN: usize = 116;

    pub fn new(
        access_point: impl Into<String>,
        password: impl Into<String>,
        address: Ipv4Addr,
        port: u16,
    ) -> Self {
        Self {
            access_point: access_point.into(),
            password: password.into(),
            address,
            port,
        }
    }

    pub fn encode(&self) -> Result<[u8; Self::ENCODED_LEN], RequestError> {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        put_text(&mut bytes[..33], &self.access_point, "access point name")?;
        put_text(&mut bytes[33..97], &self.password, "password")?;
        put_text(&mut bytes[97..113], &self.address.to_string(), "address")?;
        bytes[114..116].copy_from_slice(&self.port.to_le_bytes());
        Ok(bytes)
    }

    /// The framed network settings command carrying this record.
    pub fn to_frame(&self) -> Result<Vec<u8>, RequestError> {
        Ok(framing::encode_command(Command::NetworkSettings, &self.encode()?))
    }
}

/// Copy `text` into a zero padded slot, leaving room for the terminator.
fn put_text(slot: &mut [u8], text: &str, field: &'static str) -> Result<(), RequestError> {
    if !text.is_ascii() || text.len() >= slot.len() {
        return Err(RequestError::InvalidText {
            field,
            max: slot.len() - 1,
        });
    }
    slot[..text.len()].copy_from_slice(text.as_bytes());
    Ok(())
}
