//! Wire framing for host-to-device commands.
//!
//! Every command travels inside a frame delimited by `0x55 0xAA` and `0xAA 0x55`.
//! Payload bytes that collide with a marker or with the escape byte itself are sent
//! as `0xF0, byte ^ 0xF0`, so a marker pair can only ever appear at the frame edges.

const FRAME_START: [u8; 2] = [0x55, 0xAA];
const FRAME_END: [u8; 2] = [0xAA, 0x55];
const ESCAPE: u8 = 0xF0;

/// Command ids understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    StartCapture,
    /// Store access point credentials and the listening address on a WiFi device.
    NetworkSettings,
    /// Ask a WiFi device for its supply voltage.
    VoltageStatus,
}

impl Command {
    pub fn id(self) -> u8 {
        match self {
            Command::Identify => 0x00,
            Command::StartCapture => 0x01,
            Command::NetworkSettings => 0x02,
            Command::VoltageStatus => 0x03,
        }
    }
}

/// Raw byte written outside of any frame to abort a running capture.
pub const ABORT_BYTE: u8 = 0xFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame does not start with 0x55 0xAA")]
    MissingStart,

    #[error("Frame does not end with 0xAA 0x55")]
    MissingEnd,

    #[error("Escape byte at offset {0} is not followed by an escaped value")]
    DanglingEscape(usize),

    #[error("Unescaped reserved byte 0x{byte:02x} at offset {offset}")]
    UnescapedByte { byte: u8, offset: usize },
}

fn needs_escape(byte: u8) -> bool {
    matches!(byte, 0xAA | 0x55 | ESCAPE)
}

/// Wrap `payload` into a delimited, escaped frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let escaped = payload.iter().filter(|b| needs_escape(**b)).count();
    let mut frame = Vec::with_capacity(payload.len() + escaped + 4);

    frame.extend_from_slice(&FRAME_START);
    for &byte in payload {
        if needs_escape(byte) {
            frame.push(ESCAPE);
            frame.push(byte ^ ESCAPE);
        } else {
            frame.push(byte);
        }
    }
    frame.extend_from_slice(&FRAME_END);

    frame
}

/// Frame a command id followed by its payload.
pub fn encode_command(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 1);
    packet.push(command.id());
    packet.extend_from_slice(payload);
    encode(&packet)
}

/// Strip the markers from a complete frame and undo the escaping.
///
/// The host never receives framed data; this is the device-side inverse, used to
/// inspect what the drivers put on the wire.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.len() < 2 || frame[..2] != FRAME_START {
        return Err(FrameError::MissingStart);
    }
    if frame.len() < 4 || frame[frame.len() - 2..] != FRAME_END {
        return Err(FrameError::MissingEnd);
    }

    let body = &frame[2..frame.len() - 2];
    let mut payload = Vec::with_capacity(body.len());
    let mut bytes = body.iter().enumerate();

    while let Some((offset, &byte)) = bytes.next() {
        match byte {
            ESCAPE => match bytes.next() {
                Some((_, &escaped)) => payload.push(escaped ^ ESCAPE),
                None => return Err(FrameError::DanglingEscape(offset + 2)),
            },
            0xAA | 0x55 => {
                return Err(FrameError::UnescapedByte {
                    byte,
                    offset: offset + 2,
                })
            }
            _ => payload.push(byte),
        }
    }

    Ok(payload)
}
