//! Channel-count tiers and the sample-count envelope each tier allows.
//!
//! Samples of narrower captures pack into fewer storage bits, so a capture that only
//! touches channels below 8 can hold four times as many samples as one reaching
//! channel 16 or above.

/// Storage width class selected by the highest requested channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelMode {
    Channels8,
    Channels16,
    Channels24,
}

impl ChannelMode {
    pub const ALL: [ChannelMode; 3] = [
        ChannelMode::Channels8,
        ChannelMode::Channels16,
        ChannelMode::Channels24,
    ];

    /// Classify a channel set by its highest channel index. An empty set is the narrowest tier.
    pub fn for_channels(channels: &[u8]) -> Self {
        let max_channel = channels.iter().copied().max().unwrap_or(0);
        if max_channel < 8 {
            ChannelMode::Channels8
        } else if max_channel < 16 {
            ChannelMode::Channels16
        } else {
            ChannelMode::Channels24
        }
    }

    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn bytes_per_sample(self) -> u32 {
        match self {
            ChannelMode::Channels8 => 1,
            ChannelMode::Channels16 => 2,
            ChannelMode::Channels24 => 4,
        }
    }

    /// Highest channel index (exclusive) the tier covers.
    pub fn channel_span(self) -> u8 {
        match self {
            ChannelMode::Channels8 => 8,
            ChannelMode::Channels16 => 16,
            ChannelMode::Channels24 => 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub min_pre_samples: u32,
    pub max_pre_samples: u32,
    pub min_post_samples: u32,
    pub max_post_samples: u32,
}

impl CaptureLimits {
    pub fn max_total_samples(&self) -> u32 {
        self.min_pre_samples + self.max_post_samples
    }

    /// The envelope both `self` and `other` accept.
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            min_pre_samples: self.min_pre_samples.max(other.min_pre_samples),
            max_pre_samples: self.max_pre_samples.min(other.max_pre_samples),
            min_post_samples: self.min_post_samples.max(other.min_post_samples),
            max_post_samples: self.max_post_samples.min(other.max_post_samples),
        }
    }
}

/// How a device model derives its per-tier limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityProfile {
    /// Hardware-fixed table of first generation firmware.
    Fixed,
    /// Limits derived from the sample buffer size the device reports.
    Buffer { size: u32 },
}

impl CapacityProfile {
    const FIXED_MODES: [CaptureLimits; 3] = [
        CaptureLimits {
            min_pre_samples: 2,
            max_pre_samples: 98_303,
            min_post_samples: 512,
            max_post_samples: 131_069,
        },
        CaptureLimits {
            min_pre_samples: 2,
            max_pre_samples: 49_151,
            min_post_samples: 512,
            max_post_samples: 65_533,
        },
        CaptureLimits {
            min_pre_samples: 2,
            max_pre_samples: 24_576,
            min_post_samples: 512,
            max_post_samples: 32_765,
        },
    ];

    /// Buffer size assumed for fixed-table devices, used for display only.
    pub const FIXED_BUFFER_SIZE: u32 = 131_072;

    pub fn limits(&self, mode: ChannelMode) -> CaptureLimits {
        match self {
            CapacityProfile::Fixed => Self::FIXED_MODES[mode as usize],
            CapacityProfile::Buffer { size } => {
                let total = size / mode.bytes_per_sample();
                CaptureLimits {
                    min_pre_samples: 2,
                    max_pre_samples: total / 10,
                    min_post_samples: 2,
                    max_post_samples: total.saturating_sub(2),
                }
            }
        }
    }

    pub fn buffer_size(&self) -> u32 {
        match self {
            CapacityProfile::Fixed => Self::FIXED_BUFFER_SIZE,
            CapacityProfile::Buffer { size } => *size,
        }
    }
}

/// Capabilities of a device (or device group) with the limits of every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub max_frequency: u32,
    pub min_frequency: u32,
    pub channels: u8,
    pub buffer_size: u32,
    pub mode_limits: [CaptureLimits; 3],
}
