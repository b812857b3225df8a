//! Capture session description supplied by the caller.

/// One captured input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerChannel {
    pub number: u8,
    pub name: String,
    pub color: Option<u32>,
}

impl AnalyzerChannel {
    pub fn new(number: u8) -> Self {
        Self {
            number,
            name: String::new(),
            color: None,
        }
    }

    pub fn named(number: u8, name: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            color: None,
        }
    }

    /// Display label, falling back to the 1-based channel number.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("Channel {}", u32::from(self.number) + 1)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Edge,
    Complex,
    Fast,
}

impl TriggerType {
    /// Trigger type byte of the capture request.
    pub fn wire_id(self) -> u8 {
        match self {
            TriggerType::Edge => 0,
            TriggerType::Complex => 1,
            TriggerType::Fast => 2,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(TriggerType::Edge),
            1 => Some(TriggerType::Complex),
            2 => Some(TriggerType::Fast),
            _ => None,
        }
    }

    pub fn is_pattern(self) -> bool {
        !matches!(self, TriggerType::Edge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeTrigger {
    pub channel: u8,
    pub inverted: bool,
}

impl EdgeTrigger {
    pub fn rising(channel: u8) -> Self {
        Self {
            channel,
            inverted: false,
        }
    }

    pub fn falling(channel: u8) -> Self {
        Self {
            channel,
            inverted: true,
        }
    }
}

/// Bit pattern matched on `bit_count` consecutive channels starting at `channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternTrigger {
    pub channel: u8,
    pub bit_count: u8,
    pub pattern: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge(EdgeTrigger),
    Complex(PatternTrigger),
    Fast(PatternTrigger),
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::Edge(_) => TriggerType::Edge,
            Trigger::Complex(_) => TriggerType::Complex,
            Trigger::Fast(_) => TriggerType::Fast,
        }
    }

    pub fn channel(&self) -> u8 {
        match self {
            Trigger::Edge(edge) => edge.channel,
            Trigger::Complex(pattern) | Trigger::Fast(pattern) => pattern.channel,
        }
    }

    pub fn pattern(&self) -> Option<&PatternTrigger> {
        match self {
            Trigger::Edge(_) => None,
            Trigger::Complex(pattern) | Trigger::Fast(pattern) => Some(pattern),
        }
    }
}

impl From<EdgeTrigger> for Trigger {
    fn from(trigger: EdgeTrigger) -> Self {
        Self::Edge(trigger)
    }
}

/// Builds a pattern trigger one channel at a time, lowest channel first.
///
/// ```rust
/// use logic_analyzer_rs::session::{PatternBuilder, Trigger};
///
/// let trigger = PatternBuilder::starting_at(2).high().low().high().complex();
/// let pattern = trigger.pattern().unwrap();
/// assert_eq!((pattern.channel, pattern.bit_count, pattern.pattern), (2, 3, 0b101));
/// ```
#[derive(Debug, Clone)]
pub struct PatternBuilder {
    channel: u8,
    bits: Vec<bool>,
}

impl PatternBuilder {
    pub fn starting_at(channel: u8) -> Self {
        Self {
            channel,
            bits: Vec::new(),
        }
    }

    pub fn bit(mut self, high: bool) -> Self {
        self.bits.push(high);
        self
    }

    pub fn high(self) -> Self {
        self.bit(true)
    }

    pub fn low(self) -> Self {
        self.bit(false)
    }

    fn build(&self) -> PatternTrigger {
        let pattern = self
            .bits
            .iter()
            .take(16)
            .enumerate()
            .filter(|(_, high)| **high)
            .fold(0u16, |acc, (bit, _)| acc | (1 << bit));

        PatternTrigger {
            channel: self.channel,
            bit_count: self.bits.len().min(u8::MAX as usize) as u8,
            pattern,
        }
    }

    pub fn complex(self) -> Trigger {
        Trigger::Complex(self.build())
    }

    pub fn fast(self) -> Trigger {
        Trigger::Fast(self.build())
    }
}

/// Everything a driver needs to run one capture. Never mutated by the drivers;
/// the multi-device orchestrator derives per-device copies with `clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub frequency: u32,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub loop_count: u8,
    /// Ask for per-burst timestamps. The capture request has no field for it, so the
    /// drivers refuse sessions that set it.
    pub measure_bursts: bool,
    pub channels: Vec<AnalyzerChannel>,
    pub trigger: Trigger,
}

impl CaptureSession {
    pub fn new(frequency: u32, pre_trigger_samples: u32, post_trigger_samples: u32) -> Self {
        Self {
            frequency,
            pre_trigger_samples,
            post_trigger_samples,
            loop_count: 0,
            measure_bursts: false,
            channels: Vec::new(),
            trigger: Trigger::Edge(EdgeTrigger::rising(0)),
        }
    }

    pub fn with_channels<I: IntoIterator<Item = u8>>(mut self, channels: I) -> Self {
        self.channels = channels.into_iter().map(AnalyzerChannel::new).collect();
        self
    }

    pub fn with_named_channels(mut self, channels: Vec<AnalyzerChannel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        self.trigger = trigger.into();
        self
    }

    /// Repeat the post-trigger window `loop_count` more times after the first burst.
    pub fn with_bursts(mut self, loop_count: u8) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn channel_numbers(&self) -> Vec<u8> {
        self.channels.iter().map(|c| c.number).collect()
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    /// Samples the device is asked to store: every burst repeats the post-trigger window.
    pub fn requested_samples(&self) -> u64 {
        u64::from(self.pre_trigger_samples)
            + u64::from(self.post_trigger_samples) * (u64::from(self.loop_count) + 1)
    }
}
