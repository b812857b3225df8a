use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"V([0-9]+)_([0-9]+)$").expect("Invalid version regex"));

/// Firmware version parsed from the trailing `V<major>_<minor>` of an identification line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceVersion {
    pub major: u32,
    pub minor: u32,
}

impl DeviceVersion {
    /// Oldest firmware the drivers talk to.
    pub const MINIMUM: DeviceVersion = DeviceVersion { major: 5, minor: 0 };

    /// First firmware that reports frequency, buffer size and channel count after identifying.
    pub const EXTENDED_INFO: DeviceVersion = DeviceVersion { major: 6, minor: 5 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// `None` when the string carries no trailing version tag.
    pub fn parse(raw: &str) -> Option<Self> {
        let captures = VERSION_REGEX.captures(raw.trim_end())?;
        let major = captures.get(1)?.as_str().parse().ok()?;
        let minor = captures.get(2)?.as_str().parse().ok()?;
        Some(Self { major, minor })
    }

    pub fn is_supported(&self) -> bool {
        self.major > Self::MINIMUM.major
            || (self.major == Self::MINIMUM.major && self.minor >= Self::MINIMUM.minor)
    }

    pub fn reports_extended_info(&self) -> bool {
        *self >= Self::EXTENDED_INFO
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}_{}", self.major, self.minor)
    }
}

/// Parse and gate in one step: `Some` only for a supported version.
pub fn supported_version(raw: Option<&str>) -> Option<DeviceVersion> {
    raw.and_then(DeviceVersion::parse)
        .filter(DeviceVersion::is_supported)
}
