use crate::config::DriverConfig;
use crate::transport::{SerialTransport, TcpTransport, Transport, TransportError};
use serialport::SerialPortType;
use std::net::SocketAddr;

/// USB identifiers of the analyzer's CDC interface.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x3020;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDevice {
    pub port: String,
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Specified address/port '{0}' is invalid")]
    InvalidAddress(String),

    #[error("Serial port enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),
}

/// Where a connection string points: `host:port` for a networked device,
/// anything else is a serial port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial(String),
    Network(SocketAddr),
}

impl Endpoint {
    pub fn parse(connection: &str) -> Result<Self, ConnectorError> {
        if connection.contains(':') {
            connection
                .parse::<SocketAddr>()
                .map(Endpoint::Network)
                .map_err(|_| ConnectorError::InvalidAddress(connection.to_string()))
        } else {
            Ok(Endpoint::Serial(connection.to_string()))
        }
    }

    pub fn open(&self, config: &DriverConfig) -> Result<Box<dyn Transport>, ConnectorError> {
        let transport: Box<dyn Transport> = match self {
            Endpoint::Serial(path) => Box::new(SerialTransport::open(
                path,
                config.baud_rate,
                config.poll_interval,
            )?),
            Endpoint::Network(addr) => Box::new(TcpTransport::connect(
                *addr,
                config.response_timeout,
                config.poll_interval,
            )?),
        };
        Ok(transport)
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Endpoint::Network(_))
    }
}

/// Serial ports that belong to an attached analyzer.
pub fn detect_devices() -> Result<Vec<DetectedDevice>, ConnectorError> {
    let devices = serialport::available_ports()?
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(info) if info.vid == USB_VID && info.pid == USB_PID => {
                Some(DetectedDevice {
                    port: port.port_name,
                    serial_number: info.serial_number,
                })
            }
            _ => None,
        })
        .collect::<Vec<_>>();

    log::debug!("Detected {} analyzer(s)", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_names() {
        assert_eq!(
            Endpoint::parse("/dev/ttyACM0").unwrap(),
            Endpoint::Serial("/dev/ttyACM0".to_string())
        );
        assert_eq!(
            Endpoint::parse("COM4").unwrap(),
            Endpoint::Serial("COM4".to_string())
        );
    }

    #[test]
    fn test_parse_network_address() {
        let endpoint = Endpoint::parse("192.168.1.20:4045").unwrap();
        assert!(endpoint.is_network());
        assert_eq!(
            endpoint,
            Endpoint::Network("192.168.1.20:4045".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_invalid_address() {
        assert!(matches!(
            Endpoint::parse("192.168.1.20:port"),
            Err(ConnectorError::InvalidAddress(_))
        ));
        assert!(matches!(
            Endpoint::parse("analyzer.local:4045"),
            Err(ConnectorError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_detect_devices() {
        // Depends on the machine; enumeration may be unavailable in sandboxes
        match detect_devices() {
            Ok(devices) => {
                for device in devices {
                    assert!(!device.port.is_empty());
                }
            }
            Err(ConnectorError::Enumeration(_)) => {}
            Err(e) => unreachable!("Unexpected error: {:?}", e),
        }
    }
}
