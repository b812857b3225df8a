use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout after {waited:?}, received so far: '{partial}'")]
    Timeout { waited: Duration, partial: String },

    #[error("Connection closed by the device")]
    ConnectionClosed,

    #[error("Read cancelled")]
    Cancelled,

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Byte stream to one device.
///
/// Reads are expected to give up after a short poll interval with `TimedOut` or
/// `WouldBlock` when nothing arrives, the way a serial port with a read timeout does.
pub trait Transport: Read + Write + Send {
    /// A second handle on the same connection, used by the sample drain.
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;

    /// Close and immediately open the connection again.
    fn reopen(&mut self) -> Result<(), TransportError>;

    /// Drop anything buffered in either direction.
    fn discard_buffers(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    poll_interval: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(
        path: &str,
        baud_rate: u32,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        log::debug!("Opening serial port {} at {} baud", path, baud_rate);
        let port = Self::open_port(path, baud_rate, poll_interval)?;
        Ok(Self {
            path: path.to_string(),
            baud_rate,
            poll_interval,
            port: Some(port),
        })
    }

    fn open_port(
        path: &str,
        baud_rate: u32,
        poll_interval: Duration,
    ) -> Result<Box<dyn SerialPort>, TransportError> {
        let mut port = serialport::new(path, baud_rate)
            .timeout(poll_interval)
            .open()?;
        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;
        port.clear(ClearBuffer::All)?;
        Ok(port)
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(not_connected)
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl Transport for SerialTransport {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        let port = self.port.as_ref().ok_or_else(not_connected)?;
        let clone = port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(Self {
            path: self.path.clone(),
            baud_rate: self.baud_rate,
            poll_interval: self.poll_interval,
            port: Some(clone),
        }))
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        // The port is opened exclusively, the old handle must be gone first.
        drop(self.port.take());
        self.port = Some(Self::open_port(
            &self.path,
            self.baud_rate,
            self.poll_interval,
        )?);
        Ok(())
    }

    fn discard_buffers(&mut self) -> Result<(), TransportError> {
        self.port()?.clear(ClearBuffer::All)?;
        Ok(())
    }
}

pub struct TcpTransport {
    addr: SocketAddr,
    connect_timeout: Duration,
    poll_interval: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        log::debug!("Connecting to {}", addr);
        let stream = Self::open_stream(addr, connect_timeout, poll_interval)?;
        Ok(Self {
            addr,
            connect_timeout,
            poll_interval,
            stream: Some(stream),
        })
    }

    fn open_stream(
        addr: SocketAddr,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_read_timeout(Some(poll_interval))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Transport for TcpTransport {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?;
        Ok(Box::new(Self {
            addr: self.addr,
            connect_timeout: self.connect_timeout,
            poll_interval: self.poll_interval,
            stream: Some(stream.try_clone()?),
        }))
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.stream = Some(Self::open_stream(
            self.addr,
            self.connect_timeout,
            self.poll_interval,
        )?);
        Ok(())
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Read one `\n` terminated line, giving up once `timeout` has elapsed.
///
/// Bytes are consumed one at a time so nothing after the newline is taken from the
/// stream; binary sample data may follow immediately.
pub fn read_line(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> Result<String, TransportError> {
    let mut line = Vec::new();
    let start = Instant::now();

    loop {
        let mut byte = [0u8; 1];
        match transport.read(&mut byte) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(e) if is_poll_timeout(&e) => {
                if start.elapsed() >= timeout {
                    return Err(TransportError::Timeout {
                        waited: start.elapsed(),
                        partial: String::from_utf8_lossy(&line).to_string(),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    let line = String::from_utf8(line)?;
    Ok(line.trim_end_matches('\r').to_string())
}

/// Fill `buf` completely, riding out poll timeouts until `cancel` is raised or
/// `deadline` passes.
pub fn read_exact_cancellable(
    reader: &mut dyn Transport,
    buf: &mut [u8],
    cancel: &AtomicBool,
    deadline: Option<Instant>,
) -> Result<(), TransportError> {
    let start = Instant::now();
    let mut filled = 0;

    while filled < buf.len() {
        if cancel.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }

        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if is_poll_timeout(&e) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(TransportError::Timeout {
                        waited: start.elapsed(),
                        partial: format!("{} of {} bytes", filled, buf.len()),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_read_line_stops_at_newline() {
        let mut mock = MockTransport::new();
        mock.push_bytes(b"CAPTURE_STARTED\r\n\x03\x00\x00\x00");

        let line = read_line(&mut mock, Duration::from_millis(100)).unwrap();
        assert_eq!(line, "CAPTURE_STARTED");

        let mut rest = [0u8; 4];
        let cancel = AtomicBool::new(false);
        read_exact_cancellable(&mut mock, &mut rest, &cancel, None).unwrap();
        assert_eq!(rest, [3, 0, 0, 0]);
    }

    #[test]
    fn test_read_line_times_out() {
        let mut mock = MockTransport::new();
        mock.push_bytes(b"CAPT");

        match read_line(&mut mock, Duration::from_millis(20)) {
            Err(TransportError::Timeout { partial, .. }) => assert_eq!(partial, "CAPT"),
            other => unreachable!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_read() {
        let mut mock = MockTransport::new();
        let cancel = AtomicBool::new(true);
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_exact_cancellable(&mut mock, &mut buf, &cancel, None),
            Err(TransportError::Cancelled)
        ));
    }

    #[test]
    fn test_read_deadline() {
        let mut mock = MockTransport::new();
        mock.push_bytes(&[1, 2]);
        let cancel = AtomicBool::new(false);
        let mut buf = [0u8; 4];
        let deadline = Instant::now() + Duration::from_millis(20);

        match read_exact_cancellable(&mut mock, &mut buf, &cancel, Some(deadline)) {
            Err(TransportError::Timeout { partial, .. }) => assert_eq!(partial, "2 of 4 bytes"),
            other => unreachable!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_broken_connection_is_an_io_error() {
        let mut mock = MockTransport::new();
        mock.break_connection();
        assert!(matches!(
            read_line(&mut mock, Duration::from_millis(20)),
            Err(TransportError::Io(_))
        ));
    }
}
