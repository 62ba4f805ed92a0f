use tokio::io::{AsyncRead, AsyncWrite};

use crate::{Error, Result};

/// Source of serial ports.
///
/// The system implementation is [SerialConnector]. Tests substitute an
/// in-memory implementation.
pub trait Connector: Send + Sync {
    type Port: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Names of the ports currently visible to the system, in enumeration order.
    fn available_ports(&self) -> Result<Vec<String>>;

    /// Open a port exclusively. Dropping the returned value closes it.
    fn open(&self, name: &str) -> Result<Self::Port>;
}

/// Serial ports of this machine, 8 data bits, no parity, one stop bit.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub baud_rate: u32,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(9600)
    }
}

impl Connector for SerialConnector {
    type Port = tokio_serial::SerialStream;

    fn available_ports(&self) -> Result<Vec<String>> {
        let ports = tokio_serial::available_ports().map_err(|e| Error::PortUnavailable {
            port: "*".into(),
            busy: false,
            reason: format!("cannot enumerate serial ports: {e}"),
        })?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn open(&self, name: &str) -> Result<Self::Port> {
        use tokio_serial::SerialPortBuilderExt;

        tokio_serial::new(name, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| classify_open_error(name, e))
    }
}

/// A port held by another process fails with permission denied on Windows
/// and with EBUSY on Unix (exclusive tty).
fn classify_open_error(port: &str, e: tokio_serial::Error) -> Error {
    use std::io::ErrorKind::{PermissionDenied, ResourceBusy};
    let busy = matches!(
        e.kind(),
        tokio_serial::ErrorKind::Io(PermissionDenied | ResourceBusy)
    );
    Error::PortUnavailable {
        port: port.to_string(),
        busy,
        reason: e.to_string(),
    }
}

#[test]
fn test_classify_open_error() {
    let busy = tokio_serial::Error::new(
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
        "Access is denied.",
    );
    assert!(matches!(
        classify_open_error("COM3", busy),
        Error::PortUnavailable { busy: true, .. }
    ));
    let exclusive = tokio_serial::Error::new(
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::ResourceBusy),
        "Device or resource busy",
    );
    assert!(matches!(
        classify_open_error("/dev/ttyUSB0", exclusive),
        Error::PortUnavailable { busy: true, .. }
    ));
    let missing = tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "not found");
    assert!(matches!(
        classify_open_error("COM9", missing),
        Error::PortUnavailable { busy: false, .. }
    ));
}
