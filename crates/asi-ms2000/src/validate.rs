//! Locating the serial port that has an MS2000 attached.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stage_core::StageConfig;

use tracing as log;

use crate::{connector::Connector, protocol::PROBE_COMMAND, Error, Result};

/// Return the name of a port with a controller attached.
///
/// With `requested` set only that port is considered and its failure is
/// returned. Otherwise the ports are tried in enumeration order and the first
/// one that answers the probe wins. Ports after it are not touched.
///
/// Every port opened here is closed again before returning. The caller
/// reopens the accepted port for normal operation.
pub async fn find_port<C: Connector>(
    connector: &C,
    requested: Option<&str>,
    cfg: &StageConfig,
) -> Result<String> {
    if let Some(port) = requested {
        validate_port(connector, port, cfg).await?;
        return Ok(port.to_string());
    }

    let candidates = connector.available_ports()?;
    log::debug!("scanning serial ports {candidates:?}");
    let mut tried = Vec::with_capacity(candidates.len());
    for port in candidates {
        match validate_port(connector, &port, cfg).await {
            Ok(()) => return Ok(port),
            Err(e) => {
                log::info!("{port}: {e}");
                tried.push(port);
            }
        }
    }
    Err(Error::DeviceNotFound {
        expected: cfg.device_signature.clone(),
        tried,
    })
}

/// Check availability, then probe.
pub async fn validate_port<C: Connector>(
    connector: &C,
    port: &str,
    cfg: &StageConfig,
) -> Result<()> {
    check_port(connector, port)?;
    let reply = probe(connector, port, cfg).await?;
    if reply.contains(&cfg.device_signature) {
        log::info!("found {} on {port}", cfg.device_signature);
        Ok(())
    } else {
        Err(Error::ValidationMismatch {
            port: port.to_string(),
            expected: cfg.device_signature.clone(),
            reply,
        })
    }
}

/// Open and immediately close the port.
///
/// Only a port held by another process is reported as unavailable. Any other
/// open failure lets the port through to the probe, which then fails on its
/// own open.
pub fn check_port<C: Connector>(connector: &C, port: &str) -> Result<()> {
    match connector.open(port) {
        Ok(device) => {
            drop(device);
            log::debug!("{port} is free");
            Ok(())
        }
        Err(e @ Error::PortUnavailable { busy: true, .. }) => Err(e),
        Err(e) => {
            log::debug!("{port} open failed, still treating it as available: {e}");
            Ok(())
        }
    }
}

/// Send the identification probe and return whatever text came back up to
/// the first CR.
async fn probe<C: Connector>(connector: &C, port: &str, cfg: &StageConfig) -> Result<String> {
    let mut device = connector.open(port)?;
    device.write_all(PROBE_COMMAND.as_bytes()).await?;
    device.write_all(b"\r").await?;
    device.flush().await?;

    let timeout = cfg.validation_timeout();
    let mut reply = Vec::new();
    let read = async {
        let mut chunk = [0u8; 64];
        loop {
            let n = device.read(&mut chunk).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(false);
            }
            reply.extend_from_slice(&chunk[..n]);
            if memchr::memchr(b'\r', &reply).is_some() {
                return Ok(true);
            }
        }
    };
    let complete = match tokio::time::timeout(timeout, read).await {
        Ok(res) => res?,
        Err(_elapsed) => false,
    };
    // `device` is dropped here on every path, closing the port.
    if !complete {
        return Err(Error::ValidationTimeout {
            port: port.to_string(),
            timeout,
        });
    }
    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockConnector, PortBehavior};

    fn fast_cfg() -> StageConfig {
        StageConfig {
            validation_timeout_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_auto_mode_stops_at_first_device() {
        let connector = MockConnector::new(vec![
            ("COM1", PortBehavior::Busy),
            ("COM2", PortBehavior::device()),
            ("COM3", PortBehavior::device()),
        ]);
        let port = find_port(&connector, None, &fast_cfg()).await.unwrap();
        assert_eq!(port, "COM2");
        assert_eq!(connector.open_attempts("COM1"), 1);
        // availability check plus probe
        assert_eq!(connector.open_attempts("COM2"), 2);
        assert_eq!(connector.open_attempts("COM3"), 0);
    }

    #[tokio::test]
    async fn test_auto_mode_skips_silent_port() {
        let connector = MockConnector::new(vec![
            ("COM1", PortBehavior::Silent),
            ("COM2", PortBehavior::device()),
            ("COM3", PortBehavior::device()),
        ]);
        let port = find_port(&connector, None, &fast_cfg()).await.unwrap();
        assert_eq!(port, "COM2");
        assert_eq!(connector.open_attempts("COM1"), 2);
        assert_eq!(connector.open_attempts("COM2"), 2);
        assert_eq!(connector.open_attempts("COM3"), 0);
    }

    #[tokio::test]
    async fn test_auto_mode_nothing_found() {
        let connector = MockConnector::new(vec![
            ("COM1", PortBehavior::Silent),
            ("COM2", PortBehavior::OtherDevice("Arduino Uno\r\n")),
            ("COM3", PortBehavior::Busy),
        ]);
        match find_port(&connector, None, &fast_cfg()).await {
            Err(Error::DeviceNotFound { tried, .. }) => {
                assert_eq!(tried, vec!["COM1", "COM2", "COM3"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_explicit_port_errors() {
        let connector = MockConnector::new(vec![
            ("COM1", PortBehavior::Silent),
            ("COM2", PortBehavior::OtherDevice("Arduino Uno\r\n")),
            ("COM3", PortBehavior::Busy),
            ("COM4", PortBehavior::device()),
        ]);
        let cfg = fast_cfg();
        assert!(matches!(
            find_port(&connector, Some("COM1"), &cfg).await,
            Err(Error::ValidationTimeout { .. })
        ));
        match find_port(&connector, Some("COM2"), &cfg).await {
            Err(Error::ValidationMismatch { reply, .. }) => assert_eq!(reply, "Arduino Uno"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            find_port(&connector, Some("COM3"), &cfg).await,
            Err(Error::PortUnavailable { busy: true, .. })
        ));
        assert_eq!(
            find_port(&connector, Some("COM4"), &cfg).await.unwrap(),
            "COM4"
        );
        // availability check plus probe, no enumeration
        assert_eq!(connector.open_attempts("COM1"), 2);
        assert_eq!(connector.open_attempts("COM4"), 2);
    }

    #[tokio::test]
    async fn test_other_open_failure_counts_as_available() {
        // A port whose open fails for a reason other than being held elsewhere
        // passes the availability check and only fails at the probe.
        let connector = MockConnector::new(vec![("COM7", PortBehavior::OpenFails)]);
        assert!(check_port(&connector, "COM7").is_ok());
        assert!(matches!(
            find_port(&connector, Some("COM7"), &fast_cfg()).await,
            Err(Error::PortUnavailable { busy: false, .. })
        ));
        assert_eq!(connector.open_attempts("COM7"), 2);

        let busy = MockConnector::new(vec![("COM8", PortBehavior::Busy)]);
        assert!(check_port(&busy, "COM8").is_err());
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let connector = MockConnector::new(vec![(
            "COM1",
            PortBehavior::SlowDevice(vec!["MS20", "00 USB", "\r\n"]),
        )]);
        assert_eq!(
            find_port(&connector, None, &fast_cfg()).await.unwrap(),
            "COM1"
        );
    }
}
