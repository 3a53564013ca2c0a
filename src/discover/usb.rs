use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_serial::{SerialPortInfo, SerialPortType};

use crate::{identity::RawIdentity, profile::ProfileBook, Detector, DeviceIdentity};

/// Vendor or product id the way the remote service spells it: four upper
/// case hex digits.
fn format_id(id: u16) -> String {
    format!("{:04X}", id)
}

/// Scans the serial bus for USB devices.
pub struct UsbDetector {
    profiles: Arc<ProfileBook>,
    report_unknown: bool,
}

impl UsbDetector {
    /// Detector reporting devices some profile knows about, or every USB
    /// serial device when `report_unknown` is set.
    pub fn new(profiles: Arc<ProfileBook>, report_unknown: bool) -> Self {
        Self {
            profiles,
            report_unknown,
        }
    }

    fn identity(&self, port: SerialPortInfo) -> Option<RawIdentity> {
        let SerialPortType::UsbPort(info) = port.port_type else {
            tracing::trace!("skipping {:?}", port);
            return None;
        };

        let vid = format_id(info.vid);
        let pid = format_id(info.pid);
        if !self.report_unknown && !self.profiles.knows(&vid, &pid) {
            tracing::trace!(vid, pid, port_name = port.port_name, "no profile for device; skipping");
            return None;
        }

        let mut identity = DeviceIdentity::new(&vid, &pid).with_path(&port.port_name);
        if let Some(serial) = info.serial_number.as_deref().filter(|s| !s.is_empty()) {
            identity = identity.with_serial(serial);
        }
        Some((&identity).into())
    }
}

#[async_trait]
impl Detector for UsbDetector {
    fn name(&self) -> &'static str {
        "usb"
    }

    async fn poll(&self) -> Result<Vec<RawIdentity>> {
        tracing::debug!("scanning serial ports");
        let ports = tokio::task::spawn_blocking(tokio_serial::available_ports).await??;
        Ok(ports.into_iter().filter_map(|port| self.identity(port)).collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_serial::UsbPortInfo;

    use super::*;
    use crate::DeviceProfile;

    fn port(name: &str, vid: u16, pid: u16, serial: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_owned(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: serial.map(str::to_owned),
                manufacturer: None,
                product: None,
            }),
        }
    }

    fn profiles() -> Arc<ProfileBook> {
        Arc::new(ProfileBook::new([DeviceProfile::virtual_printer("2C99", "0002")]))
    }

    #[test]
    fn test_known_devices_only() {
        let detector = UsbDetector::new(profiles(), false);
        let known = detector.identity(port("/dev/ttyACM0", 0x2c99, 0x0002, Some("CZPX1"))).unwrap();
        assert_eq!(known.0["VID"], "2C99");
        assert_eq!(known.0["COM"], "/dev/ttyACM0");
        assert_eq!(known.0["SNR"], "CZPX1");

        assert_eq!(detector.identity(port("/dev/ttyUSB0", 0x0403, 0x6001, None)), None);
        let builtin = SerialPortInfo {
            port_name: "/dev/ttyS0".to_owned(),
            port_type: SerialPortType::PciPort,
        };
        assert_eq!(detector.identity(builtin), None);
    }

    #[test]
    fn test_report_unknown() {
        let detector = UsbDetector::new(profiles(), true);
        let unknown = detector.identity(port("/dev/ttyUSB0", 0x0403, 0x6001, Some(""))).unwrap();
        assert_eq!(unknown.0["PID"], "6001");
        assert!(!unknown.0.contains_key("SNR"));
    }
}
