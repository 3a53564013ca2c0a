use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{net::UdpSocket, task::JoinHandle};

use crate::{identity::RawIdentity, Detector, DeviceIdentity};

const BAMBU_URN: &str = "urn:bambulab-com:device:3dprinter:1";
const BAMBU_VID: &str = "BBL0";
/// Port the printers announce themselves on. Not the standard SSDP port.
const NOTIFY_PORT: u16 = 2021;
/// A printer not heard from for this long is gone.
const STALE_AFTER: Duration = Duration::from_secs(30);

/// Model code for a printer serial number, from the vendor's published
/// serial prefixes.
fn model_from_serial(serial: &str) -> &'static str {
    const PREFIXES: &[(&str, &str)] = &[
        ("039", "A1"),
        ("030", "A1MINI"),
        ("01S", "P1P"),
        ("01P", "P1S"),
        ("03W", "X1E"),
        ("00W", "X1"),
        ("00M", "X1C"),
    ];
    PREFIXES
        .iter()
        .find(|(prefix, _)| serial.starts_with(prefix))
        .map_or("X1C", |(_, model)| *model)
}

/// What a NOTIFY frame tells us.
#[derive(Clone, Debug, PartialEq)]
struct Announcement {
    ip: IpAddr,
    serial: String,
    name: Option<String>,
}

impl Announcement {
    fn identity(&self) -> RawIdentity {
        let identity = DeviceIdentity::new(BAMBU_VID, model_from_serial(&self.serial))
            .with_serial(&self.serial)
            .with_ip(&self.ip.to_string(), None);
        let mut raw = RawIdentity::from(&identity);
        if let Some(name) = &self.name {
            raw.0.insert("name".to_owned(), Value::from(name.as_str()));
        }
        raw
    }
}

/// Parse one SSDP frame. Frames that aren't a vendor NOTIFY are ignored.
fn parse_notify(payload: &str) -> Option<Announcement> {
    let mut lines = payload.lines().map(str::trim).filter(|l| !l.is_empty());

    let header = lines.next()?;
    if header != "NOTIFY * HTTP/1.1" {
        tracing::trace!("not a notify, ignoring header {:?}", header);
        return None;
    }

    let mut urn = None;
    let mut name = None;
    let mut ip = None;
    let mut serial = None;
    for line in lines {
        let Some((token, rest)) = line.split_once(':') else {
            tracing::debug!("bad token line {}", line);
            continue;
        };
        let rest = rest.trim();
        match token.trim() {
            "Location" => ip = rest.parse::<IpAddr>().ok(),
            "DevName.bambu.com" => name = Some(rest.to_owned()),
            "USN" => serial = Some(rest.to_owned()),
            "NT" => urn = Some(rest),
            _ => (),
        }
    }

    if urn != Some(BAMBU_URN) {
        tracing::debug!(urn = ?urn, "not a bambu printer");
        return None;
    }
    let Some(ip) = ip else {
        tracing::warn!(name = ?name, "no IP address in announcement");
        return None;
    };
    let serial = serial.filter(|s| !s.is_empty())?;
    Some(Announcement { ip, serial, name })
}

type Seen = Arc<Mutex<HashMap<String, (Announcement, Instant)>>>;

/// Listens for the vendor's SSDP announcements on UDP port 2021. The
/// printers also answer on the network, so this detector pre-empts the
/// network probe whenever it has something to report.
pub struct BambuDetector {
    seen: Seen,
    listener: JoinHandle<()>,
}

impl BambuDetector {
    /// Bind the announcement port and start listening.
    pub async fn listen() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, NOTIFY_PORT)).await?;
        let seen: Seen = Arc::default();
        tracing::info!(port = NOTIFY_PORT, "listening for bambu announcements");
        let listener = tokio::spawn(Self::receive(socket, seen.clone()));
        Ok(Self { seen, listener })
    }

    async fn receive(socket: UdpSocket, seen: Seen) {
        let mut buf = [0u8; 1536];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = format!("{:?}", e), "bambu listener stopped");
                    return;
                }
            };
            // Vendor frames are ASCII; anything else fails to parse anyway.
            let payload = String::from_utf8_lossy(&buf[..n]);
            if let Some(announcement) = parse_notify(&payload) {
                tracing::trace!(serial = announcement.serial, ip = announcement.ip.to_string(), "bambu announcement");
                seen.lock()
                    .insert(announcement.serial.clone(), (announcement, Instant::now()));
            }
        }
    }
}

impl Drop for BambuDetector {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Detector for BambuDetector {
    fn name(&self) -> &'static str {
        "bambu"
    }

    fn conflicts(&self) -> &'static [&'static str] {
        &["network"]
    }

    async fn poll(&self) -> Result<Vec<RawIdentity>> {
        let mut seen = self.seen.lock();
        seen.retain(|_, (_, at)| at.elapsed() < STALE_AFTER);
        Ok(seen.values().map(|(announcement, _)| announcement.identity()).collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NOTIFY: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1990\r\n\
        Location: 192.168.1.20\r\n\
        NT: urn:bambulab-com:device:3dprinter:1\r\n\
        USN: 00M09A123456789\r\n\
        DevName.bambu.com: Workshop\r\n\r\n";

    #[test]
    fn test_parse_notify() {
        let announcement = parse_notify(NOTIFY).unwrap();
        assert_eq!(
            announcement,
            Announcement {
                ip: "192.168.1.20".parse().unwrap(),
                serial: "00M09A123456789".to_owned(),
                name: Some("Workshop".to_owned()),
            }
        );

        let identity = announcement.identity();
        assert_eq!(identity.0["PID"], "X1C");
        assert_eq!(identity.0["IP"], "192.168.1.20");
        assert_eq!(identity.0["name"], "Workshop");
    }

    #[test]
    fn test_ignores_other_frames() {
        assert_eq!(parse_notify("M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n"), None);
        assert_eq!(parse_notify(&NOTIFY.replace("bambulab-com", "example-com")), None);
        assert_eq!(parse_notify(&NOTIFY.replace("192.168.1.20", "not an ip")), None);
        assert_eq!(parse_notify(""), None);
    }

    #[test]
    fn test_model_from_serial() {
        assert_eq!(model_from_serial("01P00A000000000"), "P1S");
        assert_eq!(model_from_serial("999"), "X1C");
    }
}
