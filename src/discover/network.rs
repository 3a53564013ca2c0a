use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;

use crate::{config::NetworkPrinterConfig, identity::RawIdentity, Detector, DeviceIdentity};

/// Reports configured network devices that accept a TCP connection.
pub struct NetworkDetector {
    printers: Vec<NetworkPrinterConfig>,
}

impl NetworkDetector {
    /// Detector probing `printers`.
    pub fn new(printers: Vec<NetworkPrinterConfig>) -> Self {
        Self { printers }
    }
}

async fn reachable(printer: &NetworkPrinterConfig) -> bool {
    let timeout = Duration::from_millis(printer.probe_timeout_ms);
    match tokio::time::timeout(timeout, TcpStream::connect((printer.ip.as_str(), printer.port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(ip = printer.ip, port = printer.port, error = format!("{:?}", e), "probe refused");
            false
        }
        Err(_) => {
            tracing::debug!(ip = printer.ip, port = printer.port, "probe timed out");
            false
        }
    }
}

fn identity(printer: &NetworkPrinterConfig) -> RawIdentity {
    let mut identity = DeviceIdentity::new(&printer.vid, &printer.pid).with_ip(&printer.ip, Some(printer.port));
    if let Some(serial) = &printer.serial {
        identity = identity.with_serial(serial);
    }
    identity.password = printer.password.clone();
    (&identity).into()
}

#[async_trait]
impl Detector for NetworkDetector {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn poll(&self) -> Result<Vec<RawIdentity>> {
        let probes = join_all(self.printers.iter().map(reachable)).await;
        Ok(self
            .printers
            .iter()
            .zip(probes)
            .filter(|(_, up)| *up)
            .map(|(printer, _)| identity(printer))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;

    fn printer(port: u16) -> NetworkPrinterConfig {
        NetworkPrinterConfig {
            ip: "127.0.0.1".to_owned(),
            port,
            vid: "AAAA".to_owned(),
            pid: "BBBB".to_owned(),
            serial: Some(port.to_string()),
            password: Some("secret".to_owned()),
            probe_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_only_reachable_hosts_are_reported() -> TestResult {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let up = listener.local_addr()?.port();
        let down = {
            let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            closed.local_addr()?.port()
        };

        let detector = NetworkDetector::new(vec![printer(up), printer(down)]);
        let found = detector.poll().await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0["PORT"], u64::from(up));
        assert_eq!(found[0].0["PASS"], "secret");
        Ok(())
    }
}
