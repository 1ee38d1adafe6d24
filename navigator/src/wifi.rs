use std::path::Path;
use std::time::Duration;

use tracing::debug;

/// Connection state written by the provisioning portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Connected,
    Disconnected,
    CannotConnect,
}

impl PortalState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "CONNECTED" => Some(Self::Connected),
            "DISCONNECTED" => Some(Self::Disconnected),
            "CANNOT_CONNECT" => Some(Self::CannotConnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WifiStatus {
    pub connected: bool,
    pub ssid: Option<String>,
}

/// Probe the wireless link: ask the interface for its SSID, fall back to the
/// portal status file. Either source failing just means "disconnected".
pub async fn probe(status_path: &Path) -> WifiStatus {
    if let Some(ssid) = current_ssid().await {
        return WifiStatus {
            connected: true,
            ssid: Some(ssid),
        };
    }

    let portal = std::fs::read_to_string(status_path)
        .ok()
        .and_then(|raw| PortalState::parse(&raw));
    debug!(?portal, "wifi probe fell back to portal status");

    WifiStatus {
        connected: portal == Some(PortalState::Connected),
        ssid: None,
    }
}

async fn current_ssid() -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::process::Command::new("iwgetid").arg("-r").output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    let ssid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!ssid.is_empty()).then_some(ssid)
}
