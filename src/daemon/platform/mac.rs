//! macOS integration: the System keychain and the active network service's
//! auto proxy URL.

use super::{
    Platform, PlatformConfig, PlatformError, PlatformResult, enable_firefox_enterprise_roots,
    run_command, update_curlrc,
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";
const TRUST_SETTINGS_RIGHT: &str = "com.apple.trust-settings.admin";
const FIREFOX_PROFILES_PATH: &str = "Library/Application Support/Firefox/Profiles";

/// [`Platform`] for macOS.
pub struct MacPlatform {
    config: PlatformConfig,
}

impl MacPlatform {
    /// Platform for `config`.
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }

    async fn is_certificate_in_store(&self) -> bool {
        run_command("security", &["find-certificate", "-c", &self.config.ca.common_name])
            .await
            .is_ok()
    }

    async fn trust_certificate(&self, trust: bool) -> PlatformResult<()> {
        let common_name = self.config.ca.common_name.as_str();
        let ca_path = self.config.ca.path.to_string_lossy().into_owned();

        let installed = self.is_certificate_in_store().await;
        with_trust_settings_admin(async {
            if installed {
                run_command("security", &["delete-certificate", "-c", common_name]).await?;
            }
            if trust {
                run_command(
                    "security",
                    &["add-trusted-cert", "-d", "-r", "trustRoot", "-k", SYSTEM_KEYCHAIN, &ca_path],
                )
                .await?;
            }
            Ok(())
        })
        .await?;

        if trust && let Some(home) = &self.config.home {
            enable_firefox_enterprise_roots(&home.join(FIREFOX_PROFILES_PATH), |_| true).await?;
        }
        Ok(())
    }

    async fn toggle_network_proxy(&self, enable: bool) -> PlatformResult<()> {
        let service = active_network_service().await?;
        let pac_url = self.config.pac_url();
        let state = if enable { "on" } else { "off" };

        with_trust_settings_admin(async {
            if enable {
                run_command("networksetup", &["-setautoproxyurl", &service, &pac_url]).await?;
            }
            run_command("networksetup", &["-setautoproxystate", &service, state]).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Platform for MacPlatform {
    async fn attach(&self) -> PlatformResult<()> {
        info!(
            proxy = %self.config.proxy,
            ca_path = ?self.config.ca.path,
            ca_name = %self.config.ca.common_name,
            "Attaching proxy to system"
        );
        self.trust_certificate(true).await?;
        self.configure_web_proxy(true).await
    }

    async fn detach(&self) -> PlatformResult<()> {
        info!(
            proxy = %self.config.proxy,
            ca_name = %self.config.ca.common_name,
            "Detaching proxy from system"
        );
        self.trust_certificate(false).await?;
        self.configure_web_proxy(false).await
    }

    async fn configure_web_proxy(&self, enable: bool) -> PlatformResult<()> {
        let proxy = enable.then_some(&self.config.proxy);
        update_curlrc(self.config.home.as_deref(), proxy).await?;
        self.toggle_network_proxy(enable).await
    }
}

/// Run `body` with the trust settings right granted, revoking it afterwards.
async fn with_trust_settings_admin<F>(body: F) -> PlatformResult<()>
where
    F: std::future::Future<Output = PlatformResult<()>>,
{
    run_command("security", &["authorizationdb", "write", TRUST_SETTINGS_RIGHT, "allow"]).await?;
    let result = body.await;
    if let Err(e) = run_command("security", &["authorizationdb", "remove", TRUST_SETTINGS_RIGHT]).await {
        warn!("Failed to revoke {}: {}", TRUST_SETTINGS_RIGHT, e);
    }
    result
}

/// First network service with an IP address assigned.
async fn active_network_service() -> PlatformResult<String> {
    let services = run_command("networksetup", &["-listallnetworkservices"]).await?;

    for service in network_services(&services) {
        match run_command("networksetup", &["-getinfo", service]).await {
            Ok(info) if assigned_ip_address(&info).is_some() => return Ok(service.to_string()),
            Ok(_) => {}
            Err(e) => debug!("Skipping network service {}: {}", service, e),
        }
    }

    Err(PlatformError::NoNetworkService)
}

/// Service names from `networksetup -listallnetworkservices`.
///
/// The first line is a legend and disabled services start with `*`.
pub fn network_services(output: &str) -> impl Iterator<Item = &str> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
}

/// The `IP address:` value from `networksetup -getinfo`.
pub fn assigned_ip_address(info: &str) -> Option<&str> {
    info.lines()
        .find_map(|line| line.strip_prefix("IP address:"))
        .map(str::trim)
        .filter(|address| !address.is_empty() && *address != "none")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_services() {
        let output = "An asterisk (*) denotes that a network service is disabled.\nWi-Fi\n*Bluetooth PAN\nThunderbolt Bridge\n\n";
        let services: Vec<_> = network_services(output).collect();
        assert_eq!(services, vec!["Wi-Fi", "Thunderbolt Bridge"]);
    }

    #[test]
    fn test_assigned_ip_address() {
        let info = "DHCP Configuration\nIP address: 192.168.1.20\nSubnet mask: 255.255.255.0\n";
        assert_eq!(assigned_ip_address(info), Some("192.168.1.20"));

        let unassigned = "DHCP Configuration\nIP address: none\n";
        assert_eq!(assigned_ip_address(unassigned), None);
        assert_eq!(assigned_ip_address("Manual Configuration\n"), None);
    }
}
