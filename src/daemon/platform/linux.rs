//! Linux integration: the Debian-style CA directory, GNOME proxy settings
//! and Firefox profiles.

use super::{
    Platform, PlatformConfig, PlatformError, PlatformResult, enable_firefox_enterprise_roots,
    run_command, update_curlrc,
};
use async_trait::async_trait;
use std::path::Path;
use tracing::{info, warn};

/// Where `update-ca-certificates` picks up local authorities.
pub const ROOT_CA_PATH: &str = "/usr/local/share/ca-certificates/ic-http-proxy-root-ca.crt";

/// Firefox profile roots relative to the home directory.
const FIREFOX_PROFILE_ROOTS: &[&str] = &[".mozilla/firefox", "snap/firefox/common/.mozilla/firefox"];

/// [`Platform`] for Linux desktops.
pub struct LinuxPlatform {
    config: PlatformConfig,
    /// Desktop user whose session settings are changed.
    username: Option<String>,
}

impl LinuxPlatform {
    /// Platform acting for the user in `LOGNAME`.
    pub fn new(config: PlatformConfig) -> Self {
        let username = std::env::var("LOGNAME")
            .ok()
            .filter(|name| !name.is_empty() && name != "root");
        Self { config, username }
    }

    async fn trust_certificate(&self, trust: bool) -> PlatformResult<()> {
        let target = Path::new(ROOT_CA_PATH);

        if trust {
            tokio::fs::copy(&self.config.ca.path, target)
                .await
                .map_err(|e| PlatformError::Io {
                    path: target.to_path_buf(),
                    source: e,
                })?;
        } else {
            match tokio::fs::remove_file(target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(PlatformError::Io {
                        path: target.to_path_buf(),
                        source: e,
                    });
                }
            }
        }

        run_command("update-ca-certificates", &[]).await?;

        if trust && let Some(home) = &self.config.home {
            for root in FIREFOX_PROFILE_ROOTS {
                enable_firefox_enterprise_roots(&home.join(root), |name| {
                    name.ends_with(".default") || name.ends_with(".default-release")
                })
                .await?;
            }
        }

        Ok(())
    }

    async fn toggle_gnome_proxy(&self, enable: bool) -> PlatformResult<()> {
        let script = gsettings_script(enable, &self.config.pac_url());

        let result = match &self.username {
            Some(user) => run_command("su", &["-l", user, "-c", &script]).await,
            None => run_command("sh", &["-c", &script]).await,
        };

        match result {
            Err(PlatformError::Command { cmd, stderr }) if stderr.contains("gsettings: not found") => {
                warn!(cmd = %cmd, "gsettings is not available, system proxy left unchanged");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

/// Shell script switching the GNOME proxy to the PAC URL, or off.
pub fn gsettings_script(enable: bool, pac_url: &str) -> String {
    if enable {
        format!(
            "gsettings set org.gnome.system.proxy mode 'auto' && gsettings set org.gnome.system.proxy autoconfig-url '{}'",
            pac_url
        )
    } else {
        "gsettings set org.gnome.system.proxy mode 'none'".to_string()
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
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
        self.toggle_gnome_proxy(enable).await
    }
}
