//! System integration: trusting the root CA and pointing the system proxy
//! settings at the PAC server.
//!
//! Each OS gets its own [`Platform`] implementation, chosen by
//! [`create_platform`] from an OS identifier (`std::env::consts::OS`).
//! Everything here shells out through `tokio::process::Command`; a command
//! that exits non-zero becomes [`PlatformError::Command`].

mod linux;
mod mac;

pub use linux::LinuxPlatform;
pub use mac::MacPlatform;

use crate::control::{EnableProxyPayload, Endpoint};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Name of curl's per-user config file.
pub const CURL_RC_FILE: &str = ".curlrc";

/// Firefox preference that makes it trust the OS certificate store.
const ENTERPRISE_ROOTS_PREF: &str = "security.enterprise_roots.enabled";

/// Errors from system integration.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// No implementation for this OS.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// A command could not be started.
    #[error("Failed to run {cmd}: {source}")]
    Spawn {
        /// Command line.
        cmd: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A command exited unsuccessfully.
    #[error("Command {cmd} failed: {stderr}")]
    Command {
        /// Command line.
        cmd: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Reading or writing a settings file failed.
    #[error("Failed to update {path}: {source}")]
    Io {
        /// File being updated.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// No network service has an address assigned.
    #[error("No active network service found")]
    NoNetworkService,
}

/// Result alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Root CA as handed to the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCa {
    /// PEM file on disk.
    pub path: PathBuf,
    /// Subject common name.
    pub common_name: String,
}

/// Everything a platform needs to attach and detach the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Root CA to trust.
    pub ca: RootCa,
    /// HTTP proxy endpoint, used for curl.
    pub proxy: Endpoint,
    /// PAC server endpoint, used for the system proxy.
    pub pac: Endpoint,
    /// Home directory of the desktop user.
    pub home: Option<PathBuf>,
}

impl PlatformConfig {
    /// Build from an `enable-proxy` payload for the current user.
    pub fn from_payload(payload: &EnableProxyPayload) -> Self {
        Self {
            ca: RootCa {
                path: payload.certificate_path.clone(),
                common_name: payload.common_name.clone(),
            },
            proxy: Endpoint {
                host: payload.host.clone(),
                port: payload.port,
            },
            pac: payload.pac.clone(),
            home: dirs::home_dir(),
        }
    }

    /// URL of the PAC script.
    pub fn pac_url(&self) -> String {
        format!("http://{}/proxy.pac", self.pac)
    }
}

/// OS-specific system integration.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Trust the CA and enable the web proxy.
    async fn attach(&self) -> PlatformResult<()>;

    /// Remove the CA and disable the web proxy.
    async fn detach(&self) -> PlatformResult<()>;

    /// Toggle the system and curl proxy settings only.
    async fn configure_web_proxy(&self, enable: bool) -> PlatformResult<()>;
}

/// Pick the implementation for `os` (`linux`, `macos`).
pub fn create_platform(os: &str, config: PlatformConfig) -> PlatformResult<Box<dyn Platform>> {
    match os {
        "linux" => Ok(Box::new(LinuxPlatform::new(config))),
        "macos" => Ok(Box::new(MacPlatform::new(config))),
        other => Err(PlatformError::UnsupportedPlatform(other.to_string())),
    }
}

/// Run a command to completion, returning its stdout.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> PlatformResult<String> {
    let cmd = format!("{} {}", program, args.join(" "));
    debug!("Running: {}", cmd);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| PlatformError::Spawn {
            cmd: cmd.clone(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(PlatformError::Command { cmd, stderr });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `.curlrc` contents with our `proxy=` line added or removed.
pub fn curlrc_contents(existing: &str, proxy: Option<&Endpoint>) -> String {
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.starts_with("proxy="))
        .map(str::to_string)
        .collect();
    if let Some(proxy) = proxy {
        lines.push(format!("proxy=http://{}", proxy));
    }
    lines.join("\n")
}

/// Rewrite `<home>/.curlrc` for `proxy`. A missing home is skipped.
pub(crate) async fn update_curlrc(home: Option<&Path>, proxy: Option<&Endpoint>) -> PlatformResult<()> {
    let Some(home) = home else {
        debug!("No home directory, skipping {}", CURL_RC_FILE);
        return Ok(());
    };

    let path = home.join(CURL_RC_FILE);
    let existing = read_optional(&path).await?;
    write_file(&path, &curlrc_contents(&existing, proxy)).await
}

/// Firefox `user.js` contents with the enterprise roots preference set.
pub fn user_prefs_with_enterprise_roots(existing: &str) -> String {
    let pref = format!("user_pref(\"{}\", true);", ENTERPRISE_ROOTS_PREF);
    let mut prefs: Vec<&str> = existing
        .lines()
        .filter(|line| !line.is_empty() && !line.contains(ENTERPRISE_ROOTS_PREF))
        .collect();
    prefs.push(&pref);
    prefs.join("\n") + "\n"
}

/// Make every matching Firefox profile under `profiles_dir` trust the OS store.
pub(crate) async fn enable_firefox_enterprise_roots<F>(profiles_dir: &Path, is_profile: F) -> PlatformResult<()>
where
    F: Fn(&str) -> bool,
{
    let mut entries = match tokio::fs::read_dir(profiles_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(PlatformError::Io {
                path: profiles_dir.to_path_buf(),
                source: e,
            });
        }
    };

    while let Some(entry) = entries.next_entry().await.map_err(|e| PlatformError::Io {
        path: profiles_dir.to_path_buf(),
        source: e,
    })? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_dir || !is_profile(&name) {
            continue;
        }

        let prefs_path = entry.path().join("user.js");
        let existing = read_optional(&prefs_path).await?;
        write_file(&prefs_path, &user_prefs_with_enterprise_roots(&existing)).await?;
        debug!("Enabled enterprise roots for Firefox profile {}", name);
    }

    Ok(())
}

async fn read_optional(path: &Path) -> PlatformResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PlatformError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn write_file(path: &Path, contents: &str) -> PlatformResult<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| PlatformError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn proxy() -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: 4050,
        }
    }

    fn config(home: Option<PathBuf>) -> PlatformConfig {
        PlatformConfig {
            ca: RootCa {
                path: PathBuf::from("/tmp/ca.pem"),
                common_name: "IC HTTP Proxy Root Authority".to_string(),
            },
            proxy: proxy(),
            pac: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 4049,
            },
            home,
        }
    }

    #[test]
    fn test_create_platform_by_os() {
        assert!(create_platform("linux", config(None)).is_ok());
        assert!(create_platform("macos", config(None)).is_ok());
        assert!(matches!(
            create_platform("windows", config(None)),
            Err(PlatformError::UnsupportedPlatform(os)) if os == "windows"
        ));
    }

    #[test]
    fn test_pac_url() {
        assert_eq!(config(None).pac_url(), "http://127.0.0.1:4049/proxy.pac");
    }

    #[test]
    fn test_from_payload() {
        let payload = EnableProxyPayload {
            host: "127.0.0.1".to_string(),
            port: 4050,
            certificate_path: PathBuf::from("/data/certs/ca.cert"),
            common_name: "Root".to_string(),
            pac: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 4049,
            },
        };

        let config = PlatformConfig::from_payload(&payload);
        assert_eq!(config.ca.path, PathBuf::from("/data/certs/ca.cert"));
        assert_eq!(config.ca.common_name, "Root");
        assert_eq!(config.proxy, proxy());
    }

    #[test]
    fn test_curlrc_replaces_proxy_line() {
        let existing = "silent\nproxy=http://old:1\nretry=3";
        assert_eq!(
            curlrc_contents(existing, Some(&proxy())),
            "silent\nretry=3\nproxy=http://127.0.0.1:4050"
        );
        assert_eq!(curlrc_contents(existing, None), "silent\nretry=3");
        assert_eq!(curlrc_contents("", Some(&proxy())), "proxy=http://127.0.0.1:4050");
    }

    #[test]
    fn test_user_prefs_with_enterprise_roots() {
        let existing = "user_pref(\"a\", 1);\n\nuser_pref(\"security.enterprise_roots.enabled\", false);\n";
        assert_eq!(
            user_prefs_with_enterprise_roots(existing),
            "user_pref(\"a\", 1);\nuser_pref(\"security.enterprise_roots.enabled\", true);\n"
        );
    }

    #[tokio::test]
    async fn test_update_curlrc_round_trip() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(CURL_RC_FILE), "silent").await.unwrap();

        update_curlrc(Some(dir.path()), Some(&proxy())).await.unwrap();
        let enabled = tokio::fs::read_to_string(dir.path().join(CURL_RC_FILE)).await.unwrap();
        assert_eq!(enabled, "silent\nproxy=http://127.0.0.1:4050");

        update_curlrc(Some(dir.path()), None).await.unwrap();
        let disabled = tokio::fs::read_to_string(dir.path().join(CURL_RC_FILE)).await.unwrap();
        assert_eq!(disabled, "silent");
    }

    #[tokio::test]
    async fn test_update_curlrc_without_home_is_noop() {
        update_curlrc(None, Some(&proxy())).await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_firefox_enterprise_roots() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("abc.default-release")).unwrap();
        std::fs::create_dir(dir.path().join("other")).unwrap();

        enable_firefox_enterprise_roots(dir.path(), |name| name.ends_with(".default-release"))
            .await
            .unwrap();

        let prefs = std::fs::read_to_string(dir.path().join("abc.default-release/user.js")).unwrap();
        assert!(prefs.contains("security.enterprise_roots.enabled\", true"));
        assert!(!dir.path().join("other/user.js").exists());
    }

    #[tokio::test]
    async fn test_missing_profiles_dir_is_ignored() {
        let dir = tempdir().unwrap();
        enable_firefox_enterprise_roots(&dir.path().join("missing"), |_| true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_command_failure() {
        let err = run_command("sh", &["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        assert!(matches!(err, PlatformError::Command { ref stderr, .. } if stderr == "boom"));

        let out = run_command("sh", &["-c", "echo ok"]).await.unwrap();
        assert_eq!(out.trim(), "ok");
    }
}
