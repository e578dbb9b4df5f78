//! IPC message types for the proxy and daemon control channels.
//!
//! Every exchange is one request and one response:
//!
//! ```text
//! request:  {"type": "enable-proxy", "skipWait": false, ...payload}
//! response: {"processed": true, "data": {...}, "err": "..."}
//! ```
//!
//! # Channels
//!
//! ```text
//! ┌──────────┐   ProxyMessage    ┌───────────────┐   DaemonMessage   ┌──────────┐
//! │ UI / CLI │──────────────────>│ proxy process │──────────────────>│  daemon  │
//! └──────────┘                   └───────────────┘<──── ping ────────└──────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Message type, e.g. `ping`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Acknowledge immediately and handle after the connection is closed.
    #[serde(rename = "skipWait", default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_wait: bool,

    /// Remaining message fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl IpcRequest {
    /// Request with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            skip_wait: false,
            payload: Map::new(),
        }
    }

    /// Request whose payload fields come from a serializable struct.
    pub fn with_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            _ => {
                return Err(serde::ser::Error::custom(
                    "IPC payload must serialize to an object",
                ));
            }
        };
        Ok(Self {
            kind: kind.into(),
            skip_wait: false,
            payload,
        })
    }

    /// Set `skipWait`.
    #[must_use]
    pub fn skip_wait(mut self, skip_wait: bool) -> Self {
        self.skip_wait = skip_wait;
        self
    }

    /// Decode the payload fields.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Whether the server handled the message.
    pub processed: bool,

    /// Handler result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Failure description when `processed` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl IpcResponse {
    /// Successful response.
    pub fn processed(data: Option<Value>) -> Self {
        Self {
            processed: true,
            data,
            err: None,
        }
    }

    /// Failed response.
    pub fn failed(err: impl fmt::Display) -> Self {
        Self {
            processed: false,
            data: None,
            err: Some(err.to_string()),
        }
    }

    /// Decode `data`, if present and well-formed.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}

/// Messages accepted by the proxy process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyMessage {
    /// Liveness check.
    Ping,
    /// Reports `{running}` (system integration enabled).
    IsRunning,
    /// Reports `{isShuttingDown}`.
    IsStarted,
    /// Shut the proxy down.
    Stop,
    /// Enable the secure environment.
    Enable,
}

impl ProxyMessage {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMessage::Ping => "ping",
            ProxyMessage::IsRunning => "is-running",
            ProxyMessage::IsStarted => "is-started",
            ProxyMessage::Stop => "stop",
            ProxyMessage::Enable => "enable",
        }
    }

    /// Parse a wire name.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "ping" => Some(ProxyMessage::Ping),
            "is-running" => Some(ProxyMessage::IsRunning),
            "is-started" => Some(ProxyMessage::IsStarted),
            "stop" => Some(ProxyMessage::Stop),
            "enable" => Some(ProxyMessage::Enable),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages accepted by the privileged daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonMessage {
    /// Liveness check.
    Ping,
    /// Trust the CA and point the system proxy at us.
    EnableProxy,
    /// Undo `EnableProxy` and exit.
    DisableProxy,
    /// Reports `{enabled}`.
    IsProxyEnabled,
}

impl DaemonMessage {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonMessage::Ping => "ping",
            DaemonMessage::EnableProxy => "enable-proxy",
            DaemonMessage::DisableProxy => "disable-proxy",
            DaemonMessage::IsProxyEnabled => "is-proxy-enabled",
        }
    }

    /// Parse a wire name.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "ping" => Some(DaemonMessage::Ping),
            "enable-proxy" => Some(DaemonMessage::EnableProxy),
            "disable-proxy" => Some(DaemonMessage::DisableProxy),
            "is-proxy-enabled" => Some(DaemonMessage::IsProxyEnabled),
            _ => None,
        }
    }
}

impl fmt::Display for DaemonMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host and port of a local listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Payload of `enable-proxy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableProxyPayload {
    /// Proxy listen host.
    pub host: String,
    /// Proxy listen port.
    pub port: u16,
    /// PEM file of the root CA to trust.
    pub certificate_path: PathBuf,
    /// Common name of the root CA, used to find it in trust stores.
    pub common_name: String,
    /// PAC server endpoint.
    pub pac: Endpoint,
}

/// `data` of `is-running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningStatus {
    /// System integration is active.
    pub running: bool,
}

/// `data` of `is-started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedStatus {
    /// Shutdown has begun.
    pub is_shutting_down: bool,
}

/// `data` of `is-proxy-enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEnabledStatus {
    /// The daemon has attached the proxy to the system.
    pub enabled: bool,
}
