//! Local control channels.
//!
//! Both the proxy process and the privileged daemon expose a Unix socket
//! that accepts JSON messages. This module holds the message catalog and
//! the transport; the handlers live with the processes that own them.

pub mod protocol;
pub mod socket;

pub use protocol::{
    DaemonMessage, EnableProxyPayload, Endpoint, IpcRequest, IpcResponse, ProxyEnabledStatus,
    ProxyMessage, RunningStatus, StartedStatus,
};
pub use socket::{
    HandlerError, IpcClient, IpcServer, MessageHandler, SocketError, SocketResult,
};
