//! Connection backends
//!
//! A backend knows how to establish the command transport to a device: the
//! `net` variant negotiates ports over a JSON-in-TCP handshake and brings up
//! a UDP pair; the `mux` variant asks the device over the backend control
//! channel of a tethered mux link. Backends are registered with a
//! [`Controller`](crate::controller::Controller) and shared by every device
//! they produce.

pub mod mux;
pub mod net;

use crate::transport::{Transport, TransportEvent};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use mux::MuxBackend;
pub use net::NetBackend;

/// Protocol versions this SDK can speak
pub const PROTO_V_MIN: u32 = 1;
pub const PROTO_V_MAX: u32 = 3;

/// Backend variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Net,
    Mux,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Net => write!(f, "net"),
            BackendType::Mux => write!(f, "mux"),
        }
    }
}

/// Static capabilities advertised by a backend
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    /// Oldest protocol version the backend can speak
    pub proto_v_min: u32,

    /// Newest protocol version the backend can speak
    pub proto_v_max: u32,

    /// Whether QoS mode is requested during the handshake
    pub qos_mode_supported: bool,

    /// Whether video stream ports are advertised during the handshake
    pub stream_supported: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            proto_v_min: PROTO_V_MIN,
            proto_v_max: PROTO_V_MAX,
            qos_mode_supported: false,
            stream_supported: false,
        }
    }
}

/// Parameters of a connection attempt
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Identifier string sent as `controller_name`
    pub controller_name: String,

    /// Identifier string sent as `controller_type`
    pub controller_type: String,

    /// Requested peer id; may be empty
    pub device_id: String,

    /// Opaque extra fields merged into the handshake message
    pub json: Option<serde_json::Value>,
}

/// States of an in-progress net connection dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    ConnectingJson,
    JsonSent,
    JsonReceived,
    Connected,
}

/// An established device connection
///
/// Owned by the device while connected; dropping it tears the transport
/// down.
pub struct DeviceConnection {
    pub transport: Arc<dyn Transport>,
    /// Receive side of the transport, consumed by the command interface
    pub transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// Protocol version selected by the peer
    pub proto_v: u32,
    /// QoS mode selected by the peer; 0 is off
    pub qos_mode: i32,
    /// UDP port to send to (net backend only)
    pub c2d_port: u16,
    /// Raw peer response for fields the SDK does not interpret
    pub peer_json: serde_json::Value,
}

/// Address information a backend needs to reach a device
#[derive(Debug, Clone)]
pub struct DeviceAddr {
    /// Discovery-advertised address; unused over mux
    pub addr: String,

    /// Discovery-advertised handshake port; unused over mux
    pub port: u16,

    /// Opaque device id, forwarded in the handshake when set
    pub device_id: String,
}

/// Capability set every backend implements
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name, unique within a controller
    fn name(&self) -> &str;

    fn backend_type(&self) -> BackendType;

    fn capabilities(&self) -> BackendCapabilities;

    /// Establish the command transport to a device
    async fn start_device_conn(
        &self,
        device: &DeviceAddr,
        req: &ConnectionRequest,
    ) -> Result<DeviceConnection>;

    /// Abort an in-progress or established connection
    async fn stop_device_conn(&self, conn: &DeviceConnection) -> Result<()>;

    /// Shared mux context, when the backend rides a mux link
    fn mux_context(&self) -> Option<Arc<crate::mux::MuxContext>> {
        None
    }
}
