//! Frame transports
//!
//! A transport moves [`Frame`]s between the controller and one device. Two
//! variants exist: a UDP socket pair for devices reached over the local
//! network, and an encapsulation over a mux data channel for tethered
//! devices. Incoming frames and link-status changes are delivered on an
//! event channel handed out at construction time.

pub mod mux;
pub mod net;

use crate::frame::Frame;
use crate::Result;
use async_trait::async_trait;

pub use mux::MuxTransport;
pub use net::NetTransport;

/// Transport variant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Net,
    Mux,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Net => write!(f, "net"),
            TransportType::Mux => write!(f, "mux"),
        }
    }
}

/// Event emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame arrived from the device
    Frame(Frame),
    /// The underlying link is gone; no further frames will arrive
    LinkDown,
}

/// Common transport interface
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Send one frame to the device
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Stop the transport; pending receive tasks end
    async fn stop(&self);
}
