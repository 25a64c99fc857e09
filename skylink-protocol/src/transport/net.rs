//! UDP transport
//!
//! Two unidirectional datagram flows: the receive socket is bound before the
//! connection handshake so its port can be advertised as `d2c_port`, and the
//! peer flow is armed once the handshake returns the device's `c2d_port`.
//! One frame per datagram.

use super::{Transport, TransportEvent, TransportType};
use crate::frame::Frame;
use crate::{Result, SdkError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest datagram accepted on the receive path
const MAX_DATAGRAM: usize = 65536;

pub struct NetTransport {
    rx_socket: Arc<UdpSocket>,
    tx_socket: Arc<UdpSocket>,
    peer: RwLock<Option<SocketAddr>>,
    rx_task: RwLock<Option<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl NetTransport {
    /// Bind the receive socket; `rx_port == 0` picks an ephemeral port
    ///
    /// The returned receiver yields incoming frames once [`Self::start`] has
    /// armed the peer address.
    pub async fn bind(
        rx_port: u16,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let rx_socket = UdpSocket::bind(("0.0.0.0", rx_port))
            .await
            .map_err(|e| SdkError::from_io_error(e, "binding command rx socket"))?;
        let tx_socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| SdkError::from_io_error(e, "binding command tx socket"))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            rx_socket: Arc::new(rx_socket),
            tx_socket: Arc::new(tx_socket),
            peer: RwLock::new(None),
            rx_task: RwLock::new(None),
            event_tx,
        });
        Ok((transport, event_rx))
    }

    /// Port the receive socket is bound to (the advertised `d2c_port`)
    pub fn rx_port(&self) -> Result<u16> {
        Ok(self.rx_socket.local_addr().map_err(SdkError::Io)?.port())
    }

    /// Arm the peer address and start the receive loop
    pub async fn start(self: &Arc<Self>, peer: SocketAddr) -> Result<()> {
        {
            let mut guard = self.peer.write().await;
            if guard.is_some() {
                return Err(SdkError::not_permitted("transport already started"));
            }
            *guard = Some(peer);
        }
        debug!("net transport: peer armed at {}", peer);

        let socket = self.rx_socket.clone();
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((size, src)) => match Frame::from_bytes(&buf[..size]) {
                        Ok(frame) => {
                            let _ = event_tx.send(TransportEvent::Frame(frame));
                        }
                        Err(e) => warn!("net transport: bad frame from {}: {}", src, e),
                    },
                    Err(e) => {
                        debug!("net transport: rx socket closed: {}", e);
                        let _ = event_tx.send(TransportEvent::LinkDown);
                        break;
                    }
                }
            }
        });
        *self.rx_task.write().await = Some(task);
        Ok(())
    }
}

#[async_trait]
impl Transport for NetTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Net
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let peer = (*self.peer.read().await)
            .ok_or_else(|| SdkError::not_permitted("transport not started"))?;
        let bytes = frame.to_bytes();
        self.tx_socket
            .send_to(&bytes, peer)
            .await
            .map_err(|e| SdkError::from_io_error(e, "sending command frame"))?;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.rx_task.write().await.take() {
            task.abort();
        }
        let _ = self.event_tx.send(TransportEvent::LinkDown);
    }
}
