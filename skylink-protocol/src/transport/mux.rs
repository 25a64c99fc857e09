//! Mux data-channel transport
//!
//! Command frames for a tethered device ride a dynamically assigned mux data
//! channel, one frame per mux packet. A channel reset maps to `LinkDown`.

use super::{Transport, TransportEvent, TransportType};
use crate::frame::Frame;
use crate::mux::{MuxChannel, MuxContext, MuxEvent};
use crate::{Result, SdkError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct MuxTransport {
    ctx: Arc<MuxContext>,
    channel_id: u32,
    rx_task: RwLock<Option<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MuxTransport {
    /// Adopt an opened data channel and start decoding frames from it
    pub fn new(
        ctx: Arc<MuxContext>,
        mut channel: MuxChannel,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel_id = channel.id;

        let tx = event_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = channel.recv().await {
                match event {
                    MuxEvent::Data(data) => match Frame::from_bytes(&data) {
                        Ok(frame) => {
                            let _ = tx.send(TransportEvent::Frame(frame));
                        }
                        Err(e) => warn!("mux transport: bad frame: {}", e),
                    },
                    MuxEvent::Reset => {
                        debug!("mux transport: channel reset");
                        let _ = tx.send(TransportEvent::LinkDown);
                        break;
                    }
                }
            }
        });

        let transport = Arc::new(Self {
            ctx,
            channel_id,
            rx_task: RwLock::new(Some(task)),
            event_tx,
        });
        (transport, event_rx)
    }
}

#[async_trait]
impl Transport for MuxTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Mux
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes();
        self.ctx
            .send(self.channel_id, &bytes)
            .await
            .map_err(|e| match e {
                SdkError::Io(inner) => SdkError::from_io_error(inner, "sending mux frame"),
                other => other,
            })
    }

    async fn stop(&self) {
        if let Some(task) = self.rx_task.write().await.take() {
            task.abort();
        }
        self.ctx.close_channel(self.channel_id).await.ok();
        let _ = self.event_tx.send(TransportEvent::LinkDown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DataType;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    async fn linked_pair() -> (Arc<MuxContext>, Arc<MuxContext>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (
            MuxContext::new(server.unwrap().0),
            MuxContext::new(client.unwrap()),
        )
    }

    #[tokio::test]
    async fn test_mux_frame_roundtrip() {
        let (device, controller) = linked_pair().await;
        let dev_chan = device.open_channel(42).await.unwrap();
        let ctl_chan = controller.open_channel(42).await.unwrap();

        let (dev_tsprt, _dev_rx) = MuxTransport::new(device, dev_chan);
        let (_ctl_tsprt, mut ctl_rx) = MuxTransport::new(controller, ctl_chan);

        let frame = Frame::new(DataType::DataWithAck, 11, 1, Bytes::from_static(b"cmd"));
        dev_tsprt.send_frame(&frame).await.unwrap();

        match ctl_rx.recv().await.unwrap() {
            TransportEvent::Frame(got) => assert_eq!(got, frame),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_link_down_on_reset() {
        let (device, controller) = linked_pair().await;
        let ctl_chan = controller.open_channel(42).await.unwrap();
        let (_tsprt, mut rx) = MuxTransport::new(controller, ctl_chan);

        device.close().await.unwrap();
        loop {
            match rx.recv().await.unwrap() {
                TransportEvent::LinkDown => break,
                TransportEvent::Frame(_) => continue,
            }
        }
    }
}
