//! Channel-multiplexed byte stream
//!
//! A [`MuxContext`] carries several independent channels over one tethered
//! TCP link. Each mux packet is `{channel u32 LE, op u8, length u32 LE}`
//! followed by `length` payload bytes. Channels are identified by small
//! integers; the low ids are reserved for SDK control traffic and data
//! channels are allocated dynamically above [`CHANNEL_DYNAMIC_BASE`].
//!
//! The context is shared (`Arc`) between every consumer: the backend, the
//! discovery, the per-device data transport and the update/blackbox
//! sub-services all hold a clone and open their own channels.

use crate::{Result, SdkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Discovery control channel
pub const CHANNEL_DISCOVERY: u32 = 1;
/// Backend control channel (connection handshake)
pub const CHANNEL_BACKEND: u32 = 2;
/// Firmware update channel
pub const CHANNEL_UPDATE: u32 = 3;
/// Blackbox telemetry channel
pub const CHANNEL_BLACKBOX: u32 = 4;
/// First dynamically allocated channel id
pub const CHANNEL_DYNAMIC_BASE: u32 = 16;

const OP_DATA: u8 = 0;
const OP_OPEN: u8 = 1;
const OP_RESET: u8 = 2;

const MUX_HEADER_SIZE: usize = 9;

/// Event delivered to a channel consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// One mux packet worth of payload
    Data(Bytes),
    /// Peer or link reset the channel; the consumer must reopen
    Reset,
}

/// Receiving side of an open channel
pub struct MuxChannel {
    /// Channel id this receiver is routed from
    pub id: u32,
    rx: mpsc::UnboundedReceiver<MuxEvent>,
}

impl MuxChannel {
    pub async fn recv(&mut self) -> Option<MuxEvent> {
        self.rx.recv().await
    }
}

struct MuxShared {
    routes: HashMap<u32, mpsc::UnboundedSender<MuxEvent>>,
    next_dynamic: u32,
}

/// Shared mux context over one TCP link
pub struct MuxContext {
    writer: Mutex<OwnedWriteHalf>,
    shared: Mutex<MuxShared>,
}

impl MuxContext {
    /// Adopt a connected stream and start the demultiplexer task
    pub fn new(stream: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let ctx = Arc::new(Self {
            writer: Mutex::new(write_half),
            shared: Mutex::new(MuxShared {
                routes: HashMap::new(),
                next_dynamic: CHANNEL_DYNAMIC_BASE,
            }),
        });
        tokio::spawn(Self::rx_loop(ctx.clone(), read_half));
        ctx
    }

    /// Connect to a mux bridge and adopt the stream
    pub async fn connect(addr: &str, port: u16) -> Result<Arc<Self>> {
        let stream = TcpStream::connect((addr, port))
            .await
            .map_err(|e| SdkError::from_io_error(e, "connecting mux bridge"))?;
        info!("mux: connected to bridge {}:{}", addr, port);
        Ok(Self::new(stream))
    }

    async fn rx_loop(ctx: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut header = [0u8; MUX_HEADER_SIZE];
        loop {
            if let Err(e) = read_half.read_exact(&mut header).await {
                debug!("mux: link closed: {}", e);
                break;
            }
            let mut hdr = &header[..];
            let channel = hdr.get_u32_le();
            let op = hdr.get_u8();
            let len = hdr.get_u32_le() as usize;
            let mut payload = vec![0u8; len];
            if let Err(e) = read_half.read_exact(&mut payload).await {
                debug!("mux: link closed mid-packet: {}", e);
                break;
            }

            let shared = ctx.shared.lock().await;
            let event = match op {
                OP_DATA => MuxEvent::Data(Bytes::from(payload)),
                OP_RESET => MuxEvent::Reset,
                OP_OPEN => continue,
                other => {
                    warn!("mux: unknown op {} on channel {}", other, channel);
                    continue;
                }
            };
            if let Some(tx) = shared.routes.get(&channel) {
                let _ = tx.send(event);
            } else {
                debug!("mux: drop packet for closed channel {}", channel);
            }
        }

        // Link is gone; every open channel sees a reset.
        let shared = ctx.shared.lock().await;
        for tx in shared.routes.values() {
            let _ = tx.send(MuxEvent::Reset);
        }
    }

    /// Open a channel with a fixed (reserved) id
    pub async fn open_channel(self: &Arc<Self>, id: u32) -> Result<MuxChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.shared.lock().await;
            if shared.routes.contains_key(&id) {
                return Err(SdkError::Busy(format!("mux channel {id} already open")));
            }
            shared.routes.insert(id, tx);
        }
        self.write_packet(id, OP_OPEN, &[]).await?;
        Ok(MuxChannel { id, rx })
    }

    /// Open a dynamically numbered data channel
    pub async fn open_dynamic_channel(self: &Arc<Self>) -> Result<MuxChannel> {
        let id = {
            let mut shared = self.shared.lock().await;
            let id = shared.next_dynamic;
            shared.next_dynamic += 1;
            id
        };
        self.open_channel(id).await
    }

    /// Close a channel locally and notify the peer
    pub async fn close_channel(&self, id: u32) -> Result<()> {
        self.shared.lock().await.routes.remove(&id);
        self.write_packet(id, OP_RESET, &[]).await
    }

    /// Send payload on an open channel
    pub async fn send(&self, channel: u32, payload: &[u8]) -> Result<()> {
        self.write_packet(channel, OP_DATA, payload).await
    }

    /// Shut down the link; the peer sees a reset on every open channel
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| SdkError::from_io_error(e, "closing mux link"))?;
        Ok(())
    }

    async fn write_packet(&self, channel: u32, op: u8, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(MUX_HEADER_SIZE + payload.len());
        buf.put_u32_le(channel);
        buf.put_u8(op);
        buf.put_u32_le(payload.len() as u32);
        buf.extend_from_slice(payload);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .map_err(|e| SdkError::from_io_error(e, "writing mux packet"))?;
        Ok(())
    }

    /// Create a TCP proxy to `host:port` on the remote side of the link
    ///
    /// Returns a proxy listening on a loopback port; each accepted local
    /// connection is piped through a dynamic mux channel whose open payload
    /// names the requested destination.
    pub async fn tcp_proxy(self: &Arc<Self>, host: &str, port: u16) -> Result<MuxTcpProxy> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| SdkError::from_io_error(e, "binding proxy listener"))?;
        let local_port = listener
            .local_addr()
            .map_err(SdkError::Io)?
            .port();
        info!(
            "mux: tcp proxy to {}:{} listening on 127.0.0.1:{}",
            host, port, local_port
        );

        let ctx = self.clone();
        let destination = format!("{host}:{port}");
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("mux proxy: accept failed: {}", e);
                        break;
                    }
                };
                debug!("mux proxy: local connection from {}", peer);
                let ctx = ctx.clone();
                let destination = destination.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::run_proxy_conn(ctx, stream, &destination).await {
                        debug!("mux proxy: connection ended: {}", e);
                    }
                });
            }
        });

        Ok(MuxTcpProxy {
            addr: "127.0.0.1".to_string(),
            port: local_port,
        })
    }

    async fn run_proxy_conn(
        ctx: Arc<Self>,
        stream: TcpStream,
        destination: &str,
    ) -> Result<()> {
        let mut channel = ctx.open_dynamic_channel().await?;
        ctx.send(channel.id, destination.as_bytes()).await?;

        let (mut tcp_rx, mut tcp_tx) = stream.into_split();
        let chan_id = channel.id;
        let ctx_up = ctx.clone();
        let uplink = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match tcp_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if ctx_up.send(chan_id, &buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        while let Some(event) = channel.recv().await {
            match event {
                MuxEvent::Data(data) => {
                    if tcp_tx.write_all(&data).await.is_err() {
                        break;
                    }
                }
                MuxEvent::Reset => break,
            }
        }
        uplink.abort();
        ctx.close_channel(chan_id).await.ok();
        Ok(())
    }
}

/// A loopback endpoint proxying to a host behind the mux link
#[derive(Debug, Clone)]
pub struct MuxTcpProxy {
    /// Loopback address to connect to
    pub addr: String,

    /// Allocated local port
    pub port: u16,
}

/// Message framing used on control-style channels
///
/// Update and blackbox channels exchange small messages `{msg_id u32 LE}` +
/// payload inside mux packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxMsg {
    /// Channel-specific message id
    pub msg_id: u32,

    /// Message body; layout is defined per channel
    pub payload: Bytes,
}

impl MuxMsg {
    pub fn new(msg_id: u32, payload: Bytes) -> Self {
        Self { msg_id, payload }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u32_le(self.msg_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(SdkError::invalid_argument("mux message too short"));
        }
        let mut buf = data;
        let msg_id = buf.get_u32_le();
        Ok(Self {
            msg_id,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
