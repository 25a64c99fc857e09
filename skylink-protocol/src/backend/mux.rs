//! Mux backend
//!
//! For devices behind a tethered, channel-multiplexed link. The connection
//! handshake carries the same fields as the net JSON dialogue, but travels
//! as a request/response message pair on the backend control channel. The
//! command transport is then a dynamically assigned mux data channel named
//! by the device in its response.

use super::{
    Backend, BackendCapabilities, BackendType, ConnectionRequest, DeviceAddr, DeviceConnection,
};
use crate::mux::{MuxContext, MuxEvent, MuxMsg, CHANNEL_BACKEND};
use crate::transport::MuxTransport;
use crate::{Result, SdkError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection request message on the backend channel
pub const MSG_CONN_REQ: u32 = 1;
/// Connection response message on the backend channel
pub const MSG_CONN_RESP: u32 = 2;

/// Backend for devices behind a mux link
pub struct MuxBackend {
    name: String,
    caps: BackendCapabilities,
    ctx: Arc<MuxContext>,
}

impl MuxBackend {
    pub fn new(name: impl Into<String>, caps: BackendCapabilities, ctx: Arc<MuxContext>) -> Self {
        Self {
            name: name.into(),
            caps,
            ctx,
        }
    }

    /// The shared mux context this backend rides on
    pub fn mux(&self) -> Arc<MuxContext> {
        self.ctx.clone()
    }

    fn build_request(&self, req: &ConnectionRequest, device: &DeviceAddr) -> Value {
        let mut root = match &req.json {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        };
        let obj = root.as_object_mut().expect("handshake root is an object");
        obj.insert(
            "controller_name".into(),
            Value::from(req.controller_name.clone()),
        );
        obj.insert(
            "controller_type".into(),
            Value::from(req.controller_type.clone()),
        );
        let device_id = if req.device_id.is_empty() {
            device.device_id.clone()
        } else {
            req.device_id.clone()
        };
        if !device_id.is_empty() {
            obj.insert("device_id".into(), Value::from(device_id));
        }
        obj.insert("proto_v_min".into(), Value::from(self.caps.proto_v_min));
        obj.insert("proto_v_max".into(), Value::from(self.caps.proto_v_max));
        root
    }
}

#[async_trait]
impl Backend for MuxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Mux
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.caps
    }

    async fn start_device_conn(
        &self,
        device: &DeviceAddr,
        req: &ConnectionRequest,
    ) -> Result<DeviceConnection> {
        let mut control = self.ctx.open_channel(CHANNEL_BACKEND).await?;

        let tx_json = self.build_request(req, device);
        let msg = MuxMsg::new(MSG_CONN_REQ, Bytes::from(serde_json::to_vec(&tx_json)?));
        self.ctx.send(CHANNEL_BACKEND, &msg.to_bytes()).await?;
        debug!("backend '{}': sent connection request {}", self.name, tx_json);

        // Exactly one response terminates the dialogue.
        let response = loop {
            match control.recv().await {
                Some(MuxEvent::Data(data)) => {
                    let msg = MuxMsg::from_bytes(&data)?;
                    if msg.msg_id != MSG_CONN_RESP {
                        debug!(
                            "backend '{}': ignoring message {} while connecting",
                            self.name, msg.msg_id
                        );
                        continue;
                    }
                    break serde_json::from_slice::<Value>(&msg.payload)?;
                }
                Some(MuxEvent::Reset) | None => {
                    self.ctx.close_channel(CHANNEL_BACKEND).await.ok();
                    warn!("backend '{}': control channel reset while connecting", self.name);
                    return Err(SdkError::Canceled);
                }
            }
        };
        self.ctx.close_channel(CHANNEL_BACKEND).await.ok();
        debug!("backend '{}': received {}", self.name, response);

        let status = response.get("status").and_then(Value::as_i64).unwrap_or(0) as i32;
        if status != 0 {
            warn!("backend '{}': peer refused connection ({})", self.name, status);
            return Err(SdkError::Rejected(status));
        }

        let proto_v = response.get("proto_v").and_then(Value::as_i64).unwrap_or(1) as u32;
        if proto_v < self.caps.proto_v_min || proto_v > self.caps.proto_v_max {
            return Err(SdkError::Rejected(-1));
        }

        let channel_id = response
            .get("channel_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| SdkError::invalid_argument("response lacks channel_id"))?
            as u32;
        let data_channel = self.ctx.open_channel(channel_id).await?;
        let (transport, transport_events) = MuxTransport::new(self.ctx.clone(), data_channel);

        info!(
            "backend '{}': connected over channel {} (proto_v={})",
            self.name, channel_id, proto_v
        );
        Ok(DeviceConnection {
            transport,
            transport_events: Some(transport_events),
            proto_v,
            qos_mode: 0,
            c2d_port: 0,
            peer_json: response,
        })
    }

    async fn stop_device_conn(&self, conn: &DeviceConnection) -> Result<()> {
        conn.transport.stop().await;
        Ok(())
    }

    fn mux_context(&self) -> Option<Arc<MuxContext>> {
        Some(self.ctx.clone())
    }
}
