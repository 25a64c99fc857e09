//! Mux discovery
//!
//! Discovery over the tethered link's discovery control channel. The
//! controller sends a discover request; the peer answers with device
//! added/removed messages carrying a small JSON body. A channel reset
//! reopens the channel and retries discovery.

use super::{DiscoveredDevice, Discovery};
use crate::device::ApiCapability;
use crate::mux::{MuxContext, MuxEvent, MuxMsg, CHANNEL_DISCOVERY};
use crate::Result;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ask the peer to start reporting devices
pub const MSG_DISCOVER: u32 = 1;
/// Peer reports a device as present
pub const MSG_DEVICE_ADDED: u32 = 2;
/// Peer reports a device as gone
pub const MSG_DEVICE_REMOVED: u32 = 3;

/// Delay before reopening the channel after a reset
const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// Discovery over a mux link
pub struct MuxDiscovery {
    core: Discovery,
    ctx: Arc<MuxContext>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MuxDiscovery {
    pub fn new(core: Discovery, ctx: Arc<MuxContext>) -> Arc<Self> {
        Arc::new(Self {
            core,
            ctx,
            task: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Discovery {
        &self.core
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.core.start().await?;
        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = this.run_channel().await {
                    debug!("discovery '{}': channel ended: {}", this.core.name(), e);
                }
                // Reset recovery: reopen and rediscover.
                tokio::time::sleep(REOPEN_DELAY).await;
                info!("discovery '{}': retrying discovery channel", this.core.name());
            }
        });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.ctx.close_channel(CHANNEL_DISCOVERY).await.ok();
        self.core.stop().await
    }

    async fn run_channel(&self) -> Result<()> {
        let mut channel = self.ctx.open_channel(CHANNEL_DISCOVERY).await?;
        let discover = MuxMsg::new(MSG_DISCOVER, Bytes::new());
        self.ctx.send(CHANNEL_DISCOVERY, &discover.to_bytes()).await?;

        loop {
            match channel.recv().await {
                Some(MuxEvent::Data(data)) => {
                    let msg = match MuxMsg::from_bytes(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("discovery '{}': bad message: {}", self.core.name(), e);
                            continue;
                        }
                    };
                    self.handle_msg(msg).await;
                }
                Some(MuxEvent::Reset) | None => {
                    self.ctx.close_channel(CHANNEL_DISCOVERY).await.ok();
                    return Ok(());
                }
            }
        }
    }

    async fn handle_msg(&self, msg: MuxMsg) {
        match msg.msg_id {
            MSG_DEVICE_ADDED | MSG_DEVICE_REMOVED => {
                let report = match parse_device_msg(&msg.payload) {
                    Ok(report) => report,
                    Err(e) => {
                        warn!("discovery '{}': bad device body: {}", self.core.name(), e);
                        return;
                    }
                };
                let result = if msg.msg_id == MSG_DEVICE_ADDED {
                    self.core.add_device(report).await
                } else {
                    self.core.remove_device(&report).await
                };
                if let Err(e) = result {
                    debug!("discovery '{}': {}", self.core.name(), e);
                }
            }
            other => debug!(
                "discovery '{}': ignoring message {}",
                self.core.name(),
                other
            ),
        }
    }
}

fn parse_device_msg(payload: &[u8]) -> Result<DiscoveredDevice> {
    let json: Value = serde_json::from_slice(payload)?;
    let device_type = json
        .get("device_type")
        .and_then(Value::as_u64)
        .unwrap_or_default() as u16;
    let name = json
        .get("device_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = json
        .get("device_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let port = json.get("device_port").and_then(Value::as_u64).unwrap_or(0) as u16;
    Ok(DiscoveredDevice {
        name,
        device_type,
        addr: String::new(),
        port,
        id,
        api: ApiCapability::Full,
        raw_json: Some(json),
    })
}
