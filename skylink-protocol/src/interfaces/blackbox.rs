//! Blackbox telemetry
//!
//! Listens on the blackbox channel of a mux link and fans the decoded
//! notifications out to registered listeners: remote-control button actions
//! and piloting stick positions.

use crate::mux::{MuxContext, MuxEvent, MuxMsg, CHANNEL_BLACKBOX};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Remote-control button action notification
pub const MSG_BUTTON_ACTION: u32 = 1;
/// Remote-control piloting info notification
pub const MSG_PILOTING_INFO: u32 = 2;

/// Stick positions reported by the remote control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcPilotingInfo {
    /// Pitch stick position, -100..=100
    pub pitch: i8,

    /// Roll stick position, -100..=100
    pub roll: i8,

    /// Yaw stick position, -100..=100
    pub yaw: i8,

    /// Throttle stick position, -100..=100
    pub gaz: i8,

    /// Which pilot source generated the inputs
    pub source: u8,
}

/// Decoded blackbox notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlackboxEvent {
    RcButtonAction(u32),
    RcPilotingInfo(RcPilotingInfo),
}

/// Listener registration id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlackboxListenerId(u64);

struct BlackboxInner {
    listeners: Mutex<HashMap<BlackboxListenerId, mpsc::UnboundedSender<BlackboxEvent>>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<MuxContext>,
}

/// Blackbox telemetry interface over a mux link
#[derive(Clone)]
pub struct BlackboxItf {
    inner: Arc<BlackboxInner>,
}

impl BlackboxItf {
    /// Open the blackbox channel and start decoding
    pub async fn start(ctx: Arc<MuxContext>) -> Result<Self> {
        let mut channel = ctx.open_channel(CHANNEL_BLACKBOX).await?;
        let itf = Self {
            inner: Arc::new(BlackboxInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                task: Mutex::new(None),
                ctx,
            }),
        };

        let inner = itf.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Some(MuxEvent::Data(data)) => {
                        let msg = match MuxMsg::from_bytes(&data) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("blackbox: bad message: {}", e);
                                continue;
                            }
                        };
                        if let Some(event) = decode_event(&msg) {
                            let listeners = inner.listeners.lock().await;
                            for tx in listeners.values() {
                                let _ = tx.send(event);
                            }
                        }
                    }
                    Some(MuxEvent::Reset) | None => {
                        debug!("blackbox: channel closed");
                        break;
                    }
                }
            }
        });
        *itf.inner.task.lock().await = Some(task);
        Ok(itf)
    }

    /// Register a listener; events arrive on the returned receiver
    pub async fn register(
        &self,
    ) -> (BlackboxListenerId, mpsc::UnboundedReceiver<BlackboxEvent>) {
        let id = BlackboxListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().await.insert(id, tx);
        (id, rx)
    }

    /// Remove a listener; removing one twice is a no-op
    pub async fn unregister(&self, id: BlackboxListenerId) {
        self.inner.listeners.lock().await.remove(&id);
    }

    /// Stop decoding and close the channel
    pub async fn stop(&self) -> Result<()> {
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        self.inner.ctx.close_channel(CHANNEL_BLACKBOX).await?;
        self.inner.listeners.lock().await.clear();
        Ok(())
    }
}

/// Decode one channel message into an event
fn decode_event(msg: &MuxMsg) -> Option<BlackboxEvent> {
    match msg.msg_id {
        MSG_BUTTON_ACTION => {
            if msg.payload.len() < 4 {
                warn!("blackbox: short button action");
                return None;
            }
            let action = u32::from_le_bytes(msg.payload[..4].try_into().ok()?);
            Some(BlackboxEvent::RcButtonAction(action))
        }
        MSG_PILOTING_INFO => {
            if msg.payload.len() < 5 {
                warn!("blackbox: short piloting info");
                return None;
            }
            Some(BlackboxEvent::RcPilotingInfo(RcPilotingInfo {
                source: msg.payload[0],
                roll: msg.payload[1] as i8,
                pitch: msg.payload[2] as i8,
                yaw: msg.payload[3] as i8,
                gaz: msg.payload[4] as i8,
            }))
        }
        other => {
            debug!("blackbox: ignoring message {}", other);
            None
        }
    }
}

impl std::fmt::Display for BlackboxListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
