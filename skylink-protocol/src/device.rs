//! Device model
//!
//! A [`Device`] is one remote endpoint observed on a backend: created by a
//! discovery's add event, connected on request, destroyed by the controller.
//! Cloning a `Device` clones a handle to the same shared state.

use crate::backend::{Backend, BackendType, ConnectionRequest, DeviceAddr, DeviceConnection};
use crate::cmd_itf::{CmdItfConfig, CmdItfEvent, CommandInterface};
use crate::logger::CommandLogger;
use crate::{Result, SdkError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

/// Port offset applied when proxying to a secondary device type over net
pub const PROXY_PORT_OFFSET: u16 = 100;

/// High byte tagging the remote-controller product family
pub const CONTROLLER_TYPE_PAGE: u16 = 0x0c00;

/// Whether a device-type code belongs to the remote-controller family
pub fn device_type_is_controller(device_type: u16) -> bool {
    (device_type & 0xff00) == CONTROLLER_TYPE_PAGE
}

/// Lifecycle state of a device
///
/// Transitions: `Idle` → `Connecting` → `Connected` on
/// [`Device::connect`], back to `Idle` on [`Device::disconnect`] or a
/// failed handshake, and to `Removing` once the controller has scheduled
/// the device for destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Known but not connected
    Idle,

    /// Handshake in progress
    Connecting,

    /// Command transport established
    Connected,

    /// Destruction pending; no further operation is accepted
    Removing,
}

/// API surface a device exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiCapability {
    /// Discovery did not report the capability
    #[default]
    Unknown,

    /// Full command and request API
    Full,

    /// Device is only reachable for firmware update
    UpdateOnly,
}

/// Identity of a discovered device
///
/// Filled from the discovery report that produced the device; the address
/// and port are where the connection handshake must be directed.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    /// Human-readable device name, e.g. `ANAFI-0000000`
    pub name: String,

    /// 16-bit product family tag
    pub device_type: u16,

    /// Network address the device was discovered at
    pub addr: String,

    /// TCP port answering the connection handshake
    pub port: u16,

    /// Opaque id string; may be empty
    pub id: String,

    /// API surface the device advertises
    pub api: ApiCapability,
}

/// Endpoint of a TCP proxy towards the device
///
/// Over net this names the device itself; over mux it names a loopback
/// listener piping through the tethered link.
#[derive(Debug, Clone)]
pub struct TcpProxy {
    /// Address to connect to
    pub addr: String,

    /// Port to connect to
    pub port: u16,
}

/// Shared state behind every [`Device`] clone
pub(crate) struct DeviceInner {
    /// Nonzero controller-unique handle
    handle: u16,

    /// Backend that connects this device
    backend: Arc<dyn Backend>,

    /// Discovery-reported identity
    info: RwLock<DeviceInfo>,

    /// Raw discovery payload, kept verbatim for fields the SDK ignores
    raw_json: RwLock<Option<Value>>,

    /// Name of the discovery that reported the device, if any
    discovery: RwLock<Option<String>>,

    /// Discovery run the device was last reported in
    discovery_runid: AtomicU32,

    /// When the discovery last saw the device; drives quiescence aging
    last_seen: Mutex<Instant>,

    state: RwLock<DeviceState>,

    /// Set once the controller has requested teardown
    deleted: AtomicBool,

    /// Protocol version negotiated on the current connection, 0 before any
    proto_v: AtomicU32,

    /// Established connection, while connected
    conn: Mutex<Option<DeviceConnection>>,

    /// Command interface, once created by the caller
    cmd_itf: Mutex<Option<Arc<CommandInterface>>>,
}

/// Handle to one remote device
///
/// # Examples
///
/// ```rust,ignore
/// use skylink_protocol::ConnectionRequest;
///
/// let request = ConnectionRequest {
///     controller_name: "my-app".to_string(),
///     controller_type: "desktop".to_string(),
///     ..Default::default()
/// };
/// device.connect(&request).await?;
/// let (cmd_itf, mut events) = device.create_cmd_itf(None).await?;
/// ```
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn new(
        handle: u16,
        backend: Arc<dyn Backend>,
        info: DeviceInfo,
        discovery: Option<String>,
        runid: u32,
        raw_json: Option<Value>,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                handle,
                backend,
                info: RwLock::new(info),
                raw_json: RwLock::new(raw_json),
                discovery: RwLock::new(discovery),
                discovery_runid: AtomicU32::new(runid),
                last_seen: Mutex::new(Instant::now()),
                state: RwLock::new(DeviceState::Idle),
                deleted: AtomicBool::new(false),
                proto_v: AtomicU32::new(0),
                conn: Mutex::new(None),
                cmd_itf: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> u16 {
        self.inner.handle
    }

    pub fn backend_type(&self) -> BackendType {
        self.inner.backend.backend_type()
    }

    pub async fn info(&self) -> DeviceInfo {
        self.inner.info.read().await.clone()
    }

    pub async fn state(&self) -> DeviceState {
        *self.inner.state.read().await
    }

    /// Protocol version negotiated on the current connection; 0 before any
    pub fn proto_v(&self) -> u32 {
        self.inner.proto_v.load(Ordering::SeqCst)
    }

    /// Last discovery JSON blob the device was reported with
    pub async fn raw_json(&self) -> Option<Value> {
        self.inner.raw_json.read().await.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    pub(crate) async fn discovery_name(&self) -> Option<String> {
        self.inner.discovery.read().await.clone()
    }

    pub(crate) async fn clear_discovery(&self) {
        *self.inner.discovery.write().await = None;
    }

    pub(crate) fn discovery_runid(&self) -> u32 {
        self.inner.discovery_runid.load(Ordering::SeqCst)
    }

    pub(crate) async fn refresh_discovery(&self, runid: u32, raw_json: Option<Value>) {
        self.inner.discovery_runid.store(runid, Ordering::SeqCst);
        *self.inner.last_seen.lock().await = Instant::now();
        if raw_json.is_some() {
            *self.inner.raw_json.write().await = raw_json;
        }
    }

    pub(crate) async fn last_seen(&self) -> Instant {
        *self.inner.last_seen.lock().await
    }

    pub(crate) fn backend(&self) -> Arc<dyn Backend> {
        self.inner.backend.clone()
    }

    /// Connect the device through its backend
    ///
    /// The handshake must complete before a command interface can be
    /// created. A second connect while connecting or connected is `Busy`.
    pub async fn connect(&self, req: &ConnectionRequest) -> Result<()> {
        if self.is_deleted() {
            return Err(SdkError::not_permitted("device is being removed"));
        }
        {
            let mut state = self.inner.state.write().await;
            match *state {
                DeviceState::Idle => *state = DeviceState::Connecting,
                DeviceState::Connecting | DeviceState::Connected => {
                    return Err(SdkError::Busy("device already connecting".to_string()))
                }
                DeviceState::Removing => {
                    return Err(SdkError::not_permitted("device is being removed"))
                }
            }
        }

        let info = self.info().await;
        let device_addr = DeviceAddr {
            addr: info.addr.clone(),
            port: info.port,
            device_id: info.id.clone(),
        };
        info!(
            "device {:#06x} '{}': connecting via backend '{}'",
            self.inner.handle,
            info.name,
            self.inner.backend.name()
        );

        match self.inner.backend.start_device_conn(&device_addr, req).await {
            Ok(conn) => {
                let committed = {
                    let mut state = self.inner.state.write().await;
                    if *state == DeviceState::Connecting {
                        *state = DeviceState::Connected;
                        true
                    } else {
                        false
                    }
                };
                if !committed {
                    // Disconnected or removed while the handshake ran.
                    self.inner.backend.stop_device_conn(&conn).await.ok();
                    return Err(SdkError::Canceled);
                }
                self.inner.proto_v.store(conn.proto_v, Ordering::SeqCst);
                *self.inner.conn.lock().await = Some(conn);
                info!("device {:#06x} '{}': connected", self.inner.handle, info.name);
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.write().await;
                if *state == DeviceState::Connecting {
                    *state = DeviceState::Idle;
                }
                Err(e)
            }
        }
    }

    /// Disconnect and tear down interfaces
    ///
    /// After this returns, no further command callbacks fire for the device.
    /// Disconnecting while the handshake is still running cancels it.
    pub async fn disconnect(&self) -> Result<()> {
        let itf = self.inner.cmd_itf.lock().await.take();
        let conn = self.inner.conn.lock().await.take();
        let state = *self.inner.state.read().await;
        if itf.is_none() && conn.is_none() && state != DeviceState::Connecting {
            return Err(SdkError::not_permitted("device is not connected"));
        }

        if let Some(itf) = itf {
            itf.stop().await;
        }
        if let Some(conn) = conn {
            self.inner.backend.stop_device_conn(&conn).await.ok();
        }
        if !self.is_deleted() {
            *self.inner.state.write().await = DeviceState::Idle;
        }
        debug!("device {:#06x}: disconnected", self.inner.handle);
        Ok(())
    }

    pub(crate) async fn mark_removing(&self) {
        self.inner.deleted.store(true, Ordering::SeqCst);
        *self.inner.state.write().await = DeviceState::Removing;
    }

    /// Queue tuning used for this device's command interface
    fn cmd_itf_config(&self) -> CmdItfConfig {
        // Net tuning also fits the mux link; BLE tuning applies only to a
        // BLE backend, which this SDK does not provide.
        CmdItfConfig::net()
    }

    /// Create the command interface, once, after the device is connected
    pub async fn create_cmd_itf(
        &self,
        logger: Option<Arc<CommandLogger>>,
    ) -> Result<(Arc<CommandInterface>, mpsc::UnboundedReceiver<CmdItfEvent>)> {
        if *self.inner.state.read().await != DeviceState::Connected {
            return Err(SdkError::not_permitted(
                "command interface requires a connected device",
            ));
        }
        if self.info().await.api == ApiCapability::UpdateOnly {
            return Err(SdkError::not_permitted(
                "device only exposes the update api",
            ));
        }
        let mut cmd_itf_slot = self.inner.cmd_itf.lock().await;
        if cmd_itf_slot.is_some() {
            return Err(SdkError::Busy("command interface already created".to_string()));
        }

        let mut conn = self.inner.conn.lock().await;
        let conn = conn
            .as_mut()
            .ok_or_else(|| SdkError::not_permitted("no active connection"))?;
        let transport_events = conn
            .transport_events
            .take()
            .ok_or_else(|| SdkError::Busy("transport already consumed".to_string()))?;

        let (itf, events) = CommandInterface::new(
            conn.transport.clone(),
            transport_events,
            self.cmd_itf_config(),
            logger,
        );
        *cmd_itf_slot = Some(itf.clone());
        Ok((itf, events))
    }

    /// The command interface, if one was created
    pub async fn cmd_itf(&self) -> Option<Arc<CommandInterface>> {
        self.inner.cmd_itf.lock().await.clone()
    }

    /// Expose a TCP endpoint reaching `port` on a device of
    /// `target_device_type`
    ///
    /// Over net this is the device address itself; the port is shifted by
    /// [`PROXY_PORT_OFFSET`] when the target type differs from this device's
    /// own type, unless this device is a remote controller (a controller
    /// forwards secondary devices on their unshifted ports). Over mux an IP
    /// proxy is allocated on the far side of the link.
    pub async fn tcp_proxy(&self, target_device_type: u16, port: u16) -> Result<TcpProxy> {
        let info = self.info().await;
        match self.inner.backend.backend_type() {
            BackendType::Net => {
                let mut port = port;
                if target_device_type != info.device_type
                    && !device_type_is_controller(info.device_type)
                {
                    port += PROXY_PORT_OFFSET;
                }
                Ok(TcpProxy {
                    addr: info.addr,
                    port,
                })
            }
            BackendType::Mux => {
                let mux = self
                    .inner
                    .backend
                    .mux_context()
                    .ok_or_else(|| SdkError::Unsupported("backend has no mux context".into()))?;
                let host = if device_type_is_controller(target_device_type) {
                    "skycontroller"
                } else {
                    "drone"
                };
                let proxy = mux.tcp_proxy(host, port).await?;
                Ok(TcpProxy {
                    addr: proxy.addr,
                    port: proxy.port,
                })
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.inner.handle)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
