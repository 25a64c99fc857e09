//! Net backend
//!
//! Brings up the UDP command transport to a device on the local network.
//! The dialogue is a single JSON object each way over a short-lived TCP
//! stream:
//!
//! 1. bind the UDP receive socket (ephemeral port if unset)
//! 2. connect to the device's advertised address and port
//! 3. send `{controller_name, controller_type, d2c_port, device_id,
//!    qos_mode, proto_v_min, proto_v_max}` plus the stream ports when
//!    streaming is supported
//! 4. read back `{status, c2d_port, proto_v, qos_mode, ...}` and close
//!
//! A non-zero `status`, or a selected protocol version outside our range,
//! rejects the connection before any command frame is exchanged.

use super::{
    Backend, BackendCapabilities, BackendType, ConnState, ConnectionRequest, DeviceAddr,
    DeviceConnection,
};
use crate::transport::NetTransport;
use crate::{Result, SdkError};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default client-side stream ports advertised when streaming is enabled
const STREAM_CLIENT_STREAM_PORT: u16 = 55004;
const STREAM_CLIENT_CONTROL_PORT: u16 = 55005;

/// Backend for devices reached over the local network
pub struct NetBackend {
    name: String,
    caps: BackendCapabilities,
    /// Local UDP port to receive on; 0 picks an ephemeral port
    d2c_port: u16,
}

impl NetBackend {
    pub fn new(name: impl Into<String>, caps: BackendCapabilities) -> Self {
        Self {
            name: name.into(),
            caps,
            d2c_port: 0,
        }
    }

    /// Request a fixed UDP receive port instead of an ephemeral one
    pub fn with_d2c_port(mut self, port: u16) -> Self {
        self.d2c_port = port;
        self
    }

    fn build_request(&self, req: &ConnectionRequest, d2c_port: u16) -> Value {
        // Caller-provided opaque fields first, known keys overlaid.
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
        obj.insert("d2c_port".into(), Value::from(d2c_port));
        if !req.device_id.is_empty() {
            obj.insert("device_id".into(), Value::from(req.device_id.clone()));
        }
        obj.insert(
            "qos_mode".into(),
            Value::from(if self.caps.qos_mode_supported { 1 } else { 0 }),
        );
        if self.caps.stream_supported {
            obj.insert(
                "arstream2_client_stream_port".into(),
                Value::from(STREAM_CLIENT_STREAM_PORT),
            );
            obj.insert(
                "arstream2_client_control_port".into(),
                Value::from(STREAM_CLIENT_CONTROL_PORT),
            );
        }
        obj.insert("proto_v_min".into(), Value::from(self.caps.proto_v_min));
        obj.insert("proto_v_max".into(), Value::from(self.caps.proto_v_max));
        root
    }
}

fn json_int(root: &Value, key: &str) -> Option<i64> {
    root.get(key).and_then(Value::as_i64)
}

#[async_trait]
impl Backend for NetBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Net
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.caps
    }

    async fn start_device_conn(
        &self,
        device: &DeviceAddr,
        req: &ConnectionRequest,
    ) -> Result<DeviceConnection> {
        let mut conn_state = ConnState::Idle;
        debug!("backend '{}': conn state {:?}", self.name, conn_state);

        // The receive socket must exist before the handshake so its port can
        // be advertised.
        let (transport, transport_events) = NetTransport::bind(self.d2c_port).await?;
        let d2c_port = transport.rx_port()?;

        conn_state = ConnState::ConnectingJson;
        debug!(
            "backend '{}': conn state {:?}, dialing {}:{}",
            self.name, conn_state, device.addr, device.port
        );
        let mut stream = TcpStream::connect((device.addr.as_str(), device.port))
            .await
            .map_err(|e| SdkError::from_io_error(e, "connecting handshake socket"))?;

        let tx_json = self.build_request(req, d2c_port);
        let tx_bytes = serde_json::to_vec(&tx_json)?;
        stream
            .write_all(&tx_bytes)
            .await
            .map_err(|e| SdkError::from_io_error(e, "sending handshake"))?;
        conn_state = ConnState::JsonSent;
        debug!(
            "backend '{}': conn state {:?}, sent {}",
            self.name, conn_state, tx_json
        );

        // Read until one complete JSON object parses or the peer closes.
        let mut rx_bytes = Vec::new();
        let rx_json: Value = loop {
            let mut buf = [0u8; 4096];
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| SdkError::from_io_error(e, "reading handshake response"))?;
            if n == 0 {
                if rx_bytes.is_empty() {
                    return Err(SdkError::io_failed(-1, "handshake closed without response"));
                }
                break serde_json::from_slice(&rx_bytes)?;
            }
            rx_bytes.extend_from_slice(&buf[..n]);
            // NUL terminators from embedded senders are tolerated.
            let trimmed: Vec<u8> = rx_bytes
                .iter()
                .copied()
                .filter(|&b| b != 0)
                .collect();
            if let Ok(value) = serde_json::from_slice::<Value>(&trimmed) {
                break value;
            }
        };
        drop(stream);
        conn_state = ConnState::JsonReceived;
        debug!(
            "backend '{}': conn state {:?}, received {}",
            self.name, conn_state, rx_json
        );

        let status = json_int(&rx_json, "status").unwrap_or(0) as i32;
        if status != 0 {
            warn!("backend '{}': peer refused connection ({})", self.name, status);
            return Err(SdkError::Rejected(status));
        }

        let proto_v = json_int(&rx_json, "proto_v").unwrap_or(1) as u32;
        if proto_v < self.caps.proto_v_min || proto_v > self.caps.proto_v_max {
            warn!(
                "backend '{}': protocol version {} outside [{}, {}]",
                self.name, proto_v, self.caps.proto_v_min, self.caps.proto_v_max
            );
            return Err(SdkError::Rejected(-1));
        }

        let c2d_port = json_int(&rx_json, "c2d_port")
            .filter(|&p| p > 0 && p <= u16::MAX as i64)
            .ok_or_else(|| SdkError::invalid_argument("handshake response lacks c2d_port"))?
            as u16;
        let qos_mode = json_int(&rx_json, "qos_mode").unwrap_or(0).max(0) as i32;

        let peer = format!("{}:{}", device.addr, c2d_port)
            .parse()
            .map_err(|_| SdkError::invalid_argument("bad device address"))?;
        transport.start(peer).await?;

        conn_state = ConnState::Connected;
        info!(
            "backend '{}': conn state {:?}, proto_v={} c2d_port={} qos={}",
            self.name, conn_state, proto_v, c2d_port, qos_mode
        );

        Ok(DeviceConnection {
            transport,
            transport_events: Some(transport_events),
            proto_v,
            qos_mode,
            c2d_port,
            peer_json: rx_json,
        })
    }

    async fn stop_device_conn(&self, conn: &DeviceConnection) -> Result<()> {
        conn.transport.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_device(response: Value) -> (std::net::SocketAddr, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
            let bytes = serde_json::to_vec(&response).unwrap();
            stream.write_all(&bytes).await.unwrap();
            request
        });
        (addr, handle)
    }

    fn request() -> ConnectionRequest {
        ConnectionRequest {
            controller_name: "skylink-tests".to_string(),
            controller_type: "desktop".to_string(),
            device_id: String::new(),
            json: None,
        }
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let (addr, device) = spawn_device(json!({
            "status": 0,
            "c2d_port": 12345,
            "proto_v": 2,
            "qos_mode": 0,
        }))
        .await;

        let backend = NetBackend::new("net", BackendCapabilities::default());
        let device_addr = DeviceAddr {
            addr: addr.ip().to_string(),
            port: addr.port(),
            device_id: String::new(),
        };
        let conn = backend
            .start_device_conn(&device_addr, &request())
            .await
            .unwrap();
        assert_eq!(conn.proto_v, 2);
        assert_eq!(conn.c2d_port, 12345);
        assert_eq!(conn.qos_mode, 0);

        let seen = device.await.unwrap();
        assert_eq!(seen["controller_name"], "skylink-tests");
        assert_eq!(
            seen["proto_v_min"].as_u64(),
            Some(crate::backend::PROTO_V_MIN as u64)
        );
        assert!(seen["d2c_port"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_handshake_rejected_status() {
        let (addr, _device) = spawn_device(json!({
            "status": 3,
            "c2d_port": 12345,
        }))
        .await;

        let backend = NetBackend::new("net", BackendCapabilities::default());
        let device_addr = DeviceAddr {
            addr: addr.ip().to_string(),
            port: addr.port(),
            device_id: String::new(),
        };
        assert!(matches!(
            backend.start_device_conn(&device_addr, &request()).await,
            Err(SdkError::Rejected(3))
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejected_proto_version() {
        let (addr, _device) = spawn_device(json!({
            "status": 0,
            "c2d_port": 12345,
            "proto_v": 9,
        }))
        .await;

        let backend = NetBackend::new("net", BackendCapabilities::default());
        let device_addr = DeviceAddr {
            addr: addr.ip().to_string(),
            port: addr.port(),
            device_id: String::new(),
        };
        assert!(matches!(
            backend.start_device_conn(&device_addr, &request()).await,
            Err(SdkError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_ports_only_when_supported() {
        let (addr, device) = spawn_device(json!({"status": 0, "c2d_port": 1})).await;
        let caps = BackendCapabilities {
            stream_supported: true,
            ..Default::default()
        };
        let backend = NetBackend::new("net", caps);
        let device_addr = DeviceAddr {
            addr: addr.ip().to_string(),
            port: addr.port(),
            device_id: String::new(),
        };
        backend
            .start_device_conn(&device_addr, &request())
            .await
            .unwrap();
        let seen = device.await.unwrap();
        assert!(seen.get("arstream2_client_stream_port").is_some());
    }
}
