//! End-to-end connect over loopback
//!
//! A fake device answers the JSON handshake and acks command frames over
//! UDP, which carries a controller from discovery to an acked command.

use skylink_protocol::command::well_known;
use skylink_protocol::frame::{DataType, Frame};
use skylink_protocol::{
    BackendCapabilities, CmdSendStatus, ConnectionRequest, Controller, ControllerEvent,
    DeviceState, DiscoveredDevice, Discovery, NetBackend, SdkError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// Fake drone: JSON handshake endpoint plus an acking UDP command port
async fn spawn_fake_device() -> u16 {
    let handshake = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let handshake_port = handshake.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = handshake.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 4096];
            let Ok(n) = stream.read(&mut buf).await else {
                continue;
            };
            let request: serde_json::Value = match serde_json::from_slice(&buf[..n]) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let d2c_port = request["d2c_port"].as_u64().unwrap() as u16;

            // Command endpoint: ack every with-ack frame towards d2c_port.
            let udp = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
            let c2d_port = udp.local_addr().unwrap().port();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    let Ok((n, _)) = udp.recv_from(&mut buf).await else {
                        break;
                    };
                    let Ok(frame) = Frame::from_bytes(&buf[..n]) else {
                        continue;
                    };
                    if frame.data_type == DataType::DataWithAck {
                        let ack = Frame::ack(frame.queue_id.wrapping_add(10), 0, frame.seq);
                        let _ = udp
                            .send_to(&ack.to_bytes(), ("127.0.0.1", d2c_port))
                            .await;
                    }
                }
            });

            let response = serde_json::json!({
                "status": 0,
                "c2d_port": c2d_port,
                "proto_v": 1,
                "qos_mode": 0,
            });
            let _ = stream
                .write_all(&serde_json::to_vec(&response).unwrap())
                .await;
        }
    });
    handshake_port
}

#[tokio::test]
async fn test_connect_and_ack_command() {
    let handshake_port = spawn_fake_device().await;

    let (ctrl, mut events) = Controller::new();
    let backend = Arc::new(NetBackend::new("net", BackendCapabilities::default()));
    ctrl.register_backend(backend.clone()).await.unwrap();

    let discovery = Discovery::new("net", backend, ctrl.clone(), Vec::new())
        .await
        .unwrap();
    discovery
        .add_device(DiscoveredDevice {
            name: "fake-anafi".to_string(),
            device_type: 0x0914,
            addr: "127.0.0.1".to_string(),
            port: handshake_port,
            id: "PI000".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let device = match events.recv().await.unwrap() {
        ControllerEvent::DeviceAdded(device) => device,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(device.state().await, DeviceState::Idle);

    let request = ConnectionRequest {
        controller_name: "itest".to_string(),
        controller_type: "desktop".to_string(),
        device_id: String::new(),
        json: None,
    };
    device.connect(&request).await.unwrap();
    assert_eq!(device.state().await, DeviceState::Connected);
    assert_eq!(device.proto_v(), 1);

    // A second connect while connected is refused.
    assert!(matches!(
        device.connect(&request).await,
        Err(SdkError::Busy(_))
    ));

    let (cmd_itf, _itf_events) = device.create_cmd_itf(None).await.unwrap();
    let mut status = cmd_itf.send(well_known::enc_all_settings()).await.unwrap();

    let deadline = tokio::time::timeout(Duration::from_millis(150), async {
        loop {
            let event = status.recv().await.expect("status channel closed");
            if event.done {
                return event;
            }
        }
    })
    .await
    .expect("command was not acked within the ack timeout");
    assert_eq!(deadline.status, CmdSendStatus::AckReceived);
    assert_eq!(deadline.retries_consumed, 0);

    // After disconnect no further commands are accepted.
    device.disconnect().await.unwrap();
    assert_eq!(device.state().await, DeviceState::Idle);
    let itf = device.cmd_itf().await;
    assert!(itf.is_none());
    assert!(cmd_itf.send(well_known::enc_all_settings()).await.is_err());
}

#[tokio::test]
async fn test_command_interface_requires_connect() {
    let (ctrl, mut events) = Controller::new();
    let backend = Arc::new(NetBackend::new("net", BackendCapabilities::default()));
    ctrl.register_backend(backend.clone()).await.unwrap();
    let discovery = Discovery::new("net", backend, ctrl.clone(), Vec::new())
        .await
        .unwrap();
    discovery
        .add_device(DiscoveredDevice {
            name: "fake".to_string(),
            device_type: 0x0914,
            addr: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    let ControllerEvent::DeviceAdded(device) = events.recv().await.unwrap() else {
        panic!("expected added event");
    };
    assert!(matches!(
        device.create_cmd_itf(None).await,
        Err(SdkError::NotPermitted(_))
    ));
}
