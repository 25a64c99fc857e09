//! Skylink Protocol Implementation
//!
//! This library is the controller-side runtime of a drone remote-control
//! SDK: it discovers drone-class devices on the local network or behind a
//! tethered multiplexed link, negotiates a connection, and exchanges typed
//! commands with well-defined ordering, retransmission and acknowledgement
//! guarantees. Auxiliary request services (file transfer, firmware upload,
//! log retrieval, ephemeris upload, blackbox telemetry) ride on the same
//! transports.
//!
//! ## Object model
//!
//! A [`Controller`] owns backends, discoveries and devices. Discoveries
//! emit device add/remove events; [`Device::connect`] drives the backend's
//! handshake; the [`CommandInterface`] is created on demand once the device
//! is connected. Everything runs on the shared tokio runtime and reports
//! through event channels.

pub mod backend;
pub mod cmd_itf;
pub mod command;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod frame;
pub mod ftp;
pub mod interfaces;
pub mod logger;
pub mod mux;
pub mod transport;

mod error;

pub use backend::{
    Backend, BackendCapabilities, BackendType, ConnectionRequest, DeviceConnection, MuxBackend,
    NetBackend, PROTO_V_MAX, PROTO_V_MIN,
};
pub use cmd_itf::{
    CmdItfConfig, CmdItfEvent, CmdStatusEvent, CommandInterface, LinkQuality, QueueConfig,
};
pub use command::{BufferType, CmdSendStatus, Command, PackRecvStatus, PackSendStatus};
pub use controller::{Controller, ControllerEvent};
pub use device::{ApiCapability, Device, DeviceInfo, DeviceState, TcpProxy};
pub use discovery::{
    DiscoveredDevice, Discovery, MdnsDiscovery, MuxDiscovery, NetDiscovery, DISCOVERY_TIMEOUT,
};
pub use error::{Result, SdkError};
pub use frame::{DataType, Frame};
pub use ftp::{
    FtpConfig, FtpEntry, FtpEntryKind, FtpItf, FtpRequest, FtpResult, FtpStatus, PutSource,
};
pub use interfaces::{
    BlackboxEvent, BlackboxItf, CrashmlFilter, CrashmlItf, EphemerisItf, EphemerisOutcome,
    FirmwareInfo, FlightLogItf, Media, MediaItf, MediaResKind, MediaResource, MediaType, PudItf,
    RcPilotingInfo, UpdaterItf,
};
pub use logger::{CmdDir, CommandLogger, LogEvent, LogEventInfo};
pub use mux::{MuxContext, MuxTcpProxy};
pub use transport::{Transport, TransportEvent, TransportType};
