//! Skylink example controller driver
//!
//! Discovers a device, connects it, then runs the actions requested on the
//! command line: FTP operations, media browsing, log retrieval, firmware
//! update, ephemeris upload or blackbox monitoring.

use anyhow::{bail, Context, Result};
use clap::Parser;
use skylink_protocol::{
    BackendCapabilities, BlackboxItf, CmdItfEvent, CommandLogger, ConnectionRequest, Controller,
    ControllerEvent, CrashmlFilter, CrashmlItf, Device, Discovery, EphemerisItf, FirmwareInfo,
    FlightLogItf, FtpConfig, FtpItf, FtpStatus, MediaItf, MediaResKind, MuxBackend, MuxContext,
    MuxDiscovery, NetBackend, NetDiscovery, PudItf, PutSource, UpdaterItf,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "skylink-cli", about = "Skylink controller example")]
struct Args {
    /// Poll a device for discovery at this address
    #[arg(long, value_name = "IP")]
    discovery_net: Option<String>,

    /// Browse mDNS for the given device-type codes (hex)
    #[arg(long, value_name = "TYPE", value_parser = parse_hex_u16, num_args = 1..)]
    discovery_mdns: Option<Vec<u16>>,

    /// Connect to a mux bridge
    #[arg(long, value_names = ["IP", "PORT"], num_args = 2)]
    mux_bridge: Option<Vec<String>>,

    /// Controller name sent during the handshake
    #[arg(long, default_value = "skylink-cli")]
    controller_name: String,

    /// Controller type sent during the handshake
    #[arg(long, default_value = "desktop")]
    controller_type: String,

    /// Write the command trace to this file
    #[arg(long, value_name = "PATH")]
    cmd_log: Option<PathBuf>,

    /// Download a remote file
    #[arg(long, value_names = ["REMOTE", "LOCAL"], num_args = 2)]
    ftp_get: Option<Vec<String>>,

    /// Upload a local file
    #[arg(long, value_names = ["LOCAL", "REMOTE"], num_args = 2)]
    ftp_put: Option<Vec<String>>,

    /// List a remote directory
    #[arg(long, value_name = "PATH")]
    ftp_list: Option<String>,

    /// Rename a remote file
    #[arg(long, value_names = ["SRC", "DST"], num_args = 2)]
    ftp_rename: Option<Vec<String>>,

    /// Delete a remote file (or directory with a trailing slash)
    #[arg(long, value_name = "PATH")]
    ftp_delete: Option<String>,

    /// List medias on the device
    #[arg(long)]
    media_list: bool,

    /// Download every resource of the named media into a directory
    #[arg(long, value_names = ["NAME", "DIR"], num_args = 2)]
    media_dl: Option<Vec<String>>,

    /// Delete the named media
    #[arg(long, value_name = "NAME")]
    media_delete: Option<String>,

    /// Upload a firmware image
    #[arg(long, value_name = "IMAGE")]
    update: Option<PathBuf>,

    /// Fetch crash reports into a directory
    #[arg(long, value_name = "DIR")]
    crashml_dl: Option<PathBuf>,

    /// Fetch flight logs into a directory
    #[arg(long, value_name = "DIR")]
    flight_log_dl: Option<PathBuf>,

    /// Fetch PUD files into a directory
    #[arg(long, value_name = "DIR")]
    pud_dl: Option<PathBuf>,

    /// Upload an ephemeris file
    #[arg(long, value_name = "FILE")]
    ephemeris: Option<PathBuf>,

    /// Print blackbox telemetry (mux only)
    #[arg(long)]
    enable_blackbox: bool,

    /// Send raw data to a device TCP port through the proxy
    #[arg(long, value_names = ["PORT", "DATA"], num_args = 2)]
    tcp_send: Option<Vec<String>>,
}

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let (ctrl, mut ctrl_events) = Controller::new();

    // Backend + discovery per the selected link.
    let mux_ctx = match &args.mux_bridge {
        Some(bridge) => {
            let port: u16 = bridge[1].parse().context("bad mux bridge port")?;
            Some(MuxContext::connect(&bridge[0], port).await?)
        }
        None => None,
    };

    // Keeps the selected discovery (and its poll tasks) alive until exit.
    #[allow(dead_code)]
    enum RunningDiscovery {
        Net(Arc<NetDiscovery>),
        Mdns(Arc<skylink_protocol::MdnsDiscovery>),
        Mux(Arc<MuxDiscovery>),
    }

    let _discovery = if let Some(ctx) = &mux_ctx {
        let backend = Arc::new(MuxBackend::new(
            "mux",
            BackendCapabilities::default(),
            ctx.clone(),
        ));
        ctrl.register_backend(backend.clone()).await?;
        let core = Discovery::new("mux", backend, ctrl.clone(), Vec::new()).await?;
        let disc = MuxDiscovery::new(core, ctx.clone());
        disc.start().await?;
        RunningDiscovery::Mux(disc)
    } else if let Some(addr) = &args.discovery_net {
        let backend = Arc::new(NetBackend::new("net", BackendCapabilities::default()));
        ctrl.register_backend(backend.clone()).await?;
        let core = Discovery::new("net", backend, ctrl.clone(), Vec::new()).await?;
        let disc = NetDiscovery::new(core, addr.clone(), skylink_protocol::discovery::net::DISCOVERY_PORT);
        disc.start().await?;
        RunningDiscovery::Net(disc)
    } else if let Some(types) = &args.discovery_mdns {
        let backend = Arc::new(NetBackend::new("net", BackendCapabilities::default()));
        ctrl.register_backend(backend.clone()).await?;
        let core = Discovery::new("mdns", backend, ctrl.clone(), types.clone()).await?;
        let disc = skylink_protocol::MdnsDiscovery::new(core, types.clone())?;
        disc.start().await?;
        RunningDiscovery::Mdns(disc)
    } else {
        bail!("no discovery selected; use --discovery-net, --discovery-mdns or --mux-bridge");
    };

    info!("waiting for a device...");
    let device = loop {
        match ctrl_events.recv().await {
            Some(ControllerEvent::DeviceAdded(device)) => break device,
            Some(ControllerEvent::DeviceRemoved(device)) => {
                info!("device {:#06x} removed", device.handle());
            }
            None => bail!("controller event stream closed"),
        }
    };
    let device_info = device.info().await;
    info!(
        "found device '{}' (type {:#06x}) at {}:{}",
        device_info.name, device_info.device_type, device_info.addr, device_info.port
    );

    let request = ConnectionRequest {
        controller_name: args.controller_name.clone(),
        controller_type: args.controller_type.clone(),
        device_id: String::new(),
        json: None,
    };
    device.connect(&request).await.context("connection failed")?;
    info!("connected (proto_v {})", device.proto_v());

    let logger = match &args.cmd_log {
        Some(path) => Some(Arc::new(CommandLogger::create(path, 0)?)),
        None => None,
    };
    let (cmd_itf, mut cmd_events) = device.create_cmd_itf(logger).await?;

    // Prove the command path with an AllSettings exchange.
    let mut status = cmd_itf
        .send(skylink_protocol::command::well_known::enc_all_settings())
        .await?;
    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            info!("AllSettings status: {:?} (done: {})", event.status, event.done);
            if event.done {
                break;
            }
        }
    });

    run_actions(&args, &device, mux_ctx.as_ref()).await?;

    if args.enable_blackbox {
        let ctx = mux_ctx
            .clone()
            .context("blackbox needs a mux bridge")?;
        let blackbox = BlackboxItf::start(ctx).await?;
        let (_id, mut events) = blackbox.register().await;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!("blackbox: {:?}", event);
            }
        });
    }

    info!("running; press ctrl-c to quit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = cmd_events.recv() => match event {
                Some(CmdItfEvent::Received(cmd)) => info!("received command {}", cmd),
                Some(CmdItfEvent::LinkQuality(quality)) => {
                    info!(
                        "link quality: tx {}% rx {}% useful {}%",
                        quality.tx_quality, quality.rx_quality, quality.rx_useful
                    );
                }
                Some(CmdItfEvent::LinkDown) | None => {
                    warn!("link down");
                    break;
                }
            },
            event = ctrl_events.recv() => {
                if let Some(ControllerEvent::DeviceRemoved(removed)) = event {
                    if removed.handle() == device.handle() {
                        warn!("device removed");
                        break;
                    }
                }
            }
        }
    }

    device.disconnect().await.ok();
    Ok(())
}

/// Run the one-shot actions selected on the command line
async fn run_actions(args: &Args, device: &Device, _mux: Option<&Arc<MuxContext>>) -> Result<()> {
    let device_type = device.info().await.device_type;

    if args.ftp_get.is_some()
        || args.ftp_put.is_some()
        || args.ftp_list.is_some()
        || args.ftp_rename.is_some()
        || args.ftp_delete.is_some()
    {
        let proxy = device
            .tcp_proxy(device_type, skylink_protocol::ftp::FTP_PORT_MEDIA)
            .await?;
        let ftp = FtpItf::new(FtpConfig::default());

        if let Some(get) = &args.ftp_get {
            let result = ftp
                .get(&proxy.addr, proxy.port, &get[0], Some(PathBuf::from(&get[1])), false)
                .wait()
                .await;
            check_ftp("get", result.status)?;
        }
        if let Some(put) = &args.ftp_put {
            let result = ftp
                .put(
                    &proxy.addr,
                    proxy.port,
                    &put[1],
                    PutSource::File(PathBuf::from(&put[0])),
                    false,
                )
                .wait()
                .await;
            check_ftp("put", result.status)?;
        }
        if let Some(path) = &args.ftp_list {
            let result = ftp.list(&proxy.addr, proxy.port, path).wait().await;
            check_ftp("list", result.status)?;
            for entry in result.entries.unwrap_or_default() {
                println!("{:?}\t{}\t{}", entry.kind, entry.size, entry.name);
            }
        }
        if let Some(rename) = &args.ftp_rename {
            let result = ftp
                .rename(&proxy.addr, proxy.port, &rename[0], &rename[1])
                .wait()
                .await;
            check_ftp("rename", result.status)?;
        }
        if let Some(path) = &args.ftp_delete {
            let result = ftp.delete(&proxy.addr, proxy.port, path).wait().await;
            check_ftp("delete", result.status)?;
        }
    }

    if args.media_list || args.media_dl.is_some() || args.media_delete.is_some() {
        let media_itf = MediaItf::new(device.clone());
        let medias = media_itf.list().await?;
        if args.media_list {
            for media in &medias {
                println!(
                    "{}\trun {}\t{:?}\t{} resources",
                    media.name,
                    media.runid,
                    media.media_type,
                    media.resources.len()
                );
            }
        }
        if let Some(dl) = &args.media_dl {
            let media = medias
                .iter()
                .find(|m| m.name == dl[0])
                .context("media not found")?;
            let dir = PathBuf::from(&dl[1]);
            tokio::fs::create_dir_all(&dir).await?;
            for resource in &media.resources {
                if resource.kind != MediaResKind::Media {
                    continue;
                }
                let name = resource.path.rsplit('/').next().unwrap_or("media.bin");
                media_itf
                    .download(resource, Some(dir.join(name)))
                    .await?;
                info!("downloaded {}", name);
            }
        }
        if let Some(name) = &args.media_delete {
            let media = medias
                .iter()
                .find(|m| &m.name == name)
                .context("media not found")?;
            media_itf.delete(media).await?;
            info!("deleted {}", name);
        }
    }

    if let Some(image) = &args.update {
        let info = firmware_info_from_path(image, device_type).await?;
        let updater = UpdaterItf::new(device.clone());
        match device.backend_type() {
            skylink_protocol::BackendType::Mux => updater.upload_mux(image, &info).await?,
            skylink_protocol::BackendType::Net => updater.upload_ftp(image, &info).await?,
        }
        info!("firmware uploaded");
    }

    if let Some(dir) = &args.crashml_dl {
        let count = CrashmlItf::new(device.clone())
            .download(dir, CrashmlFilter::default())
            .await?;
        info!("fetched {} crash reports", count);
    }
    if let Some(dir) = &args.flight_log_dl {
        let count = FlightLogItf::new(device.clone()).download(dir).await?;
        info!("fetched {} flight logs", count);
    }
    if let Some(dir) = &args.pud_dl {
        let count = PudItf::new(device.clone()).download(dir).await?;
        info!("fetched {} pud files", count);
    }
    if let Some(file) = &args.ephemeris {
        let outcome = EphemerisItf::new(device.clone()).upload(file).await?;
        info!("ephemeris: {:?}", outcome);
    }

    if let Some(send) = &args.tcp_send {
        let port: u16 = send[0].parse().context("bad tcp-send port")?;
        let proxy = device.tcp_proxy(device_type, port).await?;
        let mut stream = tokio::net::TcpStream::connect((proxy.addr.as_str(), proxy.port))
            .await
            .context("tcp-send connect failed")?;
        stream.write_all(send[1].as_bytes()).await?;
        let mut reply = vec![0u8; 4096];
        if let Ok(n) = stream.read(&mut reply).await {
            if n > 0 {
                println!("{}", String::from_utf8_lossy(&reply[..n]));
            }
        }
    }

    Ok(())
}

fn check_ftp(what: &str, status: FtpStatus) -> Result<()> {
    match status {
        FtpStatus::Ok => Ok(()),
        other => bail!("ftp {what} failed: {other:?}"),
    }
}

/// Build firmware info from the image file
///
/// Image parsing proper is out of scope; the version is taken from the
/// file name (`<product>_<version>.<ext>`) and the digest computed here.
async fn firmware_info_from_path(image: &PathBuf, device_type: u16) -> Result<FirmwareInfo> {
    let meta = tokio::fs::metadata(image).await.context("firmware image")?;
    let stem = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let version = stem.rsplit('_').next().unwrap_or("0.0.0").to_string();
    Ok(FirmwareInfo {
        version,
        device_type,
        md5_hex: skylink_protocol::interfaces::ephemeris::md5_of_file(image).await?,
        size: meta.len(),
    })
}
