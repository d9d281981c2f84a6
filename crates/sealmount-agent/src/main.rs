//! Secure-mount agent serving ad-hoc encrypted volume requests.
//!
//! One request/response operation per connection over a Unix socket:
//! line-delimited JSON in, one JSON answer out. Each request provisions a
//! freshly named mapping with an ephemeral random key; provisioning itself
//! is synchronous and runs on the blocking pool.

use anyhow::{Context, Result};
use log::{error, info, warn};
use sealmount_core::config::{SealmountConfig, DEFAULT_CONFIG_PATH};
use sealmount_core::secure_mount::handle_secure_mount;
use sealmount_core::{logging, MountService, SecureMountRequest, SecureMountResponse};
use sealmount_ext4::SystemExt4Provisioner;
use sealmount_luks::SystemDeviceProvisioner;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::{select, signal, task};

type AgentService = Arc<MountService<SystemDeviceProvisioner, SystemExt4Provisioner>>;

/// Entry point for the Tokio runtime; logs failures before exit.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("agent exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let config_path =
        std::env::var("SEALMOUNT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_path = PathBuf::from(config_path);
    let config = Arc::new(
        SealmountConfig::load_or_bootstrap(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?,
    );

    if config.path != config_path {
        warn!(
            "configuration missing at {}; using bootstrap at {}",
            config_path.display(),
            config.path.display()
        );
    }

    let block = SystemDeviceProvisioner::from_config(&config)
        .context("initialise device provisioner")?;
    let fs_provisioner =
        SystemExt4Provisioner::from_config(&config).context("initialise filesystem provisioner")?;
    let service: AgentService = Arc::new(MountService::new(config.clone(), block, fs_provisioner));

    let socket_path = PathBuf::from(&config.agent.socket_path);
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(&socket_path);
    let listener =
        UnixListener::bind(&socket_path).with_context(|| format!("bind {}", socket_path.display()))?;
    info!(
        "SealMount agent listening on {} (config: {})",
        socket_path.display(),
        config.path.display()
    );

    select! {
        res = serve(listener, service, config.agent.max_request_bytes) => res?,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    let _ = fs::remove_file(&socket_path);
    Ok(())
}

async fn serve(listener: UnixListener, service: AgentService, max_request: usize) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, service, max_request).await {
                warn!("connection failed: {err:?}");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    service: AgentService,
    max_request: usize,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half)
        .take(max_request as u64)
        .read_line(&mut line)
        .await?;

    let response = match serde_json::from_str::<SecureMountRequest>(&line) {
        Ok(request) => {
            info!(
                "secure mount requested for {} ({} option(s))",
                request.mount_point,
                request.options.len()
            );
            let service = service.clone();
            match task::spawn_blocking(move || handle_secure_mount(&service, &request)).await? {
                Ok(mount_path) => {
                    info!("secure mount served at {}", mount_path.display());
                    SecureMountResponse::success(&mount_path)
                }
                Err(err) => {
                    warn!("secure mount failed: {err}");
                    SecureMountResponse::failure(err.to_string())
                }
            }
        }
        Err(err) => SecureMountResponse::failure(format!("invalid request: {err}")),
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.shutdown().await?;
    Ok(())
}
