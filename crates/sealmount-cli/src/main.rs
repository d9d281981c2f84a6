//! SealMount command-line interface for provisioning workload volumes inside
//! confidential VMs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sealmount_core::config::{SealmountConfig, DEFAULT_CONFIG_PATH};
use sealmount_core::{logging, workflow, MountService};
use sealmount_core::workflow::{WorkflowLevel, WorkflowReport};
use sealmount_ext4::SystemExt4Provisioner;
use sealmount_luks::SystemDeviceProvisioner;
use sealmount_provider::BlockDeviceProvisioner;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "sealmount",
    version,
    about = "Encrypted block-storage provisioning for confidential workloads."
)]
struct Cli {
    /// Path to the SealMount configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering the persistent-volume lifecycle.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure a device is LUKS2-formatted, verified, ext4-carrying, and
    /// mounted at the target path. Reads the workload secret from the
    /// configured well-known path.
    InitVolume {
        /// Raw block device (e.g. /dev/vdb).
        device: PathBuf,

        /// Target mount point.
        mount_point: PathBuf,
    },

    /// Unmount a volume and close its device-mapper entry.
    Close {
        /// Device-mapper name of the opened volume.
        mapping: String,

        /// Mount point to unmount first, when still mounted.
        #[arg(long)]
        mount: Option<PathBuf>,
    },

    /// Report the state of a device-mapper entry.
    Status {
        /// Device-mapper name to query.
        mapping: String,
    },

    /// Validate the configuration file and report issues.
    CheckConfig,

    /// Print the configuration JSON schema.
    Schema,
}

fn main() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::InitVolume {
            device,
            mount_point,
        } => {
            let service = build_service(&cli.config)?;
            let report = workflow::initialize_volume(&service, &device, &mount_point)
                .with_context(|| {
                    format!(
                        "failed to provision {} at {}",
                        device.display(),
                        mount_point.display()
                    )
                })?;
            print_report(&report);
        }
        Commands::Close { mapping, mount } => {
            let service = build_service(&cli.config)?;
            let report = workflow::teardown_volume(&service, mount.as_deref(), &mapping)
                .with_context(|| format!("failed to tear down mapping {mapping}"))?;
            print_report(&report);
        }
        Commands::Status { mapping } => {
            let config = load_cli_config(&cli.config)?;
            let block = SystemDeviceProvisioner::from_config(&config)
                .context("initialise device provisioner")?;
            let state = block.mapping_state(&mapping)?;
            println!("{mapping}: {state:?}");
        }
        Commands::CheckConfig => {
            let config = load_cli_config(&cli.config)?;
            let issues = config.validate();
            if issues.is_empty() {
                println!("Configuration at {} is valid.", config.path.display());
            } else {
                for issue in &issues {
                    eprintln!("issue: {issue}");
                }
                bail!("{} configuration issue(s) found", issues.len());
            }
        }
        Commands::Schema => {
            let schema = schema_for!(SealmountConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

fn load_cli_config(path: &Path) -> Result<SealmountConfig> {
    let config = SealmountConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (pass --config to replace).",
            config.path.display()
        );
    }

    Ok(config)
}

fn build_service(
    config_path: &Path,
) -> Result<MountService<SystemDeviceProvisioner, SystemExt4Provisioner>> {
    let config = Arc::new(load_cli_config(config_path)?);
    let block =
        SystemDeviceProvisioner::from_config(&config).context("initialise device provisioner")?;
    let fs =
        SystemExt4Provisioner::from_config(&config).context("initialise filesystem provisioner")?;
    Ok(MountService::new(config, block, fs))
}

fn print_report(report: &WorkflowReport) {
    println!("== {} ==", report.title);
    for event in &report.events {
        let prefix = match event.level {
            WorkflowLevel::Info => "[i]",
            WorkflowLevel::Success => "[+]",
            WorkflowLevel::Warn => "[!]",
            WorkflowLevel::Security => "[#]",
        };
        println!("{prefix} {}", event.message);
    }
}
