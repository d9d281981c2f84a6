//! Operator-facing workflows wrapping the mount orchestrator.

use crate::error::{SealmountError, SealmountResult};
use crate::keyfile::read_secret;
use crate::service::{MountRequest, MountService};
use sealmount_provider::{BlockDeviceProvisioner, FilesystemProvisioner};
use std::path::Path;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Provision a persistent workload volume: read the workload secret, ensure
/// the device is formatted, verified, ext4-carrying, and mounted with
/// journaled durability.
pub fn initialize_volume<B, F>(
    service: &MountService<B, F>,
    device_path: &Path,
    mount_point: &Path,
) -> SealmountResult<WorkflowReport>
where
    B: BlockDeviceProvisioner<Error = SealmountError>,
    F: FilesystemProvisioner<Error = SealmountError>,
{
    let mut events = Vec::new();

    let secret_path = service.config().secret_path();
    let key = read_secret(&secret_path)?;
    events.push(event(
        WorkflowLevel::Info,
        format!("Workload secret loaded from {}", secret_path.display()),
    ));

    let request = MountRequest::persistent(service.config(), device_path, mount_point);
    events.push(event(
        WorkflowLevel::Info,
        format!("Mapping name {}", request.mapper_name),
    ));

    let report = service.setup_mount(&request, &key)?;

    if report.formatted {
        events.push(event(
            WorkflowLevel::Security,
            format!(
                "Formatted {} with the hardened LUKS2 profile",
                device_path.display()
            ),
        ));
    } else {
        events.push(event(
            WorkflowLevel::Info,
            format!("{} already LUKS2-formatted", device_path.display()),
        ));
    }

    events.push(event(
        WorkflowLevel::Success,
        format!(
            "Header verified; mapping active at {}",
            report.mapper_path.display()
        ),
    ));

    if report.created_fs {
        events.push(event(
            WorkflowLevel::Info,
            format!("Created ext4 on {}", report.mapper_path.display()),
        ));
    }

    events.push(event(
        WorkflowLevel::Success,
        format!(
            "Volume mounted at {} (sync, data=journal)",
            report.mount_point.display()
        ),
    ));

    Ok(WorkflowReport {
        title: format!("Provisioned encrypted volume at {}", mount_point.display()),
        events,
    })
}

/// Tear a provisioned volume back down: unmount, then close the mapping.
pub fn teardown_volume<B, F>(
    service: &MountService<B, F>,
    mount_point: Option<&Path>,
    mapper_name: &str,
) -> SealmountResult<WorkflowReport>
where
    B: BlockDeviceProvisioner<Error = SealmountError>,
    F: FilesystemProvisioner<Error = SealmountError>,
{
    let mut events = Vec::new();

    service.teardown(mount_point, mapper_name)?;
    if let Some(path) = mount_point {
        events.push(event(
            WorkflowLevel::Info,
            format!("Unmounted {}", path.display()),
        ));
    }
    events.push(event(
        WorkflowLevel::Success,
        format!("Closed mapping {mapper_name}"),
    ));

    Ok(WorkflowReport {
        title: format!("Tore down mapping {mapper_name}"),
        events,
    })
}
