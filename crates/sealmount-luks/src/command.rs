//! Execution wrapper for invoking `cryptsetup`.
//!
//! Shell integration stays isolated here so provisioner logic remains
//! testable against fake binaries with deterministic output.

use sealmount_core::error::{SealmountError, SealmountResult};
use sealmount_provider::Device;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// `cryptsetup isLuks` answers "not a LUKS device" with this status.
const NOT_LUKS_EXIT: i32 = 1;

/// Argon2id memory cost in KiB. Kept low so key derivation cannot be OOM
/// killed inside memory-constrained guest pods.
const ARGON2_MEMORY_KIB: &str = "32768";

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// LUKS detection. Status 0 means LUKS, the recognised "not a LUKS
    /// device" status maps to `false`, anything else is fatal.
    pub(crate) fn is_luks(&self, device: &Path) -> SealmountResult<bool> {
        let out = self.run(&[OsString::from("isLuks"), OsString::from(device)])?;
        match out.status {
            0 => Ok(true),
            NOT_LUKS_EXIT => Ok(false),
            _ => Err(SealmountError::tool(
                "cryptsetup isLuks",
                format!(
                    "exit code {} probing {}: {}",
                    out.status,
                    device.display(),
                    output_diagnostic(&out)
                ),
            )),
        }
    }

    /// Create a LUKS2 header with the hardened profile, keyed by the
    /// device's key file.
    pub(crate) fn luks_format(&self, device: &Device) -> SealmountResult<()> {
        let out = self.run(&[
            OsString::from("luksFormat"),
            OsString::from("--type"),
            OsString::from("luks2"),
            OsString::from("--cipher"),
            OsString::from("aes-xts-plain64"),
            OsString::from("--key-size"),
            OsString::from("512"),
            OsString::from("--pbkdf"),
            OsString::from("argon2id"),
            OsString::from("--pbkdf-memory"),
            OsString::from(ARGON2_MEMORY_KIB),
            OsString::from("--batch-mode"),
            OsString::from("--key-file"),
            OsString::from(&device.key_path),
            OsString::from(&device.device_path),
        ])?;

        if out.status == 0 {
            return Ok(());
        }
        Err(SealmountError::tool(
            "cryptsetup luksFormat",
            classify_format_failure(device, &output_diagnostic(&out), out.status),
        ))
    }

    /// Back up the embedded header into the detached header file,
    /// replacing any prior backup (cryptsetup refuses to overwrite).
    pub(crate) fn header_backup(&self, device: &Device) -> SealmountResult<()> {
        if device.header_path.exists() {
            std::fs::remove_file(&device.header_path)?;
        }

        let out = self.run(&[
            OsString::from("luksHeaderBackup"),
            OsString::from(&device.device_path),
            OsString::from("--header-backup-file"),
            OsString::from(&device.header_path),
        ])?;

        if out.status == 0 {
            return Ok(());
        }
        Err(SealmountError::tool(
            "cryptsetup luksHeaderBackup",
            format!(
                "exit code {} backing up header of {}: {}",
                out.status,
                device.device_path.display(),
                output_diagnostic(&out)
            ),
        ))
    }

    /// Dump the JSON metadata of a detached header file. The raw device is
    /// never consulted here.
    pub(crate) fn dump_header_json(&self, header_path: &Path) -> SealmountResult<String> {
        let out = self.run(&[
            OsString::from("luksDump"),
            OsString::from("--dump-json-metadata"),
            OsString::from(header_path),
        ])?;

        if out.status == 0 {
            return Ok(out.stdout);
        }
        Err(SealmountError::tool(
            "cryptsetup luksDump",
            format!(
                "exit code {} dumping {}: {}",
                out.status,
                header_path.display(),
                output_diagnostic(&out)
            ),
        ))
    }

    /// Activate the mapping using the detached header and key file.
    pub(crate) fn open(&self, device: &Device) -> SealmountResult<()> {
        let out = self.run(&[
            OsString::from("open"),
            OsString::from("--type"),
            OsString::from("luks2"),
            OsString::from("--header"),
            OsString::from(&device.header_path),
            OsString::from("--key-file"),
            OsString::from(&device.key_path),
            OsString::from("--batch-mode"),
            OsString::from(&device.device_path),
            OsString::from(&device.mapper_name),
        ])?;

        if out.status == 0 {
            return Ok(());
        }
        Err(SealmountError::tool(
            "cryptsetup open",
            classify_open_failure(device, &output_diagnostic(&out), out.status),
        ))
    }

    /// Tear down the mapping. A mapping that is already gone is success.
    pub(crate) fn close(&self, mapper_name: &str) -> SealmountResult<()> {
        let out = self.run(&[OsString::from("close"), OsString::from(mapper_name)])?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            return Ok(());
        }

        Err(SealmountError::tool(
            "cryptsetup close",
            format!(
                "exit code {} closing mapping `{mapper_name}`: {diagnostic}",
                out.status
            ),
        ))
    }

    /// Status probe used for mapping-state queries; exposes the raw exit
    /// code and diagnostic to the caller.
    pub(crate) fn status(&self, mapper_name: &str) -> SealmountResult<(i32, String)> {
        let out = self.run(&[OsString::from("status"), OsString::from(mapper_name)])?;
        Ok((out.status, output_diagnostic(&out)))
    }

    fn run(&self, args: &[OsString]) -> SealmountResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            SealmountError::tool(
                "cryptsetup",
                format!("failed to spawn {}: {err}", self.binary.display()),
            )
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    /// Poll the child until it exits or the timeout expires. Expiry kills
    /// the child; a killed format/open leaves undefined on-disk state, so
    /// the caller must treat the error as terminal.
    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> SealmountResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        if exit_status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SealmountError::tool(
                "cryptsetup",
                format!(
                    "{} timed out after {:?}; on-disk state is undefined",
                    self.binary.display(),
                    self.timeout
                ),
            ));
        }

        let stdout = stdout_handle
            .join()
            .map_err(|_| SealmountError::tool("cryptsetup", "stdout reader thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SealmountError::tool("cryptsetup", "stderr reader thread panicked"))??;

        let status = exit_status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);

        Ok(Output {
            stdout,
            stderr,
            status,
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<SealmountResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> SealmountResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

fn output_diagnostic(output: &Output) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    let diagnostic = if !stderr.is_empty() { stderr } else { stdout };
    if diagnostic.is_empty() {
        "no additional output".to_string()
    } else {
        diagnostic.to_string()
    }
}

fn classify_open_failure(device: &Device, diagnostic: &str, status: i32) -> String {
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("passphrase")
    {
        return format!(
            "key material rejected opening mapping `{}` from `{}`: {diagnostic} (exit code {status}). \
             The workload key does not match the device's keyslot",
            device.mapper_name,
            device.device_path.display()
        );
    }

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return format!(
            "could not activate mapping `{}`: {diagnostic} (exit code {status}). \
             Device-mapper access requires root inside the guest",
            device.mapper_name
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return format!(
            "could not access `{}` while opening mapping `{}`: {diagnostic} (exit code {status})",
            device.device_path.display(),
            device.mapper_name
        );
    }

    format!(
        "failed to open mapping `{}` from `{}` with detached header {}: {diagnostic} (exit code {status})",
        device.mapper_name,
        device.device_path.display(),
        device.header_path.display()
    )
}

fn classify_format_failure(device: &Device, diagnostic: &str, status: i32) -> String {
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return format!(
            "could not format `{}`: {diagnostic} (exit code {status}). \
             Formatting requires root inside the guest",
            device.device_path.display()
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return format!(
            "could not access `{}` for formatting: {diagnostic} (exit code {status})",
            device.device_path.display()
        );
    }

    format!(
        "failed to format `{}` as LUKS2: {diagnostic} (exit code {status})",
        device.device_path.display()
    )
}
