//! Execution wrapper for the ext4 formatter and the mount tools.

use sealmount_core::error::{SealmountError, SealmountResult};
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    name: &'static str,
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl ToolOutput {
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let diagnostic = if !stderr.is_empty() { stderr } else { stdout };
        if diagnostic.is_empty() {
            "no additional output".to_string()
        } else {
            diagnostic.to_string()
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(name: &'static str, binary: PathBuf, timeout: Duration) -> Self {
        Self {
            name,
            binary,
            timeout,
        }
    }

    /// Run and require exit status 0.
    pub(crate) fn run_checked(&self, args: &[OsString]) -> SealmountResult<ToolOutput> {
        let out = self.run(args)?;
        if out.status != 0 {
            return Err(SealmountError::tool(
                self.name,
                format!("exit code {}: {}", out.status, out.diagnostic()),
            ));
        }
        Ok(out)
    }

    pub(crate) fn run(&self, args: &[OsString]) -> SealmountResult<ToolOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            SealmountError::tool(
                self.name,
                format!("failed to spawn {}: {err}", self.binary.display()),
            )
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> SealmountResult<ToolOutput> {
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
                self.name,
                format!(
                    "{} timed out after {:?}; on-disk state is undefined",
                    self.binary.display(),
                    self.timeout
                ),
            ));
        }

        let stdout = stdout_handle
            .join()
            .map_err(|_| SealmountError::tool(self.name, "stdout reader thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SealmountError::tool(self.name, "stderr reader thread panicked"))??;

        let status = exit_status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);

        Ok(ToolOutput {
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
