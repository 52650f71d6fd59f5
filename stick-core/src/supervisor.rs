//! Supervision of the elevated `dd` process.
//!
//! [`FlashSupervisor::start`] spawns `<elevation...> dd if=.. of=.. bs=..
//! status=progress conv=fsync` with stderr piped. The returned [`FlashHandle`]
//! owns the child and its stderr for the whole attempt and turns them into an
//! ordered stream of [`FlashEvent`]s:
//!
//! - zero or more [`FlashEvent::Output`] status records, in stream order;
//! - exactly one [`FlashEvent::Exited`], always last, after stderr hung up and
//!   the child was reaped.
//!
//! Reads are readiness-driven, so awaiting the next event never blocks the
//! control thread. Cancellation is two steps: [`FlashHandle::terminate`]
//! requests termination without waiting, [`FlashHandle::release`] closes the
//! stream and hands the child to tokio's background reaper. Both are
//! idempotent and both run on drop.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, info, trace, warn};

use crate::config::FlashConfig;
use crate::error::{FlashError, FlashResult};
use crate::progress::StatusLines;

/// Bytes read from stderr per readiness notification.
const READ_CHUNK: usize = 1024;

/// One step of a running flash attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// A complete status record from the copy tool's stderr.
    Output(String),
    /// The child was reaped. Signal deaths are reported as 128 + signal.
    Exited(i32),
}

/// A fully built, validated copy command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CopyCommand {
    /// Shell-like rendering for logs.
    pub fn describe(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds and launches copy processes.
#[derive(Debug, Clone)]
pub struct FlashSupervisor {
    elevation: Vec<String>,
    copy_tool: String,
    block_size: String,
}

impl FlashSupervisor {
    pub fn new(config: &FlashConfig) -> Self {
        Self {
            elevation: config.elevation.clone(),
            copy_tool: config.copy_tool.clone(),
            block_size: config.block_size.clone(),
        }
    }

    /// Builds the argv for copying `image` onto `device`.
    ///
    /// Arguments are passed to the child as separate argv entries, never
    /// through a shell, so paths need no quoting. The device must be a path
    /// under `/dev/`.
    pub fn command(&self, image: &Path, device: &Path) -> FlashResult<CopyCommand> {
        if image.as_os_str().is_empty() {
            return Err(FlashError::InvalidArgument("image path is empty".into()));
        }
        if !device.starts_with("/dev/") || device == Path::new("/dev/") {
            return Err(FlashError::InvalidArgument(format!(
                "{} is not a device path",
                device.display()
            )));
        }
        let block_size_ok = !self.block_size.is_empty()
            && self.block_size.starts_with(|c: char| c.is_ascii_digit())
            && self.block_size.chars().all(|c| c.is_ascii_alphanumeric());
        if !block_size_ok {
            return Err(FlashError::InvalidArgument(format!(
                "invalid block size {:?}",
                self.block_size
            )));
        }

        let mut argv: Vec<OsString> = self.elevation.iter().map(OsString::from).collect();
        argv.push(OsString::from(&self.copy_tool));
        argv.push(key_value("if=", image));
        argv.push(key_value("of=", device));
        argv.push(OsString::from(format!("bs={}", self.block_size)));
        argv.push(OsString::from("status=progress"));
        argv.push(OsString::from("conv=fsync"));

        let program = argv.remove(0);
        Ok(CopyCommand {
            program,
            args: argv,
        })
    }

    /// Spawns the copy. Must be called from within a tokio runtime.
    ///
    /// A spawn failure means nothing was started; there is nothing to clean
    /// up.
    pub fn start(&self, image: &Path, device: &Path) -> FlashResult<FlashHandle> {
        let command = self.command(image, device)?;
        info!("Starting copy: {}", command.describe());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env("LC_ALL", "C")
            .spawn()
            .map_err(|source| {
                error!("Failed to spawn {}: {}", command.program.to_string_lossy(), source);
                FlashError::Spawn {
                    program: command.program.to_string_lossy().into_owned(),
                    source,
                }
            })?;

        let stderr = child.stderr.take();
        debug!("Copy process running with pid {:?}", child.id());
        Ok(FlashHandle {
            child: Some(child),
            stderr,
            lines: StatusLines::new(),
            queued: VecDeque::new(),
            exited: false,
        })
    }
}

fn key_value(key: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(key);
    arg.push(path.as_os_str());
    arg
}

/// The running copy process and its status stream.
#[derive(Debug)]
pub struct FlashHandle {
    child: Option<Child>,
    stderr: Option<ChildStderr>,
    lines: StatusLines,
    queued: VecDeque<String>,
    exited: bool,
}

impl FlashHandle {
    /// The child's pid, while it has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Whether the terminal event has been delivered (or the handle released).
    pub fn is_finished(&self) -> bool {
        self.exited
    }

    /// Waits for the next event. Returns `None` once [`FlashEvent::Exited`]
    /// has been delivered or the handle has been released.
    ///
    /// Cancel safe: if the future is dropped before it resolves, no record
    /// and no exit is lost.
    pub async fn next_event(&mut self) -> Option<FlashEvent> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(record) = self.queued.pop_front() {
                return Some(FlashEvent::Output(record));
            }
            if self.exited {
                return None;
            }

            if self.stderr.is_none() {
                return Some(self.reap().await);
            }
            let read = match self.stderr.as_mut() {
                Some(stderr) => stderr.read(&mut buf).await,
                None => continue,
            };

            match read {
                Ok(0) => {
                    trace!("Copy stderr hung up");
                    self.hang_up();
                }
                Ok(n) => {
                    trace!("Read {} bytes of copy status", n);
                    let records = self.lines.push(&buf[..n]);
                    self.queued.extend(records);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Reading copy status failed: {}", e);
                    self.hang_up();
                }
            }
        }
    }

    fn hang_up(&mut self) {
        self.stderr = None;
        if let Some(tail) = self.lines.finish() {
            self.queued.push_back(tail);
        }
    }

    /// The child is only given up once `wait` has returned, so dropping this
    /// future part way leaves the exit to be reported by the next call.
    async fn reap(&mut self) -> FlashEvent {
        let code = match self.child.as_mut() {
            Some(child) => match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    error!("Failed to reap copy process: {}", e);
                    -1
                }
            },
            None => -1,
        };
        self.child = None;
        self.exited = true;
        info!("Copy process exited with code {}", code);
        FlashEvent::Exited(code)
    }

    /// Asks the child to stop. Does not wait.
    pub fn terminate(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        send_terminate(child);
    }

    /// Closes the status stream and gives up ownership of the child. A child
    /// that has not exited yet is reaped in the background by tokio.
    pub fn release(&mut self) {
        self.stderr = None;
        self.queued.clear();
        self.exited = true;
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("Copy process reaped at release: {}", status),
                Ok(None) => debug!("Copy process still running at release; reaping in background"),
                Err(e) => warn!("Copy process state unknown at release: {}", e),
            }
        }
    }
}

impl Drop for FlashHandle {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.terminate();
        }
        self.release();
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => info!("Sent SIGTERM to copy process {}", pid),
        Err(e) => warn!("Failed to signal copy process {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill copy process: {}", e);
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
